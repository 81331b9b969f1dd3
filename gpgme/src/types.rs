//! Enumerations and flag sets shared by sessions and results.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Engine protocols.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// OpenPGP, implemented by `gpg`.
    OpenPgp,
    /// CMS (S/MIME), implemented by `gpgsm`.
    Cms,
    /// The `gpgconf` configuration tool.
    GpgConf,
    /// Raw Assuan connections.
    Assuan,
    /// The `g13` container manager.
    G13,
    /// A UI server.
    UiServer,
    /// Spawning arbitrary helpers.
    Spawn,
    /// Whatever the engine considers the default.
    Default,
    /// Unknown protocol.
    Unknown,
}

impl Protocol {
    /// Returns the protocol's name.
    pub fn name(self) -> &'static str {
        match self {
            Protocol::OpenPgp => "OpenPGP",
            Protocol::Cms => "CMS",
            Protocol::GpgConf => "GPGCONF",
            Protocol::Assuan => "Assuan",
            Protocol::G13 => "G13",
            Protocol::UiServer => "UIServer",
            Protocol::Spawn => "Spawn",
            Protocol::Default => "default",
            Protocol::Unknown => "unknown",
        }
    }

    /// Returns whether sessions can run operations with this
    /// protocol.
    pub(crate) fn is_operational(self) -> bool {
        matches!(self, Protocol::OpenPgp | Protocol::Cms)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<u32> for Protocol {
    fn from(p: u32) -> Self {
        match p {
            0 => Protocol::OpenPgp,
            1 => Protocol::Cms,
            2 => Protocol::GpgConf,
            3 => Protocol::Assuan,
            4 => Protocol::G13,
            5 => Protocol::UiServer,
            6 => Protocol::Spawn,
            254 => Protocol::Default,
            _ => Protocol::Unknown,
        }
    }
}

impl From<Protocol> for u32 {
    fn from(p: Protocol) -> u32 {
        match p {
            Protocol::OpenPgp => 0,
            Protocol::Cms => 1,
            Protocol::GpgConf => 2,
            Protocol::Assuan => 3,
            Protocol::G13 => 4,
            Protocol::UiServer => 5,
            Protocol::Spawn => 6,
            Protocol::Default => 254,
            Protocol::Unknown => 255,
        }
    }
}

/// How the engine asks for secrets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PinentryMode {
    /// Use the engine's configuration.
    Default,
    /// Ask using a pinentry.
    Ask,
    /// Cancel every request.
    Cancel,
    /// Fail every request.
    Error,
    /// Route requests back to the session's passphrase relay.
    Loopback,
}

impl Default for PinentryMode {
    fn default() -> Self {
        PinentryMode::Default
    }
}

impl PinentryMode {
    /// Returns the value for `--pinentry-mode`, if any.
    pub(crate) fn argument(self) -> Option<&'static str> {
        match self {
            PinentryMode::Default => None,
            PinentryMode::Ask => Some("ask"),
            PinentryMode::Cancel => Some("cancel"),
            PinentryMode::Error => Some("error"),
            PinentryMode::Loopback => Some("loopback"),
        }
    }
}

/// Trust level of a key or user id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Validity {
    /// Unknown.
    Unknown,
    /// Not defined.
    Undefined,
    /// Never valid.
    Never,
    /// Marginally valid.
    Marginal,
    /// Fully valid.
    Full,
    /// Ultimately valid.
    Ultimate,
}

impl Default for Validity {
    fn default() -> Self {
        Validity::Unknown
    }
}

impl Validity {
    /// Parses the validity letter of a colon listing.
    pub(crate) fn from_letter(c: Option<char>) -> Self {
        match c {
            Some('q') => Validity::Undefined,
            Some('n') => Validity::Never,
            Some('m') => Validity::Marginal,
            Some('f') => Validity::Full,
            Some('u') => Validity::Ultimate,
            _ => Validity::Unknown,
        }
    }
}

macro_rules! flag_set {
    ( $(#[$attr:meta])* $name:ident { $( $(#[$fattr:meta])* $flag:ident = $value:expr, )* } ) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $( $(#[$fattr])* pub const $flag: $name = $name($value); )*

            /// Returns the empty set.
            pub fn empty() -> Self {
                $name(0)
            }

            /// Returns the raw bits.
            pub fn bits(self) -> u32 {
                self.0
            }

            /// Creates a set from raw bits.
            pub fn from_bits(bits: u32) -> Self {
                $name(bits)
            }

            /// Returns whether all flags in `other` are set.
            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Returns whether no flag is set.
            pub fn is_empty(self) -> bool {
                self.0 == 0
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, other: Self) -> Self {
                $name(self.0 | other.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, other: Self) {
                self.0 |= other.0;
            }
        }

        impl BitAnd for $name {
            type Output = Self;
            fn bitand(self, other: Self) -> Self {
                $name(self.0 & other.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let mut names = Vec::new();
                $( if $value != 0 && self.contains($name::$flag) {
                    names.push(stringify!($flag));
                } )*
                write!(f, "{}({:#x} {})", stringify!($name), self.0,
                       names.join(" | "))
            }
        }
    };
}

flag_set! {
    /// Controls the scope of key listings.
    KeyListMode {
        /// List keys from the local keyring.
        LOCAL = 1,
        /// Search external sources.
        EXTERN = 2,
        /// Include key signatures.
        SIGS = 4,
        /// Include signature notations.
        SIG_NOTATIONS = 8,
        /// Include information about secret keys.
        WITH_SECRET = 16,
        /// Include keys flagged as ephemeral.
        EPHEMERAL = 128,
        /// Ask the engine to validate keys.
        VALIDATE = 256,
    }
}

flag_set! {
    /// Modifies encryption.
    EncryptFlags {
        /// Trust all recipients.
        ALWAYS_TRUST = 1,
        /// Do not add the configured default recipients.
        NO_ENCRYPT_TO = 2,
        /// Prepare encryption (UI servers only).
        PREPARE = 4,
        /// Expect a signing request (UI servers only).
        EXPECT_SIGN = 8,
        /// Do not compress the plaintext.
        NO_COMPRESS = 16,
    }
}
