//! Error codes.
//!
//! The engine reports failures as 32-bit values in the layout used by
//! libgpg-error: the upper byte names the component that raised the
//! error (the *source*), the lower 16 bits carry the error code.  The
//! code is what callers should match on, it is stable across engines
//! and versions.
//!
//! A raw value whose code is [`ErrorCode::NO_ERROR`] is success and
//! never becomes an [`Error`]; use [`result`] to convert raw values.

use std::fmt;
use std::io;

/// Result type for this crate.
pub type Result<T> = ::std::result::Result<T, Error>;

/// Component that raised an error.
const SOURCE_GPGME: u32 = 7;

/// Marks codes that were derived from a system `errno`.
const SYSTEM_ERROR: u32 = 1 << 15;

/// A stable error code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorCode(u32);

impl ErrorCode {
    /// Success.
    pub const NO_ERROR: ErrorCode = ErrorCode(0);
    /// General error.
    pub const GENERAL: ErrorCode = ErrorCode(1);
    /// Bad signature.
    pub const BAD_SIGNATURE: ErrorCode = ErrorCode(8);
    /// No public key.
    pub const NO_PUBKEY: ErrorCode = ErrorCode(9);
    /// Bad passphrase.
    pub const BAD_PASSPHRASE: ErrorCode = ErrorCode(11);
    /// No secret key.
    pub const NO_SECKEY: ErrorCode = ErrorCode(17);
    /// Not found.
    pub const NOT_FOUND: ErrorCode = ErrorCode(27);
    /// Invalid argument.
    pub const INV_ARG: ErrorCode = ErrorCode(45);
    /// Unusable public key.
    pub const UNUSABLE_PUBKEY: ErrorCode = ErrorCode(53);
    /// Unusable secret key.
    pub const UNUSABLE_SECKEY: ErrorCode = ErrorCode(54);
    /// Invalid value.
    pub const INV_VALUE: ErrorCode = ErrorCode(55);
    /// No data.
    pub const NO_DATA: ErrorCode = ErrorCode(58);
    /// Not implemented.
    pub const NOT_IMPLEMENTED: ErrorCode = ErrorCode(69);
    /// Conflicting use.
    pub const CONFLICT: ErrorCode = ErrorCode(70);
    /// Operation cancelled.
    pub const CANCELED: ErrorCode = ErrorCode(99);
    /// Unsupported protocol.
    pub const UNSUPPORTED_PROTOCOL: ErrorCode = ErrorCode(121);
    /// Invalid crypto engine.
    pub const INV_ENGINE: ErrorCode = ErrorCode(150);
    /// Decryption failed.
    pub const DECRYPT_FAILED: ErrorCode = ErrorCode(152);
    /// Key expired.
    pub const KEY_EXPIRED: ErrorCode = ErrorCode(153);
    /// Unknown system error.
    pub const UNKNOWN_ERRNO: ErrorCode = ErrorCode(16382);
    /// End of file.
    ///
    /// Only used to terminate key listings.
    pub const EOF: ErrorCode = ErrorCode(16383);
    /// Bad file descriptor.
    pub const EBADF: ErrorCode = ErrorCode(SYSTEM_ERROR | 11);
    /// Interrupted system call.
    pub const EINTR: ErrorCode = ErrorCode(SYSTEM_ERROR | 47);
    /// Invalid argument (system).
    pub const EINVAL: ErrorCode = ErrorCode(SYSTEM_ERROR | 48);
    /// Input/output error.
    pub const EIO: ErrorCode = ErrorCode(SYSTEM_ERROR | 49);
    /// Cannot allocate memory.
    pub const ENOMEM: ErrorCode = ErrorCode(SYSTEM_ERROR | 86);
    /// No such file or directory.
    pub const ENOENT: ErrorCode = ErrorCode(SYSTEM_ERROR | 81);
    /// Broken pipe.
    pub const EPIPE: ErrorCode = ErrorCode(SYSTEM_ERROR | 111);

    /// Returns the numeric value.
    pub fn value(self) -> u32 {
        self.0
    }

    /// Returns whether this code was derived from a system `errno`.
    pub fn is_system_error(self) -> bool {
        self.0 & SYSTEM_ERROR != 0
    }

    /// Maps a system `errno` to a code.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EBADF => ErrorCode::EBADF,
            libc::EINTR => ErrorCode::EINTR,
            libc::EINVAL => ErrorCode::EINVAL,
            libc::EIO => ErrorCode::EIO,
            libc::ENOMEM => ErrorCode::ENOMEM,
            libc::ENOENT => ErrorCode::ENOENT,
            libc::EPIPE => ErrorCode::EPIPE,
            _ => ErrorCode::UNKNOWN_ERRNO,
        }
    }

    /// Returns a human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::NO_ERROR => "Success",
            ErrorCode::GENERAL => "General error",
            ErrorCode::BAD_SIGNATURE => "Bad signature",
            ErrorCode::NO_PUBKEY => "No public key",
            ErrorCode::BAD_PASSPHRASE => "Bad passphrase",
            ErrorCode::NO_SECKEY => "No secret key",
            ErrorCode::NOT_FOUND => "Not found",
            ErrorCode::INV_ARG => "Invalid argument",
            ErrorCode::UNUSABLE_PUBKEY => "Unusable public key",
            ErrorCode::UNUSABLE_SECKEY => "Unusable secret key",
            ErrorCode::INV_VALUE => "Invalid value",
            ErrorCode::NO_DATA => "No data",
            ErrorCode::NOT_IMPLEMENTED => "Not implemented",
            ErrorCode::CONFLICT => "Conflicting use",
            ErrorCode::CANCELED => "Operation cancelled",
            ErrorCode::UNSUPPORTED_PROTOCOL => "Unsupported protocol",
            ErrorCode::INV_ENGINE => "Invalid crypto engine",
            ErrorCode::DECRYPT_FAILED => "Decryption failed",
            ErrorCode::KEY_EXPIRED => "Key expired",
            ErrorCode::UNKNOWN_ERRNO => "Unknown system error",
            ErrorCode::EOF => "End of file",
            ErrorCode::EBADF => "Bad file descriptor",
            ErrorCode::EINTR => "Interrupted system call",
            ErrorCode::EINVAL => "Invalid argument",
            ErrorCode::EIO => "Input/output error",
            ErrorCode::ENOMEM => "Cannot allocate memory",
            ErrorCode::ENOENT => "No such file or directory",
            ErrorCode::EPIPE => "Broken pipe",
            _ => "Unknown error code",
        }
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ErrorCode({} {:?})", self.0, self.description())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// An error reported by the engine or by this binding.
///
/// Errors are plain values.  Two errors are equal if they carry the
/// same raw value.
#[derive(thiserror::Error, Clone, Copy, PartialEq, Eq, Hash)]
#[error("{message}")]
pub struct Error {
    raw: u32,
    message: &'static str,
}

impl Error {
    /// Creates an error with the given code, raised by this binding.
    pub fn new(code: ErrorCode) -> Self {
        Self::from_raw((SOURCE_GPGME << 24) | code.value())
    }

    /// Wraps a raw value as reported by the engine.
    ///
    /// Note: this does not check for [`ErrorCode::NO_ERROR`], use
    /// [`result`] for that.
    pub fn from_raw(raw: u32) -> Self {
        Error {
            raw,
            message: ErrorCode(raw & 0xffff).description(),
        }
    }

    /// Creates an error from a system `errno`.
    pub fn from_errno(errno: i32) -> Self {
        Self::new(ErrorCode::from_errno(errno))
    }

    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        ErrorCode(self.raw & 0xffff)
    }

    /// Returns the component that raised the error.
    pub fn source_id(&self) -> u32 {
        (self.raw >> 24) & 0x7f
    }

    /// Returns the raw value.
    pub fn raw(&self) -> u32 {
        self.raw
    }

    /// Returns whether the operation was canceled by the passphrase
    /// relay.
    pub fn is_canceled(&self) -> bool {
        self.code() == ErrorCode::CANCELED
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Error")
            .field("source", &self.source_id())
            .field("code", &self.code())
            .finish()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::from_errno(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(io::ErrorKind::Other, e)
    }
}

/// Converts a raw value to a `Result`.
///
/// A raw value with the code [`ErrorCode::NO_ERROR`] is success,
/// regardless of its source.
pub fn result(raw: u32) -> Result<()> {
    let e = Error::from_raw(raw);
    if e.code() == ErrorCode::NO_ERROR {
        Ok(())
    } else {
        Err(e)
    }
}
