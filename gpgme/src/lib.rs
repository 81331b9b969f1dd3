//! Sessions with the GnuPG engine.
//!
//! This crate drives the `gpg` and `gpgsm` executables.  A
//! [`Context`] is a session: it selects the protocol, controls
//! armoring and passphrase handling, lists keys, and decrypts and
//! encrypts [`Data`].
//!
//! # Data
//!
//! A [`Data`] object is what the engine reads from and writes to.  It
//! is backed by a memory buffer, a file, or a Rust stream.  Streams
//! are borrowed for the lifetime of the data object, the engine
//! reaches them through read, write and seek callbacks that run on
//! the calling thread.
//!
//! # Passphrases
//!
//! If a passphrase provider is registered, the engine's passphrase
//! requests are relayed to it.  The provider writes the passphrase to
//! a channel that lives for the duration of the call.  If the
//! provider fails, the operation is canceled.
//!
//! # Example
//!
//! ```no_run
//! # use std::io::Write;
//! # use sequoia_gpgme::{Context, Data, EncryptFlags, Result};
//! # f().unwrap();
//! # fn f() -> Result<()> {
//! let mut ctx = Context::new()?;
//! ctx.set_armor(true);
//! let recipients = ctx.find_keys("alice@example.org", false)?;
//!
//! let mut plain = Data::from_bytes(b"Hello, Alice!\n");
//! let mut cipher = Data::new();
//! ctx.encrypt(&recipients, EncryptFlags::ALWAYS_TRUST,
//!             &mut plain, &mut cipher)?;
//! let armored = cipher.into_bytes().unwrap_or_default();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

use std::io::{Read, Seek, SeekFrom};

mod error;
pub use error::{result, Error, ErrorCode, Result};

mod types;
pub use types::{EncryptFlags, KeyListMode, PinentryMode, Protocol, Validity};

mod mem;

mod data;
pub use data::Data;

mod passphrase;
pub use passphrase::PassphraseRequest;

mod key;
pub use key::{Key, SubKey, SubKeys, UserID, UserIDs};

mod engine;
pub use engine::EngineInfo;

mod context;
pub use context::{Config, Context, Keys};

/// Returns the version of this crate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Checks that this crate is at least version `required`.
///
/// Returns the version of this crate if it is recent enough, or if
/// nothing is required.
pub fn check_version(required: Option<&str>) -> Option<&'static str> {
    match required {
        Some(r) if ! engine::version_at_least(version(), r) => None,
        _ => Some(version()),
    }
}

/// Returns the installed engines.
///
/// Sessions may override the executables and home directories, see
/// [`Context::engine_info`].
pub fn get_engine_info() -> EngineInfo {
    EngineInfo::new(engine::gpgconf::discover())
}

/// Checks that the engine implementing `protocol` is installed and
/// recent enough.
///
/// Fails with `INV_ENGINE` otherwise.
pub fn engine_check_version(protocol: Protocol) -> Result<()> {
    get_engine_info().iter()
        .find(|e| e.protocol() == protocol)
        .ok_or_else(|| Error::new(ErrorCode::INV_ENGINE))?
        .check()
}

/// Returns the keys matching `pattern` using a default session.
pub fn find_keys(pattern: &str, secret_only: bool) -> Result<Vec<Key>> {
    Context::new()?.find_keys(pattern, secret_only)
}

/// Decrypts the message read from `reader` using a default session.
///
/// Returns the plaintext in a memory buffer positioned at its start.
pub fn decrypt<R: Read>(reader: R) -> Result<Data<'static>> {
    let mut ctx = Context::new()?;
    decrypt_with(&mut ctx, reader)
}

fn decrypt_with<R: Read>(ctx: &mut Context, reader: R)
                         -> Result<Data<'static>> {
    let mut cipher = Data::from_reader(reader);
    let mut plain = Data::new();
    ctx.decrypt(&mut cipher, &mut plain)?;
    plain.seek(SeekFrom::Start(0))?;
    Ok(plain)
}
