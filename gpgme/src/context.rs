//! Sessions.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use tempfile::TempDir;

use crate::engine::gnupg::GnuPG;
use crate::engine::{gpgconf, Engine, EngineInfo, KeyListing, Options};
use crate::passphrase::{PassphraseRequest, Relay};
use crate::{
    Data, EncryptFlags, Error, ErrorCode, Key, KeyListMode, PinentryMode,
    Protocol, Result,
};

/// The state of a key listing.
#[derive(Debug)]
enum KeyListState {
    Idle,
    Listing(KeyListing),
    Done,
    Failed,
}

/// A temporary home directory, removed on drop.
struct Ephemeral(TempDir);

impl Ephemeral {
    fn new() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("sequoia-gpgme").tempdir()?;
        debug!("created ephemeral home {:?}", dir.path());
        Ok(Ephemeral(dir))
    }

    fn path(&self) -> &Path {
        self.0.path()
    }

    /// Stops the daemons serving the directory using the `gpgconf`
    /// at `program`, then removes it.
    fn stop(self, program: &Path) {
        if let Err(e) = gpgconf::kill_all(program, self.path()) {
            trace!("stopping daemons in {:?}: {:#}", self.path(), e);
        }
    }
}

/// A session with the engine.
///
/// A session carries the protocol, the output settings, the
/// passphrase provider, and the state of a key listing.  Operations
/// run synchronously on the calling thread.
///
/// # Example
///
/// A session with the default settings is created using
/// `Context::new`:
///
/// ```no_run
/// # use sequoia_gpgme::{Context, Result};
/// # f().unwrap();
/// # fn f() -> Result<()> {
/// let mut ctx = Context::new()?;
/// for key in ctx.keys("alice@example.org", false)? {
///     println!("{:?}", key?.fingerprint());
/// }
/// # Ok(())
/// # }
/// ```
///
/// Sessions can be configured using the builder pattern with
/// `Context::configure`:
///
/// ```
/// # use sequoia_gpgme::{Context, Protocol, Result};
/// # f().unwrap();
/// # fn f() -> Result<()> {
/// let ctx = Context::configure()
/// #           .ephemeral()
///             .protocol(Protocol::Cms)
///             .armor(true)
///             .build()?;
/// assert_eq!(ctx.protocol(), Protocol::Cms);
/// # Ok(())
/// # }
/// ```
pub struct Context {
    engine: Option<Box<dyn Engine>>,
    options: Options,
    relay: Option<Relay>,
    key_list: KeyListState,
    key: Option<Key>,
    key_error: Option<Error>,
    ephemeral: Option<Ephemeral>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field("released", &self.is_released())
            .field("options", &self.options)
            .field("relay", &self.relay)
            .field("key_list", &self.key_list)
            .finish()
    }
}

fn released() -> Error {
    Error::new(ErrorCode::INV_VALUE)
}

/// Listings must include local or external keys.
fn check_key_list_mode(mode: KeyListMode) -> Result<()> {
    if mode.contains(KeyListMode::LOCAL) || mode.contains(KeyListMode::EXTERN) {
        Ok(())
    } else {
        Err(Error::new(ErrorCode::INV_VALUE))
    }
}

impl Context {
    /// Creates a session with the default settings.
    pub fn new() -> Result<Self> {
        Self::configure().build()
    }

    /// Creates a session that can be configured.
    ///
    /// The configuration is seeded like in `Context::new`, but can be
    /// modified.  A configuration has to be finalized using
    /// `.build()` in order to turn it into a session.
    pub fn configure() -> Config {
        Config::default()
    }

    #[cfg(test)]
    pub(crate) fn with_engine(engine: Box<dyn Engine>) -> Self {
        Context {
            engine: Some(engine),
            options: Options::default(),
            relay: None,
            key_list: KeyListState::Idle,
            key: None,
            key_error: None,
            ephemeral: None,
        }
    }

    /// Releases the session.
    ///
    /// Any key listing is abandoned and the passphrase provider is
    /// dropped.  Afterwards, every operation fails with `INV_VALUE`.
    /// Releasing twice is harmless, dropping a session releases it.
    pub fn release(&mut self) {
        if self.engine.take().is_none() {
            return;
        }
        self.key_list = KeyListState::Idle;
        self.key = None;
        self.key_error = None;
        self.relay = None;
        if let Some(e) = self.ephemeral.take() {
            e.stop(&self.options.file_name(Protocol::GpgConf));
        }
        trace!("released session");
    }

    /// Returns whether the session has been released.
    pub fn is_released(&self) -> bool {
        self.engine.is_none()
    }

    fn engine(&mut self) -> Result<&mut Box<dyn Engine>> {
        self.engine.as_mut().ok_or_else(released)
    }

    /// Sets whether output is ASCII armored.
    pub fn set_armor(&mut self, armor: bool) {
        self.options.armor = armor;
    }

    /// Returns whether output is ASCII armored.
    pub fn armor(&self) -> bool {
        self.options.armor
    }

    /// Selects the protocol.
    ///
    /// Only OpenPGP and CMS can run operations, other protocols are
    /// rejected with `UNSUPPORTED_PROTOCOL`.
    pub fn set_protocol(&mut self, protocol: Protocol) -> Result<()> {
        self.engine()?;
        if ! protocol.is_operational() {
            return Err(Error::new(ErrorCode::UNSUPPORTED_PROTOCOL));
        }
        self.options.protocol = protocol;
        Ok(())
    }

    /// Returns the protocol.
    pub fn protocol(&self) -> Protocol {
        self.options.protocol
    }

    /// Sets what key listings return.
    ///
    /// The mode must include `LOCAL` or `EXTERN`.
    pub fn set_key_list_mode(&mut self, mode: KeyListMode) -> Result<()> {
        self.engine()?;
        check_key_list_mode(mode)?;
        self.options.key_list_mode = mode;
        Ok(())
    }

    /// Returns the key listing mode.
    pub fn key_list_mode(&self) -> KeyListMode {
        self.options.key_list_mode
    }

    /// Sets how the engine asks for passphrases.
    ///
    /// With a passphrase provider and the default mode, OpenPGP
    /// sessions use loopback.
    pub fn set_pinentry_mode(&mut self, mode: PinentryMode) -> Result<()> {
        self.engine()?;
        self.options.pinentry_mode = mode;
        Ok(())
    }

    /// Returns the pinentry mode.
    pub fn pinentry_mode(&self) -> PinentryMode {
        self.options.pinentry_mode
    }

    /// Sets the passphrase provider, replacing any previous one.
    ///
    /// The provider is called with the request and a channel.  It
    /// writes the passphrase to the channel, a trailing newline is
    /// added if missing.  If it fails, the operation is canceled.
    ///
    /// ```no_run
    /// # use std::io::Write;
    /// # use sequoia_gpgme::{Context, Data, Result};
    /// # f().unwrap();
    /// # fn f() -> Result<()> {
    /// let mut ctx = Context::new()?;
    /// ctx.set_passphrase_provider(|_, channel| {
    ///     channel.write_all(b"password\n")
    /// })?;
    /// let mut cipher = Data::from_bytes(&b"..."[..]);
    /// let mut plain = Data::new();
    /// ctx.decrypt(&mut cipher, &mut plain)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn set_passphrase_provider<P>(&mut self, provider: P) -> Result<()>
        where P: FnMut(&PassphraseRequest<'_>, &mut dyn Write)
                       -> std::io::Result<()> + 'static
    {
        self.engine()?;
        self.relay = Some(Relay::new(provider));
        Ok(())
    }

    /// Removes the passphrase provider.
    pub fn clear_passphrase_provider(&mut self) -> Result<()> {
        self.engine()?;
        self.relay = None;
        Ok(())
    }

    /// Returns the engines as configured for this session.
    ///
    /// Returns `None` once the session is released.
    pub fn engine_info(&self) -> Option<EngineInfo> {
        if self.is_released() {
            return None;
        }
        Some(self.options.engine_info())
    }

    /// Overrides the executable and home directory of the engine
    /// implementing `protocol`.
    ///
    /// `None` reverts to the default.
    pub fn set_engine_info(&mut self, protocol: Protocol,
                           file_name: Option<&Path>,
                           home_dir: Option<&Path>)
                           -> Result<()> {
        self.engine()?;
        match protocol {
            Protocol::OpenPgp | Protocol::Cms | Protocol::GpgConf => (),
            _ => return Err(Error::new(ErrorCode::UNSUPPORTED_PROTOCOL)),
        }
        let o = self.options.overrides.entry(protocol).or_default();
        o.file_name = file_name.map(Path::to_path_buf);
        o.home_dir = home_dir.map(Path::to_path_buf);
        Ok(())
    }

    /// Returns the home directory used by the current protocol's
    /// engine, if it is not the default.
    pub fn home_dir(&self) -> Option<&Path> {
        self.options.home_dir(self.options.protocol)
    }

    /// Starts listing keys matching `pattern`.
    ///
    /// An empty pattern matches all keys.  Fails with `CONFLICT` if a
    /// listing is in progress.
    pub fn key_list_start(&mut self, pattern: &str, secret_only: bool)
                          -> Result<()> {
        if ! matches!(self.key_list, KeyListState::Idle) {
            return Err(Error::new(ErrorCode::CONFLICT));
        }
        let engine = self.engine.as_mut().ok_or_else(released)?;
        let listing = engine.keylist(&self.options, pattern, secret_only)?;
        debug!("listing {:?}: {} keys", pattern, listing.len());

        self.key_list = KeyListState::Listing(listing);
        self.key = None;
        self.key_error = None;
        Ok(())
    }

    /// Advances the listing.
    ///
    /// Returns `true` and makes the next key available through
    /// [`Context::key`], or returns `false` at the end.  If the
    /// listing ended with an error, it is available through
    /// [`Context::key_error`].
    pub fn key_list_next(&mut self) -> bool {
        let listing = match &mut self.key_list {
            KeyListState::Listing(l) => l,
            KeyListState::Done => {
                self.key = None;
                return false;
            },
            KeyListState::Failed => {
                self.key = None;
                return false;
            },
            KeyListState::Idle => {
                self.key = None;
                self.key_error = Some(Error::new(ErrorCode::INV_VALUE));
                return false;
            },
        };

        match listing.next() {
            Ok(key) => {
                self.key = Some(key);
                self.key_error = None;
                true
            },
            Err(e) if e.code() == ErrorCode::EOF => {
                self.key = None;
                self.key_error = None;
                self.key_list = KeyListState::Done;
                false
            },
            Err(e) => {
                debug!("key listing failed: {}", e);
                self.key = None;
                self.key_error = Some(e);
                self.key_list = KeyListState::Failed;
                false
            },
        }
    }

    /// Ends the listing.
    ///
    /// Fails with `INV_VALUE` if no listing was started.
    pub fn key_list_end(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.key_list, KeyListState::Idle) {
            KeyListState::Idle => Err(Error::new(ErrorCode::INV_VALUE)),
            _ => Ok(()),
        }
    }

    /// Returns the current key of the listing.
    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    /// Returns the error that ended the listing.
    pub fn key_error(&self) -> Option<Error> {
        self.key_error
    }

    /// Lists keys matching `pattern`.
    ///
    /// The listing ends when the iterator is dropped.
    pub fn keys(&mut self, pattern: &str, secret_only: bool)
                -> Result<Keys<'_>> {
        self.key_list_start(pattern, secret_only)?;
        Ok(Keys {
            ctx: self,
            done: false,
        })
    }

    /// Returns the keys matching `pattern`.
    pub fn find_keys(&mut self, pattern: &str, secret_only: bool)
                     -> Result<Vec<Key>> {
        self.keys(pattern, secret_only)?.collect()
    }

    /// Decrypts `cipher` into `plain`.
    pub fn decrypt(&mut self, cipher: &mut Data, plain: &mut Data)
                   -> Result<()> {
        self.decrypt_internal(cipher, plain, false)
    }

    /// Decrypts `cipher` into `plain`, verifying embedded signatures.
    pub fn decrypt_verify(&mut self, cipher: &mut Data, plain: &mut Data)
                          -> Result<()> {
        self.decrypt_internal(cipher, plain, true)
    }

    fn decrypt_internal(&mut self, cipher: &mut Data, plain: &mut Data,
                        verify: bool)
                        -> Result<()> {
        let engine = self.engine.as_mut().ok_or_else(released)?;
        cipher.check()?;
        plain.check()?;
        engine.decrypt(&self.options, self.relay.as_mut(), cipher, plain,
                       verify)
    }

    /// Encrypts `plain` for `recipients` into `cipher`.
    ///
    /// Without recipients, `plain` is encrypted symmetrically with a
    /// passphrase.
    pub fn encrypt(&mut self, recipients: &[Key], flags: EncryptFlags,
                   plain: &mut Data, cipher: &mut Data)
                   -> Result<()> {
        let engine = self.engine.as_mut().ok_or_else(released)?;
        plain.check()?;
        cipher.check()?;

        let list = recipients.iter().map(Some)
            .chain(std::iter::once(None))
            .collect::<Vec<Option<&Key>>>();
        trace!("encrypting for {} recipients, {:?}", recipients.len(), flags);
        engine.encrypt(&self.options, self.relay.as_mut(), &list, flags,
                       plain, cipher)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.release();
    }
}

/// Iterates over the keys of a listing.
///
/// Created by [`Context::keys`].  Yields the keys, then the error
/// that ended the listing, if any.
pub struct Keys<'c> {
    ctx: &'c mut Context,
    done: bool,
}

impl Iterator for Keys<'_> {
    type Item = Result<Key>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.ctx.key_list_next() {
            return self.ctx.key.clone().map(Ok);
        }
        self.done = true;
        self.ctx.key_error.map(Err)
    }
}

impl Drop for Keys<'_> {
    fn drop(&mut self) {
        let _ = self.ctx.key_list_end();
    }
}

/// Represents a `Context` configuration.
///
/// A session can be configured using the builder pattern with
/// `Context::configure`.  Ephemeral sessions use a fresh home
/// directory, which is useful for tests and one-shot programs:
///
/// ```
/// # use sequoia_gpgme::{Context, Result};
/// # f().unwrap();
/// # fn f() -> Result<()> {
/// let ctx = Context::configure().ephemeral().build()?;
/// let home = ctx.home_dir().unwrap().to_path_buf();
/// assert!(home.exists());
/// drop(ctx);
/// assert!(! home.exists());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Config {
    options: Options,
    home_dir: Option<PathBuf>,
    engine_path: Option<PathBuf>,
    ephemeral: bool,
}

impl Config {
    /// Finalizes the configuration and returns a `Context`.
    pub fn build(self) -> Result<Context> {
        let Config { mut options, home_dir, engine_path, ephemeral } = self;
        if ! options.protocol.is_operational() {
            return Err(Error::new(ErrorCode::UNSUPPORTED_PROTOCOL));
        }
        check_key_list_mode(options.key_list_mode)?;

        let ephemeral = if ephemeral {
            Some(Ephemeral::new()?)
        } else {
            None
        };
        let home_dir = ephemeral.as_ref().map(|e| e.path().to_path_buf())
            .or(home_dir);
        if let Some(home_dir) = home_dir {
            for p in &[Protocol::OpenPgp, Protocol::Cms, Protocol::GpgConf] {
                options.overrides.entry(*p).or_default().home_dir =
                    Some(home_dir.clone());
            }
        }
        if let Some(path) = engine_path {
            options.overrides.entry(options.protocol).or_default().file_name =
                Some(path);
        }

        Ok(Context {
            engine: Some(Box::new(GnuPG::new())),
            options,
            relay: None,
            key_list: KeyListState::Idle,
            key: None,
            key_error: None,
            ephemeral,
        })
    }

    /// Sets the engine's home directory.
    pub fn home_dir<P: AsRef<Path>>(mut self, home_dir: P) -> Self {
        self.set_home_dir(home_dir);
        self
    }

    /// Sets the engine's home directory.
    pub fn set_home_dir<P: AsRef<Path>>(&mut self, home_dir: P) {
        self.home_dir = Some(home_dir.as_ref().to_path_buf());
    }

    /// Sets the executable implementing the session's protocol.
    pub fn engine_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.set_engine_path(path);
        self
    }

    /// Sets the executable implementing the session's protocol.
    pub fn set_engine_path<P: AsRef<Path>>(&mut self, path: P) {
        self.engine_path = Some(path.as_ref().to_path_buf());
    }

    /// Sets the protocol.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.set_protocol(protocol);
        self
    }

    /// Sets the protocol.
    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.options.protocol = protocol;
    }

    /// Sets whether output is ASCII armored.
    pub fn armor(mut self, armor: bool) -> Self {
        self.set_armor(armor);
        self
    }

    /// Sets whether output is ASCII armored.
    pub fn set_armor(&mut self, armor: bool) {
        self.options.armor = armor;
    }

    /// Sets the pinentry mode.
    pub fn pinentry_mode(mut self, mode: PinentryMode) -> Self {
        self.set_pinentry_mode(mode);
        self
    }

    /// Sets the pinentry mode.
    pub fn set_pinentry_mode(&mut self, mode: PinentryMode) {
        self.options.pinentry_mode = mode;
    }

    /// Sets the key listing mode.
    ///
    /// The mode must include `LOCAL` or `EXTERN`, otherwise
    /// [`Config::build`] fails with `INV_VALUE`.
    pub fn key_list_mode(mut self, mode: KeyListMode) -> Self {
        self.set_key_list_mode(mode);
        self
    }

    /// Sets the key listing mode.
    pub fn set_key_list_mode(&mut self, mode: KeyListMode) {
        self.options.key_list_mode = mode;
    }

    /// Makes this session ephemeral.
    ///
    /// The session uses a temporary home directory, which is deleted
    /// together with the session.  This overrides any home directory
    /// set with [`Config::home_dir`].
    pub fn ephemeral(mut self) -> Self {
        self.set_ephemeral();
        self
    }

    /// Makes this session ephemeral.
    pub fn set_ephemeral(&mut self) {
        self.ephemeral = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::{self, Read, Seek};
    use std::rc::Rc;

    use crate::engine::script::{self, Script};

    const LISTING: &str = "\
pub:u:255:22:D2F2C5D45BE9FDE6:1590000000:::u:::scESC:::+::ed25519:
fpr:::::::::3E8877C877274692975189F5D2F2C5D45BE9FDE6:
uid:u::::1590000000::A1B2::Alice <alice@example.org>::::::::::0:
sub:u:255:18:F81A2D7AB7946BE8:1590000000::::::e:::+::cv25519:
fpr:::::::::6F1CB5D4D0BC5FCE0A20F6D1F81A2D7AB7946BE8:
pub:f:3072:1:1C3D1A6E3F8B9C0A:1580000000:1680000000::-:::scESC::::::23::0:
fpr:::::::::0C1D2E3F4A5B6C7D8E9F0A1B1C3D1A6E3F8B9C0A:
uid:f::::1580000000::B2C3::Bob <bob@example.org>::::::::::0:
";

    fn scripted(script: Script) -> Context {
        Context::with_engine(Box::new(script))
    }

    fn listing() -> (Context, Rc<RefCell<Vec<String>>>) {
        let script = Script {
            listing: LISTING.into(),
            ..Default::default()
        };
        let log = script.log.clone();
        (scripted(script), log)
    }

    fn locked() -> Context {
        let mut ctx = scripted(Script {
            passphrase: Some(&b"password\n"[..]),
            ..Default::default()
        });
        ctx.set_passphrase_provider(|_, w| w.write_all(b"password\n"))
            .unwrap();
        ctx
    }

    fn xor(data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ script::KEY).collect()
    }

    #[test]
    fn defaults() {
        let ctx = Context::new().unwrap();
        assert_eq!(ctx.protocol(), Protocol::OpenPgp);
        assert!(! ctx.armor());
        assert_eq!(ctx.key_list_mode(), KeyListMode::LOCAL);
        assert_eq!(ctx.pinentry_mode(), PinentryMode::Default);
        assert!(ctx.home_dir().is_none());
        assert!(! ctx.is_released());
    }

    #[test]
    fn settings() {
        let (mut ctx, _) = listing();
        ctx.set_armor(true);
        assert!(ctx.armor());

        assert_eq!(ctx.set_protocol(Protocol::Assuan).unwrap_err().code(),
                   ErrorCode::UNSUPPORTED_PROTOCOL);
        assert_eq!(ctx.set_protocol(Protocol::GpgConf).unwrap_err().code(),
                   ErrorCode::UNSUPPORTED_PROTOCOL);
        assert_eq!(ctx.protocol(), Protocol::OpenPgp);
        ctx.set_protocol(Protocol::Cms).unwrap();
        assert_eq!(ctx.protocol(), Protocol::Cms);

        assert_eq!(ctx.set_key_list_mode(KeyListMode::SIGS).unwrap_err().code(),
                   ErrorCode::INV_VALUE);
        ctx.set_key_list_mode(KeyListMode::LOCAL | KeyListMode::SIGS).unwrap();
        assert!(ctx.key_list_mode().contains(KeyListMode::SIGS));

        ctx.set_pinentry_mode(PinentryMode::Loopback).unwrap();
        assert_eq!(ctx.pinentry_mode(), PinentryMode::Loopback);
    }

    #[test]
    fn config() {
        let ctx = Context::configure()
            .protocol(Protocol::Cms)
            .armor(true)
            .pinentry_mode(PinentryMode::Cancel)
            .key_list_mode(KeyListMode::EXTERN)
            .home_dir("/tmp/sequoia-gpgme-home")
            .engine_path("/opt/gnupg/bin/gpgsm")
            .build().unwrap();
        assert_eq!(ctx.protocol(), Protocol::Cms);
        assert!(ctx.armor());
        assert_eq!(ctx.pinentry_mode(), PinentryMode::Cancel);
        assert_eq!(ctx.key_list_mode(), KeyListMode::EXTERN);
        assert_eq!(ctx.home_dir(), Some(Path::new("/tmp/sequoia-gpgme-home")));

        let info = ctx.engine_info().unwrap();
        let cms = info.iter().find(|e| e.protocol() == Protocol::Cms).unwrap();
        assert_eq!(cms.file_name(), Some(Path::new("/opt/gnupg/bin/gpgsm")));
        assert!(cms.version().is_none());
        assert_eq!(cms.home_dir(), Some(Path::new("/tmp/sequoia-gpgme-home")));

        assert_eq!(Context::configure().protocol(Protocol::Spawn).build()
                   .unwrap_err().code(),
                   ErrorCode::UNSUPPORTED_PROTOCOL);
        assert_eq!(Context::configure().key_list_mode(KeyListMode::SIGS)
                   .build().unwrap_err().code(),
                   ErrorCode::INV_VALUE);
    }

    #[test]
    fn ephemeral_home_is_removed() {
        let ctx = Context::configure().ephemeral().build().unwrap();
        let home = ctx.home_dir().unwrap().to_path_buf();
        assert!(home.is_dir());
        drop(ctx);
        assert!(! home.exists());
    }

    #[test]
    fn ephemeral_home_is_stopped_with_gpgconf_override() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let gpgconf = dir.path().join("gpgconf");
        std::fs::write(&gpgconf, format!("#!/bin/sh\necho \"$@\" > '{}'\n",
                                         dir.path().join("args").display()))
            .unwrap();
        std::fs::set_permissions(&gpgconf,
                                 std::fs::Permissions::from_mode(0o755))
            .unwrap();

        let mut ctx = Context::configure().ephemeral().build().unwrap();
        let home = ctx.home_dir().unwrap().to_path_buf();
        ctx.set_engine_info(Protocol::GpgConf, Some(gpgconf.as_path()), None)
            .unwrap();
        ctx.release();
        assert!(! home.exists());

        let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
        assert_eq!(args.trim_end(),
                   format!("--homedir {} --kill all", home.display()));
    }

    #[test]
    fn engine_overrides() {
        let (mut ctx, _) = listing();
        ctx.set_engine_info(Protocol::OpenPgp,
                            Some(Path::new("/nonexistent/gpg")),
                            Some(Path::new("/nonexistent/home")))
            .unwrap();
        let info = ctx.engine_info().unwrap();
        assert_eq!(info.protocol(), Protocol::OpenPgp);
        assert_eq!(info.file_name(), Some(Path::new("/nonexistent/gpg")));
        assert!(info.version().is_none());
        assert_eq!(info.check().unwrap_err().code(), ErrorCode::INV_ENGINE);
        assert_eq!(ctx.home_dir(), Some(Path::new("/nonexistent/home")));

        ctx.set_engine_info(Protocol::OpenPgp, None, None).unwrap();
        assert!(ctx.home_dir().is_none());

        assert_eq!(ctx.set_engine_info(Protocol::G13, None, None)
                   .unwrap_err().code(),
                   ErrorCode::UNSUPPORTED_PROTOCOL);
    }

    #[test]
    fn enumeration() {
        let (mut ctx, log) = listing();
        ctx.key_list_start("example.org", false).unwrap();
        assert_eq!(&log.borrow()[..], &["keylist \"example.org\" false"]);

        assert!(ctx.key_list_next());
        assert_eq!(ctx.key().unwrap().key_id(), Some("D2F2C5D45BE9FDE6"));
        assert!(ctx.key_list_next());
        assert_eq!(ctx.key().unwrap().first_user_id().unwrap().email(),
                   Some("bob@example.org"));
        assert!(! ctx.key_list_next());
        assert!(ctx.key().is_none());
        assert!(ctx.key_error().is_none());
        assert!(! ctx.key_list_next());
        assert!(ctx.key_error().is_none());

        assert_eq!(ctx.key_list_start("", false).unwrap_err().code(),
                   ErrorCode::CONFLICT);
        ctx.key_list_end().unwrap();
        assert_eq!(ctx.key_list_end().unwrap_err().code(),
                   ErrorCode::INV_VALUE);
        ctx.key_list_start("", false).unwrap();
        ctx.key_list_end().unwrap();
    }

    #[test]
    fn conflicting_start() {
        let (mut ctx, _) = listing();
        ctx.key_list_start("", false).unwrap();
        assert!(ctx.key_list_next());
        assert_eq!(ctx.key_list_start("", true).unwrap_err().code(),
                   ErrorCode::CONFLICT);
        // The running listing is unaffected.
        assert!(ctx.key_list_next());
        assert!(! ctx.key_list_next());
    }

    #[test]
    fn next_without_start() {
        let (mut ctx, _) = listing();
        assert!(! ctx.key_list_next());
        assert_eq!(ctx.key_error().unwrap().code(), ErrorCode::INV_VALUE);
        assert_eq!(ctx.key_list_end().unwrap_err().code(),
                   ErrorCode::INV_VALUE);
    }

    #[test]
    fn empty_enumeration() {
        let mut ctx = scripted(Script::default());
        ctx.key_list_start("nobody@example.org", false).unwrap();
        assert!(! ctx.key_list_next());
        assert!(ctx.key().is_none());
        assert!(ctx.key_error().is_none());
        ctx.key_list_end().unwrap();

        assert!(ctx.find_keys("nobody@example.org", false).unwrap()
                .is_empty());
    }

    #[test]
    fn failure_mid_enumeration() {
        let mut ctx = scripted(Script {
            listing: LISTING.into(),
            listing_error: Some(Error::new(ErrorCode::GENERAL)),
            ..Default::default()
        });
        ctx.key_list_start("", false).unwrap();
        assert!(ctx.key_list_next());
        assert!(ctx.key_list_next());
        assert!(! ctx.key_list_next());
        assert_eq!(ctx.key_error().unwrap().code(), ErrorCode::GENERAL);
        // Retained.
        assert!(! ctx.key_list_next());
        assert_eq!(ctx.key_error().unwrap().code(), ErrorCode::GENERAL);
        ctx.key_list_end().unwrap();

        let keys = ctx.keys("", false).unwrap().collect::<Vec<_>>();
        assert_eq!(keys.len(), 3);
        assert!(keys[0].is_ok());
        assert!(keys[1].is_ok());
        assert_eq!(keys[2].as_ref().unwrap_err().code(), ErrorCode::GENERAL);

        assert_eq!(ctx.find_keys("", false).unwrap_err().code(),
                   ErrorCode::GENERAL);
    }

    #[test]
    fn keys_end_listing_on_drop() {
        let (mut ctx, _) = listing();
        {
            let mut keys = ctx.keys("", true).unwrap();
            assert!(keys.next().unwrap().is_ok());
        }
        ctx.key_list_start("", false).unwrap();
        ctx.key_list_end().unwrap();

        let keys = ctx.find_keys("", false).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[1].key_id(), Some("1C3D1A6E3F8B9C0A"));
    }

    #[test]
    fn roundtrip() {
        let mut ctx = locked();
        let mut plain = Data::from_bytes(b"data\n");
        let mut cipher = Data::new();
        ctx.encrypt(&[], EncryptFlags::empty(), &mut plain, &mut cipher)
            .unwrap();
        let cipher = cipher.into_bytes().unwrap();
        assert_eq!(cipher, xor(b"data\n"));

        let mut cipher = Data::from_reader(io::Cursor::new(cipher));
        let mut plain = Data::new();
        ctx.decrypt(&mut cipher, &mut plain).unwrap();
        assert_eq!(plain.into_bytes().unwrap(), b"data\n");
    }

    #[test]
    fn decrypt_verify() {
        let script = Script::default();
        let log = script.log.clone();
        let mut ctx = scripted(script);
        let mut cipher = Data::from_bytes(xor(b"Test message\n"));
        let mut plain = Data::new();
        ctx.decrypt_verify(&mut cipher, &mut plain).unwrap();
        plain.seek(io::SeekFrom::Start(0)).unwrap();
        let mut s = String::new();
        plain.read_to_string(&mut s).unwrap();
        assert_eq!(s, "Test message\n");
        assert_eq!(&log.borrow()[..], &["decrypt true"]);
    }

    #[test]
    fn recipients_are_terminated() {
        let script = Script {
            listing: LISTING.into(),
            ..Default::default()
        };
        let log = script.log.clone();
        let mut ctx = scripted(script);
        let keys = ctx.find_keys("", false).unwrap();

        let mut plain = Data::from_bytes(b"data\n");
        let mut cipher = Data::new();
        ctx.encrypt(&keys, EncryptFlags::ALWAYS_TRUST, &mut plain,
                    &mut cipher)
            .unwrap();
        assert_eq!(log.borrow().last().unwrap(),
                   &format!("encrypt 2 of 3 {:?}", EncryptFlags::ALWAYS_TRUST));
    }

    #[test]
    fn wrong_passphrase_is_retried() {
        let mut ctx = scripted(Script {
            passphrase: Some(&b"password\n"[..]),
            ..Default::default()
        });
        let attempts = Rc::new(RefCell::new(Vec::new()));
        let a = attempts.clone();
        ctx.set_passphrase_provider(move |r, w| {
            a.borrow_mut().push(r.prev_attempt_failed);
            assert_eq!(r.uid_hint, Some(script::UID_HINT));
            assert_eq!(r.passphrase_info, Some(script::PASSPHRASE_INFO));
            if a.borrow().len() < 2 {
                w.write_all(b"wrong")
            } else {
                w.write_all(b"password")
            }
        }).unwrap();

        let mut cipher = Data::from_bytes(xor(b"data\n"));
        let mut plain = Data::new();
        ctx.decrypt(&mut cipher, &mut plain).unwrap();
        assert_eq!(&attempts.borrow()[..], &[false, true]);
        assert_eq!(plain.into_bytes().unwrap(), b"data\n");
    }

    #[test]
    fn provider_failure_cancels() {
        let mut ctx = locked();
        ctx.set_passphrase_provider(|_, _| {
            Err(io::Error::new(io::ErrorKind::Other, "no"))
        }).unwrap();
        let mut cipher = Data::from_bytes(xor(b"data\n"));
        let mut plain = Data::new();
        let e = ctx.decrypt(&mut cipher, &mut plain).unwrap_err();
        assert_eq!(e.code(), ErrorCode::CANCELED);
        assert!(e.is_canceled());

        ctx.clear_passphrase_provider().unwrap();
        let mut cipher = Data::from_bytes(xor(b"data\n"));
        assert_eq!(ctx.decrypt(&mut cipher, &mut plain).unwrap_err().code(),
                   ErrorCode::BAD_PASSPHRASE);
    }

    #[test]
    fn transport_fault() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "broken"))
            }
        }

        let mut ctx = scripted(Script::default());
        let mut cipher = Data::from_reader(Broken);
        let mut plain = Data::new();
        assert_eq!(ctx.decrypt(&mut cipher, &mut plain).unwrap_err().code(),
                   ErrorCode::EIO);
    }

    #[test]
    fn closed_data() {
        let mut ctx = scripted(Script::default());
        let mut cipher = Data::from_bytes(b"x");
        let mut plain = Data::new();
        plain.close().unwrap();
        assert_eq!(ctx.decrypt(&mut cipher, &mut plain).unwrap_err().code(),
                   ErrorCode::INV_VALUE);
        assert_eq!(ctx.encrypt(&[], EncryptFlags::empty(), &mut cipher,
                               &mut plain).unwrap_err().code(),
                   ErrorCode::INV_VALUE);
    }

    #[test]
    fn release() {
        let (mut ctx, log) = listing();
        ctx.key_list_start("", false).unwrap();
        ctx.release();
        ctx.release();
        assert!(ctx.is_released());
        assert!(ctx.engine_info().is_none());
        assert!(ctx.key().is_none());

        assert_eq!(ctx.key_list_start("", false).unwrap_err().code(),
                   ErrorCode::INV_VALUE);
        assert_eq!(ctx.key_list_end().unwrap_err().code(),
                   ErrorCode::INV_VALUE);
        let mut cipher = Data::from_bytes(b"x");
        let mut plain = Data::new();
        assert_eq!(ctx.decrypt(&mut cipher, &mut plain).unwrap_err().code(),
                   ErrorCode::INV_VALUE);
        assert_eq!(ctx.set_protocol(Protocol::Cms).unwrap_err().code(),
                   ErrorCode::INV_VALUE);
        assert_eq!(ctx.set_passphrase_provider(|_, _| Ok(())).unwrap_err()
                   .code(),
                   ErrorCode::INV_VALUE);
        assert_eq!(log.borrow().len(), 1);
    }

}
