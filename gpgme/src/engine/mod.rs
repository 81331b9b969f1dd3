//! The engine: GnuPG executables driven over pipes.
//!
//! A session never talks to the engine directly.  It hands an
//! [`Options`] snapshot, the data objects, and the optional passphrase
//! relay to an implementation of [`Engine`], which runs one operation
//! to completion on the calling thread.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::passphrase::Relay;
use crate::{
    Data, EncryptFlags, Error, ErrorCode, Key, KeyListMode, PinentryMode,
    Protocol, Result,
};

pub(crate) mod colons;
pub(crate) mod gnupg;
pub(crate) mod gpgconf;
pub(crate) mod pipe;
#[cfg(test)]
pub(crate) mod script;

/// Minimum version of `gpg`.
pub(crate) const OPENPGP_REQ_VERSION: &str = "1.4.0";
/// Minimum version of `gpgsm`.
pub(crate) const CMS_REQ_VERSION: &str = "2.0.4";
/// Minimum version of `gpgconf`.
pub(crate) const GPGCONF_REQ_VERSION: &str = "2.0.4";

/// Per-protocol overrides of the engine's executable and home
/// directory.
#[derive(Clone, Debug, Default)]
pub(crate) struct EngineOverride {
    pub(crate) file_name: Option<PathBuf>,
    pub(crate) home_dir: Option<PathBuf>,
}

/// Session parameters handed to the engine for each operation.
#[derive(Clone, Debug)]
pub(crate) struct Options {
    pub(crate) protocol: Protocol,
    pub(crate) armor: bool,
    pub(crate) key_list_mode: KeyListMode,
    pub(crate) pinentry_mode: PinentryMode,
    pub(crate) overrides: HashMap<Protocol, EngineOverride>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            protocol: Protocol::OpenPgp,
            armor: false,
            key_list_mode: KeyListMode::LOCAL,
            pinentry_mode: PinentryMode::Default,
            overrides: HashMap::new(),
        }
    }
}

impl Options {
    /// Returns the executable implementing `protocol`.
    ///
    /// This is the configured override, else the discovered engine,
    /// else the bare program name, which is looked up in `PATH` when
    /// spawning.
    pub(crate) fn file_name(&self, protocol: Protocol) -> PathBuf {
        if let Some(p) = self.overrides.get(&protocol)
            .and_then(|o| o.file_name.clone())
        {
            return p;
        }

        gpgconf::discover().iter()
            .find(|e| e.protocol == protocol)
            .and_then(|e| e.file_name.clone())
            .unwrap_or_else(|| match protocol {
                Protocol::Cms => "gpgsm".into(),
                Protocol::GpgConf => "gpgconf".into(),
                _ => "gpg".into(),
            })
    }

    /// Returns the configured home directory for `protocol`, if any.
    pub(crate) fn home_dir(&self, protocol: Protocol) -> Option<&Path> {
        self.overrides.get(&protocol)
            .and_then(|o| o.home_dir.as_deref())
    }

    /// Returns a snapshot of the engines as configured for this
    /// session.
    pub(crate) fn engine_info(&self) -> EngineInfo {
        let list = gpgconf::discover().iter()
            .map(|e| {
                let mut e = e.clone();
                if let Some(o) = self.overrides.get(&e.protocol) {
                    if let Some(f) = &o.file_name {
                        e.file_name = Some(f.clone());
                        e.version = gpgconf::version(f).ok();
                    }
                    if let Some(h) = &o.home_dir {
                        e.home_dir = Some(h.clone());
                    }
                }
                e
            })
            .collect();
        EngineInfo::new(Arc::new(list))
    }
}

/// Returns the default home directory.
///
/// This is `$GNUPGHOME` if set, else `~/.gnupg`.
pub(crate) fn default_home_dir() -> Option<PathBuf> {
    std::env::var_os("GNUPGHOME")
        .filter(|h| ! h.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".gnupg")))
}

/// Compares dotted version strings numerically.
///
/// Trailing non-digit suffixes ("2.2.27-beta") are ignored, missing
/// components count as zero.
pub(crate) fn version_at_least(actual: &str, required: &str) -> bool {
    fn parse(v: &str) -> Vec<u64> {
        v.trim().split('.')
            .map(|c| {
                let digits: String =
                    c.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    }

    let (a, r) = (parse(actual), parse(required));
    for i in 0..a.len().max(r.len()) {
        let (x, y) = (a.get(i).cloned().unwrap_or(0),
                      r.get(i).cloned().unwrap_or(0));
        if x != y {
            return x > y;
        }
    }
    true
}

/// A sentinel-terminated recipient list.
///
/// The list holds one entry per recipient followed by a single
/// `None`.
pub(crate) type Recipients<'k> = [Option<&'k Key>];

/// Iterates over the keys of a recipient list, up to the sentinel.
pub(crate) fn recipients<'a, 'k>(r: &'a Recipients<'k>)
                                 -> impl Iterator<Item = &'k Key> + 'a
    where 'k: 'a
{
    r.iter().take_while(|k| k.is_some()).filter_map(|k| *k)
}

/// The keys produced by a listing, followed by the error that ended
/// it, if any.
#[derive(Debug, Default)]
pub(crate) struct KeyListing {
    keys: VecDeque<Key>,
    error: Option<Error>,
}

impl KeyListing {
    pub(crate) fn new(keys: Vec<Key>, error: Option<Error>) -> Self {
        KeyListing {
            keys: keys.into(),
            error,
        }
    }

    /// Records the error ending the listing, unless one is recorded.
    pub(crate) fn fail(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns the next key.
    ///
    /// After the last key, returns the recorded error once, then
    /// `EOF`.
    pub(crate) fn next(&mut self) -> Result<Key> {
        if let Some(k) = self.keys.pop_front() {
            return Ok(k);
        }
        match self.error.take() {
            Some(e) => Err(e),
            None => Err(Error::new(ErrorCode::EOF)),
        }
    }
}

/// An engine running operations for a session.
pub(crate) trait Engine {
    /// Lists the keys matching `pattern`.
    fn keylist(&mut self, options: &Options, pattern: &str, secret_only: bool)
               -> Result<KeyListing>;

    /// Decrypts `cipher` into `plain`, verifying embedded signatures
    /// if `verify` is set.
    fn decrypt(&mut self, options: &Options, relay: Option<&mut Relay>,
               cipher: &mut Data, plain: &mut Data, verify: bool)
               -> Result<()>;

    /// Encrypts `plain` into `cipher`.
    ///
    /// An empty recipient list requests symmetric encryption.
    fn encrypt(&mut self, options: &Options, relay: Option<&mut Relay>,
               recipients: &Recipients, flags: EncryptFlags,
               plain: &mut Data, cipher: &mut Data)
               -> Result<()>;
}

/// What we know about an engine.
#[derive(Clone, Debug)]
pub(crate) struct EngineData {
    pub(crate) protocol: Protocol,
    pub(crate) file_name: Option<PathBuf>,
    pub(crate) version: Option<String>,
    pub(crate) req_version: Option<&'static str>,
    pub(crate) home_dir: Option<PathBuf>,
}

/// Describes an engine.
///
/// Engine information is a snapshot, walk the list of engines with
/// [`EngineInfo::next`] or [`EngineInfo::iter`].
#[derive(Clone)]
pub struct EngineInfo {
    list: Arc<Vec<EngineData>>,
    idx: usize,
}

impl fmt::Debug for EngineInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EngineInfo")
            .field("protocol", &self.protocol())
            .field("file_name", &self.file_name())
            .field("version", &self.version())
            .field("required_version", &self.required_version())
            .field("home_dir", &self.home_dir())
            .finish()
    }
}

impl EngineInfo {
    /// Returns a view of the first element.
    ///
    /// Lists are never empty, there is an entry for each protocol the
    /// binding knows about.
    pub(crate) fn new(list: Arc<Vec<EngineData>>) -> Self {
        EngineInfo {
            list,
            idx: 0,
        }
    }

    fn data(&self) -> &EngineData {
        &self.list[self.idx]
    }

    /// Returns the next engine, if any.
    pub fn next(&self) -> Option<EngineInfo> {
        if self.idx + 1 < self.list.len() {
            Some(EngineInfo {
                list: self.list.clone(),
                idx: self.idx + 1,
            })
        } else {
            None
        }
    }

    /// Iterates over this and all following engines.
    pub fn iter(&self) -> impl Iterator<Item = EngineInfo> {
        let first = Some(self.clone());
        std::iter::successors(first, |e| e.next())
    }

    /// Returns the protocol implemented by the engine.
    pub fn protocol(&self) -> Protocol {
        self.data().protocol
    }

    /// Returns the engine's executable.
    pub fn file_name(&self) -> Option<&Path> {
        self.data().file_name.as_deref()
    }

    /// Returns the engine's version, if it could be determined.
    pub fn version(&self) -> Option<&str> {
        self.data().version.as_deref()
    }

    /// Returns the minimum version supported by this binding.
    pub fn required_version(&self) -> Option<&str> {
        self.data().req_version
    }

    /// Returns the home directory used by the engine.
    pub fn home_dir(&self) -> Option<&Path> {
        self.data().home_dir.as_deref()
    }

    /// Returns whether the engine is installed and recent enough.
    pub(crate) fn check(&self) -> Result<()> {
        match (self.version(), self.required_version()) {
            (Some(v), Some(r)) if version_at_least(v, r) => Ok(()),
            _ => Err(Error::new(ErrorCode::INV_ENGINE)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyData;

    #[test]
    fn versions() {
        assert!(version_at_least("2.2.27", "2.0.4"));
        assert!(version_at_least("2.0.4", "2.0.4"));
        assert!(version_at_least("2.0.10", "2.0.4"));
        assert!(version_at_least("2.1", "2.0.4"));
        assert!(version_at_least("1.4.23-beta7", "1.4.0"));
        assert!(! version_at_least("1.2.9", "1.4.0"));
        assert!(! version_at_least("2.0", "2.0.4"));
        assert!(! version_at_least("", "1.4.0"));
    }

    #[test]
    fn listing_retains_error() {
        let k = Key::from(KeyData::new(Protocol::OpenPgp, KeyListMode::LOCAL));
        let mut l = KeyListing::new(vec![k.clone(), k],
                                    Some(Error::new(ErrorCode::GENERAL)));
        l.fail(Error::new(ErrorCode::CANCELED));
        assert_eq!(l.len(), 2);
        assert!(l.next().is_ok());
        assert!(l.next().is_ok());
        assert_eq!(l.next().unwrap_err().code(), ErrorCode::GENERAL);
        assert_eq!(l.next().unwrap_err().code(), ErrorCode::EOF);
        assert_eq!(l.next().unwrap_err().code(), ErrorCode::EOF);
    }

    #[test]
    fn sentinel() {
        let k = Key::from(KeyData::new(Protocol::OpenPgp, KeyListMode::LOCAL));
        let list = vec![Some(&k), Some(&k), None];
        assert_eq!(recipients(&list).count(), 2);
        let empty: Vec<Option<&Key>> = vec![None];
        assert_eq!(recipients(&empty).count(), 0);
    }

    #[test]
    fn engine_info_walk() {
        let info = EngineInfo::new(Arc::new(vec![
            EngineData {
                protocol: Protocol::OpenPgp,
                file_name: Some("/usr/bin/gpg".into()),
                version: Some("2.2.27".into()),
                req_version: Some(OPENPGP_REQ_VERSION),
                home_dir: None,
            },
            EngineData {
                protocol: Protocol::Cms,
                file_name: None,
                version: None,
                req_version: Some(CMS_REQ_VERSION),
                home_dir: None,
            },
        ]));
        assert_eq!(info.protocol(), Protocol::OpenPgp);
        assert!(info.check().is_ok());
        let cms = info.next().unwrap();
        assert_eq!(cms.protocol(), Protocol::Cms);
        assert_eq!(cms.check().unwrap_err().code(), ErrorCode::INV_ENGINE);
        assert!(cms.next().is_none());
        assert_eq!(info.iter().count(), 2);
    }
}
