//! Keys, subkeys, and user ids.
//!
//! Keys are immutable snapshots produced by key listings.  A [`Key`]
//! is cheap to clone.  [`SubKey`] and [`UserID`] are views into their
//! parent key: they keep the key alive, and [`SubKey::next`] and
//! [`UserID::next`] walk the key's lists front to back.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{KeyListMode, Protocol, Validity};

/// Converts a raw timestamp, non-positive values mean "not set".
fn timestamp(t: i64) -> Option<SystemTime> {
    if t <= 0 {
        None
    } else {
        Some(UNIX_EPOCH + Duration::from_secs(t as u64))
    }
}

#[derive(Clone, Debug)]
pub(crate) struct KeyData {
    pub(crate) protocol: Protocol,
    pub(crate) revoked: bool,
    pub(crate) expired: bool,
    pub(crate) disabled: bool,
    pub(crate) invalid: bool,
    pub(crate) can_encrypt: bool,
    pub(crate) can_sign: bool,
    pub(crate) can_certify: bool,
    pub(crate) can_authenticate: bool,
    pub(crate) is_qualified: bool,
    pub(crate) secret: bool,
    pub(crate) owner_trust: Validity,
    pub(crate) key_list_mode: KeyListMode,
    pub(crate) issuer_serial: Option<String>,
    pub(crate) issuer_name: Option<String>,
    pub(crate) chain_id: Option<String>,
    pub(crate) subkeys: Vec<SubKeyData>,
    pub(crate) uids: Vec<UserIDData>,
}

impl KeyData {
    pub(crate) fn new(protocol: Protocol, key_list_mode: KeyListMode) -> Self {
        KeyData {
            protocol,
            revoked: false,
            expired: false,
            disabled: false,
            invalid: false,
            can_encrypt: false,
            can_sign: false,
            can_certify: false,
            can_authenticate: false,
            is_qualified: false,
            secret: false,
            owner_trust: Validity::Unknown,
            key_list_mode,
            issuer_serial: None,
            issuer_name: None,
            chain_id: None,
            subkeys: Vec::new(),
            uids: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct SubKeyData {
    pub(crate) revoked: bool,
    pub(crate) expired: bool,
    pub(crate) disabled: bool,
    pub(crate) invalid: bool,
    pub(crate) can_encrypt: bool,
    pub(crate) can_sign: bool,
    pub(crate) can_certify: bool,
    pub(crate) can_authenticate: bool,
    pub(crate) is_qualified: bool,
    pub(crate) secret: bool,
    pub(crate) algorithm: u32,
    pub(crate) length: u32,
    pub(crate) key_id: String,
    pub(crate) fingerprint: Option<String>,
    pub(crate) keygrip: Option<String>,
    pub(crate) curve: Option<String>,
    pub(crate) timestamp: i64,
    pub(crate) expires: i64,
    pub(crate) card_number: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct UserIDData {
    pub(crate) revoked: bool,
    pub(crate) invalid: bool,
    pub(crate) validity: Validity,
    pub(crate) uid: String,
    pub(crate) name: Option<String>,
    pub(crate) comment: Option<String>,
    pub(crate) email: Option<String>,
}

/// A key.
#[derive(Clone)]
pub struct Key(Arc<KeyData>);

impl From<KeyData> for Key {
    fn from(k: KeyData) -> Self {
        Key(Arc::new(k))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Key")
            .field("protocol", &self.protocol())
            .field("fingerprint", &self.fingerprint())
            .field("user_id", &self.first_user_id().as_ref().map(|u| u.id()))
            .field("secret", &self.has_secret())
            .finish()
    }
}

impl Key {
    /// Returns the protocol of the key.
    pub fn protocol(&self) -> Protocol {
        self.0.protocol
    }

    /// Returns whether the key has been revoked.
    pub fn is_revoked(&self) -> bool {
        self.0.revoked
    }

    /// Returns whether the key has expired.
    pub fn is_expired(&self) -> bool {
        self.0.expired
    }

    /// Returns whether the key has been disabled.
    pub fn is_disabled(&self) -> bool {
        self.0.disabled
    }

    /// Returns whether the key is invalid.
    pub fn is_invalid(&self) -> bool {
        self.0.invalid
    }

    /// Returns whether the key, or one of its subkeys, can encrypt.
    pub fn can_encrypt(&self) -> bool {
        self.0.can_encrypt
    }

    /// Returns whether the key, or one of its subkeys, can sign.
    pub fn can_sign(&self) -> bool {
        self.0.can_sign
    }

    /// Returns whether the key, or one of its subkeys, can certify.
    pub fn can_certify(&self) -> bool {
        self.0.can_certify
    }

    /// Returns whether the key, or one of its subkeys, can
    /// authenticate.
    pub fn can_authenticate(&self) -> bool {
        self.0.can_authenticate
    }

    /// Returns whether the key is qualified for signatures according
    /// to local government regulations.
    pub fn is_qualified(&self) -> bool {
        self.0.is_qualified
    }

    /// Returns whether secret key material is available.
    pub fn has_secret(&self) -> bool {
        self.0.secret
    }

    /// Returns the owner trust (OpenPGP only).
    pub fn owner_trust(&self) -> Validity {
        self.0.owner_trust
    }

    /// Returns the key-list mode that produced this key.
    pub fn key_list_mode(&self) -> KeyListMode {
        self.0.key_list_mode
    }

    /// Returns the issuer's serial number (CMS only).
    pub fn issuer_serial(&self) -> Option<&str> {
        self.0.issuer_serial.as_deref()
    }

    /// Returns the issuer's name (CMS only).
    pub fn issuer_name(&self) -> Option<&str> {
        self.0.issuer_name.as_deref()
    }

    /// Returns the fingerprint of the issuer's certificate (CMS
    /// only).
    pub fn chain_id(&self) -> Option<&str> {
        self.0.chain_id.as_deref()
    }

    /// Returns the primary key's id.
    pub fn key_id(&self) -> Option<&str> {
        self.0.subkeys.first().map(|k| k.key_id.as_str())
    }

    /// Returns the primary key's fingerprint.
    pub fn fingerprint(&self) -> Option<&str> {
        self.0.subkeys.first().and_then(|k| k.fingerprint.as_deref())
    }

    /// Returns the primary key.
    ///
    /// The primary key is the first element of the subkey list, use
    /// [`SubKey::next`] to walk the remaining subkeys.
    pub fn primary_key(&self) -> Option<SubKey> {
        SubKey::at(self, 0)
    }

    /// Returns the first user id.
    pub fn first_user_id(&self) -> Option<UserID> {
        UserID::at(self, 0)
    }

    /// Iterates over the subkeys, starting with the primary key.
    pub fn subkeys(&self) -> SubKeys {
        SubKeys {
            next: self.primary_key(),
        }
    }

    /// Iterates over the user ids.
    pub fn user_ids(&self) -> UserIDs {
        UserIDs {
            next: self.first_user_id(),
        }
    }
}

/// A subkey.
///
/// The primary key is the first subkey of a key.
#[derive(Clone)]
pub struct SubKey {
    key: Key,
    idx: usize,
}

impl fmt::Debug for SubKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SubKey")
            .field("key_id", &self.key_id())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl SubKey {
    fn at(key: &Key, idx: usize) -> Option<Self> {
        if idx < key.0.subkeys.len() {
            Some(SubKey {
                key: key.clone(),
                idx,
            })
        } else {
            None
        }
    }

    fn data(&self) -> &SubKeyData {
        &self.key.0.subkeys[self.idx]
    }

    /// Returns the next subkey, if any.
    pub fn next(&self) -> Option<SubKey> {
        Self::at(&self.key, self.idx + 1)
    }

    /// Returns the key this subkey belongs to.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Returns whether it is revoked.
    pub fn is_revoked(&self) -> bool {
        self.data().revoked
    }

    /// Returns whether it has expired.
    pub fn is_expired(&self) -> bool {
        self.data().expired
    }

    /// Returns whether it is disabled.
    pub fn is_disabled(&self) -> bool {
        self.data().disabled
    }

    /// Returns whether it is invalid.
    pub fn is_invalid(&self) -> bool {
        self.data().invalid
    }

    /// Returns whether it can be used for encryption.
    pub fn can_encrypt(&self) -> bool {
        self.data().can_encrypt
    }

    /// Returns whether it can be used for signing.
    pub fn can_sign(&self) -> bool {
        self.data().can_sign
    }

    /// Returns whether it can certify other keys.
    pub fn can_certify(&self) -> bool {
        self.data().can_certify
    }

    /// Returns whether it can be used for authentication.
    pub fn can_authenticate(&self) -> bool {
        self.data().can_authenticate
    }

    /// Returns whether it is a qualified signature key.
    pub fn is_qualified(&self) -> bool {
        self.data().is_qualified
    }

    /// Returns whether secret key material is available.
    pub fn has_secret(&self) -> bool {
        self.data().secret
    }

    /// Returns the public-key algorithm, as an OpenPGP algorithm id.
    pub fn algorithm(&self) -> u32 {
        self.data().algorithm
    }

    /// Returns the name of the public-key algorithm.
    pub fn algorithm_name(&self) -> Option<&'static str> {
        match self.data().algorithm {
            1 | 2 | 3 => Some("RSA"),
            16 | 20 => Some("ELG"),
            17 => Some("DSA"),
            18 => Some("ECDH"),
            19 => Some("ECDSA"),
            22 => Some("EdDSA"),
            _ => None,
        }
    }

    /// Returns the key length in bits.
    pub fn length(&self) -> u32 {
        self.data().length
    }

    /// Returns the key id.
    pub fn key_id(&self) -> &str {
        &self.data().key_id
    }

    /// Returns the fingerprint.
    pub fn fingerprint(&self) -> Option<&str> {
        self.data().fingerprint.as_deref()
    }

    /// Returns the keygrip.
    pub fn keygrip(&self) -> Option<&str> {
        self.data().keygrip.as_deref()
    }

    /// Returns the name of the elliptic curve, if any.
    pub fn curve(&self) -> Option<&str> {
        self.data().curve.as_deref()
    }

    /// Returns the creation time, if known.
    pub fn creation_time(&self) -> Option<SystemTime> {
        timestamp(self.data().timestamp)
    }

    /// Returns the expiration time, if any.
    pub fn expiration_time(&self) -> Option<SystemTime> {
        timestamp(self.data().expires)
    }

    /// Returns whether the secret key is stored on a smartcard.
    pub fn is_card_key(&self) -> bool {
        self.data().card_number.is_some()
    }

    /// Returns the serial number of the smartcard holding the secret
    /// key.
    pub fn card_number(&self) -> Option<&str> {
        self.data().card_number.as_deref()
    }
}

/// A user id.
#[derive(Clone)]
pub struct UserID {
    key: Key,
    idx: usize,
}

impl fmt::Debug for UserID {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("UserID")
            .field(&self.id())
            .finish()
    }
}

impl UserID {
    fn at(key: &Key, idx: usize) -> Option<Self> {
        if idx < key.0.uids.len() {
            Some(UserID {
                key: key.clone(),
                idx,
            })
        } else {
            None
        }
    }

    fn data(&self) -> &UserIDData {
        &self.key.0.uids[self.idx]
    }

    /// Returns the next user id, if any.
    pub fn next(&self) -> Option<UserID> {
        Self::at(&self.key, self.idx + 1)
    }

    /// Returns the key this user id belongs to.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Returns whether it is revoked.
    pub fn is_revoked(&self) -> bool {
        self.data().revoked
    }

    /// Returns whether it is invalid.
    pub fn is_invalid(&self) -> bool {
        self.data().invalid
    }

    /// Returns the user id's validity.
    pub fn validity(&self) -> Validity {
        self.data().validity
    }

    /// Returns the user id as listed by the engine.
    pub fn id(&self) -> &str {
        &self.data().uid
    }

    /// Returns the name part.
    pub fn name(&self) -> Option<&str> {
        self.data().name.as_deref()
    }

    /// Returns the comment part.
    pub fn comment(&self) -> Option<&str> {
        self.data().comment.as_deref()
    }

    /// Returns the email address.
    pub fn email(&self) -> Option<&str> {
        self.data().email.as_deref()
    }
}

/// Iterates over the subkeys of a key.
#[derive(Debug)]
pub struct SubKeys {
    next: Option<SubKey>,
}

impl Iterator for SubKeys {
    type Item = SubKey;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.next();
        Some(current)
    }
}

/// Iterates over the user ids of a key.
#[derive(Debug)]
pub struct UserIDs {
    next: Option<UserID>,
}

impl Iterator for UserIDs {
    type Item = UserID;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.next();
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Key {
        let mut k = KeyData::new(Protocol::OpenPgp, KeyListMode::LOCAL);
        k.subkeys.push(SubKeyData {
            key_id: "AAAAAAAAAAAAAAAA".into(),
            fingerprint: Some("F".repeat(40)),
            timestamp: 1_500_000_000,
            expires: 0,
            ..Default::default()
        });
        k.subkeys.push(SubKeyData {
            key_id: "BBBBBBBBBBBBBBBB".into(),
            timestamp: -1,
            expires: 1_600_000_000,
            ..Default::default()
        });
        k.uids.push(UserIDData {
            uid: "Alice".into(),
            ..Default::default()
        });
        k.into()
    }

    #[test]
    fn walk_subkeys() {
        let k = key();
        let primary = k.primary_key().unwrap();
        assert_eq!(primary.key_id(), "AAAAAAAAAAAAAAAA");
        assert_eq!(k.key_id(), Some("AAAAAAAAAAAAAAAA"));
        assert_eq!(k.fingerprint(), primary.fingerprint());

        let second = primary.next().unwrap();
        assert_eq!(second.key_id(), "BBBBBBBBBBBBBBBB");
        assert!(second.next().is_none());
        assert_eq!(k.subkeys().count(), 2);
    }

    #[test]
    fn views_keep_key_alive() {
        let uid = key().first_user_id().unwrap();
        assert_eq!(uid.id(), "Alice");
        assert!(uid.next().is_none());
        assert_eq!(uid.key().user_ids().count(), 1);
    }

    #[test]
    fn timestamps() {
        let k = key();
        let primary = k.primary_key().unwrap();
        assert_eq!(primary.creation_time(),
                   Some(UNIX_EPOCH + Duration::from_secs(1_500_000_000)));
        assert_eq!(primary.expiration_time(), None);

        let second = primary.next().unwrap();
        assert_eq!(second.creation_time(), None);
        assert!(second.expiration_time().is_some());
    }

    #[test]
    fn empty_key() {
        let k = Key::from(KeyData::new(Protocol::Cms, KeyListMode::empty()));
        assert!(k.primary_key().is_none());
        assert!(k.first_user_id().is_none());
        assert_eq!(k.fingerprint(), None);
        assert_eq!(k.subkeys().count(), 0);
    }
}
