//! Parses key listings in GnuPG's colon format.
//!
//! Each line is a record whose first field names its type.  `pub`,
//! `sec`, `crt` and `crs` start a new key, the records following it
//! (`sub`, `ssb`, `fpr`, `grp`, `uid`) add to that key.  Everything
//! else is ignored.

use std::borrow::Cow;

use chrono::NaiveDateTime;
use log::{debug, trace};

use super::KeyListing;
use crate::key::{KeyData, SubKeyData, UserIDData};
use crate::{Error, ErrorCode, Key, KeyListMode, Protocol, Result, Validity};

/// Parses `listing`.
///
/// A malformed record ends the listing with a `GENERAL` error, keys
/// completed before it are kept.
pub(crate) fn parse(protocol: Protocol, mode: KeyListMode, listing: &[u8])
                    -> KeyListing {
    let mut keys: Vec<Key> = Vec::new();
    let mut current: Option<KeyData> = None;

    for line in listing.split(|&c| c == b'\n') {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }

        let record = Record(line.split(':').collect());
        if let Err(e) = parse_record(protocol, mode, &record,
                                     &mut keys, &mut current) {
            debug!("malformed key listing record {:?}", line);
            keys.extend(current.take().map(Key::from));
            return KeyListing::new(keys, Some(e));
        }
    }

    if let Some(k) = current.take() {
        keys.push(k.into());
    }
    KeyListing::new(keys, None)
}

/// The fields of a record.
struct Record<'a>(Vec<&'a str>);

impl<'a> Record<'a> {
    /// Returns field `i`, counting from 1 as GnuPG's documentation
    /// does.
    fn field(&self, i: usize) -> &'a str {
        self.0.get(i - 1).cloned().unwrap_or("")
    }

    fn non_empty(&self, i: usize) -> Option<&'a str> {
        Some(self.field(i)).filter(|f| ! f.is_empty())
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

fn malformed() -> Error {
    Error::new(ErrorCode::GENERAL)
}

fn parse_record(protocol: Protocol, mode: KeyListMode, r: &Record,
                keys: &mut Vec<Key>, current: &mut Option<KeyData>)
                -> Result<()> {
    match r.field(1) {
        t @ "pub" | t @ "sec" | t @ "crt" | t @ "crs" => {
            if r.len() < 5 {
                return Err(malformed());
            }
            if let Some(k) = current.take() {
                keys.push(k.into());
            }

            let mut key = KeyData::new(protocol, mode);
            let mut primary = subkey(r);
            let secret = t == "sec" || t == "crs";
            if secret && r.field(15) != "#" {
                primary.secret = true;
            }

            for c in r.field(2).chars() {
                match c {
                    'r' => key.revoked = true,
                    'e' => key.expired = true,
                    'd' => key.disabled = true,
                    'i' => key.invalid = true,
                    _ => (),
                }
            }
            key.owner_trust = Validity::from_letter(r.field(9).chars().next());

            for c in r.field(12).chars() {
                match c {
                    'E' => key.can_encrypt = true,
                    'S' => key.can_sign = true,
                    'C' => key.can_certify = true,
                    'A' => key.can_authenticate = true,
                    'D' => key.disabled = true,
                    'q' => key.is_qualified = true,
                    _ => (),
                }
            }

            if t == "crt" || t == "crs" {
                key.issuer_serial = r.non_empty(8).map(String::from);
                key.issuer_name = r.non_empty(10).map(|n| unescape(n).into());
            }

            key.secret = primary.secret;
            key.subkeys.push(primary);
            *current = Some(key);
        },

        "sub" | "ssb" => {
            let key = current.as_mut().ok_or_else(malformed)?;
            let mut sk = subkey(r);
            if r.field(1) == "ssb" && r.field(15) != "#" {
                sk.secret = true;
            }
            key.subkeys.push(sk);
        },

        "fpr" => {
            let key = current.as_mut().ok_or_else(malformed)?;
            let is_primary = key.subkeys.len() == 1;
            if let Some(sk) = key.subkeys.last_mut() {
                if sk.fingerprint.is_none() {
                    sk.fingerprint = r.non_empty(10).map(String::from);
                }
            }
            if is_primary && key.protocol == Protocol::Cms {
                if let Some(chain) = r.non_empty(13) {
                    key.chain_id = Some(chain.into());
                }
            }
        },

        "grp" => {
            let key = current.as_mut().ok_or_else(malformed)?;
            if let Some(sk) = key.subkeys.last_mut() {
                sk.keygrip = r.non_empty(10).map(String::from);
            }
        },

        "uid" => {
            let key = current.as_mut().ok_or_else(malformed)?;
            let uid = unescape(r.field(10)).into_owned();
            let mut u = UserIDData::default();
            for c in r.field(2).chars() {
                match c {
                    'r' => u.revoked = true,
                    'i' => u.invalid = true,
                    _ => (),
                }
            }
            u.validity = Validity::from_letter(r.field(2).chars().next());

            if key.protocol == Protocol::Cms {
                if uid.starts_with('<') && uid.ends_with('>') {
                    u.email = Some(uid[1..uid.len() - 1].into());
                }
            } else {
                let (name, comment, email) = split_user_id(&uid);
                u.name = name;
                u.comment = comment;
                u.email = email;
            }
            u.uid = uid;
            key.uids.push(u);
        },

        other => trace!("ignoring {:?} record", other),
    }

    Ok(())
}

/// Parses the fields common to primary keys and subkeys.
fn subkey(r: &Record) -> SubKeyData {
    let mut sk = SubKeyData::default();

    for c in r.field(2).chars() {
        match c {
            'r' => sk.revoked = true,
            'e' => sk.expired = true,
            'd' => sk.disabled = true,
            'i' => sk.invalid = true,
            _ => (),
        }
    }
    sk.length = r.field(3).parse().unwrap_or(0);
    sk.algorithm = r.field(4).parse().unwrap_or(0);
    sk.key_id = r.field(5).into();
    sk.timestamp = parse_time(r.field(6));
    sk.expires = parse_time(r.field(7));

    for c in r.field(12).chars() {
        match c {
            'e' => sk.can_encrypt = true,
            's' => sk.can_sign = true,
            'c' => sk.can_certify = true,
            'a' => sk.can_authenticate = true,
            'q' => sk.is_qualified = true,
            'd' => sk.disabled = true,
            _ => (),
        }
    }

    match r.field(15) {
        "" | "#" => (),
        "+" => sk.secret = true,
        serial => {
            sk.secret = true;
            sk.card_number = Some(serial.into());
        },
    }
    sk.curve = r.non_empty(17).map(String::from);
    sk
}

/// Parses a timestamp.
///
/// GnuPG prints seconds since the epoch, gpgsm may also print ISO
/// times ("20210203T040506").  Unparsable values are zero.
fn parse_time(s: &str) -> i64 {
    if s.contains('T') {
        iso_time(s).unwrap_or(0)
    } else {
        s.parse().unwrap_or(0)
    }
}

fn iso_time(s: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S").ok()
        .map(|t| t.timestamp())
}

/// Undoes GnuPG's `\xHH` escaping.
fn unescape(s: &str) -> Cow<str> {
    if ! s.contains('\\') {
        return Cow::Borrowed(s);
    }

    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        if b[i] == b'\\' && i + 3 < b.len() && b[i + 1] == b'x' {
            let hex = std::str::from_utf8(&b[i + 2..i + 4]).ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(c) = hex {
                out.push(c);
                i += 4;
                continue;
            }
        }
        out.push(b[i]);
        i += 1;
    }
    Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}

/// Splits an OpenPGP user id "Name (Comment) <email>".
fn split_user_id(uid: &str)
                 -> (Option<String>, Option<String>, Option<String>) {
    let mut rest = uid.to_string();

    let email = match rest.rfind('<') {
        Some(start) => match rest[start..].find('>') {
            Some(len) => {
                let email = rest[start + 1..start + len].to_string();
                rest.replace_range(start..start + len + 1, "");
                Some(email)
            },
            None => None,
        },
        None => None,
    };

    let comment = match (rest.find('('), rest.rfind(')')) {
        (Some(start), Some(end)) if start < end => {
            let comment = rest[start + 1..end].to_string();
            rest.replace_range(start..end + 1, "");
            Some(comment)
        },
        _ => None,
    };

    let name = rest.split_whitespace().collect::<Vec<_>>().join(" ");
    // A bare address, as created by `--quick-gen-key alice@example.org`.
    let (name, email) = match email {
        None if comment.is_none() && name.contains('@')
            && ! name.contains(' ') => (String::new(), Some(name)),
        email => (name, email),
    };
    let non_empty = |s: String| Some(s).filter(|s| ! s.is_empty());
    (non_empty(name), comment.and_then(non_empty), email.and_then(non_empty))
}
