//! A scripted engine.
//!
//! Runs sessions without GnuPG: listings come from a canned colon
//! listing, and "encryption" XORs every byte with [`KEY`].  If a
//! passphrase is set, operations ask the relay for it, up to three
//! times.

use std::cell::RefCell;
use std::rc::Rc;

use super::{colons, Engine, KeyListing, Options, Recipients};
use crate::data::transport_error;
use crate::passphrase::Relay;
use crate::{Data, EncryptFlags, Error, ErrorCode, Result};

/// The XOR key.
pub(crate) const KEY: u8 = 0x5a;

pub(crate) const UID_HINT: &str = "D2F2C5D45BE9FDE6 Test <test@example.com>";
pub(crate) const PASSPHRASE_INFO: &str = "D2F2C5D45BE9FDE6 D2F2C5D45BE9FDE6 22 0";

#[derive(Clone, Debug, Default)]
pub(crate) struct Script {
    /// Colon listing returned by key listings.
    pub(crate) listing: String,
    /// Error ending the listing.
    pub(crate) listing_error: Option<Error>,
    /// The passphrase, including the newline.
    pub(crate) passphrase: Option<&'static [u8]>,
    /// Records the operations.
    pub(crate) log: Rc<RefCell<Vec<String>>>,
}

impl Script {
    fn unlock(&self, relay: Option<&mut Relay>) -> Result<()> {
        let expected = match self.passphrase {
            Some(p) => p,
            None => return Ok(()),
        };
        let relay = relay.ok_or_else(|| Error::new(ErrorCode::BAD_PASSPHRASE))?;

        let mut prev_attempt_failed = false;
        for _ in 0..3 {
            let secret = relay.request(Some(UID_HINT), Some(PASSPHRASE_INFO),
                                       prev_attempt_failed)?;
            if &secret[..] == expected {
                return Ok(());
            }
            prev_attempt_failed = true;
        }
        Err(Error::new(ErrorCode::BAD_PASSPHRASE))
    }

    fn transform(input: &mut Data, output: &mut Data) -> Result<()> {
        let mut buf = [0; 7];
        loop {
            let n = input.engine_read(&mut buf);
            if n < 0 {
                return Err(transport_error());
            }
            if n == 0 {
                return Ok(());
            }
            let chunk = &mut buf[..n as usize];
            chunk.iter_mut().for_each(|b| *b ^= KEY);
            output.engine_write_all(chunk)?;
        }
    }
}

impl Engine for Script {
    fn keylist(&mut self, options: &Options, pattern: &str, secret_only: bool)
               -> Result<KeyListing> {
        self.log.borrow_mut().push(format!("keylist {:?} {}",
                                           pattern, secret_only));
        let mut listing = colons::parse(options.protocol,
                                        options.key_list_mode,
                                        self.listing.as_bytes());
        if let Some(e) = self.listing_error {
            listing.fail(e);
        }
        Ok(listing)
    }

    fn decrypt(&mut self, _: &Options, relay: Option<&mut Relay>,
               cipher: &mut Data, plain: &mut Data, verify: bool)
               -> Result<()> {
        self.log.borrow_mut().push(format!("decrypt {}", verify));
        self.unlock(relay)?;
        Self::transform(cipher, plain)
    }

    fn encrypt(&mut self, _: &Options, relay: Option<&mut Relay>,
               recipients: &Recipients, flags: EncryptFlags,
               plain: &mut Data, cipher: &mut Data)
               -> Result<()> {
        self.log.borrow_mut().push(format!(
            "encrypt {} of {} {:?}",
            super::recipients(recipients).count(), recipients.len(), flags));
        self.unlock(relay)?;
        Self::transform(plain, cipher)
    }
}
