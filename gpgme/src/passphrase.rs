//! Passphrase relay.
//!
//! When the engine needs a secret, e.g. to unlock a secret key or to
//! derive a symmetric session key, the session calls back into the
//! provider registered with [`Context::set_passphrase_provider`].  The
//! provider writes the passphrase into a transient channel, which is
//! closed as soon as the provider returns.
//!
//! [`Context::set_passphrase_provider`]: crate::Context::set_passphrase_provider

use std::fmt;
use std::io::{self, Read, Write};

use log::{debug, trace};

use crate::engine::pipe;
use crate::mem::Protected;
use crate::{Error, ErrorCode, Result};

/// Maximum length of a secret, including the trailing newline.
const MAX_SECRET_LEN: usize = 4096;

/// A request for a passphrase.
#[derive(Clone, Copy, Debug)]
pub struct PassphraseRequest<'a> {
    /// Describes the key whose passphrase is needed, as reported by
    /// the engine ("KEYID User Name <email>").
    pub uid_hint: Option<&'a str>,
    /// Additional information about the key ("KEYID MAINKEYID ALGO
    /// LEN") or, for symmetric encryption, the cipher parameters.
    pub passphrase_info: Option<&'a str>,
    /// Whether the previous attempt was rejected.
    pub prev_attempt_failed: bool,
}

/// The registered passphrase provider.
pub(crate) struct Relay {
    provider: Box<dyn FnMut(&PassphraseRequest<'_>, &mut dyn Write)
                            -> io::Result<()>>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Relay")
    }
}

impl Relay {
    pub(crate) fn new<F>(provider: F) -> Self
        where F: FnMut(&PassphraseRequest<'_>, &mut dyn Write)
                       -> io::Result<()> + 'static
    {
        Relay {
            provider: Box::new(provider),
        }
    }

    /// Asks the provider for a passphrase.
    ///
    /// Returns the secret, terminated by a newline.  If the provider
    /// fails, or the secret does not fit, the request is canceled.
    pub(crate) fn request(&mut self, uid_hint: Option<&str>,
                          passphrase_info: Option<&str>,
                          prev_attempt_failed: bool)
                          -> Result<Protected> {
        let request = PassphraseRequest {
            uid_hint,
            passphrase_info,
            prev_attempt_failed,
        };
        trace!("requesting passphrase: {:?}", request);

        let (mut source, mut sink) = pipe::pipe()?;
        // A provider writing more than the pipe can hold must not
        // block us.
        pipe::set_nonblocking(&sink)?;

        let r = (self.provider)(&request, &mut sink);
        drop(sink);
        if let Err(e) = r {
            debug!("passphrase provider failed: {}", e);
            return Err(Error::new(ErrorCode::CANCELED));
        }

        let mut secret = Protected::new(MAX_SECRET_LEN);
        let mut len = 0;
        loop {
            if len == secret.len() {
                let mut overflow = [0; 1];
                if source.read(&mut overflow)? > 0 {
                    debug!("passphrase exceeds {} bytes", MAX_SECRET_LEN);
                    return Err(Error::new(ErrorCode::CANCELED));
                }
                break;
            }

            match source.read(&mut secret[len..]) {
                Ok(0) => break,
                Ok(n) => len += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        // The engine expects a line.
        if len == 0 || secret[len - 1] != b'\n' {
            if len == secret.len() {
                debug!("passphrase exceeds {} bytes", MAX_SECRET_LEN);
                return Err(Error::new(ErrorCode::CANCELED));
            }
            secret[len] = b'\n';
            len += 1;
        }

        Ok(Protected::from(&secret[..len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn relays_secret() {
        let mut relay = Relay::new(|_, w| w.write_all(b"password\n"));
        let secret = relay.request(None, None, false).unwrap();
        assert_eq!(&secret[..], b"password\n");
    }

    #[test]
    fn appends_newline() {
        let mut relay = Relay::new(|_, w| w.write_all(b"password"));
        let secret = relay.request(None, None, false).unwrap();
        assert_eq!(&secret[..], b"password\n");

        let mut relay = Relay::new(|_, _| Ok(()));
        let secret = relay.request(None, None, false).unwrap();
        assert_eq!(&secret[..], b"\n");
    }

    #[test]
    fn passes_request() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let mut relay = Relay::new(move |r, w| {
            s.borrow_mut().push((r.uid_hint.map(String::from),
                                 r.passphrase_info.map(String::from),
                                 r.prev_attempt_failed));
            w.write_all(b"x\n")
        });

        relay.request(Some("0123456789ABCDEF Alice <alice@example.org>"),
                      Some("0123456789ABCDEF 0123456789ABCDEF 1 0"),
                      true).unwrap();
        assert_eq!(&seen.borrow()[..], &[
            (Some("0123456789ABCDEF Alice <alice@example.org>".into()),
             Some("0123456789ABCDEF 0123456789ABCDEF 1 0".into()),
             true),
        ]);
    }

    #[test]
    fn failure_cancels() {
        let mut relay = Relay::new(|_, _| {
            Err(io::Error::new(io::ErrorKind::Other, "no passphrase for you"))
        });
        let e = relay.request(None, None, false).unwrap_err();
        assert_eq!(e.code(), ErrorCode::CANCELED);
    }

    #[test]
    fn oversized_secret_cancels() {
        let mut relay = Relay::new(|_, w| {
            w.write_all(&vec![b'x'; MAX_SECRET_LEN])
        });
        let e = relay.request(None, None, false).unwrap_err();
        assert!(e.is_canceled());

        let mut relay = Relay::new(|_, w| {
            w.write_all(&vec![b'x'; MAX_SECRET_LEN + 1])
        });
        assert!(relay.request(None, None, false).unwrap_err().is_canceled());

        // Fits exactly.
        let mut relay = Relay::new(|_, w| {
            w.write_all(&vec![b'x'; MAX_SECRET_LEN - 1])
        });
        assert_eq!(relay.request(None, None, false).unwrap().len(),
                   MAX_SECRET_LEN);
    }
}
