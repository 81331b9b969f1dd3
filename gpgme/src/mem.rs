//! Memory protection for secrets.

use std::fmt;
use std::ops::{Deref, DerefMut};

/// Holds a secret, e.g. a passphrase on its way to the engine.
///
/// The memory is cleared when dropped.
pub(crate) struct Protected(Box<[u8]>);

impl Protected {
    /// Allocates `len` zeroed bytes.
    pub(crate) fn new(len: usize) -> Self {
        Protected(vec![0; len].into_boxed_slice())
    }
}

impl Deref for Protected {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Protected {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl AsRef<[u8]> for Protected {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Protected {
    fn from(v: &[u8]) -> Self {
        let mut p = Protected::new(v.len());
        p.copy_from_slice(v);
        p
    }
}

impl Drop for Protected {
    fn drop(&mut self) {
        unsafe {
            memsec::memzero(self.0.as_mut_ptr(), self.0.len());
        }
    }
}

impl fmt::Debug for Protected {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("[<Redacted>]")
    }
}
