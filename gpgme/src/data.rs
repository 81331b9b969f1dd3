//! Data buffers exchanged with the engine.
//!
//! A [`Data`] object is the transport between host streams and the
//! engine.  It comes in three flavors:
//!
//!   - memory buffers ([`Data::new`], [`Data::from_bytes`]),
//!   - files ([`Data::from_file`]), and
//!   - callback objects wrapping host readers, writers and seekers
//!     ([`Data::from_reader`] and friends).
//!
//! During an operation, the engine pulls input from and pushes output
//! into these objects using a small callback protocol: every call
//! performs exactly one blocking read, write, or seek on the host
//! stream and reports a byte count (or position) on success, and `-1`
//! on failure.  Failures leave an `errno` behind which the engine
//! turns into the error of the enclosing operation.  End of stream is
//! a zero-length read, not a failure.
//!
//! `Data` also implements [`Read`], [`Write`], and [`Seek`] with the
//! same semantics, which is handy for inspecting memory buffers.
//!
//! # Examples
//!
//! ```
//! use std::io::{Read, Seek, SeekFrom, Write};
//! use sequoia_gpgme::Data;
//!
//! let mut data = Data::new();
//! data.write_all(b"data\n").unwrap();
//! data.seek(SeekFrom::Start(0)).unwrap();
//! let mut buf = String::new();
//! data.read_to_string(&mut buf).unwrap();
//! assert_eq!(buf, "data\n");
//! ```

use std::cell::Cell;
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use log::{debug, trace};

use crate::{Error, ErrorCode, Result};

thread_local! {
    /// The transport's `errno`, set by failing callbacks.
    static ERRNO: Cell<i32> = Cell::new(0);
}

/// Records the reason for a failing transport call.
pub(crate) fn set_errno(errno: i32) {
    ERRNO.with(|e| e.set(errno));
}

/// Returns and clears the recorded `errno`.
///
/// A callback that failed without recording a reason is reported as
/// `EIO`.
pub(crate) fn take_errno() -> i32 {
    match ERRNO.with(|e| e.replace(0)) {
        0 => libc::EIO,
        errno => errno,
    }
}

/// Returns the error of a failed transport call.
pub(crate) fn transport_error() -> Error {
    Error::from_errno(take_errno())
}

/// Host streams that can both read and write.
pub(crate) trait ReadWrite: Read + Write {
    fn as_read(&mut self) -> &mut dyn Read;
    fn as_write(&mut self) -> &mut dyn Write;
}

impl<T: Read + Write> ReadWrite for T {
    fn as_read(&mut self) -> &mut dyn Read {
        self
    }

    fn as_write(&mut self) -> &mut dyn Write {
        self
    }
}

/// Host streams that can read, write, and seek.
pub(crate) trait ReadWriteSeek: Read + Write + Seek {
    fn as_read(&mut self) -> &mut dyn Read;
    fn as_write(&mut self) -> &mut dyn Write;
    fn as_seek(&mut self) -> &mut dyn Seek;
}

impl<T: Read + Write + Seek> ReadWriteSeek for T {
    fn as_read(&mut self) -> &mut dyn Read {
        self
    }

    fn as_write(&mut self) -> &mut dyn Write {
        self
    }

    fn as_seek(&mut self) -> &mut dyn Seek {
        self
    }
}

/// The host side of a callback object.
///
/// The engine never sees the host stream itself, only this handle,
/// which is boxed and owned by the `Data` object.
pub(crate) enum HostStream<'a> {
    Reader(Box<dyn Read + 'a>),
    Writer(Box<dyn Write + 'a>),
    ReadWriter(Box<dyn ReadWrite + 'a>),
    ReadWriteSeeker(Box<dyn ReadWriteSeek + 'a>),
}

impl<'a> HostStream<'a> {
    fn reader(&mut self) -> Option<&mut dyn Read> {
        match self {
            HostStream::Reader(r) => Some(r.as_mut()),
            HostStream::Writer(_) => None,
            HostStream::ReadWriter(rw) => Some(ReadWrite::as_read(rw.as_mut())),
            HostStream::ReadWriteSeeker(rws) =>
                Some(ReadWriteSeek::as_read(rws.as_mut())),
        }
    }

    fn writer(&mut self) -> Option<&mut dyn Write> {
        match self {
            HostStream::Reader(_) => None,
            HostStream::Writer(w) => Some(w.as_mut()),
            HostStream::ReadWriter(rw) => Some(ReadWrite::as_write(rw.as_mut())),
            HostStream::ReadWriteSeeker(rws) =>
                Some(ReadWriteSeek::as_write(rws.as_mut())),
        }
    }

    fn seeker(&mut self) -> Option<&mut dyn Seek> {
        match self {
            HostStream::ReadWriteSeeker(rws) =>
                Some(ReadWriteSeek::as_seek(rws.as_mut())),
            _ => None,
        }
    }
}

/// Reads into the engine's buffer.
type ReadCb = fn(&mut HostStream<'_>, &mut [u8]) -> isize;
/// Writes the engine's buffer.
type WriteCb = fn(&mut HostStream<'_>, &[u8]) -> isize;
/// Seeks to `offset` relative to `whence`.
type SeekCb = fn(&mut HostStream<'_>, i64, i32) -> i64;

/// The callbacks registered for a callback object.
#[derive(Clone, Copy, Default)]
struct DataCbs {
    read: Option<ReadCb>,
    write: Option<WriteCb>,
    seek: Option<SeekCb>,
}

fn read_cb(stream: &mut HostStream<'_>, buffer: &mut [u8]) -> isize {
    let reader = match stream.reader() {
        Some(r) => r,
        None => {
            set_errno(libc::EBADF);
            return -1;
        },
    };

    loop {
        match reader.read(buffer) {
            // Zero bytes is end of stream, which the engine expects
            // as a successful, empty read.
            Ok(n) => return n as isize,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("read callback failed: {}", e);
                set_errno(libc::EIO);
                return -1;
            },
        }
    }
}

fn write_cb(stream: &mut HostStream<'_>, buffer: &[u8]) -> isize {
    let writer = match stream.writer() {
        Some(w) => w,
        None => {
            set_errno(libc::EBADF);
            return -1;
        },
    };

    loop {
        match writer.write(buffer) {
            Ok(n) => return n as isize,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("write callback failed: {}", e);
                set_errno(libc::EIO);
                return -1;
            },
        }
    }
}

fn seek_cb(stream: &mut HostStream<'_>, offset: i64, whence: i32) -> i64 {
    let seeker = match stream.seeker() {
        Some(s) => s,
        None => {
            set_errno(libc::EOPNOTSUPP);
            return -1;
        },
    };
    let pos = match seek_from(offset, whence) {
        Some(p) => p,
        None => return invalid_whence(),
    };

    match seeker.seek(pos) {
        Ok(n) => n as i64,
        Err(e) => {
            debug!("seek callback failed: {}", e);
            set_errno(libc::EIO);
            -1
        },
    }
}

/// Converts an offset and a `whence` code to a `SeekFrom`.
fn seek_from(offset: i64, whence: i32) -> Option<SeekFrom> {
    match whence {
        libc::SEEK_SET if offset >= 0 => Some(SeekFrom::Start(offset as u64)),
        libc::SEEK_CUR => Some(SeekFrom::Current(offset)),
        libc::SEEK_END => Some(SeekFrom::End(offset)),
        _ => None,
    }
}

fn invalid_whence() -> i64 {
    set_errno(libc::EINVAL);
    -1
}

/// Converts a `SeekFrom` to an offset and a `whence` code.
fn whence(pos: SeekFrom) -> io::Result<(i64, i32)> {
    match pos {
        SeekFrom::Start(o) if o <= i64::max_value() as u64 =>
            Ok((o as i64, libc::SEEK_SET)),
        SeekFrom::Start(_) =>
            Err(io::Error::new(io::ErrorKind::InvalidInput,
                               "offset out of range")),
        SeekFrom::Current(o) => Ok((o, libc::SEEK_CUR)),
        SeekFrom::End(o) => Ok((o, libc::SEEK_END)),
    }
}

/// Maps the outcome of a host I/O call to the callback convention.
fn convention(r: io::Result<u64>) -> i64 {
    match r {
        Ok(n) => n as i64,
        Err(e) => {
            set_errno(e.raw_os_error().unwrap_or(libc::EIO));
            -1
        },
    }
}

/// The engine's handle of a data object.
enum Handle<'a> {
    Memory(Cursor<Vec<u8>>),
    File(&'a File),
    Callbacks {
        cbs: DataCbs,
        stream: Box<HostStream<'a>>,
    },
}

impl Handle<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Handle::Memory(_) => "memory",
            Handle::File(_) => "file",
            Handle::Callbacks { .. } => "callbacks",
        }
    }
}

/// A data buffer used to exchange data with the engine.
///
/// The lifetime `'a` is the lifetime of the borrowed host stream or
/// file, if any.  The `Data` object owns its engine handle, which is
/// released by [`Data::close`] or when the object is dropped.  A
/// closed `Data` object is rejected by all operations.
pub struct Data<'a> {
    dh: Option<Handle<'a>>,
    file_name: Option<String>,
}

impl Data<'static> {
    /// Returns a new, empty memory buffer.
    pub fn new() -> Self {
        Self::with_handle(Handle::Memory(Cursor::new(Vec::new())))
    }

    /// Returns a memory buffer holding a copy of `bytes`.
    ///
    /// The buffer is positioned at the start.
    pub fn from_bytes<B: AsRef<[u8]>>(bytes: B) -> Self {
        Self::with_handle(Handle::Memory(Cursor::new(bytes.as_ref().to_vec())))
    }
}

impl Default for Data<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Data<'a> {
    fn with_handle(dh: Handle<'a>) -> Self {
        trace!("new {} data object", dh.kind());
        Data {
            dh: Some(dh),
            file_name: None,
        }
    }

    fn with_callbacks(stream: HostStream<'a>, cbs: DataCbs) -> Self {
        Self::with_handle(Handle::Callbacks {
            cbs,
            stream: Box::new(stream),
        })
    }

    /// Returns a buffer backed by `file`.
    ///
    /// Reads, writes and seeks go directly to the file's descriptor.
    /// The file is borrowed, not closed with the `Data` object.
    pub fn from_file(file: &'a File) -> Self {
        Self::with_handle(Handle::File(file))
    }

    /// Returns a buffer that reads from `reader`.
    pub fn from_reader<R: Read + 'a>(reader: R) -> Self {
        Self::with_callbacks(HostStream::Reader(Box::new(reader)), DataCbs {
            read: Some(read_cb),
            ..Default::default()
        })
    }

    /// Returns a buffer that writes to `writer`.
    pub fn from_writer<W: Write + 'a>(writer: W) -> Self {
        Self::with_callbacks(HostStream::Writer(Box::new(writer)), DataCbs {
            write: Some(write_cb),
            ..Default::default()
        })
    }

    /// Returns a buffer that reads from and writes to `stream`.
    pub fn from_read_writer<S: Read + Write + 'a>(stream: S) -> Self {
        Self::with_callbacks(HostStream::ReadWriter(Box::new(stream)), DataCbs {
            read: Some(read_cb),
            write: Some(write_cb),
            ..Default::default()
        })
    }

    /// Returns a buffer that reads from, writes to, and seeks in
    /// `stream`.
    pub fn from_read_write_seeker<S>(stream: S) -> Self
        where S: Read + Write + Seek + 'a
    {
        Self::with_callbacks(HostStream::ReadWriteSeeker(Box::new(stream)),
                             DataCbs {
                                 read: Some(read_cb),
                                 write: Some(write_cb),
                                 seek: Some(seek_cb),
                             })
    }

    /// Releases the engine handle.
    ///
    /// Closing is idempotent.
    pub fn close(&mut self) -> Result<()> {
        if let Some(dh) = self.dh.take() {
            trace!("released {} data object", dh.kind());
        }
        Ok(())
    }

    /// Returns whether the buffer has been closed.
    pub fn is_closed(&self) -> bool {
        self.dh.is_none()
    }

    /// Returns the associated file name, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Associates a file name with the buffer.
    ///
    /// When encrypting, the engine records the name of the plaintext
    /// in the message.
    pub fn set_file_name<S: Into<String>>(&mut self, name: Option<S>)
                                          -> Result<()> {
        self.check()?;
        self.file_name = name.map(Into::into);
        Ok(())
    }

    /// Releases the buffer and returns its content.
    ///
    /// Returns `None` if this is not a memory buffer or it has been
    /// closed.
    pub fn into_bytes(mut self) -> Option<Vec<u8>> {
        match self.dh.take() {
            Some(Handle::Memory(c)) => Some(c.into_inner()),
            other => {
                self.dh = other;
                None
            },
        }
    }

    /// Fails with `INV_VALUE` if the buffer has been closed.
    pub(crate) fn check(&self) -> Result<()> {
        if self.dh.is_some() {
            Ok(())
        } else {
            Err(Error::new(ErrorCode::INV_VALUE))
        }
    }

    /// Pulls up to `buffer.len()` bytes for the engine.
    ///
    /// Returns the number of bytes read, zero at the end of the
    /// stream, or -1 on failure.
    pub(crate) fn engine_read(&mut self, buffer: &mut [u8]) -> isize {
        match self.dh.as_mut() {
            None => {
                set_errno(libc::EBADF);
                -1
            },
            Some(Handle::Memory(c)) =>
                convention(c.read(buffer).map(|n| n as u64)) as isize,
            Some(Handle::File(f)) =>
                convention(f.read(buffer).map(|n| n as u64)) as isize,
            Some(Handle::Callbacks { cbs, stream }) => match cbs.read {
                Some(cb) => cb(stream.as_mut(), buffer),
                None => {
                    set_errno(libc::EBADF);
                    -1
                },
            },
        }
    }

    /// Pushes `buffer` from the engine.
    ///
    /// Returns the number of bytes written, or -1 on failure.
    pub(crate) fn engine_write(&mut self, buffer: &[u8]) -> isize {
        match self.dh.as_mut() {
            None => {
                set_errno(libc::EBADF);
                -1
            },
            Some(Handle::Memory(c)) =>
                convention(c.write(buffer).map(|n| n as u64)) as isize,
            Some(Handle::File(f)) =>
                convention(f.write(buffer).map(|n| n as u64)) as isize,
            Some(Handle::Callbacks { cbs, stream }) => match cbs.write {
                Some(cb) => cb(stream.as_mut(), buffer),
                None => {
                    set_errno(libc::EBADF);
                    -1
                },
            },
        }
    }

    /// Seeks on behalf of the engine.
    ///
    /// Returns the new position, or -1 on failure.
    pub(crate) fn engine_seek(&mut self, offset: i64, whence: i32) -> i64 {
        let pos = seek_from(offset, whence);
        match self.dh.as_mut() {
            None => {
                set_errno(libc::EBADF);
                -1
            },
            Some(Handle::Callbacks { cbs, stream }) => match cbs.seek {
                Some(cb) => cb(stream.as_mut(), offset, whence),
                None => {
                    set_errno(libc::EOPNOTSUPP);
                    -1
                },
            },
            Some(Handle::Memory(c)) => match pos {
                Some(pos) => convention(c.seek(pos)),
                None => invalid_whence(),
            },
            Some(Handle::File(f)) => match pos {
                Some(pos) => convention(f.seek(pos)),
                None => invalid_whence(),
            },
        }
    }

    /// Writes all of `buffer` on behalf of the engine.
    pub(crate) fn engine_write_all(&mut self, mut buffer: &[u8]) -> Result<()> {
        while ! buffer.is_empty() {
            match self.engine_write(buffer) {
                n if n < 0 => return Err(transport_error()),
                0 => return Err(Error::from_errno(libc::EIO)),
                n => buffer = &buffer[n as usize..],
            }
        }
        Ok(())
    }
}

impl Drop for Data<'_> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for Data<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Data")
            .field("kind", &self.dh.as_ref().map(|dh| dh.kind()))
            .field("file_name", &self.file_name)
            .finish()
    }
}

impl Read for Data<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.engine_read(buf) {
            n if n < 0 => Err(io::Error::from_raw_os_error(take_errno())),
            // Zero bytes without an error is end of stream.
            n => Ok(n as usize),
        }
    }
}

impl Write for Data<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.engine_write(buf) {
            n if n < 0 => Err(io::Error::from_raw_os_error(take_errno())),
            0 => Err(io::Error::new(io::ErrorKind::WriteZero,
                                    "data object accepted no bytes")),
            n => Ok(n as usize),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.dh.as_mut() {
            None => Err(io::Error::from_raw_os_error(libc::EBADF)),
            Some(Handle::Memory(_)) => Ok(()),
            Some(Handle::File(f)) => f.flush(),
            Some(Handle::Callbacks { stream, .. }) => match stream.writer() {
                Some(w) => w.flush(),
                None => Ok(()),
            },
        }
    }
}

impl Seek for Data<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, whence) = whence(pos)?;
        match self.engine_seek(offset, whence) {
            n if n < 0 => Err(io::Error::from_raw_os_error(take_errno())),
            n => Ok(n as u64),
        }
    }
}
