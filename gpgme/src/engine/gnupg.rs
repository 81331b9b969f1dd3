//! Drives `gpg` and `gpgsm`.
//!
//! Every operation spawns the engine with its data on stdin and
//! stdout, a status channel (`--status-fd`), and, if a passphrase
//! relay is registered, a command channel (`--command-fd`) over which
//! we answer the engine's prompts.  The pipes are serviced by a
//! single-threaded `poll(2)` loop on the calling thread, which also
//! runs the data callbacks and the relay.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{
    Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio,
};

use log::{debug, trace, warn};

use super::{pipe, Engine, KeyListing, Options, Recipients};
use crate::data::transport_error;
use crate::mem::Protected;
use crate::passphrase::Relay;
use crate::{
    Data, EncryptFlags, Error, ErrorCode, Key, KeyListMode, PinentryMode,
    Protocol, Result,
};

/// Size of the transfer buffers.
const BUFFER_SIZE: usize = 8192;

/// Prefix of status lines.
const STATUS_PREFIX: &str = "[GNUPG:] ";

/// The GnuPG engine.
#[derive(Debug, Default)]
pub(crate) struct GnuPG(());

impl GnuPG {
    pub(crate) fn new() -> Self {
        GnuPG(())
    }
}

impl Engine for GnuPG {
    fn keylist(&mut self, options: &Options, pattern: &str, secret_only: bool)
               -> Result<KeyListing> {
        let inv = Invocation::keylist(options, pattern, secret_only)?;
        let mut listing = Data::new();
        let mut status = Status::default();
        let exit = run(&inv, None, None, Some(&mut listing), &mut status)?;

        let mut keys = super::colons::parse(
            options.protocol, options.key_list_mode,
            &listing.into_bytes().unwrap_or_default());
        if let Some(e) = status.keylist_error(exit) {
            keys.fail(e);
        }
        Ok(keys)
    }

    fn decrypt(&mut self, options: &Options, relay: Option<&mut Relay>,
               cipher: &mut Data, plain: &mut Data, verify: bool)
               -> Result<()> {
        let inv = Invocation::decrypt(options, relay.is_some())?;
        debug!("decrypting{}", if verify { " and verifying" } else { "" });
        let mut status = Status::default();
        let exit = run(&inv, relay, Some(cipher), Some(plain), &mut status)?;
        status.decrypt_result(exit)
    }

    fn encrypt(&mut self, options: &Options, relay: Option<&mut Relay>,
               recipients: &Recipients, flags: EncryptFlags,
               plain: &mut Data, cipher: &mut Data)
               -> Result<()> {
        let keys = super::recipients(recipients).collect::<Vec<_>>();
        let file_name = plain.file_name().map(String::from);
        let inv = Invocation::encrypt(options, relay.is_some(), &keys, flags,
                                      file_name.as_deref())?;
        let mut status = Status::default();
        let exit = run(&inv, relay, Some(plain), Some(cipher), &mut status)?;
        status.encrypt_result(exit)
    }
}

/// How to invoke the engine for an operation.
#[derive(Debug)]
struct Invocation {
    program: PathBuf,
    /// Global options, the status and command fds follow these.
    options: Vec<OsString>,
    /// The command and its arguments.
    args: Vec<OsString>,
    home_dir: Option<PathBuf>,
    command_channel: bool,
}

impl Invocation {
    fn new(options: &Options, relay: bool) -> Result<Self> {
        let protocol = options.protocol;
        if ! protocol.is_operational() {
            return Err(Error::new(ErrorCode::UNSUPPORTED_PROTOCOL));
        }

        // gpgsm has no command channel, it always uses pinentry.
        let command_channel = relay && protocol == Protocol::OpenPgp;

        let mut inv = Invocation {
            program: options.file_name(protocol),
            options: Vec::new(),
            args: Vec::new(),
            home_dir: options.home_dir(protocol).map(Into::into),
            command_channel,
        };

        inv.option("--batch").option("--no-tty");
        if protocol == Protocol::OpenPgp {
            inv.option("--charset").option("utf8")
                .option("--exit-on-status-write-error");
        }
        if let Some(h) = inv.home_dir.clone() {
            inv.option("--homedir").option(h);
        }
        if options.armor {
            inv.option("--armor");
        }

        let pinentry_mode = match options.pinentry_mode {
            PinentryMode::Default if command_channel => PinentryMode::Loopback,
            m => m,
        };
        if let Some(m) = pinentry_mode.argument() {
            inv.option("--pinentry-mode").option(m);
        }

        Ok(inv)
    }

    fn keylist(options: &Options, pattern: &str, secret_only: bool)
               -> Result<Self> {
        let mut inv = Self::new(options, false)?;
        let openpgp = options.protocol == Protocol::OpenPgp;
        let mode = options.key_list_mode;

        inv.arg("--with-colons");
        if openpgp {
            inv.arg("--fixed-list-mode");
        }
        // Twice, to get the fingerprints of subkeys too.
        inv.arg("--with-fingerprint").arg("--with-fingerprint")
            .arg("--with-keygrip");
        if mode.contains(KeyListMode::WITH_SECRET) {
            inv.arg("--with-secret");
        }
        if mode.contains(KeyListMode::EPHEMERAL) {
            inv.arg("--with-ephemeral-keys");
        }
        if mode.contains(KeyListMode::VALIDATE) && ! openpgp {
            inv.arg("--with-validation");
        }
        if mode.contains(KeyListMode::SIG_NOTATIONS) && openpgp {
            inv.arg("--list-options").arg("show-notations");
        }

        let local = mode.contains(KeyListMode::LOCAL);
        let external = mode.contains(KeyListMode::EXTERN);
        inv.arg(match (openpgp, external, local) {
            (true, true, false) => "--locate-external-keys",
            (true, true, true) => "--locate-keys",
            (false, true, _) => "--list-external-keys",
            _ if secret_only => "--list-secret-keys",
            (true, _, _) if mode.contains(KeyListMode::SIGS) => "--list-sigs",
            _ => "--list-keys",
        });

        inv.arg("--");
        if ! pattern.is_empty() {
            inv.arg(pattern);
        }
        Ok(inv)
    }

    fn decrypt(options: &Options, relay: bool) -> Result<Self> {
        let mut inv = Self::new(options, relay)?;
        if options.protocol == Protocol::OpenPgp {
            inv.arg("--output").arg("-");
        }
        inv.arg("--decrypt");
        Ok(inv)
    }

    fn encrypt(options: &Options, relay: bool, keys: &[&Key],
               flags: EncryptFlags, file_name: Option<&str>)
               -> Result<Self> {
        let openpgp = options.protocol == Protocol::OpenPgp;
        if keys.is_empty() && ! openpgp {
            // CMS has no symmetric encryption.
            return Err(Error::new(ErrorCode::NOT_IMPLEMENTED));
        }

        let mut inv = Self::new(options, relay)?;
        if openpgp {
            if flags.contains(EncryptFlags::ALWAYS_TRUST) {
                inv.arg("--always-trust");
            }
            if flags.contains(EncryptFlags::NO_ENCRYPT_TO) {
                inv.arg("--no-encrypt-to");
            }
            if flags.contains(EncryptFlags::NO_COMPRESS) {
                inv.arg("-z").arg("0");
            }
            if let Some(name) = file_name {
                inv.arg("--set-filename").arg(name);
            }
            inv.arg("--output").arg("-");
        }
        if flags.contains(EncryptFlags::PREPARE)
            || flags.contains(EncryptFlags::EXPECT_SIGN)
        {
            trace!("ignoring flags only UI servers understand: {:?}", flags);
        }

        if keys.is_empty() {
            inv.arg("--symmetric");
        } else {
            inv.arg("--encrypt");
            for k in keys {
                let id = k.fingerprint().or_else(|| k.key_id())
                    .ok_or_else(|| Error::new(ErrorCode::INV_VALUE))?;
                inv.arg("-r").arg(id);
            }
        }
        Ok(inv)
    }

    fn option<S: Into<OsString>>(&mut self, o: S) -> &mut Self {
        self.options.push(o.into());
        self
    }

    fn arg<S: Into<OsString>>(&mut self, a: S) -> &mut Self {
        self.args.push(a.into());
        self
    }
}

/// Runs the engine to completion.
fn run(inv: &Invocation, relay: Option<&mut Relay>,
       input: Option<&mut Data>, output: Option<&mut Data>,
       status: &mut Status)
       -> Result<ExitStatus> {
    let mut p = Process::spawn(inv, input.is_some(), output.is_some())?;
    match pump(&mut p, relay, input, output, status) {
        Ok(()) => {
            let exit = p.finish()?;
            debug!("{} exited with {}", inv.program.display(), exit);
            Ok(exit)
        },
        Err(e) => {
            debug!("aborting {}: {}", inv.program.display(), e);
            p.kill();
            Err(e)
        },
    }
}

/// A running engine.
struct Process {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    status: Option<File>,
    commands: CommandChannel,
}

impl Process {
    fn spawn(inv: &Invocation, stdin: bool, stdout: bool) -> Result<Self> {
        let (status_r, status_w) = pipe::pipe()?;
        let command = if inv.command_channel {
            Some(pipe::pipe()?)
        } else {
            None
        };

        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.options);
        cmd.arg("--status-fd").arg(status_w.as_raw_fd().to_string());
        let mut child_fds: Vec<RawFd> = vec![status_w.as_raw_fd()];
        if let Some((r, _)) = &command {
            cmd.arg("--command-fd").arg(r.as_raw_fd().to_string());
            child_fds.push(r.as_raw_fd());
        }
        cmd.args(&inv.args);
        if let Some(h) = &inv.home_dir {
            // https://dev.gnupg.org/T4496
            cmd.env("GNUPGHOME", h);
        }

        cmd.stdin(if stdin { Stdio::piped() } else { Stdio::null() });
        cmd.stdout(if stdout { Stdio::piped() } else { Stdio::null() });
        cmd.stderr(Stdio::piped());
        unsafe {
            cmd.pre_exec(move || {
                for fd in child_fds.iter() {
                    pipe::set_cloexec(*fd, false)?;
                }
                Ok(())
            });
        }

        debug!("running {} {:?} {:?}",
               inv.program.display(), inv.options, inv.args);
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                warn!("{}: {}", inv.program.display(), e);
                Error::new(ErrorCode::INV_ENGINE)
            } else {
                Error::from(e)
            }
        })?;

        // Close our copies of the child's ends.
        drop(status_w);
        let command = command.map(|(r, w)| {
            drop(r);
            w
        });

        let mut p = Process {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            status: Some(status_r),
            commands: CommandChannel::new(command),
        };
        if let Err(e) = p.set_nonblocking() {
            p.kill();
            return Err(e.into());
        }
        Ok(p)
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        if let Some(f) = &self.stdin {
            pipe::set_nonblocking(f)?;
        }
        if let Some(f) = &self.stdout {
            pipe::set_nonblocking(f)?;
        }
        if let Some(f) = &self.stderr {
            pipe::set_nonblocking(f)?;
        }
        if let Some(f) = &self.status {
            pipe::set_nonblocking(f)?;
        }
        if let Some(f) = &self.commands.fd {
            pipe::set_nonblocking(f)?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        self.status = None;
        self.commands = CommandChannel::new(None);
    }

    /// Waits for the engine to exit.
    fn finish(&mut self) -> Result<ExitStatus> {
        self.close();
        Ok(self.child.wait()?)
    }

    fn kill(&mut self) {
        self.close();
        if let Err(e) = self.child.kill() {
            trace!("killing the engine: {}", e);
        }
        let _ = self.child.wait();
    }
}

/// Pipes serviced by the pump.
#[derive(Clone, Copy, Debug)]
enum Source {
    Stdin,
    Stdout,
    Stderr,
    Status,
    Command,
}

fn retry(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.kind() == io::ErrorKind::Interrupted
}

fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// Shuttles data between the engine and the data objects until the
/// engine closes its output channels.
fn pump(p: &mut Process, mut relay: Option<&mut Relay>,
        mut input: Option<&mut Data>, mut output: Option<&mut Data>,
        status: &mut Status)
        -> Result<()> {
    let mut inbuf = vec![0; BUFFER_SIZE];
    let (mut in_pos, mut in_len) = (0, 0);
    let mut buf = vec![0; BUFFER_SIZE];
    let mut status_line = Vec::new();
    let mut stderr_line = Vec::new();

    loop {
        if p.stdin.is_some() && in_pos == in_len {
            let n = match input.as_mut() {
                Some(i) => i.engine_read(&mut inbuf),
                None => 0,
            };
            if n < 0 {
                return Err(transport_error());
            } else if n == 0 {
                trace!("end of input");
                p.stdin = None;
            } else {
                in_pos = 0;
                in_len = n as usize;
            }
        }

        if p.stdout.is_none() && p.stderr.is_none() && p.status.is_none() {
            break;
        }

        let mut fds = Vec::with_capacity(5);
        let mut sources = Vec::with_capacity(5);
        if let Some(f) = &p.stdin {
            fds.push(pollfd(f.as_raw_fd(), libc::POLLOUT));
            sources.push(Source::Stdin);
        }
        if let Some(f) = &p.stdout {
            fds.push(pollfd(f.as_raw_fd(), libc::POLLIN));
            sources.push(Source::Stdout);
        }
        if let Some(f) = &p.stderr {
            fds.push(pollfd(f.as_raw_fd(), libc::POLLIN));
            sources.push(Source::Stderr);
        }
        if let Some(f) = &p.status {
            fds.push(pollfd(f.as_raw_fd(), libc::POLLIN));
            sources.push(Source::Status);
        }
        if let Some(f) = p.commands.pending_fd() {
            fds.push(pollfd(f, libc::POLLOUT));
            sources.push(Source::Command);
        }

        let n = unsafe {
            libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1)
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }

        for (fd, source) in fds.iter().zip(sources.iter()) {
            if fd.revents == 0 {
                continue;
            }

            match source {
                Source::Stdin => if let Some(stdin) = p.stdin.as_mut() {
                    match stdin.write(&inbuf[in_pos..in_len]) {
                        Ok(n) => in_pos += n,
                        Err(e) if retry(&e) => (),
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                            debug!("engine stopped reading its input");
                            p.stdin = None;
                        },
                        Err(e) => return Err(e.into()),
                    }
                },

                Source::Stdout => if let Some(stdout) = p.stdout.as_mut() {
                    match stdout.read(&mut buf) {
                        Ok(0) => p.stdout = None,
                        Ok(n) => if let Some(o) = output.as_mut() {
                            o.engine_write_all(&buf[..n])?;
                        },
                        Err(e) if retry(&e) => (),
                        Err(e) => return Err(e.into()),
                    }
                },

                Source::Stderr => if let Some(stderr) = p.stderr.as_mut() {
                    match stderr.read(&mut buf) {
                        Ok(0) => {
                            p.stderr = None;
                            log_stderr(&mut stderr_line, true);
                        },
                        Ok(n) => {
                            stderr_line.extend_from_slice(&buf[..n]);
                            log_stderr(&mut stderr_line, false);
                        },
                        Err(e) if retry(&e) => (),
                        Err(e) => return Err(e.into()),
                    }
                },

                Source::Status => if let Some(s) = p.status.as_mut() {
                    match s.read(&mut buf) {
                        Ok(0) => {
                            p.status = None;
                            if ! status_line.is_empty() {
                                let line = std::mem::take(&mut status_line);
                                status.process(&line, relay.as_deref_mut(),
                                               &mut p.commands)?;
                            }
                        },
                        Ok(n) => {
                            status_line.extend_from_slice(&buf[..n]);
                            while let Some(i) =
                                status_line.iter().position(|&c| c == b'\n')
                            {
                                let line: Vec<u8> =
                                    status_line.drain(..=i).collect();
                                status.process(&line[..i],
                                               relay.as_deref_mut(),
                                               &mut p.commands)?;
                            }
                        },
                        Err(e) if retry(&e) => (),
                        Err(e) => return Err(e.into()),
                    }
                },

                Source::Command => p.commands.flush()?,
            }
        }
    }

    Ok(())
}

/// Logs complete lines of the engine's diagnostics.
fn log_stderr(buffer: &mut Vec<u8>, eof: bool) {
    while let Some(i) = buffer.iter().position(|&c| c == b'\n') {
        let line: Vec<u8> = buffer.drain(..=i).collect();
        debug!("engine: {}", String::from_utf8_lossy(&line[..i]));
    }
    if eof && ! buffer.is_empty() {
        debug!("engine: {}", String::from_utf8_lossy(buffer));
        buffer.clear();
    }
}

/// Answers to the engine's prompts.
#[derive(Debug)]
struct CommandChannel {
    fd: Option<File>,
    pending: VecDeque<Protected>,
    offset: usize,
}

impl CommandChannel {
    fn new(fd: Option<File>) -> Self {
        CommandChannel {
            fd,
            pending: VecDeque::new(),
            offset: 0,
        }
    }

    /// Returns the descriptor if there is something to write.
    fn pending_fd(&self) -> Option<RawFd> {
        if self.pending.is_empty() {
            None
        } else {
            self.fd.as_ref().map(|f| f.as_raw_fd())
        }
    }

    /// Queues a line and writes as much as possible.
    fn send(&mut self, line: Protected) -> Result<()> {
        if self.fd.is_none() {
            debug!("engine prompted without a command channel");
            return Ok(());
        }
        self.pending.push_back(line);
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        let fd = match self.fd.as_mut() {
            Some(fd) => fd,
            None => return Ok(()),
        };

        while let Some(line) = self.pending.front() {
            match fd.write(&line[self.offset..]) {
                Ok(n) => {
                    self.offset += n;
                    if self.offset == line.len() {
                        self.pending.pop_front();
                        self.offset = 0;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("engine closed its command channel");
                    self.fd = None;
                    self.pending.clear();
                    break;
                },
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Status codes that do not fail a key listing.
const BENIGN_KEYLIST_CODES: &[ErrorCode] = &[
    ErrorCode::NO_PUBKEY,
    ErrorCode::NO_SECKEY,
    ErrorCode::NOT_FOUND,
    ErrorCode::EOF,
];

/// What the engine told us on the status channel.
#[derive(Debug, Default)]
struct Status {
    uid_hint: Option<String>,
    passphrase_info: Option<String>,
    bad_passphrase: bool,
    decryption_failed: bool,
    decryption_okay: bool,
    no_seckey: bool,
    no_data: bool,
    failure: Option<u32>,
    recipient_error: Option<ErrorCode>,
}

impl Status {
    /// Handles a status line.
    fn process(&mut self, line: &[u8], relay: Option<&mut Relay>,
               commands: &mut CommandChannel)
               -> Result<()> {
        let line = String::from_utf8_lossy(line);
        let line = match line.strip_prefix(STATUS_PREFIX) {
            Some(l) => l.trim_end_matches('\r'),
            None => {
                trace!("ignoring {:?} on the status channel", line);
                return Ok(());
            },
        };
        let (keyword, args) = match line.find(' ') {
            Some(i) => (&line[..i], &line[i + 1..]),
            None => (line, ""),
        };
        trace!("status: {} {}", keyword, args);

        match keyword {
            "USERID_HINT" => self.uid_hint = Some(args.into()),
            "NEED_PASSPHRASE" | "NEED_PASSPHRASE_SYM" | "NEED_PASSPHRASE_PIN" =>
                self.passphrase_info = Some(args.into()),
            "BAD_PASSPHRASE" => self.bad_passphrase = true,
            "GOOD_PASSPHRASE" => self.bad_passphrase = false,

            "GET_HIDDEN" if args == "passphrase.enter" => {
                let secret = match relay {
                    Some(relay) => relay.request(self.uid_hint.as_deref(),
                                                 self.passphrase_info.as_deref(),
                                                 self.bad_passphrase)?,
                    None => Protected::from(&b"\n"[..]),
                };
                commands.send(secret)?;
            },
            "GET_HIDDEN" | "GET_BOOL" | "GET_LINE" => {
                debug!("answering {} {} with the default", keyword, args);
                commands.send(Protected::from(&b"\n"[..]))?;
            },

            "DECRYPTION_FAILED" => self.decryption_failed = true,
            "DECRYPTION_OKAY" => self.decryption_okay = true,
            "NO_SECKEY" => self.no_seckey = true,
            "NODATA" => self.no_data = true,

            "INV_RECP" => if self.recipient_error.is_none() {
                let reason = args.split_whitespace().next().unwrap_or("0");
                self.recipient_error = Some(match reason {
                    "1" => ErrorCode::NO_PUBKEY,
                    _ => ErrorCode::UNUSABLE_PUBKEY,
                });
            },
            "NO_RECP" => if self.recipient_error.is_none() {
                self.recipient_error = Some(ErrorCode::NO_PUBKEY);
            },

            "ERROR" | "FAILURE" => {
                let mut a = args.split_whitespace();
                let location = a.next().unwrap_or("");
                let code = a.next().and_then(|c| c.parse::<u32>().ok());
                match code {
                    // Summarizes the exit status.
                    _ if location == "gpg-exit" => (),
                    Some(c) if c & 0xffff != 0 && self.failure.is_none() => {
                        debug!("{} {}: {}", keyword, location,
                               Error::from_raw(c));
                        self.failure = Some(c);
                    },
                    _ => (),
                }
            },

            "GOODSIG" | "BADSIG" | "ERRSIG" | "VALIDSIG" | "EXPSIG"
                | "EXPKEYSIG" | "REVKEYSIG" =>
                debug!("signature status: {} {}", keyword, args),

            _ => (),
        }
        Ok(())
    }

    fn decrypt_result(&self, exit: ExitStatus) -> Result<()> {
        if self.decryption_okay && ! self.decryption_failed {
            return Ok(());
        }
        if self.no_seckey && self.decryption_failed {
            return Err(Error::new(ErrorCode::NO_SECKEY));
        }
        if self.bad_passphrase {
            return Err(Error::new(ErrorCode::BAD_PASSPHRASE));
        }
        if let Some(raw) = self.failure {
            return Err(Error::from_raw(raw));
        }
        if self.no_data {
            return Err(Error::new(ErrorCode::NO_DATA));
        }
        if self.decryption_failed || ! exit.success() {
            return Err(Error::new(ErrorCode::DECRYPT_FAILED));
        }
        Ok(())
    }

    fn encrypt_result(&self, exit: ExitStatus) -> Result<()> {
        if let Some(code) = self.recipient_error {
            return Err(Error::new(code));
        }
        if let Some(raw) = self.failure {
            return Err(Error::from_raw(raw));
        }
        if ! exit.success() {
            return Err(Error::new(ErrorCode::GENERAL));
        }
        Ok(())
    }

    /// Returns the error ending a key listing, if any.
    ///
    /// The exit status is ignored unless the engine died.
    fn keylist_error(&self, exit: ExitStatus) -> Option<Error> {
        if exit.code().is_none() {
            return Some(Error::new(ErrorCode::GENERAL));
        }
        self.failure.map(Error::from_raw)
            .filter(|e| ! BENIGN_KEYLIST_CODES.contains(&e.code()))
    }
}
