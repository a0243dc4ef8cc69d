//! I/O Redirect Registry
//!
//! Scripts read and write named handles.  `STDIN`, `STDOUT` and `STDERR`
//! start out backed by the process descriptors.  The host can replace any
//! name with a callback-backed handle through [`IoCallbacks`].
//!
//! # Contract:
//! - Reads and writes go to the callbacks verbatim, and the callback's
//!   return value is the exact byte count
//! - Closing runs `on_close` before the stream is released
//! - A close that arrives while the same handle is already closing is ignored
//! - Replacing `STDERR` keeps OS descriptor 2 intact across the close

use super::Interp;
use crate::error::{RuntimeError, RuntimeResult};
use crate::handle::{HandleTable, Key};
use nix::errno::Errno;
use nix::unistd;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::{debug, warn};

/// Called with a buffer to fill; returns bytes produced, 0 at end of input,
/// negative on error.
pub type ReadCallback = Box<dyn FnMut(&mut [u8]) -> isize>;
/// Called with bytes to consume; returns bytes consumed, negative on error.
pub type WriteCallback = Box<dyn FnMut(&[u8]) -> isize>;
/// Called once when the handle closes.
pub type CloseCallback = Box<dyn FnOnce()>;

const READ_CHUNK: usize = 4096;

/// Host callbacks backing a redirected handle.
///
/// State the callbacks share (the "user data" of the handle) is whatever
/// the closures capture.
#[derive(Default)]
pub struct IoCallbacks {
    read: Option<ReadCallback>,
    write: Option<WriteCallback>,
    close: Option<CloseCallback>,
}

impl IoCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_read(mut self, f: impl FnMut(&mut [u8]) -> isize + 'static) -> Self {
        self.read = Some(Box::new(f));
        self
    }

    pub fn on_write(mut self, f: impl FnMut(&[u8]) -> isize + 'static) -> Self {
        self.write = Some(Box::new(f));
        self
    }

    pub fn on_close(mut self, f: impl FnOnce() + 'static) -> Self {
        self.close = Some(Box::new(f));
        self
    }

    /// Open mode implied by the callbacks present: `+<`, `<` or `>`.
    pub fn mode(&self) -> Option<&'static str> {
        match (self.read.is_some(), self.write.is_some()) {
            (true, true) => Some("+<"),
            (true, false) => Some("<"),
            (false, true) => Some(">"),
            (false, false) => None,
        }
    }
}

enum Backend {
    Fd(RawFd),
    Callbacks {
        read: Option<ReadCallback>,
        write: Option<WriteCallback>,
    },
}

impl Backend {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, String> {
        match self {
            Self::Fd(fd) => loop {
                match unistd::read(*fd, buf) {
                    Ok(n) => return Ok(n),
                    Err(Errno::EINTR) => continue,
                    Err(err) => return Err(err.to_string()),
                }
            },
            Self::Callbacks {
                read: Some(read), ..
            } => {
                let n = read(buf);
                usize::try_from(n).map_err(|_| format!("read callback returned {n}"))
            }
            Self::Callbacks { read: None, .. } => Err("handle is not open for input".into()),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, String> {
        match self {
            Self::Fd(fd) => {
                let mut written = 0;
                while written < bytes.len() {
                    match unistd::write(*fd, &bytes[written..]) {
                        Ok(0) => return Err("descriptor accepted no bytes".into()),
                        Ok(n) => written += n,
                        Err(Errno::EINTR) => continue,
                        Err(err) => return Err(err.to_string()),
                    }
                }
                Ok(written)
            }
            Self::Callbacks {
                write: Some(write), ..
            } => {
                let n = write(bytes);
                usize::try_from(n).map_err(|_| format!("write callback returned {n}"))
            }
            Self::Callbacks { write: None, .. } => Err("handle is not open for output".into()),
        }
    }
}

pub(crate) struct Stream {
    name: String,
    mode: &'static str,
    key: Option<Key>,
    backend: RefCell<Backend>,
    on_close: Cell<Option<CloseCallback>>,
    pending: RefCell<Vec<u8>>,
}

impl Stream {
    fn builtin(name: &str, fd: RawFd, mode: &'static str) -> Self {
        Self {
            name: name.to_string(),
            mode,
            key: None,
            backend: RefCell::new(Backend::Fd(fd)),
            on_close: Cell::new(None),
            pending: RefCell::new(Vec::new()),
        }
    }
}

/// Named streams of one runtime.
pub(crate) struct IoRegistry {
    streams: HashMap<String, Rc<Stream>>,
    handles: HandleTable<String>,
}

impl IoRegistry {
    pub(crate) fn new() -> Self {
        let mut streams = HashMap::new();
        for (name, fd, mode) in [
            ("STDIN", libc::STDIN_FILENO, "<"),
            ("STDOUT", libc::STDOUT_FILENO, ">"),
            ("STDERR", libc::STDERR_FILENO, ">"),
        ] {
            streams.insert(name.to_string(), Rc::new(Stream::builtin(name, fd, mode)));
        }
        Self {
            streams,
            handles: HandleTable::new(),
        }
    }

    fn stream(&self, name: &str) -> Option<Rc<Stream>> {
        self.streams.get(name).cloned()
    }

    pub(crate) fn is_open(&self, name: &str) -> bool {
        self.streams.contains_key(name)
    }

    pub(crate) fn mode(&self, name: &str) -> Option<&'static str> {
        self.streams.get(name).map(|s| s.mode)
    }

    pub(crate) fn name_of(&self, key: Key) -> Option<String> {
        self.handles.get(key).cloned()
    }

    /// Names of every host-installed handle, oldest first.
    fn redirected(&self) -> Vec<String> {
        self.handles
            .keys_in_order()
            .into_iter()
            .filter_map(|key| self.handles.get(key).cloned())
            .collect()
    }
}

impl Default for IoRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Install `callbacks` under `name`, closing any open handle of that name.
pub(crate) fn override_handle(
    interp: &Interp,
    name: &str,
    callbacks: IoCallbacks,
) -> RuntimeResult<Key> {
    let mode = callbacks
        .mode()
        .ok_or_else(|| RuntimeError::NoCallbacks(name.to_string()))?;

    if interp.io.borrow().is_open(name) {
        if name == "STDERR" {
            close_preserving_stderr(interp, name)?;
        } else {
            close(interp, name);
        }
    }

    let mut io = interp.io.borrow_mut();
    let key = io.handles.insert(name.to_string());
    let stream = Stream {
        name: name.to_string(),
        mode,
        key: Some(key),
        backend: RefCell::new(Backend::Callbacks {
            read: callbacks.read,
            write: callbacks.write,
        }),
        on_close: Cell::new(callbacks.close),
        pending: RefCell::new(Vec::new()),
    };
    io.streams.insert(name.to_string(), Rc::new(stream));
    debug!(name, mode, "I/O handle redirected");
    Ok(key)
}

/// Close the handle whose closing callback may touch descriptor 2, keeping
/// the descriptor itself alive for other writers.
fn close_preserving_stderr(interp: &Interp, name: &str) -> RuntimeResult<()> {
    let saved = unistd::dup(libc::STDERR_FILENO)?;
    close(interp, name);
    let restored = unistd::dup2(saved, libc::STDERR_FILENO);
    unistd::close(saved)?;
    restored?;
    Ok(())
}

/// Close `name`.  Returns `false` if it was not open, which is also what a
/// re-entrant close of a handle already being closed sees.
pub(crate) fn close(interp: &Interp, name: &str) -> bool {
    let stream = {
        let mut io = interp.io.borrow_mut();
        let Some(stream) = io.streams.remove(name) else {
            return false;
        };
        if let Some(key) = stream.key {
            io.handles.remove(key);
        }
        stream
    };

    if let Some(on_close) = stream.on_close.take() {
        debug!(name = %stream.name, "Running close callback");
        on_close();
    }
    debug!(name = %stream.name, "I/O handle closed");
    true
}

/// Close every host-installed handle.
pub(crate) fn close_all(interp: &Interp) {
    let names = interp.io.borrow().redirected();
    for name in names {
        close(interp, &name);
    }
}

/// Write `text` to `name`, returning the byte count the handle reported.
pub(crate) fn write(interp: &Interp, name: &str, text: &str) -> Result<usize, String> {
    let stream = interp
        .io
        .borrow()
        .stream(name)
        .ok_or_else(|| format!("write() on unopened handle {name}"))?;

    let bytes = encode(interp, name, text);
    let mut backend = stream
        .backend
        .try_borrow_mut()
        .map_err(|_| format!("handle {name} is busy"))?;
    backend.write(&bytes).map_err(|e| format!("write to {name} failed: {e}"))
}

/// Read up to `max` bytes from `name`.  `None` at end of input.
///
/// On a UTF-8 channel a character is never split: a trailing partial
/// sequence waits in the buffer for the rest of its bytes, and a single
/// character wider than `max` is returned whole.
pub(crate) fn read(interp: &Interp, name: &str, max: usize) -> Result<Option<String>, String> {
    let stream = interp
        .io
        .borrow()
        .stream(name)
        .ok_or_else(|| format!("read() on unopened handle {name}"))?;

    let mut pending = stream
        .pending
        .try_borrow_mut()
        .map_err(|_| format!("handle {name} is busy"))?;
    if max == 0 {
        return Ok(Some(String::new()));
    }

    let utf8 = interp.config.utf8_input(name);
    let mut eof = false;
    loop {
        if !pending.is_empty() {
            let take = if utf8 {
                utf8_take(&pending, max, eof)
            } else {
                Some(pending.len().min(max))
            };
            if let Some(take) = take {
                let bytes: Vec<u8> = pending.drain(..take).collect();
                return Ok(Some(decode(interp, name, &bytes)));
            }
        } else if eof {
            return Ok(None);
        }

        let mut buf = vec![0u8; max];
        let n = fill(&stream, name, &mut buf)?;
        if n == 0 {
            eof = true;
        } else {
            pending.extend_from_slice(&buf[..n]);
        }
    }
}

/// Read one line from `name`, newline included.  `None` at end of input.
pub(crate) fn read_line(interp: &Interp, name: &str) -> Result<Option<String>, String> {
    let stream = interp
        .io
        .borrow()
        .stream(name)
        .ok_or_else(|| format!("read_line() on unopened handle {name}"))?;

    let mut pending = stream
        .pending
        .try_borrow_mut()
        .map_err(|_| format!("handle {name} is busy"))?;
    loop {
        if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            return Ok(Some(decode(interp, name, &line)));
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = fill(&stream, name, &mut chunk)?;
        if n == 0 {
            if pending.is_empty() {
                return Ok(None);
            }
            let rest: Vec<u8> = pending.drain(..).collect();
            return Ok(Some(decode(interp, name, &rest)));
        }
        pending.extend_from_slice(&chunk[..n]);
    }
}

fn fill(stream: &Stream, name: &str, buf: &mut [u8]) -> Result<usize, String> {
    let mut backend = stream
        .backend
        .try_borrow_mut()
        .map_err(|_| format!("handle {name} is busy"))?;
    backend.read(buf).map_err(|e| format!("read from {name} failed: {e}"))
}

/// How many bytes of `pending` a UTF-8 read of at most `max` bytes takes.
/// `None` while the first character is still incomplete and more input
/// may follow.
fn utf8_take(pending: &[u8], max: usize, eof: bool) -> Option<usize> {
    let take = pending.len().min(max);
    let complete = utf8_boundary(&pending[..take]);
    if complete > 0 {
        return Some(complete);
    }
    if utf8_boundary(pending) > 0 {
        return (take + 1..=pending.len()).find(|&n| utf8_boundary(&pending[..n]) > 0);
    }
    eof.then_some(pending.len())
}

/// Length of the longest prefix of `bytes` that does not stop inside a
/// multibyte sequence.  Invalid bytes count as complete.
fn utf8_boundary(bytes: &[u8]) -> usize {
    let mut start = 0;
    loop {
        match std::str::from_utf8(&bytes[start..]) {
            Ok(_) => return bytes.len(),
            Err(err) => match err.error_len() {
                Some(len) => start += err.valid_up_to() + len,
                None => return start + err.valid_up_to(),
            },
        }
    }
}

/// Encode for an output channel: UTF-8 when the channel is flagged,
/// otherwise one byte per character.  Wider characters force UTF-8 and a
/// diagnostic.
fn encode(interp: &Interp, name: &str, text: &str) -> Vec<u8> {
    if interp.config.utf8_output(name) {
        return text.as_bytes().to_vec();
    }
    if text.chars().all(|c| (c as u32) <= 0xFF) {
        return text.chars().map(|c| c as u32 as u8).collect();
    }
    warn!(name, "Wide character in write");
    interp.diagnostic(&format!("Wide character in write to {name}"));
    text.as_bytes().to_vec()
}

fn decode(interp: &Interp, name: &str, bytes: &[u8]) -> String {
    if interp.config.utf8_input(name) {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}
