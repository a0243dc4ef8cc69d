//! Script Source Reader
//!
//! Reads script bytes from a path or an open descriptor.
//!
//! # Strategy:
//! - A shared advisory lock is held on paths while reading
//! - Regular files are mapped with `memmap2` and used in place
//! - Anything that cannot be mapped is read in a loop whose buffer starts at
//!   the file size rounded up to a page and doubles whenever it fills
//! - `EINTR` retries, `EAGAIN` waits for readiness in `poll(2)`

use anyhow::{Context, Result};
use memmap2::Mmap;
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::stat::fstat;
use nix::unistd::{self, SysconfVar};
use std::fs::File;
use std::io;
use std::ops::Deref;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd};
use std::path::Path;
use tracing::debug;

/// Script bytes, either mapped or owned.
#[derive(Debug)]
pub enum SourceBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for SourceBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => map,
            Self::Owned(bytes) => bytes,
        }
    }
}

impl SourceBytes {
    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped(_))
    }
}

/// Read the script at `path` under a shared lock.
pub fn read_path(path: &Path) -> Result<SourceBytes> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    lock_shared(&file).with_context(|| format!("Failed to lock {}", path.display()))?;

    // The lock is released when `file` closes.
    read_descriptor(file.as_fd()).with_context(|| format!("Failed to read {}", path.display()))
}

/// Read the script from a descriptor the caller keeps ownership of.
pub fn read_fd(fd: BorrowedFd<'_>) -> Result<SourceBytes> {
    read_descriptor(fd).with_context(|| format!("Failed to read descriptor {}", fd.as_raw_fd()))
}

/// The last path component, used as the unit name.
pub fn script_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// errno carried by an error chain, if any.
pub fn errno_of(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<io::Error>())
        .and_then(|io| io.raw_os_error())
        .unwrap_or(libc::EIO)
}

fn read_descriptor(fd: BorrowedFd<'_>) -> io::Result<SourceBytes> {
    let size = usize::try_from(fstat(fd.as_raw_fd())?.st_size).unwrap_or(0);

    if size > 0 {
        // SAFETY: the mapping is read-only; concurrent writers are held off
        // by the advisory lock when reading by path.
        match unsafe { Mmap::map(&fd) } {
            Ok(map) => {
                debug!(size, "Mapped script source");
                return Ok(SourceBytes::Mapped(map));
            }
            Err(err) => debug!(error = %err, "Mapping failed, falling back to read"),
        }
    }

    read_loop(fd, size).map(SourceBytes::Owned)
}

fn read_loop(fd: BorrowedFd<'_>, size_hint: usize) -> io::Result<Vec<u8>> {
    let page = page_size();
    let mut capacity = round_to_page(size_hint, page);
    let mut buf = vec![0u8; capacity];
    let mut len = 0;

    loop {
        if len == capacity {
            capacity *= 2;
            buf.resize(capacity, 0);
        }
        match unistd::read(fd.as_raw_fd(), &mut buf[len..]) {
            Ok(0) => break,
            Ok(n) => len += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => wait_readable(fd)?,
            Err(errno) => return Err(errno.into()),
        }
    }

    buf.truncate(len);
    debug!(len, capacity, "Read script source");
    Ok(buf)
}

fn round_to_page(size: usize, page: usize) -> usize {
    size.max(1).div_ceil(page) * page
}

fn page_size() -> usize {
    unistd::sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|page| usize::try_from(page).ok())
        .filter(|&page| page > 0)
        .unwrap_or(4096)
}

fn lock_shared(file: &File) -> io::Result<()> {
    loop {
        match flock(file.as_raw_fd(), FlockArg::LockShared) {
            Ok(()) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}

fn wait_readable(fd: BorrowedFd<'_>) -> io::Result<()> {
    let mut fds = [PollFd::new(&fd, PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, -1) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}
