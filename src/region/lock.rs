use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

/// Named byte offsets in the host status region used as advisory lock words.
/// Every host owns an 8-byte stride; the individual bytes inside the stride
/// are the logical locks.
pub const LOCK_CON: u64 = 0;
pub const LOCK_EC: u64 = 1;
pub const LOCK_HS: u64 = 2;

pub fn host_lock_offset(host_index: usize, which: u64) -> u64 {
    host_index as u64 * 8 + which
}

/// Retrieve-list lock words: offset 0 guards bulk reset/shrink of the whole
/// list, offsets 8+i claim entry i.
pub const LOCK_RETR_PROC: u64 = 0;

pub fn retr_file_lock_offset(entry: usize) -> u64 {
    8 + entry as u64
}

/// Result of a non-blocking acquisition attempt.
pub enum TryLock {
    Granted(LockGuard),
    /// 已被其他进程持有 — held by another process.
    IsSet,
}

impl TryLock {
    pub fn granted(self) -> Option<LockGuard> {
        match self {
            TryLock::Granted(g) => Some(g),
            TryLock::IsSet => None,
        }
    }
}

/// fcntl(2) advisory byte-range locks over a region file. Locks are
/// per-process: a second acquisition from the same process never conflicts,
/// mutual exclusion is strictly between processes. The kernel drops all
/// locks of a dead process, which is what makes worker crashes recoverable.
///
/// The descriptor is shared into every guard so no guard drop ever closes
/// the file early (closing any fd of the inode would release every lock this
/// process holds on it).
pub struct RegionLocks {
    file: Arc<File>,
}

impl RegionLocks {
    /// Share the lock service with an already open region file.
    pub fn new(file: &File) -> io::Result<Self> {
        Ok(Self { file: Arc::new(file.try_clone()?) })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file: Arc::new(file) })
    }

    fn flock_at(offset: u64, l_type: libc::c_short) -> libc::flock {
        libc::flock {
            l_type,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: offset as libc::off_t,
            l_len: 1,
            l_pid: 0,
        }
    }

    /// Block until the byte at `offset` is granted. There is no built-in
    /// timeout; the timeout obligation sits with the caller's retry policy.
    pub fn lock(&self, offset: u64) -> io::Result<LockGuard> {
        let mut fl = Self::flock_at(offset, libc::F_WRLCK as libc::c_short);
        loop {
            let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_SETLKW, &mut fl) };
            if rc == 0 {
                return Ok(LockGuard { file: Arc::clone(&self.file), offset });
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
    }

    /// Non-blocking acquisition; `IsSet` when another process holds the byte.
    pub fn try_lock(&self, offset: u64) -> io::Result<TryLock> {
        let mut fl = Self::flock_at(offset, libc::F_WRLCK as libc::c_short);
        let rc = unsafe { libc::fcntl(self.file.as_raw_fd(), libc::F_SETLK, &mut fl) };
        if rc == 0 {
            return Ok(TryLock::Granted(LockGuard { file: Arc::clone(&self.file), offset }));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EACCES || code == libc::EAGAIN => Ok(TryLock::IsSet),
            _ => Err(err),
        }
    }
}

/// Releases its byte on drop so every exit path, including unwinds out of a
/// worker loop, gives the lock back. Kernel-side cleanup covers the paths no
/// destructor can reach (SIGKILL).
pub struct LockGuard {
    file: Arc<File>,
    offset: u64,
}

impl LockGuard {
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut fl = RegionLocks::flock_at(self.offset, libc::F_UNLCK as libc::c_short);
        unsafe {
            libc::fcntl(self.file.as_raw_fd(), libc::F_SETLK, &mut fl);
        }
    }
}
