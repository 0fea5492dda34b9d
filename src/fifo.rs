use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::DispatchError;
use crate::state::{copy_to_fixed, fixed_to_str};

pub const FIFO_NAME_LEN: usize = 64;
pub const RECORD_SIZE: usize = std::mem::size_of::<FifoMessage>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MsgKind {
    /// New job descriptor (producers → dispatcher).
    Job = 1,
    /// Worker terminator record (worker → dispatcher, via sf_fin).
    WorkerFin = 2,
    /// Re-queue a failed job for later.
    Retry = 3,
    /// Cancel queued jobs.
    DeleteJob = 4,
    /// One byte worth of "poll the queue now".
    WakeUp = 5,
    /// Asynchronous operator command (see `Command`).
    Command = 6,
    /// Structured transfer event broadcast.
    TransLog = 7,
    /// Recalculate per-process rate limits.
    TrlCalc = 8,
    /// Burst continuation for a connected worker.
    Burst = 9,
    /// Ask a bursting worker to disconnect instead.
    Disconnect = 10,
}

/// Operator commands carried in `payload_a` of a `Command` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum Command {
    Shutdown = 1,
    ReloadConfig = 2,
    PauseHost = 3,
    ResumeHost = 4,
    PauseAll = 5,
    ResumeAll = 6,
    DebugOn = 7,
    DebugOff = 8,
    DumpState = 9,
}

/// 固定长度的 fifo 记录 — every fifo carries records of exactly this shape;
/// writers emit one record per write(2), readers reassemble across short
/// reads.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FifoMessage {
    pub kind: u8,
    pub host_slot: u8,
    pub job_slot: u8,
    pub flags: u8,
    pub payload_a: u32,
    pub payload_b: u32,
    pub name: [u8; FIFO_NAME_LEN],
}

impl FifoMessage {
    pub fn new(kind: MsgKind) -> Self {
        let mut m = Self::read_from_bytes(&[0u8; RECORD_SIZE][..]).expect("zeroed record");
        m.kind = kind.into();
        m
    }

    pub fn with_name(kind: MsgKind, name: &str) -> Self {
        let mut m = Self::new(kind);
        m.set_name(name);
        m
    }

    pub fn msg_kind(&self) -> Option<MsgKind> {
        MsgKind::try_from(self.kind).ok()
    }

    pub fn name_str(&self) -> String {
        fixed_to_str(&self.name)
    }

    pub fn set_name(&mut self, name: &str) {
        copy_to_fixed(&mut self.name, name);
    }
}

/// One named pipe, opened read-write so writes never block for lack of a
/// reader at startup, non-blocking in both directions.
pub struct Fifo {
    path: PathBuf,
    file: File,
    pending: Vec<u8>,
}

impl Fifo {
    /// Create the fifo node if missing, then open it.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, DispatchError> {
        let p = path.as_ref();
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DispatchError::FifoCreateFailed(p.display().to_string(), e.to_string()))?;
        }
        match nix::unistd::mkfifo(p, nix::sys::stat::Mode::from_bits_truncate(0o660)) {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => {
                return Err(DispatchError::FifoCreateFailed(p.display().to_string(), e.to_string()));
            }
        }
        Self::open(p)
    }

    /// Open an existing fifo node.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DispatchError> {
        let p = path.as_ref();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(p)
            .map_err(|e| DispatchError::FifoCreateFailed(p.display().to_string(), e.to_string()))?;
        Ok(Self { path: p.to_path_buf(), file, pending: Vec::new() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Drain whatever is currently readable into complete records. Short
    /// reads stay buffered until the remainder arrives.
    pub fn read_records(&mut self) -> io::Result<Vec<FifoMessage>> {
        let mut buf = [0u8; RECORD_SIZE * 16];
        loop {
            match (&self.file).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let mut out = Vec::new();
        while self.pending.len() >= RECORD_SIZE {
            let rec = FifoMessage::read_from_bytes(&self.pending[..RECORD_SIZE])
                .expect("record-sized slice");
            self.pending.drain(..RECORD_SIZE);
            out.push(rec);
        }
        Ok(out)
    }

    /// Best-effort non-blocking write of one record. A would-block here means
    /// the reader has stalled far enough to fill the pipe; that is a fatal
    /// programming error on the reader side.
    pub fn write_record(&self, msg: &FifoMessage) -> Result<(), DispatchError> {
        let name = self.path.file_name().map(|s| s.to_string_lossy().to_string());
        match (&self.file).write(msg.as_bytes()) {
            Ok(n) if n == RECORD_SIZE => Ok(()),
            Ok(_) | Err(_) => {
                let fifo = name.unwrap_or_else(|| self.path.display().to_string());
                tracing::error!("[fifo] FATAL 写入溢出: {}", fifo);
                Err(DispatchError::FifoOverflow(fifo))
            }
        }
    }

    /// The wake-up pipe carries meaning by arrival, not content.
    pub fn write_wakeup(&self) {
        let _ = (&self.file).write(&[1u8]);
    }

    /// Discard any bytes currently in the pipe (wake-up drain).
    pub fn drain_bytes(&mut self) {
        let mut buf = [0u8; 256];
        while let Ok(n) = (&self.file).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
        self.pending.clear();
    }
}

/// The fixed fifo set under `<work_dir>/fifo/`, opened in one consistent
/// order: commands first, then the inbound job/termination pipes, then the
/// auxiliary ones. Each fifo is opened exactly once.
pub struct FifoSet {
    pub fd_cmd: Fifo,
    pub wake_up: Fifo,
    pub msg: Fifo,
    pub sf_fin: Fifo,
    pub retry: Fifo,
    pub delete_jobs: Fifo,
    pub transfer_log: Fifo,
    pub trl_calc: Fifo,
}

impl FifoSet {
    pub fn fifo_dir(work_dir: &Path) -> PathBuf {
        work_dir.join("fifo")
    }

    pub fn create(work_dir: &Path) -> Result<Self, DispatchError> {
        let dir = Self::fifo_dir(work_dir);
        Ok(Self {
            fd_cmd: Fifo::create(dir.join("spd_cmd"))?,
            wake_up: Fifo::create(dir.join("spd_wake_up"))?,
            msg: Fifo::create(dir.join("msg"))?,
            sf_fin: Fifo::create(dir.join("sf_fin"))?,
            retry: Fifo::create(dir.join("retry"))?,
            delete_jobs: Fifo::create(dir.join("delete_jobs"))?,
            transfer_log: Fifo::create(dir.join("transfer_log"))?,
            trl_calc: Fifo::create(dir.join("trl_calc"))?,
        })
    }

    /// Per-job burst fifo, created by the dispatcher before the worker
    /// spawns and removed when the slot resets.
    pub fn burst_fifo_path(work_dir: &Path, host_index: usize, job_slot: usize) -> PathBuf {
        Self::fifo_dir(work_dir).join(format!("burst_{}_{}", host_index, job_slot))
    }
}

/// Wait until any of `files` is readable. Returns the indices that fired;
/// empty on timeout or EINTR (callers just loop).
pub fn wait_readable(files: &[&File], timeout_ms: u16) -> io::Result<Vec<usize>> {
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
    let mut fds: Vec<PollFd> =
        files.iter().map(|f| PollFd::new(f.as_fd(), PollFlags::POLLIN)).collect();
    match poll(&mut fds, PollTimeout::from(timeout_ms)) {
        Ok(0) => Ok(Vec::new()),
        Ok(_) => Ok(fds
            .iter()
            .enumerate()
            .filter(|(_, fd)| {
                fd.revents().map(|r| r.contains(PollFlags::POLLIN)).unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect()),
        Err(nix::errno::Errno::EINTR) => Ok(Vec::new()),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_size_is_fixed() {
        assert_eq!(RECORD_SIZE, 76);
    }

    #[test]
    fn message_name_round_trip() {
        let mut m = FifoMessage::with_name(MsgKind::Job, "enceladus_99");
        m.payload_a = 3;
        assert_eq!(m.msg_kind(), Some(MsgKind::Job));
        assert_eq!(m.name_str(), "enceladus_99");
        let raw = m.as_bytes().to_vec();
        let back = FifoMessage::read_from_bytes(&raw[..]).unwrap();
        assert_eq!(back.name_str(), "enceladus_99");
        assert_eq!(back.payload_a, 3);
    }

    #[test]
    fn fifo_write_then_read_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t_fifo");
        let mut fifo = Fifo::create(&path).unwrap();
        let writer = Fifo::open(&path).unwrap();
        let mut m = FifoMessage::with_name(MsgKind::Retry, "rhea_7");
        m.host_slot = 2;
        m.job_slot = 1;
        writer.write_record(&m).unwrap();
        writer.write_record(&FifoMessage::new(MsgKind::WakeUp)).unwrap();
        let recs = fifo.read_records().unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].msg_kind(), Some(MsgKind::Retry));
        assert_eq!(recs[0].host_slot, 2);
        assert_eq!(recs[1].msg_kind(), Some(MsgKind::WakeUp));
    }

    #[test]
    fn partial_record_stays_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p_fifo");
        let mut fifo = Fifo::create(&path).unwrap();
        let m = FifoMessage::with_name(MsgKind::DeleteJob, "iapetus_1");
        let bytes = m.as_bytes();
        // write a torn record in two halves; only the completed one parses
        {
            use std::io::Write as _;
            (&fifo.file).write_all(&bytes[..30]).unwrap();
        }
        assert!(fifo.read_records().unwrap().is_empty());
        {
            use std::io::Write as _;
            (&fifo.file).write_all(&bytes[30..]).unwrap();
        }
        let recs = fifo.read_records().unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].name_str(), "iapetus_1");
    }

    #[test]
    fn fifo_set_creates_all_nodes_once() {
        let dir = tempfile::tempdir().unwrap();
        let set = FifoSet::create(dir.path()).unwrap();
        for name in
            ["spd_cmd", "spd_wake_up", "msg", "sf_fin", "retry", "delete_jobs", "transfer_log", "trl_calc"]
        {
            assert!(FifoSet::fifo_dir(dir.path()).join(name).exists(), "{}", name);
        }
        drop(set);
        // reopening over existing nodes is fine
        let _again = FifoSet::create(dir.path()).unwrap();
    }

    #[test]
    fn wakeup_bytes_drain() {
        let dir = tempfile::tempdir().unwrap();
        let mut fifo = Fifo::create(dir.path().join("w_fifo")).unwrap();
        fifo.write_wakeup();
        fifo.write_wakeup();
        let ready = wait_readable(&[fifo.file()], 10).unwrap();
        assert_eq!(ready, vec![0]);
        fifo.drain_bytes();
        let ready = wait_readable(&[fifo.file()], 0).unwrap();
        assert!(ready.is_empty());
    }
}
