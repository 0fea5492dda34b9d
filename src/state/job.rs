use std::path::PathBuf;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{copy_to_fixed, fixed_to_str};
use crate::region::Versioned;

pub const MSG_NAME_LEN: usize = 64;

/// `dir_index` sentinel for push jobs (no source directory).
pub const NO_DIR: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum JobState {
    Free = 0,
    Queued = 1,
    Running = 2,
    Retry = 3,
    Cancelled = 4,
}

bitflags! {
    /// Special-flag set of a job.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SpecialFlags: u8 {
        /// Retry of a previously failed job; claims RL entries exclusively.
        const OLD_ERROR_JOB          = 1 << 0;
        /// Auxiliary fetcher for a directory already owned by a scanner.
        const DISTRIBUTED_HELPER_JOB = 1 << 1;
        const EXEC_ONCE_ONLY         = 1 << 2;
        /// WMO-style: prepend the file name as a content header.
        const FILE_NAME_IS_HEADER    = 1 << 3;
        /// Byte-count mismatches log at DEBUG instead of WARN.
        const SILENT_NOT_LOCKED_FILE = 1 << 4;
        const TRANS_EXEC             = 1 << 5;
        /// Dial the alternate hostname of the pair.
        const TOGGLE_HOST            = 1 << 6;
        const RESEND_FROM_ARCHIVE    = 1 << 7;
    }
}

bitflags! {
    /// Which fingerprint components feed the duplicate check.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DupFlags: u8 {
        const NAME    = 1 << 0;
        const SIZE    = 1 << 1;
        const MTIME   = 1 << 2;
        /// SHA-256 over the file contents.
        const CONTENT = 1 << 3;
        /// On duplicate: delete the source instead of skipping it.
        const DELETE  = 1 << 6;
        /// On duplicate: only log, still transfer.
        const WARN_ONLY = 1 << 7;
    }
}

/// 任务状态记录 — durable job record in the JSA region; the dispatcher
/// re-admits surviving records after a restart.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct JobRecord {
    pub version: u32,
    pub job_id: u32,
    pub msg_name: [u8; MSG_NAME_LEN],
    pub host_index: u32,
    pub dir_index: u32,
    pub files: u32,
    pub retries: u32,
    pub bytes: u64,
    pub creation_time: i64,
    pub next_retry_time: i64,
    pub priority: u8,
    pub special_flags: u8,
    pub state: u8,
    pub _pad: [u8; 5],
}

impl Versioned for JobRecord {
    fn version(&self) -> u32 {
        self.version
    }
    fn set_version(&mut self, v: u32) {
        self.version = v;
    }
}

impl JobRecord {
    pub fn msg_name_str(&self) -> String {
        fixed_to_str(&self.msg_name)
    }

    pub fn set_msg_name(&mut self, name: &str) {
        copy_to_fixed(&mut self.msg_name, name);
    }

    pub fn job_state(&self) -> JobState {
        JobState::try_from(self.state).unwrap_or(JobState::Free)
    }

    pub fn set_state(&mut self, s: JobState) {
        self.state = s.into();
    }

    pub fn special(&self) -> SpecialFlags {
        SpecialFlags::from_bits_truncate(self.special_flags)
    }

    pub fn is_pull(&self) -> bool {
        self.dir_index != NO_DIR
    }
}

/// One spooled file inside a job.
#[derive(Debug, Clone)]
pub struct SpoolFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DupCheckParams {
    pub flags: DupFlags,
    /// Seconds a fingerprint stays valid; 0 disables the check entirely.
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Priority {
    pub base: u8,
    pub min: u8,
    pub max: u8,
}

impl Default for Priority {
    fn default() -> Self {
        Self { base: 5, min: 0, max: 9 }
    }
}

impl Priority {
    pub fn effective(&self, add: i8) -> u8 {
        let p = self.base as i16 + add as i16;
        p.clamp(self.min as i16, self.max as i16) as u8
    }
}

/// Transfer Job Descriptor: the transient, per-worker view of one job. All
/// process-wide context a worker needs travels through here instead of
/// globals.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub work_dir: PathBuf,
    pub job_slot: usize,
    pub host_index: usize,
    /// Pull jobs carry the DSE index; push jobs carry None.
    pub dir_index: Option<usize>,
    pub msg_name: String,
    pub job_id: u32,
    /// Login and destination directory for the remote side.
    pub user: String,
    pub password: Option<String>,
    pub target_dir: String,
    pub files: Vec<SpoolFile>,
    /// Seconds of archive retention; 0 disables archiving (files unlinked).
    pub archive_secs: u64,
    pub retries: u32,
    pub special: SpecialFlags,
    pub dup: DupCheckParams,
    pub priority: Priority,
    /// Drop files older than this many seconds before transfer.
    pub age_limit: Option<u64>,
}

impl JobDescriptor {
    /// Spool directory of a push job: `<work_dir>/outgoing/<msg_name>`.
    pub fn spool_dir(&self) -> PathBuf {
        self.work_dir.join("outgoing").join(&self.msg_name)
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}
