use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{copy_to_fixed, fixed_to_str};
use crate::region::Versioned;

pub const HOST_ALIAS_LEN: usize = 32;
pub const HOSTNAME_LEN: usize = 64;
pub const FILENAME_LEN: usize = 128;
pub const ERROR_HISTORY_LEN: usize = 8;
/// Job slots per host; also the ceiling for `allowed_transfers`.
pub const MAX_JOB_SLOTS: usize = 8;

/// Burst-marker values carried in `unique_name[2]`. The tag bytes [0..2]
/// hold a sortable epoch fragment; byte [2] doubles as the 3-way signal
/// between dispatcher and worker.
pub const UNIQUE_ORDINARY: u8 = 0;
pub const UNIQUE_BURST: u8 = 4;
pub const UNIQUE_KILLED: u8 = 5;

/// Build the sortable 3-byte tag for a job started at `now` (Unix seconds).
pub fn make_unique_tag(now: i64) -> [u8; 3] {
    let t = (now & 0xffff) as u16;
    let b = t.to_be_bytes();
    [b[0], b[1], UNIQUE_ORDINARY]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ConnectStatus {
    Disconnect = 0,
    Connecting = 1,
    FtpActive = 2,
    SftpActive = 3,
    HttpActive = 4,
    ExecActive = 5,
    DfaxActive = 6,
    ScpActive = 7,
    SmtpActive = 8,
    WmoActive = 9,
    Closing = 10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ProtocolFamily {
    Ftp = 0,
    Ftps = 1,
    Sftp = 2,
    Scp = 3,
    Http = 4,
    Https = 5,
    Smtp = 6,
    Wmo = 7,
    Exec = 8,
    Dfax = 9,
}

impl ProtocolFamily {
    /// The job-slot status a dialed connection of this family publishes.
    pub fn active_status(self) -> ConnectStatus {
        use ProtocolFamily::*;
        match self {
            Ftp | Ftps => ConnectStatus::FtpActive,
            Sftp => ConnectStatus::SftpActive,
            Scp => ConnectStatus::ScpActive,
            Http | Https => ConnectStatus::HttpActive,
            Smtp => ConnectStatus::SmtpActive,
            Wmo => ConnectStatus::WmoActive,
            Exec => ConnectStatus::ExecActive,
            Dfax => ConnectStatus::DfaxActive,
        }
    }

    /// Families whose codec keeps a reusable control connection and may take
    /// a burst continuation instead of disconnecting.
    pub fn supports_burst(self) -> bool {
        !matches!(self, ProtocolFamily::Exec | ProtocolFamily::Dfax)
    }
}

bitflags! {
    /// host_status word of an HSE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostFlags: u32 {
        const AUTO_PAUSED        = 1 << 0;
        const OFFLINE            = 1 << 1;
        const OFFLINE_TRANSIENT  = 1 << 2;
        const ERROR_QUEUE_SET    = 1 << 3;
        const ACTION_SUCCESS     = 1 << 4;
        /// 手动暂停（fd_cmd 下发）— manual pause via the command fifo.
        const PAUSED             = 1 << 5;
    }
}

bitflags! {
    /// Per-protocol option bits of an HSE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtoOptions: u32 {
        const PASSIVE_MODE             = 1 << 0;
        const IMPLICIT_TLS             = 1 << 1;
        /// Close instead of bursting once keep_connected elapses.
        const KEEP_CONNECTED_DISCONNECT = 1 << 2;
        const NO_BURST                 = 1 << 3;
        const USE_EXTENDED_LIST        = 1 << 4;
        /// Enforce transfer_timeout per file during streaming.
        const TIMEOUT_TRANSFER         = 1 << 5;
    }
}

/// 单个任务槽位 — per-job substructure of an HSE.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct JobSlot {
    pub connect_status: u8,
    pub unique_name: [u8; 3],
    pub job_id: u32,
    pub no_of_files: u32,
    pub no_of_files_done: u32,
    pub file_size: u64,
    pub file_size_done: u64,
    pub file_size_in_use: u64,
    pub file_size_in_use_done: u64,
    pub file_name_in_use: [u8; FILENAME_LEN],
}

impl JobSlot {
    pub fn status(&self) -> ConnectStatus {
        ConnectStatus::try_from(self.connect_status).unwrap_or(ConnectStatus::Disconnect)
    }

    pub fn set_status(&mut self, s: ConnectStatus) {
        self.connect_status = s.into();
    }

    pub fn is_active(&self) -> bool {
        self.status() != ConnectStatus::Disconnect
    }

    pub fn file_in_use(&self) -> String {
        fixed_to_str(&self.file_name_in_use)
    }

    pub fn set_file_in_use(&mut self, name: &str) {
        copy_to_fixed(&mut self.file_name_in_use, name);
    }

    /// Back to `Disconnect` with all transient counters cleared; persistent
    /// done-counters survive for the "what done" diff.
    pub fn reset(&mut self) {
        self.set_status(ConnectStatus::Disconnect);
        self.unique_name = [0; 3];
        self.job_id = 0;
        self.no_of_files = 0;
        self.file_size = 0;
        self.file_size_in_use = 0;
        self.file_size_in_use_done = 0;
        self.file_name_in_use.fill(0);
    }
}

/// Host Status Entry. One per destination host, mapped in the HSA region.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct HostEntry {
    pub version: u32,
    pub port: u16,
    pub host_toggle: u8,
    pub protocol: u8,
    pub alias: [u8; HOST_ALIAS_LEN],
    pub real_hostname: [[u8; HOSTNAME_LEN]; 2],
    pub proto_options: u32,
    pub block_size: u32,
    pub transfer_timeout: u32,
    pub rate_limit: u32,
    pub keep_connected: u32,
    pub disconnect_time: u32,
    pub max_errors: u32,
    pub allowed_transfers: u32,
    pub active_transfers: u32,
    pub error_counter: u32,
    pub error_history: [u8; ERROR_HISTORY_LEN],
    pub host_status: u32,
    pub debug_level: u32,
    pub trl_per_process: u32,
    pub connections: u32,
    pub jobs: [JobSlot; MAX_JOB_SLOTS],
}

impl Versioned for HostEntry {
    fn version(&self) -> u32 {
        self.version
    }
    fn set_version(&mut self, v: u32) {
        self.version = v;
    }
}

impl HostEntry {
    pub fn alias_str(&self) -> String {
        fixed_to_str(&self.alias)
    }

    pub fn set_alias(&mut self, alias: &str) {
        copy_to_fixed(&mut self.alias, alias);
    }

    pub fn hostname(&self, toggle: u8) -> String {
        fixed_to_str(&self.real_hostname[(toggle & 1) as usize])
    }

    pub fn set_hostname(&mut self, toggle: u8, name: &str) {
        copy_to_fixed(&mut self.real_hostname[(toggle & 1) as usize], name);
    }

    pub fn protocol(&self) -> ProtocolFamily {
        ProtocolFamily::try_from(self.protocol).unwrap_or(ProtocolFamily::Ftp)
    }

    pub fn flags(&self) -> HostFlags {
        HostFlags::from_bits_truncate(self.host_status)
    }

    pub fn set_flag(&mut self, flag: HostFlags, on: bool) {
        let mut f = self.flags();
        f.set(flag, on);
        self.host_status = f.bits();
    }

    pub fn options(&self) -> ProtoOptions {
        ProtoOptions::from_bits_truncate(self.proto_options)
    }

    pub fn is_paused(&self) -> bool {
        self.flags().intersects(HostFlags::AUTO_PAUSED | HostFlags::PAUSED | HostFlags::OFFLINE)
    }

    /// Count of job slots whose connect status is not Disconnect. Invariant:
    /// equals `active_transfers` whenever no update is in flight.
    pub fn active_from_slots(&self) -> u32 {
        self.jobs.iter().filter(|s| s.is_active()).count() as u32
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.jobs.iter().position(|s| !s.is_active())
    }

    /// Push an error code into the history ring, newest first.
    pub fn record_error(&mut self, code: u8) {
        self.error_history.rotate_right(1);
        self.error_history[0] = code;
        self.error_counter = self.error_counter.saturating_add(1);
    }

    /// Age out the oldest history bucket (dispatcher timer duty).
    pub fn rotate_error_history(&mut self) {
        self.error_history.rotate_left(1);
        self.error_history[ERROR_HISTORY_LEN - 1] = 0;
    }

    /// First-success recovery: counter and history are wiped together so
    /// `error_counter == 0` never coexists with a stale NOT_WORKING head.
    pub fn clear_errors(&mut self) {
        self.error_counter = 0;
        self.error_history.fill(0);
    }
}
