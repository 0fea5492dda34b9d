pub mod auth;
pub mod local;
pub mod sftp;

use std::time::Instant;

use crate::error::ExitStatus;
use crate::state::host::{ProtoOptions, ProtocolFamily};

/// Operation classes a codec failure can come from; each maps onto the
/// worker exit-code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecErrorKind {
    Connect,
    OpenRemote,
    WriteRemote,
    CloseRemote,
    ReadRemote,
    List,
    Date,
    Timeout,
    Exec,
}

#[derive(Debug, Clone)]
pub struct CodecError {
    pub kind: CodecErrorKind,
    pub detail: String,
}

impl CodecError {
    pub fn new(kind: CodecErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }

    /// 超时与对端断开的区分 — timeout wins over the underlying error kind
    /// once the deadline has passed; a peer reset keeps its operation class.
    pub fn eval_timeout(kind: CodecErrorKind, detail: impl Into<String>, deadline: Instant) -> Self {
        if Instant::now() >= deadline {
            Self::new(CodecErrorKind::Timeout, detail)
        } else {
            Self::new(kind, detail)
        }
    }

    pub fn exit_status(&self) -> ExitStatus {
        match self.kind {
            CodecErrorKind::Connect => ExitStatus::ConnectError,
            CodecErrorKind::OpenRemote => ExitStatus::OpenRemoteError,
            CodecErrorKind::WriteRemote => ExitStatus::WriteRemoteError,
            CodecErrorKind::CloseRemote => ExitStatus::CloseRemoteError,
            CodecErrorKind::ReadRemote => ExitStatus::ReadRemoteError,
            CodecErrorKind::List => ExitStatus::ListError,
            CodecErrorKind::Date => ExitStatus::DateError,
            CodecErrorKind::Timeout => ExitStatus::TimeoutError,
            CodecErrorKind::Exec => ExitStatus::ExecError,
        }
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for CodecError {}

/// Everything a codec needs to dial one destination.
#[derive(Debug, Clone)]
pub struct DialTarget {
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub family: ProtocolFamily,
    pub options: ProtoOptions,
    /// Remote base directory (push) or source directory (pull).
    pub base: String,
    pub block_size: u32,
    pub timeout_secs: u32,
}

/// One parsed remote-listing line.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    pub name: String,
    pub size: Option<i64>,
    pub mtime: Option<i64>,
    /// Whether the listing gave byte-exact size / second-exact date, or only
    /// an approximation that may need a HEAD/MDTM refinement.
    pub exact_size: bool,
    pub exact_date: bool,
    /// Protocol extra carried into the retrieve list (e.g. ETag).
    pub extra: Option<String>,
}

/// 协议编解码器能力面 — the capability set the transfer engine demands from
/// every protocol. Implementations are thin adapters over the real wire
/// codecs; tests plug in scripted doubles. Exactly one file is open per
/// direction at a time, matching the descriptor-per-connection model.
///
/// Every blocking operation takes an absolute deadline; implementations map
/// expiry onto `CodecErrorKind::Timeout` (see `CodecError::eval_timeout`).
pub trait RemoteLike: Send {
    fn dial(&mut self, target: &DialTarget, deadline: Instant) -> Result<(), CodecError>;
    fn open_write(&mut self, name: &str, size: u64, deadline: Instant) -> Result<(), CodecError>;
    fn write_chunk(&mut self, data: &[u8], deadline: Instant) -> Result<(), CodecError>;
    fn close_file(&mut self, deadline: Instant) -> Result<(), CodecError>;
    fn list(&mut self, deadline: Instant) -> Result<Vec<ListingEntry>, CodecError>;
    /// Refine size/mtime for one name (HEAD/MDTM equivalent).
    fn head(&mut self, name: &str, deadline: Instant)
    -> Result<(Option<i64>, Option<i64>), CodecError>;
    fn open_read(&mut self, name: &str, deadline: Instant) -> Result<(), CodecError>;
    fn read_chunk(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize, CodecError>;
    fn delete(&mut self, name: &str, deadline: Instant) -> Result<(), CodecError>;
    /// Orderly teardown; best effort, never fails the job.
    fn quit(&mut self);
}

/// Pick the codec for a protocol family. The families not carried by this
/// build (FTP/FTPS wire codec, SMTP, WMO, fax) plug in here as they land.
pub fn codec_for(family: ProtocolFamily) -> Box<dyn RemoteLike> {
    match family {
        ProtocolFamily::Sftp | ProtocolFamily::Scp => Box::new(sftp::Ssh2Codec::new()),
        ProtocolFamily::Exec => Box::new(local::LocalCodec::exec()),
        _ => Box::new(local::LocalCodec::new()),
    }
}
