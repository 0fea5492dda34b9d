use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 工作进程的退出码集合 — process exit codes reported by `spw` and mapped by
/// the dispatcher onto its retry policy. The numeric values are part of the
/// process surface; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ExitStatus {
    Success = 0,
    ConnectError = 10,
    OpenRemoteError = 11,
    WriteRemoteError = 12,
    CloseRemoteError = 13,
    ReadRemoteError = 14,
    ListError = 15,
    DateError = 16,
    TimeoutError = 17,
    AllocError = 18,
    ReadLocalError = 19,
    StillFilesToSend = 20,
    RemoveLockfileError = 21,
    ExecError = 22,
    GotKilled = 30,
    Incorrect = 31,
}

impl ExitStatus {
    /// 瞬时网络类错误：调度器计入错误计数并按退避重试 — transient network
    /// class: counted against the host and retried with backoff.
    pub fn is_transient_network(self) -> bool {
        use ExitStatus::*;
        matches!(
            self,
            ConnectError | WriteRemoteError | ReadRemoteError | TimeoutError | CloseRemoteError
        )
    }

    /// 远端语义类错误：重试，但与网络错误分开记账。
    pub fn is_remote_semantic(self) -> bool {
        matches!(self, ExitStatus::ListError | ExitStatus::DateError | ExitStatus::OpenRemoteError)
    }

    /// 本地缺陷类：不重试（输入损坏或资源耗尽），只记日志。
    pub fn is_defective_input(self) -> bool {
        matches!(self, ExitStatus::ReadLocalError | ExitStatus::AllocError | ExitStatus::ExecError)
    }

    /// Whether the dispatcher should put the job back on the queue at all.
    pub fn wants_requeue(self) -> bool {
        self.is_transient_network()
            || self.is_remote_semantic()
            || self == ExitStatus::StillFilesToSend
            || self == ExitStatus::GotKilled
    }
}

/// Worker-side failure. Carries the exit status the process must terminate
/// with plus a human message; the translation to `process::exit` happens in
/// exactly one place (the `spw` binary).
#[derive(Debug, Clone)]
pub struct TransferFail {
    pub status: ExitStatus,
    pub detail: String,
}

impl TransferFail {
    pub fn new(status: ExitStatus, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }
}

impl std::fmt::Display for TransferFail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({}): {}", self.status, u8::from(self.status), self.detail)
    }
}

impl std::error::Error for TransferFail {}

/// 调度器侧错误 — dispatcher-side structured errors, useful to represent
/// programmatically instead of ad-hoc formatted strings.
#[derive(Debug, Clone)]
pub enum DispatchError {
    HostNotFound(String),
    DirNotFound(String),
    NoFreeJobSlot(String),
    RegionAttachFailed(String, String),
    RegionCorrupt(String),
    FifoCreateFailed(String, String),
    FifoOverflow(String),
    SpawnFailed(String, String),
    MalformedMessage(String),
    SpoolMissing(String),
    ShutdownRequested,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use DispatchError::*;
        match self {
            HostNotFound(a) => write!(f, "主机别名 '{}' 不存在", a),
            DirNotFound(a) => write!(f, "目录别名 '{}' 不存在", a),
            NoFreeJobSlot(a) => write!(f, "主机 '{}' 无空闲任务槽位", a),
            RegionAttachFailed(r, e) => write!(f, "映射共享区失败: {} — {}", r, e),
            RegionCorrupt(r) => write!(f, "共享区损坏: {}", r),
            FifoCreateFailed(p, e) => write!(f, "创建 fifo 失败: {} — {}", p, e),
            FifoOverflow(name) => write!(f, "fifo 写入溢出（读者停滞）: {}", name),
            SpawnFailed(msg, e) => write!(f, "启动工作进程失败: {} — {}", msg, e),
            MalformedMessage(m) => write!(f, "无法解析的消息: {}", m),
            SpoolMissing(p) => write!(f, "任务目录不存在: {}", p),
            ShutdownRequested => write!(f, "shutdown requested"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl DispatchError {
    /// User-caused problems are dropped with a WARN; everything else is a
    /// defect of the environment and worth an ERROR.
    pub fn is_user_caused(&self) -> bool {
        matches!(
            self,
            DispatchError::HostNotFound(_)
                | DispatchError::DirNotFound(_)
                | DispatchError::MalformedMessage(_)
                | DispatchError::SpoolMissing(_)
        )
    }
}
