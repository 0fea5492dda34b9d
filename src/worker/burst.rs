use std::path::Path;
use std::time::{Duration, Instant};

use crate::fifo::{Fifo, FifoSet, MsgKind, wait_readable};

/// Outcome of one burst wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BurstSignal {
    /// A new message for the same host/slot arrived; the worker keeps its
    /// connection and continues with the named job.
    Yes(String),
    /// The dispatcher wants the connection closed.
    No,
    /// Window elapsed or the descriptor was preempted.
    Neither,
}

/// 突发等待原语 — the worker side of connection reuse. The dispatcher feeds
/// follow-up jobs for an already connected host/slot through this per-job
/// fifo instead of spawning a fresh process.
pub struct BurstListener {
    fifo: Fifo,
}

impl BurstListener {
    pub fn open(work_dir: &Path, host_index: usize, job_slot: usize) -> Option<Self> {
        let path = FifoSet::burst_fifo_path(work_dir, host_index, job_slot);
        Fifo::create(path).ok().map(|fifo| Self { fifo })
    }

    /// Block up to `window` for a continuation. Wakes in short slices so a
    /// termination signal is honored promptly.
    pub fn wait(&mut self, window: Duration) -> BurstSignal {
        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return BurstSignal::Neither;
            }
            let slice = remaining.min(Duration::from_millis(200)).as_millis() as u16;
            match wait_readable(&[self.fifo.file()], slice.max(1)) {
                Ok(ready) if !ready.is_empty() => {
                    let records = match self.fifo.read_records() {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::debug!("[sf][burst] fifo read failed: {}", e);
                            return BurstSignal::Neither;
                        }
                    };
                    for rec in records {
                        match rec.msg_kind() {
                            Some(MsgKind::Burst) => return BurstSignal::Yes(rec.name_str()),
                            Some(MsgKind::Disconnect) => return BurstSignal::No,
                            _ => {}
                        }
                    }
                }
                Ok(_) => {
                    // nothing arrived this slice; honor a pending stop request
                    if crate::worker::signals::exit_requested() {
                        return BurstSignal::Neither;
                    }
                }
                Err(e) => {
                    tracing::debug!("[sf][burst] poll failed: {}", e);
                    return BurstSignal::Neither;
                }
            }
        }
    }

    pub fn fifo(&self) -> &Fifo {
        &self.fifo
    }
}
