pub mod queue;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Child;
use std::time::Instant;

use crate::config::{self, Config};
use crate::error::{DispatchError, ExitStatus};
use crate::fifo::{Command, Fifo, FifoMessage, FifoSet, MsgKind, wait_readable};
use crate::parse;
use crate::region::MmapRegion;
use crate::region::lock::{LOCK_CON, LOCK_EC, LOCK_HS, RegionLocks, host_lock_offset};
use crate::retrieve::RetrieveList;
use crate::state::host::{HostEntry, HostFlags, UNIQUE_KILLED};
use crate::state::job::{JobRecord, JobState, NO_DIR};
use crate::util;
use crate::worker::collect_spool_files;
use queue::PendingQueue;

/// What the dispatcher hands to the spawner for one worker process. Mirrors
/// the `spw` argument surface.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub work_dir: PathBuf,
    pub job_slot: usize,
    pub region_generation: u32,
    pub host_index: usize,
    pub msg_name: String,
    pub dir_index: Option<usize>,
    pub retries: u32,
    pub toggle: bool,
    pub no_archive: bool,
}

pub struct WorkerHandle {
    pub child: Option<Child>,
}

/// Seam between scheduling and process creation so the scheduler can be
/// exercised without forking anything.
pub trait WorkerSpawner {
    fn spawn(&mut self, req: &SpawnRequest) -> Result<WorkerHandle, DispatchError>;
}

/// The real thing: `spw <work_dir> <job_slot> <region_gen> <host_index>
/// <msg_name> [options]`.
pub struct ProcessSpawner {
    pub spw_path: PathBuf,
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&mut self, req: &SpawnRequest) -> Result<WorkerHandle, DispatchError> {
        let mut cmd = std::process::Command::new(&self.spw_path);
        cmd.arg(&req.work_dir)
            .arg(req.job_slot.to_string())
            .arg(req.region_generation.to_string())
            .arg(req.host_index.to_string())
            .arg(&req.msg_name);
        if let Some(d) = req.dir_index {
            cmd.arg("-d").arg(d.to_string());
        }
        if req.retries > 0 {
            cmd.arg("-o").arg(req.retries.to_string());
        }
        if req.toggle {
            cmd.arg("-t");
        }
        if req.no_archive {
            cmd.arg("-A");
        }
        match cmd.spawn() {
            Ok(child) => Ok(WorkerHandle { child: Some(child) }),
            Err(e) => Err(DispatchError::SpawnFailed(req.msg_name.clone(), e.to_string())),
        }
    }
}

struct RunningWorker {
    jsa_index: usize,
    host_index: usize,
    job_slot: usize,
    handle: WorkerHandle,
    started: Instant,
    burst_path: PathBuf,
    /// JSA indices fed to this worker over its burst fifo.
    burst_fed: Vec<usize>,
    fin_seen: bool,
}

/// 调度器 — the single-threaded authoritative scheduler: reads the fifos,
/// consults the regions under the byte-range locks, spawns one worker
/// process per admitted job and enacts the retry policy on their exits.
pub struct Dispatcher<S: WorkerSpawner> {
    cfg: Config,
    hsa: MmapRegion<HostEntry>,
    jsa: MmapRegion<JobRecord>,
    dsa: MmapRegion<crate::state::dir::DirEntry>,
    locks: RegionLocks,
    fifos: FifoSet,
    queue: PendingQueue,
    running: HashMap<(usize, usize), RunningWorker>,
    zombies: Vec<RunningWorker>,
    error_queue: Vec<usize>,
    pub spawner: S,
    shutdown: bool,
    paused_all: bool,
    next_job_id: u32,
    last_scan: i64,
    last_rotate: i64,
}

impl<S: WorkerSpawner> Dispatcher<S> {
    pub fn new(cfg: Config, spawner: S) -> anyhow::Result<Self> {
        let work_dir = cfg.work_dir.clone();
        let hsa = MmapRegion::<HostEntry>::attach(config::hsa_path(&work_dir))
            .map_err(|e| anyhow::anyhow!("主机状态区不可用（先运行 spd init）: {}", e))?;
        let jsa = MmapRegion::<JobRecord>::attach(config::jsa_path(&work_dir))?;
        let dsa = MmapRegion::<crate::state::dir::DirEntry>::attach(config::dsa_path(&work_dir))?;
        let locks = RegionLocks::new(hsa.file())?;
        let fifos = FifoSet::create(&work_dir)?;
        util::init_event_dir(work_dir.join("logs"));
        let now = util::unix_now();
        let mut d = Self {
            cfg,
            hsa,
            jsa,
            dsa,
            locks,
            fifos,
            queue: PendingQueue::default(),
            running: HashMap::new(),
            zombies: Vec::new(),
            error_queue: Vec::new(),
            spawner,
            shutdown: false,
            paused_all: false,
            next_job_id: 1,
            last_scan: 0,
            last_rotate: now,
        };
        d.recover(now);
        Ok(d)
    }

    /// Startup janitor: a fresh dispatcher owns no workers, so every active
    /// slot, running job record and stale retrieve-list claim is residue of
    /// a crash and gets cleared before scheduling starts.
    fn recover(&mut self, now: i64) {
        for h in 0..self.hsa.count() as usize {
            if self.hsa.entry(h).active_from_slots() > 0 || self.hsa.entry(h).active_transfers > 0 {
                if let Ok(_con) = self.locks.lock(host_lock_offset(h, LOCK_CON)) {
                    self.hsa.update(h, |host| {
                        for s in host.jobs.iter_mut() {
                            s.reset();
                        }
                        host.active_transfers = 0;
                    });
                }
            }
        }
        for i in 0..self.jsa.count() as usize {
            let state = self.jsa.entry(i).job_state();
            match state {
                JobState::Queued | JobState::Retry => {
                    let due = self.jsa.entry(i).next_retry_time.max(now);
                    self.queue.push(i, due);
                    self.next_job_id = self.next_job_id.max(self.jsa.entry(i).job_id + 1);
                }
                JobState::Running => {
                    self.jsa.update(i, |j| {
                        j.set_state(JobState::Queued);
                        j.next_retry_time = now;
                    });
                    self.queue.push(i, now);
                    self.next_job_id = self.next_job_id.max(self.jsa.entry(i).job_id + 1);
                }
                JobState::Cancelled => {
                    self.jsa.update(i, |j| j.set_state(JobState::Free));
                }
                JobState::Free => {}
            }
        }
        for d in 0..self.dsa.count() as usize {
            let dir_id = self.dsa.entry(d).dir_id;
            if let Ok(mut rl) = RetrieveList::attach(&self.cfg.work_dir, dir_id) {
                let cleared = rl.release_stale_assignments(|_| false);
                if cleared > 0 {
                    tracing::info!("[fd] dir {} released {} stale claims", dir_id, cleared);
                }
            }
        }
    }

    pub fn host_index_by_alias(&self, alias: &str) -> Option<usize> {
        (0..self.hsa.count() as usize).find(|&h| self.hsa.entry(h).alias_str() == alias)
    }

    fn alloc_jsa(&mut self) -> Option<usize> {
        (0..self.jsa.count() as usize).find(|&i| self.jsa.entry(i).job_state() == JobState::Free)
    }

    fn find_jsa_by_msg(&self, msg_name: &str) -> Option<usize> {
        (0..self.jsa.count() as usize).find(|&i| {
            self.jsa.entry(i).job_state() != JobState::Free
                && self.jsa.entry(i).msg_name_str() == msg_name
        })
    }

    /// A new push message arrived on the msg fifo.
    fn register_push_job(&mut self, msg_name: &str, now: i64) {
        let Some((alias, _)) = parse::parse_msg_name(msg_name) else {
            tracing::warn!("[fd] {}", DispatchError::MalformedMessage(msg_name.to_string()));
            return;
        };
        let Some(host_index) = self.host_index_by_alias(&alias) else {
            tracing::warn!("[fd] {}", DispatchError::HostNotFound(alias));
            return;
        };
        let spool = self.cfg.work_dir.join("outgoing").join(msg_name);
        if !spool.is_dir() {
            tracing::warn!("[fd] {}", DispatchError::SpoolMissing(spool.display().to_string()));
            return;
        }
        let (files, bytes) = match collect_spool_files(&self.cfg.work_dir, msg_name) {
            Ok(v) => (v.len() as u32, v.iter().map(|f| f.size).sum::<u64>()),
            Err(e) => {
                tracing::warn!("[fd] spool scan {}: {}", msg_name, e);
                return;
            }
        };
        let Some(idx) = self.alloc_jsa() else {
            tracing::error!("[fd] FATAL job table full, dropping {}", msg_name);
            return;
        };
        let job_id = self.next_job_id;
        self.next_job_id += 1;
        self.jsa.update(idx, |j| {
            j.set_msg_name(msg_name);
            j.job_id = job_id;
            j.host_index = host_index as u32;
            j.dir_index = NO_DIR;
            j.files = files;
            j.bytes = bytes;
            j.retries = 0;
            j.creation_time = now;
            j.next_retry_time = now;
            j.special_flags = 0;
            j.set_state(JobState::Queued);
        });
        self.queue.push(idx, now);
        tracing::debug!("[fd] queued {} ({} files, {} bytes)", msg_name, files, bytes);
    }

    /// Periodic pull scheduling: one scan job per directory that has none
    /// pending or running.
    fn schedule_pull_jobs(&mut self, now: i64) {
        for d in 0..self.dsa.count() as usize {
            let busy = (0..self.jsa.count() as usize).any(|i| {
                self.jsa.entry(i).job_state() != JobState::Free
                    && self.jsa.entry(i).dir_index == d as u32
            });
            if busy {
                continue;
            }
            let host_index = self.dsa.entry(d).host_index as usize;
            if host_index >= self.hsa.count() as usize {
                continue;
            }
            let alias = self.hsa.entry(host_index).alias_str();
            let Some(idx) = self.alloc_jsa() else { return };
            let job_id = self.next_job_id;
            self.next_job_id += 1;
            let msg_name = format!("{}_{}", alias, job_id);
            self.jsa.update(idx, |j| {
                j.set_msg_name(&msg_name);
                j.job_id = job_id;
                j.host_index = host_index as u32;
                j.dir_index = d as u32;
                j.files = 0;
                j.bytes = 0;
                j.retries = 0;
                j.creation_time = now;
                j.next_retry_time = now;
                j.special_flags = 0;
                j.set_state(JobState::Queued);
            });
            self.queue.push(idx, now);
        }
    }

    /// An already connected worker for this host with no file in flight is
    /// sitting in its burst wait.
    fn find_burst_target(&self, host_index: usize) -> Option<(usize, usize)> {
        let host = self.hsa.entry(host_index);
        if host.keep_connected == 0 || !host.protocol().supports_burst() {
            return None;
        }
        self.running
            .keys()
            .copied()
            .find(|&(h, slot)| {
                h == host_index
                    && host.jobs[slot].is_active()
                    && host.jobs[slot].file_name_in_use[0] == 0
            })
    }

    fn feed_burst(&mut self, target: (usize, usize), jsa_index: usize) -> bool {
        let Some(rw) = self.running.get_mut(&target) else { return false };
        let msg_name = self.jsa.entry(jsa_index).msg_name_str();
        let fifo = match Fifo::open(&rw.burst_path) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!("[fd][burst] fifo open failed: {}", e);
                return false;
            }
        };
        let mut m = FifoMessage::with_name(MsgKind::Burst, &msg_name);
        m.host_slot = target.0 as u8;
        m.job_slot = target.1 as u8;
        if fifo.write_record(&m).is_err() {
            return false;
        }
        rw.burst_fed.push(jsa_index);
        self.jsa.update(jsa_index, |j| j.set_state(JobState::Running));
        // mark the slot so a worker that leaves anyway is seen as a burst miss
        if let Ok(_con) = self.locks.lock(host_lock_offset(target.0, LOCK_CON)) {
            self.hsa.update(target.0, |h| {
                if h.jobs[target.1].unique_name[2] == crate::state::host::UNIQUE_ORDINARY {
                    h.jobs[target.1].unique_name[2] = crate::state::host::UNIQUE_BURST;
                }
            });
        }
        tracing::debug!("[fd][burst] {} fed to {:?}", msg_name, target);
        true
    }

    /// Admission for one due job. Returns true when the job left the queue
    /// for good (spawned, bursted, cancelled or dropped).
    fn try_admit(&mut self, jsa_index: usize, now: i64) -> bool {
        let job = *self.jsa.entry(jsa_index);
        match job.job_state() {
            JobState::Cancelled => {
                self.jsa.update(jsa_index, |j| j.set_state(JobState::Free));
                return true;
            }
            JobState::Free | JobState::Running => return true,
            JobState::Queued | JobState::Retry => {}
        }
        let host_index = job.host_index as usize;
        if host_index >= self.hsa.count() as usize {
            tracing::warn!("[fd] job {} references missing host", job.msg_name_str());
            self.jsa.update(jsa_index, |j| j.set_state(JobState::Free));
            return true;
        }
        let host = *self.hsa.entry(host_index);
        if self.paused_all
            || host.flags().intersects(HostFlags::PAUSED | HostFlags::OFFLINE)
        {
            self.queue.push(jsa_index, now + 5);
            return false;
        }
        if host.flags().contains(HostFlags::AUTO_PAUSED) && host.active_transfers > 0 {
            // one probe at a time while the host is in error state
            self.queue.push(jsa_index, now + self.cfg.retry_base_secs.max(1) as i64);
            return false;
        }
        if host.active_transfers >= host.allowed_transfers {
            if let Some(target) = self.find_burst_target(host_index)
                && job.dir_index == NO_DIR
                && self.feed_burst(target, jsa_index)
            {
                return true;
            }
            self.queue.push(jsa_index, now + 1);
            return false;
        }
        // prefer burst over a fresh connection even with capacity to spare
        if job.dir_index == NO_DIR
            && let Some(target) = self.find_burst_target(host_index)
            && self.feed_burst(target, jsa_index)
        {
            return true;
        }
        let Some(job_slot) = host.free_slot() else {
            self.queue.push(jsa_index, now + 1);
            return false;
        };
        self.spawn_worker(jsa_index, host_index, job_slot, &job, now);
        true
    }

    fn spawn_worker(
        &mut self,
        jsa_index: usize,
        host_index: usize,
        job_slot: usize,
        job: &JobRecord,
        now: i64,
    ) {
        let burst_path = FifoSet::burst_fifo_path(&self.cfg.work_dir, host_index, job_slot);
        if let Err(e) = Fifo::create(&burst_path) {
            tracing::warn!("[fd] {}", e);
        }
        let req = SpawnRequest {
            work_dir: self.cfg.work_dir.clone(),
            job_slot,
            region_generation: self.hsa.generation(),
            host_index,
            msg_name: job.msg_name_str(),
            dir_index: if job.dir_index == NO_DIR { None } else { Some(job.dir_index as usize) },
            retries: job.retries,
            toggle: false,
            no_archive: false,
        };
        if let Ok(_con) = self.locks.lock(host_lock_offset(host_index, LOCK_CON)) {
            self.hsa.update(host_index, |h| {
                h.active_transfers = h.active_transfers.saturating_add(1);
            });
        }
        match self.spawner.spawn(&req) {
            Ok(handle) => {
                self.jsa.update(jsa_index, |j| j.set_state(JobState::Running));
                self.running.insert(
                    (host_index, job_slot),
                    RunningWorker {
                        jsa_index,
                        host_index,
                        job_slot,
                        handle,
                        started: Instant::now(),
                        burst_path,
                        burst_fed: Vec::new(),
                        fin_seen: false,
                    },
                );
                self.recalc_trl(host_index);
            }
            Err(e) => {
                tracing::error!("[fd] {}", e);
                if let Ok(_con) = self.locks.lock(host_lock_offset(host_index, LOCK_CON)) {
                    self.hsa.update(host_index, |h| {
                        h.active_transfers = h.active_transfers.saturating_sub(1);
                    });
                }
                self.jsa.update(jsa_index, |j| {
                    j.set_state(JobState::Retry);
                    j.next_retry_time = now + self.cfg.retry_base_secs as i64;
                });
                self.queue.push(jsa_index, now + self.cfg.retry_base_secs as i64);
            }
        }
    }

    /// Host error accounting under LOCK_EC; threshold trips the auto-pause
    /// under LOCK_HS with its one "error-start" event.
    fn record_host_error(&mut self, host_index: usize, status: ExitStatus) {
        if let Ok(_ec) = self.locks.lock(host_lock_offset(host_index, LOCK_EC)) {
            self.hsa.update(host_index, |h| h.record_error(u8::from(status)));
        }
        let host = *self.hsa.entry(host_index);
        if host.error_counter >= host.max_errors
            && !host.flags().contains(HostFlags::AUTO_PAUSED)
        {
            if let Ok(_hs) = self.locks.lock(host_lock_offset(host_index, LOCK_HS)) {
                self.hsa.update(host_index, |h| {
                    h.set_flag(HostFlags::AUTO_PAUSED, true);
                    h.set_flag(HostFlags::ERROR_QUEUE_SET, true);
                });
            }
            self.error_queue.push(host_index);
            let alias = host.alias_str();
            tracing::warn!("[fd] {} error-start ({} errors)", alias, host.error_counter);
            util::write_event(
                "error-start",
                serde_json::json!({ "host": alias, "errors": host.error_counter }),
            );
        }
    }

    /// Worker exit policy per the error taxonomy.
    fn apply_exit_policy(&mut self, rw: &RunningWorker, status: ExitStatus, now: i64) {
        let jsa_index = rw.jsa_index;
        let retries = self.jsa.entry(jsa_index).retries;
        match status {
            ExitStatus::Success => {
                self.jsa.update(jsa_index, |j| j.set_state(JobState::Free));
            }
            ExitStatus::StillFilesToSend => {
                self.jsa.update(jsa_index, |j| {
                    j.set_state(JobState::Retry);
                    j.retries = j.retries.saturating_add(1);
                    j.next_retry_time = now;
                });
                self.queue.push(jsa_index, now);
            }
            s if s.is_transient_network() || s.is_remote_semantic() => {
                self.record_host_error(rw.host_index, s);
                let delay =
                    util::retry_delay_secs(retries, self.cfg.retry_base_secs, self.cfg.retry_max_secs)
                        as i64;
                self.jsa.update(jsa_index, |j| {
                    j.set_state(JobState::Retry);
                    j.retries = j.retries.saturating_add(1);
                    j.next_retry_time = now + delay;
                });
                self.queue.push(jsa_index, now + delay);
            }
            s if s.is_defective_input() => {
                tracing::error!(
                    "[fd] FATAL {} failed with {:?}, not requeued",
                    self.jsa.entry(jsa_index).msg_name_str(),
                    s
                );
                self.jsa.update(jsa_index, |j| j.set_state(JobState::Free));
            }
            ExitStatus::GotKilled | ExitStatus::Incorrect | ExitStatus::RemoveLockfileError => {
                if self.shutdown {
                    // keep it durable; the next dispatcher run re-admits
                    self.jsa.update(jsa_index, |j| {
                        j.set_state(JobState::Queued);
                        j.next_retry_time = now;
                    });
                } else {
                    self.jsa.update(jsa_index, |j| {
                        j.set_state(JobState::Retry);
                        j.retries = j.retries.saturating_add(1);
                        j.next_retry_time = now + self.cfg.retry_base_secs as i64;
                    });
                    self.queue.push(jsa_index, now + self.cfg.retry_base_secs as i64);
                }
            }
            _ => {
                self.jsa.update(jsa_index, |j| j.set_state(JobState::Free));
            }
        }
        // burst-fed jobs this worker never finished still have their spool
        for &fed in &rw.burst_fed {
            let msg = self.jsa.entry(fed).msg_name_str();
            if self.cfg.work_dir.join("outgoing").join(&msg).is_dir() {
                self.jsa.update(fed, |j| {
                    j.set_state(JobState::Queued);
                    j.next_retry_time = now;
                });
                self.queue.push(fed, now);
            } else {
                self.jsa.update(fed, |j| j.set_state(JobState::Free));
            }
        }
    }

    /// Slot hygiene when a worker leaves: whatever the worker managed to do,
    /// afterwards the slot is Disconnect and active_transfers matches the
    /// slots again.
    fn reset_slot_and_recount(&mut self, host_index: usize, job_slot: usize) {
        if let Ok(_con) = self.locks.lock(host_lock_offset(host_index, LOCK_CON)) {
            self.hsa.update(host_index, |h| {
                h.jobs[job_slot].reset();
                h.active_transfers = h.active_from_slots();
            });
        }
        self.recalc_trl(host_index);
    }

    fn handle_fin(&mut self, rec: &FifoMessage, now: i64) {
        let key = (rec.host_slot as usize, rec.job_slot as usize);
        let Some(mut rw) = self.running.remove(&key) else {
            tracing::debug!("[fd] fin for unknown worker {:?}", key);
            return;
        };
        rw.fin_seen = true;
        let status = ExitStatus::try_from((rec.payload_a & 0xff) as u8)
            .unwrap_or(ExitStatus::Incorrect);
        self.reset_slot_and_recount(rw.host_index, rw.job_slot);
        self.apply_exit_policy(&rw, status, now);
        if rw.handle.child.is_some() {
            self.zombies.push(rw);
        }
    }

    /// Reap children. A child that died without a fin record is the crash
    /// path: clean its slot, clear its claims, requeue its job.
    fn reap_children(&mut self, now: i64) {
        self.zombies.retain_mut(|rw| match rw.handle.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(_)) | Err(_) => false,
                Ok(None) => true,
            },
            None => false,
        });

        let keys: Vec<(usize, usize)> = self.running.keys().copied().collect();
        for key in keys {
            let exited = {
                let rw = self.running.get_mut(&key).expect("key just listed");
                match rw.handle.child.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => Some(
                            status
                                .code()
                                .and_then(|c| ExitStatus::try_from((c & 0xff) as u8).ok())
                                .unwrap_or(ExitStatus::GotKilled),
                        ),
                        Ok(None) => None,
                        Err(_) => Some(ExitStatus::Incorrect),
                    },
                    // mock workers only exit via fin records
                    None => None,
                }
            };
            if let Some(status) = exited {
                let rw = self.running.remove(&key).expect("key just listed");
                if !rw.fin_seen {
                    tracing::warn!(
                        "[fd] worker {:?} died without terminator ({:?})",
                        key,
                        status
                    );
                    self.reset_slot_and_recount(rw.host_index, rw.job_slot);
                    self.apply_exit_policy(&rw, status, now);
                    let dir_index = self.jsa.entry(rw.jsa_index).dir_index;
                    if dir_index != NO_DIR {
                        let dir_id = self.dsa.entry(dir_index as usize).dir_id;
                        if let Ok(mut rl) = RetrieveList::attach(&self.cfg.work_dir, dir_id) {
                            let slot = rw.job_slot;
                            rl.release_stale_assignments(|s| s != slot);
                        }
                    }
                }
            }
        }
    }

    /// Per-process rate share = host rate limit / active transfers.
    fn recalc_trl(&mut self, host_index: usize) {
        let host = *self.hsa.entry(host_index);
        let share = host.rate_limit / host.active_transfers.max(1);
        if host.trl_per_process != share {
            self.hsa.update(host_index, |h| h.trl_per_process = share);
        }
    }

    fn recalc_trl_all(&mut self) {
        for h in 0..self.hsa.count() as usize {
            self.recalc_trl(h);
        }
    }

    fn handle_command(&mut self, rec: &FifoMessage) {
        let Ok(cmd) = Command::try_from(rec.payload_a) else {
            tracing::warn!("[fd] {}", DispatchError::MalformedMessage(format!("cmd {}", rec.payload_a)));
            return;
        };
        let now = util::unix_now();
        match cmd {
            Command::Shutdown => {
                tracing::info!("[fd] shutdown requested");
                self.shutdown = true;
                let keys: Vec<(usize, usize)> = self.running.keys().copied().collect();
                for key in keys {
                    self.terminate_worker(key, false);
                }
            }
            Command::ReloadConfig => self.reload_host_seeds(),
            Command::PauseHost | Command::ResumeHost | Command::DebugOn | Command::DebugOff => {
                let alias = rec.name_str();
                let Some(h) = self.host_index_by_alias(&alias) else {
                    tracing::warn!("[fd] {}", DispatchError::HostNotFound(alias));
                    return;
                };
                match cmd {
                    Command::PauseHost => {
                        if let Ok(_hs) = self.locks.lock(host_lock_offset(h, LOCK_HS)) {
                            self.hsa.update(h, |e| e.set_flag(HostFlags::PAUSED, true));
                        }
                        util::write_event("pause", serde_json::json!({ "host": alias }));
                    }
                    Command::ResumeHost => {
                        if let Ok(_hs) = self.locks.lock(host_lock_offset(h, LOCK_HS)) {
                            self.hsa.update(h, |e| e.set_flag(HostFlags::PAUSED, false));
                        }
                        // make the host's retries due right now
                        for i in 0..self.jsa.count() as usize {
                            if self.jsa.entry(i).host_index == h as u32
                                && self.jsa.entry(i).job_state() == JobState::Retry
                            {
                                self.jsa.update(i, |j| j.next_retry_time = now);
                                self.queue.push(i, now);
                            }
                        }
                        util::write_event("resume", serde_json::json!({ "host": alias }));
                    }
                    Command::DebugOn => self.hsa.update(h, |e| e.debug_level = 1),
                    Command::DebugOff => self.hsa.update(h, |e| e.debug_level = 0),
                    _ => unreachable!(),
                }
            }
            Command::PauseAll => self.paused_all = true,
            Command::ResumeAll => self.paused_all = false,
            Command::DumpState => self.dump_state(),
        }
    }

    fn reload_host_seeds(&mut self) {
        let seeds = match self.cfg.load_host_seeds() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("[fd] reload failed: {}", e);
                return;
            }
        };
        for seed in seeds {
            if let Some(h) = self.host_index_by_alias(&seed.alias) {
                if let Ok(_hs) = self.locks.lock(host_lock_offset(h, LOCK_HS)) {
                    self.hsa.update(h, |e| seed.apply_to(e));
                }
            }
        }
        tracing::info!("[fd] host table reloaded");
    }

    fn dump_state(&self) {
        let mut hosts = Vec::new();
        for h in 0..self.hsa.count() as usize {
            let e = self.hsa.entry(h);
            hosts.push(serde_json::json!({
                "alias": e.alias_str(),
                "active": e.active_transfers,
                "allowed": e.allowed_transfers,
                "errors": e.error_counter,
                "flags": e.host_status,
                "connections": e.connections,
            }));
        }
        let error_hosts: Vec<String> =
            self.error_queue.iter().map(|&h| self.hsa.entry(h).alias_str()).collect();
        util::write_event(
            "dump-state",
            serde_json::json!({
                "hosts": hosts,
                "queued": self.queue.len(),
                "running": self.running.len(),
                "error_queue": error_hosts,
            }),
        );
        tracing::info!("[fd] state dumped ({} queued, {} running)", self.queue.len(), self.running.len());
    }

    /// Graceful termination of one worker. `burst_control` marks the kill as
    /// intentional so the worker exits SUCCESS.
    fn terminate_worker(&mut self, key: (usize, usize), burst_control: bool) {
        let Some(rw) = self.running.get(&key) else { return };
        if burst_control
            && let Ok(_con) = self.locks.lock(host_lock_offset(key.0, LOCK_CON))
        {
            self.hsa.update(key.0, |h| {
                h.jobs[key.1].unique_name[2] = UNIQUE_KILLED;
            });
            if let Ok(f) = Fifo::open(&rw.burst_path) {
                let _ = f.write_record(&FifoMessage::new(MsgKind::Disconnect));
            }
        }
        if let Some(child) = rw.handle.child.as_ref() {
            let pid = nix::unistd::Pid::from_raw(child.id() as i32);
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
        }
    }

    /// Evict burst holders idling past their keep-connected window plus a
    /// grace period (a healthy worker leaves on its own first).
    fn evict_stale_burst_holders(&mut self) {
        let keys: Vec<(usize, usize)> = self.running.keys().copied().collect();
        for key in keys {
            let Some(rw) = self.running.get(&key) else { continue };
            let host = self.hsa.entry(key.0);
            if host.keep_connected == 0 {
                continue;
            }
            let budget = (host.keep_connected + 2 * host.transfer_timeout.max(1)) as u64;
            let idle = host.jobs[key.1].is_active() && host.jobs[key.1].file_name_in_use[0] == 0;
            if idle && rw.started.elapsed().as_secs() > budget {
                tracing::debug!("[fd] evicting stale burst holder {:?}", key);
                self.terminate_worker(key, true);
            }
        }
    }

    fn handle_retry_record(&mut self, rec: &FifoMessage, now: i64) {
        let msg = rec.name_str();
        let Some(idx) = self.find_jsa_by_msg(&msg) else {
            tracing::debug!("[fd] retry for unknown job {}", msg);
            return;
        };
        let retries = self.jsa.entry(idx).retries;
        let delay =
            util::retry_delay_secs(retries, self.cfg.retry_base_secs, self.cfg.retry_max_secs) as i64;
        self.jsa.update(idx, |j| {
            j.set_state(JobState::Retry);
            j.retries = j.retries.saturating_add(1);
            j.next_retry_time = now + delay;
        });
        self.queue.push(idx, now + delay);
    }

    fn handle_delete_record(&mut self, rec: &FifoMessage) {
        let msg = rec.name_str();
        let Some(idx) = self.find_jsa_by_msg(&msg) else {
            tracing::debug!("[fd] delete for unknown job {}", msg);
            return;
        };
        self.jsa.update(idx, |j| j.set_state(JobState::Cancelled));
        let key = self
            .running
            .iter()
            .find(|(_, rw)| rw.jsa_index == idx)
            .map(|(k, _)| *k);
        if let Some(key) = key {
            self.terminate_worker(key, false);
        }
        tracing::info!("[fd] job {} cancelled", msg);
    }

    /// One poll round: drain whatever fifos fired, then the timer duties.
    pub fn step(&mut self, timeout_ms: u16) {
        let ready = {
            let files = [
                self.fifos.fd_cmd.file(),
                self.fifos.msg.file(),
                self.fifos.sf_fin.file(),
                self.fifos.retry.file(),
                self.fifos.delete_jobs.file(),
                self.fifos.wake_up.file(),
                self.fifos.trl_calc.file(),
            ];
            match wait_readable(&files, timeout_ms) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("[fd] poll failed: {}", e);
                    return;
                }
            }
        };
        let now = util::unix_now();
        for which in ready {
            match which {
                0 => {
                    for rec in self.fifos.fd_cmd.read_records().unwrap_or_default() {
                        self.handle_command(&rec);
                    }
                }
                1 => {
                    for rec in self.fifos.msg.read_records().unwrap_or_default() {
                        if rec.msg_kind() == Some(MsgKind::Job) {
                            self.register_push_job(&rec.name_str(), now);
                        }
                    }
                }
                2 => {
                    for rec in self.fifos.sf_fin.read_records().unwrap_or_default() {
                        if rec.msg_kind() == Some(MsgKind::WorkerFin) {
                            self.handle_fin(&rec, now);
                        }
                    }
                }
                3 => {
                    for rec in self.fifos.retry.read_records().unwrap_or_default() {
                        self.handle_retry_record(&rec, now);
                    }
                }
                4 => {
                    for rec in self.fifos.delete_jobs.read_records().unwrap_or_default() {
                        self.handle_delete_record(&rec);
                    }
                }
                5 => self.fifos.wake_up.drain_bytes(),
                6 => {
                    self.fifos.trl_calc.drain_bytes();
                    self.recalc_trl_all();
                }
                _ => {}
            }
        }
        self.tick(now);
    }

    /// Timer duties: reap, admit, schedule scans, rotate error history,
    /// evict stale burst holders.
    fn tick(&mut self, now: i64) {
        self.reap_children(now);
        if !self.shutdown {
            let mut admitted = 0;
            while let Some(idx) = self.queue.pop_due(now) {
                if self.try_admit(idx, now) {
                    admitted += 1;
                }
                if admitted > 64 {
                    break;
                }
            }
            if self.dsa.count() > 0 && now - self.last_scan >= self.cfg.scan_interval_secs as i64 {
                self.last_scan = now;
                self.schedule_pull_jobs(now);
            }
        }
        // hosts whose workers saw a success have cleared their queue flag
        self.error_queue
            .retain(|&h| self.hsa.entry(h).flags().contains(HostFlags::ERROR_QUEUE_SET));
        if now - self.last_rotate >= self.cfg.error_history_rotate_secs as i64 {
            self.last_rotate = now;
            for h in 0..self.hsa.count() as usize {
                if let Ok(_ec) = self.locks.lock(host_lock_offset(h, LOCK_EC)) {
                    self.hsa.update(h, |e| e.rotate_error_history());
                }
            }
        }
        self.evict_stale_burst_holders();
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown && self.running.is_empty()
    }

    /// The dispatcher main loop; returns once a shutdown command has been
    /// processed and every worker is reaped.
    pub fn run(&mut self) {
        tracing::info!("[fd] dispatcher up, {} hosts, {} dirs", self.hsa.count(), self.dsa.count());
        while !self.is_shutdown_complete() {
            let wait = match self.queue.next_due_in(util::unix_now()) {
                Some(secs) => (secs.clamp(0, 5) as u16) * 1000,
                None => 5000,
            };
            self.step(wait.max(100));
        }
        let _ = self.hsa.flush();
        let _ = self.jsa.flush();
        tracing::info!("[fd] dispatcher down");
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn hsa(&self) -> &MmapRegion<HostEntry> {
        &self.hsa
    }

    pub fn jsa(&self) -> &MmapRegion<JobRecord> {
        &self.jsa
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::bootstrap_regions;
    use crate::state::host::ConnectStatus;

    struct MockSpawner {
        pub reqs: Vec<SpawnRequest>,
    }

    impl WorkerSpawner for MockSpawner {
        fn spawn(&mut self, req: &SpawnRequest) -> Result<WorkerHandle, DispatchError> {
            self.reqs.push(req.clone());
            Ok(WorkerHandle { child: None })
        }
    }

    fn setup(tmpname: &str, hosts_json: &str) -> (tempfile::TempDir, Dispatcher<MockSpawner>) {
        let tmp = tempfile::tempdir().unwrap();
        let wd = tmp.path().join(tmpname);
        let cfg = Config::init(Some(wd.clone())).unwrap();
        std::fs::write(wd.join("etc").join("hosts.json"), hosts_json).unwrap();
        bootstrap_regions(&cfg).unwrap();
        let d = Dispatcher::new(cfg, MockSpawner { reqs: Vec::new() }).unwrap();
        (tmp, d)
    }

    fn spool(d: &Dispatcher<MockSpawner>, msg: &str, files: &[(&str, &[u8])]) {
        let dir = d.cfg.work_dir.join("outgoing").join(msg);
        std::fs::create_dir_all(&dir).unwrap();
        for (name, body) in files {
            std::fs::write(dir.join(name), body).unwrap();
        }
    }

    fn feed_job(d: &mut Dispatcher<MockSpawner>, msg: &str) {
        let writer = Fifo::open(d.fifos.msg.path()).unwrap();
        writer.write_record(&FifoMessage::with_name(MsgKind::Job, msg)).unwrap();
        d.step(10);
    }

    fn feed_fin(d: &mut Dispatcher<MockSpawner>, req: &SpawnRequest, status: ExitStatus) {
        let writer = Fifo::open(d.fifos.sf_fin.path()).unwrap();
        let mut m = FifoMessage::with_name(MsgKind::WorkerFin, &req.msg_name);
        m.host_slot = req.host_index as u8;
        m.job_slot = req.job_slot as u8;
        m.payload_a = u8::from(status) as u32;
        writer.write_record(&m).unwrap();
        d.step(10);
    }

    const ONE_HOST: &str = r#"[
        {"alias": "erebus", "hostname": "erebus.example.net", "port": 22,
         "protocol": "sftp", "allowed_transfers": 2, "max_errors": 3,
         "transfer_timeout": 30}
    ]"#;

    #[test]
    fn push_message_spawns_one_worker() {
        let (_tmp, mut d) = setup("spd1", ONE_HOST);
        spool(&d, "erebus_1", &[("a", b"1"), ("b", b"22")]);
        feed_job(&mut d, "erebus_1");
        assert_eq!(d.spawner.reqs.len(), 1);
        let req = &d.spawner.reqs[0];
        assert_eq!(req.host_index, 0);
        assert_eq!(req.msg_name, "erebus_1");
        assert_eq!(d.hsa.entry(0).active_transfers, 1);
        assert_eq!(d.running_len(), 1);
        // success path frees the job record and the slot accounting
        let req = d.spawner.reqs[0].clone();
        feed_fin(&mut d, &req, ExitStatus::Success);
        assert_eq!(d.running_len(), 0);
        assert_eq!(d.hsa.entry(0).active_transfers, 0);
        assert_eq!(d.jsa.entry(0).job_state(), JobState::Free);
    }

    #[test]
    fn admission_respects_allowed_transfers() {
        let (_tmp, mut d) = setup("spd2", ONE_HOST);
        for n in 1..=3 {
            spool(&d, &format!("erebus_{}", n), &[("f", b"x")]);
            feed_job(&mut d, &format!("erebus_{}", n));
        }
        // allowed_transfers = 2: third job stays queued
        assert_eq!(d.spawner.reqs.len(), 2);
        assert_eq!(d.queue_len(), 1);
        let req = d.spawner.reqs[0].clone();
        feed_fin(&mut d, &req, ExitStatus::Success);
        // freed slot admits the waiting job on a later tick
        let now = util::unix_now();
        d.tick(now + 2);
        assert_eq!(d.spawner.reqs.len(), 3);
    }

    #[test]
    fn error_backoff_auto_pauses_after_max_errors() {
        // S4: three consecutive connect errors trip the auto-pause
        let (_tmp, mut d) = setup("spd3", ONE_HOST);
        spool(&d, "erebus_9", &[("f", b"x")]);
        feed_job(&mut d, "erebus_9");
        for round in 1..=3u32 {
            assert_eq!(d.spawner.reqs.len() as u32, round, "round {}", round);
            let req = d.spawner.reqs.last().unwrap().clone();
            feed_fin(&mut d, &req, ExitStatus::ConnectError);
            if round < 3 {
                // make the backed-off retry due and let admission run
                let i = (0..d.jsa.count() as usize)
                    .find(|&i| d.jsa.entry(i).job_state() == JobState::Retry)
                    .unwrap();
                d.jsa.update(i, |j| j.next_retry_time = 0);
                d.queue.push(i, 0);
                d.tick(util::unix_now());
            }
        }
        let h = d.hsa.entry(0);
        assert_eq!(h.error_counter, 3);
        assert!(h.flags().contains(HostFlags::AUTO_PAUSED));
        assert!(h.flags().contains(HostFlags::ERROR_QUEUE_SET));
        assert_eq!(h.error_history[0], u8::from(ExitStatus::ConnectError));
        // no further spawn while the retry sits in backoff
        d.tick(util::unix_now());
        assert_eq!(d.spawner.reqs.len(), 3);
    }

    #[test]
    fn defective_input_is_dropped_not_requeued() {
        let (_tmp, mut d) = setup("spd4", ONE_HOST);
        spool(&d, "erebus_5", &[("f", b"x")]);
        feed_job(&mut d, "erebus_5");
        let req = d.spawner.reqs[0].clone();
        feed_fin(&mut d, &req, ExitStatus::ReadLocalError);
        assert_eq!(d.queue_len(), 0);
        assert_eq!(d.jsa.entry(0).job_state(), JobState::Free);
        // and no host error was recorded for a local defect
        assert_eq!(d.hsa.entry(0).error_counter, 0);
    }

    #[test]
    fn still_files_to_send_requeues_immediately() {
        let (_tmp, mut d) = setup("spd5", ONE_HOST);
        spool(&d, "erebus_6", &[("f", b"x")]);
        feed_job(&mut d, "erebus_6");
        let req = d.spawner.reqs[0].clone();
        feed_fin(&mut d, &req, ExitStatus::StillFilesToSend);
        // requeued and admitted again within the same tick window
        d.tick(util::unix_now() + 1);
        assert_eq!(d.spawner.reqs.len(), 2);
        assert_eq!(d.jsa.entry(0).retries, 1);
    }

    #[test]
    fn burst_feeds_idle_connected_worker_instead_of_spawning() {
        // S5, dispatcher half: second message goes over the burst fifo
        let hosts = r#"[
            {"alias": "erebus", "hostname": "erebus.example.net", "port": 22,
             "protocol": "sftp", "allowed_transfers": 2, "max_errors": 3,
             "keep_connected": 5, "transfer_timeout": 30}
        ]"#;
        let (_tmp, mut d) = setup("spd6", hosts);
        spool(&d, "erebus_1", &[("f", b"x")]);
        feed_job(&mut d, "erebus_1");
        assert_eq!(d.spawner.reqs.len(), 1);
        let req = d.spawner.reqs[0].clone();
        // worker is connected and idle between messages
        d.hsa.update(0, |h| {
            h.jobs[req.job_slot].set_status(ConnectStatus::SftpActive);
        });
        spool(&d, "erebus_2", &[("g", b"y")]);
        feed_job(&mut d, "erebus_2");
        // no second process
        assert_eq!(d.spawner.reqs.len(), 1);
        // the continuation sits in the worker's burst fifo
        let mut burst = Fifo::open(FifoSet::burst_fifo_path(
            &d.cfg.work_dir,
            req.host_index,
            req.job_slot,
        ))
        .unwrap();
        let recs = burst.read_records().unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].msg_kind(), Some(MsgKind::Burst));
        assert_eq!(recs[0].name_str(), "erebus_2");
        // and the job record is accounted to the running worker
        let idx = d.find_jsa_by_msg("erebus_2").unwrap();
        assert_eq!(d.jsa.entry(idx).job_state(), JobState::Running);
    }

    #[test]
    fn cancel_removes_queued_job() {
        let hosts = r#"[
            {"alias": "erebus", "hostname": "erebus.example.net", "port": 22,
             "protocol": "sftp", "allowed_transfers": 1, "max_errors": 3}
        ]"#;
        let (_tmp, mut d) = setup("spd7", hosts);
        spool(&d, "erebus_1", &[("f", b"x")]);
        feed_job(&mut d, "erebus_1");
        spool(&d, "erebus_2", &[("g", b"y")]);
        feed_job(&mut d, "erebus_2");
        assert_eq!(d.queue_len(), 1);
        let writer = Fifo::open(d.fifos.delete_jobs.path()).unwrap();
        writer
            .write_record(&FifoMessage::with_name(MsgKind::DeleteJob, "erebus_2"))
            .unwrap();
        d.step(10);
        // cancelled record is consumed on its next admission attempt
        let now = util::unix_now();
        d.tick(now + 5);
        let idx = (0..d.jsa.count() as usize)
            .find(|&i| d.jsa.entry(i).msg_name_str() == "erebus_2")
            .unwrap();
        assert_eq!(d.jsa.entry(idx).job_state(), JobState::Free);
    }

    #[test]
    fn restart_requeues_surviving_job_records() {
        let (_tmp, mut d) = setup("spd8", ONE_HOST);
        spool(&d, "erebus_1", &[("f", b"x")]);
        feed_job(&mut d, "erebus_1");
        assert_eq!(d.spawner.reqs.len(), 1);
        // simulate a dispatcher crash: job record is Running, slot active
        d.hsa.update(0, |h| h.jobs[0].set_status(ConnectStatus::Connecting));
        let cfg = d.cfg.clone();
        drop(d);
        let mut d2 = Dispatcher::new(cfg, MockSpawner { reqs: Vec::new() }).unwrap();
        // janitor reset the slots and requeued the interrupted job
        assert_eq!(d2.hsa.entry(0).active_transfers, 0);
        assert_eq!(d2.hsa.entry(0).active_from_slots(), 0);
        d2.tick(util::unix_now() + 1);
        assert_eq!(d2.spawner.reqs.len(), 1);
        assert_eq!(d2.spawner.reqs[0].msg_name, "erebus_1");
        assert_eq!(d2.spawner.reqs[0].retries, 0);
    }

    #[test]
    fn pause_and_resume_host_gate_admission() {
        let (_tmp, mut d) = setup("spd9", ONE_HOST);
        let writer = Fifo::open(d.fifos.fd_cmd.path()).unwrap();
        let mut m = FifoMessage::with_name(MsgKind::Command, "erebus");
        m.payload_a = u32::from(Command::PauseHost);
        writer.write_record(&m).unwrap();
        d.step(10);
        assert!(d.hsa.entry(0).flags().contains(HostFlags::PAUSED));
        spool(&d, "erebus_3", &[("f", b"x")]);
        feed_job(&mut d, "erebus_3");
        assert_eq!(d.spawner.reqs.len(), 0);
        let mut m = FifoMessage::with_name(MsgKind::Command, "erebus");
        m.payload_a = u32::from(Command::ResumeHost);
        writer.write_record(&m).unwrap();
        d.step(10);
        assert!(!d.hsa.entry(0).flags().contains(HostFlags::PAUSED));
        d.tick(util::unix_now() + 6);
        assert_eq!(d.spawner.reqs.len(), 1);
    }

    #[test]
    fn trl_share_follows_active_transfers() {
        let hosts = r#"[
            {"alias": "erebus", "hostname": "erebus.example.net", "port": 22,
             "protocol": "sftp", "allowed_transfers": 2, "max_errors": 3,
             "rate_limit": 1000}
        ]"#;
        let (_tmp, mut d) = setup("spd10", hosts);
        for n in 1..=2 {
            spool(&d, &format!("erebus_{}", n), &[("f", b"x")]);
            feed_job(&mut d, &format!("erebus_{}", n));
        }
        assert_eq!(d.hsa.entry(0).active_transfers, 2);
        assert_eq!(d.hsa.entry(0).trl_per_process, 500);
        let req = d.spawner.reqs[0].clone();
        feed_fin(&mut d, &req, ExitStatus::Success);
        assert_eq!(d.hsa.entry(0).trl_per_process, 1000);
    }
}
