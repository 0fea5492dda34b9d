pub mod burst;
pub mod signals;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::archive::{ArchiveSink, unlink_with_retry};
use crate::dupcheck::{DupStore, DupVerdict};
use crate::error::{ExitStatus, TransferFail};
use crate::fifo::{Fifo, FifoMessage, FifoSet, MsgKind};
use crate::proto::{DialTarget, RemoteLike};
use crate::ratelimit::Pacer;
use crate::region::MmapRegion;
use crate::region::lock::{LOCK_CON, LOCK_EC, LOCK_HS, RegionLocks, host_lock_offset, retr_file_lock_offset};
use crate::retrieve::RetrieveList;
use crate::scan::{MaskGroup, ScanInput, reconcile};
use crate::state::dir::DirEntry;
use crate::state::host::{
    ConnectStatus, HostEntry, HostFlags, ProtoOptions, UNIQUE_KILLED, UNIQUE_ORDINARY,
    make_unique_tag,
};
use crate::state::job::{JobDescriptor, SpecialFlags, SpoolFile};
use crate::util;
use burst::{BurstListener, BurstSignal};
use signals::{exit_requested, quit_requested};

/// Everything one worker process holds; globals folded into a context that
/// travels through the engine explicitly.
pub struct WorkerContext {
    pub tjd: JobDescriptor,
    pub hsa: MmapRegion<HostEntry>,
    pub host_locks: RegionLocks,
    pub dup: Option<DupStore>,
    pub archive_root: PathBuf,
    pub sf_fin: Option<Fifo>,
    pub wake_up: Option<Fifo>,
    pub transfer_log: Option<Fifo>,
}

impl WorkerContext {
    pub fn new(tjd: JobDescriptor, hsa: MmapRegion<HostEntry>) -> anyhow::Result<Self> {
        let host_locks = RegionLocks::new(hsa.file())?;
        let archive_root = tjd.work_dir.join("archive");
        let dup = if tjd.dup.timeout > 0 {
            Some(DupStore::open_in(&tjd.work_dir)?)
        } else {
            None
        };
        let fifo_dir = FifoSet::fifo_dir(&tjd.work_dir);
        let sf_fin = Fifo::open(fifo_dir.join("sf_fin")).ok();
        let wake_up = Fifo::open(fifo_dir.join("spd_wake_up")).ok();
        let transfer_log = Fifo::open(fifo_dir.join("transfer_log")).ok();
        Ok(Self { tjd, hsa, host_locks, dup, archive_root, sf_fin, wake_up, transfer_log })
    }

    fn host(&self) -> HostEntry {
        *self.hsa.entry(self.tjd.host_index)
    }
}

/// Per-run accounting for the "what done" summary and the dispatcher's
/// termination record.
#[derive(Debug, Default, Clone)]
pub struct JobOutcome {
    pub files_done: u32,
    pub bytes_done: u64,
    pub files_skipped_dup: u32,
    pub files_deleted_dup: u32,
    pub files_dropped_age: u32,
    pub archived: u32,
    pub retrieved: u32,
    pub burst_count: u32,
    pub killed_by_control: bool,
}

/// List the spooled files of a message, oldest first. The job lock file and
/// dot names are not payload.
pub fn collect_spool_files(work_dir: &Path, msg_name: &str) -> std::io::Result<Vec<SpoolFile>> {
    let dir = work_dir.join("outgoing").join(msg_name);
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(&dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let meta = entry.metadata().map_err(std::io::Error::other)?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(-1);
        files.push(SpoolFile {
            name,
            path: entry.path().to_path_buf(),
            size: meta.len(),
            mtime,
        });
    }
    Ok(files)
}

fn build_target(host: &HostEntry, tjd: &JobDescriptor) -> DialTarget {
    let toggle = if tjd.special.contains(SpecialFlags::TOGGLE_HOST) {
        host.host_toggle ^ 1
    } else {
        host.host_toggle
    };
    DialTarget {
        hostname: host.hostname(toggle),
        port: host.port,
        user: tjd.user.clone(),
        password: tjd.password.clone(),
        family: host.protocol(),
        options: host.options(),
        base: tjd.target_dir.clone(),
        block_size: host.block_size,
        timeout_secs: host.transfer_timeout,
    }
}

fn codec_fail(e: crate::proto::CodecError) -> TransferFail {
    TransferFail::new(e.exit_status(), e.to_string())
}

fn lock_fail(e: std::io::Error) -> TransferFail {
    TransferFail::new(ExitStatus::AllocError, format!("region lock failed: {}", e))
}

/// 信号驱动的中止检查 — between chunks and files. A burst-control kill
/// (marker byte 5) is an intended termination and maps to SUCCESS.
fn check_cancel(ctx: &WorkerContext, out: &mut JobOutcome) -> Result<(), TransferFail> {
    if !exit_requested() {
        return Ok(());
    }
    if quit_requested() {
        return Err(TransferFail::new(ExitStatus::Incorrect, "terminated by SIGQUIT"));
    }
    let marker = ctx.hsa.entry(ctx.tjd.host_index).jobs[ctx.tjd.job_slot].unique_name[2];
    if marker == UNIQUE_KILLED {
        out.killed_by_control = true;
        return Err(TransferFail::new(ExitStatus::Success, "terminated by burst control"));
    }
    Err(TransferFail::new(ExitStatus::GotKilled, "terminated by signal"))
}

fn set_connecting(ctx: &mut WorkerContext) -> Result<(), TransferFail> {
    let h = ctx.tjd.host_index;
    let slot = ctx.tjd.job_slot;
    let job_id = ctx.tjd.job_id;
    let _con = ctx.host_locks.lock(host_lock_offset(h, LOCK_CON)).map_err(lock_fail)?;
    ctx.hsa.update(h, |host| {
        let s = &mut host.jobs[slot];
        s.set_status(ConnectStatus::Connecting);
        let tag = make_unique_tag(util::unix_now());
        s.unique_name[0] = tag[0];
        s.unique_name[1] = tag[1];
        if s.unique_name[2] != UNIQUE_KILLED {
            s.unique_name[2] = UNIQUE_ORDINARY;
        }
        s.job_id = job_id;
    });
    Ok(())
}

fn set_ready(ctx: &mut WorkerContext) -> Result<(), TransferFail> {
    let h = ctx.tjd.host_index;
    let slot = ctx.tjd.job_slot;
    let files = ctx.tjd.files.len() as u32;
    let bytes = ctx.tjd.total_bytes();
    let status = ctx.host().protocol().active_status();
    let _con = ctx.host_locks.lock(host_lock_offset(h, LOCK_CON)).map_err(lock_fail)?;
    ctx.hsa.update(h, |host| {
        let s = &mut host.jobs[slot];
        s.set_status(status);
        s.no_of_files = files;
        s.file_size = bytes;
        host.connections = host.connections.saturating_add(1);
    });
    Ok(())
}

/// First-success recovery: wipe the error account, lift an auto-pause with
/// its "error-end" event and nudge the dispatcher.
fn recovery_side_effect(ctx: &mut WorkerContext, done: &mut bool) {
    if *done {
        return;
    }
    *done = true;
    let h = ctx.tjd.host_index;
    let alias = ctx.host().alias_str();
    if ctx.host().error_counter > 0 {
        if let Ok(_ec) = ctx.host_locks.lock(host_lock_offset(h, LOCK_EC)) {
            ctx.hsa.update(h, |host| host.clear_errors());
        }
    }
    if ctx.host().flags().contains(HostFlags::AUTO_PAUSED) {
        if let Ok(_hs) = ctx.host_locks.lock(host_lock_offset(h, LOCK_HS)) {
            ctx.hsa.update(h, |host| {
                host.set_flag(HostFlags::AUTO_PAUSED, false);
                host.set_flag(HostFlags::ERROR_QUEUE_SET, false);
                host.set_flag(HostFlags::ACTION_SUCCESS, true);
            });
        }
        tracing::info!("[sf] {} error-end", alias);
        util::write_event("error-end", serde_json::json!({ "host": alias }));
    }
    if let Some(w) = &ctx.wake_up {
        w.write_wakeup();
    }
}

fn emit_output_log(ctx: &WorkerContext, file: &SpoolFile, archived_to: Option<&Path>, millis: u128) {
    util::write_event(
        "output",
        serde_json::json!({
            "host": ctx.host().alias_str(),
            "job": ctx.tjd.msg_name,
            "file": file.name,
            "size": file.size,
            "archive": archived_to.map(|p| p.display().to_string()),
            "trans_ms": millis as u64,
            "retries": ctx.tjd.retries,
            "output_type": "normal",
        }),
    );
    if let Some(log) = &ctx.transfer_log {
        let mut m = FifoMessage::with_name(MsgKind::TransLog, &file.name);
        m.host_slot = ctx.tjd.host_index as u8;
        m.job_slot = ctx.tjd.job_slot as u8;
        m.payload_a = (file.size & 0xffff_ffff) as u32;
        m.payload_b = millis.min(u32::MAX as u128) as u32;
        let _ = log.write_record(&m);
    }
}

/// Push one message's files through the open connection.
fn send_files(
    ctx: &mut WorkerContext,
    codec: &mut dyn RemoteLike,
    pacer: &mut Pacer,
    out: &mut JobOutcome,
    recovered: &mut bool,
) -> Result<(), TransferFail> {
    let host = ctx.host();
    let h = ctx.tjd.host_index;
    let slot = ctx.tjd.job_slot;
    let timeout = Duration::from_secs(host.transfer_timeout.max(1) as u64);
    let block = host.block_size.clamp(256, 1024 * 1024) as usize;
    let enforce_timeout = host.options().contains(ProtoOptions::TIMEOUT_TRANSFER);
    let silent = ctx.tjd.special.contains(SpecialFlags::SILENT_NOT_LOCKED_FILE);
    let now = util::unix_now();
    let mut archive = if ctx.tjd.archive_secs > 0 {
        let tag = ctx.hsa.entry(h).jobs[slot].unique_name;
        Some(ArchiveSink::new(
            &ctx.archive_root,
            &host.alias_str(),
            ctx.tjd.job_id,
            &format!("{:02x}{:02x}", tag[0], tag[1]),
            now,
        ))
    } else {
        None
    };

    let files = ctx.tjd.files.clone();
    for file in &files {
        check_cancel(ctx, out)?;

        // a. age limit drops stale spool files before any remote round trip
        if let Some(age_limit) = ctx.tjd.age_limit
            && file.mtime >= 0
            && now - file.mtime > age_limit as i64
        {
            let _ = unlink_with_retry(&file.path);
            out.files_dropped_age += 1;
            tracing::debug!("[sf] {} dropped by age limit", file.name);
            continue;
        }

        // b. duplicate suppression
        if let Some(store) = ctx.dup.as_mut()
            && store
                .check_and_insert(&ctx.tjd.dup, file, now)
                .map_err(|e| TransferFail::new(ExitStatus::AllocError, e.to_string()))?
                == DupVerdict::Duplicate
        {
            if ctx.tjd.dup.flags.contains(crate::state::job::DupFlags::DELETE) {
                let _ = unlink_with_retry(&file.path);
                out.files_deleted_dup += 1;
                continue;
            } else if ctx.tjd.dup.flags.contains(crate::state::job::DupFlags::WARN_ONLY) {
                tracing::warn!("[sf] duplicate (sent anyway): {}", file.name);
                // falls through to the transfer below
            } else {
                // suppressed: the source is consumed, never delivered
                let _ = unlink_with_retry(&file.path);
                out.files_skipped_dup += 1;
                tracing::info!("[sf] duplicate skipped: {}", file.name);
                continue;
            }
        }

        // c. publish per-file progress
        ctx.hsa.update(h, |host| {
            let s = &mut host.jobs[slot];
            s.file_size_in_use = file.size;
            s.file_size_in_use_done = 0;
            s.set_file_in_use(&file.name);
        });

        let started = Instant::now();
        let deadline = started + timeout;
        let mut local = std::fs::File::open(&file.path).map_err(|e| {
            TransferFail::new(
                ExitStatus::ReadLocalError,
                format!("本地打开失败: {} — {}", file.path.display(), e),
            )
        })?;
        codec.open_write(&file.name, file.size, deadline).map_err(codec_fail)?;

        // d. WMO-style header injection
        if ctx.tjd.special.contains(SpecialFlags::FILE_NAME_IS_HEADER) {
            let header = format!("{}\r\n", file.name);
            codec.write_chunk(header.as_bytes(), deadline).map_err(codec_fail)?;
        }

        let mut buf = vec![0u8; block];
        let mut sent: u64 = 0;
        pacer.reset();
        loop {
            check_cancel(ctx, out)?;
            if enforce_timeout && Instant::now() > deadline {
                return Err(TransferFail::new(
                    ExitStatus::StillFilesToSend,
                    format!("transfer timeout on {}", file.name),
                ));
            }
            let n = local.read(&mut buf).map_err(|e| {
                TransferFail::new(
                    ExitStatus::ReadLocalError,
                    format!("本地读取失败: {} — {}", file.path.display(), e),
                )
            })?;
            if n == 0 {
                break;
            }
            codec.write_chunk(&buf[..n], deadline).map_err(codec_fail)?;
            sent += n as u64;
            pacer.consume(n as u64);
            ctx.hsa.update(h, |host| {
                host.jobs[slot].file_size_in_use_done = sent;
            });
        }
        codec.close_file(deadline).map_err(codec_fail)?;

        // e. observed bytes vs expected
        if sent != file.size {
            let line = format!("{}: sent {} bytes, expected {}", file.name, sent, file.size);
            if silent {
                tracing::debug!("[sf] {}", line);
            } else {
                tracing::warn!("[sf] {}", line);
            }
        }

        // f. archive or unlink the source
        let mut archived_to = None;
        if ctx.tjd.special.contains(SpecialFlags::RESEND_FROM_ARCHIVE) {
            // resend sources stay in the archive tree
        } else if let Some(sink) = archive.as_mut() {
            let (dest, _outcome) = sink.archive(&file.path, &file.name).map_err(|e| {
                TransferFail::new(ExitStatus::ReadLocalError, format!("归档失败: {}", e))
            })?;
            out.archived += 1;
            archived_to = Some(dest);
        } else {
            unlink_with_retry(&file.path).map_err(|e| {
                TransferFail::new(
                    ExitStatus::ReadLocalError,
                    format!("删除源文件失败: {} — {}", file.path.display(), e),
                )
            })?;
        }

        // g. accounting + output log
        out.files_done += 1;
        out.bytes_done += sent;
        ctx.hsa.update(h, |host| {
            let s = &mut host.jobs[slot];
            s.no_of_files_done = s.no_of_files_done.saturating_add(1);
            s.file_size_done = s.file_size_done.saturating_add(sent);
            s.file_size_in_use = 0;
            s.file_size_in_use_done = 0;
            s.file_name_in_use.fill(0);
        });
        emit_output_log(ctx, file, archived_to.as_deref(), started.elapsed().as_millis());

        // h. first success clears the host's error account
        recovery_side_effect(ctx, recovered);
    }
    Ok(())
}

/// Step 5: drop the job lock file when we are the last active transfer, then
/// take the whole spool directory away.
fn finish_job(ctx: &WorkerContext) -> Result<(), TransferFail> {
    if ctx.tjd.special.contains(SpecialFlags::RESEND_FROM_ARCHIVE) {
        return Ok(());
    }
    let spool = ctx.tjd.spool_dir();
    if !spool.exists() {
        return Ok(());
    }
    let lockfile = spool.join(".lock");
    if lockfile.exists() && ctx.host().active_transfers <= 1 {
        std::fs::remove_file(&lockfile).map_err(|e| {
            TransferFail::new(
                ExitStatus::RemoveLockfileError,
                format!("{}: {}", lockfile.display(), e),
            )
        })?;
    }
    let leftovers = collect_spool_files(&ctx.tjd.work_dir, &ctx.tjd.msg_name)
        .map(|v| v.len())
        .unwrap_or(0);
    if leftovers > 0 {
        return Err(TransferFail::new(
            ExitStatus::StillFilesToSend,
            format!("{} files left in {}", leftovers, spool.display()),
        ));
    }
    std::fs::remove_dir_all(&spool).map_err(|e| {
        TransferFail::new(ExitStatus::ReadLocalError, format!("{}: {}", spool.display(), e))
    })?;
    Ok(())
}

fn may_burst(host: &HostEntry) -> bool {
    host.protocol().supports_burst()
        && host.keep_connected > 0
        && !host.options().contains(ProtoOptions::NO_BURST)
        && !host.options().contains(ProtoOptions::KEEP_CONNECTED_DISCONNECT)
}

/// Step 7: "what done" summary, slot reset, termination record. Runs on
/// every exit path once the slot was claimed.
fn finalize(ctx: &mut WorkerContext, out: &JobOutcome, status: ExitStatus) {
    let h = ctx.tjd.host_index;
    let slot = ctx.tjd.job_slot;
    let mut what = format!(
        "{} files {}",
        out.files_done + out.retrieved,
        util::size_display(out.bytes_done)
    );
    if out.burst_count > 0 {
        what.push_str(&format!(" [BURST * {}]", out.burst_count + 1));
    }
    tracing::info!("[sf] {} what-done: {} -> {:?}", ctx.tjd.msg_name, what, status);
    util::write_event(
        "what-done",
        serde_json::json!({
            "host": ctx.host().alias_str(),
            "job": ctx.tjd.msg_name,
            "summary": what,
            "status": u8::from(status),
            "skipped_dup": out.files_skipped_dup,
            "dropped_age": out.files_dropped_age,
            "archived": out.archived,
        }),
    );
    if let Ok(_con) = ctx.host_locks.lock(host_lock_offset(h, LOCK_CON)) {
        ctx.hsa.update(h, |host| {
            host.jobs[slot].reset();
            host.active_transfers = host.active_transfers.saturating_sub(1);
        });
    }
    let _ = ctx.hsa.flush();
    if let Some(fin) = &ctx.sf_fin {
        let mut m = FifoMessage::with_name(MsgKind::WorkerFin, &ctx.tjd.msg_name);
        m.host_slot = h as u8;
        m.job_slot = slot as u8;
        m.payload_a = u8::from(status) as u32;
        m.payload_b = out.files_done + out.retrieved;
        let _ = fin.write_record(&m);
    }
}

/// 推送主循环 — the push-mode worker lifecycle: connect, iterate files,
/// archive/unlink, burst, exit.
pub fn run_push(
    ctx: &mut WorkerContext,
    codec: &mut dyn RemoteLike,
    mut burst: Option<&mut BurstListener>,
) -> Result<JobOutcome, TransferFail> {
    let mut out = JobOutcome::default();
    let res = push_inner(ctx, codec, &mut burst, &mut out);
    let status = match &res {
        Ok(()) => ExitStatus::Success,
        Err(f) => f.status,
    };
    codec.quit();
    finalize(ctx, &out, status);
    res.map(|()| out)
}

fn push_inner(
    ctx: &mut WorkerContext,
    codec: &mut dyn RemoteLike,
    burst: &mut Option<&mut BurstListener>,
    out: &mut JobOutcome,
) -> Result<(), TransferFail> {
    set_connecting(ctx)?;
    let host = ctx.host();
    let timeout = Duration::from_secs(host.transfer_timeout.max(1) as u64);
    let target = build_target(&host, &ctx.tjd);
    let connected_at = Instant::now();
    codec.dial(&target, connected_at + timeout).map_err(codec_fail)?;
    set_ready(ctx)?;

    let rate = if host.trl_per_process > 0 { host.trl_per_process } else { host.rate_limit };
    let mut pacer = Pacer::new(rate as u64);
    let mut recovered = false;

    loop {
        send_files(ctx, codec, &mut pacer, out, &mut recovered)?;
        finish_job(ctx)?;

        // step 6: keep the connection open for a follow-up message?
        let Some(listener) = burst.as_deref_mut() else { break };
        if !may_burst(&host) {
            break;
        }
        let keep = Duration::from_secs(host.keep_connected as u64);
        let elapsed = connected_at.elapsed();
        if elapsed >= keep {
            break;
        }
        match listener.wait(keep - elapsed) {
            BurstSignal::Yes(msg_name) => {
                let files =
                    collect_spool_files(&ctx.tjd.work_dir, &msg_name).map_err(|e| {
                        TransferFail::new(ExitStatus::ReadLocalError, e.to_string())
                    })?;
                tracing::debug!("[sf][burst] continuing with {}", msg_name);
                ctx.tjd.msg_name = msg_name;
                ctx.tjd.files = files;
                out.burst_count += 1;
                let h = ctx.tjd.host_index;
                let slot = ctx.tjd.job_slot;
                let nfiles = ctx.tjd.files.len() as u32;
                let nbytes = ctx.tjd.total_bytes();
                ctx.hsa.update(h, |host| {
                    let s = &mut host.jobs[slot];
                    s.no_of_files = s.no_of_files.saturating_add(nfiles);
                    s.file_size = s.file_size.saturating_add(nbytes);
                    if s.unique_name[2] == crate::state::host::UNIQUE_BURST {
                        s.unique_name[2] = UNIQUE_ORDINARY;
                    }
                });
                continue;
            }
            BurstSignal::No | BurstSignal::Neither => break,
        }
    }
    Ok(())
}

/// 拉取主循环 — pull mode: list the remote directory, reconcile against the
/// retrieve list, fetch what this scan assigned, flag leftover work.
pub fn run_pull(
    ctx: &mut WorkerContext,
    codec: &mut dyn RemoteLike,
    dse: DirEntry,
    masks: &[MaskGroup],
) -> Result<JobOutcome, TransferFail> {
    let mut out = JobOutcome::default();
    let res = pull_inner(ctx, codec, &dse, masks, &mut out);
    let status = match &res {
        Ok(()) => ExitStatus::Success,
        Err(f) => f.status,
    };
    codec.quit();
    finalize(ctx, &out, status);
    res.map(|()| out)
}

fn pull_inner(
    ctx: &mut WorkerContext,
    codec: &mut dyn RemoteLike,
    dse: &DirEntry,
    masks: &[MaskGroup],
    out: &mut JobOutcome,
) -> Result<(), TransferFail> {
    set_connecting(ctx)?;
    let host = ctx.host();
    let timeout = Duration::from_secs(host.transfer_timeout.max(1) as u64);
    let target = build_target(&host, &ctx.tjd);
    codec.dial(&target, Instant::now() + timeout).map_err(codec_fail)?;
    set_ready(ctx)?;

    let mut rl = if dse.volatile() {
        match RetrieveList::attach_volatile(&ctx.tjd.work_dir, dse.dir_id)
            .map_err(|e| TransferFail::new(ExitStatus::AllocError, e.to_string()))?
        {
            Some(rl) => rl,
            None => {
                // another scanner owns the volatile list; this scan is done
                return Ok(());
            }
        }
    } else {
        RetrieveList::attach(&ctx.tjd.work_dir, dse.dir_id)
            .map_err(|e| TransferFail::new(ExitStatus::AllocError, e.to_string()))?
    };

    let deadline = Instant::now() + timeout;
    let listing = codec.list(deadline).map_err(codec_fail)?;
    let input = ScanInput {
        dse: *dse,
        masks,
        job_slot: ctx.tjd.job_slot,
        special: ctx.tjd.special,
        now: util::unix_now(),
        deadline,
    };
    let scanned = reconcile(&mut rl, &listing, &input, Some(&mut *codec));

    let incoming = ctx.tjd.work_dir.join("incoming").join(dse.alias_str());
    std::fs::create_dir_all(&incoming)
        .map_err(|e| TransferFail::new(ExitStatus::ReadLocalError, e.to_string()))?;

    let remove_after = dse.scan().contains(crate::state::dir::ScanFlags::REMOVE);
    let block = host.block_size.clamp(256, 1024 * 1024) as usize;
    let rate = if host.trl_per_process > 0 { host.trl_per_process } else { host.rate_limit };
    let mut pacer = Pacer::new(rate as u64);
    let mut recovered = false;
    let h = ctx.tjd.host_index;
    let slot = ctx.tjd.job_slot;

    for idx in &scanned.selected {
        check_cancel(ctx, out)?;
        let _entry_lock = rl
            .locks()
            .lock(retr_file_lock_offset(*idx))
            .map_err(|e| TransferFail::new(ExitStatus::AllocError, e.to_string()))?;
        let name = rl.entry(*idx).name();
        let expected = rl.entry(*idx).size;

        ctx.hsa.update(h, |host| {
            let s = &mut host.jobs[slot];
            s.file_size_in_use = expected.max(0) as u64;
            s.set_file_in_use(&name);
        });

        let deadline = Instant::now() + timeout;
        codec.open_read(&name, deadline).map_err(codec_fail)?;
        let part = incoming.join(format!(".{}.part", name));
        let mut local = std::fs::File::create(&part)
            .map_err(|e| TransferFail::new(ExitStatus::ReadLocalError, e.to_string()))?;
        let mut buf = vec![0u8; block];
        let mut got: u64 = 0;
        pacer.reset();
        loop {
            check_cancel(ctx, out)?;
            let n = codec.read_chunk(&mut buf, deadline).map_err(codec_fail)?;
            if n == 0 {
                break;
            }
            use std::io::Write as _;
            local
                .write_all(&buf[..n])
                .map_err(|e| TransferFail::new(ExitStatus::ReadLocalError, e.to_string()))?;
            got += n as u64;
            pacer.consume(n as u64);
            ctx.hsa.update(h, |host| {
                host.jobs[slot].file_size_in_use_done = got;
            });
        }
        codec.close_file(deadline).map_err(codec_fail)?;
        local
            .sync_all()
            .map_err(|e| TransferFail::new(ExitStatus::ReadLocalError, e.to_string()))?;
        drop(local);
        std::fs::rename(&part, incoming.join(&name))
            .map_err(|e| TransferFail::new(ExitStatus::ReadLocalError, e.to_string()))?;

        {
            let e = rl.entry_mut(*idx);
            e.retrieved = 1;
            e.assigned = 0;
            if e.size < 0 {
                e.size = got as i64;
            }
        }
        if remove_after {
            if let Err(e) = codec.delete(&name, deadline) {
                tracing::debug!("[gf] remove after retrieve {}: {}", name, e);
            }
        }
        out.retrieved += 1;
        out.bytes_done += got;
        ctx.hsa.update(h, |host| {
            let s = &mut host.jobs[slot];
            s.no_of_files_done = s.no_of_files_done.saturating_add(1);
            s.file_size_done = s.file_size_done.saturating_add(got);
            s.file_size_in_use = 0;
            s.file_size_in_use_done = 0;
            s.file_name_in_use.fill(0);
        });
        recovery_side_effect(ctx, &mut recovered);
    }
    let _ = rl.flush();

    if scanned.more_files_in_list {
        return Err(TransferFail::new(
            ExitStatus::StillFilesToSend,
            "budget hit, more files in list",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::local::LocalCodec;
    use crate::state::host::MAX_JOB_SLOTS;
    use crate::state::job::{DupCheckParams, DupFlags, Priority};
    use zerocopy::FromBytes;

    fn make_host(dir: &Path, alias: &str) -> MmapRegion<HostEntry> {
        let mut hsa = MmapRegion::<HostEntry>::create(dir.join("hsa.region"), 1).unwrap();
        let mut h =
            HostEntry::read_from_bytes(&vec![0u8; std::mem::size_of::<HostEntry>()][..]).unwrap();
        h.set_alias(alias);
        h.set_hostname(0, "localhost");
        h.block_size = 4096;
        h.transfer_timeout = 30;
        h.allowed_transfers = 2;
        h.max_errors = 3;
        h.active_transfers = 1; // the dispatcher accounts for us at spawn
        *hsa.entry_mut(0) = h;
        hsa
    }

    fn spool_job(work_dir: &Path, msg: &str, files: &[(&str, &[u8])]) {
        let dir = work_dir.join("outgoing").join(msg);
        std::fs::create_dir_all(&dir).unwrap();
        for (name, body) in files {
            std::fs::write(dir.join(name), body).unwrap();
        }
    }

    fn tjd(work_dir: &Path, msg: &str, target_dir: &Path) -> JobDescriptor {
        JobDescriptor {
            work_dir: work_dir.to_path_buf(),
            job_slot: 0,
            host_index: 0,
            dir_index: None,
            msg_name: msg.to_string(),
            job_id: 7,
            user: "sp".into(),
            password: None,
            target_dir: target_dir.display().to_string(),
            files: collect_spool_files(work_dir, msg).unwrap(),
            archive_secs: 0,
            retries: 0,
            special: SpecialFlags::default(),
            dup: DupCheckParams::default(),
            priority: Priority::default(),
            age_limit: None,
        }
    }

    #[test]
    fn happy_path_push_delivers_in_order_and_cleans_spool() {
        // S1: three files, delivered in order, spool removed, slot reset
        signals::reset_flags();
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let dest = tmp.path().join("dest");
        spool_job(&work, "s1_msg", &[
            ("f1", &vec![b'a'; 1000][..]),
            ("f2", &vec![b'b'; 2000][..]),
            ("f3", &vec![b'c'; 3000][..]),
        ]);
        let hsa = make_host(tmp.path(), "mimas");
        let mut ctx = WorkerContext::new(tjd(&work, "s1_msg", &dest), hsa).unwrap();
        let mut codec = LocalCodec::new();
        let out = run_push(&mut ctx, &mut codec, None).unwrap();
        assert_eq!(out.files_done, 3);
        assert_eq!(out.bytes_done, 6000);
        assert!(!work.join("outgoing").join("s1_msg").exists());
        for f in ["f1", "f2", "f3"] {
            assert!(dest.join(f).exists());
        }
        // slot reset, counters decremented
        let h = ctx.hsa.entry(0);
        assert_eq!(h.active_transfers, 0);
        assert_eq!(h.jobs[0].status(), ConnectStatus::Disconnect);
        assert_eq!(h.jobs[0].no_of_files, 0);
        assert_eq!(h.connections, 1);
        // invariant 2 after completion
        assert_eq!(h.active_from_slots(), h.active_transfers);
    }

    #[test]
    fn archive_keeps_sources_under_dated_tree() {
        signals::reset_flags();
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let dest = tmp.path().join("dest");
        spool_job(&work, "arch_1", &[("keepme.dat", b"hello")]);
        let hsa = make_host(tmp.path(), "rhea");
        let mut j = tjd(&work, "arch_1", &dest);
        j.archive_secs = 3600;
        let mut ctx = WorkerContext::new(j, hsa).unwrap();
        let mut codec = LocalCodec::new();
        let out = run_push(&mut ctx, &mut codec, None).unwrap();
        assert_eq!(out.archived, 1);
        assert!(dest.join("keepme.dat").exists());
        // exactly one archived copy somewhere under archive/rhea/<date>/7/
        let found: Vec<_> = walkdir::WalkDir::new(work.join("archive").join("rhea"))
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .collect();
        assert_eq!(found.len(), 1);
        assert_eq!(std::fs::read(found[0].path()).unwrap(), b"hello");
    }

    #[test]
    fn duplicate_files_are_skipped_with_accounting() {
        signals::reset_flags();
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let dest = tmp.path().join("dest");
        spool_job(&work, "dup_a", &[("same.txt", b"payload")]);
        let hsa = make_host(tmp.path(), "h");
        let mut j = tjd(&work, "dup_a", &dest);
        j.dup = DupCheckParams { flags: DupFlags::NAME, timeout: 3600 };
        let mut ctx = WorkerContext::new(j, hsa).unwrap();
        let mut codec = LocalCodec::new();
        assert_eq!(run_push(&mut ctx, &mut codec, None).unwrap().files_done, 1);

        // a second job carrying the same name is suppressed
        spool_job(&work, "dup_b", &[("same.txt", b"payload")]);
        let hsa2 = MmapRegion::<HostEntry>::attach(tmp.path().join("hsa.region")).unwrap();
        let mut j2 = tjd(&work, "dup_b", &dest);
        j2.dup = DupCheckParams { flags: DupFlags::NAME, timeout: 3600 };
        let mut ctx2 = WorkerContext::new(j2, hsa2).unwrap();
        ctx2.hsa.entry_mut(0).active_transfers = 1;
        let mut codec2 = LocalCodec::new();
        let out = run_push(&mut ctx2, &mut codec2, None).unwrap();
        assert_eq!(out.files_done, 0);
        assert_eq!(out.files_skipped_dup, 1);
    }

    #[test]
    fn age_limit_drops_old_files() {
        signals::reset_flags();
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let dest = tmp.path().join("dest");
        spool_job(&work, "aged", &[("old.bin", b"x")]);
        let hsa = make_host(tmp.path(), "h");
        let mut j = tjd(&work, "aged", &dest);
        // everything is older than "0 seconds ago" minus 0 -> set a tiny limit
        // and an mtime far in the past
        j.files[0].mtime = 1000;
        j.age_limit = Some(60);
        let mut ctx = WorkerContext::new(j, hsa).unwrap();
        let mut codec = LocalCodec::new();
        let out = run_push(&mut ctx, &mut codec, None).unwrap();
        assert_eq!(out.files_done, 0);
        assert_eq!(out.files_dropped_age, 1);
        assert!(!dest.join("old.bin").exists());
    }

    #[test]
    fn recovery_clears_error_state_and_emits_resume() {
        signals::reset_flags();
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        let dest = tmp.path().join("dest");
        spool_job(&work, "rec_1", &[("ok.txt", b"fine")]);
        let mut hsa = make_host(tmp.path(), "tethys");
        {
            let h = hsa.entry_mut(0);
            h.error_counter = 3;
            h.error_history[0] = 10;
            h.host_status = HostFlags::AUTO_PAUSED.bits() | HostFlags::ERROR_QUEUE_SET.bits();
        }
        let mut ctx = WorkerContext::new(tjd(&work, "rec_1", &dest), hsa).unwrap();
        let mut codec = LocalCodec::new();
        run_push(&mut ctx, &mut codec, None).unwrap();
        let h = ctx.hsa.entry(0);
        assert_eq!(h.error_counter, 0);
        assert!(!h.flags().contains(HostFlags::AUTO_PAUSED));
        assert!(!h.flags().contains(HostFlags::ERROR_QUEUE_SET));
        assert!(h.flags().contains(HostFlags::ACTION_SUCCESS));
        // invariant 3: counter zero and no auto-pause after success
    }

    #[test]
    fn pull_retrieves_assigned_files_and_marks_them() {
        signals::reset_flags();
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let remote = tmp.path().join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::write(remote.join("r1.dat"), b"11111").unwrap();
        std::fs::write(remote.join("r2.dat"), b"222").unwrap();
        let hsa = make_host(tmp.path(), "pullhost");
        let mut j = tjd(&work, "pull_scan", &remote);
        j.dir_index = Some(0);
        j.files = Vec::new();
        let mut ctx = WorkerContext::new(j, hsa).unwrap();
        let mut dse =
            DirEntry::read_from_bytes(&vec![0u8; std::mem::size_of::<DirEntry>()][..]).unwrap();
        dse.dir_id = 1;
        dse.set_alias("srcdir");
        let masks = vec![crate::scan::MaskGroup::from_strings(&["*.dat"])];
        let mut codec = LocalCodec::new();
        let out = run_pull(&mut ctx, &mut codec, dse, &masks).unwrap();
        assert_eq!(out.retrieved, 2);
        assert_eq!(out.bytes_done, 8);
        assert_eq!(
            std::fs::read(work.join("incoming").join("srcdir").join("r1.dat")).unwrap(),
            b"11111"
        );
        // retrieved entries are unassigned (invariant 1)
        let rl = RetrieveList::attach(&work, 1).unwrap();
        for i in rl.indices() {
            let e = rl.entry(i);
            assert_eq!(e.retrieved, 1);
            assert_eq!(e.assigned, 0);
        }
    }

    #[test]
    fn job_slots_stay_in_bounds() {
        assert!(MAX_JOB_SLOTS <= u8::MAX as usize);
    }
}
