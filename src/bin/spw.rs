use std::fs::OpenOptions;
use std::path::PathBuf;

use clap::Parser;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use spoolpilot::config::{self, Config};
use spoolpilot::error::{ExitStatus, TransferFail};
use spoolpilot::parse;
use spoolpilot::region::MmapRegion;
use spoolpilot::state::host::HostEntry;
use spoolpilot::state::job::{
    DupCheckParams, DupFlags, JobDescriptor, Priority, SpecialFlags, SpoolFile,
};
use spoolpilot::util;
use spoolpilot::worker::{self, WorkerContext, burst::BurstListener, collect_spool_files};

/// 传输工作进程 — one process per admitted job, spawned by spd.
#[derive(Parser)]
#[clap(author, version, about = "spoolpilot transfer worker", long_about = None)]
struct Args {
    work_dir: PathBuf,
    job_slot: usize,
    region_generation: u32,
    host_index: usize,
    msg_name: String,
    /// Drop files older than this many seconds before transfer.
    #[clap(short = 'a')]
    age_limit: Option<u64>,
    /// Disable archiving for this job.
    #[clap(short = 'A')]
    no_archive: bool,
    /// This is a retry of a previously failed job.
    #[clap(short = 'o')]
    retries: Option<u32>,
    /// Resend from the archive tree (msg name is the archive subpath).
    #[clap(short = 'r')]
    resend: bool,
    /// Dial the alternate host of the toggle pair.
    #[clap(short = 't')]
    toggle: bool,
    /// Pull job: the directory status index to scan.
    #[clap(short = 'd')]
    dir_index: Option<usize>,
}

fn main() {
    let args = Args::parse();
    worker::signals::install_worker_handlers();
    init_tracing(&args.work_dir);
    util::init_event_dir(args.work_dir.join("logs"));

    // the one place a result becomes a process exit code
    match run(&args) {
        Ok(()) => std::process::exit(i32::from(u8::from(ExitStatus::Success))),
        Err(f) => {
            if f.status != ExitStatus::Success {
                tracing::error!("[sf] {} failed: {}", args.msg_name, f);
            }
            std::process::exit(i32::from(u8::from(f.status)));
        }
    }
}

fn fail(status: ExitStatus, e: impl std::fmt::Display) -> TransferFail {
    TransferFail::new(status, e.to_string())
}

fn run(args: &Args) -> Result<(), TransferFail> {
    let cfg = Config::init(Some(args.work_dir.clone()))
        .map_err(|e| fail(ExitStatus::AllocError, e))?;
    let hsa = MmapRegion::<HostEntry>::attach(config::hsa_path(&args.work_dir))
        .map_err(|e| fail(ExitStatus::AllocError, e))?;
    if hsa.generation() != args.region_generation {
        tracing::debug!(
            "[sf] region generation moved ({} -> {})",
            args.region_generation,
            hsa.generation()
        );
    }
    if args.host_index >= hsa.count() as usize {
        return Err(fail(ExitStatus::AllocError, "host index out of range"));
    }
    let host = *hsa.entry(args.host_index);
    let alias = host.alias_str();

    // recipient material lives in the seed table, keyed by alias
    let seed = cfg
        .load_host_seeds()
        .map_err(|e| fail(ExitStatus::AllocError, e))?
        .into_iter()
        .find(|s| s.alias == alias)
        .ok_or_else(|| fail(ExitStatus::AllocError, format!("主机 '{}' 无配置", alias)))?;

    let mut special = SpecialFlags::default();
    if args.resend {
        special |= SpecialFlags::RESEND_FROM_ARCHIVE;
    }
    if args.toggle {
        special |= SpecialFlags::TOGGLE_HOST;
    }
    if args.retries.unwrap_or(0) > 0 {
        special |= SpecialFlags::OLD_ERROR_JOB;
    }

    let mut target_dir = seed.target_dir.clone();
    let mut user = seed.user.clone();
    let mut password = seed.password.clone();

    // pull jobs take their source location from the DSE url
    let dse = match args.dir_index {
        Some(d) => {
            let dsa = MmapRegion::<spoolpilot::state::dir::DirEntry>::attach(config::dsa_path(
                &args.work_dir,
            ))
            .map_err(|e| fail(ExitStatus::AllocError, e))?;
            if d >= dsa.count() as usize {
                return Err(fail(ExitStatus::AllocError, "dir index out of range"));
            }
            let dse = *dsa.entry(d);
            if let Some(url) = parse::parse_url(&dse.url_str()) {
                target_dir = url.path;
                if let Some(u) = url.user {
                    user = u;
                }
                if url.password.is_some() {
                    password = url.password;
                }
            }
            Some(dse)
        }
        None => None,
    };

    let files: Vec<SpoolFile> = if dse.is_some() {
        Vec::new()
    } else if args.resend {
        collect_archive_files(&cfg, &args.msg_name)?
    } else {
        collect_spool_files(&args.work_dir, &args.msg_name)
            .map_err(|e| fail(ExitStatus::ReadLocalError, e))?
    };

    let tjd = JobDescriptor {
        work_dir: args.work_dir.clone(),
        job_slot: args.job_slot,
        host_index: args.host_index,
        dir_index: args.dir_index,
        msg_name: args.msg_name.clone(),
        job_id: parse::parse_msg_name(&args.msg_name).map(|(_, id)| id).unwrap_or(0),
        user,
        password,
        target_dir,
        files,
        archive_secs: if args.no_archive { 0 } else { seed.archive_secs },
        retries: args.retries.unwrap_or(0),
        special,
        dup: DupCheckParams {
            flags: DupFlags::from_bits_truncate(seed.dup_flags),
            timeout: seed.dup_timeout,
        },
        priority: Priority::default(),
        age_limit: args.age_limit,
    };

    let mut ctx =
        WorkerContext::new(tjd, hsa).map_err(|e| fail(ExitStatus::AllocError, e))?;
    let mut codec = spoolpilot::proto::codec_for(host.protocol());

    match dse {
        Some(dse) => {
            let masks = cfg
                .load_dir_seeds()
                .map_err(|e| fail(ExitStatus::AllocError, e))?
                .into_iter()
                .find(|s| s.alias == dse.alias_str())
                .map(|s| s.mask_groups())
                .unwrap_or_else(|| vec![spoolpilot::scan::MaskGroup::from_strings(&["*"])]);
            worker::run_pull(&mut ctx, codec.as_mut(), dse, &masks).map(|_| ())
        }
        None => {
            let mut listener =
                BurstListener::open(&args.work_dir, args.host_index, args.job_slot);
            worker::run_push(&mut ctx, codec.as_mut(), listener.as_mut()).map(|_| ())
        }
    }
}

/// Resend jobs list their files out of the archive tree; nothing there is
/// unlinked afterwards.
fn collect_archive_files(cfg: &Config, subpath: &str) -> Result<Vec<SpoolFile>, TransferFail> {
    let dir = cfg.archive_root().join(subpath);
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(&dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| fail(ExitStatus::ReadLocalError, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry.metadata().map_err(|e| fail(ExitStatus::ReadLocalError, e))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(-1);
        files.push(SpoolFile {
            name: entry.file_name().to_string_lossy().to_string(),
            path: entry.path().to_path_buf(),
            size: meta.len(),
            mtime,
        });
    }
    if files.is_empty() {
        return Err(fail(ExitStatus::ReadLocalError, format!("归档为空: {}", dir.display())));
    }
    Ok(files)
}

fn init_tracing(work_dir: &std::path::Path) {
    let logs_dir = work_dir.join("logs");
    let _ = std::fs::create_dir_all(&logs_dir);
    let log_path = logs_dir.join("spw.log");
    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (non_blocking_writer, guard) = non_blocking(file);
            let _ = Box::leak(Box::new(guard));
            let file_layer = fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new("info"));
            tracing_subscriber::registry().with(file_layer).init();
        }
        Err(_) => {
            // a worker without a log file still transfers
        }
    }
}
