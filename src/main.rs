use anyhow::Result;
use clap::Parser;
use std::fs::OpenOptions;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use spoolpilot::cli::{Cli, Commands};
use spoolpilot::config::Config;
use spoolpilot::dispatch::{Dispatcher, ProcessSpawner};
use spoolpilot::fifo::{Command as FifoCommand, Fifo, FifoMessage, FifoSet, MsgKind};
use spoolpilot::{config, util};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::init(cli.work_dir.clone())?;
    init_tracing(&cfg, cli.debug);

    match cli.command {
        Commands::Init {} => {
            let (hosts, dirs) = config::bootstrap_regions(&cfg)?;
            FifoSet::create(&cfg.work_dir)?;
            println!("已初始化: {} 主机, {} 目录 — {}", hosts, dirs, cfg.work_dir.display());
            Ok(())
        }
        Commands::Run {} => {
            util::init_event_dir(cfg.work_dir.join("logs"));
            let spw = spw_path()?;
            let mut dispatcher = Dispatcher::new(cfg, ProcessSpawner { spw_path: spw })?;
            dispatcher.run();
            Ok(())
        }
        Commands::Status {} => {
            let hsa = spoolpilot::region::MmapRegion::<spoolpilot::state::host::HostEntry>::attach(
                config::hsa_path(&cfg.work_dir),
            )?;
            for h in 0..hsa.count() as usize {
                let Some(e) = hsa.read_consistent(h) else {
                    println!("{:>3}  <update in progress>", h);
                    continue;
                };
                let done: u64 = e.jobs.iter().map(|s| s.file_size_done).sum();
                println!(
                    "{:<16} {:>2}/{:<2} errors={:<3} flags={:#06x} connections={} done={}",
                    e.alias_str(),
                    e.active_transfers,
                    e.allowed_transfers,
                    e.error_counter,
                    e.host_status,
                    e.connections,
                    util::size_display(done)
                );
            }
            Ok(())
        }
        Commands::Stop {} => send_command(&cfg, FifoCommand::Shutdown, ""),
        Commands::Pause { alias } => send_command(&cfg, FifoCommand::PauseHost, &alias),
        Commands::Resume { alias } => send_command(&cfg, FifoCommand::ResumeHost, &alias),
        Commands::Debug { alias, off } => {
            let cmd = if off { FifoCommand::DebugOff } else { FifoCommand::DebugOn };
            send_command(&cfg, cmd, &alias)
        }
        Commands::Dump {} => send_command(&cfg, FifoCommand::DumpState, ""),
        Commands::Reload {} => send_command(&cfg, FifoCommand::ReloadConfig, ""),
    }
}

/// Drop one command record into the dispatcher's command fifo.
fn send_command(cfg: &Config, cmd: FifoCommand, alias: &str) -> Result<()> {
    let path = FifoSet::fifo_dir(&cfg.work_dir).join("spd_cmd");
    let fifo = Fifo::open(&path)
        .map_err(|e| anyhow::anyhow!("调度器未运行？无法打开命令 fifo: {}", e))?;
    let mut m = FifoMessage::with_name(MsgKind::Command, alias);
    m.payload_a = u32::from(cmd);
    fifo.write_record(&m)?;
    Ok(())
}

/// The worker binary sits next to `spd` in the same target/installation dir.
fn spw_path() -> Result<std::path::PathBuf> {
    let mut p = std::env::current_exe()?;
    p.set_file_name("spw");
    Ok(p)
}

fn init_tracing(cfg: &Config, debug: bool) {
    // All tracing output goes into the canonical log file only; console
    // output stays reserved for command results.
    let logs_dir = cfg.work_dir.join("logs");
    let _ = std::fs::create_dir_all(&logs_dir);
    let log_path = logs_dir.join("spd.log");
    let level_str = if debug { "debug" } else { "info" };

    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (non_blocking_writer, guard) = non_blocking(file);
            // Keep the writer thread alive for the whole process lifetime.
            let _ = Box::leak(Box::new(guard));
            let file_layer = fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(level_str));
            tracing_subscriber::registry().with(file_layer).init();
        }
        Err(e) => {
            eprintln!("warning: could not open log at {}: {}", log_path.display(), e);
        }
    }
}
