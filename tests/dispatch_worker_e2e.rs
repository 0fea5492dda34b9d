use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use spoolpilot::config::{self, Config};
use spoolpilot::dispatch::{Dispatcher, ProcessSpawner};
use spoolpilot::fifo::{Fifo, FifoMessage, FifoSet, MsgKind};
use spoolpilot::state::job::JobState;

fn write_hosts(work: &Path, dest: &Path) {
    // protocol "ftp" is served by the loopback codec: target_dir is local
    let hosts = format!(
        r#"[
            {{"alias": "loop", "hostname": "localhost", "port": 21,
              "protocol": "ftp", "allowed_transfers": 2, "max_errors": 3,
              "transfer_timeout": 30, "target_dir": "{}"}}
        ]"#,
        dest.display()
    );
    std::fs::write(work.join("etc").join("hosts.json"), hosts).unwrap();
}

fn setup(dest: &Path) -> (tempfile::TempDir, Config) {
    let tmp = tempfile::tempdir().unwrap();
    let work = tmp.path().join("work");
    let cfg = Config::init(Some(work.clone())).unwrap();
    write_hosts(&work, dest);
    config::bootstrap_regions(&cfg).unwrap();
    (tmp, cfg)
}

fn spool(work: &Path, msg: &str, files: &[(&str, &[u8])]) {
    let dir = work.join("outgoing").join(msg);
    std::fs::create_dir_all(&dir).unwrap();
    for (name, body) in files {
        std::fs::write(dir.join(name), body).unwrap();
    }
}

fn dispatcher(cfg: &Config) -> Dispatcher<ProcessSpawner> {
    Dispatcher::new(
        cfg.clone(),
        ProcessSpawner { spw_path: PathBuf::from(env!("CARGO_BIN_EXE_spw")) },
    )
    .unwrap()
}

fn pump_until<F: Fn(&Dispatcher<ProcessSpawner>) -> bool>(
    d: &mut Dispatcher<ProcessSpawner>,
    deadline: Duration,
    done: F,
) -> bool {
    let t0 = Instant::now();
    while t0.elapsed() < deadline {
        d.step(100);
        if done(d) {
            return true;
        }
    }
    false
}

// The full loop with a real worker process: message in, spool transferred to
// the loopback destination, terminator record reaped, job record freed.
#[test]
fn real_worker_delivers_and_reports_back() {
    let scratch = tempfile::tempdir().unwrap();
    let dest = scratch.path().join("delivered");
    let (_tmp, cfg) = setup(&dest);
    spool(&cfg.work_dir, "loop_1", &[("one.dat", b"payload-1"), ("two.dat", b"payload-22")]);
    let mut d = dispatcher(&cfg);

    let feeder = Fifo::open(FifoSet::fifo_dir(&cfg.work_dir).join("msg")).unwrap();
    feeder.write_record(&FifoMessage::with_name(MsgKind::Job, "loop_1")).unwrap();

    let ok = pump_until(&mut d, Duration::from_secs(20), |d| {
        d.running_len() == 0
            && dest.join("one.dat").exists()
            && d.jsa().entry(0).job_state() == JobState::Free
    });
    assert!(ok, "worker did not complete in time");
    assert_eq!(std::fs::read(dest.join("one.dat")).unwrap(), b"payload-1");
    assert_eq!(std::fs::read(dest.join("two.dat")).unwrap(), b"payload-22");
    assert!(!cfg.work_dir.join("outgoing").join("loop_1").exists());

    let h = d.hsa().entry(0);
    assert_eq!(h.active_transfers, 0);
    assert_eq!(h.active_from_slots(), 0);
    assert_eq!(h.connections, 1);
    assert_eq!(h.error_counter, 0);
}

// A failing destination drives the error account instead of delivering.
#[test]
fn failing_worker_feeds_error_accounting() {
    let scratch = tempfile::tempdir().unwrap();
    // the "directory" is a plain file, so the loopback dial fails
    let blocked = scratch.path().join("blocked");
    std::fs::write(&blocked, b"").unwrap();
    let (_tmp, cfg) = setup(&blocked.join("sub"));
    spool(&cfg.work_dir, "loop_1", &[("f", b"x")]);
    let mut d = dispatcher(&cfg);

    let feeder = Fifo::open(FifoSet::fifo_dir(&cfg.work_dir).join("msg")).unwrap();
    feeder.write_record(&FifoMessage::with_name(MsgKind::Job, "loop_1")).unwrap();

    let ok = pump_until(&mut d, Duration::from_secs(20), |d| {
        d.running_len() == 0 && d.hsa().entry(0).error_counter >= 1
    });
    assert!(ok, "error was not accounted in time");
    // spool survives for the retry, job sits in backoff
    assert!(cfg.work_dir.join("outgoing").join("loop_1").join("f").exists());
    assert_eq!(d.jsa().entry(0).job_state(), JobState::Retry);
    assert!(d.jsa().entry(0).retries >= 1);
}
