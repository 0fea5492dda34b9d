use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;

/// 字节数的日志显示 — render a byte count for log lines and the status
/// table, walking up the IEC units until the value fits.
pub fn size_display(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// 当前 Unix 秒 — current Unix time in seconds (signed, matches the on-disk
/// mtime fields where -1 means unknown).
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// 调度器对失败任务的重试延迟：有界指数 — bounded exponential delay (seconds)
/// for the dispatcher's retry queue, doubling per retry up to `max_secs`.
/// All retry pacing lives here; workers never sleep on failure themselves,
/// they exit and let the queue re-admit them.
pub fn retry_delay_secs(retries: u32, base_secs: u64, max_secs: u64) -> u64 {
    let shift = retries.min(16);
    base_secs.saturating_mul(1u64 << shift).min(max_secs)
}

// Canonical events directory, registered once at startup so structured
// events can be recorded for the whole run.
static EVENTS_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Register the canonical directory for structured event output
/// (`<work_dir>/logs`). Later calls are ignored.
pub fn init_event_dir(dir: PathBuf) {
    let _ = std::fs::create_dir_all(&dir);
    let _ = EVENTS_DIR.set(dir);
}

/// Append one structured event as a JSON line to `events.jsonl` in the
/// registered directory. Silently a no-op when no directory was registered
/// (unit tests, library embedding).
pub fn write_event(kind: &str, mut obj: serde_json::Value) {
    let Some(dir) = EVENTS_DIR.get() else {
        return;
    };
    if let Some(map) = obj.as_object_mut() {
        map.insert("event".to_string(), serde_json::json!(kind));
        map.insert(
            "time".to_string(),
            serde_json::json!(Utc::now().format("%Y%m%dT%H%M%SZ").to_string()),
        );
    }
    let path = dir.join("events.jsonl");
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&path)
        && let Ok(line) = serde_json::to_string(&obj)
    {
        let _ = writeln!(f, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_display_scales_through_units() {
        assert_eq!(size_display(0), "0 B");
        assert_eq!(size_display(512), "512 B");
        assert_eq!(size_display(2048), "2.0 KiB");
        assert_eq!(size_display(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(size_display(3 * 1024 * 1024 * 1024), "3.0 GiB");
        // huge values stop at the last unit instead of overflowing the table
        assert!(size_display(u64::MAX).ends_with("TiB"));
    }

    #[test]
    fn retry_delay_is_bounded_exponential() {
        assert_eq!(retry_delay_secs(0, 10, 3600), 10);
        assert_eq!(retry_delay_secs(1, 10, 3600), 20);
        assert_eq!(retry_delay_secs(3, 10, 3600), 80);
        // cap
        assert_eq!(retry_delay_secs(12, 10, 3600), 3600);
        // shift clamp does not overflow
        assert_eq!(retry_delay_secs(60, 10, 3600), 3600);
    }
}
