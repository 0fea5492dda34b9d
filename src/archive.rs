use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{TimeZone, Utc};

/// How the file reached the archive tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// Same filesystem, plain rename.
    Linked,
    /// Crossed a filesystem boundary: copied then unlinked.
    DataCopied,
}

/// 归档槽 — per-job sink that moves delivered files into
/// `<archive_root>/<host_alias>/YYYYMMDD/<job_id>/<unique_name>/<filename>`.
/// The directory chain is created on the first file of the job and the fact
/// remembered, so the steady-state path is a single rename.
pub struct ArchiveSink {
    dest_dir: PathBuf,
    dir_ready: bool,
}

impl ArchiveSink {
    pub fn new(
        archive_root: &Path,
        host_alias: &str,
        job_id: u32,
        unique_name: &str,
        now: i64,
    ) -> Self {
        let day = Utc
            .timestamp_opt(now, 0)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y%m%d")
            .to_string();
        let dest_dir =
            archive_root.join(host_alias).join(day).join(job_id.to_string()).join(unique_name);
        Self { dest_dir, dir_ready: false }
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    /// Move `src` under the job's archive directory. Returns the final path
    /// and whether the data had to be copied across filesystems.
    pub fn archive(&mut self, src: &Path, file_name: &str) -> io::Result<(PathBuf, ArchiveOutcome)> {
        if !self.dir_ready {
            std::fs::create_dir_all(&self.dest_dir)?;
            self.dir_ready = true;
        }
        let dest = self.dest_dir.join(file_name);
        match std::fs::rename(src, &dest) {
            Ok(()) => Ok((dest, ArchiveOutcome::Linked)),
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                std::fs::copy(src, &dest)?;
                unlink_with_retry(src)?;
                Ok((dest, ArchiveOutcome::DataCopied))
            }
            Err(e) => Err(e),
        }
    }
}

/// Unlink with a brief retry on EBUSY (a still-closing writer or a backup
/// scanner holding the file open for a moment).
pub fn unlink_with_retry(path: &Path) -> io::Result<()> {
    let mut attempt = 0;
    loop {
        match std::fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < 5 => {
                attempt += 1;
                std::thread::sleep(Duration::from_millis(50 * attempt));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Resolve a previously archived file for a resend job.
pub fn resend_source(
    archive_root: &Path,
    host_alias: &str,
    day: &str,
    job_id: u32,
    unique_name: &str,
    file_name: &str,
) -> PathBuf {
    archive_root.join(host_alias).join(day).join(job_id.to_string()).join(unique_name).join(file_name)
}
