use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};

use crate::state::job::{DupCheckParams, DupFlags, SpoolFile};

/// Verdict of a duplicate probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupVerdict {
    New,
    Duplicate,
}

/// 指纹库 — keyed set of transfer fingerprints with time-based expiry, kept
/// in SQLite under the work directory. Key composition follows the job's
/// dup_check_flag; each insertion records a logical CRC id derived from the
/// key digest.
pub struct DupStore {
    conn: Connection,
}

impl DupStore {
    pub fn db_path(work_dir: &Path) -> PathBuf {
        work_dir.join("dupcheck.db")
    }

    pub fn open_in(work_dir: &Path) -> anyhow::Result<Self> {
        Self::open(Self::db_path(work_dir))
    }

    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let conn = Connection::open(path).with_context(|| "Failed to open SQLite database")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS fingerprints (
                key TEXT PRIMARY KEY,
                crc_id INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )
        .with_context(|| "Failed to create table")?;
        Ok(Self { conn })
    }

    /// Build the fingerprint key for `file` under the job's flag set.
    fn build_key(check: &DupCheckParams, file: &SpoolFile) -> anyhow::Result<String> {
        let f = check.flags;
        let mut parts: Vec<String> = Vec::new();
        if f.contains(DupFlags::NAME) {
            parts.push(format!("n={}", file.name));
        }
        if f.contains(DupFlags::SIZE) {
            parts.push(format!("s={}", file.size));
        }
        if f.contains(DupFlags::MTIME) {
            parts.push(format!("m={}", file.mtime));
        }
        if f.contains(DupFlags::CONTENT) {
            let mut hasher = Sha256::new();
            let mut fh = std::fs::File::open(&file.path)
                .with_context(|| format!("dupcheck open {}", file.path.display()))?;
            let mut buf = [0u8; 16 * 1024];
            loop {
                let n = fh.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            parts.push(format!("c={:x}", hasher.finalize()));
        }
        if parts.is_empty() {
            // flag set without key components degenerates to name-only
            parts.push(format!("n={}", file.name));
        }
        Ok(parts.join("|"))
    }

    fn crc_id(key: &str) -> u32 {
        let digest = Sha256::digest(key.as_bytes());
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Probe and record in one step: expired rows are purged, a hit returns
    /// Duplicate, a miss inserts the fingerprint valid until
    /// `now + dup_check_timeout`.
    pub fn check_and_insert(
        &mut self,
        check: &DupCheckParams,
        file: &SpoolFile,
        now: i64,
    ) -> anyhow::Result<DupVerdict> {
        if check.timeout == 0 {
            return Ok(DupVerdict::New);
        }
        self.conn
            .execute("DELETE FROM fingerprints WHERE expires_at <= ?1", params![now])
            .with_context(|| "Failed to purge expired fingerprints")?;
        let key = Self::build_key(check, file)?;
        let hit: Option<i64> = self
            .conn
            .query_row("SELECT crc_id FROM fingerprints WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .with_context(|| "Failed to query fingerprints")?;
        if hit.is_some() {
            return Ok(DupVerdict::Duplicate);
        }
        let expires = now + check.timeout as i64;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO fingerprints (key, crc_id, expires_at) VALUES (?1, ?2, ?3)",
                params![key, Self::crc_id(&key) as i64, expires],
            )
            .with_context(|| "Failed to insert fingerprint")?;
        Ok(DupVerdict::New)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spool_file(dir: &Path, name: &str, contents: &[u8]) -> SpoolFile {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        SpoolFile { name: name.to_string(), path, size: contents.len() as u64, mtime: 1000 }
    }

    fn params_(flags: DupFlags, timeout: u64) -> DupCheckParams {
        DupCheckParams { flags, timeout }
    }

    #[test]
    fn second_sight_of_same_name_is_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DupStore::open_in(dir.path()).unwrap();
        let f = spool_file(dir.path(), "a.txt", b"one");
        let p = params_(DupFlags::NAME, 3600);
        assert_eq!(store.check_and_insert(&p, &f, 100).unwrap(), DupVerdict::New);
        assert_eq!(store.check_and_insert(&p, &f, 200).unwrap(), DupVerdict::Duplicate);
    }

    #[test]
    fn expiry_reopens_the_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DupStore::open_in(dir.path()).unwrap();
        let f = spool_file(dir.path(), "a.txt", b"one");
        let p = params_(DupFlags::NAME, 50);
        assert_eq!(store.check_and_insert(&p, &f, 100).unwrap(), DupVerdict::New);
        // expires_at = 150; probing at 150 purges it
        assert_eq!(store.check_and_insert(&p, &f, 150).unwrap(), DupVerdict::New);
    }

    #[test]
    fn content_key_distinguishes_bodies_with_same_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DupStore::open_in(dir.path()).unwrap();
        let p = params_(DupFlags::NAME | DupFlags::CONTENT, 3600);
        let f1 = spool_file(dir.path(), "x.bin", b"alpha");
        assert_eq!(store.check_and_insert(&p, &f1, 10).unwrap(), DupVerdict::New);
        let f2 = spool_file(dir.path(), "x.bin", b"beta");
        assert_eq!(store.check_and_insert(&p, &f2, 11).unwrap(), DupVerdict::New);
        let f3 = spool_file(dir.path(), "x.bin", b"alpha");
        assert_eq!(store.check_and_insert(&p, &f3, 12).unwrap(), DupVerdict::Duplicate);
    }

    #[test]
    fn zero_timeout_disables_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DupStore::open_in(dir.path()).unwrap();
        let f = spool_file(dir.path(), "a", b"x");
        let p = params_(DupFlags::NAME, 0);
        assert_eq!(store.check_and_insert(&p, &f, 1).unwrap(), DupVerdict::New);
        assert_eq!(store.check_and_insert(&p, &f, 2).unwrap(), DupVerdict::New);
    }

    #[test]
    fn size_and_mtime_feed_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DupStore::open_in(dir.path()).unwrap();
        let p = params_(DupFlags::NAME | DupFlags::SIZE, 3600);
        let f1 = spool_file(dir.path(), "k", b"12345");
        assert_eq!(store.check_and_insert(&p, &f1, 10).unwrap(), DupVerdict::New);
        let f2 = spool_file(dir.path(), "k", b"123456");
        assert_eq!(store.check_and_insert(&p, &f2, 11).unwrap(), DupVerdict::New);
    }
}
