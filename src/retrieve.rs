use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::region::MmapRegion;
use crate::region::lock::{LOCK_RETR_PROC, LockGuard, RegionLocks, TryLock};
use crate::state::{copy_to_fixed, fixed_to_str};

pub const RL_FILENAME_LEN: usize = 128;
pub const RL_EXTRA_LEN: usize = 64;
/// Allocation grows in steps of this many entries.
pub const RETRIEVE_LIST_STEP_SIZE: usize = 50;

/// Backoff against a concurrent volatile-mode scanner: 100 ms, 30 attempts,
/// then give this scan up as an empty success.
const ATTACH_RETRIES: u32 = 30;
const ATTACH_BACKOFF: Duration = Duration::from_millis(100);

bitflags! {
    /// special_flag bits of a retrieve-list entry. Assigned cumulatively;
    /// exact-size/exact-date knowledge is never overwritten by later scans.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RlFlags: u8 {
        const GOT_EXACT_SIZE = 1 << 0;
        const GOT_EXACT_DATE = 1 << 1;
        const GOT_SIZE_DATE  = 1 << 2;
    }
}

/// One remote file currently known in a directory. Field reads of entry i
/// are serialized against other writers under `LOCK_RETR_FILE + i`.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RetrieveEntry {
    pub file_name: [u8; RL_FILENAME_LEN],
    /// Protocol extra (e.g. an HTTP ETag).
    pub extra_data: [u8; RL_EXTRA_LEN],
    /// -1 = unknown.
    pub size: i64,
    /// Previous size, kept for append-only accounting.
    pub prev_size: i64,
    /// -1 = unknown.
    pub file_mtime: i64,
    pub got_date: u8,
    pub retrieved: u8,
    pub in_list: u8,
    /// 0 = free, else job-slot + 1.
    pub assigned: u8,
    pub special_flag: u8,
    pub _pad: [u8; 3],
}

impl RetrieveEntry {
    pub fn name(&self) -> String {
        fixed_to_str(&self.file_name)
    }

    pub fn set_name(&mut self, name: &str) {
        copy_to_fixed(&mut self.file_name, name);
    }

    pub fn extra(&self) -> String {
        fixed_to_str(&self.extra_data)
    }

    pub fn set_extra(&mut self, extra: &str) {
        copy_to_fixed(&mut self.extra_data, extra);
    }

    pub fn flags(&self) -> RlFlags {
        RlFlags::from_bits_truncate(self.special_flag)
    }

    pub fn add_flags(&mut self, flags: RlFlags) {
        self.special_flag |= flags.bits();
    }
}

/// 每目录持久检索列表 — the per-directory catalogue of remote files, a
/// mapped file with the live count in the first 4 bytes. Volatile mode
/// (stupid_mode or remove) resets the list on every attach and keeps the
/// whole-list lock for the duration of the scan.
pub struct RetrieveList {
    region: MmapRegion<RetrieveEntry>,
    locks: RegionLocks,
    /// Held for the whole scan in volatile mode.
    _proc_guard: Option<LockGuard>,
}

impl RetrieveList {
    pub fn rl_path(work_dir: &Path, dir_id: u32) -> PathBuf {
        work_dir.join("rl").join(format!("{}.rl", dir_id))
    }

    fn open_region(path: &Path) -> io::Result<MmapRegion<RetrieveEntry>> {
        if path.exists() {
            MmapRegion::attach(path)
        } else {
            let region = MmapRegion::create(path, 0)?;
            Ok(region)
        }
    }

    /// Attach the list for a persistent-mode scan.
    pub fn attach(work_dir: &Path, dir_id: u32) -> io::Result<Self> {
        let path = Self::rl_path(work_dir, dir_id);
        let mut region = Self::open_region(&path)?;
        if region.capacity() == 0 {
            region.resize(RETRIEVE_LIST_STEP_SIZE)?;
        }
        let locks = RegionLocks::new(region.file())?;
        Ok(Self { region, locks, _proc_guard: None })
    }

    /// Attach for a volatile-mode scan: truncate-reset under the whole-list
    /// lock. Returns Ok(None) when another scanner holds the list past the
    /// backoff budget — the caller ends its scan with success.
    pub fn attach_volatile(work_dir: &Path, dir_id: u32) -> io::Result<Option<Self>> {
        let path = Self::rl_path(work_dir, dir_id);
        let mut region = Self::open_region(&path)?;
        if region.capacity() == 0 {
            region.resize(RETRIEVE_LIST_STEP_SIZE)?;
        }
        let locks = RegionLocks::new(region.file())?;
        let mut guard = None;
        for attempt in 0..ATTACH_RETRIES {
            match locks.try_lock(LOCK_RETR_PROC)? {
                TryLock::Granted(g) => {
                    guard = Some(g);
                    break;
                }
                TryLock::IsSet => {
                    tracing::debug!(
                        "[rl] dir {} volatile list held elsewhere, attempt {}",
                        dir_id,
                        attempt + 1
                    );
                    std::thread::sleep(ATTACH_BACKOFF);
                }
            }
        }
        let Some(guard) = guard else {
            return Ok(None);
        };
        region.set_count(0);
        Ok(Some(Self { region, locks, _proc_guard: Some(guard) }))
    }

    pub fn len(&self) -> usize {
        self.region.count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry(&self, i: usize) -> &RetrieveEntry {
        assert!(i < self.len());
        self.region.entry(i)
    }

    pub fn entry_mut(&mut self, i: usize) -> &mut RetrieveEntry {
        assert!(i < self.len());
        self.region.entry_mut(i)
    }

    pub fn locks(&self) -> &RegionLocks {
        &self.locks
    }

    /// Append a fresh entry, growing the allocation by a step when full.
    /// Returns the new entry's index.
    pub fn push(&mut self, entry: RetrieveEntry) -> io::Result<usize> {
        let i = self.len();
        if i == self.region.capacity() {
            self.region.resize(self.region.capacity() + RETRIEVE_LIST_STEP_SIZE)?;
        }
        *self.region.entry_mut(i) = entry;
        self.region.set_count(i as u32 + 1);
        Ok(i)
    }

    /// Iterate indices whose entries are live.
    pub fn indices(&self) -> std::ops::Range<usize> {
        0..self.len()
    }

    /// Bulk compaction after a full persistent scan: entries with
    /// `in_list == 0` move out, survivors shift to the front, and the
    /// allocation shrinks back to step-size granularity. Callers hold
    /// `LOCK_RETR_PROC` for the duration.
    pub fn compact_not_in_list(&mut self) -> io::Result<usize> {
        let mut write = 0usize;
        let len = self.len();
        for read in 0..len {
            if self.region.entry(read).in_list != 0 {
                if write != read {
                    *self.region.entry_mut(write) = *self.region.entry(read);
                }
                write += 1;
            }
        }
        let removed = len - write;
        self.region.set_count(write as u32);
        let want = write.div_ceil(RETRIEVE_LIST_STEP_SIZE).max(1) * RETRIEVE_LIST_STEP_SIZE;
        if want != self.region.capacity() {
            self.region.resize(want)?;
        }
        Ok(removed)
    }

    /// Dispatcher janitor: clear `assigned` claims whose worker is gone.
    /// `live` answers whether job slot k currently has a live worker.
    pub fn release_stale_assignments(&mut self, live: impl Fn(usize) -> bool) -> usize {
        let mut cleared = 0;
        for i in 0..self.len() {
            let e = self.region.entry_mut(i);
            if e.assigned > 0 && !live(e.assigned as usize - 1) {
                e.assigned = 0;
                cleared += 1;
            }
        }
        cleared
    }

    pub fn flush(&self) -> io::Result<()> {
        self.region.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(name: &str) -> RetrieveEntry {
        let mut e =
            RetrieveEntry::read_from_bytes(&vec![0u8; std::mem::size_of::<RetrieveEntry>()][..])
                .unwrap();
        e.set_name(name);
        e.size = -1;
        e.file_mtime = -1;
        e
    }

    #[test]
    fn layout_is_padding_free() {
        assert_eq!(std::mem::size_of::<RetrieveEntry>(), 224);
    }

    #[test]
    fn push_grows_in_steps_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut rl = RetrieveList::attach(dir.path(), 3).unwrap();
            for n in 0..(RETRIEVE_LIST_STEP_SIZE + 2) {
                rl.push(blank(&format!("f{:03}", n))).unwrap();
            }
            assert_eq!(rl.len(), RETRIEVE_LIST_STEP_SIZE + 2);
            rl.flush().unwrap();
        }
        let rl = RetrieveList::attach(dir.path(), 3).unwrap();
        assert_eq!(rl.len(), RETRIEVE_LIST_STEP_SIZE + 2);
        assert_eq!(rl.entry(51).name(), "f051");
        assert_eq!(rl.entry(0).size, -1);
    }

    #[test]
    fn volatile_attach_resets_contents() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut rl = RetrieveList::attach(dir.path(), 9).unwrap();
            rl.push(blank("stale")).unwrap();
        }
        let rl = RetrieveList::attach_volatile(dir.path(), 9).unwrap().unwrap();
        assert_eq!(rl.len(), 0);
    }

    #[test]
    fn compaction_keeps_in_list_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut rl = RetrieveList::attach(dir.path(), 4).unwrap();
        for (n, keep) in [("a", true), ("b", false), ("c", true), ("d", false), ("e", true)] {
            let mut e = blank(n);
            e.in_list = keep as u8;
            e.retrieved = 1;
            rl.push(e).unwrap();
        }
        let removed = rl.compact_not_in_list().unwrap();
        assert_eq!(removed, 2);
        assert_eq!(rl.len(), 3);
        let names: Vec<String> = rl.indices().map(|i| rl.entry(i).name()).collect();
        assert_eq!(names, ["a", "c", "e"]);
        // per-entry history survives compaction
        assert_eq!(rl.entry(1).retrieved, 1);
    }

    #[test]
    fn stale_assignments_cleared_when_worker_gone() {
        let dir = tempfile::tempdir().unwrap();
        let mut rl = RetrieveList::attach(dir.path(), 5).unwrap();
        let mut e = blank("x");
        e.assigned = 2; // job slot 1
        rl.push(e).unwrap();
        let mut e = blank("y");
        e.assigned = 1; // job slot 0
        rl.push(e).unwrap();
        let cleared = rl.release_stale_assignments(|slot| slot == 0);
        assert_eq!(cleared, 1);
        assert_eq!(rl.entry(0).assigned, 0);
        assert_eq!(rl.entry(1).assigned, 1);
    }

    #[test]
    fn special_flags_accumulate() {
        let mut e = blank("z");
        e.add_flags(RlFlags::GOT_EXACT_SIZE);
        e.add_flags(RlFlags::GOT_SIZE_DATE);
        assert!(e.flags().contains(RlFlags::GOT_EXACT_SIZE));
        assert!(e.flags().contains(RlFlags::GOT_SIZE_DATE));
    }
}
