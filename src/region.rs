pub mod lock;

use std::fs::{File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{Ordering, fence};

use memmap2::MmapMut;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Region files start with an 8-byte header: the live record count in the
/// first 4 bytes (part of the on-disk contract) and a generation word bumped
/// on every resize so stale maps can be detected after taking a lock.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RegionHeader {
    pub count: u32,
    pub generation: u32,
}

pub const REGION_HEADER_SIZE: usize = std::mem::size_of::<RegionHeader>();

/// Marker bounds for anything stored in a region: fixed-size, padding-free,
/// byte-order free records. Record sizes must be a multiple of 8 so entries
/// stay naturally aligned behind the 8-byte header.
pub trait Record: FromBytes + IntoBytes + KnownLayout + Immutable + Sized {}
impl<T: FromBytes + IntoBytes + KnownLayout + Immutable + Sized> Record for T {}

/// Per-record seqlock word. Writers keep the version odd for the duration of
/// a mutation; readers treat an odd version as "mid-update, skip".
pub trait Versioned {
    fn version(&self) -> u32;
    fn set_version(&mut self, v: u32);
}

/// 内存映射表句柄 — a memory-mapped table of packed records shared between
/// the dispatcher and its workers. Serialization of field access is entirely
/// the caller's business (see `region::lock`).
pub struct MmapRegion<T> {
    file: File,
    map: MmapMut,
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T: Record> MmapRegion<T> {
    const RECORD: usize = std::mem::size_of::<T>();

    /// Create (or truncate) a region file holding `count` zeroed records.
    pub fn create<P: AsRef<Path>>(path: P, count: u32) -> io::Result<Self> {
        debug_assert!(Self::RECORD % 8 == 0);
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len((REGION_HEADER_SIZE + count as usize * Self::RECORD) as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut region =
            Self { file, map, path: path.as_ref().to_path_buf(), _marker: PhantomData };
        region.header_mut().count = count;
        region.header_mut().generation = 1;
        Ok(region)
    }

    /// Map an existing region file. Geometry is validated against the header.
    pub fn attach<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let region = Self { file, map, path: path.as_ref().to_path_buf(), _marker: PhantomData };
        if region.map.len() < REGION_HEADER_SIZE
            || region.count() as usize > region.capacity()
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("region geometry mismatch: {}", path.as_ref().display()),
            ));
        }
        Ok(region)
    }

    fn header(&self) -> &RegionHeader {
        RegionHeader::ref_from_bytes(&self.map[..REGION_HEADER_SIZE])
            .expect("header slice is aligned and sized")
    }

    fn header_mut(&mut self) -> &mut RegionHeader {
        RegionHeader::mut_from_bytes(&mut self.map[..REGION_HEADER_SIZE])
            .expect("header slice is aligned and sized")
    }

    /// Live record count (the first 4 bytes of the file).
    pub fn count(&self) -> u32 {
        self.header().count
    }

    pub fn set_count(&mut self, n: u32) {
        debug_assert!(n as usize <= self.capacity());
        self.header_mut().count = n;
    }

    /// Resize generation; bumped by `grow`, compared by readers that cached
    /// geometry across a lock acquisition.
    pub fn generation(&self) -> u32 {
        self.header().generation
    }

    /// Records the backing file can hold at its current length.
    pub fn capacity(&self) -> usize {
        (self.map.len() - REGION_HEADER_SIZE) / Self::RECORD
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The backing file, shared with the byte-range lock service so locks and
    /// data go through the same inode.
    pub fn file(&self) -> &File {
        &self.file
    }

    fn range(&self, i: usize) -> std::ops::Range<usize> {
        assert!(i < self.capacity(), "region index {} out of capacity {}", i, self.capacity());
        let start = REGION_HEADER_SIZE + i * Self::RECORD;
        start..start + Self::RECORD
    }

    pub fn entry(&self, i: usize) -> &T {
        T::ref_from_bytes(&self.map[self.range(i)]).expect("record slice is aligned and sized")
    }

    pub fn entry_mut(&mut self, i: usize) -> &mut T {
        let r = self.range(i);
        T::mut_from_bytes(&mut self.map[r]).expect("record slice is aligned and sized")
    }

    /// Grow the backing file to hold `new_capacity` records, preserving
    /// contents, and remap. Shrinking is also allowed (the retrieve list
    /// compaction truncates).
    pub fn resize(&mut self, new_capacity: usize) -> io::Result<()> {
        self.map.flush()?;
        let new_len = (REGION_HEADER_SIZE + new_capacity * Self::RECORD) as u64;
        self.file.set_len(new_len)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        let g = self.header().generation;
        self.header_mut().generation = g.wrapping_add(1);
        if (self.count() as usize) > new_capacity {
            self.set_count(new_capacity as u32);
        }
        Ok(())
    }

    /// Re-map after another process may have resized the file. Callers do
    /// this after acquiring a lock and noticing a generation change.
    pub fn refresh(&mut self) -> io::Result<()> {
        self.map.flush()?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    pub fn flush(&self) -> io::Result<()> {
        self.map.flush()
    }
}

impl<T: Record + Versioned> MmapRegion<T> {
    /// Torn-write protected mutation: `version += 1; fence; mutate; fence;
    /// version += 1`, so an even version implies a consistent record.
    pub fn update<R>(&mut self, i: usize, f: impl FnOnce(&mut T) -> R) -> R {
        let e = self.entry_mut(i);
        let v = e.version();
        e.set_version(v.wrapping_add(1));
        fence(Ordering::Release);
        let out = f(self.entry_mut(i));
        fence(Ordering::Release);
        let e = self.entry_mut(i);
        let v = e.version();
        e.set_version(v.wrapping_add(1));
        out
    }

    /// Lock-free read of a whole record. Returns None when the record is
    /// mid-update (odd version) or was mutated under us; callers either skip
    /// the entry or retry under a lock.
    pub fn read_consistent(&self, i: usize) -> Option<T> {
        let v1 = self.entry(i).version();
        if v1 & 1 == 1 {
            return None;
        }
        fence(Ordering::Acquire);
        let copy = T::read_from_bytes(&self.map[self.range(i)])
            .expect("record slice is aligned and sized");
        fence(Ordering::Acquire);
        if self.entry(i).version() == v1 { Some(copy) } else { None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
    #[repr(C)]
    struct Probe {
        version: u32,
        a: u32,
        b: u64,
    }

    impl Versioned for Probe {
        fn version(&self) -> u32 {
            self.version
        }
        fn set_version(&mut self, v: u32) {
            self.version = v;
        }
    }

    #[test]
    fn create_attach_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.region");
        {
            let mut r = MmapRegion::<Probe>::create(&path, 4).unwrap();
            assert_eq!(r.count(), 4);
            r.entry_mut(2).a = 77;
            r.entry_mut(2).b = 0xdead_beef;
            r.flush().unwrap();
        }
        let r = MmapRegion::<Probe>::attach(&path).unwrap();
        assert_eq!(r.count(), 4);
        assert_eq!(r.entry(2).a, 77);
        assert_eq!(r.entry(2).b, 0xdead_beef);
        assert_eq!(r.entry(0).a, 0);
    }

    #[test]
    fn resize_preserves_contents_and_bumps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.region");
        let mut r = MmapRegion::<Probe>::create(&path, 2).unwrap();
        r.entry_mut(1).b = 42;
        let g = r.generation();
        r.resize(8).unwrap();
        assert_eq!(r.capacity(), 8);
        assert_eq!(r.entry(1).b, 42);
        assert_eq!(r.entry(7).b, 0);
        assert_ne!(r.generation(), g);
    }

    #[test]
    fn update_leaves_even_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = MmapRegion::<Probe>::create(dir.path().join("v.region"), 1).unwrap();
        r.update(0, |e| e.a = 5);
        assert_eq!(r.entry(0).version() & 1, 0);
        assert_eq!(r.read_consistent(0).unwrap().a, 5);
    }

    #[test]
    fn odd_version_is_skipped_by_readers() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = MmapRegion::<Probe>::create(dir.path().join("odd.region"), 1).unwrap();
        r.entry_mut(0).version = 3;
        assert!(r.read_consistent(0).is_none());
    }

    #[test]
    fn attach_rejects_bad_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.region");
        std::fs::write(&path, [0u8; 4]).unwrap();
        assert!(MmapRegion::<Probe>::attach(&path).is_err());
    }
}
