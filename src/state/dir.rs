use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{copy_to_fixed, fixed_to_str};
use crate::region::Versioned;

pub const DIR_ALIAS_LEN: usize = 32;
pub const URL_LEN: usize = 256;

/// Fallback lower bound for the unknown/locked-file deletion windows.
pub const DEFAULT_TRANSFER_TIMEOUT: i64 = 120;

/// Comparator attached to the size/time gates. `Off` disables the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Comparator {
    Off = 0,
    Equal = 1,
    Less = 2,
    Greater = 3,
}

impl Comparator {
    /// Whether a file with observed `value` is dropped by a gate configured
    /// to `limit`. Equal-comparator semantics: the entry is ignored when the
    /// observed value equals the configured one.
    pub fn ignores(self, value: i64, limit: i64) -> bool {
        match self {
            Comparator::Off => false,
            Comparator::Equal => value == limit,
            Comparator::Less => value < limit,
            Comparator::Greater => value > limit,
        }
    }
}

bitflags! {
    /// Scan policy bits of a DSE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScanFlags: u32 {
        /// Volatile retrieve list, re-initialized each scan.
        const STUPID_MODE              = 1 << 0;
        /// Files are removed remotely after retrieval.
        const REMOVE                   = 1 << 1;
        const ACCEPT_DOT_FILES         = 1 << 2;
        const ALL_DISABLED             = 1 << 3;
        /// Sizes/dates from the listing are trusted; no HEAD/MDTM refinement.
        const DONT_GET_DIR_LIST        = 1 << 4;
        const ONE_PROCESS_JUST_SCANNING = 1 << 5;
        const APPEND_ONLY              = 1 << 6;
        const GET_ONCE_ONLY            = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeleteFlags: u32 {
        /// Delete remote files matched by no mask group once old enough.
        const UNKNOWN_FILES = 1 << 0;
        /// Delete remote files stuck past `locked_file_time`.
        const LOCKED_FILES  = 1 << 1;
    }
}

/// Directory Status Entry. One per monitored source directory (pull mode),
/// mapped in the DSA region. The file-mask groups referenced by a DSE live in
/// `dirs.json` and travel to the scanner out of band.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DirEntry {
    pub version: u32,
    pub dir_id: u32,
    pub alias: [u8; DIR_ALIAS_LEN],
    pub url: [u8; URL_LEN],
    pub host_index: u32,
    pub scan_flags: u32,
    pub delete_flags: u32,
    pub max_copied_files: u32,
    pub ignore_size: i64,
    pub ignore_file_time: i64,
    pub unknown_file_time: i64,
    pub locked_file_time: i64,
    pub max_copied_file_size: u64,
    pub ignore_size_cond: u8,
    pub ignore_time_cond: u8,
    pub _pad: [u8; 6],
}

impl Versioned for DirEntry {
    fn version(&self) -> u32 {
        self.version
    }
    fn set_version(&mut self, v: u32) {
        self.version = v;
    }
}

impl DirEntry {
    pub fn alias_str(&self) -> String {
        fixed_to_str(&self.alias)
    }

    pub fn set_alias(&mut self, alias: &str) {
        copy_to_fixed(&mut self.alias, alias);
    }

    pub fn url_str(&self) -> String {
        fixed_to_str(&self.url)
    }

    pub fn set_url(&mut self, url: &str) {
        copy_to_fixed(&mut self.url, url);
    }

    pub fn scan(&self) -> ScanFlags {
        ScanFlags::from_bits_truncate(self.scan_flags)
    }

    pub fn deletes(&self) -> DeleteFlags {
        DeleteFlags::from_bits_truncate(self.delete_flags)
    }

    /// Volatile list mode: state is discarded between scans.
    pub fn volatile(&self) -> bool {
        self.scan().intersects(ScanFlags::STUPID_MODE | ScanFlags::REMOVE)
    }

    pub fn size_cond(&self) -> Comparator {
        Comparator::try_from(self.ignore_size_cond).unwrap_or(Comparator::Off)
    }

    pub fn time_cond(&self) -> Comparator {
        Comparator::try_from(self.ignore_time_cond).unwrap_or(Comparator::Off)
    }

    /// Deletion window for files matching no mask group.
    pub fn unknown_window(&self) -> i64 {
        self.unknown_file_time.max(DEFAULT_TRANSFER_TIMEOUT)
    }

    /// Deletion window for lock-suffixed/stuck files.
    pub fn locked_window(&self) -> i64 {
        self.locked_file_time.max(DEFAULT_TRANSFER_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed() -> DirEntry {
        DirEntry::read_from_bytes(&vec![0u8; std::mem::size_of::<DirEntry>()][..]).unwrap()
    }

    #[test]
    fn layout_is_padding_free() {
        assert_eq!(std::mem::size_of::<DirEntry>(), 360);
    }

    #[test]
    fn comparator_gate_semantics() {
        assert!(!Comparator::Off.ignores(10, 10));
        assert!(Comparator::Equal.ignores(10, 10));
        assert!(!Comparator::Equal.ignores(11, 10));
        assert!(Comparator::Less.ignores(5, 10));
        assert!(Comparator::Greater.ignores(15, 10));
    }

    #[test]
    fn volatile_follows_stupid_or_remove() {
        let mut d = zeroed();
        assert!(!d.volatile());
        d.scan_flags = ScanFlags::STUPID_MODE.bits();
        assert!(d.volatile());
        d.scan_flags = ScanFlags::REMOVE.bits();
        assert!(d.volatile());
    }

    #[test]
    fn deletion_windows_never_undercut_transfer_timeout() {
        let mut d = zeroed();
        d.unknown_file_time = 30;
        d.locked_file_time = 600;
        assert_eq!(d.unknown_window(), DEFAULT_TRANSFER_TIMEOUT);
        assert_eq!(d.locked_window(), 600);
    }
}
