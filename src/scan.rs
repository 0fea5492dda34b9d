use std::time::Instant;

use zerocopy::FromBytes;

use crate::proto::{CodecError, ListingEntry, RemoteLike};
use crate::region::lock::retr_file_lock_offset;
use crate::retrieve::{RetrieveEntry, RetrieveList, RlFlags};
use crate::state::dir::{DeleteFlags, DirEntry, ScanFlags};
use crate::state::job::SpecialFlags;

/// File-mask matcher over '*' and '?', the subset remote listings need.
/// Iterative: a mismatch rewinds to the most recent '*' and lets it swallow
/// one more character, so pathological masks cannot blow the stack.
pub fn glob_match(mask: &str, name: &str) -> bool {
    let mask: Vec<char> = mask.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let mut m = 0;
    let mut n = 0;
    // where the last '*' sits and how much of the name it has eaten so far
    let mut rewind: Option<(usize, usize)> = None;
    while n < name.len() {
        match mask.get(m) {
            Some('*') => {
                rewind = Some((m, n));
                m += 1;
            }
            Some(&c) if c == '?' || c == name[n] => {
                m += 1;
                n += 1;
            }
            _ => match rewind {
                Some((star, eaten)) => {
                    m = star + 1;
                    n = eaten + 1;
                    rewind = Some((star, eaten + 1));
                }
                None => return false,
            },
        }
    }
    // only trailing stars may remain unconsumed
    mask[m..].iter().all(|&c| c == '*')
}

/// One mask inside a group; a leading '!' in the configured string negates.
#[derive(Debug, Clone)]
pub struct Mask {
    pub negate: bool,
    pub pattern: String,
}

impl Mask {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('!') {
            Some(rest) => Self { negate: true, pattern: rest.to_string() },
            None => Self { negate: false, pattern: raw.to_string() },
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        glob_match(&self.pattern, name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaskGroup {
    pub masks: Vec<Mask>,
}

impl MaskGroup {
    pub fn from_strings<S: AsRef<str>>(raw: &[S]) -> Self {
        Self { masks: raw.iter().map(|s| Mask::parse(s.as_ref())).collect() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskVerdict {
    Accepted,
    Rejected,
}

/// First-match-wins across groups; inside a group the first matching mask
/// decides, and a matching negated mask short-circuits that group.
pub fn match_mask_groups(groups: &[MaskGroup], name: &str) -> MaskVerdict {
    for group in groups {
        for mask in &group.masks {
            if mask.matches(name) {
                if mask.negate {
                    // negative match: this group is done with the file
                    break;
                }
                return MaskVerdict::Accepted;
            }
        }
    }
    MaskVerdict::Rejected
}

/// Per-scan selection budget with the single-file overshoot rule: the first
/// selected file is always admitted, every later one must fit both caps.
/// A cap of 0 means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct ScanBudget {
    max_files: u32,
    max_bytes: u64,
    pub files: u32,
    pub bytes: u64,
}

impl ScanBudget {
    pub fn new(max_files: u32, max_bytes: u64) -> Self {
        Self { max_files, max_bytes, files: 0, bytes: 0 }
    }

    pub fn admit(&mut self, add_bytes: u64) -> bool {
        if self.files > 0 {
            if self.max_files > 0 && self.files + 1 > self.max_files {
                return false;
            }
            if self.max_bytes > 0 && self.bytes + add_bytes > self.max_bytes {
                return false;
            }
        }
        self.files += 1;
        self.bytes += add_bytes;
        true
    }
}

pub struct ScanInput<'a> {
    pub dse: DirEntry,
    pub masks: &'a [MaskGroup],
    /// Job slot of the fetching worker; selected entries get `slot + 1`.
    pub job_slot: usize,
    pub special: SpecialFlags,
    pub now: i64,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// RL indices assigned to this worker, in listing order.
    pub selected: Vec<usize>,
    pub files: u32,
    pub bytes: u64,
    pub more_files_in_list: bool,
    pub deleted_remote: Vec<String>,
}

fn zero_entry() -> RetrieveEntry {
    RetrieveEntry::read_from_bytes(&vec![0u8; std::mem::size_of::<RetrieveEntry>()][..])
        .expect("zeroed record")
}

/// Linear match with a moving hint: directory listings arrive in a stable
/// order, so the next listing line usually sits right behind the previous
/// match.
fn find_entry(rl: &RetrieveList, name: &str, hint: usize) -> Option<usize> {
    let len = rl.len();
    if len == 0 {
        return None;
    }
    let start = hint.min(len - 1);
    for off in 0..len {
        let i = (start + off) % len;
        if rl.entry(i).name() == name {
            return Some(i);
        }
    }
    None
}

/// 远端列表与检索列表的对账 — map a freshly parsed remote listing onto the
/// persistent retrieve list: mark what is still there, pick up changes,
/// assign work to this scan's job slot within budget, and delete vanished or
/// unwanted remote files where the directory's policy demands it.
///
/// The caller attaches the RL (volatile attach already reset it) and holds no
/// entry locks; exclusive claims for old-error retries happen in here.
pub fn reconcile(
    rl: &mut RetrieveList,
    listing: &[ListingEntry],
    input: &ScanInput<'_>,
    mut codec: Option<&mut dyn RemoteLike>,
) -> ScanOutcome {
    let mut out = ScanOutcome::default();
    let scan = input.dse.scan();
    let deletes = input.dse.deletes();
    if scan.contains(ScanFlags::ALL_DISABLED) {
        return out;
    }

    let append_only = scan.contains(ScanFlags::APPEND_ONLY);
    let just_scanning = scan.contains(ScanFlags::ONE_PROCESS_JUST_SCANNING)
        && !input.special.contains(SpecialFlags::DISTRIBUTED_HELPER_JOB);
    let mut budget = ScanBudget::new(input.dse.max_copied_files, input.dse.max_copied_file_size);

    // a volatile attach starts from an empty list; a persistent scan clears
    // the sighting bits so step 4 can sweep what vanished
    if !input.dse.volatile() {
        for i in 0..rl.len() {
            rl.entry_mut(i).in_list = 0;
        }
    }

    let mut cached_i = 0usize;
    for line in listing {
        // a. dot-file policy; lock-convention names also age out remotely
        if line.name.starts_with('.') && !scan.contains(ScanFlags::ACCEPT_DOT_FILES) {
            if deletes.contains(DeleteFlags::LOCKED_FILES)
                && let Some(mtime) = line.mtime
                && input.now - mtime > input.dse.locked_window()
                && let Some(c) = codec.as_deref_mut()
            {
                match c.delete(&line.name, input.deadline) {
                    Ok(()) => out.deleted_remote.push(line.name.clone()),
                    Err(e) => tracing::debug!("[scan] locked-file delete {}: {}", line.name, e),
                }
            }
            continue;
        }

        // d. mask pipeline comes before any remote round trips for unknowns
        if match_mask_groups(input.masks, &line.name) == MaskVerdict::Rejected {
            if deletes.contains(DeleteFlags::UNKNOWN_FILES)
                && let Some(mtime) = line.mtime
                && input.now - mtime > input.dse.unknown_window()
                && let Some(c) = codec.as_deref_mut()
            {
                match c.delete(&line.name, input.deadline) {
                    Ok(()) => out.deleted_remote.push(line.name.clone()),
                    Err(e) => tracing::debug!("[scan] unknown-file delete {}: {}", line.name, e),
                }
            }
            continue;
        }

        let mut size = line.size.unwrap_or(-1);
        let mut mtime = line.mtime.unwrap_or(-1);
        let mut exact_size = line.exact_size;
        let mut exact_date = line.exact_date;

        // b. size gate
        if size >= 0 && input.dse.size_cond().ignores(size, input.dse.ignore_size) {
            continue;
        }

        // c. mtime gate, refining the date first when the listing was vague
        if input.dse.time_cond() != crate::state::dir::Comparator::Off {
            if !exact_date && !scan.contains(ScanFlags::DONT_GET_DIR_LIST) {
                if let Some(c) = codec.as_deref_mut() {
                    match c.head(&line.name, input.deadline) {
                        Ok((hs, hm)) => {
                            if let Some(hs) = hs {
                                size = hs;
                                exact_size = true;
                            }
                            if let Some(hm) = hm {
                                mtime = hm;
                                exact_date = true;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("[scan] head {} failed: {}", line.name, e);
                        }
                    }
                }
            }
            if exact_date
                && mtime >= 0
                && input.dse.time_cond().ignores(input.now - mtime, input.dse.ignore_file_time)
            {
                continue;
            }
        }

        let found = find_entry(rl, &line.name, cached_i);
        let idx = match found {
            Some(i) => {
                cached_i = i + 1;
                rl.entry_mut(i).in_list = 1;
                // exclusive claim for retries of failed jobs
                let _claim = if input.special.contains(SpecialFlags::OLD_ERROR_JOB) {
                    match rl.locks().try_lock(retr_file_lock_offset(i)) {
                        Ok(crate::region::lock::TryLock::Granted(g)) => Some(g),
                        Ok(crate::region::lock::TryLock::IsSet) => {
                            tracing::debug!("[scan] entry {} claimed elsewhere, skipping", i);
                            continue;
                        }
                        Err(e) => {
                            tracing::debug!("[scan] entry {} lock error: {}", i, e);
                            continue;
                        }
                    }
                } else {
                    None
                };
                let once_only = scan.contains(ScanFlags::GET_ONCE_ONLY);
                let e = rl.entry_mut(i);
                let changed = (size >= 0 && e.size != size)
                    || (mtime >= 0 && e.file_mtime >= 0 && e.file_mtime != mtime);
                if changed && !once_only {
                    e.prev_size = e.size.max(0);
                    e.retrieved = 0;
                    e.assigned = 0;
                }
                if size >= 0 {
                    e.size = size;
                }
                if mtime >= 0 {
                    e.file_mtime = mtime;
                    e.got_date = 1;
                }
                if let Some(ref extra) = line.extra {
                    e.set_extra(extra);
                }
                i
            }
            None => {
                let mut e = zero_entry();
                e.set_name(&line.name);
                e.size = size;
                e.prev_size = 0;
                e.file_mtime = mtime;
                e.got_date = (mtime >= 0) as u8;
                e.in_list = 1;
                if let Some(ref extra) = line.extra {
                    e.set_extra(extra);
                }
                match rl.push(e) {
                    Ok(i) => {
                        cached_i = i + 1;
                        i
                    }
                    Err(err) => {
                        tracing::error!("[scan] FATAL rl grow failed: {}", err);
                        continue;
                    }
                }
            }
        };

        {
            let mut flags = RlFlags::empty();
            if exact_size {
                flags |= RlFlags::GOT_EXACT_SIZE;
            }
            if exact_date {
                flags |= RlFlags::GOT_EXACT_DATE;
            }
            if exact_size && exact_date {
                flags |= RlFlags::GOT_SIZE_DATE;
            }
            rl.entry_mut(idx).add_flags(flags);
        }

        // selection: free, unretrieved entries feed the fetcher within budget
        let e = rl.entry(idx);
        if e.retrieved == 0 && e.assigned == 0 {
            if just_scanning {
                out.more_files_in_list = true;
                continue;
            }
            let add = if append_only && e.size > e.prev_size {
                (e.size - e.prev_size) as u64
            } else {
                e.size.max(0) as u64
            };
            if budget.admit(add) {
                rl.entry_mut(idx).assigned = input.job_slot as u8 + 1;
            } else {
                out.more_files_in_list = true;
            }
        }
    }

    out.files = budget.files;
    out.bytes = budget.bytes;

    // 4. sweep vanished entries from the persistent list
    if !input.dse.volatile() {
        match rl.locks().lock(crate::region::lock::LOCK_RETR_PROC) {
            Ok(_guard) => {
                if let Err(e) = rl.compact_not_in_list() {
                    tracing::error!("[scan] FATAL rl shrink failed: {}", e);
                }
            }
            Err(e) => tracing::debug!("[scan] proc lock unavailable, shrink skipped: {}", e),
        }
        let _ = rl.flush();
    }

    // compaction moves entries, so the work list is whatever now carries this
    // slot's claim (including claims resumed from an interrupted run)
    out.selected = rl
        .indices()
        .filter(|&i| {
            let e = rl.entry(i);
            e.assigned as usize == input.job_slot + 1 && e.retrieved == 0
        })
        .collect();

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{CodecErrorKind, DialTarget};
    use crate::state::dir::Comparator;
    use std::collections::HashMap;

    fn dse() -> DirEntry {
        DirEntry::read_from_bytes(&vec![0u8; std::mem::size_of::<DirEntry>()][..]).unwrap()
    }

    fn line(name: &str, size: i64, mtime: i64) -> ListingEntry {
        ListingEntry {
            name: name.to_string(),
            size: Some(size),
            mtime: Some(mtime),
            exact_size: true,
            exact_date: true,
            extra: None,
        }
    }

    fn input<'a>(dse: DirEntry, masks: &'a [MaskGroup], now: i64) -> ScanInput<'a> {
        ScanInput {
            dse,
            masks,
            job_slot: 0,
            special: SpecialFlags::default(),
            now,
            deadline: Instant::now() + std::time::Duration::from_secs(30),
        }
    }

    /// Scripted remote used to observe HEAD refinements and deletions.
    struct ScriptedRemote {
        heads: HashMap<String, (Option<i64>, Option<i64>)>,
        deleted: Vec<String>,
    }

    impl ScriptedRemote {
        fn new() -> Self {
            Self { heads: HashMap::new(), deleted: Vec::new() }
        }
    }

    impl RemoteLike for ScriptedRemote {
        fn dial(&mut self, _t: &DialTarget, _d: Instant) -> Result<(), CodecError> {
            Ok(())
        }
        fn open_write(&mut self, _n: &str, _s: u64, _d: Instant) -> Result<(), CodecError> {
            Err(CodecError::new(CodecErrorKind::OpenRemote, "scan-only"))
        }
        fn write_chunk(&mut self, _b: &[u8], _d: Instant) -> Result<(), CodecError> {
            Err(CodecError::new(CodecErrorKind::WriteRemote, "scan-only"))
        }
        fn close_file(&mut self, _d: Instant) -> Result<(), CodecError> {
            Ok(())
        }
        fn list(&mut self, _d: Instant) -> Result<Vec<ListingEntry>, CodecError> {
            Ok(Vec::new())
        }
        fn head(
            &mut self,
            name: &str,
            _d: Instant,
        ) -> Result<(Option<i64>, Option<i64>), CodecError> {
            self.heads
                .get(name)
                .copied()
                .ok_or_else(|| CodecError::new(CodecErrorKind::Date, "no head"))
        }
        fn open_read(&mut self, _n: &str, _d: Instant) -> Result<(), CodecError> {
            Err(CodecError::new(CodecErrorKind::OpenRemote, "scan-only"))
        }
        fn read_chunk(&mut self, _b: &mut [u8], _d: Instant) -> Result<usize, CodecError> {
            Ok(0)
        }
        fn delete(&mut self, name: &str, _d: Instant) -> Result<(), CodecError> {
            self.deleted.push(name.to_string());
            Ok(())
        }
        fn quit(&mut self) {}
    }

    #[test]
    fn mask_groups_first_match_wins_with_negation() {
        let groups = vec![
            MaskGroup::from_strings(&["!*.tmp", "data_*"]),
            MaskGroup::from_strings(&["*.txt"]),
        ];
        assert_eq!(match_mask_groups(&groups, "data_001"), MaskVerdict::Accepted);
        // negated in group 1, but group 2 accepts .txt
        assert_eq!(match_mask_groups(&groups, "notes.txt"), MaskVerdict::Accepted);
        // negated in group 1 and nothing else matches
        assert_eq!(match_mask_groups(&groups, "data.tmp"), MaskVerdict::Rejected);
        assert_eq!(match_mask_groups(&groups, "other.bin"), MaskVerdict::Rejected);
    }

    #[test]
    fn budget_single_file_overshoot() {
        let mut b = ScanBudget::new(2, 2500);
        // first admit always passes, even oversized
        assert!(b.admit(90_000));
        assert!(!b.admit(1));
        let mut b = ScanBudget::new(0, 0);
        for _ in 0..100 {
            assert!(b.admit(1_000_000));
        }
    }

    #[test]
    fn pull_with_budget_marks_more_files() {
        // S2: 4 x 1000 bytes against max 2 files / 2500 bytes
        let tmp = tempfile::tempdir().unwrap();
        let mut rl = RetrieveList::attach(tmp.path(), 1).unwrap();
        let mut d = dse();
        d.max_copied_files = 2;
        d.max_copied_file_size = 2500;
        let masks = vec![MaskGroup::from_strings(&["*"])];
        let listing: Vec<_> = (1..=4).map(|n| line(&format!("f{}", n), 1000, 500)).collect();
        let out = reconcile(&mut rl, &listing, &input(d, &masks, 1000), None);
        assert_eq!(out.selected.len(), 2);
        assert_eq!(out.files, 2);
        assert_eq!(out.bytes, 2000);
        assert!(out.more_files_in_list);
        assert_eq!(rl.len(), 4);
        for i in rl.indices() {
            assert_eq!(rl.entry(i).in_list, 1);
        }
        assert_eq!(rl.entry(0).assigned, 1);
        assert_eq!(rl.entry(1).assigned, 1);
        assert_eq!(rl.entry(2).assigned, 0);
    }

    #[test]
    fn change_detection_resets_retrieved_and_keeps_prev_size() {
        // S3
        let tmp = tempfile::tempdir().unwrap();
        let mut rl = RetrieveList::attach(tmp.path(), 2).unwrap();
        let masks = vec![MaskGroup::from_strings(&["*"])];
        let d = dse();
        let out = reconcile(&mut rl, &[line("a.txt", 100, 100)], &input(d, &masks, 1000), None);
        assert_eq!(out.selected, vec![0]);
        {
            let e = rl.entry_mut(0);
            e.retrieved = 1;
            e.assigned = 0;
        }
        let mut d = dse();
        d.scan_flags = ScanFlags::APPEND_ONLY.bits();
        let out = reconcile(&mut rl, &[line("a.txt", 120, 200)], &input(d, &masks, 1000), None);
        let e = rl.entry(0);
        assert_eq!(e.retrieved, 0);
        assert_eq!(e.size, 120);
        assert_eq!(e.prev_size, 100);
        // append-only accounting charges only the growth
        assert_eq!(out.bytes, 20);
        assert_eq!(e.assigned, 1);
    }

    #[test]
    fn vanished_entries_are_swept_in_persistent_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rl = RetrieveList::attach(tmp.path(), 3).unwrap();
        let masks = vec![MaskGroup::from_strings(&["*"])];
        let listing = vec![line("keep", 10, 1), line("gone", 10, 1)];
        reconcile(&mut rl, &listing, &input(dse(), &masks, 100), None);
        assert_eq!(rl.len(), 2);
        // mark both done so the next scan has no selection side effects
        for i in rl.indices() {
            let e = rl.entry_mut(i);
            e.retrieved = 1;
            e.assigned = 0;
        }
        reconcile(&mut rl, &[line("keep", 10, 1)], &input(dse(), &masks, 200), None);
        assert_eq!(rl.len(), 1);
        assert_eq!(rl.entry(0).name(), "keep");
        // history preserved across the sweep
        assert_eq!(rl.entry(0).retrieved, 1);
    }

    #[test]
    fn reconcile_twice_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rl = RetrieveList::attach(tmp.path(), 8).unwrap();
        let masks = vec![MaskGroup::from_strings(&["*"])];
        let listing = vec![line("a", 5, 1), line("b", 6, 2)];
        let first = reconcile(&mut rl, &listing, &input(dse(), &masks, 100), None);
        assert_eq!(first.selected.len(), 2);
        // same listing again: no duplicates, the same entries still carry
        // this slot's claim, and nothing was double-counted against budget
        let second = reconcile(&mut rl, &listing, &input(dse(), &masks, 150), None);
        assert_eq!(rl.len(), 2);
        assert_eq!(second.selected, first.selected);
        assert_eq!(second.files, 0);
        assert_eq!(rl.entry(0).assigned, 1);
        assert_eq!(rl.entry(1).assigned, 1);
    }

    #[test]
    fn size_gate_equal_comparator_ignores_matching_size() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rl = RetrieveList::attach(tmp.path(), 9).unwrap();
        let masks = vec![MaskGroup::from_strings(&["*"])];
        let mut d = dse();
        d.ignore_size = 1000;
        d.ignore_size_cond = Comparator::Equal.into();
        let listing = vec![line("same", 1000, 1), line("bigger", 1001, 1)];
        let out = reconcile(&mut rl, &listing, &input(d, &masks, 100), None);
        assert_eq!(rl.len(), 1);
        assert_eq!(rl.entry(0).name(), "bigger");
        assert_eq!(out.selected.len(), 1);
    }

    #[test]
    fn inexact_date_is_refined_via_head() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rl = RetrieveList::attach(tmp.path(), 10).unwrap();
        let masks = vec![MaskGroup::from_strings(&["*"])];
        let mut d = dse();
        d.ignore_file_time = 3600;
        d.ignore_time_cond = Comparator::Greater.into();
        let mut remote = ScriptedRemote::new();
        remote.heads.insert("old".into(), (Some(10), Some(100)));
        remote.heads.insert("new".into(), (Some(20), Some(99_000)));
        let listing = vec![
            ListingEntry {
                name: "old".into(),
                size: Some(10),
                mtime: Some(98_000),
                exact_size: true,
                exact_date: false,
                extra: None,
            },
            ListingEntry {
                name: "new".into(),
                size: Some(20),
                mtime: None,
                exact_size: true,
                exact_date: false,
                extra: None,
            },
        ];
        let out = reconcile(
            &mut rl,
            &listing,
            &input(d, &masks, 100_000),
            Some(&mut remote),
        );
        // "old" refined to age 99900 > 3600 -> ignored; "new" to age 1000
        assert_eq!(rl.len(), 1);
        assert_eq!(rl.entry(0).name(), "new");
        assert!(rl.entry(0).flags().contains(RlFlags::GOT_SIZE_DATE));
        assert_eq!(out.selected.len(), 1);
    }

    #[test]
    fn unknown_files_deleted_remotely_after_window() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rl = RetrieveList::attach(tmp.path(), 11).unwrap();
        let masks = vec![MaskGroup::from_strings(&["*.dat"])];
        let mut d = dse();
        d.delete_flags = DeleteFlags::UNKNOWN_FILES.bits();
        d.unknown_file_time = 200;
        let mut remote = ScriptedRemote::new();
        let listing = vec![
            line("wanted.dat", 5, 900),
            line("stranger.txt", 5, 100), // age 900 > window 200
            line("fresh.txt", 5, 950),    // age 50, stays
        ];
        let out = reconcile(&mut rl, &listing, &input(d, &masks, 1000), Some(&mut remote));
        assert_eq!(out.deleted_remote, vec!["stranger.txt".to_string()]);
        assert_eq!(remote.deleted, vec!["stranger.txt".to_string()]);
        assert_eq!(rl.len(), 1);
    }

    #[test]
    fn just_scanning_hands_off_instead_of_assigning() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rl = RetrieveList::attach(tmp.path(), 12).unwrap();
        let masks = vec![MaskGroup::from_strings(&["*"])];
        let mut d = dse();
        d.scan_flags = ScanFlags::ONE_PROCESS_JUST_SCANNING.bits();
        let out = reconcile(&mut rl, &[line("a", 5, 1)], &input(d, &masks, 100), None);
        assert!(out.selected.is_empty());
        assert!(out.more_files_in_list);
        assert_eq!(rl.entry(0).assigned, 0);
        // the distributed helper may assign
        let mut inp = input(d, &masks, 100);
        inp.special = SpecialFlags::DISTRIBUTED_HELPER_JOB;
        let out = reconcile(&mut rl, &[line("a", 5, 1)], &inp, None);
        assert_eq!(out.selected, vec![0]);
    }

    #[test]
    fn retrieved_implies_unassigned_holds_through_scans() {
        // invariant 1
        let tmp = tempfile::tempdir().unwrap();
        let mut rl = RetrieveList::attach(tmp.path(), 13).unwrap();
        let masks = vec![MaskGroup::from_strings(&["*"])];
        reconcile(&mut rl, &[line("a", 5, 1)], &input(dse(), &masks, 100), None);
        {
            let e = rl.entry_mut(0);
            e.retrieved = 1;
            e.assigned = 0;
        }
        reconcile(&mut rl, &[line("a", 5, 1)], &input(dse(), &masks, 200), None);
        for i in rl.indices() {
            let e = rl.entry(i);
            assert!(e.retrieved == 0 || e.assigned == 0);
        }
    }
}
