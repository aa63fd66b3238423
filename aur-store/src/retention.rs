//! Retention: eviction of the oldest audit files.
//!
//! A pass starts at the oldest slot and keeps evicting while either
//! trigger holds: total bytes on disk at or over the space limit, or more
//! live files than the configured threshold.  Under the time-priority
//! policy a file younger than `remain_age` survives a space-only trigger
//! until the absolute cap is crossed.

use std::path::Path;

use aur_core::Result;
use tracing::warn;

use crate::audit_file::remove_audit_file;
use crate::index::IndexTable;

/// Absolute cap: past 1 TiB the age guard no longer protects anything.
pub const SPACE_MAXIMUM_BYTES: u64 = 1024 * 1024 * 1024 * 1024;

/// Step between repeated over-soft-limit warnings.
pub const SPACE_WARN_INTERVAL: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// Keep files within `remain_age` even when over the soft space limit.
    #[default]
    TimePriority,
    /// Always evict the oldest file when space runs out.
    SpacePriority,
}

impl CleanupPolicy {
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        if code == 1 {
            Self::SpacePriority
        } else {
            Self::TimePriority
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetentionParams {
    /// Soft space limit in bytes.
    pub space_limit: u64,
    /// Maximum number of live audit files.
    pub remain_threshold: u32,
    /// Minimum age in seconds a file is kept under time priority; 0
    /// disables the age guard.
    pub remain_age: i64,
    pub policy: CleanupPolicy,
}

/// Rate limiter for the over-soft-limit warning: warn once per
/// [`SPACE_WARN_INTERVAL`] of additional excess.
#[derive(Debug, Default)]
pub struct SpaceWarnState {
    next_excess: u64,
}

/// Run one retention pass.  `closed_bytes` is the running total for closed
/// files and is kept in step with every eviction; `current_filesize` is
/// the open file's present size.  Returns the file numbers evicted, oldest
/// first.
pub fn run_retention(
    index: &mut IndexTable,
    dir: &Path,
    current_filesize: u64,
    closed_bytes: &mut u64,
    params: &RetentionParams,
    warn_state: &mut SpaceWarnState,
) -> Result<Vec<u32>> {
    let mut evicted = Vec::new();

    loop {
        if index.count == 0 {
            break;
        }
        let total = *closed_bytes + current_filesize;
        let over_space = total >= params.space_limit;
        let over_count = index.count > params.remain_threshold;
        if !over_space && !over_count {
            break;
        }

        let idx = index.begidx;
        let slot = *index.slot(idx);

        if !over_count
            && params.policy == CleanupPolicy::TimePriority
            && params.remain_age > 0
            && total <= SPACE_MAXIMUM_BYTES
        {
            let excess = total.saturating_sub(params.space_limit);
            if excess >= warn_state.next_excess {
                warn!(
                    target: "aurec::retention",
                    total_bytes = total,
                    space_limit = params.space_limit,
                    excess_mib = excess / (1024 * 1024),
                    "audit file total space exceeds the space limit"
                );
                warn_state.next_excess = (excess / SPACE_WARN_INTERVAL + 1) * SPACE_WARN_INTERVAL;
            }
            // age is measured against the newest audit activity; a
            // backwards-marked ctime flattens negative and never shields
            let age = index.last_audit_time.saturating_sub(slot.ctime.to_disk());
            if age < params.remain_age {
                break;
            }
        }

        if idx == index.curidx {
            // never evict the file the collector is writing
            break;
        }

        if remove_audit_file(dir, slot.filenum).is_err() {
            break;
        }

        if over_space {
            warn!(
                target: "aurec::retention",
                total_bytes = total,
                space_limit = params.space_limit,
                "audit file total space exceeds the space limit"
            );
        }
        if over_count {
            warn!(
                target: "aurec::retention",
                count = index.count,
                threshold = params.remain_threshold,
                "audit file count exceeds the remain threshold"
            );
        }
        warn!(
            target: "aurec::retention",
            filenum = slot.filenum,
            "remove an audit file"
        );

        *closed_bytes = closed_bytes.saturating_sub(u64::from(slot.filesize));
        index.evict_front();
        index.save(dir)?;
        evicted.push(slot.filenum);
    }

    Ok(evicted)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::audit_file::audit_file_path;
    use crate::index::{FileCtime, IndexSlot};
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    /// Build an index of `sizes.len()` closed files plus one empty current
    /// file, with matching files on disk, one second of age apart.
    fn seed_archive(dir: &Path, sizes: &[u32], base_time: i64) -> (IndexTable, u64) {
        let capacity = u32::try_from(sizes.len()).unwrap() + 2;
        let mut index = IndexTable::new(capacity);
        let mut closed = 0u64;
        for (i, &size) in sizes.iter().enumerate() {
            let filenum = u32::try_from(i).unwrap();
            #[allow(clippy::cast_sign_loss)]
            let ctime = FileCtime::At((base_time + i64::try_from(i).unwrap()) as u64);
            *index.slot_mut(filenum) = IndexSlot {
                ctime,
                filenum,
                filesize: size,
            };
            let mut f = File::create(audit_file_path(dir, filenum)).unwrap();
            f.write_all(&vec![0u8; size as usize]).unwrap();
            closed += u64::from(size);
        }
        let count = u32::try_from(sizes.len()).unwrap();
        index.curidx = count; // empty current file in the next slot
        *index.slot_mut(count) = IndexSlot {
            ctime: FileCtime::At(u64::try_from(base_time).unwrap() + u64::from(count)),
            filenum: count,
            filesize: 0,
        };
        index.recompute_count();
        index.last_audit_time = base_time + i64::from(count);
        (index, closed)
    }

    #[test]
    fn test_space_priority_evicts_until_under_limit() {
        let dir = tempdir().unwrap();
        let (mut index, mut closed) = seed_archive(dir.path(), &[4096, 4096, 4096, 4096], 1_000);
        let params = RetentionParams {
            space_limit: 10_000,
            remain_threshold: 100,
            remain_age: 0,
            policy: CleanupPolicy::SpacePriority,
        };
        let evicted = run_retention(
            &mut index,
            dir.path(),
            0,
            &mut closed,
            &params,
            &mut SpaceWarnState::default(),
        )
        .unwrap();

        assert_eq!(evicted, vec![0, 1]);
        assert!(closed < params.space_limit);
        assert!(!audit_file_path(dir.path(), 0).exists());
        assert!(!audit_file_path(dir.path(), 1).exists());
        assert!(audit_file_path(dir.path(), 2).exists());
        assert_eq!(index.begidx, 2);
    }

    #[test]
    fn test_count_threshold_evicts_regardless_of_age() {
        let dir = tempdir().unwrap();
        let (mut index, mut closed) = seed_archive(dir.path(), &[10, 10, 10], 1_000);
        let params = RetentionParams {
            space_limit: u64::MAX,
            remain_threshold: 2,
            remain_age: 1_000_000, // everything is "young"
            policy: CleanupPolicy::TimePriority,
        };
        let evicted = run_retention(
            &mut index,
            dir.path(),
            0,
            &mut closed,
            &params,
            &mut SpaceWarnState::default(),
        )
        .unwrap();

        // 4 live files (3 closed + current) against a threshold of 2
        assert_eq!(evicted, vec![0, 1]);
        assert_eq!(index.count, 2);
    }

    #[test]
    fn test_time_priority_keeps_young_files_over_soft_limit() {
        let dir = tempdir().unwrap();
        let (mut index, mut closed) = seed_archive(dir.path(), &[8192, 8192], 1_000);
        let params = RetentionParams {
            space_limit: 1_000, // well over the soft limit
            remain_threshold: 100,
            remain_age: 1_000_000,
            policy: CleanupPolicy::TimePriority,
        };
        let evicted = run_retention(
            &mut index,
            dir.path(),
            0,
            &mut closed,
            &params,
            &mut SpaceWarnState::default(),
        )
        .unwrap();

        assert!(evicted.is_empty());
        assert!(audit_file_path(dir.path(), 0).exists());
    }

    #[test]
    fn test_time_priority_evicts_once_age_expires() {
        let dir = tempdir().unwrap();
        let (mut index, mut closed) = seed_archive(dir.path(), &[8192, 8192], 1_000);
        // push the newest-activity clock far past the oldest file's ctime
        index.last_audit_time = 1_000 + 5_000;
        let params = RetentionParams {
            space_limit: 1_000,
            remain_threshold: 100,
            remain_age: 60,
            policy: CleanupPolicy::TimePriority,
        };
        let evicted = run_retention(
            &mut index,
            dir.path(),
            0,
            &mut closed,
            &params,
            &mut SpaceWarnState::default(),
        )
        .unwrap();

        assert_eq!(evicted, vec![0, 1]);
    }

    #[test]
    fn test_never_evicts_the_current_file() {
        let dir = tempdir().unwrap();
        let (mut index, mut closed) = seed_archive(dir.path(), &[], 1_000);
        // single live slot, hugely over the limit
        index.slot_mut(0).filesize = 1 << 20;
        closed = 1 << 20;
        let params = RetentionParams {
            space_limit: 1,
            remain_threshold: 0,
            remain_age: 0,
            policy: CleanupPolicy::SpacePriority,
        };
        let evicted = run_retention(
            &mut index,
            dir.path(),
            0,
            &mut closed,
            &params,
            &mut SpaceWarnState::default(),
        )
        .unwrap();

        assert!(evicted.is_empty());
        assert_eq!(index.count, 1);
    }

    #[test]
    fn test_backwards_marked_ctime_ages_the_file() {
        let dir = tempdir().unwrap();
        let (mut index, mut closed) = seed_archive(dir.path(), &[8192], 1_000);
        // unmarked, the oldest file is seconds old and survives the soft
        // limit; the negative sentinel flips its apparent age past 100s
        index.slot_mut(0).ctime.mark_backwards();
        let params = RetentionParams {
            space_limit: 1_000,
            remain_threshold: 100,
            remain_age: 100,
            policy: CleanupPolicy::TimePriority,
        };
        let evicted = run_retention(
            &mut index,
            dir.path(),
            0,
            &mut closed,
            &params,
            &mut SpaceWarnState::default(),
        )
        .unwrap();

        assert_eq!(evicted, vec![0]);
    }
}
