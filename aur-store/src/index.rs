//! Persistent index table.
//!
//! One small binary file (`index_table`) names every live audit file and
//! tracks its size and creation time.  The table is a bounded ring:
//! `maxnum` slots, with the live range `[begidx, curidx]` wrapping.  The
//! whole file is rewritten on every update; it is far too small for a
//! partial-update scheme to pay off.
//!
//! Layout (little-endian): `maxnum u32, begidx u32, curidx u32, count u32,
//! last_audit_time i64`, then exactly `maxnum` slots of
//! `ctime i64, filenum u32, filesize u32`.

use std::fs;
use std::path::Path;

use aur_core::{AuditError, Result};
use tracing::warn;

pub const INDEX_FILE_NAME: &str = "index_table";

const INDEX_HEADER_SIZE: usize = 24;
const SLOT_SIZE: usize = 16;

/// Upper bound on a credible slot count; anything larger means the header
/// bytes are garbage, not a table.
const MAX_CREDIBLE_SLOTS: u32 = 16 * 1024 * 1024;

/// Creation time of one audit file.
///
/// The on-disk value is signed: 0 means the slot has never held an open
/// file, a positive value is the creation time, and a negative value marks
/// that the wall clock moved backwards while this file was being written
/// (its records may carry any timestamp).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileCtime {
    #[default]
    Unset,
    At(u64),
    BackwardsMarked(u64),
}

impl FileCtime {
    #[must_use]
    pub fn to_disk(self) -> i64 {
        #[allow(clippy::cast_possible_wrap)]
        match self {
            Self::Unset => 0,
            Self::At(t) => t as i64,
            Self::BackwardsMarked(t) => -(t as i64),
        }
    }

    #[must_use]
    pub fn from_disk(v: i64) -> Self {
        #[allow(clippy::cast_sign_loss)]
        match v {
            0 => Self::Unset,
            t if t > 0 => Self::At(t as u64),
            t => Self::BackwardsMarked(t.unsigned_abs()),
        }
    }

    #[must_use]
    pub fn is_marked(self) -> bool {
        matches!(self, Self::BackwardsMarked(_))
    }

    #[must_use]
    pub fn seconds(self) -> u64 {
        match self {
            Self::Unset => 0,
            Self::At(t) | Self::BackwardsMarked(t) => t,
        }
    }

    /// Flip a positive creation time into the backwards-clock sentinel.
    pub fn mark_backwards(&mut self) {
        if let Self::At(t) = *self {
            *self = Self::BackwardsMarked(t);
        }
    }
}

/// One ring slot: the file of record it names, its size and creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSlot {
    pub ctime: FileCtime,
    pub filenum: u32,
    pub filesize: u32,
}

/// In-memory image of the index table.
#[derive(Debug, Clone)]
pub struct IndexTable {
    maxnum: u32,
    pub begidx: u32,
    pub curidx: u32,
    pub count: u32,
    pub last_audit_time: i64,
    slots: Vec<IndexSlot>,
}

impl IndexTable {
    /// Fresh empty table with `capacity` slots (retention threshold + 1).
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            maxnum: capacity,
            begidx: 0,
            curidx: 0,
            count: 0,
            last_audit_time: 0,
            slots: vec![IndexSlot::default(); capacity as usize],
        }
    }

    #[must_use]
    pub fn maxnum(&self) -> u32 {
        self.maxnum
    }

    #[must_use]
    pub fn slot(&self, idx: u32) -> &IndexSlot {
        &self.slots[idx as usize % self.slots.len()]
    }

    pub fn slot_mut(&mut self, idx: u32) -> &mut IndexSlot {
        let len = self.slots.len();
        &mut self.slots[idx as usize % len]
    }

    #[must_use]
    pub fn current(&self) -> &IndexSlot {
        self.slot(self.curidx)
    }

    pub fn current_mut(&mut self) -> &mut IndexSlot {
        self.slot_mut(self.curidx)
    }

    #[must_use]
    pub fn next_index(&self, idx: u32) -> u32 {
        (idx + 1) % self.maxnum
    }

    /// Re-derive `count` from the ring positions.  The live range is
    /// `[begidx, curidx]` inclusive, wrapping.
    pub fn recompute_count(&mut self) {
        self.count = if self.curidx >= self.begidx {
            self.curidx - self.begidx + 1
        } else {
            self.curidx + self.maxnum + 1 - self.begidx
        };
    }

    /// Close bookkeeping for the current slot and step the ring forward:
    /// record the final size, then seat the next file number in a zeroed
    /// successor slot.
    pub fn advance_current(&mut self, filesize: u32) {
        let next_filenum = {
            let cur = self.current_mut();
            cur.filesize = filesize;
            cur.filenum.wrapping_add(1)
        };
        self.curidx = self.next_index(self.curidx);
        *self.current_mut() = IndexSlot {
            ctime: FileCtime::Unset,
            filenum: next_filenum,
            filesize: 0,
        };
    }

    /// Drop the oldest slot from the ring and return its contents.
    pub fn evict_front(&mut self) -> IndexSlot {
        let idx = self.begidx;
        let evicted = std::mem::take(self.slot_mut(idx));
        self.begidx = self.next_index(idx);
        self.count = self.count.saturating_sub(1);
        evicted
    }

    /// Ring positions of the live slots, oldest first.
    #[must_use]
    pub fn live_indices(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.count as usize);
        if self.count == 0 {
            return out;
        }
        let mut idx = self.begidx;
        loop {
            out.push(idx);
            if idx == self.curidx {
                break;
            }
            idx = self.next_index(idx);
        }
        out
    }

    /// Total bytes recorded for live slots (the open file reports its own
    /// running size separately).
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.live_indices()
            .iter()
            .map(|&i| u64::from(self.slot(i).filesize))
            .sum()
    }

    /// Compact this table into a fresh one sized for `threshold` retained
    /// files.  Live slots land densely at the front.
    #[must_use]
    pub fn rebuild(&self, threshold: u32) -> Self {
        let mut fresh = Self::new(threshold + 1);
        let mut live = self.live_indices();
        // a failed eviction can leave more live slots than the new
        // capacity; the newest ones win
        if live.len() > fresh.slots.len() {
            live.drain(..live.len() - fresh.slots.len());
        }
        for (pos, &idx) in live.iter().enumerate() {
            fresh.slots[pos] = *self.slot(idx);
        }
        if !live.is_empty() {
            fresh.count = u32::try_from(live.len()).unwrap_or(u32::MAX);
            fresh.curidx = fresh.count - 1;
        }
        fresh.last_audit_time = self.last_audit_time;
        fresh
    }

    /// Load the table from `dir`, if one has been written there.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(INDEX_FILE_NAME);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let corrupt = |reason| AuditError::CorruptIndex {
            path: path.display().to_string(),
            reason,
        };

        if raw.len() < INDEX_HEADER_SIZE {
            return Err(corrupt("short header"));
        }
        let maxnum = read_u32(&raw, 0);
        let begidx = read_u32(&raw, 4);
        let curidx = read_u32(&raw, 8);
        let count = read_u32(&raw, 12);
        let last_audit_time = read_i64(&raw, 16);

        if maxnum == 0 || maxnum > MAX_CREDIBLE_SLOTS {
            return Err(corrupt("implausible slot capacity"));
        }
        if begidx >= maxnum || curidx >= maxnum || count > maxnum {
            return Err(corrupt("ring positions out of range"));
        }
        let want = INDEX_HEADER_SIZE + maxnum as usize * SLOT_SIZE;
        if raw.len() < want {
            return Err(corrupt("truncated slot array"));
        }

        let mut slots = Vec::with_capacity(maxnum as usize);
        for i in 0..maxnum as usize {
            let base = INDEX_HEADER_SIZE + i * SLOT_SIZE;
            slots.push(IndexSlot {
                ctime: FileCtime::from_disk(read_i64(&raw, base)),
                filenum: read_u32(&raw, base + 8),
                filesize: read_u32(&raw, base + 12),
            });
        }

        Ok(Some(Self {
            maxnum,
            begidx,
            curidx,
            count,
            last_audit_time,
            slots,
        }))
    }

    /// Persist the whole table, truncating any previous image.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let mut raw = Vec::with_capacity(INDEX_HEADER_SIZE + self.slots.len() * SLOT_SIZE);
        raw.extend_from_slice(&self.maxnum.to_le_bytes());
        raw.extend_from_slice(&self.begidx.to_le_bytes());
        raw.extend_from_slice(&self.curidx.to_le_bytes());
        raw.extend_from_slice(&self.count.to_le_bytes());
        raw.extend_from_slice(&self.last_audit_time.to_le_bytes());
        for slot in &self.slots {
            raw.extend_from_slice(&slot.ctime.to_disk().to_le_bytes());
            raw.extend_from_slice(&slot.filenum.to_le_bytes());
            raw.extend_from_slice(&slot.filesize.to_le_bytes());
        }
        fs::write(dir.join(INDEX_FILE_NAME), raw)?;
        Ok(())
    }

    /// Remove the on-disk image, keeping the in-memory table.
    pub fn unlink(dir: &Path) {
        if let Err(e) = fs::remove_file(dir.join(INDEX_FILE_NAME)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    target: "aurec::index",
                    error = %e,
                    "could not remove audit index table file"
                );
            }
        }
    }
}

fn read_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

fn read_i64(raw: &[u8], at: usize) -> i64 {
    i64::from_le_bytes([
        raw[at],
        raw[at + 1],
        raw[at + 2],
        raw[at + 3],
        raw[at + 4],
        raw[at + 5],
        raw[at + 6],
        raw[at + 7],
    ])
}
