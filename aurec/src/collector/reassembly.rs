//! Per-producer reassembly of chunked records.
//!
//! A producer's non-final chunks accumulate here until its final chunk
//! arrives.  An entry outlives its record: completing a record empties the
//! buffer but keeps the slot for O(1) reuse by the same producer, the
//! idle/active distinction being whether any bytes are pending.

use std::collections::HashMap;

/// Map from producer id to its pending record prefix.
#[derive(Debug, Default)]
pub struct ReassemblyMap {
    buffers: HashMap<u64, Vec<u8>>,
}

impl ReassemblyMap {
    /// Append a non-final chunk's payload to the producer's buffer.
    pub fn accumulate(&mut self, producer: u64, payload: &[u8]) {
        self.buffers
            .entry(producer)
            .or_default()
            .extend_from_slice(payload);
    }

    /// Final chunk: whatever accumulated plus `payload` is one whole
    /// record.  The producer's slot stays allocated but idle.
    pub fn complete(&mut self, producer: u64, payload: &[u8]) -> Vec<u8> {
        match self.buffers.get_mut(&producer) {
            Some(buf) if !buf.is_empty() => {
                let mut record = std::mem::take(buf);
                record.extend_from_slice(payload);
                record
            }
            _ => payload.to_vec(),
        }
    }

    /// Number of producers with bytes pending.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffers.values().filter(|b| !b.is_empty()).count()
    }

    /// Surrender every partial buffer, oldest producers in id order so
    /// shutdown output is deterministic.  Used when the pipe reaches EOF:
    /// a prefix of a never-completed record is still written out rather
    /// than dropped.
    pub fn drain_partial(&mut self) -> Vec<(u64, Vec<u8>)> {
        let mut partial: Vec<(u64, Vec<u8>)> = self
            .buffers
            .iter_mut()
            .filter(|(_, buf)| !buf.is_empty())
            .map(|(&producer, buf)| (producer, std::mem::take(buf)))
            .collect();
        partial.sort_unstable_by_key(|(producer, _)| *producer);
        partial
    }
}
