//! Chunked pipe framing.
//!
//! Records travel from producers to the collector over a shared pipe as
//! frames of at most [`PIPE_CHUNK_SIZE`](crate::PIPE_CHUNK_SIZE) bytes, the
//! size POSIX guarantees to be written atomically.  Each frame carries the
//! producer id and a last-chunk marker so the reader can reassemble whole
//! records even when many producers write concurrently.
//!
//! Frame layout (little-endian): two NUL magic bytes, payload length
//! (`u16`), producer id (`u64`), and an `is_last` byte (`b't'` / `b'f'`),
//! followed by the payload.  Non-NUL marker bytes make a false double-NUL
//! prologue a little less likely in stray data.

use std::ops::Range;

use crate::{FRAME_HEADER_SIZE, MAX_CHUNK_PAYLOAD};

const LAST: u8 = b't';
const NOT_LAST: u8 = b'f';

/// Split an encoded record into wire frames, one `Vec` per atomic write.
///
/// All frames but the final one are marked `'f'`.  An empty record encodes
/// to no frames at all.
#[must_use]
pub fn encode_chunks(producer: u64, record: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::with_capacity(record.len().div_ceil(MAX_CHUNK_PAYLOAD));
    let mut rest = record;
    while rest.len() > MAX_CHUNK_PAYLOAD {
        frames.push(encode_frame(producer, false, &rest[..MAX_CHUNK_PAYLOAD]));
        rest = &rest[MAX_CHUNK_PAYLOAD..];
    }
    if !rest.is_empty() {
        frames.push(encode_frame(producer, true, rest));
    }
    frames
}

#[allow(clippy::cast_possible_truncation)]
fn encode_frame(producer: u64, is_last: bool, payload: &[u8]) -> Vec<u8> {
    debug_assert!(!payload.is_empty() && payload.len() <= MAX_CHUNK_PAYLOAD);
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&producer.to_le_bytes());
    frame.push(if is_last { LAST } else { NOT_LAST });
    frame.extend_from_slice(payload);
    frame
}

/// One step of the greedy frame scanner.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameStep {
    /// Not enough buffered bytes to decide; read more.
    NeedMore,
    /// A whole validated frame.  `payload` indexes into the scanned buffer;
    /// `consumed` is the total frame length to drain.
    Chunk {
        producer: u64,
        is_last: bool,
        payload: Range<usize>,
        consumed: usize,
    },
    /// The buffer does not start with a valid frame.  The first `len` bytes
    /// are non-protocol data to be written out verbatim.
    Stray { len: usize },
}

/// Examine the front of the rolling buffer for the next frame.
///
/// Invalid headers are treated as stray data: everything up to the next
/// double-NUL prologue is surrendered so non-protocol bytes are preserved
/// rather than dropped.  A trailing lone NUL stays buffered, since it may
/// be the first byte of a frame split across reads.
#[must_use]
pub fn scan_frame(buf: &[u8]) -> FrameStep {
    if buf.len() < FRAME_HEADER_SIZE {
        return FrameStep::NeedMore;
    }

    if let Some((len, producer, is_last)) = parse_header(buf) {
        let consumed = FRAME_HEADER_SIZE + len;
        if buf.len() < consumed {
            return FrameStep::NeedMore;
        }
        return FrameStep::Chunk {
            producer,
            is_last,
            payload: FRAME_HEADER_SIZE..consumed,
            consumed,
        };
    }

    // Resync: look for the next plausible frame start.
    for i in 1..buf.len() - 1 {
        if buf[i] == 0 && buf[i + 1] == 0 {
            return FrameStep::Stray { len: i };
        }
    }
    if buf[buf.len() - 1] == 0 {
        FrameStep::Stray { len: buf.len() - 1 }
    } else {
        FrameStep::Stray { len: buf.len() }
    }
}

fn parse_header(buf: &[u8]) -> Option<(usize, u64, bool)> {
    if buf[0] != 0 || buf[1] != 0 {
        return None;
    }
    let len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
    if len == 0 || len > MAX_CHUNK_PAYLOAD {
        return None;
    }
    let producer = u64::from_le_bytes([
        buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
    ]);
    if producer == 0 {
        return None;
    }
    let is_last = match buf[12] {
        LAST => true,
        NOT_LAST => false,
        _ => return None,
    };
    Some((len, producer, is_last))
}
