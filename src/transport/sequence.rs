//! Per-transfer sequence buffers.
//!
//! The send side keeps every transmitted-but-unacked segment together with
//! the time since its last transmission; the receive side reassembles
//! out-of-order segments and keeps a bounded rolling queue of recently
//! received sequence ids to echo back as acks.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;

#[derive(Debug, Clone)]
struct SsbEntry {
    data: Bytes,
    time_since_activity: f32,
}

/// Outstanding segments of one send transfer, keyed by sequence id.
#[derive(Debug, Clone, Default)]
pub struct SendSequenceBuffer {
    entries: BTreeMap<u16, SsbEntry>,
    next_seq_id: u16,
}

impl SendSequenceBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a segment and assign it the next sequence id (16-bit wrap).
    pub fn add(&mut self, data: Bytes) -> u16 {
        let seq = self.next_seq_id;
        self.next_seq_id = self.next_seq_id.wrapping_add(1);
        self.entries.insert(
            seq,
            SsbEntry {
                data,
                time_since_activity: 0.0,
            },
        );
        seq
    }

    /// Drop an acknowledged segment. Returns whether it was present.
    pub fn erase(&mut self, seq: u16) -> bool {
        self.entries.remove(&seq).is_some()
    }

    /// Number of unacked segments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether every segment has been acknowledged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Outstanding sequence ids in ascending order.
    pub fn seq_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.keys().copied()
    }

    /// Advance every segment's retransmit timer by `time_delta` and visit
    /// it; the callee may reset the timer. Visits in ascending sequence
    /// order.
    pub fn for_each(&mut self, time_delta: f32, mut f: impl FnMut(u16, &Bytes, &mut f32)) {
        for (&seq, entry) in self.entries.iter_mut() {
            entry.time_since_activity += time_delta;
            f(seq, &entry.data, &mut entry.time_since_activity);
        }
    }
}

/// Reassembly buffer of one receive transfer.
#[derive(Debug, Clone)]
pub struct RecvSequenceBuffer {
    entries: BTreeMap<u16, Bytes>,
    next_seq_id: u16,
    /// Recently received ids to echo as acks; entries are deleted once
    /// popped, so this queue is kept separately
    ack_queue: VecDeque<u16>,
    ack_capacity: usize,
}

impl RecvSequenceBuffer {
    /// Create a buffer echoing at most `ack_capacity` ids per ack.
    pub fn new(ack_capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq_id: 0,
            ack_queue: VecDeque::with_capacity(ack_capacity),
            ack_capacity,
        }
    }

    /// Store a received segment and queue its id for acking.
    ///
    /// A sequence id behind the in-order cursor was already delivered;
    /// it is re-queued for acking but not stored again.
    pub fn add(&mut self, seq: u16, data: Bytes) {
        if seq.wrapping_sub(self.next_seq_id) < 0x8000 {
            self.entries.insert(seq, data);
        }

        self.ack_queue.push_back(seq);
        while self.ack_queue.len() > self.ack_capacity {
            self.ack_queue.pop_front();
        }
    }

    /// Whether the next in-order segment is available.
    pub fn can_pop(&self) -> bool {
        self.entries.contains_key(&self.next_seq_id)
    }

    /// Remove and return the next in-order segment, advancing the cursor.
    pub fn pop(&mut self) -> Option<Bytes> {
        let data = self.entries.remove(&self.next_seq_id)?;
        self.next_seq_id = self.next_seq_id.wrapping_add(1);
        Some(data)
    }

    /// Up to `count` stored sequence ids, lowest first. Fallback ack
    /// source when the rolling queue is unavailable.
    pub fn front_seq_ids(&self, count: usize) -> Vec<u16> {
        self.entries.keys().copied().take(count).collect()
    }

    /// The rolling queue of ids to echo in the next ack, oldest first.
    pub fn ack_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.ack_queue.iter().copied()
    }

    /// Number of segments waiting for reassembly.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no segments are buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
