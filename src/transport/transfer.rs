//! Transfer state and the per-peer slot registry.
//!
//! Each peer holds two fixed arrays of 256 transfer slots, one per
//! direction; the slot index doubles as the on-wire transfer id. A
//! rotating cursor spreads allocations over the id space so a freshly
//! freed slot is not reused immediately.

use std::collections::HashMap;

use bytes::Bytes;

use crate::transport::congestion::CongestionController;
use crate::transport::sequence::{RecvSequenceBuffer, SendSequenceBuffer};

/// Concurrent transfer slots per peer and direction.
pub const SLOTS_PER_PEER: usize = 256;

/// Send-side transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// INIT emitted, waiting for the peer to accept
    InitSent,
    /// Accepted; the driver pulls and transmits file content
    Sending,
    /// All content pulled, acks still outstanding
    Finishing,
}

/// Receive-side transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// Accepted, no data received yet (the offer might still be dropped)
    Inited,
    /// Receiving data
    Recv,
}

/// One outgoing transfer.
#[derive(Debug, Clone)]
pub struct SendTransfer {
    pub file_kind: u8,
    pub file_id: Bytes,
    pub state: SendState,
    pub inits_sent: u32,
    pub time_since_activity: f32,
    pub file_size: u64,
    /// Bytes pulled from the application so far
    pub file_size_current: u64,
    pub ssb: SendSequenceBuffer,
}

impl SendTransfer {
    /// A transfer whose INIT has just been emitted.
    pub fn new(file_kind: u8, file_id: Bytes, file_size: u64) -> Self {
        Self {
            file_kind,
            file_id,
            state: SendState::InitSent,
            inits_sent: 1,
            time_since_activity: 0.0,
            file_size,
            file_size_current: 0,
            ssb: SendSequenceBuffer::new(),
        }
    }

    /// Every byte was pulled from the application.
    pub fn fully_pulled(&self) -> bool {
        self.file_size_current == self.file_size
    }

    /// Every byte was pulled and acknowledged.
    pub fn complete(&self) -> bool {
        self.fully_pulled() && self.ssb.is_empty()
    }
}

/// One incoming transfer.
#[derive(Debug, Clone)]
pub struct RecvTransfer {
    pub file_kind: u8,
    pub file_id: Bytes,
    pub state: RecvState,
    pub file_size: u64,
    /// Bytes delivered in order so far
    pub file_size_current: u64,
    pub rsb: RecvSequenceBuffer,
}

impl RecvTransfer {
    /// A freshly accepted transfer.
    pub fn new(file_kind: u8, file_id: Bytes, file_size: u64, acks_per_packet: usize) -> Self {
        Self {
            file_kind,
            file_id,
            state: RecvState::Inited,
            file_size,
            file_size_current: 0,
            rsb: RecvSequenceBuffer::new(acks_per_packet),
        }
    }

    /// Every byte was delivered to the application.
    pub fn complete(&self) -> bool {
        self.file_size_current >= self.file_size
    }
}

/// Per-peer transfer slots plus the congestion controller shared by all
/// of this peer's transfers.
pub struct Peer {
    pub send_transfers: Vec<Option<SendTransfer>>,
    pub next_send_transfer_idx: usize,
    pub recv_transfers: Vec<Option<RecvTransfer>>,
    pub cc: CongestionController,
}

impl Peer {
    /// Create a peer with empty slots.
    pub fn new(max_segment_data_size: usize) -> Self {
        Self {
            send_transfers: (0..SLOTS_PER_PEER).map(|_| None).collect(),
            next_send_transfer_idx: 0,
            recv_transfers: (0..SLOTS_PER_PEER).map(|_| None).collect(),
            cc: CongestionController::new(max_segment_data_size),
        }
    }

    /// Claim the next free send slot, scanning forward from the rotating
    /// cursor. The cursor always advances by one, even when the slot
    /// actually claimed lies further ahead.
    pub fn allocate_send_slot(&mut self) -> Option<u8> {
        let start = self.next_send_transfer_idx;
        self.next_send_transfer_idx = (start + 1) % SLOTS_PER_PEER;

        let mut idx = start;
        loop {
            if self.send_transfers[idx].is_none() {
                return Some(idx as u8);
            }
            idx = (idx + 1) % SLOTS_PER_PEER;
            if idx == start {
                return None;
            }
        }
    }
}

/// Peers of one group, created lazily on first reference.
#[derive(Default)]
pub struct Group {
    pub peers: HashMap<u32, Peer>,
}
