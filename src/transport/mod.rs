//! Transport Stack Implementation.
//!
//! This module provides a reliable, congestion-controlled file transfer
//! layer on top of an unordered, lossy group-messaging substrate:
//!
//! 1. **Delay-Based Congestion Control**: LEDBAT++ variant that yields to
//!    latency-sensitive traffic on the same bottleneck
//!
//! 2. **Sequenced Segments**: per-transfer 16-bit sequence numbers with
//!    selective acknowledgment and timer-driven retransmission
//!
//! 3. **Multi-Transfer Bookkeeping**: up to 256 concurrent transfers per
//!    peer and direction, addressed by a 1-byte transfer id
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                 Application                    │
//! │   (kind-keyed callbacks supply/consume bytes)  │
//! ├────────────────────────────────────────────────┤
//! │  Transfer Engine (state machines, driver tick) │
//! ├────────────────────────────────────────────────┤
//! │  Sequence Buffers (reassembly, rolling acks)   │
//! ├────────────────────────────────────────────────┤
//! │  Congestion Control (LEDBAT++)                 │
//! ├────────────────────────────────────────────────┤
//! │  Packet Codec (five-message wire format)       │
//! └────────────────────────────────────────────────┘
//! ```

mod congestion;
mod engine;
mod packet;
mod sequence;
mod transfer;

pub use congestion::{CongestionController, SeqId};
pub use engine::{FileTransfer, TransferOutcome};
pub use packet::{Packet, PacketKind};
pub use sequence::{RecvSequenceBuffer, SendSequenceBuffer};
pub use transfer::SLOTS_PER_PEER;

/// IPv4 header bytes attributed to every segment on the wire
pub const IPV4_HEADER_SIZE: usize = 20;

/// UDP header bytes attributed to every segment on the wire
pub const UDP_HEADER_SIZE: usize = 8;

/// Fixed per-segment overhead: 4 framing bytes, 46 substrate bytes,
/// then UDP and IPv4 headers
pub const SEGMENT_OVERHEAD: usize = 4 + 46 + UDP_HEADER_SIZE + IPV4_HEADER_SIZE;

/// Largest segment payload the substrate packet size permits
/// (500-byte custom packets minus 4 framing bytes)
pub const MAX_SEGMENT_DATA_SIZE: usize = 500 - 4;

/// Payload ceiling the driver pulls per DATA packet
pub const DATA_CHUNK_SIZE: usize = 490;

/// Queuing delay the controller keeps the path below (seconds)
pub const TARGET_DELAY: f32 = 0.030;

/// Rate cap in bytes per second (10 MiB/s)
pub const MAX_BYTERATE: f32 = 10.0 * 1024.0 * 1024.0;

pub(crate) const CURRENT_DELAY_WINDOW: usize = 64;
pub(crate) const SECTION_LENGTH: f32 = 30.0;
pub(crate) const SECTION_LOG: usize = 20;
pub(crate) const INITIAL_BASE_DELAY: f32 = 2.0;
pub(crate) const INIT_ATTEMPTS: u32 = 3;

/// Transfer layer configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Rolling ack queue bound: sequence ids echoed per DATA_ACK
    pub acks_per_packet: usize,
    /// Seconds without an INIT_ACK before the INIT is resent
    pub init_retry_timeout_after: f32,
    /// Seconds without an ack before a DATA segment is resent
    pub sending_resend_without_ack_after: f32,
    /// Seconds without any ack before a send transfer is abandoned
    pub sending_give_up_after: f32,
    /// Maximum unacked segments pulled per transfer
    pub packet_window_size: usize,
    /// Segment payload ceiling handed to the congestion controller
    pub max_segment_data_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            acks_per_packet: 3,
            init_retry_timeout_after: 10.0,
            sending_resend_without_ack_after: 5.0,
            sending_give_up_after: 30.0,
            packet_window_size: 2,
            max_segment_data_size: MAX_SEGMENT_DATA_SIZE,
        }
    }
}
