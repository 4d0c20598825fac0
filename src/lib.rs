//! # gft: Group File Transfer
//!
//! A reliable, congestion-controlled file-transfer transport layered on
//! top of an unordered, lossy custom-packet channel of a group-messaging
//! substrate.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            Application (kind-keyed callbacks)           │
//! ├─────────────────────────────────────────────────────────┤
//! │  FileTransfer (handshake, sequencing, retransmission)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Congestion Control (LEDBAT++, delay-based)             │
//! ├─────────────────────────────────────────────────────────┤
//! │  Extension Dispatch (1-byte opcode routing)             │
//! ├─────────────────────────────────────────────────────────┤
//! │  Group Substrate (custom private packets, lossy)        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Reliability**: arbitrary byte streams survive loss, reordering
//!    and duplication on the substrate channel
//! 2. **Scavenger Behavior**: delay-based congestion control yields to
//!    latency-sensitive traffic on the same bottleneck
//! 3. **Concurrency**: up to 256 transfers per peer and direction, each
//!    independently sequenced
//! 4. **Single-Threaded**: no locks, no internal suspension points; the
//!    host event loop drives everything through `iterate`
//!
//! Encryption and authentication are the substrate's concern; the
//! transport never inspects them.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod ext;
pub mod substrate;
pub mod transport;

pub use error::{Error, Result};
pub use transport::{FileTransfer, TransferConfig, TransferOutcome};
