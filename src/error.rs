//! Error types for the gft transport.

use thiserror::Error;

/// Result type alias for gft operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding, decoding or sending packets.
#[derive(Error, Debug)]
pub enum Error {
    /// Packet shorter than its fixed header
    #[error("packet too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Opcode byte not assigned to any transport message
    #[error("unknown packet opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// DATA_ACK payload empty or not a multiple of 2 bytes
    #[error("acknowledgment list is empty or misaligned")]
    MisalignedAcks,

    /// Peer is not connected to the group
    #[error("peer {peer} in group {group} is offline")]
    PeerOffline { group: u32, peer: u32 },

    /// The underlying group substrate refused the packet
    #[error("substrate error: {0}")]
    Substrate(String),
}

impl Error {
    /// Create a new substrate error
    pub fn substrate(msg: impl Into<String>) -> Self {
        Error::Substrate(msg.into())
    }

    /// Check if this error indicates a malformed incoming packet
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Error::Truncated { .. } | Error::UnknownOpcode(_) | Error::MisalignedAcks
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Truncated {
            expected: 10,
            actual: 3,
        };
        assert_eq!(err.to_string(), "packet too short: expected 10 bytes, got 3");

        let err = Error::UnknownOpcode(0xff);
        assert_eq!(err.to_string(), "unknown packet opcode: 0xff");
    }

    #[test]
    fn test_error_malformed() {
        assert!(Error::MisalignedAcks.is_malformed());
        assert!(!Error::PeerOffline { group: 0, peer: 1 }.is_malformed());
    }
}
