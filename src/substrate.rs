//! The group-messaging substrate seam.
//!
//! The transport consumes exactly two substrate capabilities: sending a
//! custom private packet to one peer of a group, and querying whether a
//! peer is connected. Everything else (encryption, authentication,
//! routing) stays on the substrate's side of this trait.

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;

use crate::error::{Error, Result};

/// The capabilities the transport consumes from the group substrate.
pub trait GroupSubstrate {
    /// Send a custom packet to `peer` in `group`. With `reliable` the
    /// substrate retransmits on its own; otherwise the packet may be
    /// dropped in transit.
    fn send_custom_private_packet(
        &mut self,
        group: u32,
        peer: u32,
        reliable: bool,
        data: &[u8],
    ) -> Result<()>;

    /// Whether `peer` is currently connected to `group`.
    fn peer_connected(&self, group: u32, peer: u32) -> bool;
}

/// One packet captured by [`QueueSubstrate`].
#[derive(Debug, Clone)]
pub struct SentPacket {
    /// Destination group
    pub group: u32,
    /// Destination peer
    pub peer: u32,
    /// Whether the reliable channel was requested
    pub reliable: bool,
    /// Whole packet, opcode byte included
    pub data: Bytes,
}

/// In-memory substrate that queues outgoing packets for a pump loop to
/// deliver. Used by the integration tests and the loopback demo; real
/// hosts implement [`GroupSubstrate`] over their messaging stack instead.
#[derive(Debug, Default)]
pub struct QueueSubstrate {
    queue: VecDeque<SentPacket>,
    offline: HashSet<(u32, u32)>,
}

impl QueueSubstrate {
    /// Create an empty substrate with every peer connected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a peer offline or back online.
    pub fn set_peer_offline(&mut self, group: u32, peer: u32, offline: bool) {
        if offline {
            self.offline.insert((group, peer));
        } else {
            self.offline.remove(&(group, peer));
        }
    }

    /// Take every queued packet, oldest first.
    pub fn drain(&mut self) -> Vec<SentPacket> {
        self.queue.drain(..).collect()
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl GroupSubstrate for QueueSubstrate {
    fn send_custom_private_packet(
        &mut self,
        group: u32,
        peer: u32,
        reliable: bool,
        data: &[u8],
    ) -> Result<()> {
        if !self.peer_connected(group, peer) {
            return Err(Error::PeerOffline { group, peer });
        }

        self.queue.push_back(SentPacket {
            group,
            peer,
            reliable,
            data: Bytes::copy_from_slice(data),
        });
        Ok(())
    }

    fn peer_connected(&self, group: u32, peer: u32) -> bool {
        !self.offline.contains(&(group, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_captures_packets() {
        let mut sub = QueueSubstrate::new();

        sub.send_custom_private_packet(0, 1, true, &[1, 2, 3]).unwrap();
        sub.send_custom_private_packet(0, 2, false, &[4]).unwrap();

        let sent = sub.drain();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].peer, 1);
        assert!(sent[0].reliable);
        assert_eq!(sent[1].data.as_ref(), &[4]);
        assert!(sub.is_empty());
    }

    #[test]
    fn test_offline_peer_refuses_sends() {
        let mut sub = QueueSubstrate::new();
        sub.set_peer_offline(0, 1, true);

        assert!(!sub.peer_connected(0, 1));
        assert!(sub.send_custom_private_packet(0, 1, true, &[1]).is_err());

        sub.set_peer_offline(0, 1, false);
        assert!(sub.peer_connected(0, 1));
        assert!(sub.send_custom_private_packet(0, 1, true, &[1]).is_ok());
    }
}
