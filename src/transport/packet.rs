//! Packet framing and serialization.
//!
//! Defines the wire format of the five transport messages. Every packet
//! starts with a one-byte opcode owned by the host's extension dispatch;
//! all multi-byte integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Opcodes of the transport messages.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Ask a peer to offer a file
    Request = 0x01,
    /// Offer a file, opening a transfer slot
    Init = 0x02,
    /// Accept an offered file
    InitAck = 0x03,
    /// One sequenced segment of file content
    Data = 0x04,
    /// Selective acknowledgment of received segments
    DataAck = 0x05,
}

impl TryFrom<u8> for PacketKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(PacketKind::Request),
            0x02 => Ok(PacketKind::Init),
            0x03 => Ok(PacketKind::InitAck),
            0x04 => Ok(PacketKind::Data),
            0x05 => Ok(PacketKind::DataAck),
            other => Err(Error::UnknownOpcode(other)),
        }
    }
}

/// A transport message.
///
/// Wire format after the opcode byte:
/// ```text
/// REQUEST   file_kind (1) ‖ file_id (rest)
/// INIT      file_kind (1) ‖ file_size (8, le) ‖ transfer_id (1) ‖ file_id (rest)
/// INIT_ACK  transfer_id (1)
/// DATA      transfer_id (1) ‖ sequence_id (2, le) ‖ payload (rest, >= 1)
/// DATA_ACK  transfer_id (1) ‖ sequence_id (2, le) repeated, >= 1
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Ask a peer to offer the file identified by `file_id`
    Request {
        /// Application-defined kind discriminator
        file_kind: u8,
        /// Kind-dependent file identifier
        file_id: Bytes,
    },
    /// Offer a file of `file_size` bytes on slot `transfer_id`
    Init {
        /// Application-defined kind discriminator
        file_kind: u8,
        /// Total file size in bytes
        file_size: u64,
        /// Sender-chosen transfer slot
        transfer_id: u8,
        /// Kind-dependent file identifier
        file_id: Bytes,
    },
    /// Accept the offer on slot `transfer_id`
    InitAck {
        /// Slot taken from the INIT
        transfer_id: u8,
    },
    /// One segment of file content
    Data {
        /// Transfer slot
        transfer_id: u8,
        /// Transfer-local sequence number
        seq_id: u16,
        /// Segment payload, never empty
        payload: Bytes,
    },
    /// Acknowledge received segments
    DataAck {
        /// Transfer slot
        transfer_id: u8,
        /// Acknowledged sequence numbers, never empty
        seq_ids: Vec<u16>,
    },
}

impl Packet {
    /// The opcode of this message.
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Request { .. } => PacketKind::Request,
            Packet::Init { .. } => PacketKind::Init,
            Packet::InitAck { .. } => PacketKind::InitAck,
            Packet::Data { .. } => PacketKind::Data,
            Packet::DataAck { .. } => PacketKind::DataAck,
        }
    }

    /// Serialize the message, opcode byte included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(self.kind() as u8);

        match self {
            Packet::Request { file_kind, file_id } => {
                buf.put_u8(*file_kind);
                buf.put_slice(file_id);
            }
            Packet::Init {
                file_kind,
                file_size,
                transfer_id,
                file_id,
            } => {
                buf.put_u8(*file_kind);
                buf.put_u64_le(*file_size);
                buf.put_u8(*transfer_id);
                buf.put_slice(file_id);
            }
            Packet::InitAck { transfer_id } => {
                buf.put_u8(*transfer_id);
            }
            Packet::Data {
                transfer_id,
                seq_id,
                payload,
            } => {
                debug_assert!(!payload.is_empty());
                buf.put_u8(*transfer_id);
                buf.put_u16_le(*seq_id);
                buf.put_slice(payload);
            }
            Packet::DataAck {
                transfer_id,
                seq_ids,
            } => {
                debug_assert!(!seq_ids.is_empty());
                buf.put_u8(*transfer_id);
                for seq in seq_ids {
                    buf.put_u16_le(*seq);
                }
            }
        }

        buf.freeze()
    }

    /// Deserialize a whole packet, opcode byte included.
    pub fn decode(mut raw: Bytes) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::Truncated {
                expected: 1,
                actual: 0,
            });
        }

        let kind = PacketKind::try_from(raw.get_u8())?;
        Self::decode_body(kind, raw)
    }

    /// Deserialize the message body following an already-routed opcode.
    pub fn decode_body(kind: PacketKind, mut body: Bytes) -> Result<Self> {
        let need = |expected: usize, actual: usize| Error::Truncated { expected, actual };

        match kind {
            PacketKind::Request => {
                if body.is_empty() {
                    return Err(need(1, 0));
                }
                let file_kind = body.get_u8();
                Ok(Packet::Request {
                    file_kind,
                    file_id: body,
                })
            }
            PacketKind::Init => {
                if body.len() < 10 {
                    return Err(need(10, body.len()));
                }
                let file_kind = body.get_u8();
                let file_size = body.get_u64_le();
                let transfer_id = body.get_u8();
                Ok(Packet::Init {
                    file_kind,
                    file_size,
                    transfer_id,
                    file_id: body,
                })
            }
            PacketKind::InitAck => {
                if body.is_empty() {
                    return Err(need(1, 0));
                }
                Ok(Packet::InitAck {
                    transfer_id: body.get_u8(),
                })
            }
            PacketKind::Data => {
                // transfer id, sequence id and at least one payload byte
                if body.len() < 4 {
                    return Err(need(4, body.len()));
                }
                let transfer_id = body.get_u8();
                let seq_id = body.get_u16_le();
                Ok(Packet::Data {
                    transfer_id,
                    seq_id,
                    payload: body,
                })
            }
            PacketKind::DataAck => {
                if body.len() < 3 {
                    return Err(need(3, body.len()));
                }
                let transfer_id = body.get_u8();
                if body.len() % 2 != 0 {
                    return Err(Error::MisalignedAcks);
                }
                let mut seq_ids = Vec::with_capacity(body.len() / 2);
                while body.has_remaining() {
                    seq_ids.push(body.get_u16_le());
                }
                Ok(Packet::DataAck {
                    transfer_id,
                    seq_ids,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_wire_layout() {
        let packet = Packet::Init {
            file_kind: 8,
            file_size: 0x0102_0304_0506_0708,
            transfer_id: 42,
            file_id: Bytes::from_static(b"id"),
        };

        // byte-exact, integers little-endian
        let expected = [
            0x02, // opcode
            8,    // file_kind
            0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, // file_size
            42,   // transfer_id
            b'i', b'd',
        ];
        assert_eq!(packet.encode().as_ref(), &expected[..]);
    }

    #[test]
    fn test_data_wire_layout() {
        let packet = Packet::Data {
            transfer_id: 3,
            seq_id: 0x1234,
            payload: Bytes::from_static(b"abc"),
        };

        let expected = [0x04, 3, 0x34, 0x12, b'a', b'b', b'c'];
        assert_eq!(packet.encode().as_ref(), &expected[..]);
    }

    #[test]
    fn test_data_ack_round_trip() {
        let packet = Packet::DataAck {
            transfer_id: 7,
            seq_ids: vec![1, 500, u16::MAX],
        };

        let decoded = Packet::decode(packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_request_round_trip() {
        let packet = Packet::Request {
            file_kind: 8,
            file_id: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
        };

        assert_eq!(Packet::decode(packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let err = Packet::decode(Bytes::from_static(&[0xff, 0x00])).unwrap_err();
        assert!(matches!(err, Error::UnknownOpcode(0xff)));
    }

    #[test]
    fn test_truncated_init_rejected() {
        // file_size cut short
        let err =
            Packet::decode_body(PacketKind::Init, Bytes::from_static(&[8, 1, 2, 3])).unwrap_err();
        assert!(matches!(err, Error::Truncated { expected: 10, .. }));
    }

    #[test]
    fn test_empty_data_rejected() {
        // transfer id and sequence id but no payload
        let err =
            Packet::decode_body(PacketKind::Data, Bytes::from_static(&[3, 0, 0])).unwrap_err();
        assert!(matches!(err, Error::Truncated { expected: 4, .. }));
    }

    #[test]
    fn test_misaligned_ack_rejected() {
        // three trailing bytes cannot be a list of u16 ids
        let err = Packet::decode_body(PacketKind::DataAck, Bytes::from_static(&[7, 0, 0, 1]))
            .unwrap_err();
        assert!(matches!(err, Error::MisalignedAcks));

        // and an empty list is no ack at all
        let err = Packet::decode_body(PacketKind::DataAck, Bytes::from_static(&[7])).unwrap_err();
        assert!(matches!(err, Error::Truncated { expected: 3, .. }));
    }

    #[test]
    fn test_empty_file_id_allowed() {
        let packet = Packet::Init {
            file_kind: 1,
            file_size: 0,
            transfer_id: 0,
            file_id: Bytes::new(),
        };

        assert_eq!(Packet::decode(packet.encode()).unwrap(), packet);
    }
}
