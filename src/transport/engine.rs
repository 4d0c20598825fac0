//! The transfer engine.
//!
//! Owns the group/peer registry and the kind-keyed application callbacks,
//! handles the five wire messages and advances every send transfer from a
//! periodic driver tick. Single-threaded by contract: `iterate`, the
//! packet handlers and the synchronous API are all invoked from one
//! thread, and callbacks must not re-enter the engine.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;

use crate::ext::{ExtensionDispatch, PacketHandler};
use crate::substrate::GroupSubstrate;
use crate::transport::congestion::SeqId;
use crate::transport::packet::{Packet, PacketKind};
use crate::transport::transfer::{
    Group, Peer, RecvState, RecvTransfer, SendState, SendTransfer, SLOTS_PER_PEER,
};
use crate::transport::{TransferConfig, DATA_CHUNK_SIZE, INIT_ATTEMPTS};

/// Why a send transfer was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every byte was delivered and acknowledged
    Completed,
    /// The peer never answered the INIT
    InitTimedOut,
    /// The peer stopped acknowledging mid-transfer
    TimedOut,
}

type RecvRequestCb = Box<dyn FnMut(&mut dyn GroupSubstrate, u32, u32, &[u8])>;
type RecvInitCb = Box<dyn FnMut(&mut dyn GroupSubstrate, u32, u32, &[u8], u8, u64) -> bool>;
type RecvDataCb = Box<dyn FnMut(&mut dyn GroupSubstrate, u32, u32, u8, u64, &[u8])>;
type SendDataCb = Box<dyn FnMut(&mut dyn GroupSubstrate, u32, u32, u8, u64, &mut [u8])>;
type SendDoneCb = Box<dyn FnMut(&mut dyn GroupSubstrate, u32, u32, u8, TransferOutcome)>;

/// Reliable, congestion-controlled file transfers over a group-messaging
/// substrate.
///
/// Construct with [`FileTransfer::new`], install the packet handlers on
/// the host's dispatch table with [`FileTransfer::register_ext`], register
/// callbacks per file kind, then call [`FileTransfer::iterate`] from the
/// host event loop.
pub struct FileTransfer {
    options: TransferConfig,

    cb_recv_request: HashMap<u8, RecvRequestCb>,
    cb_recv_init: HashMap<u8, RecvInitCb>,
    cb_recv_data: HashMap<u8, RecvDataCb>,
    cb_send_data: HashMap<u8, SendDataCb>,
    cb_send_done: HashMap<u8, SendDoneCb>,

    groups: HashMap<u32, Group>,
}

impl FileTransfer {
    /// Create an engine with the given options.
    pub fn new(options: TransferConfig) -> Self {
        Self {
            options,
            cb_recv_request: HashMap::new(),
            cb_recv_init: HashMap::new(),
            cb_recv_data: HashMap::new(),
            cb_send_data: HashMap::new(),
            cb_send_done: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    /// Install the five opcode handlers on the host's dispatch table.
    pub fn register_ext(this: &Rc<RefCell<FileTransfer>>, dispatch: &mut ExtensionDispatch) {
        for kind in [
            PacketKind::Request,
            PacketKind::Init,
            PacketKind::InitAck,
            PacketKind::Data,
            PacketKind::DataAck,
        ] {
            dispatch.register(kind as u8, this.clone());
        }
    }

    /// Handle an incoming request for a file of `file_kind`.
    ///
    /// The callback receives (substrate, group, peer, file_id).
    pub fn register_callback_recv_request(
        &mut self,
        file_kind: u8,
        callback: impl FnMut(&mut dyn GroupSubstrate, u32, u32, &[u8]) + 'static,
    ) {
        self.cb_recv_request.insert(file_kind, Box::new(callback));
    }

    /// Decide whether to accept an offered file of `file_kind`.
    ///
    /// The callback receives (substrate, group, peer, file_id,
    /// transfer_id, file_size) and returns true to accept.
    pub fn register_callback_recv_init(
        &mut self,
        file_kind: u8,
        callback: impl FnMut(&mut dyn GroupSubstrate, u32, u32, &[u8], u8, u64) -> bool + 'static,
    ) {
        self.cb_recv_init.insert(file_kind, Box::new(callback));
    }

    /// Consume in-order file content.
    ///
    /// The callback receives (substrate, group, peer, transfer_id,
    /// data_offset, data); offsets are strictly increasing with no gaps.
    pub fn register_callback_recv_data(
        &mut self,
        file_kind: u8,
        callback: impl FnMut(&mut dyn GroupSubstrate, u32, u32, u8, u64, &[u8]) + 'static,
    ) {
        self.cb_recv_data.insert(file_kind, Box::new(callback));
    }

    /// Supply file content to an outgoing transfer.
    ///
    /// The callback receives (substrate, group, peer, transfer_id,
    /// data_offset, buffer) and must fill the whole buffer.
    pub fn register_callback_send_data(
        &mut self,
        file_kind: u8,
        callback: impl FnMut(&mut dyn GroupSubstrate, u32, u32, u8, u64, &mut [u8]) + 'static,
    ) {
        self.cb_send_data.insert(file_kind, Box::new(callback));
    }

    /// Be told when an outgoing transfer is released.
    ///
    /// The callback receives (substrate, group, peer, transfer_id,
    /// outcome).
    pub fn register_callback_send_done(
        &mut self,
        file_kind: u8,
        callback: impl FnMut(&mut dyn GroupSubstrate, u32, u32, u8, TransferOutcome) + 'static,
    ) {
        self.cb_send_done.insert(file_kind, Box::new(callback));
    }

    /// Ask `peer` to offer the file identified by (`file_kind`,
    /// `file_id`). Keeps no local state.
    pub fn send_request_private(
        &mut self,
        sub: &mut dyn GroupSubstrate,
        group: u32,
        peer: u32,
        file_kind: u8,
        file_id: &[u8],
    ) {
        send_packet(
            sub,
            group,
            peer,
            &Packet::Request {
                file_kind,
                file_id: Bytes::copy_from_slice(file_id),
            },
        );
    }

    /// Offer `peer` a file of `file_size` bytes, returning the claimed
    /// transfer id.
    ///
    /// Fails when the peer is offline or all transfer slots are taken.
    pub fn send_init_private(
        &mut self,
        sub: &mut dyn GroupSubstrate,
        group: u32,
        peer: u32,
        file_kind: u8,
        file_id: &[u8],
        file_size: u64,
    ) -> Option<u8> {
        if !sub.peer_connected(group, peer) {
            tracing::warn!(group, peer, "cannot init transfer, peer offline");
            return None;
        }

        let max_segment_data_size = self.options.max_segment_data_size;
        let peer_state = self
            .groups
            .entry(group)
            .or_default()
            .peers
            .entry(peer)
            .or_insert_with(|| Peer::new(max_segment_data_size));

        let Some(transfer_id) = peer_state.allocate_send_slot() else {
            tracing::warn!(group, peer, "cannot init transfer, no free transfer slot");
            return None;
        };

        let file_id = Bytes::copy_from_slice(file_id);
        send_packet(
            sub,
            group,
            peer,
            &Packet::Init {
                file_kind,
                file_size,
                transfer_id,
                file_id: file_id.clone(),
            },
        );

        peer_state.send_transfers[transfer_id as usize] =
            Some(SendTransfer::new(file_kind, file_id, file_size));

        tracing::debug!(group, peer, transfer_id, file_size, "init transfer");
        Some(transfer_id)
    }

    /// Driver tick. Advances timers, retransmits stale segments, pulls
    /// new content from the application, retries inits and releases
    /// timed-out transfers. `time_delta` is seconds since the last tick.
    pub fn iterate(&mut self, sub: &mut dyn GroupSubstrate, time_delta: f32) {
        let Self {
            options,
            groups,
            cb_send_data,
            cb_send_done,
            ..
        } = self;

        for (&group, group_state) in groups.iter_mut() {
            for (&peer, peer_state) in group_state.peers.iter_mut() {
                let Peer {
                    send_transfers,
                    cc,
                    ..
                } = peer_state;

                for idx in 0..SLOTS_PER_PEER {
                    let transfer_id = idx as u8;
                    let slot = &mut send_transfers[idx];
                    let Some(transfer) = slot.as_mut() else {
                        continue;
                    };

                    transfer.time_since_activity += time_delta;

                    match transfer.state {
                        SendState::InitSent => {
                            if transfer.time_since_activity < options.init_retry_timeout_after {
                                continue;
                            }
                            if transfer.inits_sent >= INIT_ATTEMPTS {
                                tracing::warn!(group, peer, transfer_id, "init timed out, giving up");
                                notify_send_done(
                                    cb_send_done,
                                    sub,
                                    group,
                                    peer,
                                    transfer_id,
                                    transfer.file_kind,
                                    TransferOutcome::InitTimedOut,
                                );
                                *slot = None;
                            } else {
                                tracing::warn!(group, peer, transfer_id, "init timed out, resending");
                                send_packet(
                                    sub,
                                    group,
                                    peer,
                                    &Packet::Init {
                                        file_kind: transfer.file_kind,
                                        file_size: transfer.file_size,
                                        transfer_id,
                                        file_id: transfer.file_id.clone(),
                                    },
                                );
                                transfer.inits_sent += 1;
                                transfer.time_since_activity = 0.0;
                            }
                        }
                        SendState::Sending | SendState::Finishing => {
                            // resend segments that went unacked for too long
                            transfer.ssb.for_each(time_delta, |seq, data, since| {
                                if *since >= options.sending_resend_without_ack_after {
                                    cc.on_loss(SeqId::new(transfer_id, seq), false);
                                    send_packet(
                                        sub,
                                        group,
                                        peer,
                                        &Packet::Data {
                                            transfer_id,
                                            seq_id: seq,
                                            payload: data.clone(),
                                        },
                                    );
                                    *since = 0.0;
                                }
                            });

                            if transfer.time_since_activity >= options.sending_give_up_after {
                                tracing::warn!(
                                    group,
                                    peer,
                                    transfer_id,
                                    "transfer timed out, giving up"
                                );
                                // the orphaned segments will never be acked
                                for seq in transfer.ssb.seq_ids() {
                                    cc.on_loss(SeqId::new(transfer_id, seq), true);
                                }
                                notify_send_done(
                                    cb_send_done,
                                    sub,
                                    group,
                                    peer,
                                    transfer_id,
                                    transfer.file_kind,
                                    TransferOutcome::TimedOut,
                                );
                                *slot = None;
                                continue;
                            }

                            if transfer.state == SendState::Sending && transfer.fully_pulled() {
                                transfer.state = SendState::Finishing;
                            }

                            if transfer.state == SendState::Sending {
                                let Some(callback) = cb_send_data.get_mut(&transfer.file_kind)
                                else {
                                    tracing::warn!(
                                        file_kind = transfer.file_kind,
                                        "no send_data callback registered"
                                    );
                                    continue;
                                };

                                while transfer.ssb.len() < options.packet_window_size {
                                    if cc.can_send() == 0 {
                                        break;
                                    }

                                    let remaining =
                                        transfer.file_size - transfer.file_size_current;
                                    let chunk_size =
                                        remaining.min(DATA_CHUNK_SIZE as u64) as usize;
                                    if chunk_size == 0 {
                                        transfer.state = SendState::Finishing;
                                        break;
                                    }

                                    let mut chunk = vec![0u8; chunk_size];
                                    callback(
                                        sub,
                                        group,
                                        peer,
                                        transfer_id,
                                        transfer.file_size_current,
                                        &mut chunk,
                                    );

                                    let payload = Bytes::from(chunk);
                                    let seq = transfer.ssb.add(payload.clone());
                                    cc.on_sent(SeqId::new(transfer_id, seq), payload.len());
                                    send_packet(
                                        sub,
                                        group,
                                        peer,
                                        &Packet::Data {
                                            transfer_id,
                                            seq_id: seq,
                                            payload,
                                        },
                                    );

                                    transfer.file_size_current += chunk_size as u64;
                                    tracing::trace!(transfer_id, seq, chunk_size, "sent data chunk");
                                }
                            }

                            // covers transfers that never produce acks,
                            // like zero-length files
                            if transfer.complete() {
                                tracing::debug!(group, peer, transfer_id, "send transfer done");
                                notify_send_done(
                                    cb_send_done,
                                    sub,
                                    group,
                                    peer,
                                    transfer_id,
                                    transfer.file_kind,
                                    TransferOutcome::Completed,
                                );
                                *slot = None;
                            }
                        }
                    }
                }
            }
        }
    }

    fn handle_request(
        &mut self,
        sub: &mut dyn GroupSubstrate,
        group: u32,
        peer: u32,
        file_kind: u8,
        file_id: &Bytes,
    ) {
        tracing::debug!(
            group,
            peer,
            file_kind,
            file_id = %hex(file_id),
            "got transfer request"
        );

        match self.cb_recv_request.get_mut(&file_kind) {
            Some(callback) => callback(sub, group, peer, file_id),
            None => tracing::warn!(file_kind, "request for unregistered file kind"),
        }
    }

    fn handle_init(
        &mut self,
        sub: &mut dyn GroupSubstrate,
        group: u32,
        peer: u32,
        file_kind: u8,
        file_size: u64,
        transfer_id: u8,
        file_id: Bytes,
    ) {
        tracing::debug!(
            group,
            peer,
            file_kind,
            file_size,
            transfer_id,
            file_id = %hex(&file_id),
            "got transfer init"
        );

        let accept = match self.cb_recv_init.get_mut(&file_kind) {
            Some(callback) => callback(sub, group, peer, &file_id, transfer_id, file_size),
            None => {
                tracing::warn!(file_kind, "init for unregistered file kind");
                false
            }
        };

        if !accept {
            // no deny message is defined; the peer's init retries expire
            tracing::debug!(group, peer, transfer_id, "rejected init");
            return;
        }

        send_packet(sub, group, peer, &Packet::InitAck { transfer_id });

        let max_segment_data_size = self.options.max_segment_data_size;
        let acks_per_packet = self.options.acks_per_packet;
        let peer_state = self
            .groups
            .entry(group)
            .or_default()
            .peers
            .entry(peer)
            .or_insert_with(|| Peer::new(max_segment_data_size));

        if peer_state.recv_transfers[transfer_id as usize].is_some() {
            tracing::warn!(group, peer, transfer_id, "overwriting existing receive transfer");
        }

        peer_state.recv_transfers[transfer_id as usize] = Some(RecvTransfer::new(
            file_kind,
            file_id,
            file_size,
            acks_per_packet,
        ));
    }

    fn handle_init_ack(&mut self, group: u32, peer: u32, transfer_id: u8) {
        let Some(transfer) = self
            .groups
            .get_mut(&group)
            .and_then(|g| g.peers.get_mut(&peer))
            .and_then(|p| p.send_transfers[transfer_id as usize].as_mut())
        else {
            tracing::debug!(group, peer, transfer_id, "init ack for unknown transfer");
            return;
        };

        if transfer.state != SendState::InitSent {
            tracing::debug!(group, peer, transfer_id, "init ack for transfer already sending");
            return;
        }

        // the next driver tick starts pulling data
        transfer.state = SendState::Sending;
        transfer.time_since_activity = 0.0;
    }

    fn handle_data(
        &mut self,
        sub: &mut dyn GroupSubstrate,
        group: u32,
        peer: u32,
        transfer_id: u8,
        seq_id: u16,
        payload: Bytes,
    ) {
        let Self {
            groups,
            cb_recv_data,
            ..
        } = self;

        let Some(peer_state) = groups.get_mut(&group).and_then(|g| g.peers.get_mut(&peer))
        else {
            tracing::debug!(group, peer, "data for unknown group or peer");
            return;
        };

        let slot = &mut peer_state.recv_transfers[transfer_id as usize];
        let Some(transfer) = slot.as_mut() else {
            tracing::debug!(group, peer, transfer_id, "data for unknown transfer");
            return;
        };

        if transfer.state == RecvState::Inited {
            transfer.state = RecvState::Recv;
        }
        transfer.rsb.add(seq_id, payload);

        let Some(callback) = cb_recv_data.get_mut(&transfer.file_kind) else {
            tracing::warn!(
                file_kind = transfer.file_kind,
                "data for unregistered file kind"
            );
            return;
        };

        // release everything contiguous
        while let Some(chunk) = transfer.rsb.pop() {
            callback(
                sub,
                group,
                peer,
                transfer_id,
                transfer.file_size_current,
                &chunk,
            );
            transfer.file_size_current += chunk.len() as u64;
        }

        let seq_ids: Vec<u16> = transfer.rsb.ack_ids().collect();
        if !seq_ids.is_empty() {
            send_packet(
                sub,
                group,
                peer,
                &Packet::DataAck {
                    transfer_id,
                    seq_ids,
                },
            );
        }

        if transfer.complete() {
            tracing::debug!(
                group,
                peer,
                transfer_id,
                file_id = %hex(&transfer.file_id),
                "receive transfer done"
            );
            *slot = None;
        }
    }

    fn handle_data_ack(
        &mut self,
        sub: &mut dyn GroupSubstrate,
        group: u32,
        peer: u32,
        transfer_id: u8,
        seq_ids: Vec<u16>,
    ) {
        let Self {
            groups,
            cb_send_done,
            ..
        } = self;

        let Some(peer_state) = groups.get_mut(&group).and_then(|g| g.peers.get_mut(&peer))
        else {
            tracing::debug!(group, peer, "data ack for unknown group or peer");
            return;
        };

        let Peer {
            send_transfers,
            cc,
            ..
        } = peer_state;

        let slot = &mut send_transfers[transfer_id as usize];
        let Some(transfer) = slot.as_mut() else {
            tracing::debug!(group, peer, transfer_id, "data ack for unknown transfer");
            return;
        };

        if transfer.state == SendState::InitSent {
            tracing::debug!(group, peer, transfer_id, "data ack before init ack");
            return;
        }

        transfer.time_since_activity = 0.0;

        let mut acked = Vec::with_capacity(seq_ids.len());
        for seq in seq_ids {
            transfer.ssb.erase(seq);
            acked.push(SeqId::new(transfer_id, seq));
        }
        // duplicate ids are ignored by the controller
        cc.on_ack(&acked);

        if transfer.complete() {
            tracing::debug!(group, peer, transfer_id, "send transfer done");
            notify_send_done(
                cb_send_done,
                sub,
                group,
                peer,
                transfer_id,
                transfer.file_kind,
                TransferOutcome::Completed,
            );
            *slot = None;
        }
    }
}

impl PacketHandler for FileTransfer {
    fn handle_packet(
        &mut self,
        sub: &mut dyn GroupSubstrate,
        group: u32,
        peer: u32,
        opcode: u8,
        payload: &[u8],
    ) {
        let kind = match PacketKind::try_from(opcode) {
            Ok(kind) => kind,
            Err(err) => {
                tracing::debug!(%err, group, peer, "dropping packet");
                return;
            }
        };

        let packet = match Packet::decode_body(kind, Bytes::copy_from_slice(payload)) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::debug!(%err, group, peer, ?kind, "dropping malformed packet");
                return;
            }
        };

        match packet {
            Packet::Request { file_kind, file_id } => {
                self.handle_request(sub, group, peer, file_kind, &file_id)
            }
            Packet::Init {
                file_kind,
                file_size,
                transfer_id,
                file_id,
            } => self.handle_init(sub, group, peer, file_kind, file_size, transfer_id, file_id),
            Packet::InitAck { transfer_id } => self.handle_init_ack(group, peer, transfer_id),
            Packet::Data {
                transfer_id,
                seq_id,
                payload,
            } => self.handle_data(sub, group, peer, transfer_id, seq_id, payload),
            Packet::DataAck {
                transfer_id,
                seq_ids,
            } => self.handle_data_ack(sub, group, peer, transfer_id, seq_ids),
        }
    }
}

fn send_packet(sub: &mut dyn GroupSubstrate, group: u32, peer: u32, packet: &Packet) {
    if let Err(err) = sub.send_custom_private_packet(group, peer, true, &packet.encode()) {
        tracing::debug!(%err, group, peer, kind = ?packet.kind(), "substrate send failed");
    }
}

fn notify_send_done(
    callbacks: &mut HashMap<u8, SendDoneCb>,
    sub: &mut dyn GroupSubstrate,
    group: u32,
    peer: u32,
    transfer_id: u8,
    file_kind: u8,
    outcome: TransferOutcome,
) {
    if let Some(callback) = callbacks.get_mut(&file_kind) {
        callback(sub, group, peer, transfer_id, outcome);
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
