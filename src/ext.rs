//! Opcode dispatch for extension packets.
//!
//! The group substrate hands every incoming custom packet to one dispatch
//! table; the first payload byte selects the registered handler. The
//! transport installs its five handlers here, and other extensions can
//! claim their own opcodes on the same table.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::rc::Rc;

use crate::substrate::GroupSubstrate;

/// A packet handler owned by some extension.
///
/// Handlers are shared `Rc<RefCell<…>>` values: everything runs on one
/// thread and a handler must not re-enter the dispatch while borrowed.
pub trait PacketHandler {
    /// Handle one packet. `payload` excludes the opcode byte.
    fn handle_packet(
        &mut self,
        sub: &mut dyn GroupSubstrate,
        group: u32,
        peer: u32,
        opcode: u8,
        payload: &[u8],
    );
}

/// Maps opcode bytes to extension packet handlers.
#[derive(Default)]
pub struct ExtensionDispatch {
    handlers: HashMap<u8, Rc<RefCell<dyn PacketHandler>>>,
}

impl ExtensionDispatch {
    /// Create an empty dispatch table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an opcode. Returns false when it is already taken.
    pub fn register(&mut self, opcode: u8, handler: Rc<RefCell<dyn PacketHandler>>) -> bool {
        match self.handlers.entry(opcode) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(handler);
                true
            }
        }
    }

    /// Route an incoming custom packet to its handler. Returns whether a
    /// handler consumed it.
    pub fn handle(
        &self,
        sub: &mut dyn GroupSubstrate,
        group: u32,
        peer: u32,
        packet: &[u8],
    ) -> bool {
        let Some((&opcode, payload)) = packet.split_first() else {
            tracing::debug!(group, peer, "dropping empty packet");
            return false;
        };

        let Some(handler) = self.handlers.get(&opcode) else {
            tracing::debug!(opcode, group, peer, "no handler for opcode");
            return false;
        };

        handler.borrow_mut().handle_packet(sub, group, peer, opcode, payload);
        true
    }
}
