//! Quantum nodes.
//!
//! A node owns its quantum memory and the per-node state of the two protocol
//! applications: the link layer and the proactive forwarder. Channel wiring
//! lives in the network arena; nodes reference channels by id.

use crate::forwarder::Forwarder;
use crate::link_layer::LinkLayer;
use crate::memory::QuantumMemory;
use crate::{CChannelId, NodeId, QChannelId};

/// A quantum node: memory plus protocol state.
#[derive(Debug)]
pub struct QNode {
    pub id: NodeId,
    pub name: String,
    pub memory: QuantumMemory,
    pub link: LinkLayer,
    pub fw: Forwarder,
    pub(crate) qchannels: Vec<QChannelId>,
    pub(crate) cchannels: Vec<CChannelId>,
}

impl QNode {
    #[must_use]
    pub fn new(
        id: NodeId,
        name: String,
        memory: QuantumMemory,
        link: LinkLayer,
        fw: Forwarder,
    ) -> Self {
        Self {
            id,
            name,
            memory,
            link,
            fw,
            qchannels: Vec::new(),
            cchannels: Vec::new(),
        }
    }

    /// Quantum channels attached to this node.
    #[must_use]
    pub fn qchannels(&self) -> &[QChannelId] {
        &self.qchannels
    }

    /// Classical channels attached to this node.
    #[must_use]
    pub fn cchannels(&self) -> &[CChannelId] {
        &self.cchannels
    }
}
