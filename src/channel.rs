//! Classical and quantum channels.
//!
//! Both channel kinds connect exactly two nodes and share the same transport
//! model: optional bandwidth with a bounded send buffer, a Bernoulli drop per
//! send, and a sampled propagation delay. A send either schedules a receive
//! event at the far end or silently drops the payload.
//!
//! A quantum channel additionally applies the transfer error model to the
//! traveling qubit and, when the photon is lost, marks the in-flight pair as
//! decohered instead of delivering it; the stored half at the sender is left
//! to its scheduled decoherence.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::delay::DelayModel;
use crate::epr::Entanglement;
use crate::event::Event;
use crate::message::SignalingMsg;
use crate::network::NetEvent;
use crate::rng::SimRng;
use crate::simulator::Simulator;
use crate::time::Time;
use crate::{CChannelId, NodeId, QChannelId, Result, SimError};

/// A classical message in flight, addressed by final destination.
#[derive(Debug, Clone)]
pub struct ClassicPacket {
    pub msg: SignalingMsg,
    /// Originator; `None` for controller traffic.
    pub src: Option<NodeId>,
    /// Final addressee (not the next hop).
    pub dest: NodeId,
}

impl ClassicPacket {
    /// Serialized length in bytes, used for bandwidth modeling.
    #[must_use]
    pub fn len(&self) -> usize {
        serde_json::to_vec(&self.msg).map_or(0, |v| v.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport parameters shared by both channel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Bytes per second (classical) or qubits per second (quantum); 0 = unlimited.
    pub bandwidth: f64,
    pub delay: DelayModel,
    /// Bernoulli per-send drop probability.
    pub drop_rate: f64,
    /// Bound on queued payload (same unit as bandwidth); 0 = unlimited.
    pub max_buffer_size: f64,
    /// Fiber length in kilometers.
    pub length: f64,
    /// Passed to the transfer error model (quantum channels only).
    pub decoherence_rate: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            bandwidth: 0.0,
            delay: DelayModel::default(),
            drop_rate: 0.0,
            max_buffer_size: 0.0,
            length: 0.0,
            decoherence_rate: 0.0,
        }
    }
}

/// Transport state common to both channel kinds.
#[derive(Debug)]
struct ChannelCore {
    name: String,
    ends: (NodeId, NodeId),
    cfg: ChannelConfig,
    next_send_time: Time,
}

impl ChannelCore {
    fn new(name: String, ends: (NodeId, NodeId), cfg: ChannelConfig) -> Self {
        assert!((0.0..=1.0).contains(&cfg.drop_rate));
        Self {
            name,
            ends,
            cfg,
            next_send_time: Time::zero(),
        }
    }

    fn connects(&self, node: NodeId) -> bool {
        self.ends.0 == node || self.ends.1 == node
    }

    fn other_end(&self, node: NodeId) -> NodeId {
        if self.ends.0 == node {
            self.ends.1
        } else {
            self.ends.0
        }
    }

    /// Compute the receive time for a payload of `len` units, or `None` when
    /// the send is dropped (buffer overflow or random loss).
    fn transmit(&mut self, now: Time, len: f64, rng: &mut SimRng) -> Option<Time> {
        let send_time = if self.cfg.bandwidth > 0.0 {
            let send_time = self.next_send_time.max(now);
            if self.cfg.max_buffer_size > 0.0
                && send_time > now.add_sec(self.cfg.max_buffer_size / self.cfg.bandwidth)
            {
                debug!(channel = %self.name, "drop due to buffer overflow");
                return None;
            }
            self.next_send_time = send_time.add_sec(len / self.cfg.bandwidth);
            send_time
        } else {
            now
        };

        if self.cfg.drop_rate > 0.0 && rng.random() < self.cfg.drop_rate {
            debug!(channel = %self.name, "drop due to drop rate");
            return None;
        }

        Some(send_time.add_sec(self.cfg.delay.calculate(rng)))
    }
}

/// Channel for classical signaling between two nodes.
#[derive(Debug)]
pub struct ClassicChannel {
    pub(crate) id: CChannelId,
    core: ChannelCore,
}

impl ClassicChannel {
    #[must_use]
    pub fn new(id: CChannelId, name: String, ends: (NodeId, NodeId), cfg: ChannelConfig) -> Self {
        Self {
            id,
            core: ChannelCore::new(name, ends, cfg),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    #[must_use]
    pub fn ends(&self) -> (NodeId, NodeId) {
        self.core.ends
    }

    #[must_use]
    pub fn other_end(&self, node: NodeId) -> NodeId {
        self.core.other_end(node)
    }

    /// Reset the transmit clock to the simulation start.
    pub fn install(&mut self, ts: Time) {
        self.core.next_send_time = ts;
    }

    /// Send a packet toward `next_hop`, scheduling its receive event.
    ///
    /// `extra_delay` is added on top of the channel's own delay model.
    pub fn send(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        rng: &mut SimRng,
        packet: ClassicPacket,
        next_hop: NodeId,
        extra_delay: f64,
    ) -> Result<()> {
        if !self.core.connects(next_hop) {
            return Err(SimError::NextHopNotConnection(
                next_hop.to_string(),
                self.core.name.clone(),
            ));
        }

        let len = packet.len() as f64;
        if let Some(recv_time) = self.core.transmit(sim.tc(), len, rng) {
            sim.add_event(Event::new(
                recv_time.add_sec(extra_delay),
                NetEvent::RecvClassicPacket {
                    channel: self.id,
                    packet,
                    dest: next_hop,
                },
            ));
        }
        Ok(())
    }
}

/// Channel carrying halves of entangled pairs between two nodes.
#[derive(Debug)]
pub struct QuantumChannel {
    pub(crate) id: QChannelId,
    core: ChannelCore,
}

impl QuantumChannel {
    #[must_use]
    pub fn new(id: QChannelId, name: String, ends: (NodeId, NodeId), cfg: ChannelConfig) -> Self {
        Self {
            id,
            core: ChannelCore::new(name, ends, cfg),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    #[must_use]
    pub fn ends(&self) -> (NodeId, NodeId) {
        self.core.ends
    }

    #[must_use]
    pub fn other_end(&self, node: NodeId) -> NodeId {
        self.core.other_end(node)
    }

    #[must_use]
    pub fn length(&self) -> f64 {
        self.core.cfg.length
    }

    pub fn install(&mut self, ts: Time) {
        self.core.next_send_time = ts;
    }

    /// Send a qubit (one half of a pair) toward `next_hop`.
    ///
    /// A photon-dropped pair is marked decohered and never delivered; the
    /// receiver learns of the loss only through the sender half's scheduled
    /// decoherence.
    pub fn send(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        rng: &mut SimRng,
        mut pair: Entanglement,
        next_hop: NodeId,
    ) -> Result<()> {
        if !self.core.connects(next_hop) {
            return Err(SimError::NextHopNotConnection(
                next_hop.to_string(),
                self.core.name.clone(),
            ));
        }

        match self.core.transmit(sim.tc(), 1.0, rng) {
            Some(recv_time) => {
                pair.transfer_error_model(self.core.cfg.length, self.core.cfg.decoherence_rate);
                sim.add_event(Event::new(
                    recv_time,
                    NetEvent::RecvQubit {
                        channel: self.id,
                        pair: Box::new(pair),
                        dest: next_hop,
                    },
                ));
            }
            None => {
                pair.is_decohered = true;
                debug!(channel = %self.core.name, pair = %pair.name, "photon lost in fiber");
            }
        }
        Ok(())
    }
}
