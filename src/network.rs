//! The network container.
//!
//! [`Network`] owns every entity of a simulation: nodes (with their memories
//! and protocol state), quantum and classical channels, the optional
//! controller node, the routing algorithm, and the RNG handle. Wiring is by
//! arena index and never mutated after install.
//!
//! The container is also the event handler: [`NetEvent`] is the tagged union
//! of everything that can be scheduled, and dispatch fans out to the link
//! layer, the forwarder, the memory decoherence handler, or the timing-signal
//! machinery.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::channel::{ChannelConfig, ClassicChannel, ClassicPacket, QuantumChannel};
use crate::epr::Entanglement;
use crate::event::{Event, EventTag};
use crate::forwarder::{Forwarder, ForwarderConfig, ForwarderCounters};
use crate::link_layer::{LinkLayer, LinkLayerConfig};
use crate::memory::QuantumMemory;
use crate::node::QNode;
use crate::rng::SimRng;
use crate::simulator::{EventHandler, Simulator};
use crate::{CChannelId, NodeId, PathId, QChannelId, Result, SimError};

/// Network-wide application timing mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimingMode {
    /// Events flow freely; no phase gating.
    Async,
    /// Link-level slotted: a periodic signal every `t_slot` seconds clears
    /// all memories and restarts all active channels.
    LSync { t_slot: f64 },
    /// Phased: alternating external (generation) and internal (swapping)
    /// phases of the given durations in seconds.
    Sync { t_ext: f64, t_int: f64 },
}

/// Phase signals emitted by the timing machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// New slot begins (link-level slotted mode).
    ExternalStart,
    /// External phase begins: link layers may generate.
    External,
    /// Internal phase begins: forwarders may swap and deliver.
    Internal,
}

/// Add or remove an active generation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOp {
    Add,
    Remove,
}

/// Everything that can be scheduled in the event pool.
#[derive(Debug, Clone)]
pub enum NetEvent {
    /// A classical packet arrives at `dest` over `channel`.
    RecvClassicPacket {
        channel: CChannelId,
        packet: ClassicPacket,
        dest: NodeId,
    },
    /// Half of an entangled pair arrives at `dest` over `channel`.
    RecvQubit {
        channel: QChannelId,
        pair: Box<Entanglement>,
        dest: NodeId,
    },
    /// Forwarder instructs the link layer to start or stop generation toward
    /// a neighbor.
    ManageActiveChannels {
        node: NodeId,
        neighbor: NodeId,
        op: ChannelOp,
    },
    /// Link layer notifies the forwarder of a freshly entangled slot.
    QubitEntangled {
        node: NodeId,
        neighbor: NodeId,
        addr: usize,
    },
    /// Forwarder released a slot; the link layer may regenerate.
    QubitReleased { node: NodeId, addr: usize },
    /// A stored pair decohered; the link layer may regenerate.
    QubitDecohered { node: NodeId, addr: usize },
    /// Scheduled decoherence deadline of a stored pair.
    MemoryDecohere {
        node: NodeId,
        addr: usize,
        pair: String,
    },
    /// Staggered start of a reservation handshake.
    StartReservation {
        node: NodeId,
        neighbor: NodeId,
        channel: QChannelId,
        addr: usize,
        path_id: Option<PathId>,
    },
    /// Skip-ahead heralding: the first successful attempt fires.
    SuccessfulAttempt {
        node: NodeId,
        neighbor: NodeId,
        channel: QChannelId,
        addr: usize,
        attempts: u64,
        key: String,
    },
    /// Self-repeating phase signal.
    TimingSignal(SignalType),
}

/// Field-less discriminant of [`NetEvent`], used for monitor registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetEventKind {
    RecvClassicPacket,
    RecvQubit,
    ManageActiveChannels,
    QubitEntangled,
    QubitReleased,
    QubitDecohered,
    MemoryDecohere,
    StartReservation,
    SuccessfulAttempt,
    TimingSignal,
}

impl EventTag for NetEvent {
    type Tag = NetEventKind;

    fn tag(&self) -> NetEventKind {
        match self {
            NetEvent::RecvClassicPacket { .. } => NetEventKind::RecvClassicPacket,
            NetEvent::RecvQubit { .. } => NetEventKind::RecvQubit,
            NetEvent::ManageActiveChannels { .. } => NetEventKind::ManageActiveChannels,
            NetEvent::QubitEntangled { .. } => NetEventKind::QubitEntangled,
            NetEvent::QubitReleased { .. } => NetEventKind::QubitReleased,
            NetEvent::QubitDecohered { .. } => NetEventKind::QubitDecohered,
            NetEvent::MemoryDecohere { .. } => NetEventKind::MemoryDecohere,
            NetEvent::StartReservation { .. } => NetEventKind::StartReservation,
            NetEvent::SuccessfulAttempt { .. } => NetEventKind::SuccessfulAttempt,
            NetEvent::TimingSignal(_) => NetEventKind::TimingSignal,
        }
    }
}

/// Pluggable routing algorithm (consumed interface).
///
/// The first element of a query result is the best path; each element is
/// `(metric, next hop, full path)`.
pub trait RouteAlgorithm {
    fn build(&mut self, net: &Network);
    fn query(&self, net: &Network, src: NodeId, dst: NodeId) -> Vec<(f64, NodeId, Vec<NodeId>)>;
}

/// Network-wide construction parameters.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    pub timing: Option<TimingMode>,
    /// Seed for the simulation RNG; OS entropy when absent.
    pub seed: Option<u64>,
}

/// Per-node construction parameters.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub memory_capacity: usize,
    /// Memory decoherence rate per second; the coherence window is its inverse.
    pub memory_decoherence_rate: f64,
    pub link: LinkLayerConfig,
    pub forwarder: ForwarderConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 4,
            memory_decoherence_rate: 0.2,
            link: LinkLayerConfig::default(),
            forwarder: ForwarderConfig::default(),
        }
    }
}

/// Controller attachment parameters.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Classical channel parameters between the controller and every node.
    pub cchannel: ChannelConfig,
}

/// The network: nodes, channels, controller, routing, timing, and RNG.
pub struct Network {
    pub(crate) nodes: Vec<QNode>,
    node_by_name: BTreeMap<String, NodeId>,
    pub(crate) qchannels: Vec<QuantumChannel>,
    qchannel_by_ends: BTreeMap<(NodeId, NodeId), QChannelId>,
    pub(crate) cchannels: Vec<ClassicChannel>,
    cchannel_by_ends: BTreeMap<(NodeId, NodeId), CChannelId>,
    pub(crate) controller: Option<NodeId>,
    pub(crate) next_path_id: u64,
    pub(crate) next_req_id: u64,
    pub(crate) timing: TimingMode,
    pub(crate) rng: SimRng,
    route: Option<Box<dyn RouteAlgorithm>>,
}

impl Network {
    #[must_use]
    pub fn new(cfg: NetworkConfig) -> Self {
        Self {
            nodes: Vec::new(),
            node_by_name: BTreeMap::new(),
            qchannels: Vec::new(),
            qchannel_by_ends: BTreeMap::new(),
            cchannels: Vec::new(),
            cchannel_by_ends: BTreeMap::new(),
            controller: None,
            next_path_id: 0,
            next_req_id: 0,
            timing: cfg.timing.unwrap_or(TimingMode::Async),
            rng: cfg
                .seed
                .map_or_else(SimRng::from_entropy, SimRng::from_seed),
            route: None,
        }
    }

    /// Reseed the RNG. Only call between runs.
    pub fn reseed(&mut self, seed: u64) {
        self.rng.reseed(seed);
    }

    #[must_use]
    pub fn timing(&self) -> TimingMode {
        self.timing
    }

    /// Add a quantum node. Names must be unique.
    pub fn add_node(&mut self, name: &str, cfg: NodeConfig) -> NodeId {
        assert!(
            !self.node_by_name.contains_key(name),
            "duplicate node name {name}"
        );
        let id = NodeId(self.nodes.len());
        let memory = QuantumMemory::new(id, cfg.memory_capacity, cfg.memory_decoherence_rate);
        let node = QNode::new(
            id,
            name.to_string(),
            memory,
            LinkLayer::new(cfg.link),
            Forwarder::new(cfg.forwarder),
        );
        self.node_by_name.insert(name.to_string(), id);
        self.nodes.push(node);
        id
    }

    /// Attach the centralized controller and connect it to every existing
    /// node with a classical channel. Call after all `add_node` calls.
    pub fn add_controller(&mut self, name: &str, cfg: ControllerConfig) -> Result<NodeId> {
        if self.controller.is_some() {
            return Err(SimError::Configuration("controller already set".into()));
        }
        let peers: Vec<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        let ctrl = self.add_node(
            name,
            NodeConfig {
                memory_capacity: 0,
                ..NodeConfig::default()
            },
        );
        self.controller = Some(ctrl);
        for peer in peers {
            self.add_cchannel(ctrl, peer, cfg.cchannel)?;
        }
        Ok(ctrl)
    }

    #[must_use]
    pub fn controller(&self) -> Option<NodeId> {
        self.controller
    }

    /// Add a quantum channel between two nodes.
    pub fn add_qchannel(&mut self, a: NodeId, b: NodeId, cfg: ChannelConfig) -> Result<QChannelId> {
        if a == b {
            return Err(SimError::Configuration("channel endpoints must differ".into()));
        }
        let id = QChannelId(self.qchannels.len());
        let name = format!("q_{},{}", self.name_of(a), self.name_of(b));
        self.qchannels.push(QuantumChannel::new(id, name, (a, b), cfg));
        self.qchannel_by_ends.insert(ordered(a, b), id);
        self.nodes[a.0].qchannels.push(id);
        self.nodes[b.0].qchannels.push(id);
        Ok(id)
    }

    /// Add a classical channel between two nodes.
    pub fn add_cchannel(&mut self, a: NodeId, b: NodeId, cfg: ChannelConfig) -> Result<CChannelId> {
        if a == b {
            return Err(SimError::Configuration("channel endpoints must differ".into()));
        }
        let id = CChannelId(self.cchannels.len());
        let name = format!("c_{},{}", self.name_of(a), self.name_of(b));
        self.cchannels.push(ClassicChannel::new(id, name, (a, b), cfg));
        self.cchannel_by_ends.insert(ordered(a, b), id);
        self.nodes[a.0].cchannels.push(id);
        self.nodes[b.0].cchannels.push(id);
        Ok(id)
    }

    /// Assign `capacity` memory slots to each end of every quantum channel.
    pub fn assign_memory_qubits(&mut self, capacity: usize) {
        let assignments: Vec<(NodeId, QChannelId)> = self
            .qchannels
            .iter()
            .flat_map(|ch| {
                let (a, b) = ch.ends();
                [(a, ch.id), (b, ch.id)]
            })
            .collect();
        for (node, ch) in assignments {
            for _ in 0..capacity {
                if self.nodes[node.0].memory.assign(ch).is_none() {
                    panic!(
                        "memory of {} has no free slot to assign to {}",
                        self.name_of(node),
                        self.qchannels[ch.0].name()
                    );
                }
            }
        }
    }

    /// Inject a routing algorithm.
    pub fn set_route_algorithm(&mut self, route: Box<dyn RouteAlgorithm>) {
        self.route = Some(route);
    }

    /// Build the routing tables with the injected algorithm.
    pub fn build_route(&mut self) -> Result<()> {
        let mut route = self.route.take().ok_or(SimError::NoRouteAlgorithm)?;
        route.build(self);
        self.route = Some(route);
        Ok(())
    }

    /// Query routes, best first.
    pub fn query_route(&self, src: NodeId, dst: NodeId) -> Result<Vec<(f64, NodeId, Vec<NodeId>)>> {
        let route = self.route.as_ref().ok_or(SimError::NoRouteAlgorithm)?;
        Ok(route.query(self, src, dst))
    }

    /// Prepare the network for a run: reset channel clocks, validate channel
    /// lengths against coherence windows, and arm the timing machinery.
    pub fn install(&mut self, sim: &mut Simulator<NetEvent>) -> Result<()> {
        let ts = sim.ts();
        for ch in &mut self.cchannels {
            ch.install(ts);
        }
        for ch in &mut self.qchannels {
            ch.install(ts);
        }

        self.check_coherence_windows()?;

        match self.timing {
            TimingMode::Async => {}
            TimingMode::LSync { t_slot } => {
                assert!(t_slot > 0.0, "LSYNC requires a positive slot duration");
                sim.add_event(Event::new(ts, NetEvent::TimingSignal(SignalType::ExternalStart)));
            }
            TimingMode::Sync { t_ext, t_int } => {
                assert!(
                    t_ext > 0.0 && t_int > 0.0,
                    "SYNC requires positive phase durations"
                );
                sim.add_event(Event::new(ts, NetEvent::TimingSignal(SignalType::External)));
            }
        }

        info!(
            nodes = self.nodes.len(),
            qchannels = self.qchannels.len(),
            cchannels = self.cchannels.len(),
            "network installed"
        );
        Ok(())
    }

    /// A channel must be short enough that an elementary pair can be produced
    /// inside the coherence window of the memories at both ends.
    fn check_coherence_windows(&self) -> Result<()> {
        for ch in &self.qchannels {
            let (a, b) = ch.ends();
            for end in [a, b] {
                let node = &self.nodes[end.0];
                if node.memory.channel_slots(ch.id).next().is_none() {
                    continue;
                }
                let rate = node.memory.decoherence_rate();
                if rate <= 0.0 {
                    continue;
                }
                let t_mem = 1.0 / rate;
                if ch.length() >= 2.0 * node.link.cfg.light_speed_kms * t_mem {
                    return Err(SimError::ChannelTooLong(ch.name().to_string()));
                }
            }
        }
        Ok(())
    }

    // --- lookups -----------------------------------------------------------

    /// Node id by name.
    pub fn node_id(&self, name: &str) -> Result<NodeId> {
        self.node_by_name
            .get(name)
            .copied()
            .ok_or_else(|| SimError::NodeNotFound(name.to_string()))
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &QNode {
        &self.nodes[id.0]
    }

    /// Node name by id.
    #[must_use]
    pub fn name_of(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    #[must_use]
    pub fn qchannel(&self, id: QChannelId) -> &QuantumChannel {
        &self.qchannels[id.0]
    }

    /// Quantum channel between two nodes, if any.
    #[must_use]
    pub fn qchannel_between(&self, a: NodeId, b: NodeId) -> Option<QChannelId> {
        self.qchannel_by_ends.get(&ordered(a, b)).copied()
    }

    /// Classical channel between two nodes, if any.
    #[must_use]
    pub fn cchannel_between(&self, a: NodeId, b: NodeId) -> Option<CChannelId> {
        self.cchannel_by_ends.get(&ordered(a, b)).copied()
    }

    /// Forwarder counters of a node, the observable surface for tests.
    pub fn counters(&self, name: &str) -> Result<&ForwarderCounters> {
        Ok(&self.node(self.node_id(name)?).fw.cnt)
    }

    /// Elementary pairs generated by a node's link layer.
    pub fn etg_count(&self, name: &str) -> Result<u64> {
        Ok(self.node(self.node_id(name)?).link.etg_count)
    }

    // --- send helpers ------------------------------------------------------

    pub(crate) fn send_classic(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        channel: CChannelId,
        packet: ClassicPacket,
        next_hop: NodeId,
    ) {
        if let Err(err) = self.cchannels[channel.0].send(sim, &mut self.rng, packet, next_hop, 0.0) {
            panic!("classical send failed: {err}");
        }
    }

    pub(crate) fn send_qubit(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        channel: QChannelId,
        pair: Entanglement,
        next_hop: NodeId,
    ) {
        if let Err(err) = self.qchannels[channel.0].send(sim, &mut self.rng, pair, next_hop) {
            panic!("quantum send failed: {err}");
        }
    }

    // --- memory decoherence ------------------------------------------------

    /// A scheduled decoherence deadline fired. If the pair is still stored,
    /// free the slot and tell the link layer so generation can restart.
    fn memory_decohere_fired(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        addr: usize,
        pair_name: &str,
    ) {
        let now = sim.tc();
        let Some((_, mut pair)) = self.nodes[node.0].memory.read(pair_name.into(), true, now)
        else {
            // consumed or replaced before the deadline; nothing to do
            return;
        };
        pair.is_decohered = true;
        debug!(node = %self.nodes[node.0].name, pair = %pair.name, "stored pair decohered");
        self.nodes[node.0].memory.qubit_mut(addr).to_release();
        sim.add_event(Event::new(now, NetEvent::QubitDecohered { node, addr }));
    }

    // --- timing ------------------------------------------------------------

    fn timing_signal(&mut self, sim: &mut Simulator<NetEvent>, signal: SignalType) {
        match (self.timing, signal) {
            (TimingMode::LSync { t_slot }, SignalType::ExternalStart) => {
                sim.add_event(Event::new(
                    sim.tc().add_sec(t_slot),
                    NetEvent::TimingSignal(SignalType::ExternalStart),
                ));
            }
            (TimingMode::Sync { t_ext, .. }, SignalType::External) => {
                sim.add_event(Event::new(
                    sim.tc().add_sec(t_ext),
                    NetEvent::TimingSignal(SignalType::Internal),
                ));
            }
            (TimingMode::Sync { t_int, .. }, SignalType::Internal) => {
                sim.add_event(Event::new(
                    sim.tc().add_sec(t_int),
                    NetEvent::TimingSignal(SignalType::External),
                ));
            }
            _ => {}
        }

        debug!(?signal, "timing signal");
        let ids: Vec<NodeId> = self
            .nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| Some(*id) != self.controller)
            .collect();
        for id in ids {
            self.fw_handle_sync_signal(sim, id, signal);
            self.ll_handle_sync_signal(sim, id, signal);
        }
    }
}

impl EventHandler<NetEvent> for Network {
    fn handle(&mut self, sim: &mut Simulator<NetEvent>, event: Event<NetEvent>) {
        match event.into_payload() {
            NetEvent::RecvClassicPacket {
                channel,
                packet,
                dest,
            } => match &packet.msg {
                crate::message::SignalingMsg::ReserveQubit { .. }
                | crate::message::SignalingMsg::ReserveQubitOk { .. } => {
                    self.ll_handle_reservation(sim, dest, channel, &packet.msg);
                }
                crate::message::SignalingMsg::InstallPath { .. } => {
                    self.fw_handle_install_path(sim, dest, &packet);
                }
                _ => self.fw_handle_signaling(sim, dest, packet),
            },
            NetEvent::RecvQubit { channel, pair, dest } => {
                self.ll_receive_qubit(sim, dest, channel, *pair);
            }
            NetEvent::ManageActiveChannels { node, neighbor, op } => {
                self.ll_manage_active_channels(sim, node, neighbor, op);
            }
            NetEvent::QubitEntangled {
                node,
                neighbor,
                addr,
            } => {
                self.fw_qubit_is_entangled(sim, node, neighbor, addr);
            }
            NetEvent::QubitReleased { node, addr } => {
                self.ll_on_qubit_released(sim, node, addr);
            }
            NetEvent::QubitDecohered { node, addr } => {
                self.ll_on_qubit_decohered(sim, node, addr);
            }
            NetEvent::MemoryDecohere { node, addr, pair } => {
                self.memory_decohere_fired(sim, node, addr, &pair);
            }
            NetEvent::StartReservation {
                node,
                neighbor,
                channel,
                addr,
                path_id,
            } => {
                self.ll_start_reservation(sim, node, neighbor, channel, addr, path_id);
            }
            NetEvent::SuccessfulAttempt {
                node,
                neighbor,
                channel,
                addr,
                attempts,
                key,
            } => {
                self.ll_do_successful_attempt(sim, node, neighbor, channel, addr, attempts, &key);
            }
            NetEvent::TimingSignal(signal) => self.timing_signal(sim, signal),
        }
    }
}

fn ordered(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> Network {
        let mut net = Network::new(NetworkConfig {
            seed: Some(1),
            ..Default::default()
        });
        let n1 = net.add_node("n1", NodeConfig::default());
        let n2 = net.add_node("n2", NodeConfig::default());
        let n3 = net.add_node("n3", NodeConfig::default());
        net.add_qchannel(n1, n2, ChannelConfig::default()).unwrap();
        net.add_qchannel(n2, n3, ChannelConfig::default()).unwrap();
        net.add_cchannel(n1, n2, ChannelConfig::default()).unwrap();
        net.add_cchannel(n2, n3, ChannelConfig::default()).unwrap();
        net
    }

    #[test]
    fn wiring_lookups() {
        let net = three_nodes();
        let n1 = net.node_id("n1").unwrap();
        let n2 = net.node_id("n2").unwrap();
        let n3 = net.node_id("n3").unwrap();

        assert!(net.qchannel_between(n1, n2).is_some());
        assert_eq!(net.qchannel_between(n1, n2), net.qchannel_between(n2, n1));
        assert!(net.qchannel_between(n1, n3).is_none());
        assert!(net.cchannel_between(n2, n3).is_some());
        assert!(net.node_id("nx").is_err());
    }

    #[test]
    fn memory_qubit_assignment() {
        let mut net = three_nodes();
        net.assign_memory_qubits(2);
        let n2 = net.node_id("n2").unwrap();
        let q12 = net.qchannel_between(net.node_id("n1").unwrap(), n2).unwrap();
        let assigned = net.node(n2).memory.channel_slots(q12).count();
        assert_eq!(assigned, 2);
    }

    #[test]
    fn controller_connects_to_every_node() {
        let mut net = three_nodes();
        let ctrl = net.add_controller("ctrl", ControllerConfig::default()).unwrap();
        for name in ["n1", "n2", "n3"] {
            let id = net.node_id(name).unwrap();
            assert!(net.cchannel_between(ctrl, id).is_some());
        }
        assert!(net.add_controller("ctrl2", ControllerConfig::default()).is_err());
    }

    #[test]
    fn too_long_channel_is_a_configuration_error() {
        let mut net = Network::new(NetworkConfig {
            seed: Some(1),
            ..Default::default()
        });
        let a = net.add_node("a", NodeConfig::default());
        let b = net.add_node("b", NodeConfig::default());
        // coherence window 5 s at light speed 2e5 km/s allows < 2e6 km
        net.add_qchannel(
            a,
            b,
            ChannelConfig {
                length: 2.5e6,
                ..Default::default()
            },
        )
        .unwrap();
        net.assign_memory_qubits(1);

        let mut sim = Simulator::with_accuracy(0.0, 1.0, 1_000_000);
        let err = net.install(&mut sim).unwrap_err();
        assert!(matches!(err, SimError::ChannelTooLong(_)));
    }
}
