//! Link layer: elementary entanglement generation over one quantum channel.
//!
//! Generation is driven per memory slot. The primary side (the node that
//! activated the channel) reserves a local slot, asks the neighbor to reserve
//! a matching one (`RESERVE_QUBIT` / `RESERVE_QUBIT_OK`), then samples the
//! heralding process with geometric skip-ahead: instead of materializing
//! every failed attempt, the number of attempts until the first success is
//! drawn at once and a single event fires at the success time.
//!
//! A single attempt succeeds with probability
//! `p = 1/2 * eta_s^2 * eta_d^2 * 10^(-alpha * L / 10)`, and the success
//! lands at `(K - 1) * max(5.5 * tau, reset_time) + 4 * tau` after the
//! reservation completes, with `tau = L / c` the one-way fiber delay.
//!
//! On success the primary writes its half (creation clock backdated by
//! `4 * tau`), ships the far half over the fiber, and notifies its forwarder
//! one `tau` later. Released or decohered slots restart the cycle: the
//! primary re-reserves, the secondary clears its reservation and serves the
//! FIFO of deferred requests.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::epr::Entanglement;
use crate::event::Event;
use crate::memory::WriteFilter;
use crate::message::SignalingMsg;
use crate::network::{ChannelOp, NetEvent, Network, SignalType, TimingMode};
use crate::simulator::Simulator;
use crate::{CChannelId, NodeId, PathId, QChannelId};

/// Hardware parameters of a node's entanglement generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkLayerConfig {
    /// Maximum reservation starts per second (staggering of slot startup).
    pub attempt_rate: f64,
    /// Fiber loss in dB/km.
    pub alpha_db_per_km: f64,
    /// Detector efficiency in `[0, 1]`.
    pub eta_d: f64,
    /// Source efficiency in `[0, 1]`.
    pub eta_s: f64,
    /// Entanglement source frequency in Hz; its inverse is the reset time.
    pub frequency: f64,
    /// Fidelity of freshly generated pairs.
    pub init_fidelity: f64,
    /// Speed of light in fiber, km/s.
    pub light_speed_kms: f64,
}

impl Default for LinkLayerConfig {
    fn default() -> Self {
        Self {
            attempt_rate: 1e6,
            alpha_db_per_km: 0.2,
            eta_d: 1.0,
            eta_s: 1.0,
            frequency: 80e6,
            init_fidelity: 0.99,
            light_speed_kms: 2e5,
        }
    }
}

/// Per-node link-layer state.
#[derive(Debug)]
pub struct LinkLayer {
    pub cfg: LinkLayerConfig,
    /// Channels this node is the generation primary for, and the neighbor.
    pub(crate) active_channels: BTreeMap<QChannelId, NodeId>,
    /// Reservations initiated by this node, keyed by reservation key.
    pub(crate) pending_init_reservation: BTreeMap<String, (QChannelId, NodeId, usize)>,
    /// Received reservation requests waiting for a free slot.
    pub(crate) fifo_reservation_req: VecDeque<(String, Option<PathId>, CChannelId, NodeId)>,
    /// Elementary pairs generated (primary side).
    pub etg_count: u64,
    /// Stored pairs that decohered before being used.
    pub decoh_count: u64,
    pub(crate) sync_current_phase: SignalType,
}

impl LinkLayer {
    #[must_use]
    pub fn new(cfg: LinkLayerConfig) -> Self {
        Self {
            cfg,
            active_channels: BTreeMap::new(),
            pending_init_reservation: BTreeMap::new(),
            fifo_reservation_req: VecDeque::new(),
            etg_count: 0,
            decoh_count: 0,
            sync_current_phase: SignalType::External,
        }
    }

    /// Success probability of one heralded attempt over `length` km of fiber.
    #[must_use]
    pub fn success_prob(&self, length: f64) -> f64 {
        let p_bsa = 0.5;
        let p_fiber = 10f64.powf(-self.cfg.alpha_db_per_km * length / 10.0);
        p_bsa * self.cfg.eta_s.powi(2) * self.cfg.eta_d.powi(2) * p_fiber
    }
}

impl Network {
    /// Forwarder request to start or stop generating pairs toward a neighbor.
    pub(crate) fn ll_manage_active_channels(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        neighbor: NodeId,
        op: ChannelOp,
    ) {
        let qch = self
            .qchannel_between(node, neighbor)
            .unwrap_or_else(|| {
                panic!(
                    "no quantum channel between {} and {}",
                    self.name_of(node),
                    self.name_of(neighbor)
                )
            });

        match op {
            ChannelOp::Add => {
                if self.nodes[node.0].link.active_channels.contains_key(&qch) {
                    // several paths may share the hop; generation is already running
                    debug!(node = %self.nodes[node.0].name, "channel already active");
                    return;
                }
                self.nodes[node.0].link.active_channels.insert(qch, neighbor);
                match self.timing {
                    TimingMode::Async => self.ll_handle_active_channel(sim, node, qch, neighbor),
                    TimingMode::LSync { .. } | TimingMode::Sync { .. } => {
                        // generation starts at the next slot / external phase
                    }
                }
            }
            ChannelOp::Remove => {
                self.nodes[node.0].link.active_channels.remove(&qch);
            }
        }
    }

    /// Kick off reservations for every free slot assigned to the channel,
    /// staggered by the attempt rate.
    pub(crate) fn ll_handle_active_channel(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        qch: QChannelId,
        neighbor: NodeId,
    ) {
        let attempt_rate = self.nodes[node.0].link.cfg.attempt_rate;
        let free: Vec<(usize, Option<PathId>)> = self.nodes[node.0]
            .memory
            .channel_slots(qch)
            .filter(|(q, pair)| pair.is_none() && q.active.is_none())
            .map(|(q, _)| (q.addr, q.path_id))
            .collect();
        debug!(
            node = %self.nodes[node.0].name,
            channel = %self.qchannels[qch.0].name(),
            slots = free.len(),
            "activating channel"
        );

        for (i, (addr, path_id)) in free.into_iter().enumerate() {
            let t = sim.tc().add_sec(i as f64 / attempt_rate);
            sim.add_event(Event::new(
                t,
                NetEvent::StartReservation {
                    node,
                    neighbor,
                    channel: qch,
                    addr,
                    path_id,
                },
            ));
        }
    }

    /// Primary side: reserve a local slot and ask the neighbor for a match.
    pub(crate) fn ll_start_reservation(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        neighbor: NodeId,
        qch: QChannelId,
        addr: usize,
        path_id: Option<PathId>,
    ) {
        let mut key = format!("{}_{}", self.name_of(node), self.name_of(neighbor));
        if let Some(p) = path_id {
            key = format!("{key}_{p}");
        }
        key = format!("{key}_{addr}");

        assert!(
            !self.nodes[node.0]
                .link
                .pending_init_reservation
                .contains_key(&key),
            "reservation already started for {key}"
        );
        debug!(node = %self.nodes[node.0].name, key, "start reservation");
        self.nodes[node.0]
            .link
            .pending_init_reservation
            .insert(key.clone(), (qch, neighbor, addr));
        self.nodes[node.0].memory.qubit_mut(addr).active = Some(key.clone());

        let cch = self
            .cchannel_between(node, neighbor)
            .unwrap_or_else(|| {
                panic!(
                    "no classical channel between {} and {}",
                    self.name_of(node),
                    self.name_of(neighbor)
                )
            });
        let packet = crate::channel::ClassicPacket {
            msg: SignalingMsg::ReserveQubit { path_id, key },
            src: Some(node),
            dest: neighbor,
        };
        self.send_classic(sim, cch, packet, neighbor);
    }

    /// Handle `RESERVE_QUBIT` / `RESERVE_QUBIT_OK` control messages.
    pub(crate) fn ll_handle_reservation(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        cch: CChannelId,
        msg: &SignalingMsg,
    ) {
        let from = self.cchannels[cch.0].other_end(node);
        let qch = self
            .qchannel_between(node, from)
            .unwrap_or_else(|| {
                panic!(
                    "no quantum channel between {} and {}",
                    self.name_of(node),
                    self.name_of(from)
                )
            });

        match msg {
            SignalingMsg::ReserveQubit { path_id, key } => {
                debug!(node = %self.nodes[node.0].name, key, "received RESERVE_QUBIT");
                match self.nodes[node.0].memory.search_available(Some(qch), *path_id) {
                    Some(addr) => {
                        self.nodes[node.0].memory.qubit_mut(addr).active = Some(key.clone());
                        let packet = crate::channel::ClassicPacket {
                            msg: SignalingMsg::ReserveQubitOk {
                                path_id: *path_id,
                                key: key.clone(),
                            },
                            src: Some(node),
                            dest: from,
                        };
                        self.send_classic(sim, cch, packet, from);
                    }
                    None => {
                        debug!(node = %self.nodes[node.0].name, key, "no slot available, queueing");
                        self.nodes[node.0]
                            .link
                            .fifo_reservation_req
                            .push_back((key.clone(), *path_id, cch, from));
                    }
                }
            }
            SignalingMsg::ReserveQubitOk { key, .. } => {
                debug!(node = %self.nodes[node.0].name, key, "received RESERVE_QUBIT_OK");
                let Some((qch, next_hop, addr)) = self.nodes[node.0]
                    .link
                    .pending_init_reservation
                    .remove(key)
                else {
                    // confirmation crossed a phase reset
                    debug!(node = %self.nodes[node.0].name, key, "no pending reservation");
                    return;
                };
                self.ll_generate_entanglement(sim, node, next_hop, qch, addr, key.clone());
            }
            _ => unreachable!("not a reservation message"),
        }
    }

    /// Schedule the single successful attempt using skip-ahead sampling.
    fn ll_generate_entanglement(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        neighbor: NodeId,
        qch: QChannelId,
        addr: usize,
        key: String,
    ) {
        assert!(
            self.nodes[node.0].link.active_channels.contains_key(&qch),
            "generation on inactive channel"
        );

        let length = self.qchannels[qch.0].length();
        let link = &self.nodes[node.0].link;
        let p = link.success_prob(length);
        let tau = length / link.cfg.light_speed_kms;
        let reset_time = 1.0 / link.cfg.frequency;

        let attempts = self.rng.geometric(p);
        let attempt_duration = (5.5 * tau).max(reset_time);
        let t_succ = (attempts - 1) as f64 * attempt_duration + 4.0 * tau;

        sim.add_event(Event::new(
            sim.tc().add_sec(t_succ),
            NetEvent::SuccessfulAttempt {
                node,
                neighbor,
                channel: qch,
                addr,
                attempts,
                key,
            },
        ));
    }

    /// The sampled attempt succeeded: create the pair, store the local half,
    /// ship the far half, and notify the forwarder one fiber delay later.
    pub(crate) fn ll_do_successful_attempt(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        neighbor: NodeId,
        qch: QChannelId,
        addr: usize,
        attempts: u64,
        key: &str,
    ) {
        let tau = self.qchannels[qch.0].length() / self.nodes[node.0].link.cfg.light_speed_kms;
        let init_fidelity = self.nodes[node.0].link.cfg.init_fidelity;

        let name = self.rng.uuid().simple().to_string();
        let mut pair = Entanglement::new(name, init_fidelity);
        // the pair came into being when the photons were emitted, 4 tau ago
        pair.creation_time = Some(sim.tc() - sim.time(4.0 * tau));
        pair.src = Some(node);
        pair.dst = Some(neighbor);
        pair.attempts = attempts;
        pair.key = Some(key.to_string());
        pair.path_id = self.nodes[node.0].memory.qubit(addr).path_id;

        let filter = WriteFilter {
            address: Some(addr),
            delay: 4.0 * tau,
            ..Default::default()
        };
        let stored = self.nodes[node.0].memory.write(sim, &mut pair, filter);
        assert!(stored.is_some(), "primary memory slot vanished for {key}");

        debug!(
            node = %self.nodes[node.0].name,
            pair = %pair.name,
            attempts,
            "elementary pair generated"
        );
        self.nodes[node.0].link.etg_count += 1;
        self.send_qubit(sim, qch, pair, neighbor);

        self.nodes[node.0].memory.qubit_mut(addr).to_entangled();
        sim.add_event(Event::new(
            sim.tc().add_sec(tau),
            NetEvent::QubitEntangled {
                node,
                neighbor,
                addr,
            },
        ));
    }

    /// Secondary side: store the received half and notify the forwarder.
    pub(crate) fn ll_receive_qubit(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        qch: QChannelId,
        mut pair: Entanglement,
    ) {
        if matches!(self.timing, TimingMode::Sync { .. })
            && self.nodes[node.0].link.sync_current_phase != SignalType::External
        {
            debug!(node = %self.nodes[node.0].name, "external phase over, dropping arrival");
            return;
        }

        let from = self.qchannels[qch.0].other_end(node);
        debug!(
            node = %self.nodes[node.0].name,
            pair = %pair.name,
            "received half pair"
        );

        if pair
            .decoherence_time
            .is_some_and(|deadline| deadline <= sim.tc())
        {
            debug!(node = %self.nodes[node.0].name, pair = %pair.name, "arrived already decohered");
            return;
        }

        let key_owned = pair.key.clone();
        let filter = WriteFilter {
            path_id: pair.path_id,
            key: key_owned.as_deref(),
            ..Default::default()
        };
        let stored = self.nodes[node.0].memory.write(sim, &mut pair, filter);
        let Some(addr) = stored else {
            panic!(
                "{}: failed to store received pair {}",
                self.name_of(node),
                pair.name
            );
        };

        self.nodes[node.0].memory.qubit_mut(addr).to_entangled();
        sim.add_event(Event::new(
            sim.tc(),
            NetEvent::QubitEntangled {
                node,
                neighbor: from,
                addr,
            },
        ));
    }

    /// A stored pair decohered before use.
    pub(crate) fn ll_on_qubit_decohered(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        addr: usize,
    ) {
        self.nodes[node.0].link.decoh_count += 1;
        self.ll_restart_slot(sim, node, addr, true);
    }

    /// The forwarder released a slot; regenerate when we are the primary.
    pub(crate) fn ll_on_qubit_released(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        addr: usize,
    ) {
        self.ll_restart_slot(sim, node, addr, false);
    }

    fn ll_restart_slot(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        addr: usize,
        decohered: bool,
    ) {
        let qubit = self.nodes[node.0].memory.qubit(addr);
        let Some(qch) = qubit.qchannel else {
            debug!(node = %self.nodes[node.0].name, addr, "released slot has no channel");
            return;
        };
        let path_id = qubit.path_id;

        match self.nodes[node.0].link.active_channels.get(&qch).copied() {
            Some(neighbor) => {
                // this node is the generation primary for the slot's channel
                match self.timing {
                    TimingMode::Async => {
                        self.ll_start_reservation(sim, node, neighbor, qch, addr, path_id);
                    }
                    TimingMode::LSync { .. } | TimingMode::Sync { .. } => {
                        assert!(
                            !decohered,
                            "{}: coherence window shorter than the phase length",
                            self.name_of(node)
                        );
                        // regeneration happens at the next phase start
                    }
                }
            }
            None => {
                self.nodes[node.0].memory.qubit_mut(addr).active = None;
                self.ll_check_reservation_req(sim, node);
            }
        }
    }

    /// Serve the oldest deferred reservation request, if a slot freed up.
    fn ll_check_reservation_req(&mut self, sim: &mut Simulator<NetEvent>, node: NodeId) {
        let Some((key, path_id, cch, from)) =
            self.nodes[node.0].link.fifo_reservation_req.front().cloned()
        else {
            return;
        };
        let qch = self.qchannel_between(node, from);
        let Some(addr) = self.nodes[node.0].memory.search_available(qch, path_id) else {
            return;
        };
        debug!(node = %self.nodes[node.0].name, key, "serving deferred reservation");
        self.nodes[node.0].memory.qubit_mut(addr).active = Some(key.clone());
        self.nodes[node.0].link.fifo_reservation_req.pop_front();
        let packet = crate::channel::ClassicPacket {
            msg: SignalingMsg::ReserveQubitOk { path_id, key },
            src: Some(node),
            dest: from,
        };
        self.send_classic(sim, cch, packet, from);
    }

    /// Phase handling for the slotted and phased timing modes.
    pub(crate) fn ll_handle_sync_signal(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        signal: SignalType,
    ) {
        match (self.timing, signal) {
            (TimingMode::LSync { .. }, SignalType::ExternalStart)
            | (TimingMode::Sync { .. }, SignalType::External) => {
                self.nodes[node.0].link.sync_current_phase = SignalType::External;
                self.ll_phase_reset(sim, node);
            }
            (TimingMode::Sync { .. }, sig) => {
                self.nodes[node.0].link.sync_current_phase = sig;
            }
            _ => {}
        }
    }

    /// Clear all slots and in-flight reservation state, then restart every
    /// active channel from scratch.
    fn ll_phase_reset(&mut self, sim: &mut Simulator<NetEvent>, node: NodeId) {
        let n = &mut self.nodes[node.0];
        n.memory.clear();
        for addr in 0..n.memory.capacity() {
            n.memory.qubit_mut(addr).active = None;
        }
        n.link.pending_init_reservation.clear();
        n.link.fifo_reservation_req.clear();

        let channels: Vec<(QChannelId, NodeId)> = n
            .link
            .active_channels
            .iter()
            .map(|(ch, nb)| (*ch, *nb))
            .collect();
        for (qch, neighbor) in channels {
            self.ll_handle_active_channel(sim, node, qch, neighbor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_probability_follows_fiber_loss() {
        let link = LinkLayer::new(LinkLayerConfig::default());
        // 0.2 dB/km over 100 km gives 20 dB, i.e. 1% transmission
        let p = link.success_prob(100.0);
        assert!((p - 0.005).abs() < 1e-9);

        let lossless = LinkLayer::new(LinkLayerConfig {
            alpha_db_per_km: 0.0,
            ..Default::default()
        });
        assert!((lossless.success_prob(100.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn skip_ahead_time_formula() {
        // with alpha = 0 the success time for K attempts over 100 km is
        // (K-1) * 5.5 tau + 4 tau with tau = 0.5 ms
        let cfg = LinkLayerConfig {
            alpha_db_per_km: 0.0,
            ..Default::default()
        };
        let tau: f64 = 100.0 / cfg.light_speed_kms;
        let reset = 1.0 / cfg.frequency;
        let attempt_duration = (5.5 * tau).max(reset);
        assert!((attempt_duration - 0.00275).abs() < 1e-9);
        let t_succ_k3 = 2.0 * attempt_duration + 4.0 * tau;
        assert!((t_succ_k3 - 0.0075).abs() < 1e-9);
    }
}
