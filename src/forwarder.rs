//! The proactive forwarder: per-node entanglement forwarding state machine.
//!
//! The forwarder receives routing instructions from the controller, populates
//! its FIB, and drives memory qubits through the lifecycle
//! `ENTANGLED -> PURIF -> PENDING -> ELIGIBLE -> RELEASE`:
//!
//! - A freshly entangled qubit enters purification. The segment primary (the
//!   endpoint with the lower `(rank, route index)`) picks an auxiliary pair
//!   of equal round count and solicits its partner with `PURIF_SOLICIT`; the
//!   partner measures, answers `PURIF_RESPONSE`, and both sides either keep
//!   an improved pair or release.
//! - Once the required rounds are done the qubit becomes eligible. Endpoints
//!   consume eligible end-to-end pairs; interior nodes look for a swap
//!   candidate in the opposite path direction and perform entanglement
//!   swapping, notifying both partners with `SWAP_UPDATE`.
//! - Two adjacent nodes of equal rank may swap the same pair concurrently.
//!   The bookkeeping for this parallel case is reconciled on `SWAP_UPDATE`
//!   receipt: the local record of the already-performed swap is merged with
//!   the remote one and the far destination is informed with a further
//!   `SWAP_UPDATE`.
//!
//! Failure semantics are one-shot: decohered pairs, failed swaps, and failed
//! purification rounds release local state, and the link layer regenerates
//! elementary pairs. No protocol-level retries exist.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::ClassicPacket;
use crate::epr::Entanglement;
use crate::event::Event;
use crate::fib::Fib;
use crate::memory::{MemKey, QubitState};
use crate::message::{
    validate_path_instructions, PurifMsg, PurifResponseMsg, SignalingMsg, SwapUpdateMsg,
};
use crate::mux::MuxKind;
use crate::network::{ChannelOp, NetEvent, Network, SignalType, TimingMode};
use crate::simulator::Simulator;
use crate::{NodeId, PathId, QChannelId};

/// Forwarder parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Probability that an entanglement swap succeeds.
    pub ps: f64,
    /// Path multiplexing scheme.
    pub mux: MuxKind,
    /// Whether qubits of different paths serving the same request may swap
    /// with each other.
    pub isolate_paths: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            ps: 1.0,
            mux: MuxKind::BufferSpace,
            isolate_paths: true,
        }
    }
}

/// Observable counters of one forwarder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwarderCounters {
    /// Elementary entanglements received from the link layer.
    pub n_entg: u64,
    /// Entanglements that completed the i-th purification round.
    pub n_purif: Vec<u64>,
    /// Entanglements that completed all purification rounds.
    pub n_eligible: u64,
    /// Swaps that succeeded sequentially.
    pub n_swapped_s: u64,
    /// Swaps that succeeded through parallel merging.
    pub n_swapped_p: u64,
    /// Entanglements consumed at this node.
    pub n_consumed: u64,
    /// Sum of the fidelities of consumed entanglements.
    pub consumed_sum_fidelity: f64,
}

impl ForwarderCounters {
    pub fn increment_n_purif(&mut self, round: u32) {
        let round = round as usize;
        if self.n_purif.len() <= round {
            self.n_purif.resize(round + 1, 0);
        }
        self.n_purif[round] += 1;
    }

    /// Total successful swaps.
    #[must_use]
    pub fn n_swapped(&self) -> u64 {
        self.n_swapped_s + self.n_swapped_p
    }

    /// Average fidelity of consumed entanglements.
    #[must_use]
    pub fn consumed_avg_fidelity(&self) -> f64 {
        if self.n_consumed == 0 {
            0.0
        } else {
            self.consumed_sum_fidelity / self.n_consumed as f64
        }
    }
}

/// Record of a swap this node performed that a same-rank neighbor may have
/// performed concurrently on the shared pair.
#[derive(Debug, Clone)]
pub(crate) struct ParallelRecord {
    /// The pair shared with the neighbor, consumed by our swap.
    pub shared: Entanglement,
    /// Our other leg, consumed by the same swap.
    pub other: Entanglement,
    /// The pair our swap produced.
    pub my_new: Entanglement,
}

/// Per-node forwarder state.
#[derive(Debug)]
pub struct Forwarder {
    pub cfg: ForwarderConfig,
    pub fib: Fib,
    pub cnt: ForwarderCounters,
    /// Paths that may use each channel (statistical multiplexing).
    pub(crate) qchannel_paths_map: BTreeMap<QChannelId, std::collections::BTreeSet<PathId>>,
    /// Entangled-qubit notifications queued during the external phase.
    pub(crate) waiting_qubits: Vec<(NodeId, usize)>,
    /// Swap updates that arrived before the entangled-qubit notification.
    pub(crate) waiting_su: BTreeMap<usize, SwapUpdateMsg>,
    /// Potential parallel swaps, keyed by the shared pair's name.
    pub(crate) parallel_swappings: BTreeMap<String, ParallelRecord>,
    /// Pairs swapped remotely whose `SWAP_UPDATE` has not arrived yet.
    /// The swapping node deposits here; this node pops on receipt.
    pub(crate) remote_swapped_eprs: HashMap<String, Entanglement>,
    /// Base fidelity of solicited purifications, kept to mirror the
    /// partner's update on `PURIF_RESPONSE`.
    pub(crate) pending_purif_fmin: BTreeMap<String, f64>,
    pub(crate) sync_current_phase: SignalType,
}

impl Forwarder {
    #[must_use]
    pub fn new(cfg: ForwarderConfig) -> Self {
        Self {
            cfg,
            fib: Fib::new(),
            cnt: ForwarderCounters::default(),
            qchannel_paths_map: BTreeMap::new(),
            waiting_qubits: Vec::new(),
            waiting_su: BTreeMap::new(),
            parallel_swappings: BTreeMap::new(),
            remote_swapped_eprs: HashMap::new(),
            pending_purif_fmin: BTreeMap::new(),
            sync_current_phase: SignalType::External,
        }
    }
}

impl Network {
    /// Process an `install_path` control message from the controller.
    pub(crate) fn fw_handle_install_path(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        packet: &ClassicPacket,
    ) {
        let SignalingMsg::InstallPath {
            path_id,
            instructions,
        } = &packet.msg
        else {
            unreachable!("not an install_path message");
        };
        let path_id = *path_id;

        if let Err(err) = validate_path_instructions(instructions) {
            panic!("{}: invalid path instructions: {err}", self.name_of(node));
        }
        if let Err(err) = self.mux_validate(node, instructions) {
            panic!("{}: invalid path instructions: {err}", self.name_of(node));
        }

        let own_name = self.name_of(node).to_string();
        let route = instructions.route.clone();
        let Some(own_idx) = route.iter().position(|n| *n == own_name) else {
            debug!(node = %own_name, "install_path for a route not containing this node");
            return;
        };
        debug!(node = %own_name, path = %path_id, ?route, "installing path");

        let entry = crate::fib::FibEntry {
            path_id,
            req_id: instructions.req_id,
            route: route.clone(),
            own_idx,
            swap: instructions.swap.clone(),
            purif: instructions.purif.clone(),
            m_v: instructions.m_v.clone(),
        };
        self.nodes[node.0].fw.fib.insert_or_replace(entry.clone());

        let l_neighbor = (own_idx > 0)
            .then(|| self.node_id(&route[own_idx - 1]).expect("route node exists"));
        let r_neighbor = route
            .get(own_idx + 1)
            .map(|n| self.node_id(n).expect("route node exists"));

        for (direction, neighbor) in [
            (crate::memory::PathDirection::Left, l_neighbor),
            (crate::memory::PathDirection::Right, r_neighbor),
        ] {
            let Some(neighbor) = neighbor else { continue };
            let qch = self.qchannel_between(node, neighbor).unwrap_or_else(|| {
                panic!(
                    "no quantum channel between {} and {}",
                    own_name,
                    self.name_of(neighbor)
                )
            });
            self.mux_install_path_neighbor(node, instructions, &entry, direction, neighbor, qch);
        }

        // start generating elementary pairs toward the next hop
        if let Some(r) = r_neighbor {
            sim.add_event(Event::new(
                sim.tc(),
                NetEvent::ManageActiveChannels {
                    node,
                    neighbor: r,
                    op: ChannelOp::Add,
                },
            ));
        }
    }

    /// A slot entered the entangled state (notification from the link layer).
    pub(crate) fn fw_qubit_is_entangled(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        neighbor: NodeId,
        addr: usize,
    ) {
        if matches!(self.timing, TimingMode::Sync { .. })
            && self.nodes[node.0].fw.sync_current_phase == SignalType::External
        {
            self.nodes[node.0].fw.waiting_qubits.push((neighbor, addr));
            return;
        }

        if slot_is_empty(self.nodes[node.0].memory.get(MemKey::Addr(addr))) {
            debug!(node = %self.nodes[node.0].name, addr, "entangled slot already empty");
            return;
        }

        self.nodes[node.0].fw.cnt.n_entg += 1;
        if self.nodes[node.0].memory.qubit(addr).state() != QubitState::Entangled {
            warn!(
                node = %self.nodes[node.0].name,
                addr,
                "entangled notification for slot in state {:?}",
                self.nodes[node.0].memory.qubit(addr).state()
            );
        }

        self.mux_qubit_is_entangled(sim, node, addr, neighbor);

        if let Some(msg) = self.nodes[node.0].fw.waiting_su.remove(&addr) {
            self.fw_handle_swap_update(sim, node, msg);
        }
    }

    /// A qubit entered the purification stage for `path_id`, entangled with
    /// `partner`.
    pub(crate) fn fw_qubit_is_purif(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        addr: usize,
        path_id: PathId,
        partner: NodeId,
    ) {
        let Some(entry) = self.nodes[node.0].fw.fib.get(path_id).cloned() else {
            debug!(node = %self.nodes[node.0].name, path = %path_id, "no entry for purif");
            return;
        };
        let own_idx = entry.own_idx;
        let own_rank = entry.own_rank();
        let own_name = self.name_of(node).to_string();
        let partner_name = self.name_of(partner).to_string();
        let Some((partner_idx, partner_rank)) = entry.find_index_and_rank(&partner_name) else {
            debug!(node = %own_name, partner = %partner_name, "purif partner not on route");
            return;
        };

        if own_rank > partner_rank {
            // swapping order disallows initiating purif / swap / consumption
            return;
        }

        let segment = if own_idx < partner_idx {
            format!("{own_name}-{partner_name}")
        } else {
            format!("{partner_name}-{own_name}")
        };
        let want_rounds = entry.purif.get(&segment).copied().unwrap_or(0);
        let rounds = self.nodes[node.0].memory.qubit(addr).purif_rounds;
        debug!(
            node = %own_name,
            segment,
            addr,
            rounds,
            want_rounds,
            "purification progress"
        );

        if rounds == want_rounds {
            self.nodes[node.0].fw.cnt.n_eligible += 1;
            let qubit = self.nodes[node.0].memory.qubit_mut(addr);
            qubit.purif_rounds = 0;
            qubit.to_eligible();
            self.fw_qubit_is_eligible(sim, node, addr, Some(path_id));
            return;
        }
        assert!(rounds < want_rounds, "purification rounds overshot");

        let is_primary = (own_rank, own_idx) < (partner_rank, partner_idx);
        if !is_primary {
            debug!(node = %own_name, segment, "not primary for segment purif");
            return;
        }

        let aux = self.nodes[node.0].memory.find(true, |q, pair| {
            q.addr != addr
                && q.state() == QubitState::Purif
                && q.purif_rounds == rounds
                && q.path_id == Some(path_id)
                && pair.is_some_and(|p| p.src == Some(partner) || p.dst == Some(partner))
        });
        let Some((aux_addr, _)) = aux else {
            debug!(node = %own_name, segment, "no auxiliary pair for purif round");
            return;
        };

        self.fw_send_purif_solicit(sim, node, addr, aux_addr, path_id, partner);
    }

    /// Start a purification round: keep `addr`, measure `aux_addr`.
    fn fw_send_purif_solicit(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        addr: usize,
        aux_addr: usize,
        path_id: PathId,
        partner: NodeId,
    ) {
        let now = sim.tc();
        let (_, kept) = self.nodes[node.0]
            .memory
            .read(MemKey::Addr(addr), false, now)
            .expect("kept pair present");
        let (_, measured) = self.nodes[node.0]
            .memory
            .read(MemKey::Addr(aux_addr), true, now)
            .expect("auxiliary pair present");

        debug!(
            node = %self.nodes[node.0].name,
            kept = %kept.name,
            measured = %measured.name,
            partner = %self.nodes[partner.0].name,
            "soliciting purification"
        );

        let fmin = kept.fidelity().min(measured.fidelity());
        self.nodes[node.0]
            .fw
            .pending_purif_fmin
            .insert(kept.name.clone(), fmin);

        let rounds = self.nodes[node.0].memory.qubit(addr).purif_rounds;
        self.nodes[node.0].memory.qubit_mut(addr).to_pending();
        self.nodes[node.0].memory.qubit_mut(aux_addr).to_release();
        sim.add_event(Event::new(
            now,
            NetEvent::QubitReleased {
                node,
                addr: aux_addr,
            },
        ));

        let msg = SignalingMsg::PurifSolicit(PurifMsg {
            path_id,
            purif_node: self.name_of(node).to_string(),
            partner: self.name_of(partner).to_string(),
            epr: kept.name,
            measure_epr: measured.name,
            round: rounds,
        });
        self.fw_send_msg(sim, node, partner, msg, path_id);
    }

    /// Partner side of a purification round.
    pub(crate) fn fw_handle_purif_solicit(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        msg: &PurifMsg,
    ) {
        let now = sim.tc();
        let Some((addr0, mut kept)) =
            self.nodes[node.0]
                .memory
                .read(MemKey::Name(&msg.epr), false, now)
        else {
            debug!(node = %self.nodes[node.0].name, pair = %msg.epr, "kept pair gone before purif");
            return;
        };
        let Some((addr1, measured)) =
            self.nodes[node.0]
                .memory
                .read(MemKey::Name(&msg.measure_epr), true, now)
        else {
            debug!(node = %self.nodes[node.0].name, pair = %msg.measure_epr, "measured pair gone before purif");
            return;
        };

        for addr in [addr0, addr1] {
            let qubit = self.nodes[node.0].memory.qubit(addr);
            if qubit.state() != QubitState::Purif || qubit.purif_rounds != msg.round {
                warn!(
                    node = %self.nodes[node.0].name,
                    addr,
                    "purif solicitation for slot in state {:?} round {}",
                    qubit.state(),
                    qubit.purif_rounds
                );
            }
        }

        let result = kept.purify(&measured, &mut self.rng);
        debug!(
            node = %self.nodes[node.0].name,
            kept = %kept.name,
            round = msg.round,
            result,
            "performed purification"
        );

        let Ok(primary) = self.node_id(&msg.purif_node) else {
            debug!(node = %self.nodes[node.0].name, "unknown purif primary {}", msg.purif_node);
            return;
        };

        if result {
            self.nodes[node.0].memory.update(sim, &msg.epr, kept);
            self.nodes[node.0].fw.cnt.increment_n_purif(msg.round);
            let qubit = self.nodes[node.0].memory.qubit_mut(addr0);
            qubit.purif_rounds += 1;
            qubit.to_purif();
            self.fw_qubit_is_purif(sim, node, addr0, msg.path_id, primary);
        } else {
            let _ = self.nodes[node.0].memory.read(MemKey::Addr(addr0), true, now);
            self.nodes[node.0].memory.qubit_mut(addr0).to_release();
            sim.add_event(Event::new(now, NetEvent::QubitReleased { node, addr: addr0 }));
        }

        self.nodes[node.0].memory.qubit_mut(addr1).to_release();
        sim.add_event(Event::new(now, NetEvent::QubitReleased { node, addr: addr1 }));

        let resp = SignalingMsg::PurifResponse(PurifResponseMsg {
            purif: msg.clone(),
            result,
        });
        self.fw_send_msg(sim, node, primary, resp, msg.path_id);
    }

    /// Primary side: mirror the partner's purification outcome.
    pub(crate) fn fw_handle_purif_response(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        msg: &PurifResponseMsg,
    ) {
        let pm = &msg.purif;
        let now = sim.tc();
        let Some(addr) = self.nodes[node.0]
            .memory
            .get(MemKey::Name(&pm.epr))
            .map(|(q, _)| q.addr)
        else {
            debug!(node = %self.nodes[node.0].name, pair = %pm.epr, "pair gone before purif response");
            self.nodes[node.0].fw.pending_purif_fmin.remove(&pm.epr);
            return;
        };

        debug!(
            node = %self.nodes[node.0].name,
            pair = %pm.epr,
            round = pm.round,
            result = msg.result,
            "purification response"
        );

        let fmin = self.nodes[node.0].fw.pending_purif_fmin.remove(&pm.epr);
        if !msg.result {
            let _ = self.nodes[node.0].memory.read(MemKey::Addr(addr), true, now);
            self.nodes[node.0].memory.qubit_mut(addr).to_release();
            sim.add_event(Event::new(now, NetEvent::QubitReleased { node, addr }));
            return;
        }

        let (_, mut kept) = self.nodes[node.0]
            .memory
            .read(MemKey::Addr(addr), false, now)
            .expect("kept pair present");
        match fmin {
            Some(fmin) => kept.set_fidelity(Entanglement::purified_fidelity(fmin)),
            None => warn!(
                node = %self.nodes[node.0].name,
                pair = %pm.epr,
                "purif response without recorded base fidelity"
            ),
        }
        self.nodes[node.0].memory.update(sim, &pm.epr, kept);
        self.nodes[node.0].fw.cnt.increment_n_purif(pm.round);
        let qubit = self.nodes[node.0].memory.qubit_mut(addr);
        qubit.purif_rounds += 1;
        qubit.to_purif();

        let Ok(partner) = self.node_id(&pm.partner) else {
            debug!(node = %self.nodes[node.0].name, "unknown purif partner {}", pm.partner);
            return;
        };
        self.fw_qubit_is_purif(sim, node, addr, pm.path_id, partner);
    }

    /// A qubit completed purification: consume at endpoints, swap elsewhere.
    pub(crate) fn fw_qubit_is_eligible(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        addr: usize,
        path_id: Option<PathId>,
    ) {
        if matches!(self.timing, TimingMode::Sync { .. })
            && self.nodes[node.0].fw.sync_current_phase != SignalType::Internal
        {
            debug!(node = %self.nodes[node.0].name, "internal phase over, deferring swaps");
            return;
        }
        if slot_is_empty(self.nodes[node.0].memory.get(MemKey::Addr(addr))) {
            debug!(node = %self.nodes[node.0].name, addr, "eligible slot already empty");
            return;
        }

        match self.nodes[node.0].fw.cfg.mux {
            MuxKind::BufferSpace => {
                let path_id = path_id.expect("buffer-space eligibility carries a path");
                let Some(entry) = self.nodes[node.0].fw.fib.get(path_id).cloned() else {
                    debug!(node = %self.nodes[node.0].name, path = %path_id, "no entry for eligible qubit");
                    return;
                };
                if entry.is_swap_disabled() || entry.own_is_endpoint() {
                    self.fw_consume_and_release(sim, node, addr);
                    return;
                }
                if let Some((other_addr, other_path)) =
                    self.mux_find_swap_candidate(node, addr, &entry)
                {
                    self.fw_do_swapping(sim, node, addr, other_addr, path_id, other_path);
                }
            }
            MuxKind::Statistical => {
                if self.fw_is_end_node(node) {
                    self.fw_consume_and_release(sim, node, addr);
                    return;
                }
                if let Some((other_addr, chosen_path)) =
                    self.mux_find_swap_candidate_statistical(node, addr)
                {
                    self.fw_do_swapping(sim, node, addr, other_addr, chosen_path, chosen_path);
                }
            }
        }
    }

    /// Whether this node is an endpoint on every installed route.
    pub(crate) fn fw_is_end_node(&self, node: NodeId) -> bool {
        let fib = &self.nodes[node.0].fw.fib;
        !fib.is_empty() && fib.entries().all(|e| e.own_is_endpoint())
    }

    /// Perform entanglement swapping between two eligible local qubits.
    ///
    /// `path0`/`path1` are the FIB paths governing `addr0`/`addr1`. The pair
    /// whose destination is this node is the leg toward the left partner;
    /// the pair whose source is this node is the leg toward the right. This
    /// orientation is established by elementary generation (the primary is
    /// the source) and preserved by swap merging.
    pub(crate) fn fw_do_swapping(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        addr0: usize,
        addr1: usize,
        path0: PathId,
        path1: PathId,
    ) {
        let now = sim.tc();
        assert_ne!(addr0, addr1, "swapping a qubit with itself");
        let e0 = self.nodes[node.0].fw.fib.get(path0).cloned().expect("entry for addr0");
        let e1 = self.nodes[node.0].fw.fib.get(path1).cloned().expect("entry for addr1");

        let mut prev: Option<(usize, Entanglement)> = None;
        let mut next: Option<(usize, Entanglement)> = None;
        for addr in [addr0, addr1] {
            let (_, pair) = self.nodes[node.0]
                .memory
                .read(MemKey::Addr(addr), true, now)
                .expect("swapping pair present");
            if pair.dst == Some(node) {
                prev = Some((addr, pair));
            } else if pair.src == Some(node) {
                next = Some((addr, pair));
            } else {
                panic!(
                    "{}: pair {} does not terminate at the swapping node",
                    self.name_of(node),
                    pair.name
                );
            }
        }
        let (Some((prev_addr, mut prev_epr)), Some((next_addr, mut next_epr))) = (prev, next)
        else {
            panic!("{}: swapping legs have the same orientation", self.name_of(node));
        };

        let prev_fibe = if prev_addr == addr0 { &e0 } else { &e1 };
        let next_fibe = if next_addr == addr0 { &e0 } else { &e1 };

        // first swap of an elementary pair pins its link index on the path
        if prev_epr.orig_eprs.is_empty() && prev_epr.ch_index.is_none() {
            prev_epr.ch_index = Some(prev_fibe.own_idx - 1);
        }
        if next_epr.orig_eprs.is_empty() && next_epr.ch_index.is_none() {
            next_epr.ch_index = Some(next_fibe.own_idx);
        }

        let prev_partner = prev_epr.src.expect("elementary source set");
        let next_partner = next_epr.dst.expect("elementary destination set");
        let prev_partner_name = self.name_of(prev_partner).to_string();
        let next_partner_name = self.name_of(next_partner).to_string();

        let ps = self.nodes[node.0].fw.cfg.ps;
        let new_name = self.rng.uuid().simple().to_string();
        let new_epr = prev_epr.swap(&next_epr, ps, new_name, &mut self.rng);
        debug!(
            node = %self.nodes[node.0].name,
            success = new_epr.is_some(),
            prev = %prev_epr.name,
            next = %next_epr.name,
            "entanglement swapping"
        );

        let mut new_epr_name = None;
        if let Some(mut new_epr) = new_epr {
            self.nodes[node.0].fw.cnt.n_swapped_s += 1;
            new_epr.src = Some(prev_partner);
            new_epr.dst = Some(next_partner);
            self.mux_swapping_succeeded(node, &prev_epr, &next_epr, &mut new_epr);

            // a same-rank neighbor swapping the shared pair concurrently would
            // have moved its endpoint off our route
            let prev_p = prev_fibe.find_index_and_rank(&prev_partner_name);
            let next_p = next_fibe.find_index_and_rank(&next_partner_name);
            let (Some((_, prev_p_rank)), Some((_, next_p_rank))) = (prev_p, next_p) else {
                panic!(
                    "{}: conflicting parallel swapping with non-isolated paths",
                    self.name_of(node)
                );
            };

            if prev_fibe.own_rank() == prev_p_rank {
                self.nodes[node.0].fw.parallel_swappings.insert(
                    prev_epr.name.clone(),
                    ParallelRecord {
                        shared: prev_epr.clone(),
                        other: next_epr.clone(),
                        my_new: new_epr.clone(),
                    },
                );
            }
            if next_fibe.own_rank() == next_p_rank {
                self.nodes[node.0].fw.parallel_swappings.insert(
                    next_epr.name.clone(),
                    ParallelRecord {
                        shared: next_epr.clone(),
                        other: prev_epr.clone(),
                        my_new: new_epr.clone(),
                    },
                );
            }

            for partner in [prev_partner, next_partner] {
                self.nodes[partner.0]
                    .fw
                    .remote_swapped_eprs
                    .insert(new_epr.name.clone(), new_epr.clone());
            }
            new_epr_name = Some(new_epr.name);
        }

        let own_name = self.name_of(node).to_string();
        let updates = [
            (
                prev_partner,
                prev_epr.name.clone(),
                next_partner_name,
                prev_fibe.path_id,
            ),
            (
                next_partner,
                next_epr.name.clone(),
                prev_partner_name,
                next_fibe.path_id,
            ),
        ];
        for (partner, old_name, new_partner_name, su_path) in updates {
            let su = SwapUpdateMsg {
                path_id: su_path,
                swapping_node: own_name.clone(),
                partner: new_partner_name,
                epr: old_name,
                new_epr: new_epr_name.clone(),
            };
            self.fw_send_msg(sim, node, partner, SignalingMsg::SwapUpdate(su), su_path);
        }

        for (i, addr) in [prev_addr, next_addr].into_iter().enumerate() {
            self.nodes[node.0].memory.qubit_mut(addr).to_release();
            sim.add_event(Event::new(
                now + sim.time(i as f64 * 1e-6),
                NetEvent::QubitReleased { node, addr },
            ));
        }
    }

    /// Process a `SWAP_UPDATE` from a neighbor on the path.
    pub(crate) fn fw_handle_swap_update(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        msg: SwapUpdateMsg,
    ) {
        if matches!(self.timing, TimingMode::Sync { .. })
            && self.nodes[node.0].fw.sync_current_phase != SignalType::Internal
        {
            debug!(node = %self.nodes[node.0].name, "internal phase over, dropping swap update");
            return;
        }

        let Some(entry) = self.nodes[node.0].fw.fib.get(msg.path_id).cloned() else {
            debug!(node = %self.nodes[node.0].name, path = %msg.path_id, "swap update for unknown path");
            return;
        };
        let Some((_, sender_rank)) = entry.find_index_and_rank(&msg.swapping_node) else {
            debug!(node = %self.nodes[node.0].name, "swap update from node off route");
            return;
        };
        let own_rank = entry.own_rank();
        if own_rank < sender_rank {
            debug!(node = %self.nodes[node.0].name, "swap update from a higher-rank node, discarding");
            return;
        }

        let new_epr = match &msg.new_epr {
            None => None,
            Some(name) => match self.nodes[node.0].fw.remote_swapped_eprs.remove(name) {
                Some(pair) => Some(pair),
                None => {
                    debug!(
                        node = %self.nodes[node.0].name,
                        pair = %name,
                        "swapped pair not deposited, treating as failure"
                    );
                    None
                }
            },
        };

        let local = self.nodes[node.0]
            .memory
            .get(MemKey::Name(&msg.epr))
            .map(|(q, _)| (q.addr, q.state()));
        if let Some((addr, state)) = local {
            if state == QubitState::Entangled {
                // entangled notification still in flight; defer this update
                if let Some(pair) = new_epr {
                    self.nodes[node.0]
                        .fw
                        .remote_swapped_eprs
                        .insert(pair.name.clone(), pair);
                }
                self.nodes[node.0].fw.waiting_su.insert(addr, msg);
                return;
            }
            self.nodes[node.0].fw.parallel_swappings.remove(&msg.epr);
            let maybe_purif = own_rank > sender_rank;
            self.fw_su_sequential(sim, node, &msg, addr, new_epr, maybe_purif);
        } else if own_rank == sender_rank
            && self.nodes[node.0].fw.parallel_swappings.contains_key(&msg.epr)
        {
            self.fw_su_parallel(sim, node, &msg, new_epr);
        } else {
            debug!(node = %self.nodes[node.0].name, pair = %msg.epr, "pair decohered during update transmission");
        }
    }

    /// Swap update where the local slot still holds the old pair.
    fn fw_su_sequential(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        msg: &SwapUpdateMsg,
        addr: usize,
        new_epr: Option<Entanglement>,
        maybe_purif: bool,
    ) {
        let now = sim.tc();
        let usable = new_epr
            .as_ref()
            .is_some_and(|p| p.decoherence_time.map_or(true, |deadline| deadline > now));
        if !usable {
            if new_epr.is_some() {
                debug!(node = %self.nodes[node.0].name, "merged pair decohered during update transmission");
            }
            let _ = self.nodes[node.0].memory.read(MemKey::Addr(addr), true, now);
            self.nodes[node.0].memory.qubit_mut(addr).to_release();
            sim.add_event(Event::new(now, NetEvent::QubitReleased { node, addr }));
            return;
        }

        let new_epr = new_epr.expect("usable pair");
        let updated = self.nodes[node.0].memory.update(sim, &msg.epr, new_epr);
        assert!(
            updated,
            "{}: pair update failed for {}",
            self.name_of(node),
            msg.epr
        );

        if maybe_purif {
            // our rank exceeds the sender's: our turn to purify and progress
            let qubit = self.nodes[node.0].memory.qubit_mut(addr);
            qubit.purif_rounds = 0;
            qubit.to_purif();
            let Ok(partner) = self.node_id(&msg.partner) else {
                debug!(node = %self.nodes[node.0].name, "unknown swap partner {}", msg.partner);
                return;
            };
            self.fw_qubit_is_purif(sim, node, addr, msg.path_id, partner);
        }
    }

    /// Swap update for a pair this node already swapped concurrently: merge
    /// the two swaps and inform the far destination.
    fn fw_su_parallel(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        msg: &SwapUpdateMsg,
        new_epr: Option<Entanglement>,
    ) {
        let record = self.nodes[node.0]
            .fw
            .parallel_swappings
            .remove(&msg.epr)
            .expect("parallel record present");
        let ParallelRecord {
            shared,
            other,
            my_new,
        } = record;
        debug!(
            node = %self.nodes[node.0].name,
            shared = %shared.name,
            "reconciling parallel swap"
        );

        if self.mux_su_parallel_avoid_conflict(node, &my_new, msg.path_id) {
            return;
        }

        let now = sim.tc();
        let usable = new_epr
            .as_ref()
            .is_some_and(|p| p.decoherence_time.map_or(true, |deadline| deadline > now));
        if !usable {
            // inform the far destination that the chain is broken
            let destination = if other.dst == Some(node) {
                other.src.expect("other leg source")
            } else {
                other.dst.expect("other leg destination")
            };
            let su = SwapUpdateMsg {
                path_id: msg.path_id,
                swapping_node: msg.swapping_node.clone(),
                partner: msg.partner.clone(),
                epr: my_new.name.clone(),
                new_epr: None,
            };
            self.fw_send_msg(sim, node, destination, SignalingMsg::SwapUpdate(su), msg.path_id);
            return;
        }
        let new_epr = new_epr.expect("usable pair");

        // the neighbor swapped the shared pair in parallel with us; the
        // physical merge already happened, reconcile the bookkeeping
        let merged_name = self.rng.uuid().simple().to_string();
        let mut merged = new_epr.swap(&other, 1.0, merged_name, &mut self.rng);

        let (partner, destination) = if other.dst == Some(node) {
            // destination is to the left of this node
            (
                new_epr.dst.expect("merged destination"),
                other.src.expect("other leg source"),
            )
        } else {
            (
                new_epr.src.expect("merged source"),
                other.dst.expect("other leg destination"),
            )
        };
        if self.name_of(partner) != msg.partner {
            warn!(
                node = %self.nodes[node.0].name,
                "parallel swap partner mismatch: {} vs {}",
                self.name_of(partner),
                msg.partner
            );
        }

        if let Some(merged) = &mut merged {
            if other.dst == Some(node) {
                merged.src = other.src;
                merged.dst = new_epr.dst;
            } else {
                merged.src = new_epr.src;
                merged.dst = other.dst;
            }
            self.nodes[node.0].fw.cnt.n_swapped_p += 1;
            self.mux_su_parallel_succeeded(node, merged, &new_epr, &other);
            self.nodes[destination.0]
                .fw
                .remote_swapped_eprs
                .insert(merged.name.clone(), merged.clone());
        }

        let su = SwapUpdateMsg {
            path_id: msg.path_id,
            swapping_node: msg.swapping_node.clone(),
            partner: self.name_of(partner).to_string(),
            epr: my_new.name.clone(),
            new_epr: merged.as_ref().map(|p| p.name.clone()),
        };
        self.fw_send_msg(sim, node, destination, SignalingMsg::SwapUpdate(su), msg.path_id);

        // the merged pair may itself cascade with the new partner
        if let Some(merged) = merged {
            let entry = self.nodes[node.0].fw.fib.get(msg.path_id).cloned();
            let partner_rank = entry
                .as_ref()
                .and_then(|e| e.find_index_and_rank(self.name_of(partner)))
                .map(|(_, r)| r);
            if let (Some(entry), Some(partner_rank)) = (entry, partner_rank) {
                if entry.own_rank() == partner_rank {
                    self.nodes[node.0].fw.parallel_swappings.insert(
                        new_epr.name.clone(),
                        ParallelRecord {
                            shared: new_epr,
                            other,
                            my_new: merged,
                        },
                    );
                }
            }
        }
    }

    /// Destructively read and count an end-to-end (or isolated-link) pair.
    pub(crate) fn fw_consume_and_release(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        addr: usize,
    ) {
        let now = sim.tc();
        let (_, pair) = self.nodes[node.0]
            .memory
            .read(MemKey::Addr(addr), true, now)
            .expect("consumed pair present");
        assert!(pair.src.is_some() && pair.dst.is_some());
        self.nodes[node.0].memory.qubit_mut(addr).to_release();

        debug!(
            node = %self.nodes[node.0].name,
            pair = %pair.name,
            fidelity = pair.fidelity(),
            "consumed entanglement"
        );
        let cnt = &mut self.nodes[node.0].fw.cnt;
        cnt.n_consumed += 1;
        cnt.consumed_sum_fidelity += pair.fidelity();

        sim.add_event(Event::new(now, NetEvent::QubitReleased { node, addr }));
    }

    /// Dispatch a signaling packet: handle it here when addressed to this
    /// node, otherwise forward it one hop closer to the addressee along the
    /// path's classical channels.
    pub(crate) fn fw_handle_signaling(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        packet: ClassicPacket,
    ) {
        let path_id = match &packet.msg {
            SignalingMsg::SwapUpdate(m) => m.path_id,
            SignalingMsg::PurifSolicit(m) => m.path_id,
            SignalingMsg::PurifResponse(m) => m.purif.path_id,
            _ => unreachable!("not a signaling message"),
        };
        if self.nodes[node.0].fw.fib.get(path_id).is_none() {
            debug!(node = %self.nodes[node.0].name, path = %path_id, "signaling for unknown path");
            return;
        }

        if packet.dest != node {
            self.fw_send_msg(sim, node, packet.dest, packet.msg, path_id);
            return;
        }

        match packet.msg {
            SignalingMsg::SwapUpdate(m) => self.fw_handle_swap_update(sim, node, m),
            SignalingMsg::PurifSolicit(m) => self.fw_handle_purif_solicit(sim, node, &m),
            SignalingMsg::PurifResponse(m) => self.fw_handle_purif_response(sim, node, &m),
            _ => unreachable!(),
        }
    }

    /// Send a signaling message one hop toward `dest` along the path's route.
    pub(crate) fn fw_send_msg(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        dest: NodeId,
        msg: SignalingMsg,
        path_id: PathId,
    ) {
        let Some(entry) = self.nodes[node.0].fw.fib.get(path_id) else {
            debug!(node = %self.nodes[node.0].name, path = %path_id, "cannot route message, unknown path");
            return;
        };
        let dest_name = self.nodes[dest.0].name.clone();
        let Some(dest_idx) = entry.route.iter().position(|n| *n == dest_name) else {
            debug!(node = %self.nodes[node.0].name, dest = %dest_name, "message target off route");
            return;
        };
        let nh_name = if dest_idx > entry.own_idx {
            entry.route[entry.own_idx + 1].clone()
        } else {
            entry.route[entry.own_idx - 1].clone()
        };
        let next_hop = self.node_id(&nh_name).expect("route node exists");
        let cch = self.cchannel_between(node, next_hop).unwrap_or_else(|| {
            panic!(
                "no classical channel between {} and {}",
                self.name_of(node),
                nh_name
            )
        });

        debug!(
            node = %self.nodes[node.0].name,
            dest = %dest_name,
            via = %nh_name,
            "sending signaling message"
        );
        let packet = ClassicPacket {
            msg,
            src: Some(node),
            dest,
        };
        self.send_classic(sim, cch, packet, next_hop);
    }

    /// Phase handling for the phased timing mode.
    pub(crate) fn fw_handle_sync_signal(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        signal: SignalType,
    ) {
        if !matches!(self.timing, TimingMode::Sync { .. }) {
            return;
        }
        match signal {
            SignalType::External => {
                let fw = &mut self.nodes[node.0].fw;
                fw.sync_current_phase = SignalType::External;
                fw.remote_swapped_eprs.clear();
                fw.parallel_swappings.clear();
                fw.waiting_su.clear();
                fw.pending_purif_fmin.clear();
            }
            SignalType::Internal => {
                self.nodes[node.0].fw.sync_current_phase = SignalType::Internal;
                let queued = std::mem::take(&mut self.nodes[node.0].fw.waiting_qubits);
                debug!(
                    node = %self.nodes[node.0].name,
                    queued = queued.len(),
                    "processing queued entangled qubits"
                );
                for (neighbor, addr) in queued {
                    self.fw_qubit_is_entangled(sim, node, neighbor, addr);
                }
            }
            SignalType::ExternalStart => {}
        }
    }
}

/// Whether a slot lookup failed or found a slot holding no pair.
fn slot_is_empty(lookup: Option<(&crate::memory::MemoryQubit, Option<&Entanglement>)>) -> bool {
    !matches!(lookup, Some((_, Some(_))))
}
