//! Path multiplexing schemes.
//!
//! A multiplexing scheme decides how memory slots relate to installed paths:
//!
//! - **Buffer-space**: paths get pre-allocated qubits at install time, driven
//!   by the multiplexing vector. A freshly entangled qubit belongs to exactly
//!   one path and enters purification immediately. Swap candidates are
//!   eligible qubits of the opposite path direction on a different channel,
//!   on the same path (or a sibling path of the same request when paths are
//!   not isolated).
//! - **Statistical**: no pre-allocation; slots are only assigned to channels,
//!   and each pair carries the set of candidate paths crossing its channel.
//!   Swap candidates must overlap in candidate paths, and the merged pair
//!   inherits the intersection. Only the plain swap shape
//!   `[1, 0, .., 0, 1]` without purification is supported.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::epr::Entanglement;
use crate::fib::FibEntry;
use crate::memory::{MemKey, PathDirection, QubitState};
use crate::message::{MultiplexingMode, PathInstructions};
use crate::network::{NetEvent, Network};
use crate::simulator::Simulator;
use crate::{NodeId, PathId, QChannelId, Result, SimError};

/// Multiplexing policy variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MuxKind {
    BufferSpace,
    Statistical,
}

impl Network {
    /// Reject instruction combinations the node's scheme cannot honor.
    pub(crate) fn mux_validate(&self, node: NodeId, instructions: &PathInstructions) -> Result<()> {
        match self.nodes[node.0].fw.cfg.mux {
            MuxKind::BufferSpace => {
                if instructions.mux != MultiplexingMode::BufferSpace {
                    return Err(SimError::Configuration(
                        "buffer-space forwarder received a statistical path".into(),
                    ));
                }
                if instructions.m_v.is_none() {
                    return Err(SimError::Configuration(
                        "buffer-space path without a multiplexing vector".into(),
                    ));
                }
                Ok(())
            }
            MuxKind::Statistical => {
                if instructions.mux != MultiplexingMode::Statistical {
                    return Err(SimError::Configuration(
                        "statistical forwarder received a buffer-space path".into(),
                    ));
                }
                let swap = &instructions.swap;
                let plain = swap.len() >= 2
                    && swap[0] == 1
                    && swap[swap.len() - 1] == 1
                    && swap[1..swap.len() - 1].iter().all(|&r| r == 0);
                if !plain {
                    return Err(SimError::Configuration(
                        "statistical multiplexing requires the [1, 0, .., 0, 1] swap shape".into(),
                    ));
                }
                if instructions.purif.values().any(|&r| r != 0) {
                    return Err(SimError::Configuration(
                        "statistical multiplexing does not support purification".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Record what this node needs about one neighbor of the path.
    pub(crate) fn mux_install_path_neighbor(
        &mut self,
        node: NodeId,
        instructions: &PathInstructions,
        entry: &FibEntry,
        direction: PathDirection,
        _neighbor: NodeId,
        qchannel: QChannelId,
    ) {
        match self.nodes[node.0].fw.cfg.mux {
            MuxKind::BufferSpace => {
                let m_v = instructions.m_v.as_ref().expect("validated earlier");
                // example: route S--(4,2)--R--(2,4)--D; at R, the LEFT entry is
                // m_v[own_idx - 1].1 (2 qubits toward S)
                let wanted = match direction {
                    PathDirection::Left => m_v[entry.own_idx - 1].1,
                    PathDirection::Right => m_v[entry.own_idx].0,
                } as usize;
                let n = if wanted == 0 {
                    // zero means: use every qubit assigned to this channel
                    self.nodes[node.0].memory.channel_slots(qchannel).count()
                } else {
                    wanted
                };
                let allocated =
                    self.nodes[node.0]
                        .memory
                        .allocate(entry.path_id, direction, Some(qchannel), n);
                debug!(
                    node = %self.nodes[node.0].name,
                    path = %entry.path_id,
                    ?direction,
                    ?allocated,
                    "allocated path qubits"
                );
                if allocated.len() < n {
                    warn!(
                        node = %self.nodes[node.0].name,
                        path = %entry.path_id,
                        wanted = n,
                        got = allocated.len(),
                        "insufficient free qubits on channel"
                    );
                }
            }
            MuxKind::Statistical => {
                self.nodes[node.0]
                    .fw
                    .qchannel_paths_map
                    .entry(qchannel)
                    .or_default()
                    .insert(entry.path_id);
            }
        }
    }

    /// Decide what a freshly entangled qubit becomes.
    pub(crate) fn mux_qubit_is_entangled(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        node: NodeId,
        addr: usize,
        neighbor: NodeId,
    ) {
        match self.nodes[node.0].fw.cfg.mux {
            MuxKind::BufferSpace => {
                let Some(path_id) = self.nodes[node.0].memory.qubit(addr).path_id else {
                    warn!(
                        node = %self.nodes[node.0].name,
                        addr,
                        "entangled qubit without path allocation"
                    );
                    return;
                };
                let qubit = self.nodes[node.0].memory.qubit_mut(addr);
                qubit.purif_rounds = 0;
                qubit.to_purif();
                self.fw_qubit_is_purif(sim, node, addr, path_id, neighbor);
            }
            MuxKind::Statistical => {
                let qubit = self.nodes[node.0].memory.qubit(addr);
                if qubit.path_id.is_some() {
                    warn!(node = %self.nodes[node.0].name, addr, "statistical qubit has a path allocation");
                }
                let qch = qubit
                    .qchannel
                    .unwrap_or_else(|| panic!("{}: qubit has no channel assignment", self.name_of(node)));
                let possible = self.nodes[node.0]
                    .fw
                    .qchannel_paths_map
                    .get(&qch)
                    .cloned()
                    .unwrap_or_else(|| {
                        panic!(
                            "{}: channel {} is not mapped to any path",
                            self.name_of(node),
                            self.qchannels[qch.0].name()
                        )
                    });
                debug!(
                    node = %self.nodes[node.0].name,
                    addr,
                    ?possible,
                    "candidate paths for entangled qubit"
                );
                if let Some(pair) = self.nodes[node.0].memory.pair_mut(addr) {
                    pair.tmp_path_ids = Some(possible);
                }

                // the notification is processed either way; an incompatible
                // pair parks here until a swap update reshapes it
                self.nodes[node.0].memory.qubit_mut(addr).to_purif();
                if self.statistical_can_enter_purif(node, neighbor) {
                    // no purification under this scheme: straight to eligible
                    self.nodes[node.0].memory.qubit_mut(addr).to_eligible();
                    self.fw_qubit_is_eligible(sim, node, addr, None);
                }
            }
        }
    }

    /// An entangled qubit may progress only if its partners are compatible:
    /// any pair at an intermediate node, and pairs between the two endpoints
    /// of an installed route at end nodes.
    fn statistical_can_enter_purif(&self, node: NodeId, partner: NodeId) -> bool {
        let fib = &self.nodes[node.0].fw.fib;
        if fib.entries().any(|e| !e.own_is_endpoint()) {
            return true;
        }
        let own_name = self.name_of(node);
        let partner_name = self.name_of(partner);
        fib.entries().any(|e| {
            let first = e.route.first().map(String::as_str);
            let last = e.route.last().map(String::as_str);
            (first == Some(own_name) && last == Some(partner_name))
                || (first == Some(partner_name) && last == Some(own_name))
        })
    }

    /// Buffer-space swap candidate: an eligible qubit on another channel, in
    /// the opposite direction, on the same path or a sibling path of the same
    /// request. Returns the candidate address and its governing path.
    pub(crate) fn mux_find_swap_candidate(
        &self,
        node: NodeId,
        addr: usize,
        entry: &FibEntry,
    ) -> Option<(usize, PathId)> {
        let possible = if self.nodes[node.0].fw.cfg.isolate_paths {
            [entry.path_id].into_iter().collect()
        } else {
            self.nodes[node.0].fw.fib.list_by_req(entry.req_id)
        };

        let mq0 = self.nodes[node.0].memory.qubit(addr);
        let own_channel = mq0.qchannel;
        let own_direction = mq0.path_direction;

        let found = self.nodes[node.0].memory.find(true, |q, _| {
            q.addr != addr
                && q.state() == QubitState::Eligible
                && q.qchannel != own_channel
                && q.path_id.is_some_and(|p| possible.contains(&p))
                && q.path_direction != own_direction
        });
        found.map(|(cand_addr, _)| {
            let cand_path = self.nodes[node.0]
                .memory
                .qubit(cand_addr)
                .path_id
                .expect("candidate is path-allocated");
            (cand_addr, cand_path)
        })
    }

    /// Statistical swap candidate: an eligible qubit on a channel whose
    /// candidate paths overlap this pair's. Returns the candidate address and
    /// a path drawn from the intersection.
    pub(crate) fn mux_find_swap_candidate_statistical(
        &mut self,
        node: NodeId,
        addr: usize,
    ) -> Option<(usize, PathId)> {
        let (_, pair) = self.nodes[node.0].memory.get(MemKey::Addr(addr))?;
        let tmp0 = pair?.tmp_path_ids.clone()?;
        let own_channel = self.nodes[node.0].memory.qubit(addr).qchannel;

        let matched: std::collections::BTreeSet<QChannelId> = self.nodes[node.0]
            .fw
            .qchannel_paths_map
            .iter()
            .filter(|(ch, paths)| Some(**ch) != own_channel && !tmp0.is_disjoint(paths))
            .map(|(ch, _)| *ch)
            .collect();

        let found = self.nodes[node.0].memory.find(true, |q, pair| {
            q.addr != addr
                && q.state() == QubitState::Eligible
                && q.qchannel.is_some_and(|c| matched.contains(&c))
                && pair
                    .and_then(|p| p.tmp_path_ids.as_ref())
                    .is_some_and(|tmp1| !tmp0.is_disjoint(tmp1))
        });
        let (cand_addr, cand_pair) = found?;
        let tmp1 = cand_pair
            .and_then(|p| p.tmp_path_ids.as_ref())
            .expect("candidate carries path set");

        let intersection: Vec<PathId> = tmp0.intersection(tmp1).copied().collect();
        assert!(
            !intersection.is_empty(),
            "{}: no common path between swap candidates",
            self.name_of(node)
        );
        let chosen = intersection[self.rng.pick(intersection.len())];
        Some((cand_addr, chosen))
    }

    /// Maintain per-path metadata after a successful swap.
    pub(crate) fn mux_swapping_succeeded(
        &self,
        node: NodeId,
        prev_epr: &Entanglement,
        next_epr: &Entanglement,
        new_epr: &mut Entanglement,
    ) {
        match self.nodes[node.0].fw.cfg.mux {
            MuxKind::BufferSpace => {
                debug_assert!(prev_epr.tmp_path_ids.is_none());
                debug_assert!(next_epr.tmp_path_ids.is_none());
            }
            MuxKind::Statistical => {
                let tmp = intersect_tmp_path_ids(node, self, prev_epr, next_epr);
                new_epr.tmp_path_ids = Some(tmp);
            }
        }
    }

    /// Whether a parallel swap update conflicts with the paths this pair may
    /// still serve.
    pub(crate) fn mux_su_parallel_avoid_conflict(
        &self,
        node: NodeId,
        my_new_epr: &Entanglement,
        su_path_id: PathId,
    ) -> bool {
        match self.nodes[node.0].fw.cfg.mux {
            MuxKind::BufferSpace => false,
            MuxKind::Statistical => {
                let conflict = !my_new_epr
                    .tmp_path_ids
                    .as_ref()
                    .is_some_and(|tmp| tmp.contains(&su_path_id));
                if conflict {
                    debug!(
                        node = %self.nodes[node.0].name,
                        path = %su_path_id,
                        "conflicting parallel swap, silently ignoring"
                    );
                }
                conflict
            }
        }
    }

    /// Maintain per-path metadata after a successful parallel merge.
    pub(crate) fn mux_su_parallel_succeeded(
        &self,
        node: NodeId,
        merged: &mut Entanglement,
        new_epr: &Entanglement,
        other_epr: &Entanglement,
    ) {
        match self.nodes[node.0].fw.cfg.mux {
            MuxKind::BufferSpace => {
                debug_assert!(new_epr.tmp_path_ids.is_none());
                debug_assert!(other_epr.tmp_path_ids.is_none());
            }
            MuxKind::Statistical => {
                let tmp = intersect_tmp_path_ids(node, self, new_epr, other_epr);
                merged.tmp_path_ids = Some(tmp);
            }
        }
    }
}

fn intersect_tmp_path_ids(
    node: NodeId,
    net: &Network,
    a: &Entanglement,
    b: &Entanglement,
) -> std::collections::BTreeSet<PathId> {
    let (Some(ta), Some(tb)) = (&a.tmp_path_ids, &b.tmp_path_ids) else {
        panic!("{}: pair without candidate path set", net.name_of(node));
    };
    let tmp: std::collections::BTreeSet<PathId> = ta.intersection(tb).copied().collect();
    assert!(
        !tmp.is_empty(),
        "{}: cannot select a path from disjoint candidate sets",
        net.name_of(node)
    );
    tmp
}
