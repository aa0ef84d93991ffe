//! Centralized routing controller.
//!
//! The controller runs once at install time. Given a path specification, it
//! resolves the route (explicitly, or through the injected routing
//! algorithm), derives the swap rank sequence, computes the multiplexing
//! vector for buffer-space paths, validates everything, and sends an
//! `install_path` message to every node on the route over its classical
//! channels.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::channel::ClassicPacket;
use crate::message::{
    validate_path_instructions, MultiplexingMode, MultiplexingVector, PathInstructions,
    SignalingMsg,
};
use crate::network::{NetEvent, Network};
use crate::simulator::Simulator;
use crate::swap_policy::{parse_swap_sequence, SwapSpec};
use crate::{NodeId, PathId, QChannelId, ReqId, Result, SimError};

/// How buffer-space qubit allocation is computed for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QubitAllocation {
    /// Allocate the lowest memory capacity along the path to every hop.
    MinCapacity,
    /// Emit `(0, 0)` per hop: each node uses all the qubits assigned to the
    /// channel toward its neighbor.
    #[default]
    FollowQchannel,
    /// No pre-allocation; the path runs under statistical multiplexing.
    Disabled,
}

/// An explicitly specified route.
#[derive(Debug, Clone)]
pub struct StaticPath {
    pub route: Vec<String>,
    pub swap: SwapSpec,
    pub purif: BTreeMap<String, u32>,
    pub qubit_allocation: QubitAllocation,
    pub req_id: Option<ReqId>,
}

impl StaticPath {
    pub fn new<R, N>(route: R, swap: impl Into<SwapSpec>) -> Self
    where
        R: IntoIterator<Item = N>,
        N: Into<String>,
    {
        Self {
            route: route.into_iter().map(Into::into).collect(),
            swap: swap.into(),
            purif: BTreeMap::new(),
            qubit_allocation: QubitAllocation::default(),
            req_id: None,
        }
    }

    #[must_use]
    pub fn with_purif(mut self, segment: &str, rounds: u32) -> Self {
        self.purif.insert(segment.to_string(), rounds);
        self
    }

    #[must_use]
    pub fn with_allocation(mut self, qubit_allocation: QubitAllocation) -> Self {
        self.qubit_allocation = qubit_allocation;
        self
    }

    #[must_use]
    pub fn with_req_id(mut self, req_id: ReqId) -> Self {
        self.req_id = Some(req_id);
        self
    }
}

/// One source-destination pair routed over the best path.
#[derive(Debug, Clone)]
pub struct SinglePath {
    pub src: String,
    pub dst: String,
    pub swap: SwapSpec,
    pub purif: BTreeMap<String, u32>,
    pub qubit_allocation: QubitAllocation,
    pub req_id: Option<ReqId>,
}

impl SinglePath {
    pub fn new(src: &str, dst: &str, swap: impl Into<SwapSpec>) -> Self {
        Self {
            src: src.to_string(),
            dst: dst.to_string(),
            swap: swap.into(),
            purif: BTreeMap::new(),
            qubit_allocation: QubitAllocation::default(),
            req_id: None,
        }
    }

    #[must_use]
    pub fn with_allocation(mut self, qubit_allocation: QubitAllocation) -> Self {
        self.qubit_allocation = qubit_allocation;
        self
    }
}

/// One source-destination pair routed over every path the routing algorithm
/// returns. Paths sharing a channel split its qubits evenly.
#[derive(Debug, Clone)]
pub struct MultiPath {
    pub src: String,
    pub dst: String,
    pub swap: SwapSpec,
}

impl MultiPath {
    pub fn new(src: &str, dst: &str, swap: impl Into<SwapSpec>) -> Self {
        Self {
            src: src.to_string(),
            dst: dst.to_string(),
            swap: swap.into(),
        }
    }
}

/// A path installation request.
#[derive(Debug, Clone)]
pub enum RoutingPath {
    Static(StaticPath),
    Single(SinglePath),
    Multi(MultiPath),
}

impl Network {
    /// Install a path (or set of paths) on the nodes of its route.
    pub fn install_path(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        path: RoutingPath,
    ) -> Result<Vec<PathId>> {
        let ctrl = self.controller.ok_or(SimError::NoController)?;
        match path {
            RoutingPath::Static(p) => {
                let req_id = p.req_id.unwrap_or_else(|| self.alloc_req_id());
                let (m_v, mux) = self.ctrl_resolve_allocation(&p.route, p.qubit_allocation)?;
                let id =
                    self.ctrl_install_one(sim, ctrl, req_id, p.route, &p.swap, p.purif, m_v, mux)?;
                Ok(vec![id])
            }
            RoutingPath::Single(p) => {
                self.build_route()?;
                let src = self.node_id(&p.src)?;
                let dst = self.node_id(&p.dst)?;
                let results = self.query_route(src, dst)?;
                let Some((_, _, best)) = results.first() else {
                    return Err(SimError::NoRoute(p.src.clone(), p.dst.clone()));
                };
                let route: Vec<String> =
                    best.iter().map(|id| self.name_of(*id).to_string()).collect();
                debug!(?route, "computed path");
                let req_id = p.req_id.unwrap_or_else(|| self.alloc_req_id());
                let (m_v, mux) = self.ctrl_resolve_allocation(&route, p.qubit_allocation)?;
                let id =
                    self.ctrl_install_one(sim, ctrl, req_id, route, &p.swap, p.purif, m_v, mux)?;
                Ok(vec![id])
            }
            RoutingPath::Multi(p) => {
                self.build_route()?;
                let src = self.node_id(&p.src)?;
                let dst = self.node_id(&p.dst)?;
                let results = self.query_route(src, dst)?;
                if results.is_empty() {
                    return Err(SimError::NoRoute(p.src.clone(), p.dst.clone()));
                }
                let routes: Vec<Vec<String>> = results
                    .iter()
                    .map(|(_, _, nodes)| {
                        nodes.iter().map(|id| self.name_of(*id).to_string()).collect()
                    })
                    .collect();

                // count how many chosen paths cross each channel
                let mut share: BTreeMap<QChannelId, u32> = BTreeMap::new();
                for route in &routes {
                    for ch in self.ctrl_route_channels(route)? {
                        *share.entry(ch).or_insert(0) += 1;
                    }
                }

                let req_id = self.alloc_req_id();
                let mut ids = Vec::new();
                for route in routes {
                    debug!(?route, "computed path");
                    let m_v = self.ctrl_m_v_shared(&route, &share)?;
                    let id = self.ctrl_install_one(
                        sim,
                        ctrl,
                        req_id,
                        route,
                        &p.swap,
                        BTreeMap::new(),
                        Some(m_v),
                        MultiplexingMode::BufferSpace,
                    )?;
                    ids.push(id);
                }
                Ok(ids)
            }
        }
    }

    fn alloc_req_id(&mut self) -> ReqId {
        let id = ReqId(self.next_req_id);
        self.next_req_id += 1;
        id
    }

    fn ctrl_resolve_allocation(
        &self,
        route: &[String],
        alloc: QubitAllocation,
    ) -> Result<(Option<MultiplexingVector>, MultiplexingMode)> {
        Ok(match alloc {
            QubitAllocation::Disabled => (None, MultiplexingMode::Statistical),
            QubitAllocation::MinCapacity => (
                Some(self.ctrl_m_v_min_cap(route)?),
                MultiplexingMode::BufferSpace,
            ),
            QubitAllocation::FollowQchannel => (
                Some(vec![(0, 0); route.len().saturating_sub(1)]),
                MultiplexingMode::BufferSpace,
            ),
        })
    }

    /// Per-hop allocation from the lowest memory capacity along the path.
    /// End nodes serve one hop only, so their capacity counts double.
    fn ctrl_m_v_min_cap(&self, route: &[String]) -> Result<MultiplexingVector> {
        let mut capacities = Vec::with_capacity(route.len());
        for name in route {
            let id = self.node_id(name)?;
            capacities.push(self.node(id).memory.capacity() as u32);
        }
        if let Some(first) = capacities.first_mut() {
            *first *= 2;
        }
        if let Some(last) = capacities.last_mut() {
            *last *= 2;
        }
        let q = capacities.iter().min().copied().unwrap_or(0) / 2;
        Ok(vec![(q, q); route.len().saturating_sub(1)])
    }

    /// Per-hop allocation dividing each channel's assigned qubits evenly
    /// among the paths crossing it.
    fn ctrl_m_v_shared(
        &self,
        route: &[String],
        share: &BTreeMap<QChannelId, u32>,
    ) -> Result<MultiplexingVector> {
        let mut m_v = Vec::with_capacity(route.len().saturating_sub(1));
        for window in route.windows(2) {
            let a = self.node_id(&window[0])?;
            let b = self.node_id(&window[1])?;
            let ch = self
                .qchannel_between(a, b)
                .ok_or_else(|| SimError::QChannelNotFound(window[0].clone(), window[1].clone()))?;
            let shared = share.get(&ch).copied().unwrap_or(1).max(1);
            let qubits_a = self.node(a).memory.channel_slots(ch).count() as u32 / shared;
            let qubits_b = self.node(b).memory.channel_slots(ch).count() as u32 / shared;
            m_v.push((qubits_a, qubits_b));
        }
        Ok(m_v)
    }

    fn ctrl_route_channels(&self, route: &[String]) -> Result<Vec<QChannelId>> {
        let mut channels = Vec::with_capacity(route.len().saturating_sub(1));
        for window in route.windows(2) {
            let a = self.node_id(&window[0])?;
            let b = self.node_id(&window[1])?;
            channels.push(
                self.qchannel_between(a, b).ok_or_else(|| {
                    SimError::QChannelNotFound(window[0].clone(), window[1].clone())
                })?,
            );
        }
        Ok(channels)
    }

    /// Validate one path and send its instructions to every route node.
    #[allow(clippy::too_many_arguments)]
    fn ctrl_install_one(
        &mut self,
        sim: &mut Simulator<NetEvent>,
        ctrl: NodeId,
        req_id: ReqId,
        route: Vec<String>,
        swap_spec: &SwapSpec,
        purif: BTreeMap<String, u32>,
        m_v: Option<MultiplexingVector>,
        mux: MultiplexingMode,
    ) -> Result<PathId> {
        let swap = parse_swap_sequence(swap_spec, route.len())?;

        let instructions = PathInstructions {
            req_id,
            route: route.clone(),
            swap,
            m_v,
            purif,
            mux,
        };
        validate_path_instructions(&instructions)?;
        if mux == MultiplexingMode::Statistical {
            validate_statistical(&instructions)?;
        }

        // every hop needs both a quantum and a classical channel
        for window in route.windows(2) {
            let a = self.node_id(&window[0])?;
            let b = self.node_id(&window[1])?;
            if self.qchannel_between(a, b).is_none() {
                return Err(SimError::QChannelNotFound(
                    window[0].clone(),
                    window[1].clone(),
                ));
            }
            if self.cchannel_between(a, b).is_none() {
                return Err(SimError::CChannelNotFound(
                    window[0].clone(),
                    window[1].clone(),
                ));
            }
        }

        let path_id = PathId(self.next_path_id);
        self.next_path_id += 1;

        info!(
            path = %path_id,
            req = %req_id,
            ?route,
            swap = ?instructions.swap,
            "installing path"
        );
        for name in &route {
            let dest = self.node_id(name)?;
            let cch = self
                .cchannel_between(ctrl, dest)
                .ok_or_else(|| SimError::CChannelNotFound("ctrl".into(), name.clone()))?;
            let packet = ClassicPacket {
                msg: SignalingMsg::InstallPath {
                    path_id,
                    instructions: instructions.clone(),
                },
                src: None,
                dest,
            };
            self.send_classic(sim, cch, packet, dest);
        }
        Ok(path_id)
    }
}

/// Statistical paths must use the plain `[1, 0, .., 0, 1]` swap shape and no
/// purification.
fn validate_statistical(instructions: &PathInstructions) -> Result<()> {
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
