//! # Quantum Repeater Sim
//!
//! A discrete-event simulator for end-to-end entanglement distribution over
//! networks of quantum repeaters connected by noisy, lossy fiber channels.
//!
//! ## Architecture Overview
//!
//! The crate is organized in three layers:
//!
//! ### Simulation kernel
//! - **Time & events**: integer-tick simulated time with configurable accuracy,
//!   comparable and cancellable events ordered by `(time, insertion sequence)`
//! - **Event pool**: binary min-heap with lazy cancellation
//! - **Simulator**: single-threaded dispatch loop with finite and continuous
//!   modes, per-event-type monitors, and a cooperative wall-clock timeout
//!
//! ### Entities
//! - **Quantum memory**: fixed-capacity slot array with a per-qubit state
//!   machine, scheduled decoherence, and path/channel allocation
//! - **Channels**: classical and quantum channels with bandwidth, buffer,
//!   drop-rate, and delay modeling
//! - **Werner pairs**: entangled-pair model with fidelity, swapping,
//!   purification, and store/transfer error models
//!
//! ### Protocol stack
//! - **Link layer**: elementary pair generation over one quantum channel at a
//!   time, using a classical reservation handshake and geometric skip-ahead
//!   sampling of the first successful heralded attempt
//! - **Proactive forwarder**: drives memory qubits through purification,
//!   sequential and parallel entanglement swapping, and consumption, keyed by
//!   per-path forwarding information (FIB) and a pluggable multiplexing scheme
//! - **Routing controller**: centralized install-time control plane that
//!   computes swap ranks and multiplexing vectors and installs per-path
//!   instructions on every node via classical messages
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quantum_repeater_sim::controller::{RoutingPath, StaticPath};
//! use quantum_repeater_sim::network::{Network, NetworkConfig, NodeConfig};
//! use quantum_repeater_sim::simulator::Simulator;
//!
//! fn main() -> quantum_repeater_sim::Result<()> {
//!     let mut net = Network::new(NetworkConfig::default());
//!     let cfg = NodeConfig::default();
//!     let n1 = net.add_node("n1", cfg.clone());
//!     let n2 = net.add_node("n2", cfg.clone());
//!     let n3 = net.add_node("n3", cfg);
//!     net.add_qchannel(n1, n2, Default::default())?;
//!     net.add_qchannel(n2, n3, Default::default())?;
//!     net.add_cchannel(n1, n2, Default::default())?;
//!     net.add_cchannel(n2, n3, Default::default())?;
//!     net.assign_memory_qubits(1);
//!     net.add_controller("ctrl", Default::default())?;
//!
//!     let mut simulator = Simulator::new(0.0, 10.0);
//!     net.install(&mut simulator)?;
//!     net.install_path(
//!         &mut simulator,
//!         RoutingPath::Static(StaticPath::new(["n1", "n2", "n3"], [1, 0, 1])),
//!     )?;
//!     simulator.run(&mut net);
//!     Ok(())
//! }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod channel;
pub mod controller;
pub mod delay;
pub mod epr;
pub mod event;
pub mod fib;
pub mod forwarder;
pub mod link_layer;
pub mod logging;
pub mod memory;
pub mod message;
pub mod mux;
pub mod network;
pub mod node;
pub mod pool;
pub mod rng;
pub mod simulator;
pub mod swap_policy;
pub mod time;
pub mod timeout;

/// Index of a quantum node in the network arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Index of a quantum channel in the network arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QChannelId(pub usize);

/// Index of a classical channel in the network arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CChannelId(pub usize);

/// Identifier of an installed end-to-end path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathId(pub u64);

/// Identifier of a source-destination request. Several paths may serve one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReqId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error type covering setup-time failures across the simulator.
///
/// Runtime losses (photon drops, decoherence, swap and purification failures)
/// are part of normal operation: they release local state, move counters, and
/// never surface as errors. Invariant violations inside the event loop panic,
/// since they indicate a bug rather than a recoverable condition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    /// Malformed setup: bad instruction shapes, invalid parameter combinations.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A node name was referenced that does not exist in the network.
    #[error("node {0} does not exist")]
    NodeNotFound(String),

    /// No classical channel connects the two named nodes.
    #[error("no classical channel between {0} and {1}")]
    CChannelNotFound(String, String),

    /// No quantum channel connects the two named nodes.
    #[error("no quantum channel between {0} and {1}")]
    QChannelNotFound(String, String),

    /// A channel send was addressed to a node outside the channel's endpoints.
    #[error("next hop {0} is not connected to channel {1}")]
    NextHopNotConnection(String, String),

    /// The routing algorithm returned no path for the requested pair.
    #[error("no route from {0} to {1}")]
    NoRoute(String, String),

    /// A named swap sequence or policy is not defined for the route length.
    #[error("swap sequence {0} undefined for {1} nodes")]
    UnknownSwapPolicy(String, usize),

    /// Entanglement generation cannot beat decoherence on this channel.
    #[error("channel {0} is too long for the memory coherence window")]
    ChannelTooLong(String),

    /// The network has no controller but a controller operation was requested.
    #[error("network does not have a controller")]
    NoController,

    /// The network has no routing algorithm but a route query was requested.
    #[error("network does not have a routing algorithm")]
    NoRouteAlgorithm,
}

/// Result type used by all fallible setup operations in this crate.
pub type Result<T> = std::result::Result<T, SimError>;
