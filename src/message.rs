//! Classical signaling messages.
//!
//! The wire format is a tagged union of the six message shapes exchanged by
//! the protocol stack: qubit reservation (link layer), path installation
//! (controller), and swap/purification signaling (forwarder). Messages are
//! addressed by node name; the packet destination drives hop-by-hop
//! forwarding along the installed route.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{PathId, ReqId, Result, SimError};

/// Qubit allocation per hop: `(qubits on the left node, qubits on the right node)`.
pub type MultiplexingVector = Vec<(u32, u32)>;

/// Which multiplexing scheme a path is installed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultiplexingMode {
    /// Pre-allocated memory qubits per path.
    #[serde(rename = "B")]
    BufferSpace,
    /// No pre-allocation; pairs carry candidate-path sets.
    #[serde(rename = "S")]
    Statistical,
}

/// Per-path routing instructions carried by `install_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathInstructions {
    pub req_id: ReqId,
    /// Node names in path order.
    pub route: Vec<String>,
    /// Swap rank per route node.
    pub swap: Vec<u32>,
    /// Multiplexing vector; one entry per hop. Only with buffer-space mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m_v: Option<MultiplexingVector>,
    /// Purification rounds per segment, keyed `"A-B"` with `A` before `B` in route.
    pub purif: BTreeMap<String, u32>,
    pub mux: MultiplexingMode,
}

/// Validate the shape of path instructions.
///
/// Checked before dispatch by the controller and again on receipt by each
/// forwarder: route and swap lengths must match and be nonempty, the
/// multiplexing vector must have one entry per hop, and every purification
/// segment must name two route nodes in path order.
pub fn validate_path_instructions(instructions: &PathInstructions) -> Result<()> {
    let route = &instructions.route;
    if route.len() != instructions.swap.len() || route.is_empty() {
        return Err(SimError::Configuration(
            "swapping order does not match route length".into(),
        ));
    }

    if let Some(m_v) = &instructions.m_v {
        if m_v.len() + 1 != route.len() {
            return Err(SimError::Configuration(
                "multiplexing vector does not match route length".into(),
            ));
        }
    }

    for segment in instructions.purif.keys() {
        if !check_purif_segment(route, segment) {
            return Err(SimError::Configuration(format!(
                "purif segment {segment} does not exist in route"
            )));
        }
    }

    Ok(())
}

/// Whether `"A-B"` names two route nodes with `A` strictly before `B`.
pub fn check_purif_segment(route: &[String], segment: &str) -> bool {
    let mut parts = segment.split('-');
    let (Some(a), Some(b), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    match (
        route.iter().position(|n| n == a),
        route.iter().position(|n| n == b),
    ) {
        (Some(ia), Some(ib)) => ia < ib,
        _ => false,
    }
}

/// Swap-update notification sent by a swapping node to both partners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapUpdateMsg {
    pub path_id: PathId,
    /// Node that performed (or failed) the swap.
    pub swapping_node: String,
    /// The recipient's new partner if the swap succeeded.
    pub partner: String,
    /// Name of the old pair shared with the swapping node.
    pub epr: String,
    /// Name of the merged pair; `None` means the swap failed.
    pub new_epr: Option<String>,
}

/// Purification solicitation from the segment primary to its partner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurifMsg {
    pub path_id: PathId,
    /// The soliciting (primary) node.
    pub purif_node: String,
    pub partner: String,
    /// Pair kept if the round succeeds.
    pub epr: String,
    /// Pair measured (consumed) by the round.
    pub measure_epr: String,
    pub round: u32,
}

/// Purification outcome reported back to the primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurifResponseMsg {
    #[serde(flatten)]
    pub purif: PurifMsg,
    pub result: bool,
}

/// The tagged union of all classical signaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum SignalingMsg {
    #[serde(rename = "RESERVE_QUBIT")]
    ReserveQubit {
        path_id: Option<PathId>,
        key: String,
    },
    #[serde(rename = "RESERVE_QUBIT_OK")]
    ReserveQubitOk {
        path_id: Option<PathId>,
        key: String,
    },
    #[serde(rename = "install_path")]
    InstallPath {
        path_id: PathId,
        instructions: PathInstructions,
    },
    #[serde(rename = "SWAP_UPDATE")]
    SwapUpdate(SwapUpdateMsg),
    #[serde(rename = "PURIF_SOLICIT")]
    PurifSolicit(PurifMsg),
    #[serde(rename = "PURIF_RESPONSE")]
    PurifResponse(PurifResponseMsg),
}
