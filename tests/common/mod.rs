//! Shared topology builders for the integration suites.
//!
//! All networks use 100 km fibers (0.5 ms one-way delay), lossless optics so
//! a heralded attempt succeeds with probability 1/2, pairs born at fidelity
//! 0.90, and memories with a 5 s coherence window.

#![allow(dead_code)]

use quantum_repeater_sim::channel::ChannelConfig;
use quantum_repeater_sim::delay::DelayModel;
use quantum_repeater_sim::forwarder::ForwarderConfig;
use quantum_repeater_sim::link_layer::LinkLayerConfig;
use quantum_repeater_sim::mux::MuxKind;
use quantum_repeater_sim::network::{
    ControllerConfig, Network, NetworkConfig, NodeConfig, TimingMode,
};

pub const INIT_FIDELITY: f64 = 0.90;
pub const FIBER_KM: f64 = 100.0;
pub const TAU: f64 = 0.0005;

pub fn qchannel_cfg() -> ChannelConfig {
    ChannelConfig {
        length: FIBER_KM,
        delay: DelayModel::Constant(TAU),
        ..Default::default()
    }
}

pub fn cchannel_cfg() -> ChannelConfig {
    ChannelConfig {
        length: FIBER_KM,
        delay: DelayModel::Constant(TAU),
        ..Default::default()
    }
}

pub fn link_cfg() -> LinkLayerConfig {
    LinkLayerConfig {
        alpha_db_per_km: 0.0,
        init_fidelity: INIT_FIDELITY,
        ..Default::default()
    }
}

pub fn node_cfg(memory_capacity: usize, ps: f64, mux: MuxKind) -> NodeConfig {
    NodeConfig {
        memory_capacity,
        memory_decoherence_rate: 1.0 / 5.0,
        link: link_cfg(),
        forwarder: ForwarderConfig {
            ps,
            mux,
            isolate_paths: true,
        },
    }
}

pub struct LinearOpts {
    pub qchannel_capacity: usize,
    pub ps: f64,
    pub mux: MuxKind,
    pub seed: u64,
    pub timing: TimingMode,
    pub memory_decoherence_rate: f64,
}

impl Default for LinearOpts {
    fn default() -> Self {
        Self {
            qchannel_capacity: 1,
            ps: 0.5,
            mux: MuxKind::BufferSpace,
            seed: 7,
            timing: TimingMode::Async,
            memory_decoherence_rate: 1.0 / 5.0,
        }
    }
}

/// A chain `n1 - n2 - .. - nN` with quantum and classical channels between
/// neighbors and a controller wired to every node.
pub fn build_linear(n_nodes: usize, opts: &LinearOpts) -> Network {
    let mut net = Network::new(NetworkConfig {
        timing: Some(opts.timing),
        seed: Some(opts.seed),
    });

    let mut cfg = node_cfg(2 * opts.qchannel_capacity, opts.ps, opts.mux);
    cfg.memory_decoherence_rate = opts.memory_decoherence_rate;

    let ids: Vec<_> = (1..=n_nodes)
        .map(|i| net.add_node(&format!("n{i}"), cfg.clone()))
        .collect();
    for pair in ids.windows(2) {
        net.add_qchannel(pair[0], pair[1], qchannel_cfg()).unwrap();
        net.add_cchannel(pair[0], pair[1], cchannel_cfg()).unwrap();
    }
    net.assign_memory_qubits(opts.qchannel_capacity);
    net.add_controller(
        "ctrl",
        ControllerConfig {
            cchannel: cchannel_cfg(),
        },
    )
    .unwrap();
    net
}

/// The 2x2 grid
/// ```text
///     n1---n2
///     |     |
///     n3---n4
/// ```
/// with two node-disjoint routes n1-n2-n4 and n1-n3-n4.
pub fn build_grid(qchannel_capacity: usize, ps: f64, seed: u64) -> Network {
    let mut net = Network::new(NetworkConfig {
        timing: Some(TimingMode::Async),
        seed: Some(seed),
    });
    let cfg = node_cfg(2 * qchannel_capacity, ps, MuxKind::BufferSpace);
    let n1 = net.add_node("n1", cfg.clone());
    let n2 = net.add_node("n2", cfg.clone());
    let n3 = net.add_node("n3", cfg.clone());
    let n4 = net.add_node("n4", cfg);
    for (a, b) in [(n1, n2), (n1, n3), (n2, n4), (n3, n4)] {
        net.add_qchannel(a, b, qchannel_cfg()).unwrap();
        net.add_cchannel(a, b, cchannel_cfg()).unwrap();
    }
    net.assign_memory_qubits(qchannel_capacity);
    net.add_controller(
        "ctrl",
        ControllerConfig {
            cchannel: cchannel_cfg(),
        },
    )
    .unwrap();
    net
}
