//! End-to-end scenarios for the proactive forwarding stack.
//!
//! Every scenario runs seed-deterministically for 10 simulated seconds over
//! 100 km hops (0.5 ms fiber delay). With lossless optics a heralded attempt
//! succeeds with probability 1/2, so one generation cycle (reservation
//! handshake, skip-ahead success, notification) takes 6.25 ms on average and
//! each channel produces on the order of 1600 elementary pairs per side.

mod common;

use common::{build_grid, build_linear, LinearOpts};
use quantum_repeater_sim::controller::{
    MultiPath, QubitAllocation, RoutingPath, SinglePath, StaticPath,
};
use quantum_repeater_sim::forwarder::ForwarderCounters;
use quantum_repeater_sim::mux::MuxKind;
use quantum_repeater_sim::network::{Network, RouteAlgorithm, TimingMode};
use quantum_repeater_sim::simulator::Simulator;
use quantum_repeater_sim::{NodeId, ReqId};

/// Routing stub answering queries from a fixed route table (the core consumes
/// the query interface; real algorithms live outside it).
struct TableRoutes(Vec<Vec<&'static str>>);

impl RouteAlgorithm for TableRoutes {
    fn build(&mut self, _net: &Network) {}

    fn query(&self, net: &Network, src: NodeId, dst: NodeId) -> Vec<(f64, NodeId, Vec<NodeId>)> {
        self.0
            .iter()
            .filter_map(|route| {
                let ids: Vec<NodeId> = route.iter().map(|n| net.node_id(n).unwrap()).collect();
                (ids.first() == Some(&src) && ids.last() == Some(&dst))
                    .then(|| ((ids.len() - 1) as f64, ids[1], ids))
            })
            .collect()
    }
}

fn run_with_paths(net: &mut Network, end: f64, paths: Vec<RoutingPath>) {
    let mut sim = Simulator::new(0.0, end);
    net.install(&mut sim).unwrap();
    for path in paths {
        net.install_path(&mut sim, path).unwrap();
    }
    sim.run(net);
}

fn counters(net: &Network, name: &str) -> ForwarderCounters {
    net.counters(name).unwrap().clone()
}

fn close(a: u64, b: u64, tolerance: u64) -> bool {
    a.abs_diff(b) <= tolerance
}

#[test]
fn no_swap_isolated_links() {
    let mut net = build_linear(3, &LinearOpts::default());
    run_with_paths(
        &mut net,
        10.0,
        vec![RoutingPath::Static(StaticPath::new(
            ["n1", "n2", "n3"],
            [0, 0, 0],
        ))],
    );

    let f1 = counters(&net, "n1");
    let f2 = counters(&net, "n2");
    let f3 = counters(&net, "n3");

    // every elementary pair is consumed where it was produced
    for f in [&f1, &f2, &f3] {
        assert_eq!(f.n_entg, f.n_eligible);
        assert_eq!(f.n_entg, f.n_consumed);
        assert_eq!(f.n_swapped(), 0);
        assert!(f.n_purif.is_empty());
        let avg = f.consumed_avg_fidelity();
        assert!((0.88..=0.901).contains(&avg), "avg fidelity {avg}");
    }

    // one generation cycle takes about 6.25 ms per channel side
    assert!((1400..=1800).contains(&f1.n_entg), "n1 n_entg {}", f1.n_entg);
    assert!((1400..=1800).contains(&f3.n_entg), "n3 n_entg {}", f3.n_entg);
    assert!(
        close(f2.n_consumed, f1.n_consumed + f3.n_consumed, 4),
        "center consumed {} vs side sum {}",
        f2.n_consumed,
        f1.n_consumed + f3.n_consumed
    );
}

#[test]
fn swap_one_repeater() {
    let mut net = build_linear(3, &LinearOpts::default());
    run_with_paths(
        &mut net,
        10.0,
        vec![RoutingPath::Static(StaticPath::new(
            ["n1", "n2", "n3"],
            [1, 0, 1],
        ))],
    );

    let f1 = counters(&net, "n1");
    let f2 = counters(&net, "n2");
    let f3 = counters(&net, "n3");

    // entanglements at the repeater are immediately eligible (no purification)
    assert!(close(f1.n_entg + f3.n_entg, f2.n_entg, 4));
    assert_eq!(f2.n_entg, f2.n_eligible);
    // only eligible qubits may swap, with 50% success
    assert!(f2.n_swapped() > 0);
    assert!(f2.n_swapped() <= (f2.n_eligible as f64 * 0.7) as u64);
    // no swapping at the ends
    assert_eq!(f1.n_swapped(), 0);
    assert_eq!(f3.n_swapped(), 0);
    // each successful swap yields one eligible end-to-end pair at each end,
    // up to in-flight updates at the end of the run
    assert!(f2.n_swapped() >= f1.n_eligible);
    assert!(f1.n_eligible + 2 >= f2.n_swapped());
    assert!(close(f1.n_eligible, f3.n_eligible, 2));
    // eligible end pairs are consumed on the spot
    assert_eq!(f1.n_eligible, f1.n_consumed);
    assert_eq!(f3.n_eligible, f3.n_consumed);
    assert!(f1.n_consumed >= 300, "consumed {}", f1.n_consumed);
    assert_eq!(f2.n_consumed, 0);

    // one swap of two 0.90 pairs lands around 0.81
    let avg1 = f1.consumed_avg_fidelity();
    let avg3 = f3.consumed_avg_fidelity();
    assert!((0.78..=0.84).contains(&avg1), "avg fidelity {avg1}");
    assert!((avg1 - avg3).abs() < 0.01);
}

#[test]
fn swap_two_repeaters_in_parallel() {
    let mut net = build_linear(4, &LinearOpts::default());
    run_with_paths(
        &mut net,
        10.0,
        vec![RoutingPath::Static(StaticPath::new(
            ["n1", "n2", "n3", "n4"],
            [1, 0, 0, 1],
        ))],
    );

    let f1 = counters(&net, "n1");
    let f2 = counters(&net, "n2");
    let f3 = counters(&net, "n3");
    let f4 = counters(&net, "n4");

    for f in [&f2, &f3] {
        assert_eq!(f.n_entg, f.n_eligible);
        assert!(f.n_entg > 1500, "repeater n_entg {}", f.n_entg);
        assert!(f.n_swapped() > 0);
        assert!(f.n_swapped() <= (f.n_eligible as f64 * 0.7) as u64);
    }
    // equal-rank repeaters must complete some swaps through parallel merging
    assert!(f2.n_swapped_p > 0, "n2 parallel swaps");
    assert!(f3.n_swapped_p > 0, "n3 parallel swaps");
    // a delivery needs both repeaters to succeed on the same chain
    assert!(f2.n_swapped().min(f3.n_swapped()) > f1.n_eligible);
    assert!(f1.n_eligible > 0);
    assert_eq!(f1.n_eligible, f1.n_consumed);
    assert_eq!(f4.n_eligible, f4.n_consumed);
    assert!(close(f1.n_consumed, f4.n_consumed, 2));
    assert!(f1.n_consumed >= 50, "consumed {}", f1.n_consumed);

    // three merged hops land around 0.74
    let avg1 = f1.consumed_avg_fidelity();
    let avg4 = f4.consumed_avg_fidelity();
    assert!((0.71..=0.77).contains(&avg1), "avg fidelity {avg1}");
    assert!((avg1 - avg4).abs() < 0.01);
}

#[test]
fn purif_one_round_per_link() {
    let mut net = build_linear(
        3,
        &LinearOpts {
            qchannel_capacity: 2,
            ..Default::default()
        },
    );
    run_with_paths(
        &mut net,
        10.0,
        vec![RoutingPath::Static(
            StaticPath::new(["n1", "n2", "n3"], [1, 0, 1])
                .with_purif("n1-n2", 1)
                .with_purif("n2-n3", 1),
        )],
    );

    let f1 = counters(&net, "n1");
    let f2 = counters(&net, "n2");
    let f3 = counters(&net, "n3");

    // a round consumes two pairs and sometimes fails
    for f in [&f1, &f2, &f3] {
        assert!(!f.n_purif.is_empty());
        assert!(f.n_purif[0] > 0);
        assert!(f.n_purif[0] < (f.n_entg as f64 * 0.8) as u64);
    }
    // each completed round is counted once at the repeater and once at the end
    assert!(close(f1.n_purif[0] + f3.n_purif[0], f2.n_purif[0], 4));
    assert!(close(f2.n_purif[0], f2.n_eligible, 4));
    assert!(f2.n_swapped() > 0);
    assert!(f2.n_swapped() <= (f2.n_eligible as f64 * 0.7) as u64);
    assert!(f2.n_swapped() >= f1.n_eligible);
    assert!(f1.n_eligible + 2 >= f2.n_swapped());
    assert_eq!(f1.n_eligible, f1.n_consumed);
    assert!(f1.n_consumed >= 200, "consumed {}", f1.n_consumed);

    // purified links make the swapped pair better than the raw swap
    let avg1 = f1.consumed_avg_fidelity();
    let avg3 = f3.consumed_avg_fidelity();
    assert!((0.82..=0.88).contains(&avg1), "avg fidelity {avg1}");
    assert!((avg1 - avg3).abs() < 0.01);
}

#[test]
fn purif_two_rounds_per_link() {
    let mut net = build_linear(
        3,
        &LinearOpts {
            qchannel_capacity: 4,
            ..Default::default()
        },
    );
    run_with_paths(
        &mut net,
        10.0,
        vec![RoutingPath::Static(
            StaticPath::new(["n1", "n2", "n3"], [1, 0, 1])
                .with_purif("n1-n2", 2)
                .with_purif("n2-n3", 2),
        )],
    );

    let f1 = counters(&net, "n1");
    let f2 = counters(&net, "n2");
    let f3 = counters(&net, "n3");

    for f in [&f1, &f2, &f3] {
        assert!(f.n_purif.len() >= 2);
        assert!(f.n_purif[0] < (f.n_entg as f64 * 0.8) as u64);
        assert!(f.n_purif[1] < (f.n_purif[0] as f64 * 0.8) as u64);
    }
    assert!(close(f1.n_purif[0] + f3.n_purif[0], f2.n_purif[0], 4));
    assert!(close(f1.n_purif[1] + f3.n_purif[1], f2.n_purif[1], 4));
    assert!(close(f2.n_purif[1], f2.n_eligible, 4));
    assert_eq!(f1.n_eligible, f1.n_consumed);
    assert!(f1.n_consumed >= 100, "consumed {}", f1.n_consumed);

    let avg1 = f1.consumed_avg_fidelity();
    assert!((0.86..=0.92).contains(&avg1), "avg fidelity {avg1}");
}

#[test]
fn purif_two_rounds_end_to_end() {
    let mut net = build_linear(
        3,
        &LinearOpts {
            qchannel_capacity: 4,
            ..Default::default()
        },
    );
    run_with_paths(
        &mut net,
        10.0,
        vec![RoutingPath::Static(
            StaticPath::new(["n1", "n2", "n3"], [1, 0, 1]).with_purif("n1-n3", 2),
        )],
    );

    let f1 = counters(&net, "n1");
    let f2 = counters(&net, "n2");
    let f3 = counters(&net, "n3");

    // purification happens only between the end nodes, after swapping
    assert!(f2.n_purif.is_empty());
    assert!(f1.n_purif.len() >= 2);
    assert!(close(f1.n_purif[0], f3.n_purif[0], 4));
    assert!(close(f1.n_purif[1], f3.n_purif[1], 4));
    assert!(f1.n_purif[0] > 0);
    assert!(f1.n_purif[0] < f2.n_swapped());
    assert!(f1.n_purif[1] < f1.n_purif[0]);
    assert_eq!(f1.n_eligible, f1.n_consumed);
    assert!(f1.n_consumed >= 50, "consumed {}", f1.n_consumed);

    let avg1 = f1.consumed_avg_fidelity();
    assert!((0.84..=0.91).contains(&avg1), "avg fidelity {avg1}");
}

#[test]
fn multipath_pair_of_disjoint_routes() {
    let mut net = build_grid(4, 0.5, 11);
    run_with_paths(
        &mut net,
        10.0,
        vec![
            RoutingPath::Static(
                StaticPath::new(["n1", "n2", "n4"], [1, 0, 1]).with_req_id(ReqId(0)),
            ),
            RoutingPath::Static(
                StaticPath::new(["n1", "n3", "n4"], [1, 0, 1]).with_req_id(ReqId(0)),
            ),
        ],
    );

    let f1 = counters(&net, "n1");
    let f2 = counters(&net, "n2");
    let f3 = counters(&net, "n3");
    let f4 = counters(&net, "n4");

    // both routes carry traffic
    assert!(f2.n_swapped_s > 500, "n2 swaps {}", f2.n_swapped_s);
    assert!(f3.n_swapped_s > 500, "n3 swaps {}", f3.n_swapped_s);
    assert!(close(f1.n_consumed, f4.n_consumed, 4));
    assert!(f1.n_consumed > 1000, "consumed {}", f1.n_consumed);
    // every delivery stems from exactly one swap on one of the routes
    assert!(f1.n_consumed <= f2.n_swapped_s + f3.n_swapped_s);
    assert!(f2.n_swapped_s + f3.n_swapped_s <= f1.n_consumed + 4);
}

#[test]
fn statistical_multiplexing_chain() {
    let mut net = build_linear(
        3,
        &LinearOpts {
            mux: MuxKind::Statistical,
            ..Default::default()
        },
    );
    run_with_paths(
        &mut net,
        10.0,
        vec![RoutingPath::Static(
            StaticPath::new(["n1", "n2", "n3"], [1, 0, 1])
                .with_allocation(QubitAllocation::Disabled),
        )],
    );

    let f1 = counters(&net, "n1");
    let f2 = counters(&net, "n2");
    let f3 = counters(&net, "n3");

    assert!(f2.n_swapped_s > 0);
    assert!(f1.n_consumed > 0);
    assert!(close(f1.n_consumed, f3.n_consumed, 2));
    assert_eq!(f2.n_consumed, 0);
    let avg1 = f1.consumed_avg_fidelity();
    assert!((0.78..=0.84).contains(&avg1), "avg fidelity {avg1}");
}

#[test]
fn certain_swapping_without_decoherence() {
    let mut net = build_linear(
        3,
        &LinearOpts {
            ps: 1.0,
            memory_decoherence_rate: 0.0,
            ..Default::default()
        },
    );
    run_with_paths(
        &mut net,
        10.0,
        vec![RoutingPath::Static(StaticPath::new(
            ["n1", "n2", "n3"],
            [1, 0, 1],
        ))],
    );

    let f1 = counters(&net, "n1");
    let f2 = counters(&net, "n2");
    let f3 = counters(&net, "n3");

    // every eligible pairing swaps and every swap is delivered
    assert!(f2.n_swapped_s > 0);
    assert_eq!(f2.n_swapped_p, 0);
    assert!(close(f2.n_swapped_s, f1.n_consumed, 2));
    assert!(close(f1.n_consumed, f3.n_consumed, 2));
    // each delivery cycle waits for the slower of the two geometric legs
    // plus one round trip of signaling: roughly 8.6 ms
    assert!((1000..=1350).contains(&f1.n_entg), "n1 n_entg {}", f1.n_entg);
}

#[test]
fn seed_determinism() {
    let run_once = |seed: u64| {
        let mut net = build_linear(
            3,
            &LinearOpts {
                seed,
                ..Default::default()
            },
        );
        run_with_paths(
            &mut net,
            5.0,
            vec![RoutingPath::Static(StaticPath::new(
                ["n1", "n2", "n3"],
                [1, 0, 1],
            ))],
        );
        (
            counters(&net, "n1"),
            counters(&net, "n2"),
            counters(&net, "n3"),
        )
    };

    let a = run_once(42);
    let b = run_once(42);
    assert_eq!(a, b, "same seed must reproduce counters and fidelities");

    let c = run_once(43);
    assert_ne!(
        (a.0.n_entg, a.1.n_swapped()),
        (c.0.n_entg, c.1.n_swapped()),
        "different seeds should diverge"
    );
}

#[test]
fn lsync_slotted_generation() {
    let mut net = build_linear(
        3,
        &LinearOpts {
            timing: TimingMode::LSync { t_slot: 0.1 },
            ..Default::default()
        },
    );
    run_with_paths(
        &mut net,
        10.0,
        vec![RoutingPath::Static(StaticPath::new(
            ["n1", "n2", "n3"],
            [0, 0, 0],
        ))],
    );

    let f1 = counters(&net, "n1");
    let f2 = counters(&net, "n2");
    let f3 = counters(&net, "n3");

    // one generation per slot per channel side: about 100 in 10 s
    assert!((50..=120).contains(&f1.n_consumed), "consumed {}", f1.n_consumed);
    assert_eq!(f1.n_entg, f1.n_consumed);
    assert!(close(f2.n_consumed, f1.n_consumed + f3.n_consumed, 4));
    assert_eq!(f2.n_swapped(), 0);
}

#[test]
fn sync_phased_swapping() {
    let mut net = build_linear(
        3,
        &LinearOpts {
            timing: TimingMode::Sync {
                t_ext: 0.05,
                t_int: 0.05,
            },
            ..Default::default()
        },
    );
    run_with_paths(
        &mut net,
        10.0,
        vec![RoutingPath::Static(StaticPath::new(
            ["n1", "n2", "n3"],
            [1, 0, 1],
        ))],
    );

    let f1 = counters(&net, "n1");
    let f2 = counters(&net, "n2");
    let f3 = counters(&net, "n3");

    // generation happens in external phases, swapping in internal ones
    assert!(f2.n_entg > 0);
    assert!(f2.n_swapped() > 0);
    assert!(f1.n_consumed > 0);
    assert!(close(f1.n_consumed, f3.n_consumed, 2));
    assert_eq!(f2.n_consumed, 0);
}

#[test]
fn single_path_uses_the_routing_query() {
    let mut net = build_linear(3, &LinearOpts::default());
    net.set_route_algorithm(Box::new(TableRoutes(vec![vec!["n1", "n2", "n3"]])));
    run_with_paths(
        &mut net,
        10.0,
        vec![RoutingPath::Single(SinglePath::new("n1", "n3", [1, 0, 1]))],
    );

    let f1 = counters(&net, "n1");
    let f2 = counters(&net, "n2");
    assert!(f2.n_swapped() > 0);
    assert!(f1.n_consumed > 0);

    // querying a pair without a route is a configuration error
    let mut net = build_linear(3, &LinearOpts::default());
    net.set_route_algorithm(Box::new(TableRoutes(vec![])));
    let mut sim = Simulator::new(0.0, 1.0);
    net.install(&mut sim).unwrap();
    let err = net
        .install_path(
            &mut sim,
            RoutingPath::Single(SinglePath::new("n1", "n3", [1, 0, 1])),
        )
        .unwrap_err();
    assert!(matches!(err, quantum_repeater_sim::SimError::NoRoute(_, _)));
}

#[test]
fn multi_path_installs_every_returned_route() {
    let mut net = build_grid(4, 0.5, 13);
    net.set_route_algorithm(Box::new(TableRoutes(vec![
        vec!["n1", "n2", "n4"],
        vec!["n1", "n3", "n4"],
    ])));
    run_with_paths(
        &mut net,
        10.0,
        vec![RoutingPath::Multi(MultiPath::new("n1", "n4", "swap_1"))],
    );

    let f1 = counters(&net, "n1");
    let f2 = counters(&net, "n2");
    let f3 = counters(&net, "n3");
    let f4 = counters(&net, "n4");

    assert!(f2.n_swapped_s > 0);
    assert!(f3.n_swapped_s > 0);
    assert!(close(f1.n_consumed, f4.n_consumed, 4));
    assert!(f1.n_consumed > 0);
}

#[test]
fn controller_rejects_malformed_paths() {
    let mut net = build_linear(3, &LinearOpts::default());
    let mut sim = Simulator::new(0.0, 1.0);
    net.install(&mut sim).unwrap();

    // swap length mismatch
    let err = net
        .install_path(
            &mut sim,
            RoutingPath::Static(StaticPath::new(["n1", "n2", "n3"], [1, 0, 0, 1])),
        )
        .unwrap_err();
    assert!(matches!(err, quantum_repeater_sim::SimError::Configuration(_)));

    // reversed purification segment
    let err = net
        .install_path(
            &mut sim,
            RoutingPath::Static(
                StaticPath::new(["n1", "n2", "n3"], [1, 0, 1]).with_purif("n3-n1", 1),
            ),
        )
        .unwrap_err();
    assert!(matches!(err, quantum_repeater_sim::SimError::Configuration(_)));

    // unknown policy for the route length
    let err = net
        .install_path(
            &mut sim,
            RoutingPath::Static(StaticPath::new(["n1", "n2", "n3"], "zigzag")),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        quantum_repeater_sim::SimError::UnknownSwapPolicy(_, 3)
    ));

    // statistical paths cannot carry purification
    let err = net
        .install_path(
            &mut sim,
            RoutingPath::Static(
                StaticPath::new(["n1", "n2", "n3"], [1, 0, 1])
                    .with_purif("n1-n2", 1)
                    .with_allocation(QubitAllocation::Disabled),
            ),
        )
        .unwrap_err();
    assert!(matches!(err, quantum_repeater_sim::SimError::Configuration(_)));

    // a route hop without channels
    let err = net
        .install_path(
            &mut sim,
            RoutingPath::Static(StaticPath::new(["n1", "n3"], [0, 0])),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        quantum_repeater_sim::SimError::QChannelNotFound(_, _)
    ));
}
