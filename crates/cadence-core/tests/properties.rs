//! Property-based tests for cadence-core graph snapshots and timebase arbitration.
//!
//! Uses proptest to build random topologies and random claim sequences.

use cadence_core::{GraphManager, PortDirection, PortId, RefNum, Transport};
use proptest::prelude::*;

const CLIENTS: u32 = 4;
const PORTS_PER_SIDE: u32 = 3;

/// Registers `CLIENTS` clients, each with `PORTS_PER_SIDE` outputs and inputs.
fn build_graph() -> (GraphManager, Vec<PortId>, Vec<PortId>) {
    let graph = GraphManager::new(32);
    let mut outputs = Vec::new();
    let mut inputs = Vec::new();
    for c in 0..CLIENTS {
        let owner = RefNum::new(c);
        for p in 0..PORTS_PER_SIDE {
            outputs.push(
                graph
                    .allocate_port(owner, &format!("c{c}:out{p}"), PortDirection::Output, false)
                    .unwrap(),
            );
            inputs.push(
                graph
                    .allocate_port(owner, &format!("c{c}:in{p}"), PortDirection::Input, false)
                    .unwrap(),
            );
        }
    }
    (graph, outputs, inputs)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Save, disconnect one client, restore: the edge set matches the one
    /// present before the save.
    #[test]
    fn restore_reproduces_saved_topology(
        edges in prop::collection::vec((0usize..12, 0usize..12), 0..40),
        victim in 0u32..CLIENTS,
    ) {
        let (graph, outputs, inputs) = build_graph();
        for (o, i) in edges {
            // Duplicates are rejected; that is fine here.
            let _ = graph.connect(outputs[o], inputs[i]);
        }
        let before = graph.connections();
        let ports_before = graph.port_count();

        let snapshot = graph.save();
        graph.disconnect_all_ports(RefNum::new(victim));
        prop_assert!(graph.connection_count() <= before.len());

        let restored = graph.restore(snapshot);
        prop_assert_eq!(restored, before.len());
        prop_assert_eq!(graph.connections(), before);
        prop_assert_eq!(graph.port_count(), ports_before);
    }

    /// Disconnecting a client leaves no connection touching its ports.
    #[test]
    fn disconnect_all_ports_removes_every_owned_edge(
        edges in prop::collection::vec((0usize..12, 0usize..12), 0..40),
        victim in 0u32..CLIENTS,
    ) {
        let (graph, outputs, inputs) = build_graph();
        for (o, i) in edges {
            let _ = graph.connect(outputs[o], inputs[i]);
        }
        graph.disconnect_all_ports(RefNum::new(victim));
        let owned: Vec<PortId> = graph
            .ports_of(RefNum::new(victim))
            .into_iter()
            .map(|p| p.id)
            .collect();
        for c in graph.connections() {
            prop_assert!(!owned.contains(&c.src) && !owned.contains(&c.dst));
        }
    }

    /// After any sequence of claims, the holder is the last unconditional
    /// claimer, or the first conditional claimer when the timebase was free.
    #[test]
    fn timebase_has_at_most_one_holder(
        claims in prop::collection::vec((0u32..6, any::<bool>()), 1..30),
    ) {
        let mut transport = Transport::new();
        let mut expected: Option<RefNum> = None;
        for (client, conditional) in claims {
            let refnum = RefNum::new(client);
            let result = transport.set_timebase_master(refnum, conditional);
            match expected {
                Some(holder) if conditional && holder != refnum => {
                    prop_assert!(result.is_err());
                }
                _ => {
                    prop_assert!(result.is_ok());
                    expected = Some(refnum);
                }
            }
            prop_assert_eq!(transport.timebase_master(), expected);
        }
    }
}
