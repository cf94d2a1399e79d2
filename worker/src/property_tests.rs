/*
 * Copyright 2026 The Quarry Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Scheduler invariants over randomly generated dependency graphs: the
//! graphs are DAGs by construction (edges only point at lower-numbered
//! nodes), realised as real derivations in a tempdir store.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    rc::Rc,
};

use petgraph::{
    graph::{Graph, NodeIndex},
    visit::{Dfs, Reversed},
    Direction,
};
use proptest::prelude::*;

use quarry_store::{BuildMode, Derivation, DerivationOutput, LocalStore, Store, StorePath};

use crate::{
    goal::{ExitCode, Goal, GoalPtr},
    settings::Settings,
    worker::Worker,
};

/// Decode an adjacency bitmask into a DAG: bit k of `edge_bits` decides
/// the k-th pair (i, j) with j < i, and an edge from i to j means "i
/// depends on j".
fn dag_from_bits(nodes: usize, edge_bits: u32) -> Graph<usize, ()> {
    let mut graph = Graph::new();
    let indices: Vec<NodeIndex> = (0..nodes).map(|i| graph.add_node(i)).collect();
    let mut bit = 0;
    for i in 0..nodes {
        for j in 0..i {
            if edge_bits & (1 << (bit % 32)) != 0 {
                graph.add_edge(indices[i], indices[j], ());
            }
            bit += 1;
        }
    }
    graph
}

struct DagFixture {
    _dir: tempfile::TempDir,
    store: Rc<LocalStore>,
    graph: Graph<usize, ()>,
    drv_paths: HashMap<NodeIndex, StorePath>,
    out_paths: HashMap<NodeIndex, StorePath>,
}

/// Registers one derivation per node, dependencies first, with `failing`
/// nodes getting a builder that exits non-zero.
fn realise_dag(graph: Graph<usize, ()>, failing: &[NodeIndex]) -> DagFixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Rc::new(LocalStore::open(dir.path()).unwrap());

    let order = petgraph::algo::toposort(&graph, None).expect("generated graphs are acyclic");
    let mut drv_paths: HashMap<NodeIndex, StorePath> = HashMap::new();
    let mut out_paths: HashMap<NodeIndex, StorePath> = HashMap::new();

    // Toposort yields dependents before dependencies here (edges point
    // at dependencies), so build the store records in reverse.
    for node in order.into_iter().rev() {
        let label = graph[node];
        let script = if failing.contains(&node) {
            "exit 1".to_owned()
        } else {
            ": > \"$out\"".to_owned()
        };
        let deps: Vec<(StorePath, StorePath)> = graph
            .neighbors_directed(node, Direction::Outgoing)
            .map(|dep| (drv_paths[&dep].clone(), out_paths[&dep].clone()))
            .collect();
        let (drv_path, out_path) = add_node_drv(&store, &format!("node{}", label), &script, &deps);
        drv_paths.insert(node, drv_path);
        out_paths.insert(node, out_path);
    }

    DagFixture {
        _dir: dir,
        store,
        graph,
        drv_paths,
        out_paths,
    }
}

/// One derivation per DAG node, depending on its neighbors' outputs.
fn add_node_drv(
    store: &LocalStore,
    name: &str,
    script: &str,
    deps: &[(StorePath, StorePath)],
) -> (StorePath, StorePath) {
    let out_path = StorePath::new(format!("{}-out", name)).unwrap();
    let mut env = BTreeMap::new();
    env.insert("PATH".to_owned(), "/usr/bin:/bin".to_owned());
    let mut input_drvs = BTreeMap::new();
    for (i, (drv_path, dep_out)) in deps.iter().enumerate() {
        env.insert(format!("dep{}", i), store.print_store_path(dep_out));
        let mut wanted = BTreeSet::new();
        wanted.insert("out".to_owned());
        input_drvs.insert(drv_path.clone(), wanted);
    }
    let mut outputs = BTreeMap::new();
    outputs.insert(
        "out".to_owned(),
        DerivationOutput {
            path: out_path.clone(),
            expected_hash: None,
        },
    );
    let drv = Derivation {
        name: name.to_owned(),
        builder: "/bin/sh".to_owned(),
        args: vec!["-c".to_owned(), script.to_owned()],
        env,
        outputs,
        input_drvs,
        input_srcs: BTreeSet::new(),
    };
    let drv_path = store.add_derivation(&drv).unwrap();
    (drv_path, out_path)
}

/// Nodes whose realisation transitively requires `failing` (the failing
/// node included).
fn dependents_of(graph: &Graph<usize, ()>, failing: NodeIndex) -> BTreeSet<NodeIndex> {
    let reversed = Reversed(graph);
    let mut dfs = Dfs::new(reversed, failing);
    let mut reached = BTreeSet::new();
    while let Some(node) = dfs.next(reversed) {
        reached.insert(node);
    }
    reached
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 8,
        .. ProptestConfig::default()
    })]

    /// Every DAG builds to completion: every goal ends
    /// terminal-successful, outputs are all valid, and the slot counter
    /// drains to zero without ever exceeding the bound.
    #[test]
    fn random_dags_build_to_completion(
        nodes in 2usize..6,
        edge_bits in any::<u32>(),
        jobs in 1u32..4,
    ) {
        let fixture = realise_dag(dag_from_bits(nodes, edge_bits), &[]);
        let mut worker = Worker::new(
            fixture.store.clone(),
            Settings { max_build_jobs: jobs, ..Settings::default() },
        );
        let goals: Vec<GoalPtr> = fixture
            .graph
            .node_indices()
            .map(|n| worker.make_derivation_goal(&fixture.drv_paths[&n], &BTreeSet::new(), BuildMode::Normal))
            .collect();

        worker.run(goals.clone()).unwrap();

        for goal in &goals {
            prop_assert_eq!(goal.borrow().exit_code(), ExitCode::Success);
        }
        for out in fixture.out_paths.values() {
            prop_assert!(fixture.store.is_valid_path(out));
        }
        prop_assert_eq!(worker.nr_local_builds(), 0);
        prop_assert!(worker.peak_local_builds() <= jobs);
        prop_assert!(!worker.permanent_failure());
    }

    /// With keep-going, one failing node fails exactly
    /// its transitive dependents; every other node still builds, and
    /// every top goal reaches a terminal state.
    #[test]
    fn keep_going_fails_exactly_the_dependents(
        nodes in 2usize..6,
        edge_bits in any::<u32>(),
        failing_pick in any::<u32>(),
    ) {
        let graph = dag_from_bits(nodes, edge_bits);
        let failing = NodeIndex::new(failing_pick as usize % nodes);
        let fixture = realise_dag(graph, &[failing]);
        let poisoned = dependents_of(&fixture.graph, failing);

        let mut worker = Worker::new(
            fixture.store.clone(),
            Settings { max_build_jobs: 2, keep_going: true, ..Settings::default() },
        );
        let goals: Vec<(petgraph::graph::NodeIndex, GoalPtr)> = fixture
            .graph
            .node_indices()
            .map(|n| {
                (
                    n,
                    worker.make_derivation_goal(
                        &fixture.drv_paths[&n],
                        &BTreeSet::new(),
                        BuildMode::Normal,
                    ),
                )
            })
            .collect();

        worker.run(goals.iter().map(|(_, g)| g.clone())).unwrap();

        prop_assert!(worker.permanent_failure());
        for (node, goal) in &goals {
            let code = goal.borrow().exit_code();
            prop_assert!(code != ExitCode::Busy, "every top goal must be terminal");
            if poisoned.contains(node) {
                prop_assert_eq!(code, ExitCode::Failed);
                prop_assert!(!fixture.store.is_valid_path(&fixture.out_paths[node]));
            } else {
                prop_assert_eq!(code, ExitCode::Success);
                prop_assert!(fixture.store.is_valid_path(&fixture.out_paths[node]));
            }
        }
    }
}
