//! C4: per-cluster DAG validation, cycle detection, and wave layering
//! (spec §4.4).

use crate::error::{Error, Result};
use crate::plan::{Plan, ReleaseId};
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use std::collections::{BTreeMap, HashMap};

/// `Unvalidated -> Validated -> Layered -> Finalized`, spec §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Unvalidated,
    Validated,
    Layered,
    Finalized,
}

pub struct DAGBuilder;

impl DAGBuilder {
    /// Validates edges, detects cycles, layers via Kahn's algorithm, and
    /// writes `ExecutionGroup`/`Plan.Order` in place.
    pub fn build(plan: &mut Plan) -> Result<()> {
        let clusters: Vec<String> = plan.clusters().cloned().collect();
        let mut order: Vec<ReleaseId> = Vec::new();

        for cluster in clusters {
            let ids: Vec<ReleaseId> = plan.cluster_nodes(&cluster).map(|n| n.id.clone()).collect();
            let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
            for id in &ids {
                graph.add_node(id.0.as_str());
            }

            // Edge set: dep -> dependent, from Needs ∪ inferred.name.
            for id in &ids {
                let node = plan.get(id).expect("id from cluster_nodes");
                for dep_name in node.all_needs() {
                    let Some(dep) = plan.find_in_cluster(&cluster, &dep_name) else {
                        return Err(Error::Config(format!(
                            "{} depends on {:?} which does not exist in cluster {:?}",
                            node.id, dep_name, cluster
                        )));
                    };
                    graph.add_edge(dep.id.0.as_str(), node.id.0.as_str(), ());
                }
            }

            detect_cycles(&graph)?;

            let waves = layer(&graph, plan, &cluster);
            for (wave_idx, wave) in waves.iter().enumerate() {
                for id in wave {
                    if let Some(node) = plan.get_mut(id) {
                        node.execution_group = Some(wave_idx as u32);
                    }
                }
                order.extend(wave.iter().cloned());
            }
        }

        plan.order = order;
        Ok(())
    }
}

fn detect_cycles(graph: &DiGraphMap<&str, ()>) -> Result<()> {
    for scc in tarjan_scc(graph) {
        let is_cycle = scc.len() > 1 || graph.contains_edge(scc[0], scc[0]);
        if is_cycle {
            let mut nodes: Vec<ReleaseId> = scc.iter().map(|s| ReleaseId(s.to_string())).collect();
            nodes.sort();
            return Err(Error::Cycle {
                detail: format!("cycle among {} node(s)", nodes.len()),
                nodes,
            });
        }
    }
    Ok(())
}

/// Kahn's algorithm with deterministic `(cluster, namespace, name)` tie-break
/// inside each wave.
fn layer(graph: &DiGraphMap<&str, ()>, plan: &Plan, cluster: &str) -> Vec<Vec<ReleaseId>> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    for node in graph.nodes() {
        indegree.insert(node, graph.neighbors_directed(node, petgraph::Direction::Incoming).count());
    }

    let tie_break = |id: &str| -> (String, String, String) {
        let n = plan.get(&ReleaseId(id.to_string())).expect("node exists");
        (n.cluster.clone(), n.namespace.clone(), n.name.clone())
    };

    let mut waves = Vec::new();
    let mut remaining: Vec<&str> = graph.nodes().collect();

    while !remaining.is_empty() {
        let mut ready: Vec<&str> = remaining
            .iter()
            .filter(|n| *indegree.get(*n).unwrap_or(&0) == 0)
            .copied()
            .collect();
        ready.sort_by_key(|n| tie_break(n));

        let mut wave_map: BTreeMap<(String, String, String), ReleaseId> = BTreeMap::new();
        for n in &ready {
            wave_map.insert(tie_break(n), ReleaseId(n.to_string()));
        }
        let wave: Vec<ReleaseId> = wave_map.into_values().collect();

        for n in &ready {
            for succ in graph.neighbors_directed(n, petgraph::Direction::Outgoing) {
                if let Some(d) = indegree.get_mut(succ) {
                    *d = d.saturating_sub(1);
                }
            }
        }
        remaining.retain(|n| !ready.contains(n));
        waves.push(wave);
    }

    let _ = cluster;
    waves
}
