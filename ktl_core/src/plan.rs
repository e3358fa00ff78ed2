//! Compiled plan: [`ResolvedRelease`] nodes plus the indices over them.
//!
//! Graph identities are plain data, not pointer graphs (spec §9): every edge
//! is a name resolved through [`Plan::ByID`]/[`Plan::ByCluster`], so snapshots
//! for the RunStore are a cheap clone of a flat `Vec`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Stable node identity: `<cluster>/<namespace>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReleaseId(pub String);

impl ReleaseId {
    pub fn new(cluster: &str, namespace: &str, name: &str) -> Self {
        ReleaseId(format!("{cluster}/{namespace}/{name}"))
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReasonType {
    Image,
    ServiceDns,
    ConfigMap,
    Secret,
    Volume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferredReason {
    #[serde(rename = "type")]
    pub kind: ReasonType,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferredNeed {
    pub name: ReleaseId,
    pub reasons: Vec<InferredReason>,
}

/// A compiled release node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedRelease {
    pub id: ReleaseId,
    pub name: String,
    pub cluster: String,
    pub chart: String,
    pub dir: PathBuf,
    pub namespace: String,
    pub values: Vec<PathBuf>,
    pub set: Vec<String>,
    pub tags: Vec<String>,
    pub needs: Vec<String>,
    #[serde(default)]
    pub inferred_needs: Vec<InferredNeed>,
    #[serde(default)]
    pub infer_error: Option<String>,
    /// Wave index, assigned by the DAGBuilder. `None` until layered.
    #[serde(default)]
    pub execution_group: Option<u32>,
    #[serde(default)]
    pub selected_by: Vec<String>,
}

impl ResolvedRelease {
    /// All dependency names this node declares or had inferred, deduped.
    pub fn all_needs(&self) -> Vec<String> {
        let mut out: Vec<String> = self.needs.clone();
        for need in &self.inferred_needs {
            // inferred needs store a full ReleaseId; keep just the bare name
            // for same-cluster edge resolution, matching `needs`.
            if let Some(name) = need.name.0.rsplit('/').next() {
                out.push(name.to_string());
            }
        }
        out.sort();
        out.dedup();
        out
    }
}

/// A compiled, selector-applied set of releases with rebuildable indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub stack_root: PathBuf,
    pub stack_name: String,
    pub profile: Option<String>,
    pub nodes: Vec<ResolvedRelease>,
    #[serde(default)]
    pub order: Vec<ReleaseId>,
    #[serde(skip)]
    by_id: BTreeMap<ReleaseId, usize>,
    #[serde(skip)]
    by_cluster: BTreeMap<String, Vec<usize>>,
}

impl Plan {
    pub fn new(stack_root: PathBuf, stack_name: String, profile: Option<String>, mut nodes: Vec<ResolvedRelease>) -> Self {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut plan = Plan {
            stack_root,
            stack_name,
            profile,
            nodes,
            order: Vec::new(),
            by_id: BTreeMap::new(),
            by_cluster: BTreeMap::new(),
        };
        plan.reindex();
        plan
    }

    /// Rebuilds `by_id`/`by_cluster`. Must be called after any mutation of
    /// `nodes`; the Plan itself is immutable once the DAGBuilder finalizes it.
    pub fn reindex(&mut self) {
        self.by_id.clear();
        self.by_cluster.clear();
        for (idx, node) in self.nodes.iter().enumerate() {
            self.by_id.insert(node.id.clone(), idx);
            self.by_cluster.entry(node.cluster.clone()).or_default().push(idx);
        }
    }

    pub fn get(&self, id: &ReleaseId) -> Option<&ResolvedRelease> {
        self.by_id.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn get_mut(&mut self, id: &ReleaseId) -> Option<&mut ResolvedRelease> {
        if let Some(&idx) = self.by_id.get(id) {
            Some(&mut self.nodes[idx])
        } else {
            None
        }
    }

    pub fn cluster_nodes(&self, cluster: &str) -> impl Iterator<Item = &ResolvedRelease> {
        self.by_cluster
            .get(cluster)
            .into_iter()
            .flatten()
            .map(move |&idx| &self.nodes[idx])
    }

    pub fn clusters(&self) -> impl Iterator<Item = &String> {
        self.by_cluster.keys()
    }

    /// Find the sibling in `cluster` whose bare name is `name`.
    pub fn find_in_cluster(&self, cluster: &str, name: &str) -> Option<&ResolvedRelease> {
        self.cluster_nodes(cluster).find(|n| n.name == name)
    }
}
