//! [`Run`]: one execution attempt over a frozen [`Plan`] (spec §3).

use crate::plan::{Plan, ReleaseId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Apply,
    Delete,
    Diff,
    Verify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// A verify finding at or above `failOn` severity blocked this node; it is
    /// never retried (spec §7).
    Blocked,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Skipped | NodeStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub command: Command,
    pub plan: Plan,
    pub status_by_id: BTreeMap<ReleaseId, NodeStatus>,
    pub attempts_by_id: BTreeMap<ReleaseId, Vec<Attempt>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub canceled: bool,
}

impl Run {
    pub fn new(run_id: String, command: Command, plan: Plan) -> Self {
        let mut status_by_id = BTreeMap::new();
        for node in &plan.nodes {
            status_by_id.insert(node.id.clone(), NodeStatus::Pending);
        }
        Run {
            run_id,
            command,
            plan,
            status_by_id,
            attempts_by_id: BTreeMap::new(),
            started_at: Utc::now(),
            finished_at: None,
            canceled: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status_by_id.values().all(|s| s.is_terminal())
    }
}

/// Lexicographically sortable run ID: `YYYY-MM-DDTHH-MM-SS.nnnnnnnnnZ`.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H-%M-%S.%9fZ").to_string()
}
