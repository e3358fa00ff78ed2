//! C7: durable per-run log under `<stackRoot>/.ktl/stack/runs/<runID>/`
//! (spec §4.7, §6.2).

use crate::error::{Error, Result};
use crate::plan::ReleaseId;
use crate::run::{Command, NodeStatus, Run};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub ts: DateTime<Utc>,
    pub node_id: ReleaseId,
    pub from: NodeStatus,
    pub to: NodeStatus,
    pub attempt: u32,
    #[serde(default)]
    pub err: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub ts: DateTime<Utc>,
    pub node_id: ReleaseId,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub run_id: String,
    pub command: Command,
    pub counts: std::collections::BTreeMap<String, usize>,
    pub wall_clock_ms: i64,
    pub exit_intent: i32,
}

pub struct RunStore {
    runs_dir: PathBuf,
}

impl RunStore {
    pub fn new(stack_root: &Path) -> Self {
        RunStore { runs_dir: stack_root.join(".ktl").join("stack").join("runs") }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn create_run(&self, run: &Run) -> Result<()> {
        let dir = self.run_dir(&run.run_id);
        fs::create_dir_all(&dir)?;
        let plan_json = crate::canonical::to_canonical_json(&run.plan)?;
        fs::write(dir.join("plan.json"), plan_json)?;
        // Touch the jsonl files so readers can tail them immediately.
        OpenOptions::new().create(true).append(true).open(dir.join("status.jsonl"))?;
        OpenOptions::new().create(true).append(true).open(dir.join("events.jsonl"))?;
        Ok(())
    }

    pub fn append_status(&self, run_id: &str, transition: &StatusTransition) -> Result<()> {
        self.append_jsonl(run_id, "status.jsonl", transition)
    }

    pub fn append_event(&self, run_id: &str, event: &ProgressEvent) -> Result<()> {
        self.append_jsonl(run_id, "events.jsonl", event)
    }

    fn append_jsonl<T: Serialize>(&self, run_id: &str, file_name: &str, value: &T) -> Result<()> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(file_name);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        if let Some(parent) = path.parent() {
            if let Ok(dir_file) = File::open(parent) {
                let _ = dir_file.sync_all();
            }
        }
        Ok(())
    }

    pub fn mark_terminal(&self, run_id: &str, summary: &Summary) -> Result<()> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir)?;
        let final_path = dir.join("summary.json");
        let tmp_path = dir.join("summary.json.tmp");
        let bytes = serde_json::to_vec_pretty(summary)?;
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Replays `status.jsonl` and returns the last status per node. Tolerates
    /// a partial last line (append-only, line-delimited readers must).
    pub fn replay_status(&self, run_id: &str) -> Result<std::collections::BTreeMap<ReleaseId, NodeStatus>> {
        let path = self.run_dir(run_id).join("status.jsonl");
        let mut last = std::collections::BTreeMap::new();
        if !path.is_file() {
            return Ok(last);
        }
        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(transition) = serde_json::from_str::<StatusTransition>(&line) else {
                continue; // partial last line
            };
            last.insert(transition.node_id, transition.to);
        }
        Ok(last)
    }

    /// Every transition ever appended to `status.jsonl`, in file order.
    /// Reporters reconstruct both final status and attempt counts from this
    /// rather than needing the in-memory [`Run`] that produced them.
    pub fn replay_transitions(&self, run_id: &str) -> Result<Vec<StatusTransition>> {
        let path = self.run_dir(run_id).join("status.jsonl");
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(transition) = serde_json::from_str::<StatusTransition>(&line) else {
                continue; // partial last line
            };
            out.push(transition);
        }
        Ok(out)
    }

    pub fn load_plan(&self, run_id: &str) -> Result<crate::plan::Plan> {
        let path = self.run_dir(run_id).join("plan.json");
        let bytes = fs::read(&path)
            .map_err(|e| Error::Store(format!("failed to read {path:?}: {e}")))?;
        let mut plan: crate::plan::Plan = serde_json::from_slice(&bytes)?;
        // `by_id`/`by_cluster` are `#[serde(skip)]`; rebuild them after load.
        plan.reindex();
        Ok(plan)
    }

    pub fn load_most_recent_run(&self) -> Result<Option<String>> {
        if !self.runs_dir.is_dir() {
            return Ok(None);
        }
        let mut runs: Vec<String> = fs::read_dir(&self.runs_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .collect();
        runs.sort();
        Ok(runs.pop())
    }
}
