//! C5: execute the DAG per-cluster with bounded concurrency, retry/backoff,
//! wave barriers, and cancel-on-first-failure vs continue-on-error policies
//! (spec §4.5).

use crate::error::Result;
use crate::executor::Executor;
use crate::plan::{Plan, ReleaseId};
use crate::run::{Command, NodeStatus, Run};
use crate::store::{RunStore, StatusTransition};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    FailFast,
    ContinueOnError,
}

#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    Constant,
    Exponential2x,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Exponential2x,
            jitter_fraction: 0.1,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Constant => self.initial_delay,
            Backoff::Exponential2x => self.initial_delay.saturating_mul(1u32 << attempt.min(16)),
        };
        let capped = base.min(self.max_delay);
        if self.jitter_fraction <= 0.0 {
            return capped;
        }
        let jitter_range = capped.as_secs_f64() * self.jitter_fraction;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        Duration::from_secs_f64((capped.as_secs_f64() + jitter).max(0.0))
    }
}

pub type ConfirmHook = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RunOptions {
    pub concurrency: usize,
    pub command: Command,
    pub failure_policy: FailurePolicy,
    pub retry: RetryPolicy,
    pub node_timeout: Duration,
    pub wave_barrier: bool,
    pub resume_run_id: Option<String>,
    pub confirm: Option<ConfirmHook>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            concurrency: 4,
            command: Command::Apply,
            failure_policy: FailurePolicy::FailFast,
            retry: RetryPolicy::default(),
            node_timeout: Duration::from_secs(300),
            wave_barrier: false,
            resume_run_id: None,
            confirm: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitIntent {
    Ok = 0,
    Failed = 1,
    Blocked = 2,
    Cancelled = 130,
}

pub struct RunResult {
    pub run_id: String,
    pub exit: ExitIntent,
    pub status_by_id: BTreeMap<ReleaseId, NodeStatus>,
}

pub struct Scheduler;

impl Scheduler {
    pub async fn run(
        options: RunOptions,
        plan: Plan,
        executor: Arc<dyn Executor>,
        store: Arc<RunStore>,
    ) -> Result<RunResult> {
        if matches!(options.command, Command::Delete) {
            if let Some(confirm) = &options.confirm {
                if !confirm(&format!("delete {} release(s)", plan.nodes.len())) {
                    return Ok(RunResult {
                        run_id: String::new(),
                        exit: ExitIntent::Blocked,
                        status_by_id: BTreeMap::new(),
                    });
                }
            }
        }

        let mut run = if let Some(run_id) = &options.resume_run_id {
            let loaded_plan = store.load_plan(run_id)?;
            let mut run = Run::new(run_id.clone(), options.command, loaded_plan);
            let replayed = store.replay_status(run_id)?;
            for (id, status) in replayed {
                run.status_by_id.insert(id, status);
            }
            run
        } else {
            let run_id = crate::run::new_run_id(chrono::Utc::now());
            let run = Run::new(run_id, options.command, plan);
            store.create_run(&run)?;
            run
        };

        let waves = build_waves(&run.plan, options.command);
        let predecessors = predecessor_map(&run.plan, options.command);

        let cancel = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let store = store.clone();

        // One watch channel per node publishes terminal status to dependents.
        let mut senders: HashMap<ReleaseId, watch::Sender<NodeStatus>> = HashMap::new();
        let mut receivers: HashMap<ReleaseId, watch::Receiver<NodeStatus>> = HashMap::new();
        for node in &run.plan.nodes {
            let initial = *run.status_by_id.get(&node.id).unwrap_or(&NodeStatus::Pending);
            let (tx, rx) = watch::channel(initial);
            senders.insert(node.id.clone(), tx);
            receivers.insert(node.id.clone(), rx);
        }

        let run = Arc::new(Mutex::new(run));
        let senders = Arc::new(senders);

        let mut wave_barriers: Vec<Arc<WaveBarrier>> = Vec::with_capacity(waves.len());
        for wave in &waves {
            wave_barriers.push(Arc::new(WaveBarrier::new(wave.len())));
        }

        let mut handles = Vec::new();
        for (wave_idx, wave) in waves.iter().enumerate() {
            let next_barrier = if options.wave_barrier && wave_idx > 0 {
                Some(wave_barriers[wave_idx - 1].clone())
            } else {
                None
            };
            let this_barrier = wave_barriers[wave_idx].clone();

            for id in wave {
                let already_terminal = run
                    .lock()
                    .await
                    .status_by_id
                    .get(id)
                    .copied()
                    .map(NodeStatus::is_terminal)
                    .unwrap_or(false);
                if already_terminal {
                    this_barrier.complete_one();
                    continue;
                }

                let preds: Vec<watch::Receiver<NodeStatus>> = predecessors
                    .get(id)
                    .into_iter()
                    .flatten()
                    .filter_map(|p| receivers.get(p).cloned())
                    .collect();

                let id = id.clone();
                let run = run.clone();
                let executor = executor.clone();
                let store = store.clone();
                let senders = senders.clone();
                let cancel = cancel.clone();
                let semaphore = semaphore.clone();
                let options = options.clone();
                let next_barrier = next_barrier.clone();
                let this_barrier = this_barrier.clone();

                handles.push(tokio::spawn(async move {
                    if let Some(barrier) = &next_barrier {
                        barrier.wait().await;
                    }
                    run_node(
                        id, preds, run, executor, store, senders, cancel, semaphore, options,
                    )
                    .await;
                    this_barrier.complete_one();
                }));
            }
        }

        for h in handles {
            let _ = h.await;
        }

        let run = Arc::try_unwrap(run)
            .unwrap_or_else(|_| panic!("scheduler: run Arc still shared after every node task was awaited"));
        let mut run = run.into_inner();
        run.finished_at = Some(chrono::Utc::now());
        run.canceled = cancel.is_cancelled();

        let exit = compute_exit(&run, cancel.is_cancelled());
        write_summary(&store, &run, exit)?;

        Ok(RunResult { run_id: run.run_id.clone(), exit, status_by_id: run.status_by_id.clone() })
    }
}

struct WaveBarrier {
    remaining: AtomicUsize,
    notify: Notify,
}

impl WaveBarrier {
    fn new(count: usize) -> Self {
        WaveBarrier { remaining: AtomicUsize::new(count), notify: Notify::new() }
    }

    fn complete_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        while self.remaining.load(Ordering::Acquire) > 0 {
            self.notify.notified().await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_node(
    id: ReleaseId,
    mut preds: Vec<watch::Receiver<NodeStatus>>,
    run: Arc<Mutex<Run>>,
    executor: Arc<dyn Executor>,
    store: Arc<RunStore>,
    senders: Arc<HashMap<ReleaseId, watch::Sender<NodeStatus>>>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    options: RunOptions,
) {
    // Suspension point (b): wait for every predecessor's terminal status.
    let mut predecessor_failed = false;
    for rx in &mut preds {
        loop {
            let status = *rx.borrow();
            if status.is_terminal() {
                if !matches!(status, NodeStatus::Succeeded | NodeStatus::Skipped) {
                    predecessor_failed = true;
                }
                break;
            }
            if rx.changed().await.is_err() {
                predecessor_failed = true;
                break;
            }
        }
    }

    if cancel.is_cancelled() {
        transition(&run, &store, &senders, &id, NodeStatus::Cancelled, 0, None).await;
        return;
    }

    if predecessor_failed {
        let next = match options.failure_policy {
            FailurePolicy::ContinueOnError => NodeStatus::Skipped,
            FailurePolicy::FailFast => NodeStatus::Cancelled,
        };
        transition(&run, &store, &senders, &id, next, 0, None).await;
        return;
    }

    // Suspension point (a): wait for a worker slot.
    let _permit = match semaphore.acquire().await {
        Ok(p) => p,
        Err(_) => return,
    };

    transition(&run, &store, &senders, &id, NodeStatus::Running, 0, None).await;

    let mut attempt = 0u32;
    let result = loop {
        attempt += 1;
        let node = {
            let guard = run.lock().await;
            guard.plan.get(&id).expect("node exists").clone()
        };

        let started = chrono::Utc::now();
        let exec_fut = dispatch(&executor, &node, options.command, attempt);
        let outcome = tokio::time::timeout(options.node_timeout, exec_fut).await;

        let (ok, retryable, blocked, err) = match outcome {
            Ok(res) => (res.ok, res.retryable, res.blocked, res.err),
            Err(_) => (false, attempt < options.retry.max_attempts, false, Some("node attempt timed out".into())),
        };

        {
            let mut guard = run.lock().await;
            guard.attempts_by_id.entry(id.clone()).or_default().push(crate::run::Attempt {
                started_at: started,
                finished_at: Some(chrono::Utc::now()),
                result: Some(if ok { "ok".into() } else { "error".into() }),
                error: err.clone(),
            });
        }

        if ok {
            break NodeOutcome::Succeeded;
        }
        if blocked {
            break NodeOutcome::Blocked(err.unwrap_or_else(|| "blocked by verify findings".into()));
        }
        if !retryable || attempt >= options.retry.max_attempts {
            break NodeOutcome::Failed(err.unwrap_or_else(|| "unknown error".into()));
        }

        let delay = options.retry.delay_for(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break NodeOutcome::Failed("cancelled during retry backoff".into()),
        }
    };

    match result {
        NodeOutcome::Succeeded => {
            transition(&run, &store, &senders, &id, NodeStatus::Succeeded, attempt, None).await;
        }
        NodeOutcome::Blocked(message) => {
            if matches!(options.failure_policy, FailurePolicy::FailFast) {
                cancel.cancel();
            }
            transition(&run, &store, &senders, &id, NodeStatus::Blocked, attempt, Some(message)).await;
        }
        NodeOutcome::Failed(message) => {
            if matches!(options.failure_policy, FailurePolicy::FailFast) {
                cancel.cancel();
            }
            transition(&run, &store, &senders, &id, NodeStatus::Failed, attempt, Some(message)).await;
        }
    }
}

enum NodeOutcome {
    Succeeded,
    Blocked(String),
    Failed(String),
}

async fn dispatch(executor: &Arc<dyn Executor>, node: &crate::plan::ResolvedRelease, command: Command, attempt: u32) -> crate::executor::ExecResult {
    match command {
        Command::Apply => executor.helm_apply(node, attempt).await,
        Command::Delete => executor.helm_delete(node, attempt).await,
        Command::Diff => executor.diff(node, attempt).await,
        Command::Verify => executor.verify(node, attempt).await,
    }
}

async fn transition(
    run: &Arc<Mutex<Run>>,
    store: &Arc<RunStore>,
    senders: &Arc<HashMap<ReleaseId, watch::Sender<NodeStatus>>>,
    id: &ReleaseId,
    to: NodeStatus,
    attempt: u32,
    err: Option<String>,
) {
    let from = {
        let mut guard = run.lock().await;
        let from = *guard.status_by_id.get(id).unwrap_or(&NodeStatus::Pending);
        guard.status_by_id.insert(id.clone(), to);
        from
    };

    let run_id = run.lock().await.run_id.clone();
    // Checkpoint before the transition is visible to dependents (§4.5):
    // durability must complete before we notify the watch channel.
    let _ = store.append_status(&run_id, &StatusTransition {
        ts: chrono::Utc::now(),
        node_id: id.clone(),
        from,
        to,
        attempt,
        err,
    });

    if let Some(tx) = senders.get(id) {
        let _ = tx.send(to);
    }
}

fn build_waves(plan: &Plan, command: Command) -> Vec<Vec<ReleaseId>> {
    let mut by_wave: BTreeMap<u32, Vec<ReleaseId>> = BTreeMap::new();
    for node in &plan.nodes {
        let wave = node.execution_group.unwrap_or(0);
        by_wave.entry(wave).or_default().push(node.id.clone());
    }
    for ids in by_wave.values_mut() {
        ids.sort();
    }
    let mut waves: Vec<Vec<ReleaseId>> = by_wave.into_values().collect();
    if matches!(command, Command::Delete) {
        waves.reverse();
    }
    waves
}

/// Each node's in-run predecessors: the nodes it must wait on before it may
/// start. For `Apply`/`Diff`/`Verify` this is the forward `needs` edge (dep ->
/// dependent). `Delete` must tear down in reverse DAG order (spec §4.5), so
/// the edges are inverted: a node's "predecessor" becomes whichever nodes
/// declared `needs` on it, since those dependents must be deleted first.
fn predecessor_map(plan: &Plan, command: Command) -> HashMap<ReleaseId, Vec<ReleaseId>> {
    let mut map: HashMap<ReleaseId, Vec<ReleaseId>> = HashMap::new();
    for node in &plan.nodes {
        for dep_name in node.all_needs() {
            if let Some(dep) = plan.find_in_cluster(&node.cluster, &dep_name) {
                match command {
                    Command::Delete => map.entry(dep.id.clone()).or_default().push(node.id.clone()),
                    _ => map.entry(node.id.clone()).or_default().push(dep.id.clone()),
                }
            }
        }
    }
    map
}

fn compute_exit(run: &Run, cancelled: bool) -> ExitIntent {
    if cancelled && run.status_by_id.values().any(|s| matches!(s, NodeStatus::Cancelled)) {
        return ExitIntent::Cancelled;
    }
    if run.status_by_id.values().any(|s| matches!(s, NodeStatus::Blocked)) {
        return ExitIntent::Blocked;
    }
    if run.status_by_id.values().any(|s| matches!(s, NodeStatus::Failed)) {
        return ExitIntent::Failed;
    }
    ExitIntent::Ok
}

fn write_summary(store: &RunStore, run: &Run, exit: ExitIntent) -> Result<()> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for status in run.status_by_id.values() {
        let key = format!("{status:?}").to_lowercase();
        *counts.entry(key).or_insert(0) += 1;
    }
    let wall_clock_ms = run
        .finished_at
        .map(|f| (f - run.started_at).num_milliseconds())
        .unwrap_or(0);
    store.mark_terminal(&run.run_id, &crate::store::Summary {
        run_id: run.run_id.clone(),
        command: run.command,
        counts,
        wall_clock_ms,
        exit_intent: exit as i32,
    })
}
