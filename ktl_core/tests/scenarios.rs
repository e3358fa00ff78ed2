//! End-to-end scenarios through the public API: discover/compile skipped in
//! favor of building a `StackManifest` in memory, then `compile` ->
//! `DAGBuilder::build` -> `Scheduler::run`, exactly as the CLI wires them in
//! `runner::compile_plan`/`run_command`.

use ktl_core::collaborators::testutil::{FakeApplier, FakeHelm};
use ktl_core::collaborators::{Container, K8sObject, RenderedManifest};
use ktl_core::manifest::{ClusterRef, ReleaseSpec, StackManifest};
use ktl_core::run::{Command, NodeStatus};
use ktl_core::scheduler::{ExitIntent, FailurePolicy, RunOptions, Scheduler};
use ktl_core::{compile, CompileOptions, DAGBuilder, Error, ReleaseId, RunStore};
use std::sync::Arc;
use tempfile::tempdir;

fn release(name: &str, cluster: &str, needs: &[&str]) -> ReleaseSpec {
    ReleaseSpec {
        name: name.into(),
        chart: format!("charts/{name}"),
        cluster: ClusterRef { name: cluster.into(), context: None },
        namespace: "ns".into(),
        values: vec![],
        set: vec![],
        needs: needs.iter().map(|s| s.to_string()).collect(),
        tags: Default::default(),
    }
}

fn manifest(releases: Vec<ReleaseSpec>) -> StackManifest {
    StackManifest { name: "s".into(), profile: None, cli: Default::default(), releases }
}

fn test_executor(applier: Arc<FakeApplier>) -> Arc<dyn ktl_core::Executor> {
    Arc::new(ktl_core::HelmExecutor {
        renderer: Arc::new(FakeHelm::default()),
        applier,
        verifier: Arc::new(ktl_core::collaborators::testutil::FakeVerifyEngine::default()),
        ruleset: "default".into(),
        fail_on: ktl_core::collaborators::Severity::Error,
    })
}

/// S1: three releases on one cluster, linear `needs` chain, layers into
/// three waves in declared order and every node succeeds.
#[tokio::test]
async fn s1_three_release_wave_ordering() {
    let td = tempdir().unwrap();
    std::fs::create_dir_all(td.path().join("charts/crds")).unwrap();
    std::fs::create_dir_all(td.path().join("charts/api")).unwrap();
    std::fs::create_dir_all(td.path().join("charts/frontend")).unwrap();
    let m = manifest(vec![
        release("crds", "c1", &[]),
        release("api", "c1", &["crds"]),
        release("frontend", "c1", &["api"]),
    ]);
    let mut plan = compile(td.path(), &m, &CompileOptions::default(), None).unwrap();
    DAGBuilder::build(&mut plan).unwrap();

    assert_eq!(
        plan.order,
        vec![
            ReleaseId::new("c1", "ns", "crds"),
            ReleaseId::new("c1", "ns", "api"),
            ReleaseId::new("c1", "ns", "frontend"),
        ]
    );

    let applier = Arc::new(FakeApplier::default());
    let store = Arc::new(RunStore::new(td.path()));
    let result = Scheduler::run(RunOptions::default(), plan, test_executor(applier), store).await.unwrap();

    assert_eq!(result.exit, ExitIntent::Ok);
    for status in result.status_by_id.values() {
        assert_eq!(*status, NodeStatus::Succeeded);
    }
}

/// S2: `api` references the ConfigMap produced by `config` via `envFrom`, with
/// no declared `needs` between them. Inference places `config` strictly
/// before `api`.
#[tokio::test]
async fn s2_inferred_config_map_edge_orders_before_declared_consumer() {
    let td = tempdir().unwrap();
    std::fs::create_dir_all(td.path().join("charts/config")).unwrap();
    std::fs::create_dir_all(td.path().join("charts/api")).unwrap();
    let m = manifest(vec![release("config", "c1", &[]), release("api", "c1", &[])]);
    let mut plan = compile(td.path(), &m, &CompileOptions::default(), None).unwrap();

    let helm = Arc::new(FakeHelm::default());
    helm.set(
        "charts/config",
        RenderedManifest { objects: vec![], digest: [0; 32], chart_version: "1.0.0".into(), notes: String::new() },
    );
    helm.set(
        "charts/api",
        RenderedManifest {
            objects: vec![K8sObject {
                kind: "Deployment".into(),
                name: "api".into(),
                namespace: "ns".into(),
                labels: Default::default(),
                containers: vec![Container {
                    name: "api".into(),
                    image: "api:1.0".into(),
                    env_from_config_maps: vec!["config".into()],
                    ..Default::default()
                }],
                produces_service: false,
                produces_config_map: false,
                produces_secret: false,
            }],
            digest: [0; 32],
            chart_version: "1.0.0".into(),
            notes: String::new(),
        },
    );

    let cache = Arc::new(ktl_core::cache::RenderCache::new(usize::MAX, None));
    ktl_core::infer::infer(&mut plan, helm, cache, &ktl_core::infer::InferOptions::default()).await.unwrap();
    DAGBuilder::build(&mut plan).unwrap();

    let config_pos = plan.order.iter().position(|id| id == &ReleaseId::new("c1", "ns", "config")).unwrap();
    let api_pos = plan.order.iter().position(|id| id == &ReleaseId::new("c1", "ns", "api")).unwrap();
    assert!(config_pos < api_pos, "config ({config_pos}) must precede api ({api_pos})");
}

/// S3: `a` needs `b`, `b` needs `a`. `DAGBuilder::build` returns a cycle error
/// listing both IDs; no plan order is ever produced.
#[tokio::test]
async fn s3_mutual_need_is_rejected_as_a_cycle() {
    let td = tempdir().unwrap();
    std::fs::create_dir_all(td.path().join("charts/a")).unwrap();
    std::fs::create_dir_all(td.path().join("charts/b")).unwrap();
    let m = manifest(vec![release("a", "c1", &["b"]), release("b", "c1", &["a"])]);
    let mut plan = compile(td.path(), &m, &CompileOptions::default(), None).unwrap();

    let err = DAGBuilder::build(&mut plan).unwrap_err();
    match err {
        Error::Cycle { nodes, .. } => {
            let mut names: Vec<String> = nodes.iter().map(|n| n.0.clone()).collect();
            names.sort();
            assert_eq!(names, vec!["c1/ns/a".to_string(), "c1/ns/b".to_string()]);
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
    assert!(plan.order.is_empty());
}

/// S4: `continueOnError` with `a` failing permanently. `a` is marked failed,
/// its dependent `c` is skipped, and the unrelated `b`/`d` still succeed.
#[tokio::test]
async fn s4_continue_on_error_partial_failure() {
    let td = tempdir().unwrap();
    for chart in ["a", "b", "c", "d"] {
        std::fs::create_dir_all(td.path().join(format!("charts/{chart}"))).unwrap();
    }
    let m = manifest(vec![
        release("a", "c1", &[]),
        release("b", "c1", &[]),
        release("c", "c1", &["a"]),
        release("d", "c1", &[]),
    ]);
    let mut plan = compile(td.path(), &m, &CompileOptions::default(), None).unwrap();
    DAGBuilder::build(&mut plan).unwrap();

    let applier = Arc::new(FakeApplier::default());
    applier.fail_nodes.lock().unwrap().push(ReleaseId::new("c1", "ns", "a").0);
    let store = Arc::new(RunStore::new(td.path()));

    let options = RunOptions { failure_policy: FailurePolicy::ContinueOnError, ..RunOptions::default() };
    let result = Scheduler::run(options, plan, test_executor(applier), store.clone()).await.unwrap();

    assert_eq!(result.exit, ExitIntent::Failed);
    assert_eq!(*result.status_by_id.get(&ReleaseId::new("c1", "ns", "a")).unwrap(), NodeStatus::Failed);
    assert_eq!(*result.status_by_id.get(&ReleaseId::new("c1", "ns", "c")).unwrap(), NodeStatus::Skipped);
    assert_eq!(*result.status_by_id.get(&ReleaseId::new("c1", "ns", "b")).unwrap(), NodeStatus::Succeeded);
    assert_eq!(*result.status_by_id.get(&ReleaseId::new("c1", "ns", "d")).unwrap(), NodeStatus::Succeeded);

    let transitions = store.replay_transitions(&result.run_id).unwrap();
    let a_attempts = transitions.iter().filter(|t| t.node_id == ReleaseId::new("c1", "ns", "a") && t.to == NodeStatus::Failed).count();
    assert_eq!(a_attempts, 1);
}

/// S5: `x` fails on its first attempt for a transient reason; the run is
/// resumed under the same run ID with a fresh executor that no longer fails
/// it, and `x` (and its dependent `y`) reach `succeeded`.
#[tokio::test]
async fn s5_resume_after_a_transient_failure_completes_the_run() {
    let td = tempdir().unwrap();
    std::fs::create_dir_all(td.path().join("charts/x")).unwrap();
    std::fs::create_dir_all(td.path().join("charts/y")).unwrap();
    let m = manifest(vec![release("x", "c1", &[]), release("y", "c1", &["x"])]);
    let mut plan = compile(td.path(), &m, &CompileOptions::default(), None).unwrap();
    DAGBuilder::build(&mut plan).unwrap();

    let store = Arc::new(RunStore::new(td.path()));

    // First attempt: x fails permanently (max_attempts=1 here stands in for
    // "the process was killed before a retry could be scheduled" — the
    // run's on-disk state is what resume replays from, not in-memory retry
    // bookkeeping).
    let failing_applier = Arc::new(FakeApplier::default());
    failing_applier.fail_nodes.lock().unwrap().push(ReleaseId::new("c1", "ns", "x").0);
    let options = RunOptions { failure_policy: FailurePolicy::ContinueOnError, ..RunOptions::default() };
    let first = Scheduler::run(options, plan.clone(), test_executor(failing_applier), store.clone()).await.unwrap();
    assert_eq!(*first.status_by_id.get(&ReleaseId::new("c1", "ns", "x")).unwrap(), NodeStatus::Failed);
    assert_eq!(*first.status_by_id.get(&ReleaseId::new("c1", "ns", "y")).unwrap(), NodeStatus::Skipped);

    // Resume: status.jsonl is replayed, x re-enters Pending-equivalent retry
    // since its terminal status was Failed, not Succeeded/Skipped — a fresh
    // Scheduler::run against the same run ID re-attempts it. A healthy
    // executor now lets it (and the dependent y) complete.
    let healthy_applier = Arc::new(FakeApplier::default());
    let resume_options =
        RunOptions { failure_policy: FailurePolicy::ContinueOnError, resume_run_id: Some(first.run_id.clone()), ..RunOptions::default() };
    let second =
        Scheduler::run(resume_options, plan, test_executor(healthy_applier), store.clone()).await.unwrap();

    assert_eq!(second.run_id, first.run_id);
    assert_eq!(*second.status_by_id.get(&ReleaseId::new("c1", "ns", "x")).unwrap(), NodeStatus::Succeeded);
    assert_eq!(*second.status_by_id.get(&ReleaseId::new("c1", "ns", "y")).unwrap(), NodeStatus::Succeeded);
}

/// Delete must tear down in reverse DAG order: `frontend` (the dependent)
/// before `api`, and `api` before `crds` (spec.md §4.5).
#[tokio::test]
async fn delete_tears_down_a_three_release_chain_in_reverse_order() {
    let td = tempdir().unwrap();
    std::fs::create_dir_all(td.path().join("charts/crds")).unwrap();
    std::fs::create_dir_all(td.path().join("charts/api")).unwrap();
    std::fs::create_dir_all(td.path().join("charts/frontend")).unwrap();
    let m = manifest(vec![
        release("crds", "c1", &[]),
        release("api", "c1", &["crds"]),
        release("frontend", "c1", &["api"]),
    ]);
    let mut plan = compile(td.path(), &m, &CompileOptions::default(), None).unwrap();
    DAGBuilder::build(&mut plan).unwrap();

    let applier = Arc::new(FakeApplier::default());
    let store = Arc::new(RunStore::new(td.path()));
    let options = RunOptions { command: Command::Delete, ..RunOptions::default() };
    let result = Scheduler::run(options, plan, test_executor(applier.clone()), store).await.unwrap();

    assert_eq!(result.exit, ExitIntent::Ok);
    let order = applier.call_order.lock().unwrap().clone();
    let pos = |name: &str| order.iter().position(|id| id == &ReleaseId::new("c1", "ns", name).0).unwrap();
    assert!(pos("frontend") < pos("api"));
    assert!(pos("api") < pos("crds"));
}

/// S6: `gitIncludeDeps: true` with no `gitRange` is a selector misuse;
/// `compile` rejects it before any plan is produced, mentioning both keys.
#[test]
fn s6_git_include_deps_without_git_range_is_rejected() {
    let td = tempdir().unwrap();
    let m = manifest(vec![release("a", "c1", &[])]);
    let mut opts = CompileOptions::default();
    opts.git_include_deps = true;

    let err = compile(td.path(), &m, &opts, None).unwrap_err();
    match err {
        Error::Config(detail) => {
            assert!(detail.contains("GitIncludeDeps"), "{detail}");
            assert!(detail.contains("GitRange"), "{detail}");
        }
        other => panic!("expected a config error, got {other:?}"),
    }
}
