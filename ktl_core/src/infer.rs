//! C3: enrich a [`Plan`] with inferred edges extracted from rendered objects
//! (spec §4.3).

use crate::cache::{fingerprint, OwnedRenderInput, RenderCache};
use crate::collaborators::{HelmRenderer, K8sObject};
use crate::error::Result;
use crate::plan::{InferredNeed, InferredReason, Plan, ReasonType};
use futures::stream::{FuturesUnordered, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct InferOptions {
    pub include_config_refs: bool,
    pub render_timeout: Duration,
    pub concurrency: usize,
    pub fail_fast: bool,
}

impl Default for InferOptions {
    fn default() -> Self {
        InferOptions {
            include_config_refs: true,
            render_timeout: Duration::from_secs(60),
            concurrency: 8,
            fail_fast: false,
        }
    }
}

static SERVICE_DNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<svc>[a-z0-9-]+)\.(?P<ns>[a-z0-9-]+)(\.svc(\.[a-z0-9.-]+)?)?$").unwrap()
});

pub async fn infer(
    plan: &mut Plan,
    renderer: Arc<dyn HelmRenderer>,
    cache: Arc<RenderCache>,
    opts: &InferOptions,
) -> Result<()> {
    let sem = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let ids: Vec<_> = plan.nodes.iter().map(|n| n.id.clone()).collect();

    let mut tasks = FuturesUnordered::new();
    for id in ids {
        let node = plan.get(&id).expect("id from plan.nodes").clone();
        let sem = sem.clone();
        let renderer = renderer.clone();
        let cache = cache.clone();
        let timeout = opts.render_timeout;
        tasks.push(async move {
            let _permit = sem.acquire().await.expect("semaphore not closed");
            let fp = fingerprint(
                &node.chart,
                &node.values.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                &node.set,
                &node.namespace,
                "",
            );
            let input = OwnedRenderInput {
                chart: node.chart.clone(),
                release_name: node.name.clone(),
                namespace: node.namespace.clone(),
                values: node.values.clone(),
                set: node.set.clone(),
            };
            let result = tokio::time::timeout(timeout, cache.render_coalesced(&fp, renderer, input)).await;
            (node.id.clone(), result)
        });
    }

    let mut rendered = Vec::new();
    while let Some((id, result)) = tasks.next().await {
        match result {
            Ok(Ok(manifest)) => rendered.push((id, Ok(manifest))),
            Ok(Err(e)) => {
                if opts.fail_fast {
                    return Err(e);
                }
                rendered.push((id, Err(e.to_string())));
            }
            Err(_elapsed) => {
                if opts.fail_fast {
                    return Err(crate::error::Error::Timeout { node: id, attempt: 1 });
                }
                rendered.push((id, Err("render timed out".to_string())));
            }
        }
    }

    for (id, outcome) in rendered {
        match outcome {
            Err(message) => {
                if let Some(node) = plan.get_mut(&id) {
                    node.infer_error = Some(message);
                }
            }
            Ok(manifest) => {
                let cluster = plan.get(&id).expect("node exists").cluster.clone();
                let needs = infer_needs_for(plan, &cluster, &id.0, &manifest.objects, opts.include_config_refs);
                if let Some(node) = plan.get_mut(&id) {
                    node.inferred_needs = needs;
                }
            }
        }
    }

    Ok(())
}

fn infer_needs_for(
    plan: &Plan,
    cluster: &str,
    self_id: &str,
    objects: &[K8sObject],
    include_config_refs: bool,
) -> Vec<InferredNeed> {
    use std::collections::BTreeMap;
    let mut by_producer: BTreeMap<String, Vec<InferredReason>> = BTreeMap::new();

    for obj in objects {
        for container in &obj.containers {
            // Image references: correlate against releases whose workload
            // name or labels match. We match by bare workload/release name.
            if let Some(producer) = plan.find_in_cluster(cluster, &image_workload_hint(&container.image)) {
                if producer.id.0 != self_id {
                    by_producer.entry(producer.id.0.clone()).or_default().push(InferredReason {
                        kind: ReasonType::Image,
                        detail: container.image.clone(),
                    });
                }
            }

            for (_key, value) in &container.env {
                if let Some(caps) = SERVICE_DNS.captures(value) {
                    let svc = &caps["svc"];
                    if let Some(producer) = plan.find_in_cluster(cluster, svc) {
                        if producer.id.0 != self_id {
                            by_producer.entry(producer.id.0.clone()).or_default().push(InferredReason {
                                kind: ReasonType::ServiceDns,
                                detail: value.clone(),
                            });
                        }
                    }
                }
            }
            for arg in container.command.iter().chain(container.args.iter()) {
                if let Some(caps) = SERVICE_DNS.captures(arg) {
                    let svc = &caps["svc"];
                    if let Some(producer) = plan.find_in_cluster(cluster, svc) {
                        if producer.id.0 != self_id {
                            by_producer.entry(producer.id.0.clone()).or_default().push(InferredReason {
                                kind: ReasonType::ServiceDns,
                                detail: arg.clone(),
                            });
                        }
                    }
                }
            }

            if include_config_refs {
                for name in &container.env_from_config_maps {
                    mark_config_ref(plan, cluster, self_id, name, ReasonType::ConfigMap, &mut by_producer);
                }
                for name in &container.env_from_secrets {
                    mark_config_ref(plan, cluster, self_id, name, ReasonType::Secret, &mut by_producer);
                }
                for name in &container.volume_mounts_config_maps {
                    mark_config_ref(plan, cluster, self_id, name, ReasonType::Volume, &mut by_producer);
                }
                for name in &container.volume_mounts_secrets {
                    mark_config_ref(plan, cluster, self_id, name, ReasonType::Volume, &mut by_producer);
                }
            }
        }
    }

    by_producer
        .into_iter()
        .map(|(name, reasons)| InferredNeed { name: crate::plan::ReleaseId(name), reasons })
        .collect()
}

fn mark_config_ref(
    plan: &Plan,
    cluster: &str,
    self_id: &str,
    ref_name: &str,
    kind: ReasonType,
    by_producer: &mut std::collections::BTreeMap<String, Vec<InferredReason>>,
) {
    // The producing release is the one whose release name matches the
    // referenced ConfigMap/Secret name (the common Helm convention).
    if let Some(producer) = plan.find_in_cluster(cluster, ref_name) {
        if producer.id.0 != self_id {
            by_producer
                .entry(producer.id.0.clone())
                .or_default()
                .push(InferredReason { kind, detail: ref_name.to_string() });
        }
    }
}

fn image_workload_hint(image: &str) -> String {
    image
        .rsplit('/')
        .next()
        .unwrap_or(image)
        .split(':')
        .next()
        .unwrap_or(image)
        .to_string()
}
