//! Narrow contracts the core consumes from external collaborators (§6.5).
//! Nothing in this module renders charts, talks to a Kubernetes API, or signs
//! images: it only declares the shape those collaborators must have.

use crate::error::Result;
use crate::plan::ResolvedRelease;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single decoded Kubernetes object, reduced to what [`crate::infer`] needs
/// to walk (spec §4.3): pod template containers, envFrom, volumeMounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct K8sObject {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub produces_service: bool,
    #[serde(default)]
    pub produces_config_map: bool,
    #[serde(default)]
    pub produces_secret: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub env_from_config_maps: Vec<String>,
    #[serde(default)]
    pub env_from_secrets: Vec<String>,
    #[serde(default)]
    pub volume_mounts_config_maps: Vec<String>,
    #[serde(default)]
    pub volume_mounts_secrets: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RenderedManifest {
    pub objects: Vec<K8sObject>,
    pub digest: [u8; 32],
    pub chart_version: String,
    pub notes: String,
}

#[derive(Debug, Clone)]
pub struct RenderInput<'a> {
    pub chart: &'a str,
    pub release_name: &'a str,
    pub namespace: &'a str,
    pub values: &'a [std::path::PathBuf],
    pub set: &'a [String],
}

#[async_trait]
pub trait HelmRenderer: Send + Sync {
    async fn render(&self, input: RenderInput<'_>) -> Result<RenderedManifest>;
}

#[derive(Debug, Clone, Default)]
pub struct ResourceStatus {
    pub kind: String,
    pub name: String,
    pub ready: bool,
}

#[async_trait]
pub trait KubeApplier: Send + Sync {
    async fn apply(&self, node: &ResolvedRelease, manifest: &RenderedManifest) -> Result<Vec<ResourceStatus>>;
    async fn delete(&self, node: &ResolvedRelease) -> Result<Vec<ResourceStatus>>;
    /// Structured diff of rendered objects against live cluster state.
    async fn diff(&self, node: &ResolvedRelease, manifest: &RenderedManifest) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct Finding {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
}

#[async_trait]
pub trait VerifyEngine: Send + Sync {
    async fn verify(&self, objects: &[K8sObject], ruleset: &str) -> Result<Vec<Finding>>;
}

#[cfg(any(test, feature = "testutil"))]
pub mod testutil {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeHelm {
        pub renders: Mutex<HashMap<String, RenderedManifest>>,
        pub fail: Mutex<Vec<String>>,
    }

    impl FakeHelm {
        pub fn set(&self, chart: &str, manifest: RenderedManifest) {
            self.renders.lock().unwrap().insert(chart.to_string(), manifest);
        }
    }

    #[async_trait]
    impl HelmRenderer for FakeHelm {
        async fn render(&self, input: RenderInput<'_>) -> Result<RenderedManifest> {
            if self.fail.lock().unwrap().iter().any(|c| c == input.chart) {
                return Err(crate::error::Error::Render {
                    node: crate::plan::ReleaseId(input.release_name.to_string()),
                    retryable: false,
                    source: Box::new(crate::error::Error::Config("forced render failure".into())),
                });
            }
            Ok(self
                .renders
                .lock()
                .unwrap()
                .get(input.chart)
                .cloned()
                .unwrap_or_else(|| RenderedManifest {
                    objects: vec![],
                    digest: [0u8; 32],
                    chart_version: "0.0.0".into(),
                    notes: String::new(),
                }))
        }
    }

    #[derive(Default)]
    pub struct FakeApplier {
        pub fail_nodes: Mutex<Vec<String>>,
        /// Records the order `apply`/`delete` were actually invoked in, so
        /// tests can assert on real execution order rather than just the
        /// wave layout.
        pub call_order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl KubeApplier for FakeApplier {
        async fn apply(&self, node: &ResolvedRelease, _manifest: &RenderedManifest) -> Result<Vec<ResourceStatus>> {
            self.call_order.lock().unwrap().push(node.id.0.clone());
            if self.fail_nodes.lock().unwrap().iter().any(|n| n == &node.id.0) {
                return Err(crate::error::Error::Exec {
                    node: node.id.clone(),
                    op: "apply",
                    retryable: false,
                    message: "forced apply failure".into(),
                });
            }
            Ok(vec![ResourceStatus { kind: "Deployment".into(), name: node.name.clone(), ready: true }])
        }

        async fn delete(&self, node: &ResolvedRelease) -> Result<Vec<ResourceStatus>> {
            self.call_order.lock().unwrap().push(node.id.0.clone());
            Ok(vec![ResourceStatus { kind: "Deployment".into(), name: node.name.clone(), ready: false }])
        }

        async fn diff(&self, _node: &ResolvedRelease, _manifest: &RenderedManifest) -> Result<String> {
            Ok(String::new())
        }
    }

    #[derive(Default)]
    pub struct FakeVerifyEngine {
        pub findings: Mutex<Vec<Finding>>,
    }

    #[async_trait]
    impl VerifyEngine for FakeVerifyEngine {
        async fn verify(&self, _objects: &[K8sObject], _ruleset: &str) -> Result<Vec<Finding>> {
            Ok(self.findings.lock().unwrap().clone())
        }
    }
}
