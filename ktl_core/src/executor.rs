//! C6: perform one operation for one [`ResolvedRelease`] (spec §4.6).

use crate::collaborators::{HelmRenderer, KubeApplier, RenderInput, Severity, VerifyEngine};
use crate::error::Result;
use crate::plan::ResolvedRelease;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub ok: bool,
    pub retryable: bool,
    /// Set when a verify finding at or above the configured `failOn`
    /// severity blocked this node. The Scheduler never retries a blocked
    /// result (spec §7).
    pub blocked: bool,
    pub err: Option<String>,
    pub artifacts: Vec<String>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn helm_apply(&self, node: &ResolvedRelease, attempt: u32) -> ExecResult;
    async fn helm_delete(&self, node: &ResolvedRelease, attempt: u32) -> ExecResult;
    async fn diff(&self, node: &ResolvedRelease, attempt: u32) -> ExecResult;
    async fn verify(&self, node: &ResolvedRelease, attempt: u32) -> ExecResult;
}

/// The only production [`Executor`]: renders through a [`HelmRenderer`],
/// applies/deletes/diffs through a [`KubeApplier`], and for `verify` checks
/// the rendered objects through a [`VerifyEngine`] against `ruleset`, blocking
/// the node if any finding reaches `fail_on` severity.
pub struct HelmExecutor {
    pub renderer: Arc<dyn HelmRenderer>,
    pub applier: Arc<dyn KubeApplier>,
    pub verifier: Arc<dyn VerifyEngine>,
    pub ruleset: String,
    pub fail_on: Severity,
}

impl HelmExecutor {
    async fn render(&self, node: &ResolvedRelease) -> Result<crate::collaborators::RenderedManifest> {
        self.renderer
            .render(RenderInput {
                chart: &node.chart,
                release_name: &node.name,
                namespace: &node.namespace,
                values: &node.values,
                set: &node.set,
            })
            .await
    }
}

#[async_trait]
impl Executor for HelmExecutor {
    async fn helm_apply(&self, node: &ResolvedRelease, _attempt: u32) -> ExecResult {
        let manifest = match self.render(node).await {
            Ok(m) => m,
            Err(e) => return err_result(&e),
        };
        match self.applier.apply(node, &manifest).await {
            Ok(statuses) => ExecResult {
                ok: true,
                retryable: false,
                blocked: false,
                err: None,
                artifacts: statuses.into_iter().map(|s| format!("{}/{}", s.kind, s.name)).collect(),
            },
            Err(e) => err_result(&e),
        }
    }

    async fn helm_delete(&self, node: &ResolvedRelease, _attempt: u32) -> ExecResult {
        match self.applier.delete(node).await {
            Ok(statuses) => ExecResult {
                ok: true,
                retryable: false,
                blocked: false,
                err: None,
                artifacts: statuses.into_iter().map(|s| format!("{}/{}", s.kind, s.name)).collect(),
            },
            Err(e) => err_result(&e),
        }
    }

    async fn diff(&self, node: &ResolvedRelease, _attempt: u32) -> ExecResult {
        let manifest = match self.render(node).await {
            Ok(m) => m,
            Err(e) => return err_result(&e),
        };
        match self.applier.diff(node, &manifest).await {
            Ok(text) => ExecResult { ok: true, retryable: false, blocked: false, err: None, artifacts: vec![text] },
            Err(e) => err_result(&e),
        }
    }

    async fn verify(&self, node: &ResolvedRelease, _attempt: u32) -> ExecResult {
        let manifest = match self.render(node).await {
            Ok(m) => m,
            Err(e) => return err_result(&e),
        };
        let findings = match self.verifier.verify(&manifest.objects, &self.ruleset).await {
            Ok(f) => f,
            Err(e) => return err_result(&e),
        };
        let blocked = findings.iter().any(|f| f.severity >= self.fail_on);
        let artifacts: Vec<String> = findings.iter().map(|f| format!("{:?}:{}:{}", f.severity, f.rule, f.message)).collect();
        if blocked {
            let err = Some(format!("{} verify finding(s) at or above {:?}", artifacts.len(), self.fail_on));
            return ExecResult { ok: false, retryable: false, blocked: true, err, artifacts };
        }
        ExecResult { ok: true, retryable: false, blocked: false, err: None, artifacts }
    }
}

fn err_result(e: &crate::error::Error) -> ExecResult {
    use crate::error::Retryable;
    ExecResult { ok: false, retryable: e.retryable(), blocked: false, err: Some(e.to_string()), artifacts: vec![] }
}
