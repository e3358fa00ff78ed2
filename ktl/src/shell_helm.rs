//! A minimal [`HelmRenderer`]/[`KubeApplier`] pair that shells out to the
//! `helm` binary on `PATH`.
//!
//! Chart templating and Kubernetes API client construction are explicit
//! Non-goals of the engine (`ktl_core` only consumes the narrow collaborator
//! traits); this is the CLI's own process-invocation adapter, the same way
//! `ktl_core::git::SystemGit` shells out to `git` rather than linking a
//! libgit2 binding.

use ktl_core::collaborators::{Container, HelmRenderer, K8sObject, KubeApplier, RenderInput, RenderedManifest, ResourceStatus};
use ktl_core::error::{Error, Result};
use ktl_core::plan::{ReleaseId, ResolvedRelease};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::process::Command;

pub struct ShellHelm;

#[async_trait::async_trait]
impl HelmRenderer for ShellHelm {
    async fn render(&self, input: RenderInput<'_>) -> Result<RenderedManifest> {
        let chart = input.chart.to_string();
        let release_name = input.release_name.to_string();
        let namespace = input.namespace.to_string();
        let values: Vec<PathBuf> = input.values.to_vec();
        let set: Vec<String> = input.set.to_vec();
        let for_join_error = release_name.clone();

        tokio::task::spawn_blocking(move || run_helm_template(&chart, &release_name, &namespace, &values, &set))
            .await
            .map_err(|e| render_error(&for_join_error, true, format!("render task panicked: {e}")))?
    }
}

fn run_helm_template(
    chart: &str,
    release_name: &str,
    namespace: &str,
    values: &[PathBuf],
    set: &[String],
) -> Result<RenderedManifest> {
    let mut cmd = Command::new("helm");
    cmd.args(["template", release_name, chart, "--namespace", namespace]);
    for v in values {
        cmd.arg("--values").arg(v);
    }
    for s in set {
        cmd.arg("--set").arg(s);
    }

    let output = cmd.output().map_err(|e| render_error(release_name, true, format!("failed to run helm: {e}")))?;
    if !output.status.success() {
        return Err(render_error(
            release_name,
            false,
            format!("helm template exited with {}: {}", output.status, String::from_utf8_lossy(&output.stderr)),
        ));
    }

    let stdout = output.stdout;
    let mut hasher = Sha256::new();
    hasher.update(&stdout);
    let digest: [u8; 32] = hasher.finalize().into();

    let objects = parse_objects(&stdout, namespace);
    Ok(RenderedManifest { objects, digest, chart_version: "unknown".into(), notes: String::new() })
}

/// Best-effort decode of `helm template`'s multi-document YAML stream. Only
/// the handful of fields [`crate::infer`] needs are pulled out; anything
/// un-parseable is skipped rather than failing the whole render.
fn parse_objects(rendered: &[u8], default_namespace: &str) -> Vec<K8sObject> {
    let text = String::from_utf8_lossy(rendered);
    let mut objects = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&text) {
        let Ok(raw) = RawObject::deserialize(doc) else { continue };
        if raw.kind.is_empty() || raw.metadata.name.is_empty() {
            continue;
        }
        let namespace = raw.metadata.namespace.unwrap_or_else(|| default_namespace.to_string());
        let RawPodContents { containers: raw_containers, volumes } = raw.pod_contents();
        let containers = raw_containers.into_iter().map(|c| container_from_raw(c, &volumes)).collect();
        objects.push(K8sObject {
            kind: raw.kind,
            name: raw.metadata.name,
            namespace,
            labels: raw.metadata.labels,
            containers,
            produces_service: false,
            produces_config_map: false,
            produces_secret: false,
        });
    }
    objects
}

#[derive(Deserialize, Default)]
struct RawObject {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: RawMetadata,
    #[serde(default)]
    spec: Option<serde_yaml::Value>,
}

#[derive(Deserialize, Default)]
struct RawMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    labels: std::collections::BTreeMap<String, String>,
}

#[derive(Deserialize, Default)]
struct RawContainer {
    #[serde(default)]
    name: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<RawEnvVar>,
    #[serde(default, rename = "envFrom")]
    env_from: Vec<RawEnvFrom>,
    #[serde(default, rename = "volumeMounts")]
    volume_mounts: Vec<RawVolumeMount>,
}

#[derive(Deserialize, Default)]
struct RawEnvVar {
    name: String,
    #[serde(default)]
    value: String,
    #[serde(default, rename = "valueFrom")]
    value_from: Option<RawEnvVarSource>,
}

#[derive(Deserialize, Default)]
struct RawEnvVarSource {
    #[serde(default, rename = "configMapKeyRef")]
    config_map_key_ref: Option<RawRef>,
    #[serde(default, rename = "secretKeyRef")]
    secret_key_ref: Option<RawRef>,
}

#[derive(Deserialize, Default)]
struct RawEnvFrom {
    #[serde(default, rename = "configMapRef")]
    config_map_ref: Option<RawRef>,
    #[serde(default, rename = "secretRef")]
    secret_ref: Option<RawRef>,
}

#[derive(Deserialize, Default)]
struct RawRef {
    name: String,
}

#[derive(Deserialize, Default)]
struct RawVolumeMount {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize, Default)]
struct RawVolume {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "configMap")]
    config_map: Option<RawRef>,
    #[serde(default)]
    secret: Option<RawSecretVolumeSource>,
}

#[derive(Deserialize, Default)]
struct RawSecretVolumeSource {
    #[serde(default, rename = "secretName")]
    secret_name: String,
}

#[derive(Default)]
struct RawPodContents {
    containers: Vec<RawContainer>,
    volumes: Vec<RawVolume>,
}

impl RawObject {
    /// Pod-template-bearing workload kinds nest `spec.template.spec`;
    /// `CronJob` nests one level deeper under `jobTemplate`. Pulls
    /// `containers`/`initContainers`/`ephemeralContainers` together with
    /// `volumes`, so callers can resolve each container's `volumeMounts`
    /// back to the ConfigMap/Secret a volume actually sources from.
    fn pod_contents(&self) -> RawPodContents {
        let Some(spec) = &self.spec else { return RawPodContents::default() };
        let pod_spec = if self.kind == "CronJob" {
            spec.get("jobTemplate")
                .and_then(|v| v.get("spec"))
                .and_then(|v| v.get("template"))
                .and_then(|v| v.get("spec"))
        } else {
            spec.get("template").and_then(|v| v.get("spec"))
        };
        let Some(pod_spec) = pod_spec else { return RawPodContents::default() };

        let mut containers = Vec::new();
        for key in ["containers", "initContainers", "ephemeralContainers"] {
            if let Some(v) = pod_spec.get(key) {
                let parsed: Vec<RawContainer> = serde_yaml::from_value(v.clone()).unwrap_or_default();
                containers.extend(parsed);
            }
        }
        let volumes: Vec<RawVolume> =
            pod_spec.get("volumes").and_then(|v| serde_yaml::from_value(v.clone()).ok()).unwrap_or_default();

        RawPodContents { containers, volumes }
    }
}

fn container_from_raw(raw: RawContainer, volumes: &[RawVolume]) -> Container {
    let mut env_from_config_maps = Vec::new();
    let mut env_from_secrets = Vec::new();
    for ef in &raw.env_from {
        if let Some(r) = &ef.config_map_ref {
            env_from_config_maps.push(r.name.clone());
        }
        if let Some(r) = &ef.secret_ref {
            env_from_secrets.push(r.name.clone());
        }
    }

    // env[].valueFrom references a ConfigMap/Secret directly (rather than
    // importing its whole keyset like envFrom), but it is the same kind of
    // dependency edge for inference purposes.
    let mut env = Vec::with_capacity(raw.env.len());
    for e in &raw.env {
        if let Some(src) = &e.value_from {
            if let Some(r) = &src.config_map_key_ref {
                env_from_config_maps.push(r.name.clone());
            }
            if let Some(r) = &src.secret_key_ref {
                env_from_secrets.push(r.name.clone());
            }
        }
        env.push((e.name.clone(), e.value.clone()));
    }

    let mut volume_mounts_config_maps = Vec::new();
    let mut volume_mounts_secrets = Vec::new();
    for mount in &raw.volume_mounts {
        let Some(volume) = volumes.iter().find(|v| v.name == mount.name) else { continue };
        if let Some(cm) = &volume.config_map {
            volume_mounts_config_maps.push(cm.name.clone());
        }
        if let Some(secret) = &volume.secret {
            volume_mounts_secrets.push(secret.secret_name.clone());
        }
    }

    Container {
        name: raw.name,
        image: raw.image,
        env,
        env_from_config_maps,
        env_from_secrets,
        volume_mounts_config_maps,
        volume_mounts_secrets,
        command: raw.command,
        args: raw.args,
    }
}

fn render_error(release_name: &str, retryable: bool, message: String) -> Error {
    Error::Render {
        node: ReleaseId(release_name.to_string()),
        retryable,
        source: Box::new(Error::Config(message)),
    }
}

pub struct ShellKube;

#[async_trait::async_trait]
impl KubeApplier for ShellKube {
    async fn apply(&self, node: &ResolvedRelease, _manifest: &RenderedManifest) -> Result<Vec<ResourceStatus>> {
        let name = node.name.clone();
        let chart = node.chart.clone();
        let namespace = node.namespace.clone();
        let values = node.values.clone();
        let set = node.set.clone();
        let id = node.id.clone();

        tokio::task::spawn_blocking(move || {
            let mut cmd = Command::new("helm");
            cmd.args(["upgrade", "--install", &name, &chart, "--namespace", &namespace, "--create-namespace"]);
            for v in &values {
                cmd.arg("--values").arg(v);
            }
            for s in &set {
                cmd.arg("--set").arg(s);
            }
            let output = cmd.output().map_err(|e| exec_error(&id, "apply", true, format!("failed to run helm: {e}")))?;
            if !output.status.success() {
                return Err(exec_error(
                    &id,
                    "apply",
                    false,
                    format!("helm upgrade exited with {}: {}", output.status, String::from_utf8_lossy(&output.stderr)),
                ));
            }
            Ok(vec![ResourceStatus { kind: "Release".into(), name, ready: true }])
        })
        .await
        .map_err(|e| exec_error(&node.id, "apply", true, format!("apply task panicked: {e}")))?
    }

    async fn delete(&self, node: &ResolvedRelease) -> Result<Vec<ResourceStatus>> {
        let name = node.name.clone();
        let namespace = node.namespace.clone();
        let id = node.id.clone();

        tokio::task::spawn_blocking(move || {
            let output = Command::new("helm")
                .args(["uninstall", &name, "--namespace", &namespace])
                .output()
                .map_err(|e| exec_error(&id, "delete", true, format!("failed to run helm: {e}")))?;
            if !output.status.success() {
                return Err(exec_error(
                    &id,
                    "delete",
                    false,
                    format!("helm uninstall exited with {}: {}", output.status, String::from_utf8_lossy(&output.stderr)),
                ));
            }
            Ok(vec![ResourceStatus { kind: "Release".into(), name, ready: false }])
        })
        .await
        .map_err(|e| exec_error(&node.id, "delete", true, format!("delete task panicked: {e}")))?
    }

    async fn diff(&self, node: &ResolvedRelease, _manifest: &RenderedManifest) -> Result<String> {
        let name = node.name.clone();
        let chart = node.chart.clone();
        let namespace = node.namespace.clone();
        let id = node.id.clone();

        tokio::task::spawn_blocking(move || {
            let output = Command::new("helm")
                .args(["diff", "upgrade", &name, &chart, "--namespace", &namespace])
                .output()
                .map_err(|e| exec_error(&id, "diff", true, format!("failed to run helm diff: {e}")))?;
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
        .await
        .map_err(|e| exec_error(&node.id, "diff", true, format!("diff task panicked: {e}")))?
    }
}

fn exec_error(id: &ReleaseId, op: &'static str, retryable: bool, message: String) -> Error {
    Error::Exec { node: id.clone(), op, retryable, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_init_and_ephemeral_containers_alongside_containers() {
        let yaml = r#"
kind: Deployment
metadata:
  name: api
spec:
  template:
    spec:
      initContainers:
        - name: migrate
          image: api:1.0
      containers:
        - name: api
          image: api:1.0
      ephemeralContainers:
        - name: debug
          image: busybox:1.0
"#;
        let objects = parse_objects(yaml.as_bytes(), "ns");
        assert_eq!(objects.len(), 1);
        let names: Vec<&str> = objects[0].containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["migrate", "api", "debug"]);
    }

    #[test]
    fn resolves_volume_mounts_back_to_config_map_and_secret_names() {
        let yaml = r#"
kind: Deployment
metadata:
  name: api
spec:
  template:
    spec:
      volumes:
        - name: settings
          configMap:
            name: api-config
        - name: creds
          secret:
            secretName: api-secret
      containers:
        - name: api
          image: api:1.0
          volumeMounts:
            - name: settings
              mountPath: /etc/settings
            - name: creds
              mountPath: /etc/creds
"#;
        let objects = parse_objects(yaml.as_bytes(), "ns");
        let container = &objects[0].containers[0];
        assert_eq!(container.volume_mounts_config_maps, vec!["api-config".to_string()]);
        assert_eq!(container.volume_mounts_secrets, vec!["api-secret".to_string()]);
    }

    #[test]
    fn resolves_env_value_from_config_map_and_secret_key_refs() {
        let yaml = r#"
kind: Deployment
metadata:
  name: api
spec:
  template:
    spec:
      containers:
        - name: api
          image: api:1.0
          env:
            - name: DB_HOST
              valueFrom:
                configMapKeyRef:
                  name: api-config
                  key: dbHost
            - name: DB_PASSWORD
              valueFrom:
                secretKeyRef:
                  name: api-secret
                  key: dbPassword
"#;
        let objects = parse_objects(yaml.as_bytes(), "ns");
        let container = &objects[0].containers[0];
        assert_eq!(container.env_from_config_maps, vec!["api-config".to_string()]);
        assert_eq!(container.env_from_secrets, vec!["api-secret".to_string()]);
    }
}
