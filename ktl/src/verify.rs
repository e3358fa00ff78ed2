//! A small built-in [`VerifyEngine`] over the same [`K8sObject`] model
//! [`crate::shell_helm`] already decodes from `helm template` output. Real
//! policy engines (OPA/Rego, admission webhooks) are out of scope here; this
//! exists so `ktl verify` has a genuine, if modest, ruleset to run rather
//! than a no-op stand-in.

use ktl_core::collaborators::{Finding, K8sObject, Severity, VerifyEngine};
use ktl_core::error::{Error, Result};

pub struct BuiltinVerifyEngine;

#[async_trait::async_trait]
impl VerifyEngine for BuiltinVerifyEngine {
    async fn verify(&self, objects: &[K8sObject], ruleset: &str) -> Result<Vec<Finding>> {
        if ruleset != "default" {
            return Err(Error::Config(format!("unknown verify ruleset {ruleset:?}")));
        }
        let mut findings = Vec::new();
        for object in objects {
            for container in &object.containers {
                check_image_tag(object, container, &mut findings);
                check_plaintext_secret_env(object, container, &mut findings);
            }
        }
        Ok(findings)
    }
}

fn check_image_tag(object: &K8sObject, container: &ktl_core::collaborators::Container, findings: &mut Vec<Finding>) {
    if container.image.is_empty() {
        findings.push(Finding {
            rule: "no-empty-image".into(),
            severity: Severity::Error,
            message: format!("{}/{}: container {:?} has no image", object.kind, object.name, container.name),
        });
        return;
    }
    let tag = container.image.rsplit_once(':').map(|(_, tag)| tag);
    if matches!(tag, None | Some("latest")) {
        findings.push(Finding {
            rule: "no-latest-tag".into(),
            severity: Severity::Warn,
            message: format!(
                "{}/{}: container {:?} image {:?} has no pinned tag",
                object.kind, object.name, container.name, container.image
            ),
        });
    }
}

fn check_plaintext_secret_env(object: &K8sObject, container: &ktl_core::collaborators::Container, findings: &mut Vec<Finding>) {
    for (key, value) in &container.env {
        let looks_secret = ["SECRET", "PASSWORD", "TOKEN"].iter().any(|needle| key.to_uppercase().contains(needle));
        if looks_secret && !value.is_empty() {
            findings.push(Finding {
                rule: "no-plaintext-secret-env".into(),
                severity: Severity::Warn,
                message: format!("{}/{}: container {:?} sets {:?} as a literal env value", object.kind, object.name, container.name, key),
            });
        }
    }
}
