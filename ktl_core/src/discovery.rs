//! C1: walk a stack root, locate `stack.yaml`, resolve every referenced path.

use crate::error::{Error, Result};
use crate::manifest::{ReleaseSpec, StackManifest};
use std::fs;
use std::path::{Path, PathBuf};

pub const STACK_MANIFEST_FILE: &str = "stack.yaml";

/// A discovered release paired with the manifest's own location, for error
/// messages that need to point back at the source file.
pub struct Discovered {
    pub manifest: StackManifest,
    pub releases: Vec<(ReleaseSpec, PathBuf)>,
}

pub fn discover(stack_root: &Path) -> Result<Discovered> {
    let root = fs::canonicalize(stack_root)
        .map_err(|e| Error::Config(format!("stack root {stack_root:?} does not exist: {e}")))?;

    let manifest_path = root.join(STACK_MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(Error::Config(format!(
            "no {STACK_MANIFEST_FILE} found under {root:?}"
        )));
    }

    let raw = fs::read_to_string(&manifest_path)?;
    let manifest: StackManifest = serde_yaml::from_str(&raw)
        .map_err(|e| Error::Config(format!("{manifest_path:?}: {e}")))?;
    manifest.validate()?;

    let mut releases = Vec::with_capacity(manifest.releases.len());
    for spec in &manifest.releases {
        resolve_release_paths(&root, spec)?;
        releases.push((spec.clone(), manifest_path.clone()));
    }

    Ok(Discovered { manifest, releases })
}

/// Every chart dir and values file must resolve to a path under `root`.
fn resolve_release_paths(root: &Path, spec: &ReleaseSpec) -> Result<()> {
    resolve_within_root(root, &spec.chart)?;
    for v in &spec.values {
        resolve_within_root(root, v)?;
    }
    Ok(())
}

pub fn resolve_within_root(root: &Path, rel: &str) -> Result<PathBuf> {
    let joined = root.join(rel);
    let normalized = normalize_lexically(&joined);
    if !normalized.starts_with(root) {
        return Err(Error::Config(format!(
            "path {rel:?} escapes stack root {root:?}"
        )));
    }
    Ok(normalized)
}

/// Lexical normalization (no filesystem access) so paths that don't exist yet
/// (e.g. a values file not yet written) can still be escape-checked.
fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
