//! The user's declarative input: `stack.yaml`.
//!
//! Schema mirrors §6.1 field-for-field. Unknown keys are rejected the way the
//! teacher rejects unknown keys on `Manifest` (`deny_unknown_fields`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Root of a stack manifest file.
///
/// ```yaml
/// name: platform
/// profile: prod
/// cli:
///   output: table
///   inferDeps: true
/// releases:
///   - name: crds
///     chart: charts/crds
///     cluster: { name: primary }
///     namespace: platform
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackManifest {
    pub name: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub cli: CliDefaults,
    #[serde(default)]
    pub releases: Vec<ReleaseSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliDefaults {
    #[serde(default)]
    pub output: OutputFormat,
    #[serde(default, rename = "inferDeps")]
    pub infer_deps: bool,
    #[serde(default)]
    pub selector: SelectorDefaults,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectorDefaults {
    #[serde(default, rename = "gitRange")]
    pub git_range: Option<String>,
    #[serde(default, rename = "gitIncludeDeps")]
    pub git_include_deps: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, rename = "excludeTags")]
    pub exclude_tags: Vec<String>,
    #[serde(default)]
    pub clusters: Vec<String>,
}

/// One declared release. `needs` names peer releases in the same cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReleaseSpec {
    pub name: String,
    pub chart: String,
    pub cluster: ClusterRef,
    pub namespace: String,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub set: Vec<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterRef {
    pub name: String,
    #[serde(default)]
    pub context: Option<String>,
}

impl StackManifest {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.cli.selector.git_include_deps && self.cli.selector.git_range.is_none() {
            return Err(crate::error::Error::Config(
                "cli.selector.gitIncludeDeps requires cli.selector.gitRange to be set".into(),
            ));
        }
        Ok(())
    }
}
