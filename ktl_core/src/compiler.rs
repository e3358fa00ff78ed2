//! C2: compile a [`StackManifest`] into a [`Plan`] with stable IDs and
//! selector-applied membership (spec §4.2).

use crate::discovery::resolve_within_root;
use crate::error::{Error, Result};
use crate::git::GitRange;
use crate::manifest::StackManifest;
use crate::plan::{Plan, ReleaseId, ResolvedRelease};
use crate::selector;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub select_releases: BTreeSet<String>,
    pub include_deps: bool,
    pub select_clusters: BTreeSet<String>,
    pub select_tags: BTreeSet<String>,
    pub exclude_tags: BTreeSet<String>,
    pub git_range: Option<String>,
    pub git_include_deps: bool,
    pub paths_changed: Vec<PathBuf>,
    pub profile: Option<String>,
}

impl CompileOptions {
    pub fn validate(&self) -> Result<()> {
        if self.git_include_deps && self.git_range.is_none() {
            return Err(Error::Config(
                "GitIncludeDeps requires GitRange to be set".into(),
            ));
        }
        Ok(())
    }
}

pub fn compile(
    stack_root: &Path,
    manifest: &StackManifest,
    opts: &CompileOptions,
    changed_via_git: Option<&dyn GitRange>,
) -> Result<Plan> {
    opts.validate()?;

    // Step 1: assign stable IDs, reject duplicates.
    let mut seen_ids = HashSet::new();
    let mut nodes = Vec::with_capacity(manifest.releases.len());
    for spec in &manifest.releases {
        let id = ReleaseId::new(&spec.cluster.name, &spec.namespace, &spec.name);
        if !seen_ids.insert(id.clone()) {
            return Err(Error::Compile(format!("duplicate release id {id}")));
        }
        let dir = resolve_within_root(stack_root, &spec.chart)?;
        let mut values = Vec::with_capacity(spec.values.len());
        for v in &spec.values {
            values.push(resolve_within_root(stack_root, v)?);
        }

        // Step 2: normalize `needs`.
        let mut needs = spec.needs.clone();
        needs.sort();
        needs.dedup();

        nodes.push(ResolvedRelease {
            id,
            name: spec.name.clone(),
            cluster: spec.cluster.name.clone(),
            chart: spec.chart.clone(),
            dir,
            namespace: spec.namespace.clone(),
            values,
            set: spec.set.clone(),
            tags: spec.tags.iter().cloned().collect(),
            needs,
            inferred_needs: Vec::new(),
            infer_error: None,
            execution_group: None,
            selected_by: Vec::new(),
        });
    }

    // Validate cross-references before selection narrows anything: every
    // `needs` entry must name a release in the same cluster.
    validate_needs(&nodes)?;

    // Step 3: apply selectors in declared order.
    let mut kept = nodes.clone();
    kept = selector::by_names(kept, &opts.select_releases);
    kept = selector::by_clusters(kept, &opts.select_clusters);
    kept = selector::by_tags(kept, &opts.select_tags);
    kept = selector::by_exclude_tags(kept, &opts.exclude_tags);

    if let Some(range) = &opts.git_range {
        let differ = changed_via_git.ok_or_else(|| {
            Error::Config("GitRange set but no git collaborator available".into())
        })?;
        let changed = differ.changed_paths(range)?;
        kept = selector::by_paths_changed(kept, &changed);
    }
    if !opts.paths_changed.is_empty() {
        kept = selector::by_paths_changed(kept, &opts.paths_changed);
    }

    // Step 4: restore predecessor closure for include-deps flags.
    if opts.include_deps || (opts.git_include_deps && opts.git_range.is_some()) {
        kept = restore_predecessor_closure(&nodes, kept);
    }

    Ok(Plan::new(
        stack_root.to_path_buf(),
        manifest.name.clone(),
        opts.profile.clone().or_else(|| manifest.profile.clone()),
        kept,
    ))
}

fn validate_needs(nodes: &[ResolvedRelease]) -> Result<()> {
    for node in nodes {
        for dep_name in &node.needs {
            let found = nodes
                .iter()
                .any(|n| n.cluster == node.cluster && &n.name == dep_name);
            if !found {
                return Err(Error::Compile(format!(
                    "{} needs unknown peer {:?} in cluster {:?}",
                    node.id, dep_name, node.cluster
                )));
            }
        }
    }
    Ok(())
}

fn restore_predecessor_closure(
    all: &[ResolvedRelease],
    mut kept: Vec<ResolvedRelease>,
) -> Vec<ResolvedRelease> {
    let mut kept_ids: HashSet<ReleaseId> = kept.iter().map(|n| n.id.clone()).collect();
    let mut frontier: Vec<ReleaseId> = kept.iter().map(|n| n.id.clone()).collect();

    while let Some(id) = frontier.pop() {
        let Some(node) = all.iter().find(|n| n.id == id) else {
            continue;
        };
        for dep_name in &node.needs {
            if let Some(dep) = all
                .iter()
                .find(|n| n.cluster == node.cluster && &n.name == dep_name)
            {
                if kept_ids.insert(dep.id.clone()) {
                    let mut restored = dep.clone();
                    if !restored.selected_by.contains(&"deps".to_string()) {
                        restored.selected_by.push("deps".to_string());
                    }
                    kept.push(restored);
                    frontier.push(dep.id.clone());
                }
            }
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ClusterRef, ReleaseSpec};

    fn spec(name: &str, needs: &[&str]) -> ReleaseSpec {
        ReleaseSpec {
            name: name.into(),
            chart: format!("charts/{name}"),
            cluster: ClusterRef { name: "c1".into(), context: None },
            namespace: "ns".into(),
            values: vec![],
            set: vec![],
            needs: needs.iter().map(|s| s.to_string()).collect(),
            tags: Default::default(),
        }
    }

    fn manifest(releases: Vec<ReleaseSpec>) -> StackManifest {
        StackManifest {
            name: "s".into(),
            profile: None,
            cli: Default::default(),
            releases,
        }
    }

    #[test]
    fn duplicate_ids_fail() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(td.path().join("charts/crds")).unwrap();
        let m = manifest(vec![spec("crds", &[]), spec("crds", &[])]);
        let err = compile(td.path(), &m, &CompileOptions::default(), None).unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
    }

    #[test]
    fn unknown_need_fails() {
        let td = tempfile::tempdir().unwrap();
        let m = manifest(vec![spec("api", &["crds"])]);
        let err = compile(td.path(), &m, &CompileOptions::default(), None).unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
    }

    #[test]
    fn include_deps_restores_predecessors() {
        let td = tempfile::tempdir().unwrap();
        let m = manifest(vec![spec("crds", &[]), spec("api", &["crds"]), spec("frontend", &["api"])]);
        let mut opts = CompileOptions::default();
        opts.select_releases = ["frontend".to_string()].into_iter().collect();
        opts.include_deps = true;
        let plan = compile(td.path(), &m, &opts, None).unwrap();
        let names: BTreeSet<String> = plan.nodes.iter().map(|n| n.name.clone()).collect();
        assert_eq!(names, ["api", "crds", "frontend"].into_iter().map(String::from).collect());
    }

    #[test]
    fn plan_nodes_are_sorted_by_id() {
        let td = tempfile::tempdir().unwrap();
        let m = manifest(vec![spec("b", &[]), spec("a", &[])]);
        let plan = compile(td.path(), &m, &CompileOptions::default(), None).unwrap();
        let ids: Vec<String> = plan.nodes.iter().map(|n| n.id.0.clone()).collect();
        assert_eq!(ids, vec!["c1/ns/a".to_string(), "c1/ns/b".to_string()]);
    }
}
