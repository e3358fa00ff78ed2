//! One function per selector kind (spec §4.2). Each selector only narrows
//! `nodes` and appends its own name to `SelectedBy`; it never touches any
//! other field.

use crate::plan::ResolvedRelease;
use std::collections::BTreeSet;
use std::path::Path;

pub fn by_names(nodes: Vec<ResolvedRelease>, names: &BTreeSet<String>) -> Vec<ResolvedRelease> {
    if names.is_empty() {
        return nodes;
    }
    retain_and_mark(nodes, "names", |n| names.contains(&n.name))
}

pub fn by_clusters(nodes: Vec<ResolvedRelease>, clusters: &BTreeSet<String>) -> Vec<ResolvedRelease> {
    if clusters.is_empty() {
        return nodes;
    }
    retain_and_mark(nodes, "clusters", |n| clusters.contains(&n.cluster))
}

pub fn by_tags(nodes: Vec<ResolvedRelease>, tags: &BTreeSet<String>) -> Vec<ResolvedRelease> {
    if tags.is_empty() {
        return nodes;
    }
    retain_and_mark(nodes, "tags", |n| n.tags.iter().any(|t| tags.contains(t)))
}

pub fn by_exclude_tags(nodes: Vec<ResolvedRelease>, tags: &BTreeSet<String>) -> Vec<ResolvedRelease> {
    if tags.is_empty() {
        return nodes;
    }
    nodes
        .into_iter()
        .filter(|n| !n.tags.iter().any(|t| tags.contains(t)))
        .collect()
}

/// `PathsChanged` selector: keep a release if its dir or any values file
/// contains a path in `changed`.
pub fn by_paths_changed(nodes: Vec<ResolvedRelease>, changed: &[std::path::PathBuf]) -> Vec<ResolvedRelease> {
    if changed.is_empty() {
        return nodes;
    }
    retain_and_mark(nodes, "paths", |n| {
        changed.iter().any(|c| path_touches(c, &n.dir, &n.values))
    })
}

fn path_touches(changed: &Path, dir: &Path, values: &[std::path::PathBuf]) -> bool {
    if changed.starts_with(dir) || dir.starts_with(changed) {
        return true;
    }
    values.iter().any(|v| v == changed)
}

fn retain_and_mark(
    nodes: Vec<ResolvedRelease>,
    label: &str,
    keep: impl Fn(&ResolvedRelease) -> bool,
) -> Vec<ResolvedRelease> {
    nodes
        .into_iter()
        .filter_map(|mut n| {
            if keep(&n) {
                n.selected_by.push(label.to_string());
                Some(n)
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ReleaseId;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn node(name: &str, tags: &[&str]) -> ResolvedRelease {
        ResolvedRelease {
            id: ReleaseId::new("c1", "ns", name),
            name: name.into(),
            cluster: "c1".into(),
            chart: "charts/x".into(),
            dir: PathBuf::from(format!("/stack/{name}")),
            namespace: "ns".into(),
            values: vec![],
            set: vec![],
            tags: tags.iter().map(|s| s.to_string()).collect(),
            needs: vec![],
            inferred_needs: vec![],
            infer_error: None,
            execution_group: None,
            selected_by: vec![],
        }
    }

    #[test]
    fn tags_selector_keeps_any_match_and_marks_selected_by() {
        let nodes = vec![node("a", &["web"]), node("b", &["db"])];
        let tags: BTreeSet<String> = ["web".to_string()].into_iter().collect();
        let kept = by_tags(nodes, &tags);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "a");
        assert_eq!(kept[0].selected_by, vec!["tags".to_string()]);
    }

    #[test]
    fn exclude_tags_drops_matches() {
        let nodes = vec![node("a", &["web"]), node("b", &["db"])];
        let tags: BTreeSet<String> = ["db".to_string()].into_iter().collect();
        let kept = by_exclude_tags(nodes, &tags);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "a");
    }
}
