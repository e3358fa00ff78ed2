//! C9: render a [`Plan`] or [`Run`] for a human or another tool (spec §4.9).
//!
//! No table-formatting dependency: columns are aligned with a small
//! hand-rolled writer, the way the teacher's `shipcat_cli::list`/`show`
//! modules print plain-text tables.

use crate::error::Result;
use crate::plan::Plan;
use crate::run::{NodeStatus, Run};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Dot,
    Mermaid,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditFormat {
    Table,
    Json,
}

/// A wave-ordered plain-text table of every node in `plan`.
pub fn print_plan_table(plan: &Plan) -> String {
    let header = ["WAVE", "CLUSTER", "NAMESPACE", "NAME", "CHART", "NEEDS"];
    let mut rows: Vec<[String; 6]> = plan
        .nodes
        .iter()
        .map(|n| {
            [
                n.execution_group.map(|g| g.to_string()).unwrap_or_else(|| "?".into()),
                n.cluster.clone(),
                n.namespace.clone(),
                n.name.clone(),
                n.chart.clone(),
                n.all_needs().join(","),
            ]
        })
        .collect();
    rows.sort_by(|a, b| (&a[0], &a[1], &a[3]).cmp(&(&b[0], &b[1], &b[3])));
    render_table(&header, &rows)
}

fn render_table<const N: usize>(header: &[&str; N], rows: &[[String; N]]) -> String {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }
    let mut out = String::new();
    write_row(&mut out, &header.map(|h| h.to_string()), &widths);
    for row in rows {
        write_row(&mut out, row, &widths);
    }
    out
}

fn write_row<const N: usize>(out: &mut String, row: &[String; N], widths: &[usize]) {
    for (i, cell) in row.iter().enumerate() {
        if i > 0 {
            out.push_str("  ");
        }
        out.push_str(cell);
        out.push_str(&" ".repeat(widths[i].saturating_sub(cell.len())));
    }
    out.push('\n');
}

/// Renders the dependency graph in `plan` as `dot`, `mermaid`, or `json`.
pub fn render_graph(plan: &Plan, format: GraphFormat) -> Result<String> {
    match format {
        GraphFormat::Dot => Ok(render_dot(plan)),
        GraphFormat::Mermaid => Ok(render_mermaid(plan)),
        GraphFormat::Json => render_graph_json(plan),
    }
}

fn render_dot(plan: &Plan) -> String {
    let mut out = String::from("digraph stack {\n");
    for node in &plan.nodes {
        out.push_str(&format!("  \"{}\";\n", node.id));
    }
    for node in &plan.nodes {
        for dep_name in node.all_needs() {
            if let Some(dep) = plan.find_in_cluster(&node.cluster, &dep_name) {
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep.id, node.id));
            }
        }
    }
    out.push_str("}\n");
    out
}

fn render_mermaid(plan: &Plan) -> String {
    let mut out = String::from("graph TD\n");
    for node in &plan.nodes {
        for dep_name in node.all_needs() {
            if let Some(dep) = plan.find_in_cluster(&node.cluster, &dep_name) {
                out.push_str(&format!("  {}[{}] --> {}[{}]\n", slug(&dep.id.0), dep.id, slug(&node.id.0), node.id));
            }
        }
        if node.all_needs().is_empty() {
            out.push_str(&format!("  {}[{}]\n", slug(&node.id.0), node.id));
        }
    }
    out
}

fn slug(id: &str) -> String {
    id.chars().map(|c| if c.is_alphanumeric() { c } else { '_' }).collect()
}

#[derive(Serialize)]
struct GraphEdge {
    from: String,
    to: String,
}

#[derive(Serialize)]
struct GraphJson {
    nodes: Vec<String>,
    edges: Vec<GraphEdge>,
}

fn render_graph_json(plan: &Plan) -> Result<String> {
    let nodes = plan.nodes.iter().map(|n| n.id.0.clone()).collect();
    let mut edges = Vec::new();
    for node in &plan.nodes {
        for dep_name in node.all_needs() {
            if let Some(dep) = plan.find_in_cluster(&node.cluster, &dep_name) {
                edges.push(GraphEdge { from: dep.id.0.clone(), to: node.id.0.clone() });
            }
        }
    }
    Ok(serde_json::to_string_pretty(&GraphJson { nodes, edges })?)
}

#[derive(Serialize)]
struct AuditRow {
    node: String,
    status: String,
    attempts: usize,
}

/// Renders one run's final status per node, either as a table or as JSON.
pub fn render_audit(run: &Run, format: AuditFormat) -> Result<String> {
    let rows: Vec<AuditRow> = run
        .status_by_id
        .iter()
        .map(|(id, status)| AuditRow {
            node: id.0.clone(),
            status: status_label(*status).to_string(),
            attempts: run.attempts_by_id.get(id).map(|a| a.len()).unwrap_or(0),
        })
        .collect();

    match format {
        AuditFormat::Json => Ok(serde_json::to_string_pretty(&rows)?),
        AuditFormat::Table => {
            let header = ["NODE", "STATUS", "ATTEMPTS"];
            let str_rows: Vec<[String; 3]> =
                rows.iter().map(|r| [r.node.clone(), r.status.clone(), r.attempts.to_string()]).collect();
            Ok(render_table(&header, &str_rows))
        }
    }
}

fn status_label(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Pending => "pending",
        NodeStatus::Running => "running",
        NodeStatus::Succeeded => "succeeded",
        NodeStatus::Failed => "failed",
        NodeStatus::Blocked => "blocked",
        NodeStatus::Skipped => "skipped",
        NodeStatus::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ResolvedRelease;
    use crate::run::Command;
    use std::path::PathBuf;

    fn node(cluster: &str, name: &str, needs: Vec<&str>, wave: u32) -> ResolvedRelease {
        ResolvedRelease {
            id: crate::plan::ReleaseId::new(cluster, "ns", name),
            name: name.into(),
            cluster: cluster.into(),
            chart: "charts/x".into(),
            dir: PathBuf::from("/tmp"),
            namespace: "ns".into(),
            values: vec![],
            set: vec![],
            tags: vec![],
            needs: needs.into_iter().map(String::from).collect(),
            inferred_needs: vec![],
            infer_error: None,
            execution_group: Some(wave),
            selected_by: vec![],
        }
    }

    #[test]
    fn plan_table_has_aligned_header_and_rows() {
        let plan = Plan::new(
            PathBuf::from("/stack"),
            "s".into(),
            None,
            vec![node("c1", "api", vec!["db"], 1), node("c1", "db", vec![], 0)],
        );
        let table = print_plan_table(&plan);
        assert!(table.starts_with("WAVE"));
        assert!(table.contains("db"));
        assert!(table.contains("api"));
    }

    #[test]
    fn dot_graph_contains_dependency_edge() {
        let plan =
            Plan::new(PathBuf::from("/stack"), "s".into(), None, vec![node("c1", "api", vec!["db"], 1), node("c1", "db", vec![], 0)]);
        let dot = render_graph(&plan, GraphFormat::Dot).unwrap();
        assert!(dot.contains("\"c1/ns/db\" -> \"c1/ns/api\""));
    }

    #[test]
    fn json_graph_round_trips_through_serde() {
        let plan = Plan::new(PathBuf::from("/stack"), "s".into(), None, vec![node("c1", "api", vec![], 0)]);
        let json = render_graph(&plan, GraphFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["nodes"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn audit_json_lists_one_row_per_node() {
        let plan = Plan::new(PathBuf::from("/stack"), "s".into(), None, vec![node("c1", "api", vec![], 0)]);
        let run = Run::new("run-1".into(), Command::Apply, plan);
        let json = render_audit(&run, AuditFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 1);
    }
}
