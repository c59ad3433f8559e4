//! EXPLAIN output parsing.
//!
//! Every parser flattens the engine's plan tree into pre-order
//! [`PlanNode`]s and emits one warning per full table scan on a named
//! relation.

use crate::error::{CoreError, CoreResult};
use crate::models::{ExplainPlan, PlanNode, PlanNodeKind};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

fn full_scan_warning(relation: &str) -> String {
    format!("Full table scan on \"{relation}\"; consider adding an index")
}

fn json_f64(value: Option<&JsonValue>) -> f64 {
    match value {
        Some(JsonValue::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn json_str<'a>(obj: &'a Map<String, JsonValue>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(JsonValue::as_str).filter(|s| !s.is_empty())
}

// ========== PostgreSQL ==========

/// Parse the JSON produced by PostgreSQL's `EXPLAIN (FORMAT JSON)`.
///
/// The payload must be a non-empty array whose elements carry a `Plan`
/// object.
pub fn parse_explain_json(payload: &str) -> CoreResult<ExplainPlan> {
    let value: JsonValue =
        serde_json::from_str(payload).map_err(|e| CoreError::explain(format!("not valid JSON: {e}")))?;

    let entries = value
        .as_array()
        .ok_or_else(|| CoreError::explain("expected a JSON array at the top level"))?;
    if entries.is_empty() {
        return Err(CoreError::explain("plan array is empty"));
    }

    let mut plan = ExplainPlan::default();
    for entry in entries {
        let root = entry
            .get("Plan")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| CoreError::explain("plan entry has no \"Plan\" object"))?;
        walk_pg(root, 0, &mut plan);
    }
    Ok(plan)
}

fn classify_pg(node_type: &str) -> PlanNodeKind {
    if node_type.contains("Scan") {
        PlanNodeKind::Scan
    } else if node_type.contains("Join") || node_type == "Nested Loop" {
        PlanNodeKind::Join
    } else if node_type == "Limit" {
        PlanNodeKind::Limit
    } else if node_type.contains("Sort") {
        PlanNodeKind::Sort
    } else if node_type.contains("Aggregate") || node_type == "WindowAgg" || node_type == "Group" {
        PlanNodeKind::Aggregate
    } else {
        PlanNodeKind::Other
    }
}

fn walk_pg(node: &Map<String, JsonValue>, depth: usize, plan: &mut ExplainPlan) {
    let node_type = json_str(node, "Node Type").unwrap_or("Unknown");
    let relation = json_str(node, "Relation Name");
    let label = relation.or_else(|| json_str(node, "Alias")).unwrap_or_default();
    let full_table_scan = node_type == "Seq Scan" && relation.is_some();

    if let (true, Some(relation)) = (full_table_scan, relation) {
        plan.warnings.push(full_scan_warning(relation));
    }

    plan.nodes.push(PlanNode {
        node_type: classify_pg(node_type),
        label: label.to_string(),
        detail: node_type.to_string(),
        estimated_rows: json_f64(node.get("Plan Rows")),
        estimated_cost: json_f64(node.get("Total Cost")),
        full_table_scan,
        depth,
    });

    if let Some(children) = node.get("Plans").and_then(JsonValue::as_array) {
        for child in children.iter().filter_map(JsonValue::as_object) {
            walk_pg(child, depth + 1, plan);
        }
    }
}

// ========== MySQL ==========

/// Parse the JSON produced by MySQL's `EXPLAIN FORMAT=JSON`.
pub fn parse_mysql_explain_json(payload: &str) -> CoreResult<ExplainPlan> {
    let value: JsonValue =
        serde_json::from_str(payload).map_err(|e| CoreError::explain(format!("not valid JSON: {e}")))?;
    let block = value
        .get("query_block")
        .and_then(JsonValue::as_object)
        .ok_or_else(|| CoreError::explain("expected an object with a \"query_block\""))?;

    let mut plan = ExplainPlan::default();
    walk_mysql_block(block, 0, &mut plan);
    Ok(plan)
}

fn walk_mysql_block(block: &Map<String, JsonValue>, depth: usize, plan: &mut ExplainPlan) {
    let cost = block.get("cost_info").and_then(|c| c.get("query_cost"));
    let detail = match block.get("select_id") {
        Some(id) => format!("query_block #{id}"),
        None => "query_block".to_string(),
    };
    plan.nodes.push(PlanNode {
        node_type: PlanNodeKind::Other,
        label: String::new(),
        detail,
        estimated_rows: 0.0,
        estimated_cost: json_f64(cost),
        full_table_scan: false,
        depth,
    });
    walk_mysql_children(block, depth + 1, plan);
}

fn walk_mysql_children(obj: &Map<String, JsonValue>, depth: usize, plan: &mut ExplainPlan) {
    const WRAPPERS: &[(&str, PlanNodeKind)] = &[
        ("ordering_operation", PlanNodeKind::Sort),
        ("grouping_operation", PlanNodeKind::Aggregate),
        ("duplicates_removal", PlanNodeKind::Aggregate),
        ("windowing", PlanNodeKind::Aggregate),
    ];

    for (key, kind) in WRAPPERS {
        if let Some(inner) = obj.get(*key).and_then(JsonValue::as_object) {
            plan.nodes.push(PlanNode {
                node_type: *kind,
                label: String::new(),
                detail: key.to_string(),
                estimated_rows: 0.0,
                estimated_cost: 0.0,
                full_table_scan: false,
                depth,
            });
            walk_mysql_children(inner, depth + 1, plan);
        }
    }

    if let Some(loops) = obj.get("nested_loop").and_then(JsonValue::as_array) {
        plan.nodes.push(PlanNode {
            node_type: PlanNodeKind::Join,
            label: String::new(),
            detail: "nested_loop".to_string(),
            estimated_rows: 0.0,
            estimated_cost: 0.0,
            full_table_scan: false,
            depth,
        });
        for item in loops.iter().filter_map(JsonValue::as_object) {
            walk_mysql_children(item, depth + 1, plan);
        }
    }

    if let Some(table) = obj.get("table").and_then(JsonValue::as_object) {
        walk_mysql_table(table, depth, plan);
    }

    if let Some(union) = obj.get("union_result").and_then(JsonValue::as_object) {
        plan.nodes.push(PlanNode {
            node_type: PlanNodeKind::Other,
            label: json_str(union, "table_name").unwrap_or_default().to_string(),
            detail: "union_result".to_string(),
            estimated_rows: 0.0,
            estimated_cost: 0.0,
            full_table_scan: false,
            depth,
        });
        for spec in union
            .get("query_specifications")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
            .filter_map(JsonValue::as_object)
        {
            walk_mysql_children(spec, depth + 1, plan);
        }
    }

    if let Some(block) = obj.get("query_block").and_then(JsonValue::as_object) {
        walk_mysql_block(block, depth, plan);
    }

    for key in ["attached_subqueries", "optimized_away_subqueries"] {
        for sub in obj.get(key).and_then(JsonValue::as_array).into_iter().flatten().filter_map(JsonValue::as_object) {
            walk_mysql_children(sub, depth, plan);
        }
    }
}

fn walk_mysql_table(table: &Map<String, JsonValue>, depth: usize, plan: &mut ExplainPlan) {
    let name = json_str(table, "table_name").unwrap_or_default();
    let access_type = json_str(table, "access_type").unwrap_or("unknown");
    let full_table_scan = access_type == "ALL" && !name.is_empty();
    if full_table_scan {
        plan.warnings.push(full_scan_warning(name));
    }

    let detail = match json_str(table, "key") {
        Some(key) => format!("{access_type} using {key}"),
        None => access_type.to_string(),
    };
    let rows = table.get("rows_examined_per_scan").or_else(|| table.get("rows_produced_per_join"));
    let cost = table.get("cost_info").and_then(|c| c.get("prefix_cost").or_else(|| c.get("read_cost")));

    plan.nodes.push(PlanNode {
        node_type: PlanNodeKind::Scan,
        label: name.to_string(),
        detail,
        estimated_rows: json_f64(rows),
        estimated_cost: json_f64(cost),
        full_table_scan,
        depth,
    });

    if let Some(sub) = table.get("materialized_from_subquery").and_then(JsonValue::as_object) {
        walk_mysql_children(sub, depth + 1, plan);
    }
}

// ========== SQLite ==========

/// One row of SQLite's `EXPLAIN QUERY PLAN` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlanRow {
    pub id: i64,
    pub parent: i64,
    pub detail: String,
}

/// Build a plan from SQLite `EXPLAIN QUERY PLAN` rows.
///
/// Rows form a tree through their `parent` column; roots have parent 0.
pub fn parse_sqlite_query_plan(rows: &[QueryPlanRow]) -> CoreResult<ExplainPlan> {
    if rows.is_empty() {
        return Err(CoreError::explain("query plan has no rows"));
    }

    let mut children: BTreeMap<i64, Vec<&QueryPlanRow>> = BTreeMap::new();
    for row in rows {
        children.entry(row.parent).or_default().push(row);
    }

    let mut plan = ExplainPlan::default();
    walk_sqlite(0, 0, &children, &mut plan);
    // Rows whose parent never appeared would otherwise be dropped.
    if plan.nodes.len() < rows.len() {
        let seen: Vec<i64> = rows.iter().map(|r| r.id).collect();
        for (parent, _) in children.iter().filter(|(p, _)| **p != 0 && !seen.contains(p)) {
            walk_sqlite(*parent, 0, &children, &mut plan);
        }
    }
    Ok(plan)
}

fn walk_sqlite(parent: i64, depth: usize, children: &BTreeMap<i64, Vec<&QueryPlanRow>>, plan: &mut ExplainPlan) {
    let Some(rows) = children.get(&parent) else {
        return;
    };
    for row in rows {
        plan.nodes.push(classify_sqlite(&row.detail, depth, &mut plan.warnings));
        if row.id != parent {
            walk_sqlite(row.id, depth + 1, children, plan);
        }
    }
}

fn classify_sqlite(detail: &str, depth: usize, warnings: &mut Vec<String>) -> PlanNode {
    let mut words = detail.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let relation = match verb {
        "SCAN" | "SEARCH" => words.find(|w| *w != "TABLE").unwrap_or_default().to_string(),
        _ => String::new(),
    };

    let node_type = match verb {
        "SCAN" | "SEARCH" => PlanNodeKind::Scan,
        "USE" if detail.contains("ORDER BY") => PlanNodeKind::Sort,
        "USE" if detail.contains("GROUP BY") || detail.contains("DISTINCT") => PlanNodeKind::Aggregate,
        _ => PlanNodeKind::Other,
    };

    // "SCAN t USING COVERING INDEX i" walks an index, not the table.
    let full_table_scan = verb == "SCAN" && !relation.is_empty() && !detail.contains(" INDEX ");
    if full_table_scan {
        warnings.push(full_scan_warning(&relation));
    }

    PlanNode {
        node_type,
        label: relation,
        detail: detail.to_string(),
        estimated_rows: 0.0,
        estimated_cost: 0.0,
        full_table_scan,
        depth,
    }
}
