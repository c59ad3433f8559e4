//! Explain plan models.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse classification of a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanNodeKind {
    Scan,
    Join,
    Limit,
    Sort,
    Aggregate,
    Other,
}

impl PlanNodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "Scan",
            Self::Join => "Join",
            Self::Limit => "Limit",
            Self::Sort => "Sort",
            Self::Aggregate => "Aggregate",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for PlanNodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<&str> for PlanNodeKind {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// One node of a flattened plan tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Coarse node type.
    pub node_type: PlanNodeKind,
    /// Usually the relation name; empty when the node has none.
    pub label: String,
    /// Engine-specific description, e.g. the original node type name.
    pub detail: String,
    /// Planner row estimate.
    pub estimated_rows: f64,
    /// Planner total cost estimate.
    pub estimated_cost: f64,
    /// Whether the node reads a whole table without an index.
    pub full_table_scan: bool,
    /// Nesting depth in the original tree (root = 0).
    pub depth: usize,
}

/// A parsed plan: nodes in pre-order plus human-readable warnings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplainPlan {
    pub nodes: Vec<PlanNode>,
    pub warnings: Vec<String>,
}
