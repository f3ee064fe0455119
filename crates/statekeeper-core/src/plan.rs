//! Plan value types produced by the diff engine.

use crate::error::StatekeeperError;
use crate::state::{DesiredDataset, DesiredPool, DesiredShare};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three declaratively managed resource kinds, in apply order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pool,
    Dataset,
    Share,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Pool, ResourceKind::Dataset, ResourceKind::Share];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pool => "pool",
            ResourceKind::Dataset => "dataset",
            ResourceKind::Share => "share",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = StatekeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pool" => Ok(ResourceKind::Pool),
            "dataset" => Ok(ResourceKind::Dataset),
            "share" => Ok(ResourceKind::Share),
            _ => Err(StatekeeperError::UnknownKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanAction {
    Create,
    Modify,
    Delete,
    Blocked,
    Nop,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PlanAction::Create => "CREATE",
            PlanAction::Modify => "MODIFY",
            PlanAction::Delete => "DELETE",
            PlanAction::Blocked => "BLOCKED",
            PlanAction::Nop => "NOP",
        };
        f.write_str(label)
    }
}

/// Operator-facing severity of one plan item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        })
    }
}

/// One differing field; rendered as `field: live → desired`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub live: String,
    pub desired: String,
}

impl FieldChange {
    pub fn new(field: impl Into<String>, live: impl Into<String>, desired: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            live: live.into(),
            desired: desired.into(),
        }
    }
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |value: &str| if value.is_empty() { "-".to_string() } else { value.to_string() };
        write!(f, "{}: {} → {}", self.field, show(&self.live), show(&self.desired))
    }
}

/// Full desired spec carried by Create/Modify items so apply never re-reads
/// the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredSpec {
    Pool(DesiredPool),
    Dataset(DesiredDataset),
    Share(DesiredShare),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    pub kind: ResourceKind,
    pub name: String,
    pub action: PlanAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    pub risk_level: RiskLevel,
    pub approved: bool,
    /// For Blocked items, what runs once approved (Delete or Modify).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withheld: Option<PlanAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<DesiredSpec>,
}

impl PlanItem {
    pub(crate) fn new(kind: ResourceKind, name: &str, action: PlanAction, risk: RiskLevel) -> Self {
        Self {
            kind,
            name: name.to_string(),
            action,
            changes: Vec::new(),
            block_reason: None,
            risk_level: risk,
            approved: false,
            withheld: None,
            desired: None,
        }
    }

    /// `<kind>/<name>`, the identity used by approvals.
    pub fn key(&self) -> String {
        item_key(self.kind, &self.name)
    }

    pub fn is_drift(&self) -> bool {
        self.action != PlanAction::Nop
    }
}

pub fn item_key(kind: ResourceKind, name: &str) -> String {
    format!("{kind}/{name}")
}

/// Aggregate counts, the part of a plan shown in status views.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub create_count: usize,
    pub modify_count: usize,
    pub delete_count: usize,
    pub blocked_count: usize,
    pub nop_count: usize,
    pub has_blocked: bool,
    pub safe_to_apply: bool,
}

/// A freshly computed reconciliation plan. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub items: Vec<PlanItem>,
    #[serde(flatten)]
    pub summary: PlanSummary,
}

impl Plan {
    pub fn from_items(items: Vec<PlanItem>) -> Self {
        let mut plan = Self {
            items,
            summary: PlanSummary::default(),
        };
        plan.recount();
        plan
    }

    /// Recompute counts and the apply verdict, e.g. after stamping approvals.
    pub fn recount(&mut self) {
        let mut summary = PlanSummary::default();
        for item in &self.items {
            match item.action {
                PlanAction::Create => summary.create_count += 1,
                PlanAction::Modify => summary.modify_count += 1,
                PlanAction::Delete => summary.delete_count += 1,
                PlanAction::Blocked => summary.blocked_count += 1,
                PlanAction::Nop => summary.nop_count += 1,
            }
        }
        summary.has_blocked = summary.blocked_count > 0;
        summary.safe_to_apply = self.unapproved_blocked().is_empty();
        self.summary = summary;
    }

    /// Keys of Blocked items still waiting for an operator.
    pub fn unapproved_blocked(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|item| item.action == PlanAction::Blocked && !item.approved)
            .map(PlanItem::key)
            .collect()
    }

    pub fn find(&self, kind: ResourceKind, name: &str) -> Option<&PlanItem> {
        self.items
            .iter()
            .find(|item| item.kind == kind && item.name == name)
    }

    /// True when anything differs between desired and live.
    pub fn is_drifted(&self) -> bool {
        self.items.iter().any(PlanItem::is_drift)
    }

    pub fn is_converged(&self) -> bool {
        self.summary.nop_count == self.items.len()
    }
}
