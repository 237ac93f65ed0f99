//! Declarative alert rules: YAML documents, predicate trees and evaluation.

mod engine;
mod expr;
mod loader;

pub use engine::{Evaluation, RuleEngine, render_message};
pub use expr::{CompareOp, Expr};
pub use loader::{RuleSet, RuleStore};

use crate::model::{MetricKind, MetricRecord, ProbeKind, Scalar, Severity};

/// Severity override applied when its threshold is crossed.
#[derive(Debug, Clone, PartialEq)]
pub struct Tier {
    pub field: String,
    pub op: CompareOp,
    pub value: Scalar,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub name: String,
    pub applies_to: MetricKind,
    pub probe: Option<ProbeKind>,
    pub condition: Expr,
    pub severity: Severity,
    pub tiers: Vec<Tier>,
    pub message: String,
    pub recommendations: Vec<String>,
}

impl Rule {
    pub fn applies(&self, record: &MetricRecord) -> bool {
        record.kind == self.applies_to && self.probe.is_none_or(|probe| probe == record.probe)
    }
}
