use std::sync::Arc;

use tracing::{debug, warn};

use super::{Rule, RuleSet};
use crate::correlation::CorrelationView;
use crate::error::RuleEvaluationError;
use crate::model::{CandidateAlert, MetricRecord, Scalar, Severity};

const CORRELATION_PREFIX: &str = "correlation.";

#[derive(Debug, Default)]
pub struct Evaluation {
    pub candidates: Vec<CandidateAlert>,
    pub errors: Vec<RuleEvaluationError>,
}

/// Stateless evaluator over an immutable rule set.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Arc<RuleSet>,
}

impl RuleEngine {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules.rules
    }

    pub fn evaluate(&self, metrics: &[MetricRecord], view: &CorrelationView) -> Evaluation {
        let mut evaluation = Evaluation::default();
        for record in metrics {
            for rule in self.rules().iter().filter(|rule| rule.applies(record)) {
                match evaluate_rule(rule, record, view) {
                    Ok(Some(candidate)) => evaluation.candidates.push(candidate),
                    Ok(None) => {}
                    Err(reason) => {
                        warn!(rule = %rule.name, entity = %record.entity_id, %reason, "rule evaluation failed");
                        evaluation.errors.push(RuleEvaluationError {
                            rule: rule.name.clone(),
                            entity_id: record.entity_id.clone(),
                            reason,
                        });
                    }
                }
            }
        }
        debug!(
            candidates = evaluation.candidates.len(),
            errors = evaluation.errors.len(),
            "rules evaluated"
        );
        evaluation
    }
}

fn evaluate_rule(
    rule: &Rule,
    record: &MetricRecord,
    view: &CorrelationView,
) -> Result<Option<CandidateAlert>, String> {
    let lookup = |field: &str| resolve_field(record, view, field);
    if !rule.condition.eval(&lookup)? {
        return Ok(None);
    }

    let mut tier_severity: Option<Severity> = None;
    for tier in &rule.tiers {
        let crossed = tier
            .op
            .check(&lookup(&tier.field), &tier.value)
            .map_err(|reason| format!("tier on `{}`: {reason}", tier.field))?;
        if crossed {
            tier_severity = tier_severity.max(Some(tier.severity));
        }
    }
    let severity = tier_severity.unwrap_or(rule.severity);

    Ok(Some(CandidateAlert {
        rule_name: rule.name.clone(),
        entity_id: record.entity_id.clone(),
        kind: record.kind,
        probe: record.probe,
        severity,
        message: render_message(&rule.message, &rule.name, severity, &lookup),
        recommendations: rule.recommendations.clone(),
    }))
}

fn resolve_field(record: &MetricRecord, view: &CorrelationView, field: &str) -> Scalar {
    if let Some(name) = field.strip_prefix(CORRELATION_PREFIX) {
        return view.field(record.kind, &record.entity_id, name);
    }
    match field {
        "entity_id" => Scalar::Text(record.entity_id.clone()),
        "kind" => Scalar::from(record.kind.as_str()),
        "probe" => Scalar::from(record.probe.as_str()),
        _ => record.attribute(field).clone(),
    }
}

/// Substitute `{name}` placeholders. `{rule}` and `{severity}` are built in; other
/// names resolve through `lookup`, and unresolved placeholders are left untouched.
pub fn render_message<F>(template: &str, rule: &str, severity: Severity, lookup: &F) -> String
where
    F: Fn(&str) -> Scalar,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = &after[..close];
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        let value = if !valid {
            None
        } else {
            match name {
                "rule" => Some(rule.to_string()),
                "severity" => Some(severity.to_string()),
                _ => Some(lookup(name)).filter(|v| !v.is_null()).map(|v| v.to_string()),
            }
        };
        match value {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[open..open + close + 2]),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}
