use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use super::expr::{CompareOp, ExprDoc};
use super::{Expr, Rule, Tier};
use crate::error::RuleRejection;
use crate::model::{MetricKind, ProbeKind, Scalar, Severity};

const DEFAULT_MESSAGE: &str = "{rule} matched {entity_id}";

#[derive(Debug, Deserialize)]
struct RulesDocument {
    #[serde(default)]
    rules: Vec<serde_yaml::Value>,
}

/// One rule entry. `event_type`/`id` and the flat `{field, op, value}` triple are
/// the compact form; `condition` takes a full expression tree.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleDoc {
    #[serde(default, alias = "id")]
    name: Option<String>,
    #[serde(default)]
    applies_to: Option<MetricKind>,
    #[serde(default, alias = "event_type")]
    probe: Option<ProbeKind>,
    #[serde(default)]
    condition: Option<ExprDoc>,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    op: Option<CompareOp>,
    #[serde(default)]
    value: Option<Scalar>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    tiers: Vec<TierDoc>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    recommendations: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TierDoc {
    #[serde(default)]
    field: Option<String>,
    op: CompareOp,
    value: Scalar,
    severity: String,
}

/// Rules accepted from one document plus the entries that were turned away.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub rejections: Vec<RuleRejection>,
}

impl RuleSet {
    /// Parse a rule document. Only an unreadable document is an error; bad entries
    /// are rejected individually.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let document: RulesDocument =
            serde_yaml::from_str(raw).context("rule document is not valid YAML")?;

        let mut set = RuleSet::default();
        let mut seen: HashSet<String> = HashSet::new();

        for (index, entry) in document.rules.into_iter().enumerate() {
            let name = entry
                .get("name")
                .or_else(|| entry.get("id"))
                .and_then(serde_yaml::Value::as_str)
                .map(str::to_string);

            let parsed = serde_yaml::from_value::<RuleDoc>(entry)
                .map_err(|err| err.to_string())
                .and_then(build_rule);

            match parsed {
                Ok(rule) if !seen.insert(rule.name.clone()) => {
                    set.rejections.push(RuleRejection {
                        index,
                        name,
                        reason: format!("duplicate rule name `{}`", rule.name),
                    });
                }
                Ok(rule) => set.rules.push(rule),
                Err(reason) => set.rejections.push(RuleRejection {
                    index,
                    name,
                    reason,
                }),
            }
        }

        Ok(set)
    }
}

fn build_rule(doc: RuleDoc) -> Result<Rule, String> {
    let name = doc
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or("rule needs a `name`")?;

    let applies_to = match (doc.applies_to, doc.probe) {
        (Some(kind), Some(probe)) if probe.metric_kind() != kind => {
            return Err(format!(
                "probe `{probe}` produces `{}` records, not `{kind}`",
                probe.metric_kind()
            ));
        }
        (Some(kind), _) => kind,
        (None, Some(probe)) => probe.metric_kind(),
        (None, None) => return Err("rule needs `applies_to` or `event_type`".into()),
    };

    let condition = match (doc.condition, doc.field, doc.op, doc.value) {
        (Some(_), Some(_), _, _) | (Some(_), _, Some(_), _) => {
            return Err("use either `condition` or `field`/`op`/`value`, not both".into());
        }
        (Some(condition), None, None, _) => Expr::try_from(condition)?,
        (None, Some(field), Some(op), Some(value)) if !field.trim().is_empty() && !value.is_null() => {
            Expr::Compare { field, op, value }
        }
        (None, _, _, _) => return Err("rule needs a `condition` or `field`, `op` and `value`".into()),
    };

    let severity = parse_severity(doc.severity.as_deref())?;

    let tiers = doc
        .tiers
        .into_iter()
        .map(|tier| -> Result<Tier, String> {
            let field = tier
                .field
                .or_else(|| condition.primary_field().map(str::to_string))
                .ok_or("tier needs a `field` when the condition has no comparison")?;
            Ok(Tier {
                field,
                op: tier.op,
                value: tier.value,
                severity: parse_severity(Some(tier.severity.as_str()))?,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;

    Ok(Rule {
        name,
        applies_to,
        probe: doc.probe,
        condition,
        severity,
        tiers,
        message: doc.message.unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
        recommendations: doc.recommendations,
    })
}

fn parse_severity(raw: Option<&str>) -> Result<Severity, String> {
    raw.map_or(Ok(Severity::default()), str::parse)
}

/// Rule set bound to a file, reloaded between cycles when the file changes.
#[derive(Debug)]
pub struct RuleStore {
    path: PathBuf,
    modified: Option<SystemTime>,
    current: Arc<RuleSet>,
}

impl RuleStore {
    /// Initial load. A missing file yields an empty rule set; unreadable YAML is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut store = Self {
            path,
            modified: None,
            current: Arc::new(RuleSet::default()),
        };
        if store.path.exists() {
            let (set, modified) = read_rules(&store.path)?;
            log_loaded(&store.path, &set);
            store.current = Arc::new(set);
            store.modified = modified;
        } else {
            warn!(path = %store.path.display(), "rule file not found; no rules loaded");
        }
        Ok(store)
    }

    pub fn from_set(set: RuleSet) -> Self {
        Self {
            path: PathBuf::new(),
            modified: None,
            current: Arc::new(set),
        }
    }

    pub fn current(&self) -> Arc<RuleSet> {
        Arc::clone(&self.current)
    }

    /// Reload when the file's modification time moved. Returns true on a
    /// successful reload; a failed reload keeps the previous rule set.
    pub fn reload_if_changed(&mut self) -> bool {
        if self.path.as_os_str().is_empty() {
            return false;
        }
        let modified = match std::fs::metadata(&self.path).and_then(|meta| meta.modified()) {
            Ok(modified) => Some(modified),
            Err(err) => {
                if self.modified.is_some() {
                    warn!(path = %self.path.display(), error = %err, "rule file unavailable; keeping previous rules");
                }
                return false;
            }
        };
        if modified == self.modified {
            return false;
        }

        match read_rules(&self.path) {
            Ok((set, modified)) => {
                log_loaded(&self.path, &set);
                self.current = Arc::new(set);
                self.modified = modified;
                true
            }
            Err(err) => {
                // Remember the broken revision so it is not re-parsed every cycle.
                self.modified = modified;
                warn!(path = %self.path.display(), error = ?err, "rule reload failed; keeping previous rules");
                false
            }
        }
    }
}

fn read_rules(path: &Path) -> Result<(RuleSet, Option<SystemTime>)> {
    let modified = std::fs::metadata(path).and_then(|meta| meta.modified()).ok();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rule file {}", path.display()))?;
    let set = RuleSet::from_yaml(&raw)
        .with_context(|| format!("failed to parse rule file {}", path.display()))?;
    Ok((set, modified))
}

fn log_loaded(path: &Path, set: &RuleSet) {
    info!(
        path = %path.display(),
        rules = set.rules.len(),
        rejected = set.rejections.len(),
        "loaded alert rules"
    );
    for rejection in &set.rejections {
        warn!(index = rejection.index, reason = %rejection.reason, "rejected alert rule");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
rules:
  - id: blocking
    event_type: blocking
    field: wait_time_ms
    op: ">"
    value: 30000
    severity: high
    message: "Session {entity_id} blocked for {wait_time_ms} ms"
    recommendations: ["Find the blocking session"]
    tiers:
      - {op: ">", value: 300000, severity: critical}
  - name: long_transaction
    applies_to: transaction
    condition:
      compare: {field: duration_seconds, op: ">=", value: 600}
  - name: broken
    applies_to: transaction
  - name: wrong_kind
    applies_to: transaction
    probe: blocking
    field: wait_time_ms
    op: ">"
    value: 1
  - name: blocking
    applies_to: query_activity
    field: elapsed_time_ms
    op: ">"
    value: 1
"#;

    #[test]
    fn malformed_entries_are_rejected_individually() {
        let set = RuleSet::from_yaml(DOCUMENT).expect("document");
        let names: Vec<_> = set.rules.iter().map(|rule| rule.name.as_str()).collect();
        assert_eq!(names, vec!["blocking", "long_transaction"]);

        let rejected: Vec<_> = set.rejections.iter().map(|r| r.index).collect();
        assert_eq!(rejected, vec![2, 3, 4]);
        assert!(set.rejections[2].reason.contains("duplicate"));
    }

    #[test]
    fn compact_form_maps_event_type_to_probe_and_kind() {
        let set = RuleSet::from_yaml(DOCUMENT).expect("document");
        let blocking = &set.rules[0];
        assert_eq!(blocking.applies_to, MetricKind::QueryActivity);
        assert_eq!(blocking.probe, Some(ProbeKind::Blocking));
        assert_eq!(blocking.severity, Severity::High);
        assert_eq!(blocking.tiers[0].field, "wait_time_ms");
        assert_eq!(blocking.tiers[0].severity, Severity::Critical);

        let long_tx = &set.rules[1];
        assert_eq!(long_tx.severity, Severity::Medium);
        assert_eq!(long_tx.message, DEFAULT_MESSAGE);
    }

    #[test]
    fn invalid_yaml_is_a_document_error() {
        assert!(RuleSet::from_yaml("rules: [unclosed").is_err());
    }

    #[test]
    fn failed_reload_keeps_previous_rules() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, DOCUMENT).expect("write");

        let mut store = RuleStore::load(&path).expect("store");
        assert_eq!(store.current().rules.len(), 2);

        std::fs::write(&path, "rules: [unclosed").expect("write");
        // Force a different modification time than the one recorded.
        store.modified = Some(SystemTime::UNIX_EPOCH);
        assert!(!store.reload_if_changed());
        assert_eq!(store.current().rules.len(), 2);

        std::fs::write(&path, "rules: []\n").expect("write");
        store.modified = Some(SystemTime::UNIX_EPOCH);
        assert!(store.reload_if_changed());
        assert!(store.current().rules.is_empty());
    }

    #[test]
    fn missing_file_loads_no_rules() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RuleStore::load(dir.path().join("absent.yaml")).expect("store");
        assert!(store.current().rules.is_empty());
    }
}
