use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Uniform category every probe row is normalized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    QueryActivity,
    Transaction,
    ResourceCounter,
    SpaceUsage,
    IndexRecommendation,
    FaultEvent,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::QueryActivity,
        MetricKind::Transaction,
        MetricKind::ResourceCounter,
        MetricKind::SpaceUsage,
        MetricKind::IndexRecommendation,
        MetricKind::FaultEvent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::QueryActivity => "query_activity",
            MetricKind::Transaction => "transaction",
            MetricKind::ResourceCounter => "resource_counter",
            MetricKind::SpaceUsage => "space_usage",
            MetricKind::IndexRecommendation => "index_recommendation",
            MetricKind::FaultEvent => "fault_event",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown metric kind: {s}"))
    }
}

/// The fixed set of read-only probes issued every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Blocking,
    OpenTransactions,
    MissingIndexes,
    SlowQueries,
    CpuMemory,
    TempdbHealth,
    Deadlocks,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 7] = [
        ProbeKind::Blocking,
        ProbeKind::OpenTransactions,
        ProbeKind::MissingIndexes,
        ProbeKind::SlowQueries,
        ProbeKind::CpuMemory,
        ProbeKind::TempdbHealth,
        ProbeKind::Deadlocks,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProbeKind::Blocking => "blocking",
            ProbeKind::OpenTransactions => "open_transactions",
            ProbeKind::MissingIndexes => "missing_indexes",
            ProbeKind::SlowQueries => "slow_queries",
            ProbeKind::CpuMemory => "cpu_memory",
            ProbeKind::TempdbHealth => "tempdb_health",
            ProbeKind::Deadlocks => "deadlocks",
        }
    }

    /// Metric kind the probe's rows normalize into.
    pub fn metric_kind(self) -> MetricKind {
        match self {
            ProbeKind::Blocking | ProbeKind::SlowQueries => MetricKind::QueryActivity,
            ProbeKind::OpenTransactions => MetricKind::Transaction,
            ProbeKind::CpuMemory => MetricKind::ResourceCounter,
            ProbeKind::TempdbHealth => MetricKind::SpaceUsage,
            ProbeKind::MissingIndexes => MetricKind::IndexRecommendation,
            ProbeKind::Deadlocks => MetricKind::FaultEvent,
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProbeKind::ALL
            .into_iter()
            .find(|probe| probe.as_str() == s)
            .ok_or_else(|| format!("unknown probe: {s}"))
    }
}

/// A single attribute value. Missing or unmapped fields are `Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Scalar {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Identifier form used for entity ids: integral floats drop their fraction.
    pub fn to_identifier(&self) -> Option<String> {
        match self {
            Scalar::Null => None,
            Scalar::Bool(v) => Some(v.to_string()),
            Scalar::Int(v) => Some(v.to_string()),
            Scalar::Float(v) if v.fract() == 0.0 && v.abs() < 1e15 => Some(format!("{}", *v as i64)),
            Scalar::Float(v) => Some(v.to_string()),
            Scalar::Text(v) => {
                let trimmed = v.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
        }
    }

    /// True for zero-ish values: null, false, 0, "" and "0".
    pub fn is_zero(&self) -> bool {
        match self {
            Scalar::Null => true,
            Scalar::Bool(v) => !v,
            Scalar::Int(v) => *v == 0,
            Scalar::Float(v) => *v == 0.0,
            Scalar::Text(v) => {
                let trimmed = v.trim();
                trimmed.is_empty() || trimmed == "0"
            }
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("null"),
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Text(v) => f.write_str(v),
        }
    }
}

impl From<&serde_json::Value> for Scalar {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Scalar::Null,
            serde_json::Value::Bool(v) => Scalar::Bool(*v),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(v) => Scalar::Int(v),
                None => n.as_f64().map(Scalar::Float).unwrap_or(Scalar::Null),
            },
            serde_json::Value::String(v) => Scalar::Text(v.clone()),
            other => Scalar::Text(other.to_string()),
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

pub type Attributes = BTreeMap<String, Scalar>;

/// One raw row as returned by a metric source.
pub type Row = Attributes;

static NULL_SCALAR: Scalar = Scalar::Null;

/// Normalized metric produced fresh every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub kind: MetricKind,
    pub probe: ProbeKind,
    pub timestamp: DateTime<Utc>,
    pub entity_id: String,
    pub attributes: Attributes,
}

impl MetricRecord {
    pub fn attribute(&self, field: &str) -> &Scalar {
        self.attributes.get(field).unwrap_or(&NULL_SCALAR)
    }

    /// Returns a copy carrying an extra attribute; the original stays untouched.
    pub fn with_attribute(mut self, field: &str, value: impl Into<Scalar>) -> Self {
        self.attributes.insert(field.to_string(), value.into());
        self
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" | "warn" | "warning" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" | "crit" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    New,
    Ongoing,
    Escalated,
    Resolved,
}

impl AlertState {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertState::New => "new",
            AlertState::Ongoing => "ongoing",
            AlertState::Escalated => "escalated",
            AlertState::Resolved => "resolved",
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, AlertState::Resolved)
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an alert: at most one active alert exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AlertKey {
    pub rule_name: String,
    pub entity_id: String,
}

/// A rule match before lifecycle processing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateAlert {
    pub rule_name: String,
    pub entity_id: String,
    pub kind: MetricKind,
    pub probe: ProbeKind,
    pub severity: Severity,
    pub message: String,
    pub recommendations: Vec<String>,
}

impl CandidateAlert {
    pub fn key(&self) -> AlertKey {
        AlertKey {
            rule_name: self.rule_name.clone(),
            entity_id: self.entity_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationSource {
    Provider,
    Fallback,
}

/// Free-text enrichment attached to an emitted alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub summary: String,
    pub details: String,
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub source: AnnotationSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub rule_name: String,
    pub entity_id: String,
    pub kind: MetricKind,
    pub probe: ProbeKind,
    pub severity: Severity,
    pub state: AlertState,
    pub message: String,
    pub recommendations: Vec<String>,
    pub first_triggered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// When the alert entered its current state.
    pub transitioned_at: DateTime<Utc>,
    pub annotation: Option<Annotation>,
}

impl Alert {
    pub fn key(&self) -> AlertKey {
        AlertKey {
            rule_name: self.rule_name.clone(),
            entity_id: self.entity_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_probe_maps_to_a_kind_and_round_trips_its_name() {
        for probe in ProbeKind::ALL {
            assert_eq!(probe.as_str().parse::<ProbeKind>(), Ok(probe));
            let _ = probe.metric_kind();
        }
        for kind in MetricKind::ALL {
            assert_eq!(kind.as_str().parse::<MetricKind>(), Ok(kind));
        }
    }

    #[test]
    fn severity_orders_and_accepts_aliases() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert_eq!("crit".parse::<Severity>(), Ok(Severity::Critical));
        assert_eq!("warning".parse::<Severity>(), Ok(Severity::Medium));
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn scalar_identifiers_drop_integral_fractions() {
        assert_eq!(Scalar::Float(5.0).to_identifier().as_deref(), Some("5"));
        assert_eq!(Scalar::Int(42).to_identifier().as_deref(), Some("42"));
        assert_eq!(Scalar::Text("  ".into()).to_identifier(), None);
        assert_eq!(Scalar::Null.to_identifier(), None);
    }

    #[test]
    fn scalar_from_json_keeps_integers_integral() {
        let value = serde_json::json!({"a": 35000, "b": 1.5, "c": "x", "d": null});
        let map = value.as_object().expect("object");
        assert_eq!(Scalar::from(&map["a"]), Scalar::Int(35_000));
        assert_eq!(Scalar::from(&map["b"]), Scalar::Float(1.5));
        assert_eq!(Scalar::from(&map["c"]), Scalar::Text("x".into()));
        assert_eq!(Scalar::from(&map["d"]), Scalar::Null);
    }
}
