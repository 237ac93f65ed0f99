use serde::Serialize;
use thiserror::Error;

use crate::model::ProbeKind;

/// A single probe failed or timed out; the rest of the cycle continues.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[error("probe {probe} failed: {cause}")]
pub struct ProbeError {
    pub probe: ProbeKind,
    pub cause: String,
}

/// An expected field was absent from a probe row and defaulted to null.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[error("{probe}: field `{field}` missing for entity {entity_id}, defaulted to null")]
pub struct NormalizationGap {
    pub probe: ProbeKind,
    pub entity_id: String,
    pub field: String,
}

/// A rule could not be evaluated against a record and was skipped for the cycle.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[error("rule `{rule}` failed on entity {entity_id}: {reason}")]
pub struct RuleEvaluationError {
    pub rule: String,
    pub entity_id: String,
    pub reason: String,
}

/// A rule document entry that was rejected at load time.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[error("rule #{index} ({}) rejected: {reason}", .name.as_deref().unwrap_or("unnamed"))]
pub struct RuleRejection {
    pub index: usize,
    pub name: Option<String>,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("query failed: {0}")]
    Query(String),
    #[error("probe {0} is not supported by this source")]
    Unsupported(ProbeKind),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for SourceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                SourceError::Unavailable(err.to_string())
            }
            other => SourceError::Query(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum AnnotationFailure {
    #[error("annotation timed out")]
    Timeout,
    #[error("annotation deadline reached before completion")]
    DeadlineExceeded,
    #[error("annotation provider failed: {0}")]
    Provider(String),
    #[error("no annotation provider configured")]
    Unavailable,
}

#[derive(Debug, Clone, Error, Serialize, PartialEq)]
pub enum SinkError {
    #[error("sink unreachable: {0}")]
    Unreachable(String),
    #[error("sink refused request: {0}")]
    Refused(String),
    #[error("all {batches} batches failed, last error: {last}")]
    TotalFailure { batches: usize, last: String },
}

/// Failures that abort a whole cycle.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CycleError {
    #[error("all {0} probes failed")]
    AllProbesFailed(usize),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("cycle cancelled")]
    Cancelled,
}
