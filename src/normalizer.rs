//! Maps source-specific probe rows onto [`MetricRecord`]s.
//!
//! Every metric kind has exactly one normalizer. Field aliases seen in captured
//! samples are folded onto canonical names; expected fields that are missing are
//! set to `Scalar::Null` and reported as gaps instead of failing the row.

use chrono::{DateTime, Utc};

use crate::collector::RawProbeResult;
use crate::error::NormalizationGap;
use crate::model::{Attributes, MetricKind, MetricRecord, ProbeKind, Row, Scalar};

/// `(alias, canonical)` pairs applied before anything else.
const FIELD_ALIASES: &[(&str, &str)] = &[
    ("session", "session_id"),
    ("spid", "session_id"),
    ("pid", "session_id"),
    ("blocked_session", "blocked_session_id"),
    ("blocking_session", "blocking_session_id"),
    ("blocker_session_id", "blocking_session_id"),
    ("wait_ms", "wait_time_ms"),
    ("wait_time", "wait_time_ms"),
    ("elapsed_ms", "elapsed_time_ms"),
    ("txn_id", "transaction_id"),
    ("database", "database_name"),
    ("table", "table_name"),
];

fn expected_fields(probe: ProbeKind) -> &'static [&'static str] {
    match probe {
        ProbeKind::Blocking => &["blocking_session_id", "wait_time_ms"],
        ProbeKind::SlowQueries => &["elapsed_time_ms"],
        ProbeKind::OpenTransactions => &["duration_seconds"],
        ProbeKind::MissingIndexes => &["table_name", "avg_user_impact"],
        ProbeKind::CpuMemory | ProbeKind::TempdbHealth | ProbeKind::Deadlocks => &[],
    }
}

#[derive(Debug, Default)]
pub struct Normalized {
    pub records: Vec<MetricRecord>,
    pub gaps: Vec<NormalizationGap>,
}

/// Normalize every row of one probe result.
pub fn normalize(result: &RawProbeResult) -> Normalized {
    let mut out = Normalized::default();
    for (ordinal, row) in result.rows.iter().enumerate() {
        let (record, gaps) = normalize_row(result.probe, result.collected_at, ordinal, row);
        out.records.push(record);
        out.gaps.extend(gaps);
    }
    out
}

pub fn normalize_row(
    probe: ProbeKind,
    timestamp: DateTime<Utc>,
    ordinal: usize,
    row: &Row,
) -> (MetricRecord, Vec<NormalizationGap>) {
    let mut attributes = canonicalize(row);

    let entity_id = match probe.metric_kind() {
        MetricKind::QueryActivity => query_activity(&mut attributes),
        MetricKind::Transaction => transaction(&mut attributes),
        MetricKind::ResourceCounter => resource_counter(&mut attributes),
        MetricKind::SpaceUsage => space_usage(&mut attributes),
        MetricKind::IndexRecommendation => index_recommendation(&mut attributes),
        MetricKind::FaultEvent => fault_event(&mut attributes),
    }
    .unwrap_or_else(|| format!("{probe}#{ordinal}"));

    let mut gaps = Vec::new();
    for field in expected_fields(probe) {
        let present = attributes.get(*field).is_some_and(|value| !value.is_null());
        if !present {
            attributes.insert((*field).to_string(), Scalar::Null);
            gaps.push(NormalizationGap {
                probe,
                entity_id: entity_id.clone(),
                field: (*field).to_string(),
            });
        }
    }

    let record = MetricRecord {
        kind: probe.metric_kind(),
        probe,
        timestamp,
        entity_id,
        attributes,
    };
    (record, gaps)
}

fn canonicalize(row: &Row) -> Attributes {
    let mut attributes = Attributes::new();
    for (key, value) in row {
        let key = key.trim().to_ascii_lowercase();
        let canonical = FIELD_ALIASES
            .iter()
            .find(|(alias, _)| *alias == key)
            .map(|(_, canonical)| (*canonical).to_string());
        let canonical = match canonical {
            // A canonical name present in the row wins over its alias.
            Some(canonical) if row.contains_key(&canonical) => continue,
            Some(canonical) => canonical,
            None => key,
        };
        attributes.entry(canonical).or_insert_with(|| value.clone());
    }
    attributes
}

fn identifier(attributes: &Attributes, field: &str) -> Option<String> {
    attributes.get(field).and_then(Scalar::to_identifier)
}

/// Running requests: entity is the (blocked) session.
fn query_activity(attributes: &mut Attributes) -> Option<String> {
    let session = identifier(attributes, "blocked_session_id")
        .or_else(|| identifier(attributes, "session_id"))?;
    attributes
        .entry("session_id".to_string())
        .or_insert_with(|| Scalar::Text(session.clone()));
    Some(session)
}

fn transaction(attributes: &mut Attributes) -> Option<String> {
    identifier(attributes, "transaction_id").or_else(|| {
        identifier(attributes, "session_id").map(|session| format!("session:{session}"))
    })
}

fn resource_counter(_attributes: &mut Attributes) -> Option<String> {
    Some("server".to_string())
}

fn space_usage(_attributes: &mut Attributes) -> Option<String> {
    Some("tempdb".to_string())
}

fn index_recommendation(attributes: &mut Attributes) -> Option<String> {
    let table = identifier(attributes, "table_name")?;
    Some(match identifier(attributes, "database_name") {
        Some(database) => format!("{database}.{table}"),
        None => table,
    })
}

/// Captured events are keyed by time; a cumulative per-database counter row
/// (no event time) is keyed by its database so the counter tracks across cycles.
fn fault_event(attributes: &mut Attributes) -> Option<String> {
    attributes
        .entry("event_type".to_string())
        .or_insert_with(|| Scalar::from("deadlock"));
    let database = identifier(attributes, "database_name");
    match identifier(attributes, "event_time") {
        Some(time) => Some(match database {
            Some(database) => format!("{database}@{time}"),
            None => time,
        }),
        None => database,
    }
}
