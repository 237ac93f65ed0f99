//! Synthetic sample files for the replay source.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::{Value, json};

use crate::model::ProbeKind;

const WAIT_TYPES: &[&str] = &["LCK_M_S", "LCK_M_X", "PAGEIOLATCH"];
const DATABASES: &[&str] = &["Sales", "HR", "Orders"];

/// One JSONL line for `probe` with randomized but plausible values.
pub fn generate_event<R: Rng + ?Sized>(rng: &mut R, probe: ProbeKind, offset_seconds: i64) -> Value {
    let timestamp = Utc::now() + Duration::seconds(offset_seconds);
    let pick = |rng: &mut R, options: &[&'static str]| -> &'static str {
        options.choose(rng).copied().unwrap_or_default()
    };

    let payload = match probe {
        ProbeKind::Blocking => json!({
            "blocked_session_id": rng.gen_range(50..=200),
            "blocking_session_id": rng.gen_range(1..=49),
            "wait_type": pick(rng, WAIT_TYPES),
            "wait_time_ms": rng.gen_range(1_000..=120_000),
            "database_name": pick(rng, DATABASES),
        }),
        ProbeKind::Deadlocks => json!({
            "event_time": timestamp.to_rfc3339(),
            "deadlock_xml": "<deadlock>...</deadlock>",
        }),
        ProbeKind::OpenTransactions => json!({
            "transaction_id": rng.gen_range(100_000..=999_999),
            "session_id": rng.gen_range(50..=200),
            "transaction_state": rng.gen_range(1..=6),
            "duration_seconds": rng.gen_range(1..=3_600),
        }),
        ProbeKind::MissingIndexes => json!({
            "database_name": "Sales",
            "table_name": "dbo.Orders",
            "avg_user_impact": rng.gen_range(10..=95),
            "equality_columns": "CustomerId",
        }),
        ProbeKind::SlowQueries => json!({
            "session_id": rng.gen_range(50..=200),
            "elapsed_time_ms": rng.gen_range(500..=60_000),
            "execution_count": rng.gen_range(1..=1_000),
            "query_text": "SELECT * FROM Orders WHERE Status = 'Pending'",
        }),
        ProbeKind::CpuMemory => json!({
            "cpu_percent": rng.gen_range(5..=100),
            "available_memory_mb": rng.gen_range(100..=64_000),
            "total_memory_mb": 65_536,
        }),
        ProbeKind::TempdbHealth => json!({
            "user_objects_kb": rng.gen_range(10_000..=200_000),
            "internal_objects_kb": rng.gen_range(10_000..=200_000),
            "version_store_kb": rng.gen_range(10_000..=200_000),
            "free_space_kb": rng.gen_range(1_000..=50_000),
        }),
    };

    json!({
        "event_type": probe.as_str(),
        "@timestamp": timestamp.to_rfc3339(),
        "payload": payload,
    })
}

/// `count` events with uniformly chosen probes, one second apart.
pub fn generate_events<R: Rng + ?Sized>(rng: &mut R, count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| {
            let probe = ProbeKind::ALL
                .choose(rng)
                .copied()
                .unwrap_or(ProbeKind::Blocking);
            generate_event(rng, probe, i as i64)
        })
        .collect()
}

pub async fn write_jsonl(path: &Path, events: &[Value]) -> Result<()> {
    let mut body = String::new();
    for event in events {
        body.push_str(&serde_json::to_string(event)?);
        body.push('\n');
    }
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}
