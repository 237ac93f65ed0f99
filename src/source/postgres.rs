use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Column, Row as _, TypeInfo};
use tracing::instrument;

use super::MetricSource;
use crate::db::DbPool;
use crate::error::SourceError;
use crate::model::{ProbeKind, Row, Scalar};

const BLOCKING_SQL: &str = r#"
SELECT
    blocked.pid::bigint AS blocked_session_id,
    blocker.pid::bigint AS blocking_session_id,
    COALESCE(blocked.wait_event_type || ':' || blocked.wait_event, 'unknown') AS wait_type,
    (EXTRACT(EPOCH FROM now() - COALESCE(blocked.state_change, blocked.query_start)) * 1000)::bigint AS wait_time_ms,
    (EXTRACT(EPOCH FROM now() - blocked.query_start) * 1000)::bigint AS elapsed_time_ms,
    host(blocked.client_addr) AS host_name,
    blocked.application_name AS program_name,
    blocked.usename::text AS login_name,
    blocked.datname::text AS database_name,
    LEFT(blocked.query, 500) AS query_text
FROM pg_stat_activity blocked
CROSS JOIN LATERAL unnest(pg_blocking_pids(blocked.pid)) AS b(pid)
JOIN pg_stat_activity blocker ON blocker.pid = b.pid
WHERE blocked.pid <> pg_backend_pid()
"#;

const OPEN_TRANSACTIONS_SQL: &str = r#"
SELECT
    backend_xid::text AS transaction_id,
    pid::bigint AS session_id,
    xact_start AS transaction_begin_time,
    state AS transaction_state,
    EXTRACT(EPOCH FROM now() - xact_start)::double precision AS duration_seconds,
    usename::text AS login_name,
    host(client_addr) AS host_name,
    application_name AS program_name,
    datname::text AS database_name,
    LEFT(query, 500) AS query_text,
    cardinality(pg_blocking_pids(pid)) > 0 AS is_blocked,
    COALESCE(wait_event_type, 'idle') AS wait_type
FROM pg_stat_activity
WHERE xact_start IS NOT NULL
  AND pid <> pg_backend_pid()
  AND application_name NOT LIKE 'dbpulse%'
"#;

const MISSING_INDEXES_SQL: &str = r#"
SELECT
    current_database()::text AS database_name,
    schemaname || '.' || relname AS table_name,
    seq_scan::bigint AS user_scans,
    COALESCE(idx_scan, 0)::bigint AS user_seeks,
    seq_tup_read::bigint AS rows_scanned,
    n_live_tup::bigint AS live_rows,
    (100.0 * seq_scan / GREATEST(seq_scan + COALESCE(idx_scan, 0), 1))::double precision AS avg_user_impact
FROM pg_stat_user_tables
WHERE seq_scan > COALESCE(idx_scan, 0)
  AND n_live_tup > 10000
ORDER BY seq_tup_read DESC
LIMIT 20
"#;

const SLOW_QUERIES_SQL: &str = r#"
SELECT
    pid::bigint AS session_id,
    query_start AS start_time,
    state AS status,
    (EXTRACT(EPOCH FROM now() - query_start) * 1000)::double precision AS elapsed_time_ms,
    wait_event_type AS wait_type,
    usename::text AS login_name,
    host(client_addr) AS host_name,
    application_name AS program_name,
    datname::text AS database_name,
    LEFT(query, 500) AS query_text
FROM pg_stat_activity
WHERE state = 'active'
  AND pid <> pg_backend_pid()
  AND backend_type = 'client backend'
  AND now() - query_start > interval '1 second'
ORDER BY query_start
LIMIT 20
"#;

const CPU_MEMORY_SQL: &str = r#"
SELECT
    (SELECT COUNT(*) FROM pg_stat_activity)::bigint AS connections,
    current_setting('max_connections')::bigint AS max_connections,
    (100.0 * (SELECT COUNT(*) FROM pg_stat_activity)
        / current_setting('max_connections')::double precision) AS connection_usage_percent,
    (SELECT 100.0 * SUM(blks_hit) / NULLIF(SUM(blks_hit + blks_read), 0)
        FROM pg_stat_database)::double precision AS cache_hit_percent
"#;

const TEMPDB_HEALTH_SQL: &str = r#"
SELECT
    COALESCE(SUM(temp_files), 0)::bigint AS temp_files,
    COALESCE(SUM(temp_bytes), 0)::bigint AS temp_bytes,
    pg_database_size(current_database())::bigint AS database_bytes
FROM pg_stat_database
WHERE datname NOT IN ('template0', 'template1')
"#;

const DEADLOCKS_SQL: &str = r#"
SELECT
    datname::text AS database_name,
    deadlocks::bigint AS deadlock_count,
    stats_reset AS stats_reset_at
FROM pg_stat_database
WHERE datname IS NOT NULL
  AND datname NOT IN ('template0', 'template1')
"#;

fn probe_sql(probe: ProbeKind) -> &'static str {
    match probe {
        ProbeKind::Blocking => BLOCKING_SQL,
        ProbeKind::OpenTransactions => OPEN_TRANSACTIONS_SQL,
        ProbeKind::MissingIndexes => MISSING_INDEXES_SQL,
        ProbeKind::SlowQueries => SLOW_QUERIES_SQL,
        ProbeKind::CpuMemory => CPU_MEMORY_SQL,
        ProbeKind::TempdbHealth => TEMPDB_HEALTH_SQL,
        ProbeKind::Deadlocks => DEADLOCKS_SQL,
    }
}

/// Live PostgreSQL source running each probe on the read-only pool.
#[derive(Clone)]
pub struct PostgresSource {
    pool: DbPool,
}

impl PostgresSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetricSource for PostgresSource {
    fn name(&self) -> &str {
        "postgres"
    }

    #[instrument(skip(self), fields(probe = %probe))]
    async fn fetch(&self, probe: ProbeKind) -> Result<Vec<Row>, SourceError> {
        let rows = sqlx::query(probe_sql(probe)).fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }
}

fn decode_row(row: &PgRow) -> Result<Row, SourceError> {
    let mut decoded = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(Scalar::Bool),
            "INT2" => row
                .try_get::<Option<i16>, _>(idx)?
                .map(|v| Scalar::Int(i64::from(v))),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)?
                .map(|v| Scalar::Int(i64::from(v))),
            "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(Scalar::Int),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(idx)?
                .map(|v| Scalar::Float(f64::from(v))),
            "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(Scalar::Float),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)?
                .map(|v| Scalar::Text(v.to_rfc3339())),
            _ => row.try_get::<Option<String>, _>(idx)?.map(Scalar::Text),
        };
        decoded.insert(column.name().to_string(), value.unwrap_or(Scalar::Null));
    }
    Ok(decoded)
}
