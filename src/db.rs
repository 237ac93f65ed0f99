use std::{str::FromStr, time::Duration};

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::{error, info};

use crate::config::AppConfig;

pub type DbPool = PgPool;

const APPLICATION_NAME: &str = "dbpulse";

/// Build a small connection pool whose sessions cannot write to the monitored database.
pub async fn create_pool(config: &AppConfig) -> Result<DbPool> {
    let connect_options = PgConnectOptions::from_str(&config.dsn)
        .context("invalid database DSN supplied")?
        .application_name(APPLICATION_NAME)
        .options([
            (
                "statement_timeout",
                config.timeouts.statement_timeout_ms.to_string(),
            ),
            ("lock_timeout", config.timeouts.lock_timeout_ms.to_string()),
        ]);

    // One connection per probe lets a full cycle run concurrently.
    let max_connections = config.source.probes.len().clamp(1, 8) as u32;

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY")
                    .execute(&mut *conn)
                    .await
                    .map_err(|err| {
                        error!(error = ?err, "failed to enforce read-only session");
                        err
                    })?;
                sqlx::query("SET default_transaction_read_only = on")
                    .execute(&mut *conn)
                    .await
                    .map_err(|err| {
                        error!(error = ?err, "failed to enforce read-only default");
                        err
                    })?;
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await
        .context("failed to connect to monitored database")?;

    verify_read_only(&pool).await?;

    info!(target_name = %config.target, "connected to monitored database");
    Ok(pool)
}

/// Sanity-check the monitor role to ensure it cannot perform writes.
async fn verify_read_only(pool: &DbPool) -> Result<()> {
    let (default_read_only,): (bool,) =
        sqlx::query_as("SELECT current_setting('default_transaction_read_only') = 'on'")
            .fetch_one(pool)
            .await
            .context("dbpulse requires default_transaction_read_only to be ON")?;

    if !default_read_only {
        anyhow::bail!("monitoring session is not read-only; refused to start");
    }

    Ok(())
}
