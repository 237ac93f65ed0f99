use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::config::{AppConfig, SourceMode};
use crate::db;
use crate::error::SourceError;
use crate::model::{ProbeKind, Row};

mod postgres;
mod sample;

pub use postgres::PostgresSource;
pub use sample::SampleSource;

/// Read-only access to the monitored database, one call per probe.
#[async_trait]
pub trait MetricSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, probe: ProbeKind) -> Result<Vec<Row>, SourceError>;
}

/// Build the source selected by `source.mode`.
pub async fn from_config(config: &AppConfig) -> Result<Arc<dyn MetricSource>> {
    match config.source.mode {
        SourceMode::Sample => {
            let source = SampleSource::from_jsonl(&config.source.sample_path).await?;
            info!(
                path = %config.source.sample_path.display(),
                rows = source.row_count(),
                "replaying sample metrics"
            );
            Ok(Arc::new(source))
        }
        SourceMode::Postgres => {
            let pool = db::create_pool(config).await?;
            Ok(Arc::new(PostgresSource::new(pool)))
        }
    }
}
