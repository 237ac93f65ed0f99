use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{CycleError, ProbeError};
use crate::model::{ProbeKind, Row};
use crate::source::MetricSource;

/// Rows returned by one successful probe.
#[derive(Debug, Clone)]
pub struct RawProbeResult {
    pub probe: ProbeKind,
    pub collected_at: DateTime<Utc>,
    pub rows: Vec<Row>,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct Snapshot {
    pub results: Vec<RawProbeResult>,
    pub errors: Vec<ProbeError>,
}

impl Snapshot {
    pub fn failed_probes(&self) -> impl Iterator<Item = ProbeKind> + '_ {
        self.errors.iter().map(|err| err.probe)
    }
}

/// Runs the configured probe set against a source, one task per probe.
#[derive(Clone)]
pub struct SnapshotCollector {
    source: Arc<dyn MetricSource>,
    probes: Vec<ProbeKind>,
    probe_timeout: Duration,
}

impl SnapshotCollector {
    pub fn new(source: Arc<dyn MetricSource>, probes: Vec<ProbeKind>, probe_timeout: Duration) -> Self {
        Self {
            source,
            probes,
            probe_timeout,
        }
    }

    pub fn probes(&self) -> &[ProbeKind] {
        &self.probes
    }

    /// Run every probe concurrently. Individual failures become `ProbeError`s; only
    /// cancellation aborts the collection, in which case partial results are discarded.
    #[instrument(skip_all, fields(source = self.source.name(), probes = self.probes.len()))]
    pub async fn collect(&self, cancel: &CancellationToken) -> Result<Snapshot, CycleError> {
        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }

        let runs = self.probes.iter().map(|probe| self.run_probe(*probe));

        let outcomes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CycleError::Cancelled),
            outcomes = join_all(runs) => outcomes,
        };

        let mut snapshot = Snapshot::default();
        for outcome in outcomes {
            match outcome {
                Ok(result) => snapshot.results.push(result),
                Err(err) => {
                    warn!(probe = %err.probe, cause = %err.cause, "probe failed");
                    snapshot.errors.push(err);
                }
            }
        }
        Ok(snapshot)
    }

    async fn run_probe(&self, probe: ProbeKind) -> Result<RawProbeResult, ProbeError> {
        let start = Instant::now();
        let collected_at = Utc::now();
        match tokio::time::timeout(self.probe_timeout, self.source.fetch(probe)).await {
            Ok(Ok(rows)) => {
                let elapsed = start.elapsed();
                debug!(probe = %probe, rows = rows.len(), elapsed = ?elapsed, "probe completed");
                Ok(RawProbeResult {
                    probe,
                    collected_at,
                    rows,
                    elapsed,
                })
            }
            Ok(Err(err)) => Err(ProbeError {
                probe,
                cause: err.to_string(),
            }),
            Err(_) => Err(ProbeError {
                probe,
                cause: format!("timed out after {:?}", self.probe_timeout),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use async_trait::async_trait;

    use super::*;
    use crate::error::SourceError;
    use crate::model::Scalar;

    struct ScriptedSource {
        failing: HashSet<ProbeKind>,
        slow: HashSet<ProbeKind>,
    }

    #[async_trait]
    impl MetricSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch(&self, probe: ProbeKind) -> Result<Vec<Row>, SourceError> {
            if self.failing.contains(&probe) {
                return Err(SourceError::Unavailable("connection reset".into()));
            }
            if self.slow.contains(&probe) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            let mut row = Row::new();
            row.insert("probe".into(), Scalar::from(probe.as_str()));
            Ok(vec![row])
        }
    }

    fn collector(failing: &[ProbeKind], slow: &[ProbeKind]) -> SnapshotCollector {
        let source = ScriptedSource {
            failing: failing.iter().copied().collect(),
            slow: slow.iter().copied().collect(),
        };
        SnapshotCollector::new(
            Arc::new(source),
            ProbeKind::ALL.to_vec(),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn one_failing_probe_does_not_abort_the_others() {
        let snapshot = collector(&[ProbeKind::Deadlocks], &[])
            .collect(&CancellationToken::new())
            .await
            .expect("snapshot");
        assert_eq!(snapshot.results.len(), 6);
        assert_eq!(snapshot.errors.len(), 1);
        assert_eq!(snapshot.errors[0].probe, ProbeKind::Deadlocks);
        assert!(snapshot.errors[0].cause.contains("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_times_out_as_a_probe_error() {
        let snapshot = collector(&[], &[ProbeKind::SlowQueries])
            .collect(&CancellationToken::new())
            .await
            .expect("snapshot");
        assert_eq!(snapshot.results.len(), 6);
        assert_eq!(snapshot.errors.len(), 1);
        assert!(snapshot.errors[0].cause.contains("timed out"));
    }

    #[tokio::test]
    async fn cancelled_collection_discards_results() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = collector(&[], &[]).collect(&cancel).await;
        assert!(matches!(outcome, Err(CycleError::Cancelled)));
    }
}
