//! Best-effort narrative enrichment of emitted alerts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::AnnotatorConfig;
use crate::error::AnnotationFailure;
use crate::model::{Alert, Annotation, AnnotationSource, MetricKind, ProbeKind};

mod ollama;

pub use ollama::OllamaAnnotator;

#[async_trait]
pub trait Annotator: Send + Sync {
    fn name(&self) -> &str;

    async fn annotate(&self, alert: &Alert) -> Result<Annotation, AnnotationFailure>;
}

/// An alert that fell back to the static explanation, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotationFallback {
    pub rule_name: String,
    pub entity_id: String,
    pub failure: AnnotationFailure,
}

#[derive(Debug, Default)]
pub struct AnnotationReport {
    pub alerts: Vec<Alert>,
    pub fallbacks: Vec<AnnotationFallback>,
}

/// Bounded, deadline-limited fan-out over an optional provider. Never fails.
#[derive(Clone)]
pub struct AnnotatorGateway {
    provider: Option<Arc<dyn Annotator>>,
    timeout: Duration,
    deadline: Duration,
    max_concurrency: usize,
}

impl AnnotatorGateway {
    pub fn new(
        provider: Option<Arc<dyn Annotator>>,
        timeout: Duration,
        deadline: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            provider,
            timeout,
            deadline,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn from_config(config: &AnnotatorConfig) -> anyhow::Result<Self> {
        let provider: Option<Arc<dyn Annotator>> = if config.enabled {
            Some(Arc::new(OllamaAnnotator::new(
                &config.url,
                &config.model,
                config.timeout,
            )?))
        } else {
            None
        };
        Ok(Self::new(
            provider,
            config.timeout,
            config.deadline,
            config.max_concurrency,
        ))
    }

    /// Static explanations only.
    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(1), Duration::from_secs(1), 1)
    }

    pub async fn annotate_all(&self, alerts: Vec<Alert>) -> AnnotationReport {
        let Some(provider) = self.provider.clone() else {
            let alerts = alerts
                .into_iter()
                .map(|mut alert| {
                    alert.annotation = Some(fallback_annotation(&alert));
                    alert
                })
                .collect();
            return AnnotationReport {
                alerts,
                fallbacks: Vec::new(),
            };
        };

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        for (idx, alert) in alerts.iter().enumerate() {
            // Resolved alerts describe a cleared condition; no provider call.
            if !alert.state.is_active() {
                continue;
            }
            let provider = Arc::clone(&provider);
            let semaphore = Arc::clone(&semaphore);
            let alert = alert.clone();
            let timeout = self.timeout;
            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        match tokio::time::timeout(timeout, provider.annotate(&alert)).await {
                            Ok(result) => result,
                            Err(_) => Err(AnnotationFailure::Timeout),
                        }
                    }
                    Err(_) => Err(AnnotationFailure::Unavailable),
                };
                (idx, outcome)
            });
        }

        let mut outcomes: HashMap<usize, Result<Annotation, AnnotationFailure>> = HashMap::new();
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok((idx, outcome))) => {
                        outcomes.insert(idx, outcome);
                    }
                    Some(Err(err)) => warn!(error = %err, "annotation task failed"),
                    None => break,
                },
                _ = &mut deadline => {
                    debug!(pending = tasks.len(), "annotation deadline reached");
                    tasks.abort_all();
                    break;
                }
            }
        }

        let mut report = AnnotationReport::default();
        for (idx, mut alert) in alerts.into_iter().enumerate() {
            if !alert.state.is_active() {
                alert.annotation = Some(fallback_annotation(&alert));
                report.alerts.push(alert);
                continue;
            }
            let outcome = outcomes
                .remove(&idx)
                .unwrap_or(Err(AnnotationFailure::DeadlineExceeded));
            match outcome {
                Ok(annotation) => alert.annotation = Some(annotation),
                Err(failure) => {
                    debug!(rule = %alert.rule_name, entity = %alert.entity_id, %failure, "using fallback annotation");
                    alert.annotation = Some(fallback_annotation(&alert));
                    report.fallbacks.push(AnnotationFallback {
                        rule_name: alert.rule_name.clone(),
                        entity_id: alert.entity_id.clone(),
                        failure,
                    });
                }
            }
            report.alerts.push(alert);
        }
        report
    }
}

struct Explanation {
    summary: &'static str,
    analysis: &'static str,
    recommendations: &'static [&'static str],
}

fn explanation_for(kind: MetricKind, probe: ProbeKind) -> Explanation {
    match (kind, probe) {
        (MetricKind::FaultEvent, _) => Explanation {
            summary: "Deadlock: sessions were waiting on each other",
            analysis: "Two or more transactions each held a lock the other needed. The server breaks the cycle by cancelling one of them.",
            recommendations: &[
                "Retry the cancelled statement; the cycle is already broken.",
                "Touch tables in the same order in every code path.",
                "Keep transactions short so locks are held for less time.",
            ],
        },
        (MetricKind::QueryActivity, ProbeKind::Blocking) => Explanation {
            summary: "A session is waiting on a lock held by another session",
            analysis: "The blocked statement cannot continue until the blocking transaction commits or rolls back.",
            recommendations: &[
                "Check whether the blocking session is idle inside an open transaction.",
                "Commit or roll back promptly and avoid waiting on user input inside a transaction.",
                "Narrow UPDATE and DELETE statements so they lock fewer rows.",
            ],
        },
        (MetricKind::QueryActivity, _) => Explanation {
            summary: "A query has been running for a long time",
            analysis: "Long statements usually scan more rows than needed, fetch too many columns or join without supporting indexes.",
            recommendations: &[
                "Filter early with selective WHERE clauses.",
                "Select only the columns you need and paginate large results.",
                "Inspect the execution plan for sequential scans on large tables.",
            ],
        },
        (MetricKind::Transaction, _) => Explanation {
            summary: "A transaction has been left open",
            analysis: "An open transaction keeps its locks and prevents cleanup of old row versions, which slows everyone else down.",
            recommendations: &[
                "Look for code paths that begin a transaction without a matching commit or rollback.",
                "Make sure error handlers roll back.",
                "Do not keep transactions open across network calls.",
            ],
        },
        (MetricKind::IndexRecommendation, _) => Explanation {
            summary: "A table is read mostly through full scans",
            analysis: "Without a suitable index every lookup reads the whole table.",
            recommendations: &[
                "Review the filtering columns of the most frequent queries on this table.",
                "Test a candidate index on a copy of the data before adding it in production.",
            ],
        },
        (MetricKind::ResourceCounter, _) => Explanation {
            summary: "Server resource pressure",
            analysis: "Connection or cache pressure often comes from a few expensive queries or connection leaks.",
            recommendations: &[
                "Check the slowest running queries first.",
                "Use a connection pool and release connections promptly.",
            ],
        },
        (MetricKind::SpaceUsage, _) => Explanation {
            summary: "Temporary space usage is growing",
            analysis: "Large sorts and hashes spill to temporary files when they do not fit in memory.",
            recommendations: &[
                "Reduce result sets before sorting them.",
                "Add indexes that let the planner avoid large sorts.",
            ],
        },
    }
}

/// Deterministic explanation used whenever the provider is absent or fails.
pub fn fallback_annotation(alert: &Alert) -> Annotation {
    if !alert.state.is_active() {
        return Annotation {
            summary: format!("Condition cleared: {} on {}", alert.rule_name, alert.entity_id),
            details: alert.message.clone(),
            analysis: "The condition was not observed in the latest collection cycle.".to_string(),
            recommendations: Vec::new(),
            source: AnnotationSource::Fallback,
        };
    }

    let explanation = explanation_for(alert.kind, alert.probe);
    let mut recommendations = alert.recommendations.clone();
    for extra in explanation.recommendations {
        if !recommendations.iter().any(|existing| existing == extra) {
            recommendations.push((*extra).to_string());
        }
    }
    Annotation {
        summary: explanation.summary.to_string(),
        details: alert.message.clone(),
        analysis: explanation.analysis.to_string(),
        recommendations,
        source: AnnotationSource::Fallback,
    }
}
