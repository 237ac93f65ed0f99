use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::model::{Alert, AlertKey, AlertState, CandidateAlert, ProbeKind};

#[derive(Debug, Clone)]
struct TrackedAlert {
    alert: Alert,
    last_emitted_at: DateTime<Utc>,
    /// Cycles elapsed since the alert resolved.
    resolved_cycles: u32,
}

#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// Transitions to publish this cycle.
    pub emitted: Vec<Alert>,
    /// Copy of the alert table after the cycle, resolved alerts still retained included.
    pub table: Vec<Alert>,
}

/// Alerts whose missing candidate says nothing about the condition this cycle:
/// their probe failed, or their rule could not be evaluated for the entity.
#[derive(Debug, Clone, Default)]
pub struct Held {
    probes: Vec<ProbeKind>,
    keys: HashSet<AlertKey>,
}

impl Held {
    pub fn new(probes: Vec<ProbeKind>, keys: HashSet<AlertKey>) -> Self {
        Self { probes, keys }
    }

    pub fn probes(probes: impl IntoIterator<Item = ProbeKind>) -> Self {
        Self::new(probes.into_iter().collect(), HashSet::new())
    }

    fn holds(&self, key: &AlertKey, alert: &Alert) -> bool {
        self.probes.contains(&alert.probe) || self.keys.contains(key)
    }
}

/// Lifecycle owner for alerts keyed by `(rule_name, entity_id)`.
#[derive(Debug)]
pub struct Deduplicator {
    alerts: HashMap<AlertKey, TrackedAlert>,
    reannounce_interval: Option<chrono::Duration>,
    resolved_retention_cycles: u32,
}

impl Deduplicator {
    pub fn new(reannounce_interval: Option<Duration>, resolved_retention_cycles: u32) -> Self {
        Self {
            alerts: HashMap::new(),
            reannounce_interval: reannounce_interval
                .and_then(|interval| chrono::Duration::from_std(interval).ok()),
            resolved_retention_cycles: resolved_retention_cycles.max(1),
        }
    }

    pub fn active_count(&self) -> usize {
        self.alerts
            .values()
            .filter(|tracked| tracked.alert.state.is_active())
            .count()
    }

    /// Apply one cycle of candidates. Active alerts covered by `held` are
    /// carried over untouched when no candidate shows up.
    pub fn process(
        &mut self,
        now: DateTime<Utc>,
        candidates: Vec<CandidateAlert>,
        held: &Held,
    ) -> DedupOutcome {
        let mut emitted = Vec::new();
        let merged = merge_candidates(candidates);
        let retention = self.resolved_retention_cycles;
        let reannounce = self.reannounce_interval;

        let mut expired = Vec::new();
        for (key, tracked) in self.alerts.iter_mut() {
            if merged.contains_key(key) {
                continue;
            }
            if tracked.alert.state.is_active() {
                if held.holds(key, &tracked.alert) {
                    continue;
                }
                tracked.alert.state = AlertState::Resolved;
                tracked.alert.transitioned_at = now;
                tracked.last_emitted_at = now;
                tracked.resolved_cycles = 0;
                info!(rule = %key.rule_name, entity = %key.entity_id, "alert resolved");
                emitted.push(tracked.alert.clone());
            } else {
                tracked.resolved_cycles += 1;
                if tracked.resolved_cycles >= retention {
                    expired.push(key.clone());
                }
            }
        }
        for key in expired {
            debug!(rule = %key.rule_name, entity = %key.entity_id, "dropping resolved alert");
            self.alerts.remove(&key);
        }

        for (key, candidate) in merged {
            match self.alerts.get_mut(&key) {
                Some(tracked) if tracked.alert.state.is_active() => {
                    if let Some(alert) = advance(tracked, candidate, now, reannounce) {
                        emitted.push(alert);
                    }
                }
                _ => {
                    let alert = new_alert(candidate, now);
                    info!(
                        rule = %alert.rule_name,
                        entity = %alert.entity_id,
                        severity = %alert.severity,
                        "new alert"
                    );
                    emitted.push(alert.clone());
                    self.alerts.insert(
                        key,
                        TrackedAlert {
                            alert,
                            last_emitted_at: now,
                            resolved_cycles: 0,
                        },
                    );
                }
            }
        }

        emitted.sort_by(|a, b| a.key().cmp(&b.key()));
        DedupOutcome {
            emitted,
            table: self.table(),
        }
    }

    /// Store annotations produced for emitted alerts on the matching table entries.
    pub fn record_annotations(&mut self, alerts: &[Alert]) {
        for alert in alerts {
            let Some(annotation) = &alert.annotation else {
                continue;
            };
            if let Some(tracked) = self.alerts.get_mut(&alert.key()) {
                if tracked.alert.state == alert.state {
                    tracked.alert.annotation = Some(annotation.clone());
                }
            }
        }
    }

    pub fn table(&self) -> Vec<Alert> {
        let mut table: Vec<Alert> = self
            .alerts
            .values()
            .map(|tracked| tracked.alert.clone())
            .collect();
        table.sort_by(|a, b| a.key().cmp(&b.key()));
        table
    }
}

/// Refresh an active alert with this cycle's candidate; returns it when it must be published.
fn advance(
    tracked: &mut TrackedAlert,
    candidate: CandidateAlert,
    now: DateTime<Utc>,
    reannounce: Option<chrono::Duration>,
) -> Option<Alert> {
    let alert = &mut tracked.alert;
    alert.last_seen_at = now;
    alert.message = candidate.message;
    alert.recommendations = candidate.recommendations;

    if candidate.severity > alert.severity {
        info!(
            rule = %alert.rule_name,
            entity = %alert.entity_id,
            from = %alert.severity,
            to = %candidate.severity,
            "alert escalated"
        );
        alert.severity = candidate.severity;
        alert.state = AlertState::Escalated;
        alert.transitioned_at = now;
        alert.annotation = None;
        tracked.last_emitted_at = now;
        return Some(alert.clone());
    }

    if alert.state != AlertState::Ongoing {
        alert.state = AlertState::Ongoing;
        alert.transitioned_at = now;
    }

    let due = reannounce.is_some_and(|interval| now - tracked.last_emitted_at >= interval);
    if due {
        tracked.last_emitted_at = now;
        Some(alert.clone())
    } else {
        None
    }
}

/// Several rows can raise the same key in one cycle; keep the most severe.
fn merge_candidates(candidates: Vec<CandidateAlert>) -> BTreeMap<AlertKey, CandidateAlert> {
    let mut merged: BTreeMap<AlertKey, CandidateAlert> = BTreeMap::new();
    for candidate in candidates {
        let key = candidate.key();
        match merged.get(&key) {
            Some(existing) if existing.severity >= candidate.severity => {}
            _ => {
                merged.insert(key, candidate);
            }
        }
    }
    merged
}

fn new_alert(candidate: CandidateAlert, now: DateTime<Utc>) -> Alert {
    Alert {
        rule_name: candidate.rule_name,
        entity_id: candidate.entity_id,
        kind: candidate.kind,
        probe: candidate.probe,
        severity: candidate.severity,
        state: AlertState::New,
        message: candidate.message,
        recommendations: candidate.recommendations,
        first_triggered_at: now,
        last_seen_at: now,
        transitioned_at: now,
        annotation: None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::model::{MetricKind, Severity};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("timestamp")
            + chrono::Duration::minutes(minutes)
    }

    fn candidate(severity: Severity) -> CandidateAlert {
        CandidateAlert {
            rule_name: "blocking".into(),
            entity_id: "5".into(),
            kind: MetricKind::QueryActivity,
            probe: ProbeKind::Blocking,
            severity,
            message: "blocked".into(),
            recommendations: Vec::new(),
        }
    }

    #[test]
    fn identical_cycles_emit_once() {
        let mut dedup = Deduplicator::new(None, 1);
        let first = dedup.process(at(0), vec![candidate(Severity::High)], &Held::default());
        assert_eq!(first.emitted.len(), 1);
        assert_eq!(first.emitted[0].state, AlertState::New);

        for minute in 1..5 {
            let outcome = dedup.process(at(minute), vec![candidate(Severity::High)], &Held::default());
            assert!(outcome.emitted.is_empty());
            assert_eq!(outcome.table[0].state, AlertState::Ongoing);
        }
        assert_eq!(dedup.active_count(), 1);
    }

    #[test]
    fn escalation_emits_and_downgrade_keeps_peak() {
        let mut dedup = Deduplicator::new(None, 1);
        dedup.process(at(0), vec![candidate(Severity::Medium)], &Held::default());

        let escalated = dedup.process(at(1), vec![candidate(Severity::Critical)], &Held::default());
        assert_eq!(escalated.emitted.len(), 1);
        assert_eq!(escalated.emitted[0].state, AlertState::Escalated);

        let lowered = dedup.process(at(2), vec![candidate(Severity::Low)], &Held::default());
        assert!(lowered.emitted.is_empty());
        assert_eq!(lowered.table[0].severity, Severity::Critical);
        assert_eq!(lowered.table[0].state, AlertState::Ongoing);
    }

    #[test]
    fn absent_candidate_resolves_once_then_drops() {
        let mut dedup = Deduplicator::new(None, 1);
        dedup.process(at(0), vec![candidate(Severity::High)], &Held::default());

        let resolved = dedup.process(at(1), Vec::new(), &Held::default());
        assert_eq!(resolved.emitted.len(), 1);
        assert_eq!(resolved.emitted[0].state, AlertState::Resolved);
        assert_eq!(resolved.table.len(), 1);

        let after = dedup.process(at(2), Vec::new(), &Held::default());
        assert!(after.emitted.is_empty());
        assert!(after.table.is_empty());
    }

    #[test]
    fn reappearing_condition_starts_fresh_alert() {
        let mut dedup = Deduplicator::new(None, 3);
        dedup.process(at(0), vec![candidate(Severity::High)], &Held::default());
        dedup.process(at(1), Vec::new(), &Held::default());

        let again = dedup.process(at(2), vec![candidate(Severity::High)], &Held::default());
        assert_eq!(again.emitted.len(), 1);
        assert_eq!(again.emitted[0].state, AlertState::New);
        assert_eq!(again.emitted[0].first_triggered_at, at(2));
    }

    #[test]
    fn reannounce_interval_re_emits_ongoing() {
        let mut dedup = Deduplicator::new(Some(Duration::from_secs(600)), 1);
        dedup.process(at(0), vec![candidate(Severity::High)], &Held::default());
        assert!(dedup.process(at(5), vec![candidate(Severity::High)], &Held::default()).emitted.is_empty());

        let reannounced = dedup.process(at(10), vec![candidate(Severity::High)], &Held::default());
        assert_eq!(reannounced.emitted.len(), 1);
        assert_eq!(reannounced.emitted[0].state, AlertState::Ongoing);
    }

    #[test]
    fn failed_probe_does_not_resolve_its_alerts() {
        let mut dedup = Deduplicator::new(None, 1);
        dedup.process(at(0), vec![candidate(Severity::High)], &Held::default());
        let held = dedup.process(at(1), Vec::new(), &Held::probes([ProbeKind::Blocking]));
        assert!(held.emitted.is_empty());
        assert_eq!(dedup.active_count(), 1);
    }

    #[test]
    fn rule_error_holds_the_alert_for_its_entity() {
        let mut dedup = Deduplicator::new(None, 1);
        dedup.process(at(0), vec![candidate(Severity::High)], &Held::default());

        let key = AlertKey {
            rule_name: "blocking".into(),
            entity_id: "5".into(),
        };
        let held = Held::new(Vec::new(), [key].into_iter().collect());
        let skipped = dedup.process(at(1), Vec::new(), &held);
        assert!(skipped.emitted.is_empty());
        assert_eq!(skipped.table[0].state, AlertState::New);

        let back = dedup.process(at(2), vec![candidate(Severity::High)], &Held::default());
        assert!(back.emitted.is_empty());
        assert_eq!(back.table[0].state, AlertState::Ongoing);
        assert_eq!(back.table[0].first_triggered_at, at(0));
    }

    #[test]
    fn duplicate_candidates_merge_to_highest_severity() {
        let mut dedup = Deduplicator::new(None, 1);
        let outcome = dedup.process(
            at(0),
            vec![candidate(Severity::Low), candidate(Severity::High)],
            &Held::default(),
        );
        assert_eq!(outcome.emitted.len(), 1);
        assert_eq!(outcome.emitted[0].severity, Severity::High);
    }
}
