//! Cycle-spanning state for conditions that only make sense across several
//! snapshots: open transactions, blocked sessions and blocking chains.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::model::{MetricKind, MetricRecord, ProbeKind, Scalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationTag {
    Open,
    Blocked,
    Blocking,
    DeadlockCycle,
}

impl CorrelationTag {
    pub fn as_str(self) -> &'static str {
        match self {
            CorrelationTag::Open => "open",
            CorrelationTag::Blocked => "blocked",
            CorrelationTag::Blocking => "blocking",
            CorrelationTag::DeadlockCycle => "deadlock_cycle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationEntry {
    pub kind: MetricKind,
    pub entity_id: String,
    pub probe: ProbeKind,
    pub tag: CorrelationTag,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Never decreases while the entry lives.
    pub duration_seconds: f64,
    pub stale_cycles: u32,
}

type EntryKey = (MetricKind, String);

/// Server counters that only ever grow until a stats reset. Rules see the
/// change since the previous sighting as `{field}_delta`.
const CUMULATIVE_COUNTERS: &[&str] = &["deadlock_count", "temp_bytes", "temp_files"];

/// Owned by a single pipeline; mutated once per cycle.
#[derive(Debug)]
pub struct CorrelationState {
    entries: HashMap<EntryKey, CorrelationEntry>,
    counters: HashMap<(MetricKind, String, &'static str), f64>,
    stale_grace_cycles: u32,
}

impl CorrelationState {
    pub fn new(stale_grace_cycles: u32) -> Self {
        Self {
            entries: HashMap::new(),
            counters: HashMap::new(),
            stale_grace_cycles: stale_grace_cycles.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Refresh entries from this cycle's metrics, age the rest and return the
    /// metrics enriched with correlation attributes. Synthetic `deadlock_cycle`
    /// fault records are appended for every session caught in a blocking cycle.
    ///
    /// Entries owned by a probe listed in `failed_probes` are neither refreshed
    /// nor aged: a failed probe says nothing about whether the condition cleared.
    pub fn update(
        &mut self,
        now: DateTime<Utc>,
        metrics: Vec<MetricRecord>,
        failed_probes: &[ProbeKind],
    ) -> Vec<MetricRecord> {
        let graph = BlockingGraph::from_records(&metrics);
        let mut refreshed: HashSet<EntryKey> = HashSet::new();
        let mut enriched = Vec::with_capacity(metrics.len());

        for record in metrics {
            let record = self.counter_deltas(record);
            let record = match record.kind {
                MetricKind::QueryActivity if is_blocked(&record) => {
                    let chain = graph.chain(&record.entity_id);
                    let tag = if chain.in_cycle {
                        CorrelationTag::DeadlockCycle
                    } else {
                        CorrelationTag::Blocked
                    };
                    let reported = record
                        .attribute("wait_time_ms")
                        .as_f64()
                        .map(|ms| ms / 1_000.0);
                    let duration = self.refresh(&record, tag, now, reported, &mut refreshed);
                    record
                        .with_attribute("duration_seconds", duration)
                        .with_attribute("chain_depth", chain.depth as i64)
                        .with_attribute(
                            "root_blocker",
                            chain.root.map(Scalar::Text).unwrap_or(Scalar::Null),
                        )
                        .with_attribute("in_cycle", chain.in_cycle)
                }
                MetricKind::Transaction => {
                    let reported = record.attribute("duration_seconds").as_f64();
                    let duration =
                        self.refresh(&record, CorrelationTag::Open, now, reported, &mut refreshed);
                    record.with_attribute("duration_seconds", duration)
                }
                _ => record,
            };
            enriched.push(record);
        }

        for root in graph.roots() {
            let key = (MetricKind::QueryActivity, root.clone());
            if refreshed.contains(&key) {
                continue;
            }
            self.touch(key.clone(), ProbeKind::Blocking, CorrelationTag::Blocking, now, None);
            refreshed.insert(key);
        }

        for member in graph.cycle_members() {
            enriched.push(deadlock_record(now, member, &graph));
        }

        self.sweep(&refreshed, failed_probes);
        enriched
    }

    /// First sighting has no delta; a counter that went down was reset and
    /// counts from zero.
    fn counter_deltas(&mut self, mut record: MetricRecord) -> MetricRecord {
        for field in CUMULATIVE_COUNTERS {
            let Some(current) = record.attribute(field).as_f64() else {
                continue;
            };
            let key = (record.kind, record.entity_id.clone(), *field);
            let delta = match self.counters.insert(key, current) {
                Some(previous) if current < previous => Scalar::Int(current as i64),
                Some(previous) => Scalar::Int((current - previous) as i64),
                None => Scalar::Null,
            };
            record = record.with_attribute(&format!("{field}_delta"), delta);
        }
        record
    }

    fn refresh(
        &mut self,
        record: &MetricRecord,
        tag: CorrelationTag,
        now: DateTime<Utc>,
        reported_seconds: Option<f64>,
        refreshed: &mut HashSet<EntryKey>,
    ) -> f64 {
        let key = (record.kind, record.entity_id.clone());
        refreshed.insert(key.clone());
        self.touch(key, record.probe, tag, now, reported_seconds)
    }

    fn touch(
        &mut self,
        key: EntryKey,
        probe: ProbeKind,
        tag: CorrelationTag,
        now: DateTime<Utc>,
        reported_seconds: Option<f64>,
    ) -> f64 {
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| CorrelationEntry {
                kind: key.0,
                entity_id: key.1,
                probe,
                tag,
                first_seen: now,
                last_seen: now,
                duration_seconds: 0.0,
                stale_cycles: 0,
            });

        let tracked = (now - entry.first_seen).num_milliseconds().max(0) as f64 / 1_000.0;
        let observed = reported_seconds
            .filter(|value| value.is_finite())
            .map_or(tracked, |reported| reported.max(tracked));

        entry.duration_seconds = entry.duration_seconds.max(observed);
        entry.last_seen = now;
        entry.stale_cycles = 0;
        entry.tag = tag;
        entry.duration_seconds
    }

    fn sweep(&mut self, refreshed: &HashSet<EntryKey>, failed_probes: &[ProbeKind]) {
        let grace = self.stale_grace_cycles;
        self.entries.retain(|key, entry| {
            if refreshed.contains(key) || failed_probes.contains(&entry.probe) {
                return true;
            }
            entry.stale_cycles += 1;
            if entry.stale_cycles >= grace {
                debug!(kind = %entry.kind, entity = %entry.entity_id, "evicting stale correlation entry");
                false
            } else {
                true
            }
        });
    }

    pub fn view(&self) -> CorrelationView {
        let mut entries: Vec<CorrelationEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| (a.kind, &a.entity_id).cmp(&(b.kind, &b.entity_id)));
        CorrelationView { entries }
    }
}

fn is_blocked(record: &MetricRecord) -> bool {
    !record.attribute("blocking_session_id").is_zero()
}

/// Read-only copy of the correlation table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorrelationView {
    entries: Vec<CorrelationEntry>,
}

impl CorrelationView {
    pub fn entries(&self) -> &[CorrelationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, kind: MetricKind, entity_id: &str) -> Option<&CorrelationEntry> {
        self.entries
            .binary_search_by(|entry| (entry.kind, entry.entity_id.as_str()).cmp(&(kind, entity_id)))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// Resolve a `correlation.<field>` reference for one record's entity.
    pub fn field(&self, kind: MetricKind, entity_id: &str, field: &str) -> Scalar {
        let Some(entry) = self.get(kind, entity_id) else {
            return Scalar::Null;
        };
        match field {
            "duration_seconds" => Scalar::Float(entry.duration_seconds),
            "stale_cycles" => Scalar::Int(i64::from(entry.stale_cycles)),
            "tag" => Scalar::from(entry.tag.as_str()),
            "first_seen" => Scalar::Text(entry.first_seen.to_rfc3339()),
            "last_seen" => Scalar::Text(entry.last_seen.to_rfc3339()),
            _ => Scalar::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ChainInfo {
    depth: usize,
    root: Option<String>,
    in_cycle: bool,
}

/// Per-cycle directed graph of blocked session -> blocking session.
#[derive(Debug, Default)]
struct BlockingGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl BlockingGraph {
    fn from_records(records: &[MetricRecord]) -> Self {
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for record in records {
            if record.kind != MetricKind::QueryActivity || !is_blocked(record) {
                continue;
            }
            let Some(blocker) = record.attribute("blocking_session_id").to_identifier() else {
                continue;
            };
            edges
                .entry(record.entity_id.clone())
                .or_default()
                .insert(blocker);
        }
        Self { edges }
    }

    fn successors(&self, node: &str) -> impl Iterator<Item = &String> {
        self.edges.get(node).into_iter().flatten()
    }

    /// True when `node` can reach itself. Each node is visited at most once.
    fn in_cycle(&self, node: &str) -> bool {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = self.successors(node).map(String::as_str).collect();
        while let Some(current) = queue.pop_front() {
            if current == node {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            queue.extend(self.successors(current).map(String::as_str));
        }
        false
    }

    /// Walk from `node` along its first blocker (in id order) until a session that is
    /// not itself blocked. Cycle members and walks that revisit a node have no root,
    /// even when another blocker leads out of the cycle.
    fn chain(&self, node: &str) -> ChainInfo {
        let in_cycle = self.in_cycle(node);
        let mut visited: HashSet<&str> = HashSet::from([node]);
        let mut current = node;
        let mut depth = 0;
        loop {
            let Some(next) = self.successors(current).next() else {
                let root = (depth > 0 && !in_cycle).then(|| current.to_string());
                return ChainInfo {
                    depth,
                    root,
                    in_cycle,
                };
            };
            depth += 1;
            if !visited.insert(next.as_str()) {
                return ChainInfo {
                    depth,
                    root: None,
                    in_cycle,
                };
            }
            current = next.as_str();
        }
    }

    /// Sessions that block others without being blocked themselves.
    fn roots(&self) -> Vec<String> {
        let mut roots: BTreeSet<String> = BTreeSet::new();
        for blockers in self.edges.values() {
            for blocker in blockers {
                if !self.edges.contains_key(blocker) {
                    roots.insert(blocker.clone());
                }
            }
        }
        roots.into_iter().collect()
    }

    fn cycle_members(&self) -> Vec<&String> {
        self.edges
            .keys()
            .filter(|node| self.in_cycle(node))
            .collect()
    }
}

fn deadlock_record(now: DateTime<Utc>, session: &str, graph: &BlockingGraph) -> MetricRecord {
    let blockers: Vec<&str> = graph.successors(session).map(String::as_str).collect();
    MetricRecord {
        kind: MetricKind::FaultEvent,
        probe: ProbeKind::Blocking,
        timestamp: now,
        entity_id: session.to_string(),
        attributes: Default::default(),
    }
    .with_attribute("event_type", "deadlock_cycle")
    .with_attribute("session_id", session)
    .with_attribute("blocking_session_id", blockers.join(","))
    .with_attribute("in_cycle", true)
}
