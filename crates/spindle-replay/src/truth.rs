//! Truth state and its fold.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use spindle_core::TimestampMs;
use spindle_events::EventRecord;
use tracing::warn;

/// Whether a fact is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactStatus {
    /// Currently held true.
    Active,
    /// Resolved; the record is retained.
    Resolved,
}

/// Severity of a fact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    #[default]
    Info,
    /// Worth attention.
    Warn,
    /// Blocking-grade.
    Error,
}

/// One truth fact, keyed by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TruthFact {
    /// Stable id (e.g. `truth:verifier:type-check`).
    pub id: String,
    /// Fact kind tag.
    pub kind: String,
    /// Live or resolved.
    pub status: FactStatus,
    /// Severity.
    pub severity: Severity,
    /// One-line summary.
    pub summary: String,
    /// Longer details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Ledger rows evidencing the fact.
    pub evidence_ids: Vec<String>,
    /// First observation. Never decreases once set.
    pub first_seen_at: TimestampMs,
    /// Latest observation.
    pub last_seen_at: TimestampMs,
    /// When resolved, if resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<TimestampMs>,
}

/// The folded truth state for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TruthState {
    /// Facts keyed by id; ordered for deterministic snapshots.
    pub facts: BTreeMap<String, TruthFact>,
}

impl TruthState {
    /// Active facts, most severe first.
    #[must_use]
    pub fn active_facts(&self) -> Vec<&TruthFact> {
        let mut facts: Vec<&TruthFact> = self
            .facts
            .values()
            .filter(|f| f.status == FactStatus::Active)
            .collect();
        facts.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.id.cmp(&b.id)));
        facts
    }

    /// Look up one fact.
    #[must_use]
    pub fn fact(&self, id: &str) -> Option<&TruthFact> {
        self.facts.get(id)
    }

    /// Whether a fact exists and is resolved.
    #[must_use]
    pub fn is_resolved(&self, id: &str) -> bool {
        self.facts
            .get(id)
            .is_some_and(|f| f.status == FactStatus::Resolved)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FactUpsert {
    id: String,
    kind: String,
    #[serde(default)]
    severity: Severity,
    summary: String,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    evidence_ids: Vec<String>,
}

/// Apply one `truth_ledger:*` event to the state.
pub fn fold_truth_event(state: &mut TruthState, record: &EventRecord) {
    let Some(payload) = record.payload.as_ref() else {
        return;
    };

    match record.event_type.as_str() {
        "truth_ledger:fact_upserted" => {
            match serde_json::from_value::<FactUpsert>(payload.clone()) {
                Ok(upsert) => {
                    let ts = record.timestamp;
                    state
                        .facts
                        .entry(upsert.id.clone())
                        .and_modify(|fact| {
                            fact.kind = upsert.kind.clone();
                            fact.severity = upsert.severity;
                            fact.summary = upsert.summary.clone();
                            fact.details.clone_from(&upsert.details);
                            for evidence in &upsert.evidence_ids {
                                if !fact.evidence_ids.contains(evidence) {
                                    fact.evidence_ids.push(evidence.clone());
                                }
                            }
                            fact.status = FactStatus::Active;
                            fact.resolved_at = None;
                            // firstSeenAt never decreases once set.
                            fact.last_seen_at = ts;
                        })
                        .or_insert_with(|| TruthFact {
                            id: upsert.id,
                            kind: upsert.kind,
                            status: FactStatus::Active,
                            severity: upsert.severity,
                            summary: upsert.summary,
                            details: upsert.details,
                            evidence_ids: upsert.evidence_ids,
                            first_seen_at: ts,
                            last_seen_at: ts,
                            resolved_at: None,
                        });
                },
                Err(err) => warn!(event = %record.id, error = %err, "bad fact_upserted payload"),
            }
        },
        "truth_ledger:fact_resolved" => {
            if let Some(id) = payload.get("id").and_then(serde_json::Value::as_str)
                && let Some(fact) = state.facts.get_mut(id)
            {
                fact.status = FactStatus::Resolved;
                fact.resolved_at = Some(record.timestamp);
                fact.last_seen_at = record.timestamp;
            }
        },
        other => {
            warn!(event_type = other, "unknown truth_ledger operation skipped");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(event_type: &str, payload: serde_json::Value, ts: TimestampMs) -> EventRecord {
        EventRecord {
            id: "evt-1".into(),
            session_id: "s1".into(),
            event_type: event_type.to_owned(),
            timestamp: ts,
            turn: None,
            payload: Some(payload),
        }
    }

    fn upsert(id: &str, summary: &str, ts: TimestampMs) -> EventRecord {
        record(
            "truth_ledger:fact_upserted",
            json!({"id": id, "kind": "verifier", "severity": "error", "summary": summary}),
            ts,
        )
    }

    #[test]
    fn test_upsert_then_resolve_retains_record() {
        let mut state = TruthState::default();
        fold_truth_event(&mut state, &upsert("f1", "broken build", 100));
        fold_truth_event(
            &mut state,
            &record("truth_ledger:fact_resolved", json!({"id": "f1"}), 200),
        );

        let fact = state.fact("f1").unwrap();
        assert_eq!(fact.status, FactStatus::Resolved);
        assert_eq!(fact.resolved_at, Some(200));
        assert!(state.is_resolved("f1"));
        assert!(state.active_facts().is_empty());
    }

    #[test]
    fn test_first_seen_never_decreases() {
        let mut state = TruthState::default();
        fold_truth_event(&mut state, &upsert("f1", "v1", 100));
        fold_truth_event(&mut state, &upsert("f1", "v2", 300));

        let fact = state.fact("f1").unwrap();
        assert_eq!(fact.first_seen_at, 100);
        assert_eq!(fact.last_seen_at, 300);
        assert_eq!(fact.summary, "v2");
    }

    #[test]
    fn test_reupsert_reactivates() {
        let mut state = TruthState::default();
        fold_truth_event(&mut state, &upsert("f1", "v1", 100));
        fold_truth_event(
            &mut state,
            &record("truth_ledger:fact_resolved", json!({"id": "f1"}), 200),
        );
        fold_truth_event(&mut state, &upsert("f1", "back again", 300));

        let fact = state.fact("f1").unwrap();
        assert_eq!(fact.status, FactStatus::Active);
        assert_eq!(fact.resolved_at, None);
        assert_eq!(fact.first_seen_at, 100);
    }

    #[test]
    fn test_active_facts_sorted_by_severity() {
        let mut state = TruthState::default();
        fold_truth_event(
            &mut state,
            &record(
                "truth_ledger:fact_upserted",
                json!({"id": "a", "kind": "note", "severity": "info", "summary": "note"}),
                1,
            ),
        );
        fold_truth_event(&mut state, &upsert("b", "broken", 2));

        let active = state.active_facts();
        assert_eq!(active[0].id, "b");
        assert_eq!(active[1].id, "a");
    }
}
