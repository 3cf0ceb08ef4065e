use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// One mutation within a two-phase `apply_config_batch` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMutation {
    pub key: String,
    pub value: Value,
}

/// Options controlling a single `apply_config_batch` call.
#[derive(Debug, Clone)]
pub struct BatchApplyOptions {
    /// Idempotency key; repeating the call with the same key and the same
    /// backend must yield the same final state and the same `committed`
    /// plan-meta row.
    pub idempotency_key: String,
    /// How long an `in_progress` lock record is honored before it is
    /// considered abandoned and safe to retry.
    pub ttl: Duration,
    /// Free-form label surfaced in the plan-meta record (e.g. the config
    /// plane operation name).
    pub stage: String,
}

/// Status of a plan-meta lock/commit record at `plan:meta:<idempotency_key>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    InProgress,
    Committed,
    Failed,
}

/// Record stored at `plan:meta:<idempotency_key>`, used to make
/// `apply_config_batch` idempotent under client retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanMetaRecord {
    pub idempotency_key: String,
    pub status: PlanStatus,
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutation_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlanMetaRecord {
    pub fn in_progress(idempotency_key: String, stage: String, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            idempotency_key,
            status: PlanStatus::InProgress,
            stage,
            started_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
            finished_at: None,
            duration_ms: None,
            payload_hash: None,
            mutation_count: None,
            error: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn mark_committed(&mut self, mutation_count: usize, payload_hash: String) {
        let now = Utc::now();
        self.status = PlanStatus::Committed;
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.mutation_count = Some(mutation_count);
        self.payload_hash = Some(payload_hash);
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: String) {
        let now = Utc::now();
        self.status = PlanStatus::Failed;
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.error = Some(error);
    }
}

/// Outcome of an `apply_config_batch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchApplyOutcome {
    /// This call performed the apply and it committed successfully.
    Committed { mutation_count: usize },
    /// A prior call with the same idempotency key already committed; this
    /// call performed no writes.
    AlreadyCommitted,
    /// Another caller's apply with the same idempotency key is still
    /// within its TTL; the caller should retry later.
    InProgress,
}

/// Stable hash of a mutation set's payload, used to populate
/// `PlanMetaRecord::payload_hash` for audit purposes.
pub fn hash_mutations(mutations: &[BatchMutation]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    for mutation in mutations {
        mutation.key.hash(&mut hasher);
        // `Value` doesn't implement `Hash`; hash its canonical string form.
        mutation.value.to_string().hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_stable_for_same_mutations() {
        let a = vec![BatchMutation {
            key: "k".into(),
            value: json!({"a": 1}),
        }];
        let b = vec![BatchMutation {
            key: "k".into(),
            value: json!({"a": 1}),
        }];
        assert_eq!(hash_mutations(&a), hash_mutations(&b));
    }

    #[test]
    fn plan_meta_transitions() {
        let mut rec = PlanMetaRecord::in_progress("abc".into(), "config".into(), Duration::from_secs(30));
        assert_eq!(rec.status, PlanStatus::InProgress);
        rec.mark_committed(1, "deadbeef".into());
        assert_eq!(rec.status, PlanStatus::Committed);
        assert_eq!(rec.mutation_count, Some(1));
    }
}
