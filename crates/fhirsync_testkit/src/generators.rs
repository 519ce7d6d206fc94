//! Property-based test generators using proptest.

use crate::fixtures::{condition_json, malformed_json};
use chrono::{DateTime, Duration, TimeZone, Utc};
use fhirsync_model::ConflictPolicy;
use proptest::prelude::*;
use serde_json::Value;

/// Strategy for generating conflict policies.
pub fn policy_strategy() -> impl Strategy<Value = ConflictPolicy> {
    prop_oneof![
        Just(ConflictPolicy::ServerWins),
        Just(ConflictPolicy::ClientWins),
        Just(ConflictPolicy::Manual),
    ]
}

/// Strategy for timestamps within 2024.
pub fn timestamp_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    let start = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .expect("Valid start date");
    (0i64..365 * 24 * 60).prop_map(move |minutes| start + Duration::minutes(minutes))
}

/// A batch of raw `Condition` resources, some of them malformed.
#[derive(Debug, Clone)]
pub struct ConditionBatch {
    /// Raw resources in fetch order.
    pub resources: Vec<Value>,
    /// IDs of the well-formed resources.
    pub valid_ids: Vec<String>,
    /// IDs of the malformed resources.
    pub malformed_ids: Vec<String>,
}

/// Strategy for a batch of conditions with unique IDs.
///
/// Each entry is malformed with probability roughly one in five.
pub fn condition_batch_strategy(max_len: usize) -> impl Strategy<Value = ConditionBatch> {
    prop::collection::vec((prop::bool::weighted(0.2), timestamp_strategy()), 1..max_len.max(2))
        .prop_map(|entries| {
            let mut batch = ConditionBatch {
                resources: Vec::with_capacity(entries.len()),
                valid_ids: Vec::new(),
                malformed_ids: Vec::new(),
            };
            for (index, (malformed, updated)) in entries.into_iter().enumerate() {
                let id = format!("cond-{index}");
                if malformed {
                    batch.resources.push(malformed_json("Condition", &id));
                    batch.malformed_ids.push(id);
                } else {
                    let stamp = updated.to_rfc3339();
                    batch
                        .resources
                        .push(condition_json(&id, &stamp, &format!("Condition {index}")));
                    batch.valid_ids.push(id);
                }
            }
            batch
        })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
