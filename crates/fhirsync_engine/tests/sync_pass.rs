//! Integration tests for a single sync pass.

use chrono::{Duration as ChronoDuration, Utc};
use fhirsync_engine::{
    EngineError, StoreCall, SyncConfig, SyncErrorKind, SyncNeedReason, SyncOptions, SyncStatus,
};
use fhirsync_model::{Collection, FetchedResources, PendingChange, RecordMeta, ResourceType};
use fhirsync_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const FEB: &str = "2024-02-01T00:00:00Z";

#[tokio::test]
async fn first_sync_is_full_and_inserts_everything() {
    let harness = TestHarness::new();
    harness.fetcher.set_response(sample_fetch(FEB));
    harness.engine.initialize().await.unwrap();

    let result = harness.engine.sync(SyncOptions::default()).await;

    assert!(result.success);
    assert!(result.full_refresh);
    assert_eq!(result.connection_id.as_deref(), Some(CONNECTION_ID));
    assert_eq!(result.new_data.len(), 6);
    assert_eq!(result.items_synced[&ResourceType::Patient], 1);
    assert_eq!(result.items_synced[&ResourceType::Condition], 2);
    assert!(result.errors.is_empty());

    let request = harness.fetcher.last_request().unwrap();
    assert!(request.since.is_none());
    assert!(request.include_patient);
    assert_eq!(request.page_size, 100);

    let state = harness.stored_state();
    assert_eq!(state.last_successful_sync_at, Some(result.timestamp));
    assert_eq!(state.last_sync_at, result.timestamp);
    for resource_type in ResourceType::DEFAULTS {
        assert_eq!(state.watermark(resource_type), Some(result.timestamp));
    }
}

#[tokio::test]
async fn full_refresh_twice_inserts_nothing_new() {
    let harness = TestHarness::new();
    harness.fetcher.set_response(sample_fetch(FEB));

    let first = harness.engine.sync(SyncOptions::full_refresh()).await;
    let writes_after_first = harness.store.calls().len();
    let second = harness.engine.sync(SyncOptions::full_refresh()).await;

    assert_eq!(first.new_data.len(), 6);
    assert!(second.success);
    assert!(second.new_data.is_empty());
    assert_eq!(harness.store.calls().len(), writes_after_first);
    assert_eq!(harness.store.records(Collection::Conditions).len(), 2);
}

#[tokio::test]
async fn recent_success_fetches_incrementally_from_last_sync() {
    let harness = TestHarness::new();
    let last = Utc::now() - ChronoDuration::hours(1);
    harness.seed_state(|state| state.mark_success(last));

    let result = harness.engine.sync(SyncOptions::default()).await;

    assert!(result.success);
    assert!(!result.full_refresh);
    assert_eq!(harness.fetcher.last_request().unwrap().since, Some(last));
}

#[tokio::test]
async fn stale_data_forces_full_refresh() {
    let harness = TestHarness::with_config(SyncConfig::default().with_max_data_age_days(7));
    harness.seed_state(|state| state.mark_success(Utc::now() - ChronoDuration::days(8)));

    let result = harness.engine.sync(SyncOptions::default()).await;

    assert!(result.full_refresh);
    assert!(harness.fetcher.last_request().unwrap().since.is_none());
}

#[tokio::test]
async fn requested_full_refresh_ignores_recent_success() {
    let harness = TestHarness::new();
    harness.seed_state(|state| state.mark_success(Utc::now() - ChronoDuration::minutes(5)));

    let result = harness.engine.sync(SyncOptions::full_refresh()).await;

    assert!(result.full_refresh);
    assert!(harness.fetcher.last_request().unwrap().since.is_none());
}

#[tokio::test]
async fn newer_server_condition_updates_local_copy() {
    let harness = TestHarness::new();
    harness.store.seed(condition("cond-1", "2024-01-01", "Asthma"));
    harness.fetcher.set_response(FetchedResources {
        conditions: vec![condition_json("cond-1", FEB, "Asthma")],
        ..Default::default()
    });

    let result = harness.engine.sync(SyncOptions::default()).await;

    assert!(result.success);
    assert!(result.conflicts.is_empty());
    assert_eq!(result.new_data.conditions.len(), 1);
    assert_eq!(result.new_data.conditions[0].last_updated, ts(FEB));
    assert_eq!(
        harness.store.calls(),
        vec![StoreCall::Update(Collection::Conditions, "cond-1".into())]
    );
    let stored = harness.store.find(Collection::Conditions, "cond-1").unwrap();
    assert_eq!(stored.last_updated(), ts(FEB));
}

#[tokio::test]
async fn older_or_equal_server_copy_is_ignored() {
    let harness = TestHarness::new();
    harness.store.seed(condition("cond-1", FEB, "Asthma"));
    harness.fetcher.set_response(FetchedResources {
        conditions: vec![
            condition_json("cond-1", FEB, "Asthma"),
            condition_json("cond-1", "2024-01-01T00:00:00Z", "Old asthma"),
        ],
        ..Default::default()
    });

    let result = harness.engine.sync(SyncOptions::default()).await;

    assert!(result.new_data.is_empty());
    assert!(harness.store.calls().is_empty());
}

#[tokio::test]
async fn vaccinations_are_never_updated() {
    let harness = TestHarness::new();
    harness
        .store
        .seed(vaccination("imm-1", "2024-01-01", "Influenza"));
    harness.fetcher.set_response(FetchedResources {
        immunizations: vec![
            immunization_json("imm-1", FEB, "Influenza (corrected)"),
            immunization_json("imm-2", FEB, "Tetanus"),
        ],
        ..Default::default()
    });

    let result = harness.engine.sync(SyncOptions::default()).await;

    assert_eq!(result.new_data.vaccinations.len(), 1);
    assert_eq!(result.new_data.vaccinations[0].external_reference, "imm-2");
    assert_eq!(
        harness.store.calls(),
        vec![StoreCall::Save(Collection::Vaccinations, "imm-2".into())]
    );
    let kept = harness.store.find(Collection::Vaccinations, "imm-1").unwrap();
    assert_eq!(kept.last_updated(), ts("2024-01-01"));
}

#[tokio::test]
async fn lab_results_take_server_value_despite_local_edit() {
    let harness = TestHarness::new();
    harness
        .store
        .seed(lab_result("obs-1", "2024-01-01", "HbA1c", 6.1, "%"));
    harness.seed_state(|state| {
        state.mark_success(ts("2024-01-15"));
        state.pending_changes.push(PendingChange::local_edit(
            Collection::LabResults,
            "obs-1",
            ts("2024-01-20"),
        ));
    });
    harness.fetcher.set_response(FetchedResources {
        observations: vec![observation_json("obs-1", FEB, "HbA1c", 6.4, "%")],
        ..Default::default()
    });

    let result = harness.engine.sync(SyncOptions::default()).await;

    assert!(result.conflicts.is_empty());
    assert_eq!(result.new_data.lab_results.len(), 1);
    assert_eq!(result.new_data.lab_results[0].value, Some(6.4));
    assert_eq!(
        harness.store.calls(),
        vec![StoreCall::Update(Collection::LabResults, "obs-1".into())]
    );
}

#[tokio::test]
async fn duplicate_reference_in_batch_is_saved_once() {
    let harness = TestHarness::new();
    harness.fetcher.set_response(FetchedResources {
        conditions: vec![
            condition_json("cond-1", "2024-01-01T00:00:00Z", "Asthma"),
            condition_json("cond-1", FEB, "Severe asthma"),
        ],
        ..Default::default()
    });

    let result = harness.engine.sync(SyncOptions::default()).await;

    assert_eq!(result.new_data.conditions.len(), 1);
    assert_eq!(result.new_data.conditions[0].name, "Severe asthma");
    assert_eq!(
        harness.store.calls(),
        vec![StoreCall::Save(Collection::Conditions, "cond-1".into())]
    );
}

#[tokio::test]
async fn one_malformed_resource_does_not_block_the_rest() {
    let harness = TestHarness::with_mapper(
        SyncConfig::default(),
        Arc::new(FailingMapper::new(["cond-2"])),
    );
    harness.fetcher.set_response(FetchedResources {
        conditions: vec![
            condition_json("cond-1", FEB, "Asthma"),
            condition_json("cond-2", FEB, "Eczema"),
            condition_json("cond-3", FEB, "Migraine"),
        ],
        allergies: vec![allergy_json("alg-1", FEB, "Peanut")],
        ..Default::default()
    });

    let result = harness.engine.sync(SyncOptions::default()).await;

    assert!(result.success);
    assert_eq!(result.errors.len(), 1);
    let error = &result.errors[0];
    assert_eq!(error.kind, SyncErrorKind::Mapping);
    assert_eq!(error.resource_type, Some(ResourceType::Condition));
    assert_eq!(error.resource_id.as_deref(), Some("cond-2"));
    assert!(error.recoverable);
    assert_eq!(result.new_data.conditions.len(), 2);
    assert_eq!(result.new_data.allergies.len(), 1);

    let status = harness.engine.status();
    assert_eq!(status.status, SyncStatus::Completed);
    assert_eq!(status.message, "Sync completed with 1 errors");
}

#[tokio::test]
async fn signed_out_pass_fails_without_touching_state() {
    let harness = TestHarness::new();
    harness.auth.revoke();

    let result = harness.engine.sync(SyncOptions::default()).await;

    assert!(!result.success);
    assert!(result.connection_id.is_none());
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, SyncErrorKind::Authentication);
    assert!(!result.errors[0].recoverable);
    assert_eq!(harness.engine.status().status, SyncStatus::Failed);
    assert_eq!(harness.state_store.save_count(), 0);
    assert!(harness.fetcher.requests().is_empty());
}

#[tokio::test]
async fn rejected_token_is_not_recoverable() {
    let harness = TestHarness::new();
    harness
        .fetcher
        .push_error(EngineError::AuthenticationFailed("token expired".into()));

    let result = harness.engine.sync(SyncOptions::default()).await;

    assert!(!result.success);
    assert_eq!(result.connection_id.as_deref(), Some(CONNECTION_ID));
    assert!(!result.errors[0].recoverable);
}

#[tokio::test]
async fn fetch_failure_is_recoverable_and_keeps_state() {
    let harness = TestHarness::new();
    let last = Utc::now() - ChronoDuration::hours(2);
    harness.seed_state(|state| {
        state.mark_success(last);
        state.advance_watermark(ResourceType::Condition, last);
    });
    let before = harness.stored_state();
    harness
        .fetcher
        .push_error(EngineError::fetch_retryable("connection reset"));

    let result = harness.engine.sync(SyncOptions::default()).await;

    assert!(!result.success);
    assert!(!result.full_refresh);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, SyncErrorKind::Fetch);
    assert!(result.errors[0].recoverable);
    assert_eq!(harness.stored_state(), before);

    let status = harness.engine.status();
    assert_eq!(status.status, SyncStatus::Failed);
    assert!(status.error.unwrap().contains("connection reset"));
    assert_eq!(status.last_successful_sync_at, Some(last));
}

#[tokio::test]
async fn store_failure_aborts_the_pass() {
    let harness = TestHarness::new();
    harness.fetcher.set_response(sample_fetch(FEB));
    harness.store.set_fail_writes(true);

    let result = harness.engine.sync(SyncOptions::default()).await;

    assert!(!result.success);
    assert_eq!(result.errors[0].kind, SyncErrorKind::Store);
    assert!(result.errors[0].recoverable);
    assert_eq!(harness.state_store.save_count(), 0);
}

#[tokio::test]
async fn status_walks_every_phase() {
    let harness = TestHarness::new();
    harness.fetcher.set_response(sample_fetch(FEB));
    let recorder = harness.record_statuses();

    harness.engine.sync(SyncOptions::default()).await;

    assert_eq!(
        recorder.statuses(),
        vec![
            SyncStatus::Checking,
            SyncStatus::Fetching,
            SyncStatus::Comparing,
            SyncStatus::Resolving,
            SyncStatus::Applying,
            SyncStatus::Completed,
        ]
    );
    let last = recorder.snapshots().pop().unwrap();
    assert_eq!(last.new_records, Some(6));
    assert!(!last.background);
    assert!(last.next_sync_at.is_some());

    let comparing: Vec<_> = recorder
        .snapshots()
        .into_iter()
        .filter_map(|s| s.progress.and_then(|p| p.resource_type))
        .collect();
    assert_eq!(
        comparing,
        vec![
            ResourceType::Condition,
            ResourceType::MedicationRequest,
            ResourceType::Observation,
            ResourceType::AllergyIntolerance,
            ResourceType::Immunization,
        ]
    );
}

#[tokio::test]
async fn failed_pass_status_then_recovery() {
    let harness = TestHarness::new();
    harness.fetcher.push_error(EngineError::fetch_retryable("timeout"));
    let recorder = harness.record_statuses();

    harness.engine.sync(SyncOptions::default()).await;
    assert_eq!(
        recorder.statuses(),
        vec![SyncStatus::Checking, SyncStatus::Fetching, SyncStatus::Failed]
    );

    recorder.clear();
    let result = harness.engine.sync(SyncOptions::default()).await;
    assert!(result.success);
    assert_eq!(recorder.statuses().first(), Some(&SyncStatus::Checking));
    assert_eq!(harness.engine.status().error, None);
}

#[tokio::test]
async fn new_record_count_is_omitted_when_notification_is_off() {
    let harness = TestHarness::with_config(SyncConfig::default().with_notify_on_new_data(false));
    harness.fetcher.set_response(sample_fetch(FEB));

    harness.engine.sync(SyncOptions::default()).await;

    assert_eq!(harness.engine.status().new_records, None);
}

#[tokio::test]
async fn unsubscribed_callback_is_not_called() {
    let harness = TestHarness::new();
    let recorder = harness.record_statuses();
    drop(recorder);

    let recorder = harness.record_statuses();
    recorder.clear();
    harness.engine.sync(SyncOptions::default()).await;
    assert!(!recorder.snapshots().is_empty());
}

#[tokio::test]
async fn invalidate_cache_forces_full_refresh() {
    let harness = TestHarness::new();
    harness.fetcher.set_response(sample_fetch(FEB));
    harness.engine.sync(SyncOptions::default()).await;
    let saves = harness.state_store.save_count();

    harness.engine.invalidate_cache().await.unwrap();

    assert_eq!(harness.state_store.save_count(), saves + 1);
    let state = harness.stored_state();
    assert!(state.never_synced());
    assert!(state.resource_timestamps.is_empty());
    assert!(harness.engine.is_sync_needed().needed);

    let result = harness.engine.sync(SyncOptions::default()).await;
    assert!(result.full_refresh);
    assert!(harness.fetcher.last_request().unwrap().since.is_none());
    assert!(result.new_data.is_empty());
}

#[tokio::test]
async fn sync_need_follows_interval() {
    let harness = TestHarness::new();
    assert_eq!(
        harness.engine.is_sync_needed().reason,
        SyncNeedReason::NeverSynced
    );

    harness.engine.sync(SyncOptions::default()).await;
    let need = harness.engine.is_sync_needed();
    assert!(!need.needed);
    assert_eq!(need.reason, SyncNeedReason::RecentlySynced);

    let eager = TestHarness::with_config(SyncConfig::default().with_sync_interval(Duration::ZERO));
    eager.engine.sync(SyncOptions::default()).await;
    assert_eq!(
        eager.engine.is_sync_needed().reason,
        SyncNeedReason::IntervalElapsed
    );
}

#[tokio::test]
async fn next_sync_is_one_interval_after_completion() {
    let harness = TestHarness::with_config(SyncConfig::default().with_sync_interval_minutes(15));

    let result = harness.engine.sync(SyncOptions::default()).await;

    assert_eq!(
        result.next_sync_at,
        result.timestamp + ChronoDuration::minutes(15)
    );
    assert_eq!(
        harness.engine.status().next_sync_at,
        Some(result.next_sync_at)
    );
}

#[tokio::test]
async fn only_fetched_types_advance_watermarks() {
    let harness = TestHarness::new();
    harness.fetcher.set_response(FetchedResources {
        conditions: vec![condition_json("cond-1", FEB, "Asthma")],
        ..Default::default()
    });

    let result = harness.engine.sync(SyncOptions::default()).await;

    let state = harness.stored_state();
    assert_eq!(state.watermark(ResourceType::Condition), Some(result.timestamp));
    assert_eq!(state.watermark(ResourceType::Observation), None);
    assert_eq!(state.watermark(ResourceType::Patient), None);
}

#[tokio::test]
async fn configured_types_limit_the_request() {
    let harness = TestHarness::with_config(
        SyncConfig::default()
            .with_resource_types(vec![ResourceType::Condition, ResourceType::Immunization])
            .with_page_size(25),
    );
    harness.fetcher.set_response(sample_fetch(FEB));

    let result = harness.engine.sync(SyncOptions::default()).await;

    let request = harness.fetcher.last_request().unwrap();
    assert!(!request.include_patient);
    assert_eq!(request.page_size, 25);
    assert_eq!(result.new_data.conditions.len(), 2);
    assert_eq!(result.new_data.vaccinations.len(), 1);
    assert!(result.new_data.medications.is_empty());
    assert!(!result.items_synced.contains_key(&ResourceType::Observation));
}
