#[path = "../common/mod.rs"]
mod common;

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use common::{Harness, HarnessOptions, MockArchive, Reply};
use dimse::{QueryLevel, ResultCode};
use futures_util::future::join_all;
use pacs_proxy::fetch::{FetchError, ResourceKey};

fn study_key(study: &str) -> ResourceKey {
    ResourceKey::new(study, format!("{}.SERIES", study), format!("{}.IMG", study))
}

#[tokio::test]
async fn concurrent_requests_for_one_key_share_a_single_fetch() {
    let harness = Harness::new(MockArchive::new().gated());
    let key = study_key("STUDY1");

    let calls = (0..10).map(|_| harness.coordinator.fetch_or_join(&key, QueryLevel::Study));
    let opener = async {
        harness.archive.wait_for_retrieves(1).await;
        assert_eq!(harness.coordinator.in_flight_count(), 1);
        harness.archive.open_gate();
    };
    let (results, _) = tokio::join!(join_all(calls), opener);

    assert_eq!(harness.archive.retrieves(), 1);
    assert_eq!(results.len(), 10);
    for result in &results {
        let outcome = result.as_ref().expect("every waiter sees the success");
        assert_eq!(outcome.code, ResultCode::Success);
    }
    assert_eq!(
        results.iter().filter(|r| r.as_ref().unwrap().recorded).count(),
        10,
        "joined waiters receive the owner's outcome"
    );
    assert_eq!(harness.coordinator.in_flight_count(), 0);
    assert!(harness.cache.expires_at("STUDY1").unwrap().is_some());
}

#[tokio::test]
async fn distinct_keys_fetch_independently() {
    let harness = Harness::new(MockArchive::new());
    let keys: Vec<ResourceKey> = ["A", "B", "C"].iter().map(|s| study_key(s)).collect();

    let results = join_all(
        keys.iter()
            .map(|key| harness.coordinator.fetch_or_join(key, QueryLevel::Study)),
    )
    .await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(harness.archive.retrieves(), 3);
    assert_eq!(harness.cache.entries().unwrap().len(), 3);
}

#[tokio::test]
async fn series_level_dedups_on_series_uid() {
    let harness = Harness::with_options(
        MockArchive::new().gated(),
        HarnessOptions {
            fetch_level: QueryLevel::Series,
            ..Default::default()
        },
    );
    let first = ResourceKey::new("STUDY1", "SERIES1", "IMG1");
    let second = ResourceKey::new("STUDY1", "SERIES1", "IMG2");
    let other = ResourceKey::new("STUDY1", "SERIES2", "IMG3");

    let calls = [&first, &second, &other]
        .into_iter()
        .map(|key| harness.coordinator.fetch_or_join(key, QueryLevel::Series));
    let opener = async {
        harness.archive.wait_for_retrieves(2).await;
        harness.archive.open_gate();
    };
    let (results, _) = tokio::join!(join_all(calls), opener);

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(harness.archive.retrieves(), 2);
}

#[tokio::test]
async fn limiter_caps_simultaneous_fetches() {
    let harness = Harness::with_options(
        MockArchive::new().gated(),
        HarnessOptions {
            capacity: 2,
            ..Default::default()
        },
    );
    let keys: Vec<ResourceKey> = (0..5).map(|i| study_key(&format!("S{}", i))).collect();

    let calls = keys
        .iter()
        .map(|key| harness.coordinator.fetch_or_join(key, QueryLevel::Study));
    let opener = async {
        harness.archive.wait_for_retrieves(2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.archive.retrieves(), 2, "remaining fetches wait for admission");
        assert_eq!(harness.coordinator.in_flight_count(), 5);
        harness.archive.open_gate();
    };
    let (results, _) = tokio::join!(join_all(calls), opener);

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(harness.archive.retrieves(), 5);
    assert_eq!(harness.archive.peak_concurrency(), 2);
}

#[tokio::test]
async fn failure_code_reaches_every_waiter_and_allows_retry() {
    let harness = Harness::new(MockArchive::new().with_reply(Reply::Code(99)).gated());
    let key = study_key("STUDY1");

    let calls = (0..3).map(|_| harness.coordinator.fetch_or_join(&key, QueryLevel::Study));
    let opener = async {
        harness.archive.wait_for_retrieves(1).await;
        harness.archive.open_gate();
    };
    let (results, _) = tokio::join!(join_all(calls), opener);

    for result in results {
        match result {
            Err(FetchError::Rejected { code, .. }) => assert_eq!(code, 99),
            other => panic!("Expected Rejected, got {:?}", other),
        }
    }
    assert_eq!(harness.archive.retrieves(), 1);
    assert!(harness.cache.expires_at("STUDY1").unwrap().is_none());
    assert_eq!(harness.coordinator.in_flight_count(), 0);

    let retry = harness.coordinator.fetch_or_join(&key, QueryLevel::Study).await;
    assert!(retry.is_err());
    assert_eq!(harness.archive.retrieves(), 2);
}

#[tokio::test]
async fn pending_code_is_a_failure() {
    let harness = Harness::new(MockArchive::new().with_reply(Reply::Code(1)));
    let result = harness
        .coordinator
        .fetch_or_join(&study_key("STUDY1"), QueryLevel::Study)
        .await;

    assert!(matches!(result, Err(FetchError::Rejected { code: 1, .. })));
    assert!(harness.cache.entries().unwrap().is_empty());
}

#[tokio::test]
async fn partial_success_is_recorded() {
    let harness = Harness::new(MockArchive::new().with_reply(Reply::Code(2)));
    let outcome = harness
        .coordinator
        .fetch_or_join(&study_key("STUDY1"), QueryLevel::Study)
        .await
        .unwrap();

    assert_eq!(outcome.code, ResultCode::PartialSuccess);
    assert!(outcome.recorded);
}

#[tokio::test]
async fn malformed_result_is_never_success() {
    let harness = Harness::new(MockArchive::new().with_reply(Reply::Malformed("<<garbage>>".into())));
    let result = harness
        .coordinator
        .fetch_or_join(&study_key("STUDY1"), QueryLevel::Study)
        .await;

    match result {
        Err(FetchError::Network(e)) => assert_eq!(e.raw_payload(), Some("<<garbage>>")),
        other => panic!("Expected Network error, got {:?}", other),
    }
    assert!(harness.cache.entries().unwrap().is_empty());
}

#[tokio::test]
async fn network_error_is_a_failure() {
    let harness = Harness::new(MockArchive::new().with_reply(Reply::Error("association rejected".into())));
    let result = harness
        .coordinator
        .fetch_or_join(&study_key("STUDY1"), QueryLevel::Study)
        .await;

    assert!(matches!(result, Err(FetchError::Network(_))));
    assert_eq!(harness.coordinator.in_flight_count(), 0);
}

#[tokio::test]
async fn negative_ttl_never_creates_entries() {
    let harness = Harness::with_options(
        MockArchive::new(),
        HarnessOptions {
            keep_cache_minutes: -1,
            ..Default::default()
        },
    );
    let key = study_key("STUDY1");

    for _ in 0..3 {
        let outcome = harness
            .coordinator
            .fetch_or_join(&key, QueryLevel::Study)
            .await
            .unwrap();
        assert!(!outcome.recorded);
    }

    assert_eq!(harness.archive.retrieves(), 3);
    assert!(harness.cache.entries().unwrap().is_empty());
}

#[tokio::test]
async fn out_of_range_ttl_still_completes_the_fetch() {
    let harness = Harness::with_options(
        MockArchive::new(),
        HarnessOptions {
            keep_cache_minutes: 1_000_000_000_000,
            ..Default::default()
        },
    );

    let outcome = harness
        .coordinator
        .fetch_or_join(&study_key("STUDY1"), QueryLevel::Study)
        .await
        .expect("fetch succeeds even when the expiry cannot be stored");

    assert_eq!(outcome.code, ResultCode::Success);
    assert!(!outcome.recorded);
    assert!(harness.cache.entries().unwrap().is_empty());
}

#[tokio::test]
async fn first_fetch_anchors_the_expiry() {
    let harness = Harness::new(MockArchive::new());
    let key = study_key("STUDY1");

    harness.coordinator.fetch_or_join(&key, QueryLevel::Study).await.unwrap();
    let first = harness.cache.expires_at("STUDY1").unwrap();

    let second = harness.coordinator.fetch_or_join(&key, QueryLevel::Study).await.unwrap();
    assert!(!second.recorded);
    assert_eq!(harness.cache.expires_at("STUDY1").unwrap(), first);
}

#[tokio::test]
async fn fetch_sweeps_other_expired_studies() {
    let harness = Harness::new(MockArchive::new());
    let stale = harness.store_instance("OLD", "IMG");
    let past = Utc::now() - ChronoDuration::hours(2);
    harness.cache.record_if_absent_at("OLD", 5, past).unwrap();
    harness.cache.record_if_absent_at("STUDY1", 5, past).unwrap();
    let own = harness.store_instance("STUDY1", "IMG0");

    harness
        .coordinator
        .fetch_or_join(&study_key("STUDY1"), QueryLevel::Study)
        .await
        .unwrap();

    assert!(!stale.exists());
    assert!(harness.cache.expires_at("OLD").unwrap().is_none());
    assert!(own.exists(), "the study being fetched is protected");
    assert!(harness.cache.expires_at("STUDY1").unwrap().is_some());
}

#[tokio::test]
async fn caller_timeout_does_not_cancel_the_fetch() {
    let harness = Harness::new(MockArchive::new().gated());
    let key = study_key("STUDY1");

    let waited = tokio::time::timeout(
        Duration::from_millis(50),
        harness.coordinator.fetch_or_join(&key, QueryLevel::Study),
    )
    .await;
    assert!(waited.is_err());
    assert_eq!(harness.coordinator.in_flight_count(), 1);

    let opener = async {
        harness.archive.wait_for_retrieves(1).await;
        harness.archive.open_gate();
    };
    let (joined, _) = tokio::join!(
        harness.coordinator.fetch_or_join(&key, QueryLevel::Study),
        opener
    );

    assert!(joined.is_ok());
    assert_eq!(harness.archive.retrieves(), 1);
}

#[tokio::test]
async fn shutdown_abandons_in_flight_fetches_without_recording() {
    let harness = Harness::new(MockArchive::new().gated());
    let key = study_key("STUDY1");

    let stopper = async {
        harness.archive.wait_for_retrieves(1).await;
        harness.coordinator.shutdown();
    };
    let (result, _) = tokio::join!(
        harness.coordinator.fetch_or_join(&key, QueryLevel::Study),
        stopper
    );

    assert!(matches!(result, Err(FetchError::Shutdown)));
    assert!(harness.cache.entries().unwrap().is_empty());
    assert!(harness.coordinator.is_shut_down());

    let after = harness.coordinator.fetch_or_join(&key, QueryLevel::Study).await;
    assert!(matches!(after, Err(FetchError::Shutdown)));
    assert_eq!(harness.archive.retrieves(), 1);
}
