use std::sync::Arc;

use serde_json::json;
use thred::{record_kinds, Dispatch, ErrorCategory, RecordStore, ThredError, ThredStatus};
use thred_testing::fixtures::{self, event, reply};
use thred_testing::{engine_with_records, FailingRecordStore, RecordingSink};

#[tokio::test]
async fn audit_failures_never_block_dispatch() {
    let records = Arc::new(FailingRecordStore::new());
    records.fail_writes_to(record_kinds::EVENT);
    records.fail_writes_to(record_kinds::THRED_LOG);
    let sink = RecordingSink::new();
    let engine = engine_with_records(sink.clone(), records.clone());
    engine
        .patterns()
        .store_pattern_model(fixtures::ping_pong())
        .await
        .unwrap();

    assert_eq!(engine.consider(&event("unrelated", "alice")).await.unwrap(), Dispatch::Unmatched);

    let thred_id = engine
        .consider(&event("ping", "alice"))
        .await
        .unwrap()
        .thred_id()
        .map(str::to_string)
        .unwrap();
    let ended = engine.consider(&reply("ping", "alice", &thred_id)).await.unwrap();
    assert!(matches!(ended, Dispatch::Bound { status: ThredStatus::Terminated, .. }));
    assert_eq!(sink.len(), 2);

    // The archive itself is not an audit write and still landed.
    assert_eq!(records.count(record_kinds::THRED, &json!({ "id": thred_id })).await.unwrap(), 1);
    assert_eq!(records.count(record_kinds::THRED_LOG, &json!({})).await.unwrap(), 0);
}

#[tokio::test]
async fn failed_archive_keeps_thred_in_keyed_store() {
    let records = Arc::new(FailingRecordStore::new());
    let engine = engine_with_records(RecordingSink::new(), records.clone());
    engine
        .patterns()
        .store_pattern_model(fixtures::ping_pong())
        .await
        .unwrap();
    let thred_id = engine
        .consider(&event("ping", "alice"))
        .await
        .unwrap()
        .thred_id()
        .map(str::to_string)
        .unwrap();

    records.fail_writes_to(record_kinds::THRED);
    let err = engine.consider(&reply("ping", "alice", &thred_id)).await.unwrap_err();
    assert!(matches!(err, ThredError::Store(_)));
    assert_eq!(err.category(), ErrorCategory::Unavailable);
    assert!(err.is_retryable());

    let state = engine.directory().snapshot(&thred_id).await.unwrap().unwrap();
    assert_eq!(state.status, ThredStatus::Active);
    assert_eq!(state.reaction.reaction_name.as_deref(), Some("return"));

    // Once the archive is back the same event can be retried.
    records.heal(record_kinds::THRED);
    let ended = engine.consider(&reply("ping", "alice", &thred_id)).await.unwrap();
    assert!(matches!(ended, Dispatch::Bound { status: ThredStatus::Terminated, .. }));
    assert!(engine.directory().snapshot(&thred_id).await.unwrap().is_none());
}
