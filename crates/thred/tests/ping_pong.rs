use std::time::Duration;

use serde_json::json;
use thred::{record_kinds, Dispatch, RecordStore, ThredStatus, REACTION_EVENT_TYPE};
use thred_testing::fixtures::{self, event, reply};
use thred_testing::{memory_engine, RecordingSink};

#[tokio::test]
async fn ping_pong_answers_twice_then_ends() {
    let sink = RecordingSink::new();
    let engine = memory_engine(sink.clone());
    engine
        .patterns()
        .store_pattern_model(fixtures::ping_pong())
        .await
        .unwrap();

    let thred_id = match engine.consider(&event("ping", "alice")).await.unwrap() {
        Dispatch::Started { thred_id, status, .. } => {
            assert_eq!(status, ThredStatus::Active);
            thred_id
        }
        other => panic!("expected a new thred, got {other:?}"),
    };
    assert!(thred_id.starts_with("ping-pong_"));

    let first = sink.take();
    assert!(sink.is_empty());
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].to, vec!["alice".to_string()]);
    assert_eq!(first[0].event.event_type, REACTION_EVENT_TYPE);
    assert_eq!(first[0].event.thred_id.as_deref(), Some(thred_id.as_str()));
    assert_eq!(first[0].event.value("to"), Some(&json!("alice")));

    let ended = engine.consider(&reply("ping", "bob", &thred_id)).await.unwrap();
    assert!(matches!(ended, Dispatch::Bound { status: ThredStatus::Terminated, .. }));

    assert_eq!(sink.sent_to("bob").len(), 1);
    assert!(sink.sent_to("carol").is_empty());
    let second = sink.take();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].to, vec!["alice".to_string(), "bob".to_string()]);

    // Gone from the keyed store, present in the archive.
    assert!(engine.directory().snapshot(&thred_id).await.unwrap().is_none());
    let archived = engine
        .records()
        .get_one(record_kinds::THRED, &json!({ "id": thred_id }))
        .await
        .unwrap()
        .expect("archived thred");
    assert_eq!(archived["patternId"], json!("ping-pong"));

    // Further events for the ended thred are orphans.
    assert!(engine.consider(&reply("ping", "alice", &thred_id)).await.is_err());
}

#[tokio::test]
async fn started_engine_sweeps_expired_threds() {
    let engine = memory_engine(RecordingSink::new());
    engine
        .patterns()
        .store_pattern_model(fixtures::keepalive(Duration::from_millis(40)))
        .await
        .unwrap();
    let handle = engine.start().await.unwrap();

    let thred_id = handle
        .consider(&event("keepalive", "alice"))
        .await
        .unwrap()
        .thred_id()
        .map(str::to_string)
        .unwrap();

    // Keepalives are accepted but do not push the expiry out.
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let kept = handle.consider(&reply("keepalive", "alice", &thred_id)).await.unwrap();
        assert!(matches!(kept, Dispatch::Bound { status: ThredStatus::Active, .. }));
    }

    tokio::time::sleep(Duration::from_millis(250)).await;

    let directory = handle.engine().directory();
    assert!(directory.snapshot(&thred_id).await.unwrap().is_none());
    let archived = handle
        .engine()
        .records()
        .get_one(record_kinds::THRED, &json!({ "id": thred_id }))
        .await
        .unwrap()
        .expect("archived thred");
    assert_eq!(archived["status"], json!("TERMINATED"));

    handle.shutdown().await.unwrap();
}
