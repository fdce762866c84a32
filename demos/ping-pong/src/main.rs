//! # Ping Pong Demo
//!
//! Two participants play one round of ping pong through an in-memory engine.
//! The first `ping` starts a thred, the second one ends it.
//!
//! Run with `RUST_LOG=debug cargo run -p ping-pong-demo` to watch the
//! engine's own logs.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use thred::{
    Condition, Dispatch, EngineBuilder, EngineConfig, Event, EventSource, MessageSink, OutboundMessage,
    PatternModel, Reaction, Transition,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Sink
// ============================================================================

/// Prints every outbound message instead of delivering it.
struct ConsoleSink;

#[async_trait]
impl MessageSink for ConsoleSink {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let title = message
            .event
            .data
            .as_ref()
            .and_then(|d| d.title.as_deref())
            .unwrap_or("-");
        let to = message.event.value("to").cloned().unwrap_or_default();
        info!(recipients = ?message.to, title, %to, "outbound");
        Ok(())
    }
}

// ============================================================================
// Pattern
// ============================================================================

fn ping_pong() -> PatternModel {
    let pong = || {
        Condition::filter(r#"event.type == "ping""#)
            .with_transform(json!({
                "title": "pong",
                "content": { "values": { "to": "$xpr(event.source.id)" } }
            }))
            .publish_to(["$thred"])
    };
    PatternModel::new(
        "ping-pong",
        "Ping Pong",
        vec![
            Reaction::new("serve", pong().with_transition(Transition::next())),
            Reaction::new("return", pong().with_transition(Transition::terminate())),
        ],
    )
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let engine = EngineBuilder::in_memory(EngineConfig::default())
        .with_sink(ConsoleSink)
        .build();
    engine.patterns().store_pattern_model(ping_pong()).await?;
    let handle = engine.start().await?;

    let alice = EventSource::new("alice", "Alice");
    let bob = EventSource::new("bob", "Bob");

    let thred_id = match handle.consider(&Event::new("ping", alice)).await? {
        Dispatch::Started { thred_id, .. } => thred_id,
        other => anyhow::bail!("ping did not start a thred: {other:?}"),
    };
    info!(%thred_id, "alice served");

    let returned = handle.consider(&Event::new("ping", bob).with_thred(&thred_id)).await?;
    info!(?returned, "bob returned");

    let archived = handle.engine().directory().snapshot(&thred_id).await?.is_none();
    info!(archived, "round over");

    handle.shutdown().await?;
    Ok(())
}
