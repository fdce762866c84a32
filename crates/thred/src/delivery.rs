//! Outbound delivery and address resolution seams.
//!
//! The engine hands at most one [`OutboundMessage`] per publication to a
//! [`MessageSink`]; transport is the sink's business. Address tokens in a
//! publication are resolved to participant ids by an [`AddressResolver`]
//! first.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::ThredContext;
use crate::event::Event;
use crate::reaction::THRED_SCOPE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub event: Event,
    pub to: Vec<String>,
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn participant_ids_for(&self, tokens: &[String], context: &ThredContext) -> anyhow::Result<Vec<String>>;
}

/// Resolves [`THRED_SCOPE`] to the thred's participants and passes every
/// other token through as a participant id.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextAddressResolver;

#[async_trait]
impl AddressResolver for ContextAddressResolver {
    async fn participant_ids_for(&self, tokens: &[String], context: &ThredContext) -> anyhow::Result<Vec<String>> {
        let mut resolved: Vec<String> = Vec::new();
        for token in tokens {
            if token == THRED_SCOPE {
                resolved.extend(context.participants().map(str::to_string));
            } else {
                resolved.push(token.clone());
            }
        }
        resolved.sort();
        resolved.dedup();
        Ok(resolved)
    }
}

/// Drops every message. For engines that only track state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMessageSink;

#[async_trait]
impl MessageSink for NoOpMessageSink {
    async fn publish(&self, message: OutboundMessage) -> anyhow::Result<()> {
        debug!(event_id = %message.event.id, recipients = message.to.len(), "dropping outbound message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn thred_scope_expands_to_participants() {
        let mut ctx = ThredContext::new("t1");
        ctx.add_participant("alice");
        ctx.add_participant("bob");

        let ids = ContextAddressResolver
            .participant_ids_for(&["$thred".to_string(), "carol".to_string(), "bob".to_string()], &ctx)
            .await
            .unwrap();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }
}
