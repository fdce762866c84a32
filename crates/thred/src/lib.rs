//! # Thred
//!
//! An event-driven orchestration engine. Participants exchange events; the
//! engine starts a **thred** (a conversation instance) whenever an unbound
//! event matches a **pattern**, then walks that thred through the pattern's
//! reactions as further events arrive.
//!
//! ## Core Concepts
//!
//! - [`PatternModel`] / [`Pattern`] = the template: an ordered list of
//!   [`Reaction`]s, the first of which decides whether a new thred starts
//! - [`Thred`] = one live conversation: current reaction, participants,
//!   locals, lifecycle status
//! - [`Dispatcher`] = the single entry point for inbound [`Event`]s
//! - [`Storage`] = keyed store plus a redlock-style distributed lock; every
//!   mutation of thred or pattern state happens under that id's lock
//!
//! ## Architecture
//!
//! ```text
//! Transport
//!     │
//!     ▼ consider()
//! Dispatcher ───────────────── thredId? ─────────────────┐
//!     │ no                                               │ yes
//!     ▼                                                  ▼
//! PatternCache (in order)                     ThredDirectory::with_thred
//!     │ first match                                      │
//!     ▼                                                  │
//! ThredDirectory::with_new_thred                         │
//!     │                                                  │
//!     └──────────────► Thred::consider ◄─────────────────┘
//!                           │
//!                           ├─► Condition::apply ─► publish? ─► MessageSink
//!                           │
//!                           └─► transition ─► Active: save
//!                                             ended:  archive + delete
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One writer per thred** - state is only loaded and saved under the
//!    thred id's lock, across processes
//! 2. **Patterns are immutable** - a compiled pattern is shared read-only;
//!    edits produce a new version with a newer timestamp
//! 3. **Ended threds leave the keyed store** - FINISHED and TERMINATED threds
//!    are archived to the record store first, then deleted
//! 4. **Locks expire** - a crashed holder blocks others for at most one ttl
//!
//! ## Example
//!
//! ```ignore
//! use thred::{Condition, EngineBuilder, EngineConfig, Event, EventSource, PatternModel, Reaction, Transition};
//!
//! let handle = EngineBuilder::in_memory(EngineConfig::default()).build().start().await?;
//!
//! let model = PatternModel::new("greeting", "Greeting", vec![
//!     Reaction::new("hello", Condition::filter(r#"event.type == "hello""#).with_transition(Transition::next())),
//!     Reaction::new("bye", Condition::filter(r#"event.type == "bye""#).with_transition(Transition::terminate())),
//! ]);
//! handle.engine().patterns().store_pattern_model(model).await?;
//!
//! let started = handle.consider(&Event::new("hello", EventSource::new("alice", "Alice"))).await?;
//! ```

mod config;
mod context;
mod delivery;
mod directory;
mod dispatcher;
mod engine;
mod error;
mod event;
mod expression;
mod pattern;
mod patterns;
mod reaction;
mod records;
mod thred;

pub mod keyed_store;

#[cfg(test)]
mod lock_tests;


pub use crate::config::{EngineConfig, LockConfig};
pub use crate::context::ThredContext;
pub use crate::delivery::{AddressResolver, ContextAddressResolver, MessageSink, NoOpMessageSink, OutboundMessage};
pub use crate::directory::ThredDirectory;
pub use crate::dispatcher::{Dispatch, Dispatcher};
pub use crate::engine::{Engine, EngineBuilder, EngineHandle};
pub use crate::error::{ErrorCategory, Result, StoreError, ThredError};
pub use crate::event::{
    Content, Event, EventData, EventFault, EventSource, BROADCAST_EVENT_TYPE, REACTION_EVENT_TYPE,
};
pub use crate::expression::{truthy, BasicEvaluator, ExpressionEvaluator, ExpressionScope};
pub use crate::pattern::{Pattern, PatternModel};
pub use crate::patterns::{PatternCache, TIMESTAMP_META};
pub use crate::reaction::{
    Condition, ConditionKind, ConditionMatch, Expiry, Publish, Reaction, Transform, Transition,
    TransitionInput, TransitionTarget, THRED_SCOPE,
};
pub use crate::records::{log_types, AuditLog, MemoryRecordStore, RecordStore};
pub use crate::thred::{Consideration, Publication, ReactionStore, Thred, ThredMeta, ThredState, ThredStatus};

pub use crate::keyed_store::{KeyedStore, LockGuard, LockNode, MemoryKeyedStore, Redlock, Resource, Storage};

/// Record kinds written to the [`RecordStore`].
pub mod record_kinds {
    pub use crate::records::kinds::*;
}

pub use async_trait::async_trait;
