//! Engine wiring: builder, bootstrap and the background expiry sweeper.
//!
//! ```ignore
//! let handle = EngineBuilder::in_memory(EngineConfig::default())
//!     .with_sink(my_sink)
//!     .build()
//!     .start()
//!     .await?;
//!
//! handle.consider(&event).await?;
//! handle.shutdown().await?;
//! ```

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::delivery::{AddressResolver, ContextAddressResolver, MessageSink, NoOpMessageSink};
use crate::directory::ThredDirectory;
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::error::Result;
use crate::event::Event;
use crate::expression::{BasicEvaluator, ExpressionEvaluator};
use crate::keyed_store::Storage;
use crate::pattern::PatternModel;
use crate::patterns::PatternCache;
use crate::records::{self, AuditLog, MemoryRecordStore, RecordStore};

pub struct EngineBuilder {
    storage: Arc<Storage>,
    records: Arc<dyn RecordStore>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    resolver: Arc<dyn AddressResolver>,
    sink: Arc<dyn MessageSink>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new(storage: Arc<Storage>, records: Arc<dyn RecordStore>) -> Self {
        Self {
            storage,
            records,
            evaluator: Arc::new(BasicEvaluator::new()),
            resolver: Arc::new(ContextAddressResolver),
            sink: Arc::new(NoOpMessageSink),
            config: EngineConfig::default(),
        }
    }

    /// Single-process engine: one in-memory keyed store doubling as the only
    /// lock node, and an in-memory record store.
    pub fn in_memory(config: EngineConfig) -> Self {
        let storage = Arc::new(Storage::in_memory(config.lock.clone()));
        Self::new(storage, Arc::new(MemoryRecordStore::new())).with_config(config)
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_evaluator(mut self, evaluator: impl ExpressionEvaluator + 'static) -> Self {
        self.evaluator = Arc::new(evaluator);
        self
    }

    pub fn with_resolver(mut self, resolver: impl AddressResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_sink(mut self, sink: impl MessageSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Like [`with_sink`](Self::with_sink) for a sink the caller keeps a handle to.
    pub fn with_shared_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Engine {
        let patterns = Arc::new(PatternCache::new(Arc::clone(&self.storage)));
        let directory = Arc::new(ThredDirectory::new(
            Arc::clone(&self.storage),
            Arc::clone(&patterns),
            Arc::clone(&self.records),
            self.config.cleanup_retries,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&directory),
            Arc::clone(&patterns),
            self.evaluator,
            self.resolver,
            self.sink,
            AuditLog::new(Arc::clone(&self.records)),
            self.config.source.clone(),
            self.config.max_forward_hops,
        ));

        Engine {
            config: self.config,
            storage: self.storage,
            records: self.records,
            patterns,
            directory,
            dispatcher,
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    storage: Arc<Storage>,
    records: Arc<dyn RecordStore>,
    patterns: Arc<PatternCache>,
    directory: Arc<ThredDirectory>,
    dispatcher: Arc<Dispatcher>,
}

impl Engine {
    /// Validate the config, bootstrap and spawn the expiry sweeper.
    pub async fn start(self) -> Result<EngineHandle> {
        self.config.validate()?;
        self.bootstrap().await?;

        let engine = Arc::new(self);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&engine), shutdown_rx));
        info!(patterns = engine.patterns.len(), "engine started");

        Ok(EngineHandle {
            engine,
            shutdown_tx,
            sweeper,
        })
    }

    /// Publish every enabled pattern from the record store into the keyed
    /// store, then load the keyed store's full pattern index into the cache.
    pub async fn bootstrap(&self) -> Result<usize> {
        let rows = self
            .records
            .get(records::kinds::PATTERN, &json!({ "isEnabled": true }))
            .await?;

        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<PatternModel>(row) {
                Ok(model) => models.push(model),
                Err(err) => warn!(error = %err, "skipping unreadable pattern record"),
            }
        }
        let published = self.patterns.add_patterns(models).await?;
        let loaded = self.patterns.load_patterns().await?;
        info!(published, loaded, "patterns bootstrapped");
        Ok(loaded)
    }

    pub async fn consider(&self, event: &Event) -> Result<Dispatch> {
        self.dispatcher.consider(event).await
    }

    /// One pass of the expiry sweeper.
    pub async fn sweep_expired(&self) -> Result<usize> {
        self.directory.expire_due(Utc::now()).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn patterns(&self) -> &Arc<PatternCache> {
        &self.patterns
    }

    pub fn directory(&self) -> &Arc<ThredDirectory> {
        &self.directory
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

async fn sweep_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(engine.config.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = engine.sweep_expired().await {
                    warn!(error = %err, "expiry sweep failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("expiry sweeper stopped");
}

/// A started engine.
pub struct EngineHandle {
    engine: Arc<Engine>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: JoinHandle<()>,
}

impl EngineHandle {
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn consider(&self, event: &Event) -> Result<Dispatch> {
        self.engine.consider(event).await
    }

    /// Stop the sweeper and close the keyed store.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.sweeper.await {
            warn!(error = %err, "expiry sweeper ended abnormally");
        }
        self.engine.storage.close().await?;
        info!("engine stopped");
        Ok(())
    }
}
