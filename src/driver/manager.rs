//! Discovery Manager
//!
//! Owns the shared target registry and runs at most one discovery session per
//! port. Finished sessions are handed to the mapping layer.

use crate::discovery::config::DiscoveryConfig;
use crate::discovery::context::{PortDescriptor, SessionState};
use crate::discovery::quirks::QuirkHook;
use crate::domain::ports::{IoSubmitterRef, MappingLayerRef, SessionReport};
use crate::driver::port::PortDiscovery;
use crate::error::{Error, ErrorAction, Result};
use crate::metrics::DiscoveryMetrics;
use crate::topology::address::PortId;
use crate::topology::events::TopologyEvent;
use crate::topology::registry::TargetRegistry;
use backoff::ExponentialBackoffBuilder;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Removes a port from the active set when its session ends, however it ends
struct ActiveGuard<'a> {
    active: &'a DashMap<PortId, CancellationToken>,
    port: PortId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.port);
    }
}

/// Entry point for running discovery on a set of host ports
pub struct DiscoveryManager {
    registry: Arc<Mutex<TargetRegistry>>,
    submitter: IoSubmitterRef,
    mapping: Option<MappingLayerRef>,
    config: DiscoveryConfig,
    quirks: Vec<Arc<dyn QuirkHook>>,
    active: DashMap<PortId, CancellationToken>,
    metrics: Arc<DiscoveryMetrics>,
}

impl DiscoveryManager {
    pub fn new(config: DiscoveryConfig, submitter: IoSubmitterRef) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: Arc::new(Mutex::new(TargetRegistry::new())),
            submitter,
            mapping: None,
            config,
            quirks: Vec::new(),
            active: DashMap::new(),
            metrics: Arc::new(DiscoveryMetrics::new()?),
        })
    }

    pub fn with_mapping_layer(mut self, mapping: MappingLayerRef) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn with_quirk(mut self, quirk: Arc<dyn QuirkHook>) -> Self {
        self.quirks.push(quirk);
        self
    }

    /// Use an existing registry, e.g. one sized for a large fabric
    pub fn with_registry(mut self, registry: TargetRegistry) -> Self {
        self.registry = Arc::new(Mutex::new(registry));
        self
    }

    pub fn registry(&self) -> Arc<Mutex<TargetRegistry>> {
        Arc::clone(&self.registry)
    }

    pub fn metrics(&self) -> Arc<DiscoveryMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Subscribe to topology events from every port
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.registry.lock().subscribe()
    }

    pub fn is_active(&self, port: PortId) -> bool {
        self.active.contains_key(&port)
    }

    /// Walk one port's fabric and commit what was found
    pub async fn discover(&self, port: PortDescriptor) -> Result<SessionReport> {
        let id = port.id;
        let cancel = CancellationToken::new();
        match self.active.entry(id) {
            Entry::Occupied(_) => {
                return Err(Error::SessionInProgress { port: id.to_string() });
            }
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }
        let _guard = ActiveGuard {
            active: &self.active,
            port: id,
        };

        info!(port = %id, attached = %port.attached_address, "starting discovery");
        let mut session = SessionState::new(port, self.config.clone());
        for quirk in &self.quirks {
            session = session.with_quirk(Arc::clone(quirk));
        }

        let driver = PortDiscovery::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.submitter),
            Arc::clone(&self.metrics),
        );
        let report = driver.run(session, cancel).await?;
        info!(
            port = %id,
            targets = report.targets.len(),
            added = report.additions.len(),
            removed = report.removals.len(),
            remapped = report.remapped.len(),
            "discovery committed"
        );

        if let Some(mapping) = &self.mapping {
            if let Err(e) = mapping.on_session_complete(&report).await {
                warn!(port = %id, error = %e, "mapping layer rejected session report");
            }
        }
        Ok(report)
    }

    /// Cancel the session running on a port. Returns false if none was.
    pub fn cancel(&self, port: PortId) -> bool {
        match self.active.get(&port) {
            Some(token) => {
                debug!(port = %port, "cancelling discovery");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Rediscover a port until it commits or the error says to stop
    pub async fn discover_with_retry(&self, port: PortDescriptor) -> Result<SessionReport> {
        let policy = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(self.config.max_elapsed()))
            .build();

        backoff::future::retry(policy, || {
            let port = port.clone();
            async move {
                self.discover(port).await.map_err(|e| match e.action() {
                    ErrorAction::NoRetry => backoff::Error::permanent(e),
                    ErrorAction::RetryAfter(delay) => {
                        debug!(error = %e, ?delay, "discovery will retry");
                        backoff::Error::retry_after(e, delay)
                    }
                    ErrorAction::RetryWithBackoff => {
                        debug!(error = %e, "discovery will retry with backoff");
                        backoff::Error::transient(e)
                    }
                })
            }
        })
        .await
    }

    /// Discover several ports concurrently. Results are in input order.
    pub async fn discover_all(&self, ports: Vec<PortDescriptor>) -> Vec<Result<SessionReport>> {
        futures::future::join_all(ports.into_iter().map(|port| self.discover(port))).await
    }
}

impl std::fmt::Debug for DiscoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryManager")
            .field("config", &self.config)
            .field("quirks", &self.quirks)
            .field("active", &self.active.len())
            .finish()
    }
}
