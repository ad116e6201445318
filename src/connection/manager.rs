//! Connection Manager Implementation
//!
//! Multiplexes logical connections onto one physical connection per server
//! endpoint. The registry (both connection arenas) sits behind a single lock
//! that is never held across network I/O: connects, socket shutdowns and
//! reads/writes all run after it has been released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::error::{ConnError, ConnResult};
use super::gc::GarbageCollector;
use super::logical::{LogicalConnection, UnsolicitedHandler};
use super::physical::{ConnectionState, PhysicalConnection, PhysicalSettings, UnsolicitedSink};
use super::registry::{ConnectionRegistry, LogicalId, PhysicalId};
use super::{lock, Endpoint, ServerRole};
use crate::config::{Config, ReadMode};
use crate::metrics::{ManagerMetrics, MetricsSnapshot};
use crate::protocol::{Message, StreamId};
use crate::shutdown::ShutdownCoordinator;
use crate::Result;

/// State shared by the manager handle, the garbage collector and the
/// inbound readers
pub(super) struct ManagerInner {
    config: Arc<Config>,
    settings: PhysicalSettings,
    registry: Mutex<ConnectionRegistry>,
    metrics: ManagerMetrics,
    shutdown: ShutdownCoordinator,
    shutting_down: AtomicBool,
    self_ref: Weak<ManagerInner>,
}

/// Registry of logical and physical connections
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
    gc: Mutex<Option<GarbageCollector>>,
}

/// Occupancy of the registry
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub physical_connections: usize,
    pub physical_slots: usize,
    pub logical_connections: usize,
    pub logical_slots: usize,
    pub physical: Vec<PhysicalStats>,
}

/// Per physical connection view
#[derive(Debug, Clone, Serialize)]
pub struct PhysicalStats {
    pub id: u64,
    pub endpoint: Endpoint,
    pub connected: bool,
    pub ref_count: usize,
    pub idle_ms: u64,
    pub ttl_ms: u64,
}

impl ConnectionManager {
    /// Create a manager. Starts the background garbage collector unless it
    /// is disabled in the configuration, so this must run inside a Tokio
    /// runtime.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let metrics = ManagerMetrics::new()?;
        let settings = PhysicalSettings::from(&config.manager);
        let registry = ConnectionRegistry::new(config.manager.max_logical_connections);

        let inner = Arc::new_cyclic(|self_ref| ManagerInner {
            config: Arc::clone(&config),
            settings,
            registry: Mutex::new(registry),
            metrics,
            shutdown: ShutdownCoordinator::new(),
            shutting_down: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });

        let gc = if config.gc.enabled {
            Some(GarbageCollector::spawn(
                Arc::downgrade(&inner),
                config.gc.interval,
                inner.shutdown.subscribe(),
            ))
        } else {
            info!("Explicitly requested not to start the garbage collector");
            None
        };

        Ok(Self {
            inner,
            gc: Mutex::new(gc),
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    /// Connect to a data server with no unsolicited-message handler
    pub async fn connect(&self, endpoint: &Endpoint) -> ConnResult<LogicalId> {
        self.connect_as(endpoint, ServerRole::DataServer, None).await
    }

    /// Open a logical connection to `endpoint`, reusing the live physical
    /// connection to it when there is one.
    #[instrument(skip_all, fields(endpoint = %endpoint, ?role))]
    pub async fn connect_as(
        &self,
        endpoint: &Endpoint,
        role: ServerRole,
        handler: Option<UnsolicitedHandler>,
    ) -> ConnResult<LogicalId> {
        {
            let mut registry = lock(&self.inner.registry);
            self.inner.ensure_running()?;
            if let Some(id) = self.inner.bind_existing(&mut registry, endpoint, handler.clone())? {
                debug!(logical = %id, "Reused existing physical connection");
                return Ok(id);
            }
        }

        debug!("Physical connection not found. Creating a new one...");

        // The registry lock is released while the network connect runs
        let phys = Arc::new(PhysicalConnection::new(
            endpoint.clone(),
            self.inner.ttl_for(role),
            self.inner.settings.clone(),
        ));
        if let Err(e) = phys.connect().await {
            self.inner.metrics.connect_failed();
            warn!(kind = e.error_kind(), "Failed to connect to {}: {}", endpoint, e);
            return Err(e);
        }

        let outcome = {
            let mut registry = lock(&self.inner.registry);
            // Shutdown may have started while the socket was connecting
            let bound = self
                .inner
                .ensure_running()
                .and_then(|()| self.inner.bind_existing(&mut registry, endpoint, handler.clone()));
            match bound {
                // Lost the race against a concurrent connect to the same endpoint
                Ok(Some(id)) => Ok((id, false)),
                Ok(None) => self
                    .inner
                    .adopt_physical(&mut registry, &phys, handler)
                    .map(|id| (id, true)),
                Err(e) => Err(e),
            }
        };

        match outcome {
            Ok((id, true)) => {
                self.inner.metrics.physical_connected();
                Ok(id)
            }
            Ok((id, false)) => {
                debug!(logical = %id, "Discarding duplicate physical connection");
                phys.disconnect().await;
                Ok(id)
            }
            Err(e) => {
                phys.disconnect().await;
                Err(e)
            }
        }
    }

    /// Close a logical connection. With `force_physical` the underlying
    /// socket is shut down at once; the physical connection object itself is
    /// reclaimed by the next garbage collection once nothing references it.
    #[instrument(skip(self, id), fields(logical = %id))]
    pub async fn disconnect(&self, id: LogicalId, force_physical: bool) -> ConnResult<()> {
        let forced = {
            let mut registry = lock(&self.inner.registry);

            let Some(logical) = registry.logical.remove(id) else {
                warn!("Destroying nonexistent logical connection {}", id);
                return Err(ConnError::InvalidHandle(id));
            };

            let phys = registry.physical.get(logical.physical_id()).cloned();
            if let Some(phys) = &phys {
                if force_physical {
                    phys.set_ttl(Duration::ZERO);
                    phys.invalidate();
                }
                phys.unbind_stream(logical.stream_id());
                phys.touch();
            }

            self.inner.refresh_gauges(&registry);
            debug!(
                physical = %logical.physical_id(),
                remaining_streams = phys.as_ref().map_or(0, |phys| phys.bound_streams()),
                "Logical connection closed"
            );

            if force_physical {
                phys
            } else {
                None
            }
        };

        if let Some(phys) = forced {
            info!(endpoint = %phys.endpoint(), "Forcing physical disconnection");
            phys.disconnect().await;
        }

        Ok(())
    }

    /// Read raw bytes from the socket behind `id`
    pub async fn read_raw(&self, id: LogicalId, buf: &mut [u8]) -> ConnResult<usize> {
        let logical = self.inner.logical(id)?;
        logical.read_raw(buf).await
    }

    /// Write raw bytes to the socket behind `id`
    pub async fn write_raw(&self, id: LogicalId, buf: &[u8]) -> ConnResult<usize> {
        let logical = self.inner.logical(id)?;
        logical.write_raw(buf).await
    }

    /// Get the next message for `id`.
    ///
    /// In sync read mode the message is built straight from the socket and a
    /// stall is an error. In async read mode it comes from the session's
    /// queue, and `Ok(None)` means nothing arrived within the request timeout.
    /// The first async read on a physical connection starts its inbound
    /// reader; from then on raw reads on that connection are refused.
    pub async fn read_message(&self, id: LogicalId) -> ConnResult<Option<Message>> {
        let logical = self.inner.logical(id)?;
        let phys = logical.physical()?;

        match self.inner.settings.read_mode {
            ReadMode::Sync => phys
                .read_message_direct(logical.physical_id(), &*self.inner)
                .await
                .map(Some),
            ReadMode::Async => {
                phys.start_inbound(logical.physical_id(), self.inner.sink()).await;
                phys.read_queued(logical.stream_id()).await
            }
        }
    }

    /// Reclaim physical connections with no bound logical connections whose
    /// TTL has elapsed. Returns the number reclaimed.
    pub async fn garbage_collect(&self) -> usize {
        self.inner.garbage_collect(false).await
    }

    /// Deliver `message` to every logical connection bound to `source`
    pub fn process_unsolicited_message(&self, source: PhysicalId, message: &Message) -> usize {
        self.inner.process_unsolicited_message(source, message)
    }

    /// Number of logical connections bound to `physical`
    pub fn ref_count(&self, physical: PhysicalId) -> usize {
        lock(&self.inner.registry).ref_count(physical)
    }

    /// The physical connection `id` is bound to
    pub fn physical_for(&self, id: LogicalId) -> ConnResult<PhysicalId> {
        Ok(self.inner.logical(id)?.physical_id())
    }

    /// The stream id requests for `id` must carry
    pub fn stream_id(&self, id: LogicalId) -> ConnResult<StreamId> {
        Ok(self.inner.logical(id)?.stream_id())
    }

    pub fn is_valid(&self, id: LogicalId) -> bool {
        lock(&self.inner.registry).logical.contains(id)
    }

    /// State of a physical connection still held by the registry
    pub fn physical_state(&self, physical: PhysicalId) -> Option<ConnectionState> {
        lock(&self.inner.registry)
            .physical
            .get(physical)
            .map(|phys| phys.state())
    }

    pub fn physical_ttl(&self, physical: PhysicalId) -> Option<Duration> {
        lock(&self.inner.registry)
            .physical
            .get(physical)
            .map(|phys| phys.ttl())
    }

    pub fn physical_count(&self) -> usize {
        lock(&self.inner.registry).physical.len()
    }

    pub fn logical_count(&self) -> usize {
        lock(&self.inner.registry).logical.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let registry = lock(&self.inner.registry);

        let physical = registry
            .physical
            .iter()
            .map(|(id, phys)| PhysicalStats {
                id: id.as_raw(),
                endpoint: phys.endpoint().clone(),
                connected: phys.is_valid(),
                ref_count: registry.ref_count(id),
                idle_ms: phys.idle_for().as_millis() as u64,
                ttl_ms: phys.ttl().as_millis() as u64,
            })
            .collect();

        RegistryStats {
            physical_connections: registry.physical.len(),
            physical_slots: registry.physical.slot_count(),
            logical_connections: registry.logical.len(),
            logical_slots: registry.logical.slot_count(),
            physical,
        }
    }

    pub fn metrics(&self) -> &ManagerMetrics {
        &self.inner.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Close every logical connection, stop the garbage collector and purge
    /// every physical connection. Calling it again does nothing.
    pub async fn shutdown(&self) {
        {
            // Flipped under the registry lock: a connect either registered
            // its session before this point or sees the flag and backs out
            let _registry = lock(&self.inner.registry);
            if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        info!("Shutting down connection manager");

        let ids = lock(&self.inner.registry).logical.ids();
        for id in ids {
            // A concurrent disconnect may have got there first
            let _ = self.disconnect(id, false).await;
        }

        self.inner.shutdown.trigger();
        let gc = lock(&self.gc).take();
        if let Some(gc) = gc {
            gc.join().await;
        }

        let purged = self.inner.garbage_collect(true).await;
        info!(purged, "Connection manager shut down");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if !self.inner.shutting_down.load(Ordering::SeqCst) {
            warn!("Connection manager dropped without shutdown, closing sockets on drop");
        }
        // Stops the garbage collector; sockets close when the registry drops
        self.inner.shutdown.trigger();
    }
}

impl ManagerInner {
    /// Checked with the registry lock held
    fn ensure_running(&self) -> ConnResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ConnError::ShuttingDown);
        }
        Ok(())
    }

    fn ttl_for(&self, role: ServerRole) -> Duration {
        match role {
            ServerRole::Redirector => self.config.ttl.redirector,
            ServerRole::DataServer => self.config.ttl.data_server,
        }
    }

    fn sink(&self) -> Weak<dyn UnsolicitedSink> {
        self.self_ref.clone()
    }

    fn refresh_gauges(&self, registry: &ConnectionRegistry) {
        self.metrics.set_open(registry.physical.len(), registry.logical.len());
    }

    /// Resolve a logical id, for the duration of one operation
    fn logical(&self, id: LogicalId) -> ConnResult<LogicalConnection> {
        match lock(&self.registry).logical.get(id) {
            Some(logical) => Ok(logical.clone()),
            None => {
                debug!("There is no logical connection with id {}", id);
                Err(ConnError::InvalidHandle(id))
            }
        }
    }

    /// Bind a new logical connection to an existing physical connection
    fn bind_logical(
        &self,
        registry: &mut ConnectionRegistry,
        physical_id: PhysicalId,
        phys: &Arc<PhysicalConnection>,
        handler: Option<UnsolicitedHandler>,
    ) -> ConnResult<LogicalId> {
        let stream_id = phys.bind_stream()?;
        let inserted = registry
            .logical
            .insert_with(|id| LogicalConnection::new(id, physical_id, phys, stream_id, handler));

        match inserted {
            Ok(id) => {
                phys.touch();
                self.refresh_gauges(registry);
                debug!(
                    logical = %id,
                    physical = %physical_id,
                    stream = %stream_id,
                    logical_slots = registry.logical.slot_count(),
                    logical_count = registry.logical.len(),
                    physical_slots = registry.physical.slot_count(),
                    physical_count = registry.physical.len(),
                    "Bound logical connection"
                );
                Ok(id)
            }
            Err(e) => {
                phys.unbind_stream(stream_id);
                Err(e)
            }
        }
    }

    /// Bind to the live physical connection serving `endpoint`, if any
    fn bind_existing(
        &self,
        registry: &mut ConnectionRegistry,
        endpoint: &Endpoint,
        handler: Option<UnsolicitedHandler>,
    ) -> ConnResult<Option<LogicalId>> {
        let Some((physical_id, phys)) = registry
            .find_physical(endpoint)
            .map(|(id, phys)| (id, Arc::clone(phys)))
        else {
            return Ok(None);
        };

        phys.touch();
        self.bind_logical(registry, physical_id, &phys, handler).map(Some)
    }

    /// Register a freshly connected physical connection and bind a logical
    /// connection to it. On failure the registry is left as it was.
    fn adopt_physical(
        &self,
        registry: &mut ConnectionRegistry,
        phys: &Arc<PhysicalConnection>,
        handler: Option<UnsolicitedHandler>,
    ) -> ConnResult<LogicalId> {
        let physical_id = registry.physical.insert(Arc::clone(phys))?;

        match self.bind_logical(registry, physical_id, phys, handler) {
            Ok(id) => {
                info!(
                    physical = %physical_id,
                    endpoint = %phys.endpoint(),
                    "New physical connection successfully created"
                );
                Ok(id)
            }
            Err(e) => {
                registry.physical.remove(physical_id);
                self.refresh_gauges(registry);
                Err(e)
            }
        }
    }

    /// One sweep. With `force` the TTL is ignored, which is only used at
    /// shutdown once every logical connection is gone.
    pub(super) async fn garbage_collect(&self, force: bool) -> usize {
        let purged: Vec<(PhysicalId, Arc<PhysicalConnection>)> = {
            let mut registry = lock(&self.registry);

            let candidates: Vec<PhysicalId> = registry
                .physical
                .iter()
                .filter(|(id, phys)| registry.ref_count(*id) == 0 && (force || phys.expired_ttl()))
                .map(|(id, _)| id)
                .collect();

            let purged = candidates
                .into_iter()
                .filter_map(|id| {
                    debug!(physical = %id, "Purging physical connection");
                    registry.physical.remove(id).map(|phys| (id, phys))
                })
                .collect();

            self.refresh_gauges(&registry);
            purged
        };

        if purged.is_empty() {
            return 0;
        }

        for (id, phys) in &purged {
            phys.disconnect().await;
            debug!(physical = %id, endpoint = %phys.endpoint(), "Purged physical connection");
        }

        self.metrics.physical_purged(purged.len());
        purged.len()
    }
}

impl UnsolicitedSink for ManagerInner {
    /// Handlers are collected under the registry lock and invoked after it
    /// is released, so a handler may call back into the manager. A session
    /// disconnected between the two steps still receives this one message.
    fn process_unsolicited_message(&self, source: PhysicalId, message: &Message) -> usize {
        debug!(physical = %source, stream = %message.stream_id(), "Processing unsolicited response");
        self.metrics.unsolicited_message();

        let recipients: Vec<LogicalConnection> = lock(&self.registry)
            .logical
            .iter()
            .filter(|(_, logical)| logical.physical_id() == source && logical.has_handler())
            .map(|(_, logical)| logical.clone())
            .collect();

        for logical in &recipients {
            debug!(logical = %logical.id(), "Delivering unsolicited message");
            logical.process_unsolicited_message(message);
        }
        recipients.len()
    }

    fn record_protocol_error(&self, _source: PhysicalId) {
        self.metrics.protocol_error();
    }
}
