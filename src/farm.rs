//! The farm: the application context tying every component together.
//!
//! [`TestFarm`] owns the node registry, the monitor registry, the client
//! registry and the scheduler task, and is the single entry point for the
//! inbound request kinds (see [`request`]). Nothing in the crate reaches
//! the farm through a global; collaborators get the handles they need when
//! the farm starts them.
//!
//! # Background tasks
//!
//! | Task | Period | Purpose |
//! |------|--------|---------|
//! | scheduler | `scheduler_interval_secs` | Allocation passes |
//! | status | `status_interval_secs` | [`FarmStatus`] snapshots to the sink |
//! | events | on demand | Cascades for unreachable nodes and requesters |

pub mod request;

pub use request::{FarmRequest, FarmResponse, ProductChange};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::NodeAgent;
use crate::client::{ClientRegistry, Requester};
use crate::config::LiveConfig;
use crate::environment::{EnvironmentCompiler, EnvironmentError};
use crate::inventory::{AttachOutcome, DetachOutcome, ProductInfo};
use crate::monitor::{
    FailureReason, MonitorContext, MonitorMessage, MonitorRegistry, MonitorState, TestMonitor,
    TestReport,
};
use crate::node::{Node, NodeId, NodeRegistry};
use crate::report::{FarmStatus, StatusSink};
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::test_case::TestCase;

/// Result type for farm operations.
pub type FarmResult<T> = Result<T, FarmError>;

/// Errors returned to the sender of a request.
#[derive(Debug, thiserror::Error)]
pub enum FarmError {
    #[error("test {0} is already running")]
    DuplicateTest(String),

    #[error("unknown test {0}")]
    UnknownTest(String),

    #[error("node {0} is already registered")]
    DuplicateNode(String),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("unknown client {0}")]
    UnknownClient(String),

    #[error("test {test_id} cannot be updated in state {state}")]
    UpdateRejected {
        test_id: String,
        state: MonitorState,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error("farm is shutting down")]
    ShuttingDown,
}

/// Events raised by components that need a farm-wide reaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FarmEvent {
    /// A node did not answer within the retry bounds.
    NodeUnreachable(NodeId),
    /// A requester did not accept a status update within the retry bounds.
    ClientUnreachable(String),
}

/// A running test farm. Cheap to clone.
#[derive(Clone)]
pub struct TestFarm {
    settings: LiveConfig,
    registry: Arc<NodeRegistry>,
    monitors: Arc<MonitorRegistry>,
    clients: Arc<ClientRegistry>,
    scheduler: SchedulerHandle,
    sink: Arc<dyn StatusSink>,
    compiler: Arc<dyn EnvironmentCompiler>,
    events: mpsc::UnboundedSender<FarmEvent>,
    shutdown: CancellationToken,
    closing: Arc<AtomicBool>,
}

impl TestFarm {
    /// Starts the scheduler, status and event tasks and returns the farm.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(
        settings: LiveConfig,
        sink: Arc<dyn StatusSink>,
        compiler: Arc<dyn EnvironmentCompiler>,
    ) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(NodeRegistry::new());
        let monitors = Arc::new(MonitorRegistry::default());
        let clients = Arc::new(ClientRegistry::new(settings.clone(), events.clone()));
        let (scheduler, scheduler_handle) = Scheduler::new(
            settings.clone(),
            registry.clone(),
            monitors.clone(),
            sink.clone(),
        );
        let shutdown = CancellationToken::new();

        let farm = Self {
            settings,
            registry,
            monitors,
            clients,
            scheduler: scheduler_handle,
            sink,
            compiler,
            events,
            shutdown: shutdown.clone(),
            closing: Arc::new(AtomicBool::new(false)),
        };

        tokio::spawn(scheduler.run(shutdown.child_token()));
        tokio::spawn(farm.clone().event_loop(events_rx));
        tokio::spawn(farm.clone().status_loop());
        info!("Test farm started");
        farm
    }

    pub fn settings(&self) -> &LiveConfig {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    fn monitor_context(&self) -> MonitorContext {
        MonitorContext {
            settings: self.settings.clone(),
            scheduler: self.scheduler.clone(),
            monitors: self.monitors.clone(),
            clients: self.clients.clone(),
            sink: self.sink.clone(),
            compiler: self.compiler.clone(),
            events: self.events.clone(),
        }
    }

    /// Admits a test; its outcome is reported to its requester.
    pub fn start_test(&self, test: TestCase) -> FarmResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(FarmError::ShuttingDown);
        }
        if test.id.trim().is_empty() {
            return Err(FarmError::InvalidRequest("test id is empty".to_string()));
        }
        TestMonitor::spawn(test, self.monitor_context())?;
        Ok(())
    }

    /// Stops a test. It ends as failed with "stopped by requester".
    pub fn stop_test(&self, test_id: &str) -> FarmResult<()> {
        let monitor = self
            .monitors
            .get(test_id)
            .ok_or_else(|| FarmError::UnknownTest(test_id.to_string()))?;
        monitor
            .send(MonitorMessage::Stop)
            .map_err(|_| FarmError::UnknownTest(test_id.to_string()))
    }

    /// Replaces the requirements of a test still waiting for resources.
    pub async fn update_test(&self, test: TestCase) -> FarmResult<()> {
        let test_id = test.id.clone();
        let monitor = self
            .monitors
            .get(&test_id)
            .ok_or_else(|| FarmError::UnknownTest(test_id.clone()))?;
        let (tx, rx) = oneshot::channel();
        monitor
            .send(MonitorMessage::Update(test, tx))
            .map_err(|_| FarmError::UnknownTest(test_id.clone()))?;
        rx.await.map_err(|_| FarmError::UnknownTest(test_id))?
    }

    pub async fn check_test(&self, test_id: &str) -> FarmResult<TestReport> {
        let monitor = self
            .monitors
            .get(test_id)
            .ok_or_else(|| FarmError::UnknownTest(test_id.to_string()))?;
        let (tx, rx) = oneshot::channel();
        monitor
            .send(MonitorMessage::Check(tx))
            .map_err(|_| FarmError::UnknownTest(test_id.to_string()))?;
        rx.await
            .map_err(|_| FarmError::UnknownTest(test_id.to_string()))
    }

    /// Registers a node under its agent's address.
    pub fn register_node(
        &self,
        agent: Arc<dyn NodeAgent>,
        products: Vec<ProductInfo>,
        maintenance: bool,
    ) -> FarmResult<Arc<Node>> {
        let id = NodeId::new(agent.address());
        if self.registry.get(&id).is_some() {
            return Err(FarmError::DuplicateNode(id.to_string()));
        }
        let node = Arc::new(Node::new(id.clone(), agent, products));
        node.set_maintenance(maintenance);
        self.registry.register(node.clone());
        info!(node = %id, products = node.status().products.len(), maintenance, "Node registered");
        Ok(node)
    }

    /// Removes a node and fails everything bound to it.
    pub fn deregister_node(&self, id: &NodeId) -> FarmResult<()> {
        self.registry
            .deregister(id)
            .ok_or_else(|| FarmError::UnknownNode(id.to_string()))?;
        warn!(node = %id, "Node deregistered");
        self.scheduler.node_removed(id.clone());
        for monitor in self.monitors.handles() {
            let _ = monitor.send(MonitorMessage::NodeLost(id.clone()));
        }
        Ok(())
    }

    pub fn register_client(&self, client_id: impl Into<String>, requester: Arc<dyn Requester>) {
        let client_id = client_id.into();
        debug!(client_id = %client_id, "Client registered");
        self.clients.register(client_id, requester);
    }

    /// Removes a requester and stops the tests it submitted.
    pub fn deregister_client(&self, client_id: &str) -> FarmResult<()> {
        if !self.clients.deregister(client_id) {
            return Err(FarmError::UnknownClient(client_id.to_string()));
        }
        let owned = self.monitors.of_client(client_id);
        info!(client_id, tests = owned.len(), "Client deregistered");
        for monitor in owned {
            let _ = monitor.send(MonitorMessage::Fail(FailureReason::ClientGone(
                client_id.to_string(),
            )));
        }
        Ok(())
    }

    /// Applies products attached to or removed from a node.
    pub fn product_update(&self, change: ProductChange) -> FarmResult<()> {
        let node = self
            .registry
            .get(&change.node)
            .ok_or_else(|| FarmError::UnknownNode(change.node.to_string()))?;

        for info in change.attached {
            let imei = info.imei.clone();
            match node.attach(info) {
                AttachOutcome::New => info!(node = %node.id(), product = %imei, "Product attached"),
                AttachOutcome::Updated => debug!(node = %node.id(), product = %imei, "Product updated"),
                AttachOutcome::Reconnected(from) => {
                    info!(node = %node.id(), product = %imei, ?from, "Product reconnected")
                }
            }
        }
        for imei in change.detached {
            match node.detach(&imei) {
                DetachOutcome::GracePeriod(owner) => warn!(
                    node = %node.id(),
                    product = %imei,
                    runtime_id = %owner,
                    "Reserved product disconnected; grace period started"
                ),
                DetachOutcome::Permanent => info!(node = %node.id(), product = %imei, "Product removed"),
                DetachOutcome::Unknown => debug!(node = %node.id(), product = %imei, "Unknown product removed"),
            }
        }
        Ok(())
    }

    /// Excludes a node from matching, or returns it to service.
    pub fn set_node_maintenance(&self, id: &NodeId, on: bool) -> FarmResult<()> {
        let node = self
            .registry
            .get(id)
            .ok_or_else(|| FarmError::UnknownNode(id.to_string()))?;
        node.set_maintenance(on);
        info!(node = %id, maintenance = on, "Node maintenance changed");
        Ok(())
    }

    /// Suspends or resumes allocation across the whole farm.
    pub fn set_maintenance(&self, on: bool) {
        self.settings.set_maintenance(on);
        info!(maintenance = on, "Farm maintenance changed");
    }

    /// Frees products a manual-release test left reserved. Returns the ids
    /// actually freed.
    pub fn release_products(&self, id: &NodeId, imeis: &[String]) -> FarmResult<Vec<String>> {
        let node = self
            .registry
            .get(id)
            .ok_or_else(|| FarmError::UnknownNode(id.to_string()))?;
        let freed = node.release_manual(imeis);
        info!(node = %id, ?freed, "Manually reserved products released");
        Ok(freed)
    }

    pub async fn status(&self) -> FarmStatus {
        FarmStatus {
            at: Utc::now(),
            maintenance: self.settings.snapshot().maintenance_mode,
            nodes: self.registry.statuses(),
            pending: self.scheduler.pending().await,
            monitors: self.monitors.len(),
        }
    }

    /// Number of tests still being supervised.
    pub fn active_tests(&self) -> usize {
        self.monitors.len()
    }

    /// Fails every running test, waits for their teardown and stops the
    /// background tasks.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(tests = self.monitors.len(), "Shutting down test farm");
        for monitor in self.monitors.handles() {
            let _ = monitor.send(MonitorMessage::Fail(FailureReason::Shutdown));
        }
        self.monitors.drained().await;
        self.shutdown.cancel();
    }

    async fn event_loop(self, mut rx: mpsc::UnboundedReceiver<FarmEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                FarmEvent::NodeUnreachable(id) => {
                    if self.deregister_node(&id).is_ok() {
                        warn!(node = %id, "Node unreachable; deregistered");
                    }
                }
                FarmEvent::ClientUnreachable(client_id) => {
                    if self.deregister_client(&client_id).is_ok() {
                        warn!(client_id = %client_id, "Client unreachable; deregistered");
                    }
                }
            }
        }
    }

    async fn status_loop(self) {
        let mut period = self.settings.snapshot().status_interval();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let status = self.status().await;
                    self.sink.on_status(&status);
                    let configured = self.settings.snapshot().status_interval();
                    if configured != period {
                        period = configured;
                        ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
