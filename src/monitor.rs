//! Test monitor: owns the lifecycle of one submitted test.
//!
//! # State Machine
//!
//! ```text
//!            allocated              handler failed
//! PENDING ───────────────► ALLOCATING ───────────► RESTARTING
//!    │                         │  ▲                    │
//!    │ timeout / no resources  │  └──── restarted ─────┘
//!    ▼                         ▼
//!  FAILED ◄──────────────── FINISHED / FAILED
//! ```
//!
//! One monitor exists per test id from admission until the requester has
//! been told the final outcome. It requests resources from the scheduler,
//! starts one [`TestHandler`](handler::TestHandler) per allocated sub-test,
//! counts failures, queues restarts, and tears everything down at the end.
//!
//! # Teardown
//!
//! Before reporting, the monitor stops every handler still running, but
//! never before that handler has executed for the test's minimum execution
//! time. Stopping a device mid-flash is worse than a slow shutdown.

pub mod handler;
pub mod retry;

pub use handler::{HandlerHandle, HandlerReport};
pub use retry::RestartQueue;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::agent::RetryPolicy;
use crate::client::{ClientRegistry, StatusUpdate};
use crate::config::{FarmSettings, LiveConfig};
use crate::environment::EnvironmentCompiler;
use crate::farm::{FarmError, FarmEvent, FarmResult};
use crate::node::NodeId;
use crate::report::StatusSink;
use crate::scheduler::matcher::{self, RequirementGroup};
use crate::scheduler::{self as sched, Assignment, RequestKind, ResourceRequest, SchedulerHandle};
use crate::test_case::{ProductRef, RuntimeId, Target, TestCase, TestStatus};

use handler::{HandlerContext, TestHandler};

/// Why a test failed. Rendered verbatim to the requester.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("unsatisfiable environment requirement: {0}")]
    Unsatisfiable(String),

    #[error("unsupported target '{0}'")]
    UnsupportedTarget(String),

    #[error("no matching resources became available within {0}s")]
    NoResources(u64),

    #[error("test timeout expired")]
    Timeout,

    #[error("failed {failures} times; last failure: {last}")]
    RetriesExhausted {
        failures: usize,
        last: Box<FailureReason>,
    },

    #[error("{runtime_id} failed with {remaining}s left, less than the {required}s minimum execution time: {last}")]
    InsufficientTime {
        runtime_id: String,
        remaining: u64,
        required: u64,
        last: Box<FailureReason>,
    },

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("could not start on node: {0}")]
    StartFailed(String),

    #[error("node {0} disconnected")]
    NodeDisconnected(String),

    #[error("product {product} on node {node} did not reconnect")]
    ProductDisconnected { node: String, product: String },

    #[error("connection to node lost during execution")]
    ConnectionLost,

    #[error("stopped by requester")]
    Stopped,

    #[error("requester {0} is unreachable")]
    ClientGone(String),

    #[error("farm is shutting down")]
    Shutdown,
}

/// Internal lifecycle state of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MonitorState {
    Pending,
    Allocating,
    Restarting,
    Finished,
    Failed,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorState::Pending => "PENDING",
            MonitorState::Allocating => "ALLOCATING",
            MonitorState::Restarting => "RESTARTING",
            MonitorState::Finished => "FINISHED",
            MonitorState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Answer to a check-test request.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub test_id: String,
    pub state: MonitorState,
    pub status: TestStatus,
    pub detail: String,
    pub failures: usize,
    pub active: Vec<String>,
    pub restarting: Vec<String>,
    pub products: Vec<ProductRef>,
    pub elapsed_secs: u64,
}

/// Messages a monitor accepts.
#[derive(Debug)]
pub enum MonitorMessage {
    /// The scheduler reserved resources for the whole test.
    Allocated(Vec<Assignment>),
    /// The scheduler reserved resources for a queued restart.
    Restarted(Assignment),
    /// A handler ended.
    Handler(HandlerReport),
    /// Pending requests are parked by maintenance mode.
    Parked,
    Unparked,
    /// Fail the test now.
    Fail(FailureReason),
    /// The requester asked to stop the test.
    Stop,
    /// A node was deregistered.
    NodeLost(NodeId),
    Update(TestCase, oneshot::Sender<FarmResult<()>>),
    Check(oneshot::Sender<TestReport>),
}

impl MonitorMessage {
    /// Undoes reservations carried by an allocation that will never be
    /// used.
    pub(crate) fn release_reservations(self) {
        match self {
            MonitorMessage::Allocated(assignments) => sched::rollback(&assignments),
            MonitorMessage::Restarted(assignment) => {
                sched::rollback(std::slice::from_ref(&assignment))
            }
            _ => {}
        }
    }
}

/// Cloneable address of a running monitor.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    test_id: String,
    client_id: Option<String>,
    disconnection_timeout_secs: Option<u64>,
    tx: mpsc::UnboundedSender<MonitorMessage>,
}

impl MonitorHandle {
    fn for_test(test: &TestCase, tx: mpsc::UnboundedSender<MonitorMessage>) -> Self {
        Self {
            test_id: test.id.clone(),
            client_id: test.client_id.clone(),
            disconnection_timeout_secs: test.product_disconnection_timeout_secs,
            tx,
        }
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Grace period for this test's disconnected products.
    pub fn disconnection_timeout(&self, settings: &FarmSettings) -> Duration {
        self.disconnection_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| settings.product_disconnection_timeout())
    }

    /// Delivers a message; hands it back if the monitor is gone.
    pub fn send(&self, message: MonitorMessage) -> Result<(), MonitorMessage> {
        self.tx.send(message).map_err(|e| e.0)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn channel(test_id: &str) -> (Self, mpsc::UnboundedReceiver<MonitorMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            test_id: test_id.to_string(),
            client_id: None,
            disconnection_timeout_secs: None,
            tx,
        };
        (handle, rx)
    }
}

/// Live monitors by test id.
#[derive(Debug)]
pub struct MonitorRegistry {
    monitors: Mutex<HashMap<String, MonitorHandle>>,
    /// Number of live monitors, published on every change.
    count: watch::Sender<usize>,
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            monitors: Mutex::new(HashMap::new()),
            count,
        }
    }
}

impl MonitorRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, MonitorHandle>> {
        self.monitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a monitor; `false` if its test id is already taken.
    pub fn insert(&self, handle: MonitorHandle) -> bool {
        let mut monitors = self.lock();
        if monitors.contains_key(&handle.test_id) {
            return false;
        }
        monitors.insert(handle.test_id.clone(), handle);
        self.count.send_replace(monitors.len());
        true
    }

    pub fn remove(&self, test_id: &str) -> Option<MonitorHandle> {
        let mut monitors = self.lock();
        let removed = monitors.remove(test_id);
        self.count.send_replace(monitors.len());
        removed
    }

    /// Resolves once no monitor is left.
    pub async fn drained(&self) {
        let mut count = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = count.wait_for(|n| *n == 0).await;
    }

    pub fn get(&self, test_id: &str) -> Option<MonitorHandle> {
        self.lock().get(test_id).cloned()
    }

    pub fn contains(&self, test_id: &str) -> bool {
        self.lock().contains_key(test_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<MonitorHandle> {
        self.lock().values().cloned().collect()
    }

    /// Monitors of tests submitted by `client_id`.
    pub fn of_client(&self, client_id: &str) -> Vec<MonitorHandle> {
        self.lock()
            .values()
            .filter(|h| h.client_id() == Some(client_id))
            .cloned()
            .collect()
    }
}

/// Shared collaborators of every monitor.
#[derive(Clone)]
pub struct MonitorContext {
    pub settings: LiveConfig,
    pub scheduler: SchedulerHandle,
    pub monitors: Arc<MonitorRegistry>,
    pub clients: Arc<ClientRegistry>,
    pub sink: Arc<dyn StatusSink>,
    pub compiler: Arc<dyn EnvironmentCompiler>,
    pub events: mpsc::UnboundedSender<FarmEvent>,
}

enum Outcome {
    Finished,
    Failed(FailureReason),
}

pub struct TestMonitor {
    test: TestCase,
    state: MonitorState,
    ctx: MonitorContext,
    handle: MonitorHandle,
    rx: mpsc::UnboundedReceiver<MonitorMessage>,
    created: Instant,
    deadline: Instant,
    groups: Vec<RequirementGroup>,
    /// An allocation request is queued at the scheduler.
    outstanding: bool,
    /// Since when the test has been waiting for resources.
    waiting_since: Option<Instant>,
    handlers: HashMap<RuntimeId, HandlerHandle>,
    restarts: RestartQueue,
    used_products: Vec<ProductRef>,
    parked: bool,
}

impl TestMonitor {
    /// Registers and starts a monitor for `test`.
    ///
    /// # Errors
    ///
    /// [`FarmError::DuplicateTest`] if a monitor for the same id exists.
    pub fn spawn(mut test: TestCase, ctx: MonitorContext) -> FarmResult<MonitorHandle> {
        test.sub_id = None;
        test.status = TestStatus::Pending;
        test.status_detail.clear();
        test.reserved_products.clear();

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = MonitorHandle::for_test(&test, tx);
        if !ctx.monitors.insert(handle.clone()) {
            return Err(FarmError::DuplicateTest(test.id));
        }

        let created = Instant::now();
        let deadline = created + test.timeout(&ctx.settings.snapshot());
        let monitor = TestMonitor {
            test,
            state: MonitorState::Pending,
            ctx,
            handle: handle.clone(),
            rx,
            created,
            deadline,
            groups: Vec::new(),
            outstanding: false,
            waiting_since: None,
            handlers: HashMap::new(),
            restarts: RestartQueue::new(),
            used_products: Vec::new(),
            parked: false,
        };
        tokio::spawn(monitor.run());
        Ok(handle)
    }

    async fn run(mut self) {
        info!(test_id = %self.test.id, target = %self.test.target, "Test admitted");
        self.ctx.sink.on_test_admitted(&self.test);

        let outcome = match self.admit() {
            Ok(()) => self.supervise().await,
            Err(reason) => Outcome::Failed(reason),
        };
        self.teardown(outcome).await;
    }

    fn admit(&mut self) -> Result<(), FailureReason> {
        if let Target::Unsupported(name) = &self.test.target {
            return Err(FailureReason::UnsupportedTarget(name.clone()));
        }
        self.groups = matcher::requirement_groups(&self.test, self.ctx.compiler.as_ref())
            .map_err(|e| FailureReason::Unsatisfiable(e.to_string()))?;
        self.request_allocation();
        Ok(())
    }

    fn request_allocation(&mut self) {
        self.outstanding = true;
        self.waiting_since.get_or_insert_with(Instant::now);
        self.ctx.scheduler.submit(ResourceRequest {
            test: self.test.clone(),
            kind: RequestKind::Allocation,
            groups: self.groups.clone(),
            monitor: self.handle.clone(),
            deadline: self.deadline,
        });
    }

    fn is_complete(&self) -> bool {
        self.state != MonitorState::Pending
            && self.handlers.is_empty()
            && self.restarts.is_empty()
            && !self.outstanding
    }

    async fn supervise(&mut self) -> Outcome {
        loop {
            if self.is_complete() {
                return Outcome::Finished;
            }

            let settings = self.ctx.settings.snapshot();
            let now = Instant::now();
            if now >= self.deadline {
                return Outcome::Failed(FailureReason::Timeout);
            }

            let mut wake = self.deadline.min(now + settings.scheduler_interval());
            if let Some(since) = self.waiting_since {
                let limit = since + settings.resource_expectation_timeout();
                if now >= limit {
                    return Outcome::Failed(FailureReason::NoResources(
                        settings.resource_expectation_timeout_secs,
                    ));
                }
                wake = wake.min(limit);
            }

            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => {
                        if let Some(outcome) = self.handle_message(message, &settings) {
                            return outcome;
                        }
                    }
                    None => return Outcome::Failed(FailureReason::Shutdown),
                },
                _ = sleep_until(wake) => {}
            }
        }
    }

    fn handle_message(
        &mut self,
        message: MonitorMessage,
        settings: &FarmSettings,
    ) -> Option<Outcome> {
        match message {
            MonitorMessage::Allocated(assignments) => {
                self.outstanding = false;
                if self.restarts.is_empty() {
                    self.waiting_since = None;
                }
                let first = self.state == MonitorState::Pending;
                if first {
                    self.state = MonitorState::Allocating;
                }
                for assignment in assignments {
                    self.start_handler(assignment, settings);
                }
                if first {
                    self.test.status = TestStatus::Started;
                    self.test.status_detail =
                        format!("{} sub-test(s) allocated", self.handlers.len());
                    self.notify(self.reserved_products());
                }
                None
            }
            MonitorMessage::Restarted(assignment) => {
                let runtime_id = assignment.test.runtime_id();
                self.restarts.take(&runtime_id);
                info!(test_id = %self.test.id, runtime_id = %runtime_id, "Restarting sub-test");
                self.start_handler(assignment, settings);
                if self.restarts.is_empty() {
                    self.state = MonitorState::Allocating;
                    if !self.outstanding {
                        self.waiting_since = None;
                    }
                }
                None
            }
            MonitorMessage::Handler(report) => {
                self.handlers.remove(&report.runtime_id());
                match report {
                    HandlerReport::Finished { products, .. } => {
                        self.used_products.extend(products);
                        None
                    }
                    HandlerReport::Failed { test, reason } => {
                        self.on_handler_failure(test, reason, settings)
                    }
                    HandlerReport::Stopped { .. } => None,
                }
            }
            MonitorMessage::Parked => {
                if !self.parked {
                    self.parked = true;
                    info!(test_id = %self.test.id, "Resource request parked by maintenance mode");
                    self.test.status_detail = "parked: farm is in maintenance mode".to_string();
                    self.notify(Vec::new());
                }
                None
            }
            MonitorMessage::Unparked => {
                self.parked = false;
                None
            }
            MonitorMessage::Fail(reason) => Some(Outcome::Failed(reason)),
            MonitorMessage::Stop => Some(Outcome::Failed(FailureReason::Stopped)),
            MonitorMessage::NodeLost(node) => {
                let mut affected = false;
                for handler in self.handlers.values() {
                    if handler.node().id() == &node {
                        handler.mark_node_lost();
                        affected = true;
                    }
                }
                let pinned = self.test.pinned_node.as_deref() == Some(node.as_str());
                (affected || pinned)
                    .then(|| Outcome::Failed(FailureReason::NodeDisconnected(node.to_string())))
            }
            MonitorMessage::Update(test, reply) => {
                let _ = reply.send(self.apply_update(test, settings));
                None
            }
            MonitorMessage::Check(reply) => {
                let _ = reply.send(self.report());
                None
            }
        }
    }

    fn on_handler_failure(
        &mut self,
        test: TestCase,
        reason: FailureReason,
        settings: &FarmSettings,
    ) -> Option<Outcome> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Some(Outcome::Failed(FailureReason::Timeout));
        }

        let runtime_id = test.runtime_id();
        let failures = self.restarts.record_failure(&runtime_id);
        if self.restarts.exhausted(settings.max_retries) {
            return Some(Outcome::Failed(FailureReason::RetriesExhausted {
                failures,
                last: Box::new(reason),
            }));
        }

        let required = test.min_execution_time(settings);
        if remaining < required {
            return Some(Outcome::Failed(FailureReason::InsufficientTime {
                runtime_id: runtime_id.to_string(),
                remaining: remaining.as_secs(),
                required: required.as_secs(),
                last: Box::new(reason),
            }));
        }

        let mut retry = test;
        retry.reserved_products.clear();
        let groups = match matcher::requirement_groups(&retry, self.ctx.compiler.as_ref()) {
            Ok(groups) => matcher::restart_groups(&groups),
            Err(e) => return Some(Outcome::Failed(FailureReason::Unsatisfiable(e.to_string()))),
        };

        info!(
            test_id = %self.test.id,
            runtime_id = %runtime_id,
            failures,
            sub_test_failures = self.restarts.failures_of(&runtime_id),
            max_retries = settings.max_retries,
            %reason,
            "Queueing sub-test for restart"
        );
        if self.restarts.queue(retry.clone()) {
            self.ctx.scheduler.submit(ResourceRequest {
                test: retry,
                kind: RequestKind::Restart,
                groups,
                monitor: self.handle.clone(),
                deadline: self.deadline,
            });
        }
        self.state = MonitorState::Restarting;
        self.waiting_since.get_or_insert_with(Instant::now);
        None
    }

    fn start_handler(&mut self, assignment: Assignment, settings: &FarmSettings) {
        let ctx = HandlerContext {
            deadline: self.deadline,
            floor: assignment.test.min_execution_time(settings),
            policy: RetryPolicy::from_settings(settings),
            sink: self.ctx.sink.clone(),
            events: self.ctx.events.clone(),
            monitor: self.handle.clone(),
        };
        let handle = TestHandler::spawn(assignment, ctx);
        self.handlers.insert(handle.runtime_id().clone(), handle);
    }

    fn apply_update(&mut self, update: TestCase, settings: &FarmSettings) -> FarmResult<()> {
        if self.state != MonitorState::Pending {
            return Err(FarmError::UpdateRejected {
                test_id: self.test.id.clone(),
                state: self.state,
            });
        }
        if update.id != self.test.id {
            return Err(FarmError::InvalidRequest(format!(
                "update for {} sent to {}",
                update.id, self.test.id
            )));
        }

        let mut test = self.test.clone();
        test.target = update.target;
        test.required_environment = update.required_environment;
        test.packages = update.packages;
        test.files = update.files;
        test.release_mode = update.release_mode;
        test.pinned_node = update.pinned_node;
        if update.timeout_secs.is_some() {
            test.timeout_secs = update.timeout_secs;
        }
        if update.min_execution_secs.is_some() {
            test.min_execution_secs = update.min_execution_secs;
        }
        if let Target::Unsupported(name) = &test.target {
            return Err(FarmError::InvalidRequest(format!("unsupported target '{}'", name)));
        }
        let groups = matcher::requirement_groups(&test, self.ctx.compiler.as_ref())?;

        debug!(test_id = %test.id, groups = groups.len(), "Test updated");
        self.deadline = self.created + test.timeout(settings);
        self.test = test;
        self.groups = groups;
        self.request_allocation();
        Ok(())
    }

    fn report(&self) -> TestReport {
        let mut active: Vec<String> = self.handlers.keys().map(ToString::to_string).collect();
        active.sort();
        TestReport {
            test_id: self.test.id.clone(),
            state: self.state,
            status: self.test.status,
            detail: self.test.status_detail.clone(),
            failures: self.restarts.failures(),
            active,
            restarting: self.restarts.queued_ids(),
            products: self.reserved_products(),
            elapsed_secs: self.created.elapsed().as_secs(),
        }
    }

    /// Products held by the sub-tests running now.
    fn reserved_products(&self) -> Vec<ProductRef> {
        let mut handlers: Vec<&HandlerHandle> = self.handlers.values().collect();
        handlers.sort_by(|a, b| a.runtime_id().to_string().cmp(&b.runtime_id().to_string()));
        handlers
            .into_iter()
            .flat_map(|h| h.products().iter().cloned())
            .collect()
    }

    /// Queues the current status for the requester.
    fn notify(&self, products: Vec<ProductRef>) {
        let update = StatusUpdate {
            test_id: self.test.id.clone(),
            status: self.test.status,
            detail: self.test.status_detail.clone(),
            products,
            at: Utc::now(),
        };
        self.ctx
            .clients
            .notify(self.test.client_id.as_deref(), update);
    }

    async fn teardown(mut self, outcome: Outcome) {
        self.ctx.scheduler.withdraw(&self.test.id);
        self.rx.close();

        let settings = self.ctx.settings.snapshot();
        let handlers: Vec<HandlerHandle> = self.handlers.drain().map(|(_, h)| h).collect();
        if !handlers.is_empty() {
            debug!(test_id = %self.test.id, handlers = handlers.len(), "Stopping remaining sub-tests");
            let floor = self.test.min_execution_time(&settings);
            futures::future::join_all(handlers.into_iter().map(|h| h.stop_after(floor))).await;
        }

        while let Ok(message) = self.rx.try_recv() {
            match message {
                MonitorMessage::Update(_, reply) => {
                    let _ = reply.send(Err(FarmError::UpdateRejected {
                        test_id: self.test.id.clone(),
                        state: self.state,
                    }));
                }
                MonitorMessage::Check(reply) => {
                    let _ = reply.send(self.report());
                }
                other => other.release_reservations(),
            }
        }

        match &outcome {
            Outcome::Finished => {
                self.state = MonitorState::Finished;
                self.test.status = TestStatus::Finished;
                self.test.status_detail = format!(
                    "finished; {} product(s) used",
                    self.used_products.len()
                );
                info!(test_id = %self.test.id, "Test finished");
            }
            Outcome::Failed(reason) => {
                self.state = MonitorState::Failed;
                self.test.status = TestStatus::Failed;
                self.test.status_detail = reason.to_string();
                warn!(test_id = %self.test.id, %reason, "Test failed");
            }
        }

        self.notify(self.used_products.clone());
        self.ctx
            .sink
            .on_test_finished(&self.test.id, self.test.status, &self.test.status_detail);
        self.ctx.monitors.remove(&self.test.id);
    }
}
