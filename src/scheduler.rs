//! The scheduler loop.
//!
//! A single task owns every pending resource request and is the only code
//! path that matches, splits and reserves. Monitors submit requests through
//! a [`SchedulerHandle`]; on every tick the [`Scheduler`] runs one
//! allocation pass:
//!
//! 1. Sweep disconnected products whose grace period elapsed and
//!    reservations that expired without an owner.
//! 2. Park or unpark requests according to the global maintenance flag.
//! 3. Try each pending request in arrival order: match, split, reserve,
//!    and hand the assignments to the owning monitor.
//!
//! Reservations made for a request are undone as a unit when any of them
//! fails or the monitor is gone, so a pass never leaves partial allocations
//! behind.

pub mod matcher;
pub mod splitter;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FarmSettings, LiveConfig};
use crate::inventory::ReservationWindow;
use crate::monitor::{FailureReason, MonitorHandle, MonitorMessage, MonitorRegistry};
use crate::node::{NodeId, NodeRegistry};
use crate::report::StatusSink;
use crate::test_case::{RuntimeId, Target, TestCase};

pub use matcher::{GroupMatch, ProductSet, RequirementGroup};
pub use splitter::Assignment;

/// What a pending request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// First allocation of a whole test; the result is split.
    Allocation,
    /// Re-run of a single failed sub-test.
    Restart,
}

/// A request for resources, owned by the scheduler until fulfilled.
#[derive(Debug)]
pub struct ResourceRequest {
    pub test: TestCase,
    pub kind: RequestKind,
    pub groups: Vec<RequirementGroup>,
    pub monitor: MonitorHandle,
    /// The test's absolute deadline.
    pub deadline: Instant,
}

impl ResourceRequest {
    pub fn runtime_id(&self) -> RuntimeId {
        self.test.runtime_id()
    }
}

/// A pending request as reported in status snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingView {
    pub runtime_id: String,
    pub kind: RequestKind,
    pub parked: bool,
}

#[derive(Debug)]
enum SchedulerCommand {
    Submit(Box<ResourceRequest>),
    Withdraw(String),
    NodeRemoved(NodeId),
    Pending(oneshot::Sender<Vec<PendingView>>),
}

/// Cloneable sender side of the scheduler's inbox.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Queues a request for the next pass.
    pub fn submit(&self, request: ResourceRequest) {
        let _ = self.tx.send(SchedulerCommand::Submit(Box::new(request)));
    }

    /// Drops every pending request of a test.
    pub fn withdraw(&self, test_id: &str) {
        let _ = self.tx.send(SchedulerCommand::Withdraw(test_id.to_string()));
    }

    /// Fails pending requests pinned to a removed node.
    pub fn node_removed(&self, node: NodeId) {
        let _ = self.tx.send(SchedulerCommand::NodeRemoved(node));
    }

    /// Current pending requests; empty once the scheduler stopped.
    pub async fn pending(&self) -> Vec<PendingView> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(SchedulerCommand::Pending(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

struct PendingRequest {
    request: ResourceRequest,
    parked: bool,
}

enum Attempt {
    Allocated,
    Waiting,
    Dropped,
}

pub struct Scheduler {
    settings: LiveConfig,
    registry: Arc<NodeRegistry>,
    monitors: Arc<MonitorRegistry>,
    sink: Arc<dyn StatusSink>,
    pending: Vec<PendingRequest>,
    rx: mpsc::UnboundedReceiver<SchedulerCommand>,
}

impl Scheduler {
    pub fn new(
        settings: LiveConfig,
        registry: Arc<NodeRegistry>,
        monitors: Arc<MonitorRegistry>,
        sink: Arc<dyn StatusSink>,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            settings,
            registry,
            monitors,
            sink,
            pending: Vec::new(),
            rx,
        };
        (scheduler, SchedulerHandle { tx })
    }

    /// Runs passes every `scheduler_interval_secs` until `shutdown` fires.
    ///
    /// The first pass runs immediately. A changed interval takes effect
    /// after the current tick.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut period = self.settings.snapshot().scheduler_interval();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = ticker.tick() => {
                    self.pass();
                    let configured = self.settings.snapshot().scheduler_interval();
                    if configured != period {
                        debug!(?configured, "Scheduler interval changed");
                        period = configured;
                        ticker = tokio::time::interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
            }
        }
        debug!(pending = self.pending.len(), "Scheduler stopped");
    }

    fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Submit(request) => {
                let runtime_id = request.runtime_id();
                self.pending
                    .retain(|p| p.request.runtime_id() != runtime_id);
                debug!(runtime_id = %runtime_id, kind = ?request.kind, "Resource request queued");
                self.sink.on_allocation_requested(&runtime_id);
                self.pending.push(PendingRequest {
                    request: *request,
                    parked: false,
                });
            }
            SchedulerCommand::Withdraw(test_id) => {
                self.pending.retain(|p| p.request.test.id != test_id);
            }
            SchedulerCommand::NodeRemoved(node) => {
                self.pending.retain(|p| {
                    let pinned = p.request.test.pinned_node.as_deref() == Some(node.as_str());
                    if pinned {
                        let _ = p.request.monitor.send(MonitorMessage::Fail(
                            FailureReason::NodeDisconnected(node.to_string()),
                        ));
                    }
                    !pinned
                });
            }
            SchedulerCommand::Pending(reply) => {
                let _ = reply.send(self.pending_views());
            }
        }
    }

    fn pending_views(&self) -> Vec<PendingView> {
        self.pending
            .iter()
            .map(|p| PendingView {
                runtime_id: p.request.runtime_id().to_string(),
                kind: p.request.kind,
                parked: p.parked,
            })
            .collect()
    }

    /// Runs one allocation pass.
    pub(crate) fn pass(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            self.handle_command(command);
        }

        let settings = self.settings.snapshot();
        let now = Instant::now();
        self.sweep_disconnections(&settings, now);
        self.sweep_expired(now);

        if self.update_parking(settings.maintenance_mode) {
            return;
        }

        let mut i = 0;
        while i < self.pending.len() {
            match self.attempt(&self.pending[i].request, &settings) {
                Attempt::Allocated | Attempt::Dropped => {
                    self.pending.remove(i);
                }
                Attempt::Waiting => i += 1,
            }
        }
    }

    /// Fails owners of products whose grace period elapsed.
    ///
    /// A disconnected product whose owning test has no monitor is left
    /// reserved and reported once, since nothing can tell whether its
    /// owner will come back for it.
    fn sweep_disconnections(&self, settings: &FarmSettings, now: Instant) {
        for (node, _) in self.registry.by_load() {
            for entry in node.grace_entries() {
                match self.monitors.get(entry.owner.test_id()) {
                    Some(monitor) => {
                        let grace = monitor.disconnection_timeout(settings);
                        if now < entry.disconnected_at + grace {
                            continue;
                        }
                        warn!(
                            node = %node.id(),
                            product = %entry.imei,
                            runtime_id = %entry.owner,
                            "Product did not reconnect within {:?}", grace
                        );
                        node.make_permanent(&entry.imei);
                        let _ = monitor.send(MonitorMessage::Fail(
                            FailureReason::ProductDisconnected {
                                node: node.id().to_string(),
                                product: entry.imei.clone(),
                            },
                        ));
                    }
                    None => {
                        if node.take_orphan_report(&entry.imei) {
                            warn!(
                                node = %node.id(),
                                product = %entry.imei,
                                runtime_id = %entry.owner,
                                "Disconnected product has no live owner; not freeing it automatically"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Frees expired reservations whose owning test is gone.
    fn sweep_expired(&self, now: Instant) {
        for (node, _) in self.registry.by_load() {
            for (owner, imei) in node.expired_reservations(now) {
                if self.monitors.contains(owner.test_id()) {
                    continue;
                }
                let freed = node.free_orphaned(&owner, std::slice::from_ref(&imei));
                if !freed.is_empty() {
                    info!(node = %node.id(), product = %imei, runtime_id = %owner, "Expired reservation freed");
                }
            }
        }
    }

    /// Parks every request while in maintenance; returns whether it is.
    fn update_parking(&mut self, maintenance: bool) -> bool {
        for pending in &mut self.pending {
            if pending.parked != maintenance {
                pending.parked = maintenance;
                let message = if maintenance {
                    MonitorMessage::Parked
                } else {
                    MonitorMessage::Unparked
                };
                let _ = pending.request.monitor.send(message);
            }
        }
        maintenance
    }

    fn attempt(&self, request: &ResourceRequest, settings: &FarmSettings) -> Attempt {
        if request.monitor.is_closed() {
            return Attempt::Dropped;
        }

        let now = Instant::now();
        let remaining = request.deadline.saturating_duration_since(now);
        if remaining.is_zero() {
            return Attempt::Waiting;
        }

        let max = settings.max_tests_per_node;
        let pinned = request.test.pinned_node.as_deref();
        let matches = match &request.test.target {
            Target::Flash => matcher::match_flash(&self.registry, &request.groups, max, pinned),
            Target::Nose => matcher::match_nose(&self.registry, max, pinned),
            Target::Unsupported(name) => {
                let _ = request.monitor.send(MonitorMessage::Fail(
                    FailureReason::UnsupportedTarget(name.clone()),
                ));
                return Attempt::Dropped;
            }
        };
        let Some(matches) = matches else {
            return Attempt::Waiting;
        };

        let assignments = match (request.kind, &request.test.target) {
            (RequestKind::Allocation, Target::Flash) => splitter::split(&request.test, matches),
            _ => splitter::rebind(&request.test, matches).into_iter().collect(),
        };
        if assignments.is_empty() {
            return Attempt::Waiting;
        }

        let timeout = request.test.timeout(settings);
        let window = ReservationWindow {
            requested: timeout,
            test_timeout: timeout,
            remaining,
        };
        for (i, assignment) in assignments.iter().enumerate() {
            let runtime_id = assignment.test.runtime_id();
            if let Err(e) = assignment
                .node
                .reserve_for(&runtime_id, &assignment.products, window, max)
            {
                debug!(
                    runtime_id = %runtime_id,
                    node = %assignment.node.id(),
                    error = %e,
                    "Reservation failed; rolling back this attempt"
                );
                rollback(&assignments[..i]);
                return Attempt::Waiting;
            }
        }

        for assignment in &assignments {
            info!(
                runtime_id = %assignment.test.runtime_id(),
                node = %assignment.node.id(),
                products = ?assignment.products,
                "Resources reserved"
            );
        }
        self.sink
            .on_allocation_finished(&request.test.id, &assignments);

        let message = match request.kind {
            RequestKind::Allocation => MonitorMessage::Allocated(assignments),
            RequestKind::Restart => match assignments.into_iter().next() {
                Some(assignment) => MonitorMessage::Restarted(assignment),
                None => return Attempt::Waiting,
            },
        };
        if let Err(message) = request.monitor.send(message) {
            warn!(test_id = %request.test.id, "Monitor gone before allocation was delivered");
            message.release_reservations();
            return Attempt::Dropped;
        }
        Attempt::Allocated
    }
}

/// Undoes the reservations of assignments that will never run.
pub(crate) fn rollback(assignments: &[Assignment]) {
    for assignment in assignments {
        assignment
            .node
            .cancel_reservation(&assignment.test.runtime_id(), &assignment.products);
    }
}
