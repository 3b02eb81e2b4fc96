//! Test handler: drives one reserved sub-test on one node.
//!
//! ```text
//! spawn ─► start_test ─► wait Started ─► wait Finished ─► release ─► report
//!              │              │                │
//!              └──────────────┴── cancel / deadline ──► stop_test
//! ```
//!
//! Whatever the outcome, the handler gives its slot back to the node and
//! releases its products (unless the test asked for manual release) before
//! reporting to its monitor. A handler never outlives its reservation: the
//! deadline it waits on is the one its reservation was clamped to.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FailureReason, MonitorHandle, MonitorMessage};
use crate::agent::{AgentError, ExecutionEvent, RetryPolicy, with_retries};
use crate::farm::FarmEvent;
use crate::node::Node;
use crate::report::StatusSink;
use crate::scheduler::Assignment;
use crate::test_case::{ProductRef, RuntimeId, TestCase};

/// Terminal outcome of a handler.
#[derive(Debug, Clone)]
pub enum HandlerReport {
    Finished {
        runtime_id: RuntimeId,
        products: Vec<ProductRef>,
    },
    Failed {
        /// The sub-test as it was assigned, for restarting.
        test: TestCase,
        reason: FailureReason,
    },
    /// Cancelled by the monitor.
    Stopped { runtime_id: RuntimeId },
}

impl HandlerReport {
    pub fn runtime_id(&self) -> RuntimeId {
        match self {
            HandlerReport::Finished { runtime_id, .. } | HandlerReport::Stopped { runtime_id } => {
                runtime_id.clone()
            }
            HandlerReport::Failed { test, .. } => test.runtime_id(),
        }
    }
}

/// What a handler needs from its monitor.
#[derive(Clone)]
pub(crate) struct HandlerContext {
    pub deadline: Instant,
    /// Minimum execution time of the sub-test.
    pub floor: Duration,
    pub policy: RetryPolicy,
    pub sink: Arc<dyn StatusSink>,
    pub events: tokio::sync::mpsc::UnboundedSender<FarmEvent>,
    pub monitor: MonitorHandle,
}

/// The monitor's handle on a running handler.
pub struct HandlerHandle {
    runtime_id: RuntimeId,
    node: Arc<Node>,
    products: Vec<ProductRef>,
    started: Instant,
    cancel: CancellationToken,
    node_lost: Arc<AtomicBool>,
    task: JoinHandle<HandlerReport>,
}

impl HandlerHandle {
    pub fn runtime_id(&self) -> &RuntimeId {
        &self.runtime_id
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Products reserved for this sub-test.
    pub fn products(&self) -> &[ProductRef] {
        &self.products
    }

    /// When execution started.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Marks the node as gone; the handler will not talk to it again.
    pub fn mark_node_lost(&self) {
        self.node_lost.store(true, Ordering::SeqCst);
    }

    /// Stops the handler once it has run for at least `floor`.
    ///
    /// A handler that ends on its own first is simply awaited. The floor is
    /// skipped for handlers whose node is gone, since there is nothing left
    /// to protect.
    pub async fn stop_after(mut self, floor: Duration) -> Option<HandlerReport> {
        if !self.node_lost.load(Ordering::SeqCst) {
            tokio::select! {
                result = &mut self.task => return result.ok(),
                _ = sleep_until(self.started + floor) => {}
            }
        }
        self.cancel.cancel();
        self.task.await.ok()
    }
}

enum Execution {
    Finished,
    Failed(FailureReason),
    Stopped,
}

pub(crate) struct TestHandler {
    test: TestCase,
    node: Arc<Node>,
    products: Vec<String>,
    cancel: CancellationToken,
    node_lost: Arc<AtomicBool>,
    ctx: HandlerContext,
}

impl TestHandler {
    pub(crate) fn spawn(assignment: Assignment, ctx: HandlerContext) -> HandlerHandle {
        let runtime_id = assignment.test.runtime_id();
        let cancel = CancellationToken::new();
        let node_lost = Arc::new(AtomicBool::new(false));
        let node = assignment.node.clone();
        let products = assignment.test.reserved_products.clone();

        let handler = TestHandler {
            test: assignment.test,
            node: assignment.node,
            products: assignment.products,
            cancel: cancel.clone(),
            node_lost: node_lost.clone(),
            ctx,
        };

        HandlerHandle {
            runtime_id,
            node,
            products,
            started: Instant::now(),
            cancel,
            node_lost,
            task: tokio::spawn(handler.run()),
        }
    }

    fn node_lost(&self) -> bool {
        self.node_lost.load(Ordering::SeqCst)
    }

    async fn run(self) -> HandlerReport {
        let runtime_id = self.test.runtime_id();
        let started = Instant::now();
        info!(runtime_id = %runtime_id, node = %self.node.id(), products = ?self.products, "Starting sub-test");
        self.ctx.sink.on_node_started(self.node.id(), &runtime_id);
        self.publish_products().await;

        let execution = self.execute().await;

        let freed = self
            .node
            .finish(&runtime_id, &self.products, self.test.release_mode);
        debug!(runtime_id = %runtime_id, ?freed, "Reservation released");
        if !self.node_lost() {
            self.publish_products().await;
        }

        let report = match execution {
            Execution::Finished => {
                if started.elapsed() < self.ctx.floor {
                    debug!(runtime_id = %runtime_id, elapsed = ?started.elapsed(), "Sub-test finished before the minimum execution time");
                }
                info!(runtime_id = %runtime_id, node = %self.node.id(), "Sub-test finished");
                HandlerReport::Finished {
                    runtime_id: runtime_id.clone(),
                    products: self.test.reserved_products.clone(),
                }
            }
            Execution::Failed(reason) => {
                warn!(runtime_id = %runtime_id, node = %self.node.id(), %reason, "Sub-test failed");
                HandlerReport::Failed {
                    test: self.test.clone(),
                    reason,
                }
            }
            Execution::Stopped => {
                info!(runtime_id = %runtime_id, node = %self.node.id(), "Sub-test stopped");
                HandlerReport::Stopped {
                    runtime_id: runtime_id.clone(),
                }
            }
        };

        let failure = match &report {
            HandlerReport::Failed { reason, .. } => Some(reason),
            _ => None,
        };
        self.ctx
            .sink
            .on_node_finished(self.node.id(), &runtime_id, failure);
        let _ = self.ctx.monitor.send(MonitorMessage::Handler(report.clone()));
        report
    }

    async fn execute(&self) -> Execution {
        let agent = self.node.agent().clone();
        let policy = self.ctx.policy;
        let deadline = self.ctx.deadline;

        // A start that got no answer may still have been carried out, so
        // it is stopped rather than sent again.
        let started = tokio::select! {
            _ = self.cancel.cancelled() => return Execution::Stopped,
            _ = sleep_until(deadline) => return Execution::Failed(FailureReason::Timeout),
            result = with_retries(policy.once_on_timeout(), "start_test", || agent.start_test(&self.test)) => result,
        };
        let mut stream = match started {
            Ok(stream) => stream,
            Err(e) => {
                if matches!(e, AgentError::Timeout(_)) {
                    self.stop().await;
                }
                self.report_unreachable(&e);
                return Execution::Failed(FailureReason::StartFailed(e.to_string()));
            }
        };

        let mut acknowledged = false;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.stop().await;
                    return Execution::Stopped;
                }
                _ = sleep_until(deadline) => {
                    self.stop().await;
                    return Execution::Failed(FailureReason::Timeout);
                }
                event = stream.next() => match event {
                    Some(ExecutionEvent::Started) => {
                        if !acknowledged {
                            acknowledged = true;
                            debug!(runtime_id = %self.test.runtime_id(), "Node acknowledged start");
                        }
                    }
                    Some(ExecutionEvent::Finished) => {
                        if !acknowledged {
                            warn!(runtime_id = %self.test.runtime_id(), node = %self.node.id(), "Node finished a sub-test without acknowledging its start");
                        }
                        return Execution::Finished;
                    }
                    Some(ExecutionEvent::Failed(reason)) => {
                        return Execution::Failed(FailureReason::ExecutionFailed(reason));
                    }
                    None => return Execution::Failed(FailureReason::ConnectionLost),
                },
            }
        }
    }

    async fn stop(&self) {
        if self.node_lost() {
            return;
        }
        let agent = self.node.agent().clone();
        let runtime_id = self.test.runtime_id();
        if let Err(e) = with_retries(self.ctx.policy, "stop_test", || agent.stop_test(&runtime_id)).await {
            warn!(runtime_id = %runtime_id, node = %self.node.id(), error = %e, "Failed to stop sub-test");
            self.report_unreachable(&e);
        }
    }

    async fn publish_products(&self) {
        let agent = self.node.agent().clone();
        let views = self.node.product_views();
        if let Err(e) =
            with_retries(self.ctx.policy, "products_changed", || agent.products_changed(&views)).await
        {
            warn!(node = %self.node.id(), error = %e, "Failed to publish product state");
            self.report_unreachable(&e);
        }
    }

    fn report_unreachable(&self, error: &AgentError) {
        if matches!(error, AgentError::Unreachable(_)) {
            let _ = self
                .ctx
                .events
                .send(FarmEvent::NodeUnreachable(self.node.id().clone()));
        }
    }
}
