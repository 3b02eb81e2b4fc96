//! Lifecycle events, status snapshots and console output.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::monitor::FailureReason;
use crate::node::{NodeId, NodeStatus};
use crate::scheduler::{Assignment, PendingView};
use crate::test_case::{RuntimeId, TestCase, TestStatus};

/// A status sink receives lifecycle events from the farm.
///
/// Events are one-way: a sink cannot influence scheduling, and a slow or
/// failing sink must not hold up the caller. Every method has a no-op
/// default so implementations only override what they record.
pub trait StatusSink: Send + Sync {
    /// A test was admitted and its monitor created.
    fn on_test_admitted(&self, _test: &TestCase) {}

    /// A resource request entered the scheduler.
    fn on_allocation_requested(&self, _runtime_id: &RuntimeId) {}

    /// Resources were reserved for a test.
    fn on_allocation_finished(&self, _test_id: &str, _assignments: &[Assignment]) {}

    /// A sub-test is being started on a node.
    fn on_node_started(&self, _node: &NodeId, _runtime_id: &RuntimeId) {}

    /// A sub-test ended on a node; `failure` is set when it failed.
    fn on_node_finished(
        &self,
        _node: &NodeId,
        _runtime_id: &RuntimeId,
        _failure: Option<&FailureReason>,
    ) {
    }

    /// The requester was told the final outcome of a test.
    fn on_test_finished(&self, _test_id: &str, _status: TestStatus, _detail: &str) {}

    /// Periodic snapshot of the whole farm.
    fn on_status(&self, _status: &FarmStatus) {}
}

/// A sink that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl StatusSink for NullSink {}

/// Renders lifecycle events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn on_allocation_finished(&self, test_id: &str, assignments: &[Assignment]) {
        let products: usize = assignments.iter().map(|a| a.products.len()).sum();
        debug!(
            test_id,
            sub_tests = assignments.len(),
            products,
            "Allocation finished"
        );
    }

    fn on_node_finished(
        &self,
        node: &NodeId,
        runtime_id: &RuntimeId,
        failure: Option<&FailureReason>,
    ) {
        match failure {
            Some(reason) => debug!(%node, %runtime_id, %reason, "Node run failed"),
            None => debug!(%node, %runtime_id, "Node run finished"),
        }
    }

    fn on_test_finished(&self, test_id: &str, status: TestStatus, detail: &str) {
        if status == TestStatus::Failed {
            warn!(test_id, %status, detail, "Test outcome");
        } else {
            info!(test_id, %status, detail, "Test outcome");
        }
    }

    fn on_status(&self, status: &FarmStatus) {
        let busy: usize = status
            .nodes
            .iter()
            .flat_map(|n| &n.products)
            .filter(|p| p.owner.is_some())
            .count();
        debug!(
            nodes = status.nodes.len(),
            busy_products = busy,
            pending = status.pending.len(),
            monitors = status.monitors,
            maintenance = status.maintenance,
            "Farm status"
        );
    }
}

/// A sink that forwards every event to several sinks.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn StatusSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl StatusSink for MultiSink {
    fn on_test_admitted(&self, test: &TestCase) {
        for sink in &self.sinks {
            sink.on_test_admitted(test);
        }
    }

    fn on_allocation_requested(&self, runtime_id: &RuntimeId) {
        for sink in &self.sinks {
            sink.on_allocation_requested(runtime_id);
        }
    }

    fn on_allocation_finished(&self, test_id: &str, assignments: &[Assignment]) {
        for sink in &self.sinks {
            sink.on_allocation_finished(test_id, assignments);
        }
    }

    fn on_node_started(&self, node: &NodeId, runtime_id: &RuntimeId) {
        for sink in &self.sinks {
            sink.on_node_started(node, runtime_id);
        }
    }

    fn on_node_finished(
        &self,
        node: &NodeId,
        runtime_id: &RuntimeId,
        failure: Option<&FailureReason>,
    ) {
        for sink in &self.sinks {
            sink.on_node_finished(node, runtime_id, failure);
        }
    }

    fn on_test_finished(&self, test_id: &str, status: TestStatus, detail: &str) {
        for sink in &self.sinks {
            sink.on_test_finished(test_id, status, detail);
        }
    }

    fn on_status(&self, status: &FarmStatus) {
        for sink in &self.sinks {
            sink.on_status(status);
        }
    }
}

/// Point-in-time view of the farm.
#[derive(Debug, Clone, Serialize)]
pub struct FarmStatus {
    pub at: DateTime<Utc>,
    pub maintenance: bool,
    pub nodes: Vec<NodeStatus>,
    pub pending: Vec<PendingView>,
    pub monitors: usize,
}

/// Final outcome of one test, as collected by the CLI.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub test_id: String,
    pub status: TestStatus,
    pub detail: String,
}

/// Prints a summary of test outcomes to the console.
pub fn print_summary(outcomes: &[Outcome], duration: std::time::Duration) {
    let finished = outcomes
        .iter()
        .filter(|o| o.status == TestStatus::Finished)
        .count();
    let failed = outcomes.len() - finished;

    println!();
    println!("Test Results:");
    println!("  Total:    {}", outcomes.len());
    println!("  Finished: {}", console::style(finished).green());
    println!("  Failed:   {}", console::style(failed).red());
    println!("  Duration: {:?}", duration);

    println!();
    if failed == 0 {
        println!("{}", console::style("All tests finished!").green().bold());
        return;
    }

    println!("{}", console::style("Some tests failed.").red().bold());
    println!();
    println!("Failed tests:");
    for outcome in outcomes.iter().filter(|o| o.status != TestStatus::Finished) {
        println!("  - {}", outcome.test_id);
        println!("    {}", console::style(&outcome.detail).dim());
    }
}
