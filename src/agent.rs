//! The node transport seam.
//!
//! The scheduler never talks to execution hosts directly. Each registered
//! node carries a [`NodeAgent`] that knows how to start and stop sub-tests
//! there and how to tell the host about reservation changes. The wire
//! format behind an agent is the agent's business.
//!
//! ```text
//! Handler ──start_test──► NodeAgent ──► host
//!    ▲                         │
//!    └──── ExecutionStream ◄───┘  Started, Finished | Failed
//! ```
//!
//! # Bounded operations
//!
//! Every agent call made by the core goes through [`with_retries`]: each
//! attempt is bounded by a timeout and transient errors are retried a fixed
//! number of times. Exhausting the attempts yields
//! [`AgentError::Unreachable`], which the farm turns into a node
//! deregistration.

pub mod local;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tracing::warn;

use crate::config::FarmSettings;
use crate::inventory::ProductView;
use crate::test_case::{RuntimeId, TestCase};

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors returned by a [`NodeAgent`].
///
/// `Timeout` and `Connection` are transient and retried by
/// [`with_retries`]; everything else fails the operation immediately.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// The node understood the request and refused it.
    #[error("Rejected by node: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Agent error: {0}")]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Timeout(_) | AgentError::Connection(_))
    }
}

/// Progress of a sub-test on its node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    /// The node accepted the sub-test and began executing it.
    Started,
    /// Every artifact completed successfully.
    Finished,
    /// Execution failed; the string is the node's reason.
    Failed(String),
}

/// Stream of execution events for one sub-test.
///
/// The stream ends after a terminal event. Ending without one means the
/// connection to the node was lost.
pub type ExecutionStream = Pin<Box<dyn Stream<Item = ExecutionEvent> + Send>>;

/// Connection to one execution node.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// Node address, `hostname:port`.
    fn address(&self) -> &str;

    /// Sends the start operation for a reserved sub-test.
    async fn start_test(&self, test: &TestCase) -> AgentResult<ExecutionStream>;

    /// Asks the node to stop a running sub-test.
    async fn stop_test(&self, runtime_id: &RuntimeId) -> AgentResult<()>;

    /// Tells the node the current state of its products after a
    /// reservation or release.
    async fn products_changed(&self, products: &[ProductView]) -> AgentResult<()>;
}

/// Per-operation bounds for remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub attempts: usize,
    /// Whether an attempt that got no answer is sent again.
    pub retry_timeouts: bool,
}

impl RetryPolicy {
    pub fn from_settings(settings: &FarmSettings) -> Self {
        Self {
            timeout: settings.node_op_timeout(),
            attempts: settings.node_op_retries.max(1),
            retry_timeouts: true,
        }
    }

    /// The same bounds, but an unanswered attempt is final. For operations
    /// the peer may have carried out even though no answer arrived.
    pub fn once_on_timeout(self) -> Self {
        Self {
            retry_timeouts: false,
            ..self
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&FarmSettings::default())
    }
}

/// Why a bounded operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The peer returned an error that is not worth retrying.
    #[error("{0}")]
    Fatal(E),

    /// No answer, and the policy does not resend.
    #[error("no answer within {0:?}")]
    TimedOut(Duration),

    #[error("failed after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: String },
}

/// Runs `op` under `policy`, retrying errors for which `retryable` holds.
///
/// Each attempt is bounded by the policy's timeout. Timeouts are retried
/// unless the policy says otherwise.
pub async fn retry_bounded<T, E, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if retryable(&e) => last = e.to_string(),
            Ok(Err(e)) => return Err(RetryError::Fatal(e)),
            Err(_) if !policy.retry_timeouts => return Err(RetryError::TimedOut(policy.timeout)),
            Err(_) => last = format!("no answer within {:?}", policy.timeout),
        }
        warn!(operation = what, attempt, attempts, "{}", last);
    }
    Err(RetryError::Exhausted { attempts, last })
}

/// Runs a node operation under `policy`.
///
/// Transient failures are retried; after the last attempt the peer is
/// reported as [`AgentError::Unreachable`]. An unanswered attempt under a
/// [`RetryPolicy::once_on_timeout`] policy yields [`AgentError::Timeout`].
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, what: &str, op: F) -> AgentResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AgentResult<T>>,
{
    retry_bounded(policy, what, AgentError::is_transient, op)
        .await
        .map_err(|e| match e {
            RetryError::Fatal(e) => e,
            RetryError::TimedOut(timeout) => {
                AgentError::Timeout(format!("{} got no answer within {:?}", what, timeout))
            }
            RetryError::Exhausted { attempts, last } => AgentError::Unreachable(format!(
                "{} failed after {} attempts: {}",
                what, attempts, last
            )),
        })
}
