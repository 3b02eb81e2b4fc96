//! Scripted collaborators for unit and scenario tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentError, AgentResult, ExecutionEvent, ExecutionStream, NodeAgent};
use crate::client::{ClientError, ClientResult, Requester, StatusUpdate};
use crate::inventory::ProductView;
use crate::monitor::FailureReason;
use crate::node::NodeId;
use crate::report::{FarmStatus, StatusSink};
use crate::test_case::{RuntimeId, TestCase, TestStatus};

/// How a scripted node answers one start.
#[derive(Debug, Clone)]
pub enum Script {
    /// Started, then Finished at once.
    Finish,
    /// Started, then Finished after the delay.
    FinishAfter(Duration),
    /// Started, then Failed.
    Fail(String),
    /// Started, then nothing until stopped.
    Hang,
    /// Started, then the stream ends.
    Disconnect,
    /// `start_test` itself is refused.
    Reject,
    /// The node takes the start but never answers `start_test`.
    Unanswered,
}

/// A node agent that plays back scripted outcomes and records every call.
pub struct ScriptedAgent {
    address: String,
    script: Mutex<VecDeque<Script>>,
    default: Mutex<Script>,
    unreachable: AtomicBool,
    started: Mutex<Vec<(TestCase, Instant)>>,
    stopped: Mutex<Vec<(RuntimeId, Instant)>>,
    product_updates: AtomicUsize,
    running: Arc<Mutex<HashMap<RuntimeId, CancellationToken>>>,
}

impl ScriptedAgent {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(Script::Finish),
            unreachable: AtomicBool::new(false),
            started: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            product_updates: AtomicUsize::new(0),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sets the outcome used once the queued script runs out.
    pub fn with_default(self, script: Script) -> Self {
        *self.default.lock().unwrap() = script;
        self
    }

    /// Queues outcomes for the next starts, in order.
    pub fn with_script(self, script: impl IntoIterator<Item = Script>) -> Self {
        self.script.lock().unwrap().extend(script);
        self
    }

    /// Makes every call fail with a transient connection error.
    pub fn set_unreachable(&self, on: bool) {
        self.unreachable.store(on, Ordering::SeqCst);
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.address.clone())
    }

    pub fn started(&self) -> Vec<TestCase> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn started_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .started()
            .iter()
            .map(|t| t.runtime_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn started_at(&self, runtime_id: &str) -> Option<Instant> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .find(|(t, _)| t.runtime_id().to_string() == runtime_id)
            .map(|(_, at)| *at)
    }

    pub fn stopped(&self) -> Vec<RuntimeId> {
        self.stopped
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn stopped_at(&self, runtime_id: &str) -> Option<Instant> {
        self.stopped
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id.to_string() == runtime_id)
            .map(|(_, at)| *at)
    }

    pub fn product_updates(&self) -> usize {
        self.product_updates.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> AgentResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AgentError::Connection(format!(
                "{} refused the connection",
                self.address
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeAgent for ScriptedAgent {
    fn address(&self) -> &str {
        &self.address
    }

    async fn start_test(&self, test: &TestCase) -> AgentResult<ExecutionStream> {
        self.check_reachable()?;
        let script = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.lock().unwrap().clone());
        match script {
            Script::Reject => return Err(AgentError::Rejected("scripted rejection".into())),
            Script::Unanswered => {
                self.started
                    .lock()
                    .unwrap()
                    .push((test.clone(), Instant::now()));
                std::future::pending::<()>().await;
            }
            _ => {}
        }

        let runtime_id = test.runtime_id();
        self.started
            .lock()
            .unwrap()
            .push((test.clone(), Instant::now()));
        let token = CancellationToken::new();
        self.running
            .lock()
            .unwrap()
            .insert(runtime_id.clone(), token.clone());

        let (tx, rx) = mpsc::channel(4);
        let running = self.running.clone();
        tokio::spawn(async move {
            let _ = tx.send(ExecutionEvent::Started).await;
            match script {
                Script::Finish => {
                    let _ = tx.send(ExecutionEvent::Finished).await;
                }
                Script::FinishAfter(delay) => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = tx.send(ExecutionEvent::Finished).await;
                        }
                    }
                }
                Script::Fail(reason) => {
                    let _ = tx.send(ExecutionEvent::Failed(reason)).await;
                }
                Script::Hang => token.cancelled().await,
                Script::Disconnect | Script::Reject | Script::Unanswered => {}
            }
            running.lock().unwrap().remove(&runtime_id);
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn stop_test(&self, runtime_id: &RuntimeId) -> AgentResult<()> {
        self.check_reachable()?;
        self.stopped
            .lock()
            .unwrap()
            .push((runtime_id.clone(), Instant::now()));
        if let Some(token) = self.running.lock().unwrap().remove(runtime_id) {
            token.cancel();
        }
        Ok(())
    }

    async fn products_changed(&self, _products: &[ProductView]) -> AgentResult<()> {
        self.check_reachable()?;
        self.product_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every event it receives.
#[derive(Default)]
pub struct CollectingSink {
    admitted: Mutex<Vec<String>>,
    node_runs: Mutex<Vec<(NodeId, RuntimeId, Option<FailureReason>)>>,
    finished: Mutex<Vec<(String, TestStatus, String)>>,
    statuses: AtomicUsize,
}

impl CollectingSink {
    pub fn admitted(&self) -> Vec<String> {
        self.admitted.lock().unwrap().clone()
    }

    pub fn node_runs(&self) -> Vec<(NodeId, RuntimeId, Option<FailureReason>)> {
        self.node_runs.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<(String, TestStatus, String)> {
        self.finished.lock().unwrap().clone()
    }

    pub fn outcome(&self, test_id: &str) -> Option<(TestStatus, String)> {
        self.finished
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _, _)| id == test_id)
            .map(|(_, status, detail)| (*status, detail.clone()))
    }

    pub fn status_snapshots(&self) -> usize {
        self.statuses.load(Ordering::SeqCst)
    }
}

impl StatusSink for CollectingSink {
    fn on_test_admitted(&self, test: &TestCase) {
        self.admitted.lock().unwrap().push(test.id.clone());
    }

    fn on_node_finished(
        &self,
        node: &NodeId,
        runtime_id: &RuntimeId,
        failure: Option<&FailureReason>,
    ) {
        self.node_runs
            .lock()
            .unwrap()
            .push((node.clone(), runtime_id.clone(), failure.cloned()));
    }

    fn on_test_finished(&self, test_id: &str, status: TestStatus, detail: &str) {
        self.finished
            .lock()
            .unwrap()
            .push((test_id.to_string(), status, detail.to_string()));
    }

    fn on_status(&self, _status: &FarmStatus) {
        self.statuses.fetch_add(1, Ordering::SeqCst);
    }
}

/// A requester that stores every update, refuses them all, or never
/// answers.
#[derive(Default)]
pub struct CollectingRequester {
    updates: Mutex<Vec<StatusUpdate>>,
    attempts: AtomicUsize,
    failing: bool,
    silent: bool,
}

impl CollectingRequester {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    pub fn updates(&self, test_id: &str) -> Vec<StatusUpdate> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.test_id == test_id)
            .cloned()
            .collect()
    }

    pub fn statuses(&self, test_id: &str) -> Vec<TestStatus> {
        self.updates(test_id).iter().map(|u| u.status).collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Requester for CollectingRequester {
    async fn test_status(&self, update: &StatusUpdate) -> ClientResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.silent {
            std::future::pending::<()>().await;
        }
        if self.failing {
            return Err(ClientError::Connection("connection reset".into()));
        }
        self.updates.lock().unwrap().push(update.clone());
        Ok(())
    }
}

/// Polls `condition` until it holds, letting paused time advance.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}
