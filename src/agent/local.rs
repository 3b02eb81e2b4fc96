//! Local process node agent.
//!
//! Runs a node's sub-tests as child processes on this machine. Each artifact
//! of a sub-test is executed in order through the node's shell; the sub-test
//! finishes when every artifact exits successfully and fails on the first
//! one that doesn't.
//!
//! # Environment
//!
//! Every artifact sees the node's configured variables plus:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `TESTFARM_RUNTIME_ID` | Runtime id of the sub-test (`T` or `T_n`) |
//! | `TESTFARM_PRODUCTS` | Comma-separated ids of the reserved products |
//!
//! # Example Configuration
//!
//! ```toml
//! [[nodes]]
//! address = "localhost:7001"
//! shell = "/bin/bash"
//! working_dir = "/srv/flash"
//!
//! [nodes.env]
//! FLASH_TOOL = "/opt/flash/bin/flash"
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{LinesStream, ReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{AgentError, AgentResult, ExecutionEvent, ExecutionStream, NodeAgent};
use crate::config::NodeConfig;
use crate::inventory::{ProductStatus, ProductView};
use crate::test_case::{RuntimeId, TestCase};

type RunningMap = Arc<Mutex<HashMap<RuntimeId, CancellationToken>>>;

/// Node agent backed by local child processes.
pub struct LocalAgent {
    address: String,
    shell: String,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    running: RunningMap,
}

impl LocalAgent {
    /// Creates an agent for the node described by `config`.
    ///
    /// Artifacts run in the configured working directory, or the current
    /// directory when none is set.
    pub fn new(config: &NodeConfig) -> Self {
        let working_dir = config
            .working_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let mut env: Vec<_> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();

        Self {
            address: config.address.clone(),
            shell: config.shell.clone(),
            working_dir,
            env,
            running: Arc::default(),
        }
    }

    /// Number of sub-tests currently executing.
    pub fn running(&self) -> usize {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl NodeAgent for LocalAgent {
    fn address(&self) -> &str {
        &self.address
    }

    async fn start_test(&self, test: &TestCase) -> AgentResult<ExecutionStream> {
        let runtime_id = test.runtime_id();
        let cancel = CancellationToken::new();
        {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            if running.contains_key(&runtime_id) {
                return Err(AgentError::Rejected(format!(
                    "{} is already running",
                    runtime_id
                )));
            }
            running.insert(runtime_id.clone(), cancel.clone());
        }

        let products = test
            .reserved_products
            .iter()
            .map(|p| p.imei.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let job = Job {
            node: self.address.clone(),
            runtime_id,
            artifacts: test.artifacts(),
            shell: self.shell.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            products,
            cancel,
            running: self.running.clone(),
        };

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(job.run(tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn stop_test(&self, runtime_id: &RuntimeId) -> AgentResult<()> {
        let token = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(runtime_id);
        if let Some(token) = token {
            info!(node = %self.address, runtime_id = %runtime_id, "Stopping sub-test");
            token.cancel();
        }
        Ok(())
    }

    async fn products_changed(&self, products: &[ProductView]) -> AgentResult<()> {
        let busy = products
            .iter()
            .filter(|p| p.status == ProductStatus::Busy)
            .count();
        debug!(
            node = %self.address,
            products = products.len(),
            busy,
            "Product state updated"
        );
        Ok(())
    }
}

struct Job {
    node: String,
    runtime_id: RuntimeId,
    artifacts: Vec<String>,
    shell: String,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    products: String,
    cancel: CancellationToken,
    running: RunningMap,
}

impl Job {
    async fn run(self, tx: mpsc::Sender<ExecutionEvent>) {
        let outcome = self.execute(&tx).await;
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.runtime_id);
        if let Some(event) = outcome {
            let _ = tx.send(event).await;
        }
    }

    /// Runs every artifact; `None` means the job was stopped.
    async fn execute(&self, tx: &mpsc::Sender<ExecutionEvent>) -> Option<ExecutionEvent> {
        if tx.send(ExecutionEvent::Started).await.is_err() {
            return None;
        }

        for artifact in &self.artifacts {
            debug!(node = %self.node, runtime_id = %self.runtime_id, artifact, "Executing artifact");

            let mut process = tokio::process::Command::new(&self.shell);
            process
                .arg("-c")
                .arg(artifact)
                .current_dir(&self.working_dir)
                .envs(self.env.iter().map(|(k, v)| (k, v)))
                .env("TESTFARM_RUNTIME_ID", self.runtime_id.to_string())
                .env("TESTFARM_PRODUCTS", &self.products)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = match process.spawn() {
                Ok(child) => child,
                Err(e) => {
                    return Some(ExecutionEvent::Failed(format!(
                        "failed to spawn '{}': {}",
                        artifact, e
                    )));
                }
            };

            if let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) {
                let lines = stream::select(
                    LinesStream::new(BufReader::new(stdout).lines()),
                    LinesStream::new(BufReader::new(stderr).lines()),
                );
                let runtime_id = self.runtime_id.clone();
                tokio::spawn(async move {
                    let mut lines = std::pin::pin!(lines);
                    while let Some(Ok(line)) = lines.next().await {
                        debug!(runtime_id = %runtime_id, "{}", line);
                    }
                });
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = child.kill().await;
                    return None;
                }
                status = child.wait() => match status {
                    Ok(status) if status.success() => {}
                    Ok(status) => {
                        return Some(ExecutionEvent::Failed(format!(
                            "'{}' exited with {}",
                            artifact, status
                        )));
                    }
                    Err(e) => {
                        return Some(ExecutionEvent::Failed(format!(
                            "failed to wait for '{}': {}",
                            artifact, e
                        )));
                    }
                },
            }
        }

        Some(ExecutionEvent::Finished)
    }
}
