//! Requesters: the clients that submit tests and receive status updates.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::agent::{RetryPolicy, retry_bounded};
use crate::config::LiveConfig;
use crate::farm::FarmEvent;
use crate::test_case::{ProductRef, TestStatus};

/// Result type for requester operations.
pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Requester closed")]
    Closed,

    #[error("Client error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A status transition sent to the requester of a test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub test_id: String,
    pub status: TestStatus,
    pub detail: String,
    pub products: Vec<ProductRef>,
    pub at: DateTime<Utc>,
}

/// Connection to one requester.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn test_status(&self, update: &StatusUpdate) -> ClientResult<()>;
}

/// A registered requester and the queue of updates waiting for it.
struct Connection {
    outbox: mpsc::UnboundedSender<StatusUpdate>,
}

/// Registered requesters by client id.
///
/// Every requester gets its own delivery task, so a slow requester delays
/// only its own updates. Updates to one requester arrive in the order they
/// were queued.
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Connection>>,
    settings: LiveConfig,
    events: mpsc::UnboundedSender<FarmEvent>,
}

impl ClientRegistry {
    pub fn new(settings: LiveConfig, events: mpsc::UnboundedSender<FarmEvent>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            settings,
            events,
        }
    }

    /// Registers a requester, replacing any previous one with the same id.
    ///
    /// Must be called within a tokio runtime.
    pub fn register(&self, client_id: impl Into<String>, requester: Arc<dyn Requester>) {
        let client_id = client_id.into();
        let (outbox, updates) = mpsc::unbounded_channel();
        tokio::spawn(deliver(
            client_id.clone(),
            requester,
            updates,
            self.settings.clone(),
            self.events.clone(),
        ));
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client_id, Connection { outbox });
    }

    /// Returns `true` if the client was registered. Updates already queued
    /// for it are still delivered.
    pub fn deregister(&self, client_id: &str) -> bool {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(client_id)
            .is_some()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(client_id)
    }

    /// Queues `update` for its requester and returns at once.
    ///
    /// Updates for unknown requesters are dropped.
    pub fn notify(&self, client_id: Option<&str>, update: StatusUpdate) {
        let Some(client_id) = client_id else {
            debug!(test_id = %update.test_id, status = %update.status, "No requester to notify");
            return;
        };
        let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
        let Some(connection) = clients.get(client_id) else {
            debug!(client_id, test_id = %update.test_id, "Requester not registered; update dropped");
            return;
        };
        if connection.outbox.send(update).is_err() {
            debug!(client_id, "Requester delivery stopped; update dropped");
        }
    }
}

/// Delivers queued updates to one requester until it is deregistered or
/// stops answering.
///
/// Each update is bounded by the node operation timeout and retry count. A
/// requester that fails every attempt, or closes, is reported as
/// unreachable so the farm can deregister it.
async fn deliver(
    client_id: String,
    requester: Arc<dyn Requester>,
    mut updates: mpsc::UnboundedReceiver<StatusUpdate>,
    settings: LiveConfig,
    events: mpsc::UnboundedSender<FarmEvent>,
) {
    while let Some(update) = updates.recv().await {
        let policy = RetryPolicy::from_settings(&settings.snapshot());
        let result = retry_bounded(
            policy,
            "test_status",
            |e: &ClientError| !matches!(e, ClientError::Closed),
            || requester.test_status(&update),
        )
        .await;
        if let Err(e) = result {
            warn!(client_id = %client_id, test_id = %update.test_id, error = %e, "Requester unreachable");
            let _ = events.send(FarmEvent::ClientUnreachable(client_id.clone()));
            break;
        }
    }
    debug!(client_id = %client_id, "Requester delivery stopped");
}
