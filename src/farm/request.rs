//! Inbound requests.
//!
//! A transport decodes whatever arrives on the wire into a [`FarmRequest`]
//! and hands it to [`TestFarm::handle`]. The farm never sees bytes.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{FarmResult, TestFarm};
use crate::agent::NodeAgent;
use crate::client::Requester;
use crate::inventory::ProductInfo;
use crate::monitor::TestReport;
use crate::node::NodeId;
use crate::test_case::TestCase;

/// Products a node reports as attached or removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductChange {
    pub node: NodeId,
    #[serde(default)]
    pub attached: Vec<ProductInfo>,
    #[serde(default)]
    pub detached: Vec<String>,
}

/// The inbound request kinds.
pub enum FarmRequest {
    StartTest(TestCase),
    StopTest {
        test_id: String,
    },
    UpdateTest(TestCase),
    CheckTest {
        test_id: String,
    },
    RegisterNode {
        agent: Arc<dyn NodeAgent>,
        products: Vec<ProductInfo>,
        maintenance: bool,
    },
    DeregisterNode {
        node: NodeId,
    },
    RegisterClient {
        client_id: String,
        requester: Arc<dyn Requester>,
    },
    DeregisterClient {
        client_id: String,
    },
    ProductUpdate(ProductChange),
}

impl FarmRequest {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FarmRequest::StartTest(_) => "start-test",
            FarmRequest::StopTest { .. } => "stop-test",
            FarmRequest::UpdateTest(_) => "update-test",
            FarmRequest::CheckTest { .. } => "check-test",
            FarmRequest::RegisterNode { .. } => "register-node",
            FarmRequest::DeregisterNode { .. } => "deregister-node",
            FarmRequest::RegisterClient { .. } => "register-client",
            FarmRequest::DeregisterClient { .. } => "deregister-client",
            FarmRequest::ProductUpdate(_) => "product-update",
        }
    }
}

impl fmt::Debug for FarmRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FarmRequest::StartTest(test) | FarmRequest::UpdateTest(test) => f
                .debug_struct(self.kind())
                .field("test_id", &test.id)
                .finish(),
            FarmRequest::StopTest { test_id } | FarmRequest::CheckTest { test_id } => f
                .debug_struct(self.kind())
                .field("test_id", test_id)
                .finish(),
            FarmRequest::RegisterNode { agent, products, .. } => f
                .debug_struct(self.kind())
                .field("address", &agent.address())
                .field("products", &products.len())
                .finish(),
            FarmRequest::DeregisterNode { node } => {
                f.debug_struct(self.kind()).field("node", node).finish()
            }
            FarmRequest::RegisterClient { client_id, .. }
            | FarmRequest::DeregisterClient { client_id } => f
                .debug_struct(self.kind())
                .field("client_id", client_id)
                .finish(),
            FarmRequest::ProductUpdate(change) => f.debug_tuple(self.kind()).field(change).finish(),
        }
    }
}

/// What a handled request answers.
#[derive(Debug)]
pub enum FarmResponse {
    Accepted,
    Report(TestReport),
    NodeRegistered(NodeId),
}

impl TestFarm {
    /// Dispatches one inbound request.
    pub async fn handle(&self, request: FarmRequest) -> FarmResult<FarmResponse> {
        tracing::debug!(request = ?request, "Handling request");
        match request {
            FarmRequest::StartTest(test) => self.start_test(test)?,
            FarmRequest::StopTest { test_id } => self.stop_test(&test_id)?,
            FarmRequest::UpdateTest(test) => self.update_test(test).await?,
            FarmRequest::CheckTest { test_id } => {
                return Ok(FarmResponse::Report(self.check_test(&test_id).await?));
            }
            FarmRequest::RegisterNode {
                agent,
                products,
                maintenance,
            } => {
                let node = self.register_node(agent, products, maintenance)?;
                return Ok(FarmResponse::NodeRegistered(node.id().clone()));
            }
            FarmRequest::DeregisterNode { node } => self.deregister_node(&node)?,
            FarmRequest::RegisterClient {
                client_id,
                requester,
            } => self.register_client(client_id, requester),
            FarmRequest::DeregisterClient { client_id } => self.deregister_client(&client_id)?,
            FarmRequest::ProductUpdate(change) => self.product_update(change)?,
        }
        Ok(FarmResponse::Accepted)
    }
}
