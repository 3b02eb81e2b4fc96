//! Execution nodes and their load ordering.
//!
//! A [`Node`] is an execution host: it offers capacity (up to
//! `max_tests_per_node` concurrent sub-tests) and owns the [`Inventory`] of
//! products attached to it. All mutable state sits behind one mutex, so a
//! reservation that takes a slot and a product set is atomic per node.

pub mod registry;

pub use registry::NodeRegistry;

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::agent::NodeAgent;
use crate::inventory::{
    AttachOutcome, DetachOutcome, GraceEntry, Inventory, ProductInfo, ProductView,
    ReservationError, ReservationResult, ReservationWindow,
};
use crate::test_case::{ReleaseMode, RuntimeId};

/// Node identity, `hostname:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Load of a node: `(executed + running) / max(products, 1)`.
///
/// Compared by cross-multiplication so no precision is lost.
///
/// ```
/// use testfarm::node::Load;
///
/// let idle = Load::new(0, 0, 4);
/// let busy = Load::new(3, 1, 4);
/// let small = Load::new(1, 0, 1);
/// assert!(idle < busy);
/// assert_eq!(busy, small);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Load {
    work: u64,
    capacity: u64,
}

impl Load {
    pub fn new(executed: usize, running: usize, products: usize) -> Self {
        Self {
            work: (executed + running) as u64,
            capacity: products.max(1) as u64,
        }
    }

    /// The load after `extra` more sub-tests are placed on the node.
    pub fn with_extra(self, extra: usize) -> Self {
        Self {
            work: self.work + extra as u64,
            ..self
        }
    }

    pub fn ratio(&self) -> f64 {
        self.work as f64 / self.capacity as f64
    }
}

impl Ord for Load {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.work * other.capacity).cmp(&(other.work * self.capacity))
    }
}

impl PartialOrd for Load {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Load {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Load {}

#[derive(Debug)]
struct NodeState {
    maintenance: bool,
    running: usize,
    executed: usize,
    inventory: Inventory,
}

/// A free product as seen by the matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeProduct {
    pub imei: String,
    pub attributes: String,
}

/// Consistent view of a node taken under its lock.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub load: Load,
    pub running: usize,
    pub maintenance: bool,
    pub free: Vec<FreeProduct>,
}

/// Summary of a node for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub maintenance: bool,
    pub running: usize,
    pub executed: usize,
    pub load: f64,
    pub products: Vec<ProductView>,
    pub temporarily_disconnected: usize,
    pub permanently_disconnected: usize,
    pub manually_reserved: usize,
}

pub struct Node {
    id: NodeId,
    agent: Arc<dyn NodeAgent>,
    state: Mutex<NodeState>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Node {
    pub fn new(
        id: impl Into<NodeId>,
        agent: Arc<dyn NodeAgent>,
        products: impl IntoIterator<Item = ProductInfo>,
    ) -> Self {
        Self {
            id: id.into(),
            agent,
            state: Mutex::new(NodeState {
                maintenance: false,
                running: 0,
                executed: 0,
                inventory: Inventory::new(products),
            }),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn agent(&self) -> &Arc<dyn NodeAgent> {
        &self.agent
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn load(&self) -> Load {
        let state = self.lock();
        Load::new(
            state.executed,
            state.running,
            state.inventory.product_count(),
        )
    }

    pub fn running(&self) -> usize {
        self.lock().running
    }

    pub fn executed(&self) -> usize {
        self.lock().executed
    }

    pub fn is_maintenance(&self) -> bool {
        self.lock().maintenance
    }

    pub fn set_maintenance(&self, on: bool) {
        self.lock().maintenance = on;
    }

    pub fn free_count(&self) -> usize {
        self.lock().inventory.free_count()
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.lock();
        NodeSnapshot {
            load: Load::new(
                state.executed,
                state.running,
                state.inventory.product_count(),
            ),
            running: state.running,
            maintenance: state.maintenance,
            free: state
                .inventory
                .free_products()
                .map(|p| FreeProduct {
                    imei: p.imei().to_string(),
                    attributes: p.attribute_string(),
                })
                .collect(),
        }
    }

    /// Takes an execution slot and reserves `imeis` for `owner`.
    ///
    /// Both succeed or neither does. An empty product list only takes the
    /// slot, which is how `NOSE` sub-tests are placed.
    pub fn reserve_for(
        &self,
        owner: &RuntimeId,
        imeis: &[String],
        window: ReservationWindow,
        max_per_node: usize,
    ) -> ReservationResult<()> {
        let mut state = self.lock();
        if state.maintenance {
            return Err(ReservationError::Maintenance(self.id.to_string()));
        }
        if state.running >= max_per_node {
            return Err(ReservationError::NoCapacity(self.id.to_string()));
        }
        state
            .inventory
            .reserve(owner, imeis, window, Instant::now())?;
        state.running += 1;
        Ok(())
    }

    /// Undoes [`reserve_for`](Self::reserve_for) for a sub-test that never ran.
    pub fn cancel_reservation(&self, owner: &RuntimeId, imeis: &[String]) {
        let mut state = self.lock();
        state.running = state.running.saturating_sub(1);
        state.inventory.free(owner, imeis);
    }

    /// Releases the slot of a sub-test that ran.
    ///
    /// With [`ReleaseMode::Automatic`] the products are freed; with
    /// [`ReleaseMode::Manual`] they stay `BUSY` and are tagged as manually
    /// reserved. Returns the ids freed.
    pub fn finish(&self, owner: &RuntimeId, imeis: &[String], mode: ReleaseMode) -> Vec<String> {
        let mut state = self.lock();
        state.running = state.running.saturating_sub(1);
        state.executed += 1;
        match mode {
            ReleaseMode::Automatic => state.inventory.free(owner, imeis),
            ReleaseMode::Manual => {
                state.inventory.mark_manual(owner, imeis);
                Vec::new()
            }
        }
    }

    /// Frees products whose owner is gone, without touching slot counters.
    pub fn free_orphaned(&self, owner: &RuntimeId, imeis: &[String]) -> Vec<String> {
        self.lock().inventory.free(owner, imeis)
    }

    pub fn release_manual(&self, imeis: &[String]) -> Vec<String> {
        self.lock().inventory.release_manual(imeis)
    }

    pub fn attach(&self, info: ProductInfo) -> AttachOutcome {
        self.lock().inventory.attach(info)
    }

    pub fn detach(&self, imei: &str) -> DetachOutcome {
        self.lock().inventory.detach(imei, Instant::now())
    }

    pub fn has_product(&self, imei: &str) -> bool {
        self.lock().inventory.product(imei).is_some()
    }

    pub fn grace_entries(&self) -> Vec<GraceEntry> {
        self.lock().inventory.grace_entries()
    }

    pub fn make_permanent(&self, imei: &str) -> bool {
        self.lock().inventory.make_permanent(imei)
    }

    pub(crate) fn take_orphan_report(&self, imei: &str) -> bool {
        self.lock().inventory.take_orphan_report(imei)
    }

    pub fn expired_reservations(&self, now: Instant) -> Vec<(RuntimeId, String)> {
        self.lock().inventory.expired_reservations(now)
    }

    pub fn reserved_by(&self, owner: &RuntimeId) -> Vec<String> {
        self.lock().inventory.reserved_by(owner)
    }

    pub fn product_views(&self) -> Vec<ProductView> {
        self.lock().inventory.views()
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.lock();
        let inventory = &state.inventory;
        NodeStatus {
            id: self.id.clone(),
            maintenance: state.maintenance,
            running: state.running,
            executed: state.executed,
            load: Load::new(state.executed, state.running, inventory.product_count()).ratio(),
            products: inventory.views(),
            temporarily_disconnected: inventory.temporarily_disconnected().len(),
            permanently_disconnected: inventory.permanently_disconnected().len(),
            manually_reserved: inventory
                .connected()
                .iter()
                .chain(inventory.temporarily_disconnected())
                .chain(inventory.permanently_disconnected())
                .filter(|p| inventory.is_manually_reserved(p.imei()))
                .count(),
        }
    }
}
