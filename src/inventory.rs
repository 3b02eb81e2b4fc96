//! Per-node product inventory.
//!
//! Each node owns one [`Inventory`] holding its products in four disjoint
//! collections:
//!
//! | Collection | Contents |
//! |------------|----------|
//! | connected | Products currently reported by the node |
//! | temporarily disconnected | `BUSY` products that vanished; grace period running |
//! | permanently disconnected | Products that vanished and are not expected back |
//! | manually reserved | Ids of `BUSY` products excluded from automatic release |
//!
//! A product id is in exactly one of the first three collections; the
//! manually-reserved set only tags products that live in one of them.
//!
//! The inventory itself is not synchronized. [`Node`](crate::node::Node)
//! wraps it in a mutex so that every operation here is atomic per node.

pub mod product;

pub use product::{Product, ProductInfo, ProductStatus, ProductView, Reservation};

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::test_case::RuntimeId;

/// Result type for reservation operations.
pub type ReservationResult<T> = Result<T, ReservationError>;

/// Reasons a reservation can be refused.
///
/// A refused reservation never leaves anything behind: products touched by
/// the failed call are back in their previous state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    #[error("product {0} is not connected")]
    NotConnected(String),

    #[error("product {imei} is not free ({status})")]
    NotFree { imei: String, status: ProductStatus },

    #[error("product {0} requested twice")]
    Duplicate(String),

    #[error("node {0} has no spare capacity")]
    NoCapacity(String),

    #[error("node {0} is in maintenance")]
    Maintenance(String),
}

/// Time bounds of a reservation request.
///
/// The effective reservation timeout is the requested timeout, clamped to
/// the test's total timeout (a non-positive or oversized request becomes the
/// test timeout) and then capped by the test's remaining time.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use testfarm::inventory::ReservationWindow;
///
/// let window = ReservationWindow {
///     requested: Duration::ZERO,
///     test_timeout: Duration::from_secs(600),
///     remaining: Duration::from_secs(120),
/// };
/// assert_eq!(window.effective(), Duration::from_secs(120));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationWindow {
    pub requested: Duration,
    pub test_timeout: Duration,
    pub remaining: Duration,
}

impl ReservationWindow {
    pub fn effective(&self) -> Duration {
        let requested = if self.requested.is_zero() || self.requested > self.test_timeout {
            self.test_timeout
        } else {
            self.requested
        };
        requested.min(self.remaining)
    }
}

/// Which collection a product currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Connected,
    TemporarilyDisconnected,
    PermanentlyDisconnected,
}

/// What [`Inventory::attach`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    New,
    Updated,
    Reconnected(Location),
}

/// What [`Inventory::detach`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The product was reserved; its grace period started.
    GracePeriod(RuntimeId),
    /// The product was not reserved and is gone.
    Permanent,
    /// The node reported a product it never had, or one already detached.
    Unknown,
}

/// A temporarily-disconnected product awaiting its grace deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraceEntry {
    pub imei: String,
    pub owner: RuntimeId,
    pub disconnected_at: Instant,
}

#[derive(Debug, Default)]
pub struct Inventory {
    connected: Vec<Product>,
    temporarily_disconnected: Vec<Product>,
    permanently_disconnected: Vec<Product>,
    manually_reserved: BTreeSet<String>,
}

impl Inventory {
    pub fn new(products: impl IntoIterator<Item = ProductInfo>) -> Self {
        let mut inventory = Self::default();
        for info in products {
            inventory.attach(info);
        }
        inventory
    }

    /// Number of connected products.
    pub fn product_count(&self) -> usize {
        self.connected.len()
    }

    /// Connected products that are `FREE`, in attachment order.
    pub fn free_products(&self) -> impl Iterator<Item = &Product> {
        self.connected.iter().filter(|p| p.is_free())
    }

    pub fn free_count(&self) -> usize {
        self.free_products().count()
    }

    pub fn connected(&self) -> &[Product] {
        &self.connected
    }

    pub fn temporarily_disconnected(&self) -> &[Product] {
        &self.temporarily_disconnected
    }

    pub fn permanently_disconnected(&self) -> &[Product] {
        &self.permanently_disconnected
    }

    pub fn is_manually_reserved(&self, imei: &str) -> bool {
        self.manually_reserved.contains(imei)
    }

    /// Looks a product up in any collection.
    pub fn product(&self, imei: &str) -> Option<(&Product, Location)> {
        let find = |list: &'_ [Product]| list.iter().position(|p| p.imei() == imei);
        if let Some(i) = find(&self.connected) {
            return Some((&self.connected[i], Location::Connected));
        }
        if let Some(i) = find(&self.temporarily_disconnected) {
            return Some((
                &self.temporarily_disconnected[i],
                Location::TemporarilyDisconnected,
            ));
        }
        find(&self.permanently_disconnected).map(|i| {
            (
                &self.permanently_disconnected[i],
                Location::PermanentlyDisconnected,
            )
        })
    }

    /// Adds or refreshes a product reported by the node.
    ///
    /// A disconnected product that comes back moves to the connected pool,
    /// keeping any reservation it still has.
    pub fn attach(&mut self, info: ProductInfo) -> AttachOutcome {
        if let Some(product) = self.connected.iter_mut().find(|p| p.imei() == info.imei) {
            product.refresh(info);
            return AttachOutcome::Updated;
        }

        for location in [
            Location::TemporarilyDisconnected,
            Location::PermanentlyDisconnected,
        ] {
            let list = self.list_mut(location);
            if let Some(i) = list.iter().position(|p| p.imei() == info.imei) {
                let mut product = list.remove(i);
                product.mark_connected();
                product.refresh(info);
                self.connected.push(product);
                return AttachOutcome::Reconnected(location);
            }
        }

        self.connected.push(Product::new(info));
        AttachOutcome::New
    }

    /// Removes a product the node no longer reports.
    ///
    /// `BUSY` products enter the grace period; anything else is moved to the
    /// permanently-disconnected collection.
    pub fn detach(&mut self, imei: &str, now: Instant) -> DetachOutcome {
        let Some(i) = self.connected.iter().position(|p| p.imei() == imei) else {
            return DetachOutcome::Unknown;
        };
        let mut product = self.connected.remove(i);
        product.mark_disconnected(now);

        match product.owner().cloned() {
            Some(owner) => {
                self.temporarily_disconnected.push(product);
                DetachOutcome::GracePeriod(owner)
            }
            None => {
                self.permanently_disconnected.push(product);
                DetachOutcome::Permanent
            }
        }
    }

    /// Reserves every product in `imeis` for `owner`, or none of them.
    ///
    /// Each product must be connected and `FREE`. On success each moves to
    /// `BUSY` with the owner, reservation start `now` and the window's
    /// effective timeout.
    pub fn reserve(
        &mut self,
        owner: &RuntimeId,
        imeis: &[String],
        window: ReservationWindow,
        now: Instant,
    ) -> ReservationResult<()> {
        let mut seen = HashSet::new();
        let mut positions = Vec::with_capacity(imeis.len());
        for imei in imeis {
            if !seen.insert(imei.as_str()) {
                return Err(ReservationError::Duplicate(imei.clone()));
            }
            let i = self
                .connected
                .iter()
                .position(|p| p.imei() == imei)
                .ok_or_else(|| ReservationError::NotConnected(imei.clone()))?;
            let product = &self.connected[i];
            if !product.is_free() {
                return Err(ReservationError::NotFree {
                    imei: imei.clone(),
                    status: product.status(),
                });
            }
            positions.push(i);
        }

        let timeout = window.effective();
        for i in positions {
            self.connected[i].reserve(Reservation {
                owner: owner.clone(),
                started: now,
                timeout,
            });
        }
        Ok(())
    }

    /// Frees products reserved by `owner`, wherever they are.
    ///
    /// Products owned by someone else are left untouched. A freed product
    /// in its grace period has nothing left to wait for and becomes
    /// permanently disconnected. Returns the ids actually freed.
    pub fn free(&mut self, owner: &RuntimeId, imeis: &[String]) -> Vec<String> {
        self.free_where(imeis, |p| p.owner() == Some(owner))
    }

    /// Frees manually-reserved products regardless of owner.
    pub fn release_manual(&mut self, imeis: &[String]) -> Vec<String> {
        let manual: Vec<String> = imeis
            .iter()
            .filter(|i| self.manually_reserved.contains(*i))
            .cloned()
            .collect();
        self.free_where(&manual, |_| true)
    }

    fn free_where(&mut self, imeis: &[String], pred: impl Fn(&Product) -> bool) -> Vec<String> {
        let mut freed = Vec::new();
        for imei in imeis {
            for list in [&mut self.connected, &mut self.permanently_disconnected] {
                if let Some(p) = list.iter_mut().find(|p| p.imei() == imei && pred(p)) {
                    p.clear_reservation();
                    freed.push(imei.clone());
                }
            }
            if let Some(i) = self
                .temporarily_disconnected
                .iter()
                .position(|p| p.imei() == imei && pred(p))
            {
                let mut product = self.temporarily_disconnected.remove(i);
                product.clear_reservation();
                self.permanently_disconnected.push(product);
                freed.push(imei.clone());
            }
        }
        for imei in &freed {
            self.manually_reserved.remove(imei);
        }
        freed
    }

    /// Tags `BUSY` products owned by `owner` as manually reserved.
    pub fn mark_manual(&mut self, owner: &RuntimeId, imeis: &[String]) {
        for imei in imeis {
            if self
                .product(imei)
                .is_some_and(|(p, _)| p.owner() == Some(owner))
            {
                self.manually_reserved.insert(imei.clone());
            }
        }
    }

    /// Products currently in their grace period.
    pub fn grace_entries(&self) -> Vec<GraceEntry> {
        self.temporarily_disconnected
            .iter()
            .filter_map(|p| {
                Some(GraceEntry {
                    imei: p.imei().to_string(),
                    owner: p.owner()?.clone(),
                    disconnected_at: p.disconnected_at()?,
                })
            })
            .collect()
    }

    /// Moves a product from the grace period to permanently disconnected.
    ///
    /// The reservation is kept; the owner releases it when it shuts down.
    pub fn make_permanent(&mut self, imei: &str) -> bool {
        match self
            .temporarily_disconnected
            .iter()
            .position(|p| p.imei() == imei)
        {
            Some(i) => {
                let product = self.temporarily_disconnected.remove(i);
                self.permanently_disconnected.push(product);
                true
            }
            None => false,
        }
    }

    /// Returns `true` once per disconnection episode of `imei`.
    pub(crate) fn take_orphan_report(&mut self, imei: &str) -> bool {
        self.temporarily_disconnected
            .iter_mut()
            .find(|p| p.imei() == imei)
            .is_some_and(|p| p.take_orphan_report())
    }

    /// Reservations whose time has run out, excluding manual ones.
    pub fn expired_reservations(&self, now: Instant) -> Vec<(RuntimeId, String)> {
        self.connected
            .iter()
            .chain(&self.permanently_disconnected)
            .filter(|p| !self.manually_reserved.contains(p.imei()))
            .filter_map(|p| {
                let r = p.reservation()?;
                (r.expires_at() <= now).then(|| (r.owner.clone(), p.imei().to_string()))
            })
            .collect()
    }

    /// Ids of products reserved by `owner`, in any collection.
    pub fn reserved_by(&self, owner: &RuntimeId) -> Vec<String> {
        self.connected
            .iter()
            .chain(&self.temporarily_disconnected)
            .chain(&self.permanently_disconnected)
            .filter(|p| p.owner() == Some(owner))
            .map(|p| p.imei().to_string())
            .collect()
    }

    /// Snapshot of the connected products.
    pub fn views(&self) -> Vec<ProductView> {
        self.connected.iter().map(Product::view).collect()
    }

    fn list_mut(&mut self, location: Location) -> &mut Vec<Product> {
        match location {
            Location::Connected => &mut self.connected,
            Location::TemporarilyDisconnected => &mut self.temporarily_disconnected,
            Location::PermanentlyDisconnected => &mut self.permanently_disconnected,
        }
    }
}
