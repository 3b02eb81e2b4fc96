//! Products: reservable devices attached to a node.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::test_case::RuntimeId;

/// Reservation state of a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductStatus {
    Free,
    Busy,
    /// Attached but never offered for matching.
    Disabled,
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProductStatus::Free => "FREE",
            ProductStatus::Busy => "BUSY",
            ProductStatus::Disabled => "DISABLED",
        };
        f.write_str(s)
    }
}

/// Classification of a product as reported by its node.
///
/// This is the registration/product-update payload; the inventory turns it
/// into a [`Product`] with reservation state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProductInfo {
    /// Unique (IMEI-like) identity.
    pub imei: String,

    #[serde(default)]
    pub type_code: String,

    #[serde(default)]
    pub role: String,

    /// Free-form name/value attributes used for matching.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// Attach the product as `DISABLED`.
    #[serde(default)]
    pub disabled: bool,
}

impl ProductInfo {
    pub fn new(imei: impl Into<String>, type_code: impl Into<String>) -> Self {
        Self {
            imei: imei.into(),
            type_code: type_code.into(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// An active reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub owner: RuntimeId,
    pub started: Instant,
    pub timeout: Duration,
}

impl Reservation {
    pub fn expires_at(&self) -> Instant {
        self.started + self.timeout
    }
}

/// A product and its reservation bookkeeping.
#[derive(Debug, Clone)]
pub struct Product {
    info: ProductInfo,
    status: ProductStatus,
    reservation: Option<Reservation>,
    disconnected_at: Option<Instant>,
    orphan_reported: bool,
}

impl Product {
    pub fn new(info: ProductInfo) -> Self {
        let status = if info.disabled {
            ProductStatus::Disabled
        } else {
            ProductStatus::Free
        };
        Self {
            info,
            status,
            reservation: None,
            disconnected_at: None,
            orphan_reported: false,
        }
    }

    pub fn imei(&self) -> &str {
        &self.info.imei
    }

    pub fn info(&self) -> &ProductInfo {
        &self.info
    }

    pub fn status(&self) -> ProductStatus {
        self.status
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        self.reservation.as_ref()
    }

    pub fn owner(&self) -> Option<&RuntimeId> {
        self.reservation.as_ref().map(|r| &r.owner)
    }

    pub fn disconnected_at(&self) -> Option<Instant> {
        self.disconnected_at
    }

    pub fn is_free(&self) -> bool {
        self.status == ProductStatus::Free
    }

    /// Canonical `name=value` string matched by environment patterns.
    ///
    /// `type` and `role` come from the classification fields, followed by the
    /// free-form attributes; keys are sorted and joined with `;`, e.g.
    /// `hw=proto;role=main;type=RM-1`.
    pub fn attribute_string(&self) -> String {
        let mut all: BTreeMap<&str, &str> = BTreeMap::new();
        if !self.info.type_code.is_empty() {
            all.insert("type", &self.info.type_code);
        }
        if !self.info.role.is_empty() {
            all.insert("role", &self.info.role);
        }
        for (name, value) in &self.info.attributes {
            all.insert(name, value);
        }
        all.iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Replaces the classification, keeping reservation state.
    pub(crate) fn refresh(&mut self, info: ProductInfo) {
        if self.status != ProductStatus::Busy {
            self.status = if info.disabled {
                ProductStatus::Disabled
            } else {
                ProductStatus::Free
            };
        }
        self.info = info;
    }

    pub(crate) fn reserve(&mut self, reservation: Reservation) {
        self.status = ProductStatus::Busy;
        self.reservation = Some(reservation);
    }

    pub(crate) fn clear_reservation(&mut self) {
        self.status = if self.info.disabled {
            ProductStatus::Disabled
        } else {
            ProductStatus::Free
        };
        self.reservation = None;
    }

    pub(crate) fn mark_disconnected(&mut self, at: Instant) {
        self.disconnected_at = Some(at);
        self.orphan_reported = false;
    }

    pub(crate) fn mark_connected(&mut self) {
        self.disconnected_at = None;
        self.orphan_reported = false;
    }

    /// Returns `true` the first time it is called for this disconnection.
    pub(crate) fn take_orphan_report(&mut self) -> bool {
        !std::mem::replace(&mut self.orphan_reported, true)
    }

    pub fn view(&self) -> ProductView {
        ProductView {
            imei: self.info.imei.clone(),
            status: self.status,
            owner: self.owner().map(ToString::to_string),
        }
    }
}

/// Serializable snapshot of a product, sent to nodes and status sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductView {
    pub imei: String,
    pub status: ProductStatus,
    pub owner: Option<String>,
}
