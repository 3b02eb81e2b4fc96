//! Configuration schema definitions for testfarm.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── FarmSettings           - Scheduling policy (timeouts, retries, capacity)
//! └── NodeConfig[]           - Local nodes started by the CLI
//!     └── ProductInfo[]      - Products attached to each node
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::inventory::ProductInfo;

/// Root configuration structure for testfarm.
///
/// # TOML Structure
///
/// ```toml
/// [farm]
/// max_tests_per_node = 2
/// max_retries = 3
///
/// [[nodes]]
/// address = "rack-1:7000"
///
/// [[nodes.products]]
/// imei = "350000000000001"
/// type_code = "RM-1"
/// role = "main"
/// ```
///
/// # Example
///
/// ```
/// use testfarm::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [farm]
///     max_tests_per_node = 2
/// "#).unwrap();
/// assert_eq!(config.farm.max_tests_per_node, 2);
/// assert!(config.nodes.is_empty());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Scheduling policy. Every field has a default.
    #[serde(default)]
    pub farm: FarmSettings,

    /// Nodes hosted by the local CLI farm.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// Scheduling policy of the farm.
///
/// All values are read live through [`LiveConfig`](super::LiveConfig), so a
/// change takes effect on the next scheduler tick or monitor iteration.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `default_test_timeout_secs` | 3600 |
/// | `min_execution_time_secs` | 60 |
/// | `max_tests_per_node` | 4 |
/// | `max_retries` | 3 |
/// | `resource_expectation_timeout_secs` | 1800 |
/// | `product_disconnection_timeout_secs` | 300 |
/// | `maintenance_mode` | false |
/// | `scheduler_interval_secs` | 15 |
/// | `status_interval_secs` | 15 |
/// | `node_op_timeout_secs` | 30 |
/// | `node_op_retries` | 3 |
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FarmSettings {
    /// Timeout for tests that don't declare one.
    #[serde(default = "default_test_timeout")]
    pub default_test_timeout_secs: u64,

    /// A running sub-test is never force-stopped before it has executed
    /// for this long.
    ///
    /// A failed sub-test is only restarted when at least this much of the
    /// test's time budget remains.
    #[serde(default = "default_min_execution_time")]
    pub min_execution_time_secs: u64,

    /// Maximum number of sub-tests running on one node at a time.
    #[serde(default = "default_max_tests_per_node")]
    pub max_tests_per_node: usize,

    /// Number of sub-test failures after which the whole test fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// How long a test may wait for matching resources before failing.
    #[serde(default = "default_resource_expectation_timeout")]
    pub resource_expectation_timeout_secs: u64,

    /// Default grace period for a reserved product that disappears.
    #[serde(default = "default_product_disconnection_timeout")]
    pub product_disconnection_timeout_secs: u64,

    /// Suspends all new allocations while set.
    #[serde(default)]
    pub maintenance_mode: bool,

    /// Period of the allocation pass.
    #[serde(default = "default_interval")]
    pub scheduler_interval_secs: u64,

    /// Period of status snapshots sent to the status sink.
    #[serde(default = "default_interval")]
    pub status_interval_secs: u64,

    /// Timeout of a single operation against a node or requester.
    #[serde(default = "default_node_op_timeout")]
    pub node_op_timeout_secs: u64,

    /// Attempts per operation before the peer is considered unreachable.
    #[serde(default = "default_node_op_retries")]
    pub node_op_retries: usize,
}

fn default_test_timeout() -> u64 {
    3600
}

fn default_min_execution_time() -> u64 {
    60
}

fn default_max_tests_per_node() -> usize {
    4
}

fn default_max_retries() -> usize {
    3
}

fn default_resource_expectation_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_product_disconnection_timeout() -> u64 {
    300
}

fn default_interval() -> u64 {
    15
}

fn default_node_op_timeout() -> u64 {
    30
}

fn default_node_op_retries() -> usize {
    3
}

impl Default for FarmSettings {
    fn default() -> Self {
        Self {
            default_test_timeout_secs: default_test_timeout(),
            min_execution_time_secs: default_min_execution_time(),
            max_tests_per_node: default_max_tests_per_node(),
            max_retries: default_max_retries(),
            resource_expectation_timeout_secs: default_resource_expectation_timeout(),
            product_disconnection_timeout_secs: default_product_disconnection_timeout(),
            maintenance_mode: false,
            scheduler_interval_secs: default_interval(),
            status_interval_secs: default_interval(),
            node_op_timeout_secs: default_node_op_timeout(),
            node_op_retries: default_node_op_retries(),
        }
    }
}

impl FarmSettings {
    pub fn default_test_timeout(&self) -> Duration {
        Duration::from_secs(self.default_test_timeout_secs)
    }

    pub fn min_execution_time(&self) -> Duration {
        Duration::from_secs(self.min_execution_time_secs)
    }

    pub fn resource_expectation_timeout(&self) -> Duration {
        Duration::from_secs(self.resource_expectation_timeout_secs)
    }

    pub fn product_disconnection_timeout(&self) -> Duration {
        Duration::from_secs(self.product_disconnection_timeout_secs)
    }

    /// Scheduler period, never shorter than one second.
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs.max(1))
    }

    /// Status snapshot period, never shorter than one second.
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }

    pub fn node_op_timeout(&self) -> Duration {
        Duration::from_secs(self.node_op_timeout_secs.max(1))
    }
}

/// A node hosted by the local CLI farm.
///
/// # Example
///
/// ```toml
/// [[nodes]]
/// address = "bench-2:7000"
/// shell = "/bin/bash"
/// working_dir = "/srv/bench-2"
///
/// [nodes.env]
/// FLASH_TOOL = "/opt/flash/bin/flash"
///
/// [[nodes.products]]
/// imei = "350000000000002"
/// type_code = "RM-2"
/// attributes = { hw = "proto" }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Node identity, `hostname:port`.
    pub address: String,

    /// Starts the node in maintenance mode.
    #[serde(default)]
    pub maintenance: bool,

    /// Working directory for artifacts executed on this node.
    pub working_dir: Option<PathBuf>,

    /// Shell used to execute artifacts.
    ///
    /// Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Environment variables passed to every artifact.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Products attached at startup.
    #[serde(default)]
    pub products: Vec<ProductInfo>,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}
