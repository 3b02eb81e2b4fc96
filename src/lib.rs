//! testfarm: a scheduler for farms of test nodes and attached products.
//!
//! Requesters submit tests that declare which products they need. The farm
//! matches them against the products attached to its nodes, reserves what
//! matched, splits the work across the reserved sets and supervises every
//! part until it finishes, retrying failed parts within the test's budget.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Inventory / Node**: products attached to one node and their
//!   reservations ([`inventory`], [`node`])
//! - **Scheduler**: periodic allocation passes: match, split, reserve
//!   ([`scheduler`])
//! - **Monitor / Handler**: one monitor per test, one handler per sub-test
//!   ([`monitor`])
//! - **Farm**: the application context and inbound requests ([`farm`])
//! - **Seams**: node agents, requesters, environment compilers and status
//!   sinks ([`agent`], [`client`], [`environment`], [`report`])
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use testfarm::config::{LiveConfig, load_config};
//! use testfarm::environment::AttributeCompiler;
//! use testfarm::farm::TestFarm;
//! use testfarm::report::LogSink;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("testfarm.toml"))?;
//!     let farm = TestFarm::start(
//!         LiveConfig::new(config.farm),
//!         Arc::new(LogSink),
//!         Arc::new(AttributeCompiler),
//!     );
//!     // ... register nodes and requesters, submit tests ...
//!     farm.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod client;
pub mod config;
pub mod environment;
pub mod farm;
pub mod inventory;
pub mod monitor;
pub mod node;
pub mod report;
pub mod scheduler;
pub mod test_case;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{Config, LiveConfig, load_config};
pub use farm::{FarmError, FarmRequest, FarmResult, TestFarm};
pub use test_case::{Package, ReleaseMode, Target, TestCase, TestStatus};
