//! testfarm CLI - run tests on a local test farm.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use testfarm::agent::local::LocalAgent;
use testfarm::client::{ClientError, ClientResult, Requester, StatusUpdate};
use testfarm::config::{self, LiveConfig};
use testfarm::environment::AttributeCompiler;
use testfarm::farm::TestFarm;
use testfarm::report::{LogSink, MultiSink, Outcome, print_summary};
use testfarm::test_case::TestCase;

const CLIENT_ID: &str = "cli";

#[derive(Parser)]
#[command(name = "testfarm")]
#[command(about = "Test-farm scheduler for nodes and attached products", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "testfarm.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests on the nodes of the configuration
    Run {
        /// JSON file with an array of test requests
        #[arg(short, long)]
        tests: PathBuf,

        /// Override maximum tests per node
        #[arg(long)]
        max_per_node: Option<usize>,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Number of sample nodes
        #[arg(short, long, default_value_t = 1)]
        nodes: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            tests,
            max_per_node,
        } => run_tests(&cli.config, &tests, max_per_node).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { nodes } => init_config(&cli.config, nodes),
    }
}

/// Forwards final status updates to the CLI's collection loop.
struct ChannelRequester {
    tx: mpsc::UnboundedSender<StatusUpdate>,
}

#[async_trait]
impl Requester for ChannelRequester {
    async fn test_status(&self, update: &StatusUpdate) -> ClientResult<()> {
        if update.status.is_final() {
            self.tx.send(update.clone()).map_err(|_| ClientError::Closed)?;
        } else {
            info!(test_id = %update.test_id, status = %update.status, detail = %update.detail, "Status");
        }
        Ok(())
    }
}

fn load_tests(path: &Path) -> Result<Vec<TestCase>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tests file: {}", path.display()))?;
    let tests: Vec<TestCase> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse tests file: {}", path.display()))?;
    Ok(tests)
}

async fn run_tests(config_path: &Path, tests_path: &Path, max_per_node: Option<usize>) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(max) = max_per_node {
        config.farm.max_tests_per_node = max;
    }
    if config.nodes.is_empty() {
        bail!("No nodes configured in {}", config_path.display());
    }
    info!("Loaded configuration from {}", config_path.display());

    let tests = load_tests(tests_path)?;
    if tests.is_empty() {
        println!("No tests to run.");
        return Ok(());
    }

    let sink = MultiSink::new().with_sink(Arc::new(LogSink));
    let farm = TestFarm::start(
        LiveConfig::new(config.farm.clone()),
        Arc::new(sink),
        Arc::new(AttributeCompiler),
    );
    for node in &config.nodes {
        let agent = Arc::new(LocalAgent::new(node));
        farm.register_node(agent, node.products.clone(), node.maintenance)?;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    farm.register_client(CLIENT_ID, Arc::new(ChannelRequester { tx }));

    let started = Instant::now();
    let mut outcomes: HashMap<String, Outcome> = HashMap::new();
    let mut submitted = 0;
    for mut test in tests {
        test.client_id = Some(CLIENT_ID.to_string());
        let test_id = test.id.clone();
        match farm.start_test(test) {
            Ok(()) => submitted += 1,
            Err(e) => {
                warn!(test_id = %test_id, error = %e, "Test rejected");
                outcomes.insert(
                    test_id.clone(),
                    Outcome {
                        test_id,
                        status: testfarm::TestStatus::Failed,
                        detail: e.to_string(),
                    },
                );
            }
        }
    }
    info!(tests = submitted, nodes = config.nodes.len(), "Tests submitted");

    let mut remaining = submitted;
    while remaining > 0 {
        let Some(update) = rx.recv().await else {
            break;
        };
        remaining -= 1;
        outcomes.insert(
            update.test_id.clone(),
            Outcome {
                test_id: update.test_id,
                status: update.status,
                detail: update.detail,
            },
        );
    }
    farm.shutdown().await;

    let mut outcomes: Vec<Outcome> = outcomes.into_values().collect();
    outcomes.sort_by(|a, b| a.test_id.cmp(&b.test_id));
    print_summary(&outcomes, started.elapsed());

    let failed = outcomes
        .iter()
        .any(|o| o.status != testfarm::TestStatus::Finished);
    std::process::exit(if failed { 1 } else { 0 });
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Max tests per node: {}", config.farm.max_tests_per_node);
            println!("  Test timeout: {}s", config.farm.default_test_timeout_secs);
            println!("  Min execution time: {}s", config.farm.min_execution_time_secs);
            println!("  Max retries: {}", config.farm.max_retries);
            println!("  Maintenance mode: {}", config.farm.maintenance_mode);
            println!("  Nodes: {}", config.nodes.len());
            for node in &config.nodes {
                println!("    {} ({} products)", node.address, node.products.len());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path, nodes: usize) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    let mut config = String::from(
        r#"# testfarm configuration file

[farm]
default_test_timeout_secs = 3600
min_execution_time_secs = 60
max_tests_per_node = 4
max_retries = 3
resource_expectation_timeout_secs = 1800
product_disconnection_timeout_secs = 300
scheduler_interval_secs = 15
"#,
    );
    for i in 1..=nodes.max(1) {
        config.push_str(&format!(
            r#"
[[nodes]]
address = "localhost:{port}"
shell = "/bin/sh"

[[nodes.products]]
imei = "35000000000000{i}"
type_code = "RM-1"
role = "main"
"#,
            port = 7000 + i,
            i = i
        ));
    }

    std::fs::write(path, config)?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  testfarm run --tests tests.json");

    Ok(())
}
