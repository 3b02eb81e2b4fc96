//! Test request data model.
//!
//! A [`TestCase`] is what a requester submits: which artifacts to run, on
//! what kind of target, within which environment, and for how long. The
//! same type is reused for sub-tests produced by the splitter; a sub-test
//! is a shallow copy of its parent with a narrower package list, a single
//! pinned environment and (usually) a sub-id.
//!
//! # Runtime Identity
//!
//! | Test | `id` | `sub_id` | [`RuntimeId`] |
//! |------|------|----------|---------------|
//! | Original test | `T` | `None` | `T` |
//! | Second sub-test | `T` | `Some(2)` | `T_2` |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::FarmSettings;

/// Identity of a running (sub-)test: the parent test id plus an optional
/// sub-id.
///
/// Products reserved for a sub-test record the `RuntimeId` as their owner,
/// which lets any component map a product back to the owning test through
/// [`test_id`](Self::test_id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuntimeId {
    test_id: String,
    sub_id: Option<usize>,
}

impl RuntimeId {
    /// Creates a runtime id for a whole (unsplit) test.
    pub fn new(test_id: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            sub_id: None,
        }
    }

    /// Creates a runtime id for the `sub_id`-th sub-test of `test_id`.
    pub fn sub(test_id: impl Into<String>, sub_id: usize) -> Self {
        Self {
            test_id: test_id.into(),
            sub_id: Some(sub_id),
        }
    }

    /// Returns the id of the originally submitted test.
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// Returns the sub-id, if this identifies a sub-test.
    pub fn sub_id(&self) -> Option<usize> {
        self.sub_id
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub_id {
            Some(n) => write!(f, "{}_{}", self.test_id, n),
            None => f.write_str(&self.test_id),
        }
    }
}

/// What a test needs to run on.
///
/// Unknown target names are kept as [`Target::Unsupported`] so the farm can
/// reject them with a readable reason instead of failing to parse the whole
/// request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    /// Needs physical products attached to a node.
    Flash,
    /// Needs only a node with spare capacity.
    Nose,
    /// Any other target name.
    Unsupported(String),
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "FLASH" => Target::Flash,
            "NOSE" => Target::Nose,
            _ => Target::Unsupported(value),
        }
    }
}

impl From<Target> for String {
    fn from(value: Target) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Flash => f.write_str("FLASH"),
            Target::Nose => f.write_str("NOSE"),
            Target::Unsupported(name) => f.write_str(name),
        }
    }
}

/// Whether reserved products are freed automatically when a sub-test ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReleaseMode {
    /// Products return to `FREE` as soon as the sub-test ends.
    #[default]
    Automatic,
    /// Products stay `BUSY` until released explicitly.
    Manual,
}

/// Lifecycle status reported to the requester.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    /// Waiting for resources.
    #[default]
    Pending,
    /// At least one sub-test has been allocated.
    Started,
    /// Every sub-test completed successfully.
    Finished,
    /// The test failed; the status detail carries the reason.
    Failed,
}

impl TestStatus {
    /// Returns `true` for `Finished` and `Failed`.
    pub fn is_final(&self) -> bool {
        matches!(self, TestStatus::Finished | TestStatus::Failed)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Pending => "PENDING",
            TestStatus::Started => "STARTED",
            TestStatus::Finished => "FINISHED",
            TestStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A slice of a test's work with its own environment requirement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Environment expression for this package. Falls back to the test's
    /// own requirement when absent.
    #[serde(default)]
    pub required_environment: Option<String>,

    /// Artifacts belonging to this package.
    #[serde(default)]
    pub files: Vec<String>,
}

impl Package {
    /// Creates a package with the given environment and artifacts.
    pub fn new<I, S>(environment: impl Into<String>, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_environment: Some(environment.into()),
            files: files.into_iter().map(Into::into).collect(),
        }
    }
}

/// A product reserved on a particular node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductRef {
    pub node: String,
    pub imei: String,
}

/// A test execution request, or a sub-test split from one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    /// Id of the originally submitted test.
    pub id: String,

    /// Sub-id assigned by the splitter.
    #[serde(default)]
    pub sub_id: Option<usize>,

    /// Requester that receives status updates.
    #[serde(default)]
    pub client_id: Option<String>,

    pub target: Target,

    /// Total time budget. Falls back to the configured default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Minimum execution time before a forced stop is allowed. Falls back to
    /// the configured default.
    #[serde(default)]
    pub min_execution_secs: Option<u64>,

    /// Grace period for a reserved product that disappears from its node.
    #[serde(default)]
    pub product_disconnection_timeout_secs: Option<u64>,

    /// Environment expression used when the test has no packages, and as
    /// the fallback for packages without their own.
    #[serde(default)]
    pub required_environment: String,

    #[serde(default)]
    pub packages: Vec<Package>,

    /// Artifacts of the test when no packages are declared.
    #[serde(default)]
    pub files: Vec<String>,

    #[serde(default)]
    pub release_mode: ReleaseMode,

    /// Restricts matching to a single node.
    #[serde(default)]
    pub pinned_node: Option<String>,

    #[serde(default)]
    pub status: TestStatus,

    #[serde(default)]
    pub status_detail: String,

    #[serde(default)]
    pub reserved_products: Vec<ProductRef>,
}

impl TestCase {
    /// Creates a new pending test with no requirements.
    pub fn new(id: impl Into<String>, target: Target) -> Self {
        Self {
            id: id.into(),
            sub_id: None,
            client_id: None,
            target,
            timeout_secs: None,
            min_execution_secs: None,
            product_disconnection_timeout_secs: None,
            required_environment: String::new(),
            packages: Vec::new(),
            files: Vec::new(),
            release_mode: ReleaseMode::Automatic,
            pinned_node: None,
            status: TestStatus::Pending,
            status_detail: String::new(),
            reserved_products: Vec::new(),
        }
    }

    /// Sets the environment expression.
    pub fn with_environment(mut self, expression: impl Into<String>) -> Self {
        self.required_environment = expression.into();
        self
    }

    /// Adds a package.
    pub fn with_package(mut self, package: Package) -> Self {
        self.packages.push(package);
        self
    }

    /// Adds artifacts to the test-level file list.
    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files.extend(files.into_iter().map(Into::into));
        self
    }

    /// Sets the total timeout in seconds.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Sets the requester id.
    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the product release mode.
    pub fn with_release_mode(mut self, mode: ReleaseMode) -> Self {
        self.release_mode = mode;
        self
    }

    /// Restricts the test to one node.
    pub fn pinned_to(mut self, node: impl Into<String>) -> Self {
        self.pinned_node = Some(node.into());
        self
    }

    /// Returns the runtime id (`id` or `id_<sub>`).
    pub fn runtime_id(&self) -> RuntimeId {
        match self.sub_id {
            Some(n) => RuntimeId::sub(&self.id, n),
            None => RuntimeId::new(&self.id),
        }
    }

    /// Total time budget, resolved against the live settings.
    pub fn timeout(&self, settings: &FarmSettings) -> Duration {
        match self.timeout_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => settings.default_test_timeout(),
        }
    }

    /// Minimum execution floor, resolved against the live settings.
    pub fn min_execution_time(&self, settings: &FarmSettings) -> Duration {
        self.min_execution_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| settings.min_execution_time())
    }

    /// Product disconnection grace period, resolved against the live settings.
    pub fn product_disconnection_timeout(&self, settings: &FarmSettings) -> Duration {
        self.product_disconnection_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| settings.product_disconnection_timeout())
    }

    /// Environment of a package, falling back to the test-level expression.
    pub fn package_environment<'a>(&'a self, package: &'a Package) -> &'a str {
        package
            .required_environment
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or(&self.required_environment)
    }

    /// Returns the test's work as packages, synthesizing a single virtual
    /// package from the test-level files when none are declared.
    pub fn effective_packages(&self) -> Vec<Package> {
        if self.packages.is_empty() {
            vec![Package {
                required_environment: Some(self.required_environment.clone()),
                files: self.files.clone(),
            }]
        } else {
            self.packages
                .iter()
                .map(|p| Package {
                    required_environment: Some(self.package_environment(p).to_string()),
                    files: p.files.clone(),
                })
                .collect()
        }
    }

    /// Artifacts this (sub-)test will execute, in order, without duplicates.
    pub fn artifacts(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let sources = self.files.iter().chain(self.packages.iter().flat_map(|p| &p.files));
        for file in sources {
            if !out.contains(file) {
                out.push(file.clone());
            }
        }
        out
    }
}
