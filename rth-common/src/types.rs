//! Build-graph types shared across RTH components.
//!
//! These are deliberately a thin slice of a build graph: just enough state
//! for the hasher, the cache wrappers and the remote test worker to agree on
//! what a target is and where its files live.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Configuration;

/// Directory (relative to the repo root) where rules build into before their
/// outputs are moved into place.
pub const TMP_DIR: &str = "rth-out/tmp";

/// Directory (relative to the repo root) where finished outputs live.
pub const GEN_DIR: &str = "rth-out/gen";

/// Identifies a single target in the build graph, e.g. `//src/build:hasher`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildLabel {
    /// Package path relative to the repo root.
    pub package_name: String,
    /// Target name within the package.
    pub name: String,
}

impl BuildLabel {
    pub fn new(package_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for BuildLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "//{}:{}", self.package_name, self.name)
    }
}

/// A single unit of the build graph.
///
/// Only the fields the test and hashing subsystems consume are modelled;
/// rule evaluation and dependency resolution happen in the host build tool.
#[derive(Debug, Clone, Default)]
pub struct BuildTarget {
    pub label: BuildLabel,
    /// Declared output filenames, relative to the target's out dir.
    outputs: Vec<String>,
    /// Runtime data dependencies, as on-disk paths.
    pub data: Vec<PathBuf>,
    /// Hash assertions declared on the target (`sha1:...`, `sha256:...` or
    /// bare hex).
    pub hashes: Vec<String>,
    /// Shell command template that runs the test.
    pub test_command: String,
    /// Opaque labels attached to the target.
    pub labels: Vec<String>,
    /// True if the test does not write a results file.
    pub no_test_output: bool,
    /// Per-target test timeout; falls back to the configured default.
    pub test_timeout: Option<Duration>,
    /// How long the target took to build, used by cache heuristics.
    pub build_duration: Duration,
    /// Aggregated results of this target's test runs.
    pub results: TestResults,
}

impl BuildTarget {
    pub fn new(label: BuildLabel) -> Self {
        Self {
            label,
            ..Self::default()
        }
    }

    /// Declares an output filename. Duplicates are ignored.
    pub fn add_output(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.outputs.contains(&name) {
            self.outputs.push(name);
        }
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Scratch directory this target's test runs inside.
    pub fn test_dir(&self, repo_root: &Path) -> PathBuf {
        repo_root
            .join(TMP_DIR)
            .join(&self.label.package_name)
            .join(format!("{}._test", self.label.name))
    }

    /// Directory this target's built outputs live in.
    pub fn out_dir(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(GEN_DIR).join(&self.label.package_name)
    }
}

/// Mutable build-wide state threaded through test execution.
#[derive(Debug, Clone, Default)]
pub struct BuildState {
    pub config: Configuration,
    /// Whether coverage output is expected from test runs.
    pub need_coverage: bool,
    /// Optional test-name filter passed through to the test binary.
    pub test_args: String,
}

impl BuildState {
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }
}

/// Outcome of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    Errored,
}

/// One test case parsed out of a results document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub outcome: TestOutcome,
    /// Reported duration, when the format carries one.
    pub duration: Option<Duration>,
    /// Failure message or skip reason, when present.
    pub message: Option<String>,
}

/// Counted aggregate over one or more results documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub num_tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub cases: Vec<TestCase>,
}

impl TestResults {
    /// Folds another aggregate into this one.
    pub fn aggregate(&mut self, other: TestResults) {
        self.num_tests += other.num_tests;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.errored += other.errored;
        self.cases.extend(other.cases);
    }
}
