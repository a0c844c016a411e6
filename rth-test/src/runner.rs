//! Local test execution.
//!
//! Runs a target's test command inside its scratch directory, bounded by the
//! target timeout, and harvests whatever the run wrote: combined output, the
//! results file (unless the target declares it writes none) and the coverage
//! file (when coverage was requested).

use std::io;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use rth_common::types::{BuildState, BuildTarget};

/// Filename the test command writes its results document to, exposed to it
/// as `$RESULTS_FILE`.
pub const RESULTS_FILE: &str = "test.results";

/// Filename for coverage output, exposed as `$COVERAGE_FILE`.
pub const COVERAGE_FILE: &str = "test.coverage";

/// Everything one test run produced.
#[derive(Debug, Clone, Default)]
pub struct TestRun {
    /// Combined stdout and stderr.
    pub output: Vec<u8>,
    /// Raw results documents, one per results file harvested.
    pub results: Vec<Vec<u8>>,
    /// Raw coverage document, empty when none was produced.
    pub coverage: Vec<u8>,
    /// True when the test exited 0 and produced what it was meant to.
    pub exit_success: bool,
}

/// Runs the target's test command to completion.
///
/// An `Err` means the test could not be started at all; a completed run with
/// a failing status (or a missing results file, or a timeout) comes back as
/// `Ok` with `exit_success` false so callers still get the diagnostics.
pub async fn run_test(
    state: &BuildState,
    target: &BuildTarget,
    repo_root: &Path,
) -> io::Result<TestRun> {
    let test_dir = target.test_dir(repo_root);
    let timeout = target
        .test_timeout
        .unwrap_or_else(|| state.config.default_test_timeout());

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&target.test_command)
        .current_dir(&test_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env("TEST_DIR", &test_dir)
        .env("RESULTS_FILE", test_dir.join(RESULTS_FILE))
        .env("COVERAGE_FILE", test_dir.join(COVERAGE_FILE))
        .env("PATH", state.config.build.path.join(":"));
    if let Some(output) = target.outputs().first() {
        cmd.env("TEST", test_dir.join(output));
    }
    if !state.test_args.is_empty() {
        cmd.env("TESTS", &state.test_args);
    }

    debug!("Running test {}: {}", target.label, target.test_command);
    let child = cmd.spawn()?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            // Dropping the timed-out future drops the child, which kills it.
            warn!("Test {} timed out after {:?}", target.label, timeout);
            return Ok(TestRun {
                output: format!("Test timed out after {}s", timeout.as_secs()).into_bytes(),
                ..TestRun::default()
            });
        }
    };

    let mut run = TestRun {
        exit_success: output.status.success(),
        output: output.stdout,
        ..TestRun::default()
    };
    run.output.extend_from_slice(&output.stderr);

    if !target.no_test_output {
        match std::fs::read(test_dir.join(RESULTS_FILE)) {
            Ok(data) => run.results.push(data),
            Err(e) => {
                run.exit_success = false;
                run.output.extend_from_slice(
                    format!("\nTest failed to produce results file: {e}").as_bytes(),
                );
            }
        }
    }
    if state.need_coverage {
        if let Ok(data) = std::fs::read(test_dir.join(COVERAGE_FILE)) {
            run.coverage = data;
        }
    }
    Ok(run)
}
