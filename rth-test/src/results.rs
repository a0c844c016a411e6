//! Parsing of raw test-results documents into counted aggregates.
//!
//! Workers return results files verbatim; the build host parses them here.
//! Only the Go test textual format is parsed in-tree; other formats (JUnit
//! XML and friends) are host adapters plugged in behind the same dispatch.

use std::time::Duration;

use thiserror::Error;

use rth_common::types::{BuildTarget, TestCase, TestOutcome, TestResults};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResultsError {
    #[error("no results")]
    Empty,
    #[error("unrecognised results format")]
    UnrecognisedFormat,
}

/// Parses each raw results document and folds it into the target's results
/// aggregator, returning the aggregate.
pub fn parse_test_results(
    target: &mut BuildTarget,
    data: &[Vec<u8>],
) -> Result<TestResults, ResultsError> {
    for d in data {
        let results = parse_single_result(d)?;
        target.results.aggregate(results);
    }
    // A target that ran cleanly but reported no cases still counts as one
    // success, so empty suites don't read as permanently unchanged.
    if target.results.failed == 0 && target.results.num_tests == 0 {
        target.results.num_tests += 1;
        target.results.passed += 1;
    }
    Ok(target.results.clone())
}

fn parse_single_result(data: &[u8]) -> Result<TestResults, ResultsError> {
    if data.is_empty() {
        Err(ResultsError::Empty)
    } else if looks_like_go_test_results(data) {
        Ok(parse_go_test_results(data))
    } else {
        Err(ResultsError::UnrecognisedFormat)
    }
}

/// True if the document looks like `go test` textual output.
pub fn looks_like_go_test_results(data: &[u8]) -> bool {
    let text = String::from_utf8_lossy(data);
    text.contains("--- PASS:")
        || text.contains("--- FAIL:")
        || text.contains("--- SKIP:")
        || text.contains("=== RUN ")
}

fn parse_go_test_results(data: &[u8]) -> TestResults {
    let mut results = TestResults::default();
    let text = String::from_utf8_lossy(data);
    for line in text.lines() {
        // Subtest records are indented under their parent.
        let line = line.trim_start();
        let (outcome, rest) = if let Some(rest) = line.strip_prefix("--- PASS: ") {
            (TestOutcome::Passed, rest)
        } else if let Some(rest) = line.strip_prefix("--- FAIL: ") {
            (TestOutcome::Failed, rest)
        } else if let Some(rest) = line.strip_prefix("--- SKIP: ") {
            (TestOutcome::Skipped, rest)
        } else {
            continue;
        };
        let (name, duration) = split_case_line(rest);
        results.num_tests += 1;
        match outcome {
            TestOutcome::Passed => results.passed += 1,
            TestOutcome::Failed => results.failed += 1,
            TestOutcome::Skipped => results.skipped += 1,
            TestOutcome::Errored => results.errored += 1,
        }
        results.cases.push(TestCase {
            name,
            outcome,
            duration,
            message: None,
        });
    }
    results
}

/// Splits `TestName (1.23s)` into the name and the parsed duration.
fn split_case_line(rest: &str) -> (String, Option<Duration>) {
    if let Some(open) = rest.rfind(" (") {
        let name = rest[..open].to_string();
        if let Some(secs) = rest[open + 2..].strip_suffix("s)") {
            if let Ok(value) = secs.parse::<f64>() {
                if value.is_finite() && value >= 0.0 {
                    return (name, Some(Duration::from_secs_f64(value)));
                }
            }
        }
        return (name, None);
    }
    (rest.to_string(), None)
}
