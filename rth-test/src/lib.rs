//! Test execution for RTH.
//!
//! Local execution runs the target's test command in its scratch directory
//! and harvests the results it writes; remote execution ships the binary and
//! its data files to a test worker over the wire protocol and maps the
//! response back into the same shapes.

pub mod remote;
pub mod results;
pub mod runner;

pub use remote::{run_test_remotely, RemoteTestError, RemoteTestResults};
pub use results::{parse_test_results, ResultsError};
pub use runner::{run_test, TestRun};
