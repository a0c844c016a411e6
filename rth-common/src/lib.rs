//! Shared foundation for the RTH build-and-test helper.
//!
//! This crate carries the pieces every other RTH component needs: the
//! build-graph types the worker and client exchange information about,
//! configuration loading, logging initialisation, and the wire protocol
//! spoken between the build host and remote test workers.

pub mod config;
pub mod logging;
pub mod protocol;
pub mod types;
pub mod util;

pub use config::Configuration;
pub use logging::init_logging;
pub use types::{BuildLabel, BuildState, BuildTarget, TestCase, TestOutcome, TestResults};
pub use util::ByteSize;
