//! Library surface of the RTH remote test worker.
//!
//! The binary in `main.rs` is a thin flag-parsing shell around
//! [`worker::Server`]; keeping the server here lets integration tests bind
//! an ephemeral port and drive it over real sockets.

pub mod worker;
