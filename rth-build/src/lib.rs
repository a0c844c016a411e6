//! Build incrementality helpers.
//!
//! Three independent pieces the host build tool wires together: a memoised
//! path hasher that fingerprints build outputs, an `ar` archive combiner
//! used when packaging static libraries, and a size-factor admission policy
//! for artifact caches.

pub mod ar;
pub mod cache;
pub mod hasher;

pub use ar::{combine_ar, ArError};
pub use cache::{Cache, SizeFactorLimit};
pub use hasher::{HashError, PathHasher};
