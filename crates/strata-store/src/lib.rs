//! Store abstraction and cache tiers for the strata engine.
//!
//! ## Architecture
//!
//! - [`StoreBackend`]: the seam every shared store implements (redis in
//!   production, an in-memory store for single-instance deployments and
//!   tests; both live in their own crates)
//! - [`SharedCache`]: the multi-record cache layout (DATA/INFO/EXP/DEP)
//!   over a backend
//! - [`LocalCache`]: the bounded per-instance tier

pub mod backend;
pub mod error;
pub mod keys;
pub mod local;
pub mod shared;

pub use backend::{Batch, BatchOp, KeyEvents, StoreBackend, Subscription};
pub use error::{Result, StoreError};
pub use local::LocalCache;
pub use shared::SharedCache;
