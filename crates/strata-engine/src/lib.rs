//! Two-tier, dependency-aware caching engine.
//!
//! ## Architecture
//!
//! - **Facade** ([`TieredCache`]): local tier → shared tier → data source,
//!   with refresh-ahead for slow entries
//! - **Cluster** ([`cluster::Cluster`]): heartbeat membership, advisory
//!   leader election, cross-instance invalidation broadcast
//! - **Refresher** ([`refresh::RefreshQueue`] + [`watch::ExpiryWatcher`]):
//!   leader-only proactive recomputation driven by the store's native
//!   expiry events
//! - **Rate limiter** ([`throttle::RateLimiter`]): stepped sliding window
//!   on the same primitives
//!
//! Coordination between instances never uses distributed locks; the engine
//! relies on idempotent recomputation and bounded eventual consistency.

pub mod cluster;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod facade;
pub mod refresh;
pub mod registry;
pub mod throttle;
pub mod watch;

pub use cluster::{Cluster, EntityChange, Member, Role};
pub use engine::{CacheEngine, EngineBuilder};
pub use envelope::{Envelope, Message};
pub use error::{CacheError, Result};
pub use facade::{Hit, Origin, Tiers, TieredCache};
pub use refresh::RefreshQueue;
pub use registry::SourceRegistry;
pub use throttle::{IdentitySigner, RateLimiter, Signer};
pub use watch::ExpiryWatcher;
