//! Shared queue store: the only state shared between worker processes.
//!
//! The scheduler talks to the store through the narrow [`QueueStore`]
//! trait. [`InMemoryStore`] is the reference implementation used in tests
//! and single-process deployments; `RedisStore` (behind the `redis`
//! feature) is the production backend.

pub mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod traits;

pub use keys::KeySpace;
pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
pub use traits::QueueStore;
