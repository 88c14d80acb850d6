//! # Switchboard
//!
//! Real-time synchronization for a shared task board: every committed write
//! reaches every connected client, across any number of gateway processes,
//! and the short-lived list caches are invalidated along the way.
//!
//! ## Architecture
//!
//! ```text
//! Mutation Handler -> CommitNotifier -> Event Bus (Redis) -> Gateway x N -> Clients
//!                           |
//!                           +-> Cache invalidation
//! ```
//!
//! ## Modules
//!
//! - [`task`]: Task data model
//! - [`event`]: Mutation events and the wire envelope
//! - [`bus`]: Event bus trait, retry policy and transports
//! - [`cache`]: TTL cache stores and the absorbing coordinator
//! - [`query`]: List query cache keys
//! - [`commit`]: Post-commit publish and invalidation
//! - [`gateway`]: Session registry, WebSocket transport and bus bridge
//! - [`client`]: Client-side reconciliation of optimistic edits
//! - [`config`]: TOML configuration
//! - [`shutdown`]: Graceful shutdown signal

pub mod bus;
pub mod cache;
pub mod client;
pub mod commit;
pub mod config;
pub mod event;
pub mod gateway;
pub mod query;
pub mod shutdown;
pub mod task;

// Re-export commonly used types at crate root
pub use bus::{BusError, EventBus, InMemoryBus, PublishOutcome, RedisBus};
pub use cache::{CacheCoordinator, CacheError, MemoryCache, RedisCache};
pub use client::{ApplyOutcome, BoardState, LocalMutation, SyncState};
pub use commit::{CommitNotifier, NotifyReport};
pub use config::SwitchboardConfig;
pub use event::{Envelope, MutationEvent};
pub use gateway::{Gateway, GatewayError};
pub use task::{Column, Priority, Task, TaskId};
