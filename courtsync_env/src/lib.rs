//! CourtSync Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing CourtSync peers
//! to run in both **Production** (tokio) and **Simulation** environments.
//!
//! # Core Concept
//!
//! For Deterministic Simulation Testing (DST), we intercept all I/O:
//! - Time (`now()`, `sleep()`)
//! - The shared store (`write()`, `read()`, `subscribe()`, `remove()`)
//! - Randomness (`derive_seed()`)
//!
//! By deriving all entropy from a single 64-bit seed, any desync becomes
//! reproducible via its seed number.
//!
//! # Example
//!
//! ```ignore
//! use courtsync_env::{SyncContext, SharedStore, StoreScope, LockMode};
//!
//! async fn follower_loop<Ctx: SyncContext, St: SharedStore>(ctx: &Ctx, store: &St) {
//!     let scope = StoreScope::new("game");
//!     loop {
//!         if let Ok(Some(value)) = store.read(&scope, "game.abc.state", LockMode::Shared).await {
//!             reconcile(value);
//!         }
//!         ctx.sleep(Duration::from_millis(50)).await;
//!     }
//! }
//! ```

mod context;
mod store;
mod types;
mod error;
mod tokio_impl;

pub use context::SyncContext;
pub use store::{SharedStore, StoreController, Subscription};
pub use types::{Durability, LockMode, PeerId, SessionId, StoreScope, StoredValue};
pub use error::EnvError;
pub use tokio_impl::{MemoryStore, TokioContext};
