//! CourtSync Deterministic Simulation Testing (DST) Harness
//!
//! A controlled environment where a whole session (every peer, the shared
//! store and the bots playing) runs deterministically from one seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances only when the world finishes a frame
//! - **Store**: Per-reader latency, read loss and isolation, all seeded
//! - **Randomness**: Bot decisions and shot outcomes derive from the seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (Virtual Clock + Seeded RNG)              │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼────┐              ┌────▼────┐                       │
//! │  │  Peer   │              │  Peer   │     ...               │
//! │  │  p1     │              │  p2     │                       │
//! │  └────┬────┘              └────┬────┘                       │
//! │       │      ┌──────────┐      │                            │
//! │       └─────►│ SimStore │◄─────┘                            │
//! │              └──────────┘                                   │
//! │                   ▲                                         │
//! │  ┌────────────────┴─────────────────┐                       │
//! │  │          SessionOracle           │                       │
//! │  │   (invariants over all peers)    │                       │
//! │  └──────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use courtsync_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4)
//!     .with_duration(30.0)
//!     .run(ScenarioId::CoordinatorCrash);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod oracle;
mod peer;
mod runner;
mod script;
mod store;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{ActorPosition, PeerFrame, SimEvent, SimExport, SimFrame};
pub use oracle::{SessionOracle, Violation};
pub use peer::SimPeer;
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use script::{BotScript, SeededShotResolver};
pub use store::{SimStore, SimStoreController, StoreStats};
pub use world::{SimConfig, SimError, SimWorld, MAX_PEERS};
