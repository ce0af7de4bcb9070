//! convopool - warm pool manager for remote convos agent instances
//!
//! This library keeps a pool of pre-provisioned agent instances running on a
//! remote compute provider so that claiming an agent returns a ready instance
//! in seconds instead of minutes.
//!
//! # Modules
//!
//! - `pool` - pool state machine, reconciler, claim coordinator
//! - `provider` - thin client for the remote compute provider
//! - `gateway` - HTTP client for the agent gateway inside each instance
//! - `store` - durable claim metadata, one JSON document per instance
//! - `api` - control-plane HTTP surface and dashboard
//! - `config` - environment-driven configuration
//! - `metrics` - Prometheus metrics for observability
//!
//! # Quick Start
//!
//! ```ignore
//! use convopool::{Config, PoolManager};
//!
//! let config = Config::from_env()?;
//! let manager = PoolManager::new(provider, gateway, store, config);
//!
//! // Keep the pool shaped in the background, claim on demand
//! PoolManager::spawn_reconciler(manager.clone());
//! let outcome = manager.claim(request).await?;
//! ```

pub mod api;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod pool;
pub mod provider;
pub mod store;
pub mod telemetry;

// Re-export commonly used types at crate root for convenience
pub use config::Config;
pub use pool::{Instance, PoolCounts, PoolManager, PoolState};
pub use store::MetadataStore;
