//! Folds auto-renamed duplicate uploads back into the document they duplicate.
//!
//! See [`versioning`] for the engine and [`storage`] for the host contracts it runs against.

pub mod activity;
pub mod canonical;
pub mod config;
pub mod event;
pub mod storage;
pub mod transaction;
pub mod versioning;

pub use canonical::canonicalize;
pub use config::EngineConfig;
pub use versioning::AutoVersioner;
