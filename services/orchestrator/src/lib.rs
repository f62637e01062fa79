//! Convoy orchestrator library.
//!
//! The crate ships the `orchestrator` binary; the library surface exists so
//! integration tests and embedders can assemble the scheduling core
//! themselves.

pub mod api;
pub mod broker;
pub mod config;
pub mod context;
pub mod error;
pub mod housekeeping;
pub mod models;
pub mod nodes;
pub mod planner;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use context::{Orchestrator, OrchestratorConfig};
pub use error::{Error, ErrorKind};
