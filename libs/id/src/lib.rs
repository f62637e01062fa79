//! # convoy-id
//!
//! Typed identifiers for the convoy scheduling core.
//!
//! ## Design Principles
//!
//! - Records created by the orchestrator get ULID-based IDs with a type prefix
//! - Node IDs come from the node fleet and are opaque strings
//! - Receipt handles are random and only meaningful to the broker that issued them
//! - Parsing is strict so an execution ID can never be passed where a job ID is expected
//!
//! ## ID Format
//!
//! Orchestrator IDs use `{prefix}_{ulid}`:
//! - `job_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `exec_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `eval_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! ULIDs sort by creation time, which the history and listing queries rely on.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::SHORT_ID_LEN;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
