//! # convoy-events
//!
//! State vocabularies and audit records for the convoy scheduling core.
//!
//! ## Design Principles
//!
//! - Every state is a closed enum with an explicit terminal set
//! - A state always travels with the message explaining it (`State<T>`)
//! - Every persisted transition carries an `Event` describing why it happened
//! - History records are append-only and ordered by occurrence time
//!
//! ## History
//!
//! `JobHistory` records come in two levels:
//! - job level: a job state change (`Pending -> Running`)
//! - execution level: a desired or compute state change of one execution
//!
//! Both are queryable through `HistoryQuery` by time, level and by execution
//! or node ID prefix.

mod error;
mod event;
mod history;
mod types;

pub use error::EventError;
pub use event::*;
pub use history::*;
pub use types::*;
