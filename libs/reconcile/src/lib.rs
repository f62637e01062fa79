//! Reconciliation primitives shared by the scheduler, the broker and the
//! worker pool.
//!
//! - **Fingerprints**: a stable hash of a decision so that two scheduling
//!   passes over the same snapshot can be compared.
//! - **Drain ordering**: which surplus executions to stop first.
//! - **Backoff**: redelivery delays for the broker and retry delays for
//!   workers hitting infrastructure errors.
//!
//! # Invariants
//!
//! - Everything here is a pure function of its inputs
//! - Orderings are total, so results never depend on input order

use std::time::Duration;

use sha2::{Digest, Sha256};

// =============================================================================
// Fingerprints
// =============================================================================

/// Hash of a JSON document with object keys sorted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hashes the canonical form of `json`.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let mut canonical = String::new();
        write_canonical(json, &mut canonical);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    /// Hashes any serializable value through its JSON form.
    pub fn of<T: serde::Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_json(&serde_json::to_value(value)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Strings are emitted through serde_json so escaping matches JSON.
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// =============================================================================
// Drain Ordering
// =============================================================================

/// Drain class of a live execution. Lower values are stopped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainPriority {
    /// Placed on a node that no longer qualifies.
    Ineligible = 0,

    /// Still negotiating with the node.
    NotStarted = 1,

    /// Running on the node.
    Running = 2,
}

/// Orders `items` so that the first entries are the ones to stop first.
///
/// Items sort by drain priority, then by `tiebreak` descending so that among
/// equals the newest (largest key) is drained first.
pub fn select_for_drain<T, K, F>(items: Vec<T>, classify: F) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> (DrainPriority, K),
{
    let mut keyed: Vec<_> = items
        .into_iter()
        .map(|item| {
            let (priority, tiebreak) = classify(&item);
            (priority, std::cmp::Reverse(tiebreak), item)
        })
        .collect();

    keyed.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    keyed.into_iter().map(|(_, _, item)| item).collect()
}

// =============================================================================
// Backoff
// =============================================================================

/// Delay before redelivering an evaluation that has been delivered
/// `deliveries` times without an ack.
///
/// No delay before the first delivery, `initial` before the first retry and
/// `(deliveries - 1) * subsequent` afterwards, never more than `max`.
pub fn redelivery_delay(
    deliveries: u32,
    initial: Duration,
    subsequent: Duration,
    max: Duration,
) -> Duration {
    let delay = match deliveries {
        0 => Duration::ZERO,
        1 => initial,
        n => subsequent.saturating_mul(n - 1),
    };
    delay.min(max)
}

/// Exponential backoff for loops that retry after infrastructure errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

impl ExponentialBackoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

// =============================================================================
// Defaults
// =============================================================================

/// Default number of failed attempts a job may replace before failing.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default wait before re-evaluating a job that could not be fully placed.
pub const DEFAULT_QUEUE_BACKOFF: Duration = Duration::from_secs(60);

/// Default wait before re-evaluating a job after losing a commit race.
pub const DEFAULT_CONFLICT_BACKOFF: Duration = Duration::from_millis(250);

/// Default capacity multiplier applied when filtering nodes.
pub const DEFAULT_OVERSUBSCRIPTION_FACTOR: f64 = 1.0;
