//! ID definitions for every record the scheduling core touches.

use crate::{define_id, IdError};

// =============================================================================
// Orchestrator Records
// =============================================================================

define_id!(JobId, "job");
define_id!(ExecutionId, "exec");
define_id!(EvaluationId, "eval");

// =============================================================================
// Nodes
// =============================================================================

/// Identity of a compute node.
///
/// Nodes name themselves, so this is an opaque string rather than a ULID.
/// Ordering is lexicographic and is used as the final scheduling tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(String);

impl NodeId {
    /// Validates and wraps a node identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdError::Empty);
        }
        if id.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(IdError::InvalidNodeId(id));
        }
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl serde::Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Broker Receipts
// =============================================================================

/// Lease token handed out with every dequeued evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(uuid::Uuid);

impl ReceiptHandle {
    /// Creates a fresh random handle.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parses a handle from its hyphenated UUID form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| IdError::InvalidReceiptHandle(e.to_string()))
    }
}

impl Default for ReceiptHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for ReceiptHandle {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ReceiptHandle {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_job_id_roundtrip() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("job_"));
    }

    #[test]
    fn test_execution_id_rejects_job_prefix() {
        let result: Result<ExecutionId, _> = "job_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), IdError::InvalidPrefix { .. }));
    }

    #[test]
    fn test_missing_separator_and_empty() {
        assert!(matches!(
            "eval01HV4Z2WQXKJNM8GPQY6VBKC3D".parse::<EvaluationId>(),
            Err(IdError::MissingSeparator)
        ));
        assert!(matches!("".parse::<EvaluationId>(), Err(IdError::Empty)));
        assert!(matches!(
            "eval_nope".parse::<EvaluationId>(),
            Err(IdError::InvalidUlid(_))
        ));
    }

    #[test]
    fn test_from_parts_is_deterministic() {
        let a = ExecutionId::from_parts(1_700_000_000_000, 42);
        let b = ExecutionId::from_parts(1_700_000_000_000, 42);
        let c = ExecutionId::from_parts(1_700_000_000_000, 43);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.timestamp_ms(), 1_700_000_000_000);
    }

    #[test]
    fn test_short_and_prefix_matching() {
        let id = ExecutionId::new();
        let short = id.short();
        assert!(short.starts_with("exec_"));
        assert_eq!(short.len(), "exec_".len() + crate::SHORT_ID_LEN);
        assert!(id.matches_prefix(&short));
        assert!(id.matches_prefix(&id.ulid().to_string()[..4]));
        assert!(!id.matches_prefix("job_"));
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let first = EvaluationId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = EvaluationId::new();
        assert!(first < second);
    }

    #[test]
    fn test_node_id_validation() {
        assert!(NodeId::new("node-a").is_ok());
        assert!(matches!(NodeId::new(""), Err(IdError::Empty)));
        assert!(matches!(NodeId::new("bad node"), Err(IdError::InvalidNodeId(_))));
        assert!(matches!(NodeId::new("a/b"), Err(IdError::InvalidNodeId(_))));
        let parsed: Result<NodeId, _> = serde_json::from_str("\"has space\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_receipt_handle_json_roundtrip() {
        let handle = ReceiptHandle::new();
        let json = serde_json::to_string(&handle).unwrap();
        let parsed: ReceiptHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(handle, parsed);
        assert!(ReceiptHandle::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = [JobId::PREFIX, ExecutionId::PREFIX, EvaluationId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn prop_job_id_parse_matches_display(ts in 0u64..(1u64 << 48), rand in any::<u64>()) {
            let id = JobId::from_parts(ts, u128::from(rand));
            let parsed = JobId::parse(&id.to_string()).unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
