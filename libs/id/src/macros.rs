//! Macros for defining typed ID types.

/// Number of ULID characters kept by `short()`.
pub const SHORT_ID_LEN: usize = 10;

/// Defines a ULID-backed ID with a fixed prefix.
///
/// The generated type provides:
/// - `new()` for a fresh, time-ordered ID
/// - `from_parts()` for IDs derived from a timestamp and a caller-supplied
///   random component (deterministic IDs)
/// - `parse()`, `Display` and `FromStr` for the `{prefix}_{ulid}` form
/// - `short()` and `matches_prefix()` for display and history filtering
/// - string-based `Serialize` / `Deserialize`
///
/// # Example
///
/// ```ignore
/// define_id!(JobId, "job");
///
/// let job_id = JobId::new();
/// let parsed: JobId = "job_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Creates a new ID with a fresh ULID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            /// Creates an ID from a millisecond timestamp and 80 bits of
            /// caller-provided randomness. Equal inputs give equal IDs.
            #[must_use]
            pub fn from_parts(timestamp_ms: u64, random: u128) -> Self {
                Self($crate::Ulid::from_parts(timestamp_ms, random))
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn ulid(&self) -> $crate::Ulid {
                self.0
            }

            /// Returns the timestamp portion of the ULID in milliseconds.
            #[must_use]
            pub fn timestamp_ms(&self) -> u64 {
                self.0.timestamp_ms()
            }

            /// Parses an ID from a string of the form `{prefix}_{ulid}`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let Some((prefix, ulid_str)) = s.split_once('_') else {
                    return Err($crate::IdError::MissingSeparator);
                };

                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                let ulid = ulid_str
                    .parse::<$crate::Ulid>()
                    .map_err(|e| $crate::IdError::InvalidUlid(e.to_string()))?;

                Ok(Self(ulid))
            }

            /// Abbreviated form for logs and tables, e.g. `exec_01HV4Z3MXN`.
            #[must_use]
            pub fn short(&self) -> String {
                let full = self.0.to_string();
                format!("{}_{}", Self::PREFIX, &full[..$crate::SHORT_ID_LEN])
            }

            /// Returns true if the canonical form starts with `prefix`.
            ///
            /// A bare ULID prefix (without the type prefix) also matches.
            #[must_use]
            pub fn matches_prefix(&self, prefix: &str) -> bool {
                let ulid = self.0.to_string();
                format!("{}_{}", Self::PREFIX, ulid).starts_with(prefix) || ulid.starts_with(prefix)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
