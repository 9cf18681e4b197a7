//! Strongly typed entity identifiers.
//!
//! Every id wraps an opaque string. Fresh ids are random UUIDs; ids coming
//! from the external datastore are carried through unchanged.

use serde::{Deserialize, Serialize};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random id.
            pub fn new() -> Self {
                $name(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

entity_id!(
    /// Project (tenant) identifier
    ProjectId
);
entity_id!(CommitId);
entity_id!(AreaId);
entity_id!(FileId);
entity_id!(TestId);
entity_id!(
    /// Test suite identifier
    SuiteId
);
entity_id!(TestRunId);
entity_id!(
    /// Identifier of a single test-run result row
    ResultId
);
entity_id!(DefectId);
entity_id!(
    /// Background job identifier returned by `JobQueue::enqueue`
    JobId
);
