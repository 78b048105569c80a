//! Identifier newtypes
//!
//! Keys are plain strings in the compiled program; newtypes keep the
//! different namespaces from mixing at API boundaries.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl $name {
            /// Borrow the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Unique identifier for a program node
    NodeKey
}

string_id! {
    /// Name of an input or output parameter on a node
    ParamName
}

string_id! {
    /// Unique identifier for a sequence
    SequenceKey
}

string_id! {
    /// Unique identifier for a stage within a sequence
    StageKey
}
