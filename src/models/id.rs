use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error(
    "Invalid id {value:?}: ids must be a single path segment (no '/', '\\\\', NUL, '.' or '..')"
)]
pub struct IdError {
    value: String,
}

/// Locally assigned identifier for users and bank connections.
///
/// Ids double as directory names in `JsonFileStorage`, so anything built from
/// outside input goes through [`Id::from_string_checked`] or [`Id::from_external`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    const NAMESPACE: Uuid = Uuid::from_u128(0x9c1f_52a4_7e0b_4d8e_a3c6_1b2d_5f60_e7a9);

    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_string_checked(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        if Self::is_path_safe(&value) {
            Ok(Self(value))
        } else {
            Err(IdError { value })
        }
    }

    /// Deterministic, path-safe id derived from a provider identifier.
    pub fn from_external(value: &str) -> Self {
        Self(Uuid::new_v5(&Self::NAMESPACE, value.as_bytes()).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_path_safe(value: &str) -> bool {
        if value.is_empty() || value == "." || value == ".." {
            return false;
        }
        !value.chars().any(|c| c == '/' || c == '\\' || c == '\0')
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_ids_are_stable_and_path_safe() {
        let first = Id::from_external("acc/with/slashes");
        let second = Id::from_external("acc/with/slashes");
        assert_eq!(first, second);
        assert!(Id::is_path_safe(first.as_str()));
        assert_ne!(first, Id::from_external("acc/other"));
    }

    #[test]
    fn checked_constructor_rejects_unsafe_values() {
        assert!(Id::from_string_checked("user-1").is_ok());
        for bad in ["", ".", "..", "../escape", "a/b", "a\\b", "nul\0"] {
            assert!(Id::from_string_checked(bad).is_err(), "{bad:?} accepted");
        }
    }
}
