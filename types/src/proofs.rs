//! Proof types for validated content.
//!
//! These types enforce invariants at construction time. Once you hold a value,
//! you know it satisfies all required constraints.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A string that is never empty (or whitespace-only) after trimming.
///
/// Validation occurs at construction time, so all operations on an existing
/// `NonEmptyString` can assume the content is valid. Used for user and system
/// message content, where an empty turn is never meaningful.
///
/// # Serde
///
/// Serializes as a plain JSON string. Deserialization validates non-emptiness
/// and fails with an error if the string is empty or whitespace-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NonEmptyString(String);

#[derive(Debug, Error)]
#[error("message content must not be empty")]
pub struct EmptyStringError;

impl NonEmptyString {
    pub fn new(value: impl Into<String>) -> Result<Self, EmptyStringError> {
        let value = value.into();
        if value.trim().is_empty() {
            Err(EmptyStringError)
        } else {
            Ok(Self(value))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl TryFrom<String> for NonEmptyString {
    type Error = EmptyStringError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for NonEmptyString {
    type Error = EmptyStringError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

impl std::ops::Deref for NonEmptyString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<str> for NonEmptyString {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::NonEmptyString;

    #[test]
    fn rejects_empty_and_whitespace() {
        assert!(NonEmptyString::new("").is_err());
        assert!(NonEmptyString::new("   ").is_err());
        assert!(NonEmptyString::new("\n\t").is_err());
    }

    #[test]
    fn preserves_original_content() {
        let s = NonEmptyString::new("  padded  ").unwrap();
        assert_eq!(s.as_str(), "  padded  ");
    }

    #[test]
    fn try_from_str_validates() {
        assert!(NonEmptyString::try_from("ok").is_ok());
        assert!(NonEmptyString::try_from(" ").is_err());
    }
}
