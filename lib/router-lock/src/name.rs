//! Lock name validation
//!
//! Lock names become part of a storage object name, so they follow the
//! storage service's naming rules: lowercase alphanumeric groups joined by
//! single hyphens. The length ceiling is the service's 63 character limit
//! minus [`OBJECT_PREFIX`].

use std::fmt;
use thiserror::Error;

/// Prefix of every lock object name inside the lock container
pub const OBJECT_PREFIX: &str = "azlk-";

pub const MIN_NAME_LEN: usize = 3;
pub const MAX_NAME_LEN: usize = 58;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("lock name {name} must be at least {MIN_NAME_LEN} characters long")]
    TooShort { name: String },

    #[error("lock name {name} must be at most {MAX_NAME_LEN} characters long")]
    TooLong { name: String },

    #[error("lock name {name} contains {ch:?} at {index}, only a-z, 0-9 and '-' are allowed")]
    InvalidCharacter { name: String, ch: char, index: usize },

    #[error("lock name {name} must not start with '-'")]
    LeadingHyphen { name: String },

    #[error("lock name {name} must not end with '-'")]
    TrailingHyphen { name: String },

    #[error("lock name {name} must not contain consecutive '-'")]
    ConsecutiveHyphens { name: String },
}

/// A validated, lowercase lock name
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockName(String);

impl LockName {
    /// Normalize `name` to lowercase and validate it
    pub fn parse(name: &str) -> Result<Self, NameError> {
        let normalized = name.to_lowercase();
        check(&normalized)?;
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the placeholder object whose lease backs this lock
    pub fn object_name(&self) -> String {
        format!("{}{}", OBJECT_PREFIX, self.0)
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check whether `name` is usable as a lock name
pub fn validate(name: &str) -> Result<(), NameError> {
    check(&name.to_lowercase())
}

fn check(name: &str) -> Result<(), NameError> {
    let owned = || name.to_string();

    if name.len() < MIN_NAME_LEN {
        return Err(NameError::TooShort { name: owned() });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong { name: owned() });
    }

    if let Some((index, ch)) = name
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(NameError::InvalidCharacter { name: owned(), ch, index });
    }

    if name.starts_with('-') {
        return Err(NameError::LeadingHyphen { name: owned() });
    }
    if name.ends_with('-') {
        return Err(NameError::TrailingHyphen { name: owned() });
    }
    if name.contains("--") {
        return Err(NameError::ConsecutiveHyphens { name: owned() });
    }

    Ok(())
}
