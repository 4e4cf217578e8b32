//! Participant identity
//!
//! Calls are keyed by the two participants' identifiers, so an identifier
//! must be usable as one half of a [`CallId`](crate::types::CallId). The
//! call-id separator is therefore not allowed inside a [`UserId`].

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error;

/// Separator used when joining two user identifiers into a call identifier
pub const CALL_ID_SEPARATOR: char = '_';

/// Maximum length of a user identifier
const MAX_USER_ID_LENGTH: usize = 128;

/// Identity validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Empty identifier
    #[error("User id cannot be empty")]
    Empty,

    /// Identifier contains the call-id separator
    #[error("User id {0:?} contains the reserved separator '_'")]
    ReservedSeparator(String),

    /// Identifier is too long
    #[error("User id exceeds 128 bytes")]
    TooLong,
}

/// Identifier of a call participant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Create a validated user identifier
    ///
    /// # Errors
    ///
    /// Returns error if the identifier is empty, too long, or contains `_`
    pub fn new(s: impl Into<String>) -> Result<Self, IdentityError> {
        let s = s.into();
        if s.trim().is_empty() {
            return Err(IdentityError::Empty);
        }
        if s.len() > MAX_USER_ID_LENGTH {
            return Err(IdentityError::TooLong);
        }
        if s.contains(CALL_ID_SEPARATOR) {
            return Err(IdentityError::ReservedSeparator(s));
        }
        Ok(Self(s))
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for UserId {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<&str> for UserId {
    type Error = IdentityError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}
