//! Strongly-typed identifiers used across the domain.
//!
//! Ids are opaque prefixed strings (≤60 chars) backed by UUIDv7 so they sort
//! roughly by creation time. `UserKey` is the caller-supplied identity the
//! core treats as opaque; only its minimum length is enforced.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Maximum length of any entity identifier.
pub const MAX_ID_LEN: usize = 60;

/// Minimum length of a user key.
pub const MIN_USER_KEY_LEN: usize = 10;

macro_rules! impl_prefixed_id {
    ($t:ident, $prefix:literal, $name:literal) => {
        /// Opaque, globally unique identifier.
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(String);

        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing ids explicitly in
            /// tests for determinism.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.is_empty() || s.len() > MAX_ID_LEN {
                    return Err(DomainError::invalid_id(format!(
                        "{}: must be 1..={} chars",
                        $name, MAX_ID_LEN
                    )));
                }
                Ok(Self(s.to_string()))
            }
        }
    };
}

impl_prefixed_id!(JobId, "job", "JobId");
impl_prefixed_id!(BookId, "book", "BookId");
impl_prefixed_id!(CharacterId, "char", "CharacterId");

/// Caller-supplied user identity. Opaque to the core; stronger
/// authentication is the request tier's concern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserKey(String);

impl UserKey {
    pub fn new(key: impl Into<String>) -> Result<Self, DomainError> {
        let key = key.into();
        if key.len() < MIN_USER_KEY_LEN {
            return Err(DomainError::validation(format!(
                "user key must be at least {MIN_USER_KEY_LEN} chars"
            )));
        }
        if key.len() > 80 {
            return Err(DomainError::validation("user key must be at most 80 chars"));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for UserKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for UserKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
