//! Identifier newtypes used across the storage, command and session layers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

macro_rules! uuid_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Return the underlying UUID.
            #[must_use]
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|source| CoreError::InvalidId {
                        value: s.to_string(),
                        source,
                    })
            }
        }
    };
}

uuid_newtype!(SessionId, "Identifies a code-generation session (propose/audit/refine/commit).");
uuid_newtype!(BlockId, "Identifies one code block within a session.");
uuid_newtype!(WorkerId, "Identifies a single running worker process instance.");

/// A lowercase hex-encoded SHA-256 digest, used as the idempotency ledger key
/// and as the command registry's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandHash(String);

impl CommandHash {
    /// Hash a single piece of content (e.g. a shell command string).
    #[must_use]
    pub fn of(content: &str) -> Self {
        Self(hex::encode(Sha256::digest(content.as_bytes())))
    }

    /// Hash the concatenation of several fields, joined by `\u{1f}` (unit
    /// separator) so that no field boundary can be forged by crafting input.
    ///
    /// Used for the per-block idempotency key:
    /// `SHA-256(session_id` \u{1f} `block_id` \u{1f} `final_code)`.
    #[must_use]
    pub fn of_fields(fields: &[&str]) -> Self {
        let joined = fields.join("\u{1f}");
        Self::of(&joined)
    }

    /// Parse a 64-character lowercase hex digest.
    pub fn parse(value: impl Into<String>) -> CoreResult<Self> {
        let value = value.into();
        if value.len() != 64 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CoreError::InvalidCommandHash(value));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    /// Borrow the hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_round_trips_through_display_and_from_str() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn command_hash_is_deterministic() {
        let a = CommandHash::of("ls -la");
        let b = CommandHash::of("ls -la");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn command_hash_of_fields_differs_from_naive_concat() {
        // "ab" + "c" and "a" + "bc" must not collide once the separator is used.
        let a = CommandHash::of_fields(&["ab", "c"]);
        let b = CommandHash::of_fields(&["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn command_hash_rejects_malformed_input() {
        assert!(CommandHash::parse("not-hex").is_err());
        assert!(CommandHash::parse("a".repeat(63)).is_err());
        let valid = CommandHash::of("echo hi").to_string();
        assert!(CommandHash::parse(valid).is_ok());
    }
}
