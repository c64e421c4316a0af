//! Common types used throughout AnchorSync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a content digest in bytes (SHA-256).
pub const DIGEST_LENGTH: usize = 32;

/// Content digest of a file blob.
///
/// Serialized as a lowercase hex string, which is also the form the
/// remote store uses in listings and query parameters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest([u8; DIGEST_LENGTH]);

impl Digest {
    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse a hex encoded digest.
    ///
    /// # Errors
    /// - Returns error if the string is not valid hex or has the wrong length
    pub fn from_hex(hex_str: &str) -> crate::Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid digest '{}': {}", hex_str, e)))?;
        let bytes: [u8; DIGEST_LENGTH] = bytes.try_into().map_err(|_| {
            crate::Error::InvalidInput(format!(
                "Digest must be {} bytes: '{}'",
                DIGEST_LENGTH, hex_str
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }

    /// Lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

impl TryFrom<String> for Digest {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_hex()
    }
}

/// Identity of one logical record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub table: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.id)
    }
}

/// Advisory zone check: a missing zone on either side matches anything.
pub fn zone_matches(scope: Option<&str>, zone: Option<&str>) -> bool {
    match (scope, zone) {
        (Some(scope), Some(zone)) => scope == zone,
        _ => true,
    }
}
