//! Configured session identity
//!
//! The identity is a canonical version-4 UUID string
//! (`xxxxxxxx-xxxx-4xxx-[89ab]xxx-xxxxxxxxxxxx`, hex digits in either case).
//! Its 16 raw bytes are what clients present as the session token.

use uuid::{Uuid, Variant};

use crate::error::{RelayError, Result};

/// Length of the hyphenated textual form
const IDENTITY_STR_LEN: usize = 36;

/// Byte offsets of the dashes in the hyphenated form (8-4-4-4-12)
const DASH_POSITIONS: [usize; 4] = [8, 13, 18, 23];

/// Process-wide accepted identity, immutable after startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    uuid: Uuid,
}

impl Identity {
    /// Parse and validate a configured identity
    pub fn parse(s: &str) -> Result<Self> {
        if !is_valid_identity(s) {
            return Err(RelayError::Config(format!("uuid is not valid: {:?}", s)));
        }
        let uuid =
            Uuid::parse_str(s).map_err(|e| RelayError::Config(format!("uuid parse: {}", e)))?;
        Ok(Self { uuid })
    }

    /// Raw 16 token bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.uuid.as_bytes()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uuid.hyphenated())
    }
}

/// Check a candidate against the canonical identity grammar
///
/// Only the 36-character hyphenated form is accepted; the braced, URN and
/// simple forms that `Uuid::parse_str` tolerates are rejected here.
pub fn is_valid_identity(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != IDENTITY_STR_LEN {
        return false;
    }

    for (i, b) in bytes.iter().enumerate() {
        let ok = if DASH_POSITIONS.contains(&i) {
            *b == b'-'
        } else {
            b.is_ascii_hexdigit()
        };
        if !ok {
            return false;
        }
    }

    match Uuid::parse_str(s) {
        Ok(uuid) => uuid.get_version_num() == 4 && uuid.get_variant() == Variant::RFC4122,
        Err(_) => false,
    }
}
