//! Identifier types shared by the SFU control plane and its signaling protocol.
//!
//! Client-chosen identifiers (`RoomId`, `PeerId`) are validated strings.
//! Engine-allocated identifiers are random UUIDs. All of them serialize as
//! plain strings so they can be used directly in JSON signaling payloads.

use crate::error::IdError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum length of a client-chosen identifier.
pub const MAX_ID_LEN: usize = 64;

fn validate_external_id(value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }
    if value.chars().count() > MAX_ID_LEN {
        return Err(IdError::TooLong { max: MAX_ID_LEN });
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(IdError::InvalidCharacter(c));
    }
    Ok(())
}

/// Identifier of a room, chosen by the first client to join it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Validate and wrap a client-supplied room identifier.
    ///
    /// # Errors
    ///
    /// Returns [`IdError`] if the value is empty, longer than [`MAX_ID_LEN`],
    /// or contains characters outside `[A-Za-z0-9_-]`.
    pub fn parse(value: &str) -> Result<Self, IdError> {
        validate_external_id(value)?;
        Ok(Self(value.to_string()))
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a peer (one signaling connection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh random peer identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Validate and wrap a client-supplied peer identifier.
    ///
    /// # Errors
    ///
    /// Same rules as [`RoomId::parse`].
    pub fn parse(value: &str) -> Result<Self, IdError> {
        validate_external_id(value)?;
        Ok(Self(value.to_string()))
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Index of a media worker within the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Declares a UUID-backed identifier allocated by the media engine.
macro_rules! engine_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

engine_id!(
    /// Identifier of a router (one per room).
    RouterId
);
engine_id!(
    /// Identifier of a WebRTC transport.
    TransportId
);
engine_id!(
    /// Identifier of a producer (outbound media track).
    ProducerId
);
engine_id!(
    /// Identifier of a consumer (inbound media track).
    ConsumerId
);
