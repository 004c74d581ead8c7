//! Common types used throughout the SFU control plane

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a peer. Server-assigned, one per connection.
    PeerId
);

string_id!(
    /// Unique identifier for a room
    RoomId
);

string_id!(
    /// Transport identifier issued by the media engine
    TransportId
);

string_id!(
    /// Producer identifier issued by the media engine
    ProducerId
);

string_id!(
    /// Consumer identifier issued by the media engine
    ConsumerId
);

/// Longest room id a client may choose for itself
pub const MAX_ROOM_ID_LEN: usize = 64;

impl RoomId {
    /// Generate a fresh server-side room id
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }

    /// Check a client-supplied room id (meeting code)
    pub fn validate(&self) -> Result<(), String> {
        if self.0.is_empty() {
            return Err("room id must not be empty".to_string());
        }
        if self.0.len() > MAX_ROOM_ID_LEN {
            return Err(format!("room id longer than {MAX_ROOM_ID_LEN} characters"));
        }
        if !self
            .0
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err("room id may only contain ASCII letters, digits, '-' and '_'".to_string());
        }
        Ok(())
    }
}

impl PeerId {
    /// Generate a fresh peer id for a new connection
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

/// Media kind of a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Which side of a peer's media a transport carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to server: carries the peer's producers
    Producer,
    /// Server to client: carries the peer's consumers
    Consumer,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Producer => f.write_str("producer"),
            Self::Consumer => f.write_str("consumer"),
        }
    }
}
