// Copyright 2024 The Lattice Project Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Identifier newtypes used throughout the lattice protocol.
//!
//! All identifiers are immutable, cheaply cloneable strings. The sigil-bearing
//! ones (`UserId`, `RoomId`) are validated on construction; the opaque ones
//! (`DeviceId`, `TransactionId`) accept any non-empty string.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An error describing why a string failed to parse as an identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    /// The identifier was empty.
    #[error("the identifier is empty")]
    Empty,
    /// The identifier is missing its leading sigil character.
    #[error("the identifier is missing the leading {0:?} sigil")]
    MissingSigil(char),
    /// The identifier is missing the `:server.name` part.
    #[error("the identifier is missing a server name")]
    MissingServerName,
}

macro_rules! opaque_identifier {
    ($(#[doc = $doc:literal])* $name:ident) => {
        $(#[doc = $doc])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Create a new identifier from the given string.
            pub fn new(id: impl AsRef<str>) -> Self {
                Self(id.as_ref().into())
            }

            /// The identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", self.as_str())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self::new(id)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                String::deserialize(deserializer).map(Self::new)
            }
        }
    };
}

opaque_identifier! {
    /// The identifier of a single device belonging to a user.
    DeviceId
}

opaque_identifier! {
    /// A client-generated transaction identifier, used to make requests
    /// idempotent across retries.
    TransactionId
}

opaque_identifier! {
    /// The name of a federation server, the part of a user id after the
    /// colon.
    ServerName
}

opaque_identifier! {
    /// The identifier of a user, e.g. `@alice:example.org`.
    UserId
}

opaque_identifier! {
    /// The identifier of a room, e.g. `!roomid:example.org`.
    RoomId
}

impl UserId {
    /// Parse a user id, checking the `@localpart:server.name` shape.
    pub fn parse(id: impl AsRef<str>) -> Result<Self, IdParseError> {
        let id = id.as_ref();
        validate_sigil(id, '@')?;
        Ok(Self::new(id))
    }

    /// The server this user is registered on.
    pub fn server_name(&self) -> ServerName {
        server_part(self.as_str())
    }
}

impl RoomId {
    /// Parse a room id, checking the `!opaque:server.name` shape.
    pub fn parse(id: impl AsRef<str>) -> Result<Self, IdParseError> {
        let id = id.as_ref();
        validate_sigil(id, '!')?;
        Ok(Self::new(id))
    }

    /// The server part of this room id.
    pub fn server_name(&self) -> ServerName {
        server_part(self.as_str())
    }
}

impl TransactionId {
    /// Generate a new random transaction id.
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        // A timestamp plus a random discriminator is unique enough for a
        // client-local transaction id and keeps them roughly sortable.
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let discriminator: u64 = rand::random();

        Self::new(format!("{}{discriminator:016x}", now.as_millis()))
    }
}

fn validate_sigil(id: &str, sigil: char) -> Result<(), IdParseError> {
    if id.is_empty() {
        Err(IdParseError::Empty)
    } else if !id.starts_with(sigil) {
        Err(IdParseError::MissingSigil(sigil))
    } else if !id[1..].contains(':') {
        Err(IdParseError::MissingServerName)
    } else {
        Ok(())
    }
}

fn server_part(id: &str) -> ServerName {
    let name = id.split_once(':').map(|(_, server)| server).unwrap_or(id);
    ServerName::new(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_parsing() {
        let user = UserId::parse("@alice:example.org").unwrap();
        assert_eq!(user.as_str(), "@alice:example.org");
        assert_eq!(user.server_name().as_str(), "example.org");

        assert_eq!(UserId::parse(""), Err(IdParseError::Empty));
        assert_eq!(UserId::parse("alice:example.org"), Err(IdParseError::MissingSigil('@')));
        assert_eq!(UserId::parse("@alice"), Err(IdParseError::MissingServerName));
    }

    #[test]
    fn room_id_parsing() {
        let room = RoomId::parse("!room:example.org").unwrap();
        assert_eq!(room.server_name().as_str(), "example.org");
        assert_eq!(RoomId::parse("room:example.org"), Err(IdParseError::MissingSigil('!')));
    }

    #[test]
    fn serde_round_trip() {
        let user = UserId::new("@bob:example.org");
        let json = serde_json::to_string(&user).unwrap();
        assert_eq!(json, "\"@bob:example.org\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(user, back);
    }

    #[test]
    fn transaction_ids_are_unique() {
        let a = TransactionId::generate();
        let b = TransactionId::generate();
        assert_ne!(a, b);
    }
}
