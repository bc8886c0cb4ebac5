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

//! Event content types for encrypted events, room keys and room key
//! requests.

use std::collections::BTreeMap;

use lattice_common::{DeviceId, RoomId, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{megolm::MegolmMessage, olm::OlmMessage};

use super::EventEncryptionAlgorithm;

/// The content of an `m.room.encrypted` event, tagged by its algorithm.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "algorithm")]
pub enum EncryptedEventContent {
    /// A pairwise encrypted event, usually sent device to device.
    #[serde(rename = "m.olm.v1.curve25519-aes-sha2")]
    OlmV1Curve25519AesSha2(OlmV1Content),
    /// A group encrypted room event.
    #[serde(rename = "m.megolm.v1.aes-sha2")]
    MegolmV1AesSha2(MegolmV1Content),
}

impl EncryptedEventContent {
    /// The algorithm the content was encrypted with.
    pub fn algorithm(&self) -> EventEncryptionAlgorithm {
        match self {
            Self::OlmV1Curve25519AesSha2(_) => EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            Self::MegolmV1AesSha2(_) => EventEncryptionAlgorithm::MegolmV1AesSha2,
        }
    }
}

/// The content of a pairwise encrypted event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmV1Content {
    /// The curve25519 identity key of the sending device.
    pub sender_key: String,
    /// Per-recipient ciphertexts, keyed by the recipient's curve25519 key.
    pub ciphertext: BTreeMap<String, OlmMessage>,
}

/// The content of a group encrypted room event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmV1Content {
    /// The curve25519 identity key of the sending device.
    pub sender_key: String,
    /// The id of the sending device.
    pub device_id: DeviceId,
    /// The id of the group session that produced the ciphertext.
    pub session_id: String,
    /// The encrypted payload.
    pub ciphertext: MegolmMessage,
}

/// The plaintext payload carried inside a pairwise encrypted event.
///
/// The redundant sender and recipient fields bind the plaintext to its
/// envelope, so a server can't silently re-route the message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecryptedOlmPayload {
    /// The user that encrypted the payload.
    pub sender: UserId,
    /// The signing keys of the sender.
    pub keys: BTreeMap<String, String>,
    /// The user the payload was encrypted for.
    pub recipient: UserId,
    /// The signing keys of the intended recipient.
    pub recipient_keys: BTreeMap<String, String>,
    /// The type of the carried event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the carried event.
    pub content: Value,
}

/// The content of an `m.room_key` event, carrying a group session key to
/// another device over a pairwise channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// The algorithm the carried key is for.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room the group session is bound to.
    pub room_id: RoomId,
    /// The id of the group session.
    pub session_id: String,
    /// The exported session key.
    pub session_key: String,
}

/// The action of a room key request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRequestAction {
    /// Ask other devices for a room key.
    #[serde(rename = "request")]
    Request,
    /// Withdraw a previously sent request.
    #[serde(rename = "request_cancellation")]
    CancelRequest,
}

/// Identifying information for the room key being requested.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomKeyRequestBody {
    /// The algorithm of the requested key.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room the key is bound to.
    pub room_id: RoomId,
    /// The curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The id of the requested group session.
    pub session_id: String,
}

/// The content of an `m.room_key_request` to-device event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    /// Whether this is a new request or a cancellation.
    pub action: KeyRequestAction,
    /// The device sending the request.
    pub requesting_device_id: DeviceId,
    /// A request id unique per requesting device, reused by the matching
    /// cancellation.
    pub request_id: TransactionId,
    /// What is being requested. Absent on cancellations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<RoomKeyRequestBody>,
}

impl RoomKeyRequestContent {
    /// Create the content for a new outgoing key request.
    pub fn new_request(
        body: RoomKeyRequestBody,
        requesting_device_id: DeviceId,
        request_id: TransactionId,
    ) -> Self {
        Self { action: KeyRequestAction::Request, requesting_device_id, request_id, body: Some(body) }
    }

    /// Create the content cancelling a previously sent request.
    pub fn new_cancellation(requesting_device_id: DeviceId, request_id: TransactionId) -> Self {
        Self { action: KeyRequestAction::CancelRequest, requesting_device_id, request_id, body: None }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn encrypted_content_is_tagged_by_algorithm() {
        let json = json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "sender_key": "zXT7QtSBpWrEHLNAo/ru0+7VHLEbNjkCR81vZLUvrlk",
            "device_id": "DEVICEID",
            "session_id": "bogus",
            "ciphertext": "bogus",
        });

        // An unparsable megolm ciphertext must fail to deserialize rather
        // than produce a content with a dangling ciphertext.
        serde_json::from_value::<EncryptedEventContent>(json).unwrap_err();
    }

    #[test]
    fn key_request_serialization() {
        let device_id = DeviceId::new("DEVICEID");
        let request_id = TransactionId::generate();
        let body = RoomKeyRequestBody {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: RoomId::parse("!room:example.org").unwrap(),
            sender_key: "sender_key".to_owned(),
            session_id: "session_id".to_owned(),
        };

        let content =
            RoomKeyRequestContent::new_request(body, device_id.clone(), request_id.clone());
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["action"], "request");
        assert_eq!(json["body"]["room_id"], "!room:example.org");

        let cancellation = RoomKeyRequestContent::new_cancellation(device_id, request_id);
        let json = serde_json::to_value(&cancellation).unwrap();
        assert_eq!(json["action"], "request_cancellation");
        assert!(json.get("body").is_none());
    }
}
