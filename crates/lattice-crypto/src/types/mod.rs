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

//! Wire types for device keys and one-time keys, and the canonical JSON
//! signing helpers that secure them.

use std::{collections::BTreeMap, fmt};

use lattice_common::{DeviceId, UserId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};

use crate::error::SignatureError;

pub mod events;

/// An encryption algorithm understood by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventEncryptionAlgorithm {
    /// Pairwise double-ratchet encryption between two devices.
    OlmV1Curve25519AesSha2,
    /// Group ratchet encryption for room messages.
    MegolmV1AesSha2,
    /// An algorithm we don't know. Kept verbatim so it round-trips through
    /// serialization, but the registry refuses to dispatch on it.
    Unknown(String),
}

impl EventEncryptionAlgorithm {
    /// The wire name of the algorithm.
    pub fn as_str(&self) -> &str {
        match self {
            Self::OlmV1Curve25519AesSha2 => "m.olm.v1.curve25519-aes-sha2",
            Self::MegolmV1AesSha2 => "m.megolm.v1.aes-sha2",
            Self::Unknown(a) => a,
        }
    }
}

impl From<&str> for EventEncryptionAlgorithm {
    fn from(value: &str) -> Self {
        match value {
            "m.olm.v1.curve25519-aes-sha2" => Self::OlmV1Curve25519AesSha2,
            "m.megolm.v1.aes-sha2" => Self::MegolmV1AesSha2,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for EventEncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventEncryptionAlgorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventEncryptionAlgorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.as_str().into())
    }
}

/// The signed public identity keys of a device, as uploaded to and served by
/// the key directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The id of the user the device belongs to.
    pub user_id: UserId,
    /// The id of the device these keys belong to.
    pub device_id: DeviceId,
    /// The encryption algorithms the device supports.
    pub algorithms: Vec<EventEncryptionAlgorithm>,
    /// Public identity keys, keyed by `<algorithm>:<device_id>`.
    pub keys: BTreeMap<String, String>,
    /// Signatures over the canonical form of this object, keyed by user id
    /// and then by `ed25519:<device_id>`.
    pub signatures: BTreeMap<UserId, BTreeMap<String, String>>,
    /// Additional data added by intermediate servers, never signed.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub unsigned: Value,
}

impl DeviceKeys {
    /// The device's ed25519 signing key, if present and valid.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.keys
            .get(&format!("ed25519:{}", self.device_id))
            .and_then(|k| Ed25519PublicKey::from_base64(k).ok())
    }

    /// The device's curve25519 identity key, if present and valid.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.keys
            .get(&format!("curve25519:{}", self.device_id))
            .and_then(|k| Curve25519PublicKey::from_base64(k).ok())
    }
}

/// A curve25519 one-time key with a signature from the device's ed25519 key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedOneTimeKey {
    /// The unpadded base64 encoded curve25519 key.
    pub key: String,
    /// Signatures over the canonical form of this object.
    pub signatures: BTreeMap<UserId, BTreeMap<String, String>>,
}

/// Serialize a JSON object into its canonical signing form.
///
/// The `signatures` and `unsigned` fields are stripped and the remaining keys
/// serialized in lexicographic order with no insignificant whitespace.
pub fn canonical_json(mut value: Value) -> Result<String, SignatureError> {
    let object = value.as_object_mut().ok_or(SignatureError::NotAnObject)?;
    object.remove("signatures");
    object.remove("unsigned");

    // Re-building through BTreeMap sorts the keys; serde_json emits objects
    // without whitespace by default.
    let canonical: BTreeMap<String, Value> =
        serde_json::from_value(Value::Object(object.clone()))?;

    Ok(serde_json::to_string(&canonical)?)
}

/// Check a signature over the canonical form of the given JSON object.
///
/// `key_id` is the short key identifier, e.g. `ed25519:<device_id>`.
pub fn verify_signed_json(
    signing_key: &Ed25519PublicKey,
    signer: &UserId,
    key_id: &str,
    value: &Value,
) -> Result<(), SignatureError> {
    let signature = value
        .get("signatures")
        .and_then(|s| s.get(signer.as_str()))
        .and_then(|s| s.get(key_id))
        .and_then(Value::as_str)
        .ok_or(SignatureError::NoSignatureFound)?;
    let signature = Ed25519Signature::from_base64(signature)
        .map_err(|_| SignatureError::InvalidSignature)?;

    let canonical = canonical_json(value.clone())?;

    Ok(signing_key.verify(canonical.as_bytes(), &signature)?)
}

#[cfg(test)]
mod tests {
    use lattice_common::UserId;
    use serde_json::{json, Value};
    use vodozemac::olm::Account;

    use super::{canonical_json, verify_signed_json, EventEncryptionAlgorithm};

    #[test]
    fn algorithm_round_trip() {
        let algorithm: EventEncryptionAlgorithm = "m.megolm.v1.aes-sha2".into();
        assert_eq!(algorithm, EventEncryptionAlgorithm::MegolmV1AesSha2);

        let json = serde_json::to_value(&algorithm).unwrap();
        assert_eq!(json, Value::String("m.megolm.v1.aes-sha2".to_owned()));

        let unknown: EventEncryptionAlgorithm = "m.fancy.new".into();
        assert_eq!(unknown.as_str(), "m.fancy.new");
    }

    #[test]
    fn canonical_form_strips_and_sorts() {
        let value = json!({
            "b": 1,
            "a": {"z": true, "y": false},
            "signatures": {"@alice:example.org": {}},
            "unsigned": {"age": 5},
        });

        let canonical = canonical_json(value).unwrap();
        assert_eq!(canonical, r#"{"a":{"y":false,"z":true},"b":1}"#);
    }

    #[test]
    fn signature_verification() {
        let account = Account::new();
        let user_id = UserId::parse("@alice:example.org").unwrap();

        let mut value = json!({"key": "value", "nested": {"x": 0}});
        let canonical = canonical_json(value.clone()).unwrap();
        let signature = account.sign(canonical.as_bytes());

        value["signatures"] = json!({
            user_id.as_str(): { "ed25519:DEVICEID": signature.to_base64() }
        });

        verify_signed_json(&account.ed25519_key(), &user_id, "ed25519:DEVICEID", &value)
            .unwrap();

        // Tampering with the payload must break the signature.
        value["key"] = "other".into();
        verify_signed_json(&account.ed25519_key(), &user_id, "ed25519:DEVICEID", &value)
            .unwrap_err();
    }
}
