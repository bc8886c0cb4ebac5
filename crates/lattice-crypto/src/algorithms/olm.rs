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

use std::collections::BTreeMap;

use lattice_common::{RoomId, UserId};
use serde_json::Value;
use tracing::{instrument, warn};

use super::{encryption_failure, AlgorithmRegistry};
use crate::{
    error::{EncryptionError, EventError, OlmResult},
    session_manager::{DecryptedToDevice, SessionManager},
    types::{events::OlmV1Content, EventEncryptionAlgorithm},
};

/// Pairwise encryption of room events, one ciphertext per member device.
///
/// Only practical for small rooms; group encryption exists precisely because
/// this scales with the device count. Kept because rooms configured with the
/// pairwise algorithm must honor it.
#[derive(Debug)]
pub(crate) struct OlmRoomEncryptor {
    room_id: RoomId,
    registry: AlgorithmRegistry,
}

impl OlmRoomEncryptor {
    pub fn new(room_id: RoomId, registry: AlgorithmRegistry) -> Self {
        Self { room_id, registry }
    }

    #[instrument(skip(self, content), fields(room_id = self.room_id.as_str()))]
    pub async fn encrypt(
        &self,
        event_type: &str,
        content: Value,
    ) -> Result<OlmV1Content, EncryptionError> {
        let algorithm = EventEncryptionAlgorithm::OlmV1Curve25519AesSha2;

        let targets = self.registry.collect_target_devices(&self.room_id).await?;
        let targets = self
            .registry
            .ensure_sessions(&targets)
            .await
            .map_err(|e| encryption_failure(algorithm.clone(), &e))?;

        // The room binding lives inside the encrypted payload, the decrypting
        // side checks it against the room the event arrived in.
        let mut payload = content;
        if let Some(object) = payload.as_object_mut() {
            object.insert("room_id".to_owned(), Value::String(self.room_id.to_string()));
        }

        let mut ciphertext = BTreeMap::new();

        for device in &targets {
            match self
                .registry
                .sessions
                .encrypt_to_device(device, event_type, payload.clone())
                .await
            {
                Ok(content) => {
                    ciphertext.extend(content.ciphertext);
                }
                Err(e) => {
                    warn!(
                        user_id = device.user_id().as_str(),
                        device_id = device.device_id().as_str(),
                        error = %e,
                        "couldn't encrypt the room event for the device"
                    );
                }
            }
        }

        if ciphertext.is_empty() {
            return Err(encryption_failure(
                algorithm,
                &"no target device could be encrypted for",
            ));
        }

        Ok(OlmV1Content {
            sender_key: self.registry.sessions.own_identity_keys().curve25519.to_base64(),
            ciphertext,
        })
    }
}

/// Pairwise decryption, for to-device events and for rooms bound to the
/// pairwise algorithm.
#[derive(Debug)]
pub(crate) struct OlmDecryptor {
    room_id: Option<RoomId>,
    sessions: SessionManager,
}

impl OlmDecryptor {
    pub fn new(room_id: Option<RoomId>, sessions: SessionManager) -> Self {
        Self { room_id, sessions }
    }

    pub async fn decrypt(
        &self,
        sender: &UserId,
        content: &OlmV1Content,
    ) -> OlmResult<DecryptedToDevice> {
        let decrypted = self.sessions.decrypt_to_device(sender, content).await?;

        // For room events the payload must name the room it was sent to.
        if let Some(room_id) = &self.room_id {
            let payload_room = decrypted
                .payload
                .content
                .get("room_id")
                .and_then(Value::as_str)
                .ok_or(EventError::MissingField("room_id"))?;

            if payload_room != room_id.as_str() {
                return Err(EventError::MismatchedRoom {
                    expected: room_id.clone(),
                    actual: RoomId::parse(payload_room).ok(),
                }
                .into());
            }
        }

        Ok(decrypted)
    }
}
