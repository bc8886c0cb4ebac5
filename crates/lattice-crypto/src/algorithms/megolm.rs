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

use lattice_common::{DeviceId, RoomId};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::{encryption_failure, AlgorithmRegistry};
use crate::{
    error::{EncryptionError, MegolmError, MegolmResult},
    gossiping::OutgoingKeyRequestManager,
    network::ToDeviceRequest,
    olm::OutboundGroupSession,
    session_manager::{DecryptedGroupEvent, SessionManager},
    types::{
        events::{EncryptedEventContent, MegolmV1Content, RoomKeyRequestBody},
        EventEncryptionAlgorithm,
    },
};

/// Group encryption for a single room.
#[derive(Debug)]
pub(crate) struct MegolmEncryptor {
    room_id: RoomId,
    registry: AlgorithmRegistry,
}

impl MegolmEncryptor {
    pub fn new(room_id: RoomId, registry: AlgorithmRegistry) -> Self {
        Self { room_id, registry }
    }

    /// Encrypt a room event.
    ///
    /// Makes sure a fresh-enough outbound session exists and that its key
    /// reached every target device before any ciphertext is produced.
    #[instrument(skip(self, content), fields(room_id = self.room_id.as_str()))]
    pub async fn encrypt(
        &self,
        event_type: &str,
        content: Value,
    ) -> Result<MegolmV1Content, EncryptionError> {
        let targets = self.registry.collect_target_devices(&self.room_id).await?;
        let session = self.ensure_outbound_session().await?;

        let to_share: Vec<_> = targets
            .iter()
            .filter(|d| !session.is_shared_with(d.user_id(), d.device_id()))
            .cloned()
            .collect();

        if !to_share.is_empty() {
            let ready = self
                .registry
                .ensure_sessions(&to_share)
                .await
                .map_err(|e| encryption_failure(self.algorithm(), &e))?;

            self.share_room_key(&session, &ready).await?;
        }

        self.registry
            .sessions
            .encrypt_group_message(&session, event_type, content)
            .await
            .map_err(|e| encryption_failure(self.algorithm(), &e))
    }

    fn algorithm(&self) -> EventEncryptionAlgorithm {
        EventEncryptionAlgorithm::MegolmV1AesSha2
    }

    /// The room's active outbound session, rotating it when it hit its age
    /// or message limit.
    async fn ensure_outbound_session(
        &self,
    ) -> Result<OutboundGroupSession, EncryptionError> {
        if let Some(session) = self.registry.sessions.outbound_group_session(&self.room_id) {
            return Ok(session);
        }

        self.registry
            .sessions
            .create_outbound_group_session(
                &self.room_id,
                self.registry.encryption_settings.clone(),
            )
            .await
            .map_err(|e| encryption_failure(self.algorithm(), &e))
    }

    /// Deliver the session key to the given devices over their pairwise
    /// channels, in a single to-device batch.
    async fn share_room_key(
        &self,
        session: &OutboundGroupSession,
        devices: &[crate::identities::DeviceIdentity],
    ) -> Result<(), EncryptionError> {
        let room_key = serde_json::to_value(session.as_room_key_content().await)
            .map_err(|e| encryption_failure(self.algorithm(), &e))?;

        let mut messages: BTreeMap<_, BTreeMap<DeviceId, Value>> = BTreeMap::new();
        let mut shared = Vec::new();

        for device in devices {
            let encrypted = match self
                .registry
                .sessions
                .encrypt_to_device(device, "m.room_key", room_key.clone())
                .await
            {
                Ok(encrypted) => encrypted,
                Err(e) => {
                    warn!(
                        user_id = device.user_id().as_str(),
                        device_id = device.device_id().as_str(),
                        error = %e,
                        "couldn't encrypt the room key for the device"
                    );
                    continue;
                }
            };

            let content =
                serde_json::to_value(EncryptedEventContent::OlmV1Curve25519AesSha2(encrypted))
                    .map_err(|e| encryption_failure(self.algorithm(), &e))?;

            messages
                .entry(device.user_id().clone())
                .or_default()
                .insert(device.device_id().clone(), content);
            shared.push((device.user_id().clone(), device.device_id().clone()));
        }

        if messages.is_empty() {
            return Ok(());
        }

        self.registry
            .network
            .send_to_device(ToDeviceRequest::new("m.room.encrypted", messages))
            .await
            .map_err(|e| encryption_failure(self.algorithm(), &e))?;

        debug!(
            session_id = session.session_id(),
            devices = shared.len(),
            "shared the room key"
        );
        session.mark_shared_with(shared);

        Ok(())
    }
}

/// Group decryption for a single room.
#[derive(Debug)]
pub(crate) struct MegolmDecryptor {
    room_id: RoomId,
    sessions: SessionManager,
    key_requests: OutgoingKeyRequestManager,
}

impl MegolmDecryptor {
    pub fn new(
        room_id: RoomId,
        sessions: SessionManager,
        key_requests: OutgoingKeyRequestManager,
    ) -> Self {
        Self { room_id, sessions, key_requests }
    }

    /// Decrypt a room event, asking our other devices for the room key when
    /// we don't hold it.
    pub async fn decrypt(&self, content: &MegolmV1Content) -> MegolmResult<DecryptedGroupEvent> {
        match self.sessions.decrypt_group_message(&self.room_id, content).await {
            Err(MegolmError::MissingRoomKey) => {
                self.request_missing_key(content).await;
                Err(MegolmError::MissingRoomKey)
            }
            result => result,
        }
    }

    async fn request_missing_key(&self, content: &MegolmV1Content) {
        let body = RoomKeyRequestBody {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: self.room_id.clone(),
            sender_key: content.sender_key.clone(),
            session_id: content.session_id.clone(),
        };
        // Ask our own other devices, they're the ones we'd trust with it.
        let recipients = BTreeMap::from([(
            self.sessions.own_user_id().clone(),
            vec![DeviceId::new("*")],
        )]);

        if let Err(e) = self.key_requests.request_key(body, recipients).await {
            warn!(
                session_id = content.session_id,
                error = %e,
                "couldn't queue a room key request"
            );
        }
    }
}
