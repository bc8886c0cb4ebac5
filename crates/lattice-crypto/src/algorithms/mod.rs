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

//! The algorithm registry and per-room crypto dispatch.
//!
//! The registry is closed-world: it knows the two supported algorithms and
//! refuses everything else. The dispatcher binds one encryptor per room and
//! one decryptor per `(room, algorithm)` pair; a binding never changes for
//! the lifetime of the engine.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock as StdRwLock,
    },
};

use lattice_common::{DeviceId, RoomId, UserId};
use serde_json::Value;
use tracing::warn;

use crate::{
    error::{EncryptionError, EventError, MegolmResult, OlmError, OlmResult},
    gossiping::OutgoingKeyRequestManager,
    identities::{DeviceIdentity, DeviceKeyDirectory},
    machine::MembershipSource,
    network::{KeysClaimRequest, NetworkClient},
    olm::EncryptionSettings,
    session_manager::{DecryptedGroupEvent, DecryptedToDevice, SessionManager},
    store::CryptoStore,
    types::{
        events::{EncryptedEventContent, MegolmV1Content, OlmV1Content},
        EventEncryptionAlgorithm,
    },
};

mod megolm;
mod olm;

pub(crate) use megolm::{MegolmDecryptor, MegolmEncryptor};
pub(crate) use olm::{OlmDecryptor, OlmRoomEncryptor};

/// Everything an encryptor or decryptor might need, bundled so the registry
/// can hand it out per room.
#[derive(Clone, Debug)]
pub(crate) struct AlgorithmRegistry {
    pub sessions: SessionManager,
    pub directory: DeviceKeyDirectory,
    pub store: Arc<dyn CryptoStore>,
    pub network: Arc<dyn NetworkClient>,
    pub membership: Arc<dyn MembershipSource>,
    pub key_requests: OutgoingKeyRequestManager,
    pub encryption_settings: EncryptionSettings,
    /// When set, encrypting for a room containing never-acknowledged
    /// devices fails instead of silently including them.
    pub block_on_unknown_devices: Arc<AtomicBool>,
}

/// A room-bound encryptor for one of the supported algorithms.
#[derive(Debug)]
pub(crate) enum RoomEncryptor {
    Olm(OlmRoomEncryptor),
    Megolm(MegolmEncryptor),
}

impl RoomEncryptor {
    pub fn algorithm(&self) -> EventEncryptionAlgorithm {
        match self {
            Self::Olm(_) => EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            Self::Megolm(_) => EventEncryptionAlgorithm::MegolmV1AesSha2,
        }
    }

    pub async fn encrypt(
        &self,
        event_type: &str,
        content: Value,
    ) -> Result<EncryptedEventContent, EncryptionError> {
        match self {
            Self::Olm(e) => {
                Ok(EncryptedEventContent::OlmV1Curve25519AesSha2(e.encrypt(event_type, content).await?))
            }
            Self::Megolm(e) => {
                Ok(EncryptedEventContent::MegolmV1AesSha2(e.encrypt(event_type, content).await?))
            }
        }
    }
}

/// A decryptor bound to an algorithm and, for group algorithms, a room.
#[derive(Debug)]
pub(crate) enum RoomDecryptor {
    Olm(OlmDecryptor),
    Megolm(MegolmDecryptor),
}

impl AlgorithmRegistry {
    /// Build an encryptor for the given room and algorithm.
    pub fn encryptor(
        &self,
        room_id: &RoomId,
        algorithm: &EventEncryptionAlgorithm,
    ) -> Result<RoomEncryptor, EventError> {
        match algorithm {
            EventEncryptionAlgorithm::OlmV1Curve25519AesSha2 => {
                Ok(RoomEncryptor::Olm(OlmRoomEncryptor::new(room_id.clone(), self.clone())))
            }
            EventEncryptionAlgorithm::MegolmV1AesSha2 => {
                Ok(RoomEncryptor::Megolm(MegolmEncryptor::new(room_id.clone(), self.clone())))
            }
            EventEncryptionAlgorithm::Unknown(_) => Err(EventError::UnsupportedAlgorithm),
        }
    }

    /// Build a decryptor for the given room (or the to-device channel) and
    /// algorithm.
    pub fn decryptor(
        &self,
        room_id: Option<&RoomId>,
        algorithm: &EventEncryptionAlgorithm,
    ) -> Result<RoomDecryptor, EventError> {
        match algorithm {
            EventEncryptionAlgorithm::OlmV1Curve25519AesSha2 => Ok(RoomDecryptor::Olm(
                OlmDecryptor::new(room_id.cloned(), self.sessions.clone()),
            )),
            EventEncryptionAlgorithm::MegolmV1AesSha2 => {
                // Group ciphertext is meaningless without a room to bind it
                // to.
                let room_id = room_id.ok_or(EventError::UnsupportedAlgorithm)?;
                Ok(RoomDecryptor::Megolm(MegolmDecryptor::new(
                    room_id.clone(),
                    self.sessions.clone(),
                    self.key_requests.clone(),
                )))
            }
            EventEncryptionAlgorithm::Unknown(_) => Err(EventError::UnsupportedAlgorithm),
        }
    }

    /// The devices a room event must be encrypted for.
    ///
    /// Resolves the joined members through the directory, drops our own
    /// device and every blacklisted one, restricts to verified devices where
    /// an unverified-device blacklist applies, and optionally fails on
    /// devices the application never acknowledged.
    pub async fn collect_target_devices(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<DeviceIdentity>, EncryptionError> {
        let members = self.membership.joined_members(room_id).await;
        let devices_by_user = self
            .directory
            .download_keys(members, false)
            .await
            .map_err(|e| encryption_failure(EventEncryptionAlgorithm::MegolmV1AesSha2, &e))?;

        let verified_only = self.store.get_global_blacklist().await?
            || self.store.get_room_blacklist(room_id).await?;
        let block_unknown = self.block_on_unknown_devices.load(Ordering::SeqCst);

        let mut targets = Vec::new();
        let mut unknown: BTreeMap<UserId, Vec<DeviceId>> = BTreeMap::new();

        for (user_id, devices) in devices_by_user {
            for (device_id, device) in devices {
                if user_id == *self.sessions.own_user_id()
                    && device_id == *self.sessions.own_device_id()
                {
                    continue;
                }

                if device.is_blacklisted() {
                    continue;
                }

                if verified_only && !device.is_verified() {
                    continue;
                }

                if block_unknown && !device.is_known() && !device.is_verified() {
                    unknown.entry(user_id.clone()).or_default().push(device_id);
                    continue;
                }

                targets.push(device);
            }
        }

        if !unknown.is_empty() {
            return Err(EncryptionError::UnknownDevices(unknown));
        }

        Ok(targets)
    }

    /// Make sure a pairwise session exists with every given device,
    /// claiming one-time keys for the ones we never talked to.
    ///
    /// Devices whose claimed key is missing or carries a bad signature are
    /// dropped with a warning; one bad device must not block the room.
    pub async fn ensure_sessions(
        &self,
        devices: &[DeviceIdentity],
    ) -> OlmResult<Vec<DeviceIdentity>> {
        let mut ready = Vec::new();
        let mut missing: Vec<DeviceIdentity> = Vec::new();

        for device in devices {
            if self.sessions.has_session_with(device).await? {
                ready.push(device.clone());
            } else {
                missing.push(device.clone());
            }
        }

        if missing.is_empty() {
            return Ok(ready);
        }

        let request = KeysClaimRequest {
            one_time_keys: missing
                .iter()
                .fold(BTreeMap::new(), |mut acc: BTreeMap<_, BTreeMap<_, _>>, device| {
                    acc.entry(device.user_id().clone())
                        .or_default()
                        .insert(device.device_id().clone(), "signed_curve25519".to_owned());
                    acc
                }),
        };
        let response = self.network.claim_one_time_keys(request).await?;

        for device in missing {
            let one_time_key = response
                .one_time_keys
                .get(device.user_id())
                .and_then(|d| d.get(device.device_id()))
                .and_then(|keys| keys.values().next());

            let Some(one_time_key) = one_time_key else {
                warn!(
                    user_id = device.user_id().as_str(),
                    device_id = device.device_id().as_str(),
                    "no one-time key could be claimed for the device"
                );
                continue;
            };

            match self.sessions.create_outbound_session(&device, one_time_key).await {
                Ok(_) => ready.push(device),
                Err(e) => {
                    warn!(
                        user_id = device.user_id().as_str(),
                        device_id = device.device_id().as_str(),
                        error = %e,
                        "couldn't establish an Olm session with the device"
                    );
                }
            }
        }

        Ok(ready)
    }
}

/// Collapse an internal error into the caller-facing encryption failure.
pub(crate) fn encryption_failure(
    algorithm: EventEncryptionAlgorithm,
    error: &dyn std::fmt::Display,
) -> EncryptionError {
    EncryptionError::UnableToEncrypt { algorithm, reason: error.to_string() }
}

/// Binds rooms to their encryptors and decryptors.
#[derive(Debug)]
pub(crate) struct RoomCryptoDispatcher {
    registry: AlgorithmRegistry,
    encryptors: StdRwLock<HashMap<RoomId, Arc<RoomEncryptor>>>,
    #[allow(clippy::type_complexity)]
    decryptors:
        StdRwLock<HashMap<(Option<RoomId>, EventEncryptionAlgorithm), Arc<RoomDecryptor>>>,
}

impl RoomCryptoDispatcher {
    pub fn new(registry: AlgorithmRegistry) -> Self {
        Self { registry, encryptors: Default::default(), decryptors: Default::default() }
    }

    /// The encryptor bound to the room.
    ///
    /// The first call for a room binds it to the given algorithm; later
    /// calls with a different algorithm keep the original binding and warn,
    /// a room's algorithm never changes underneath live sessions.
    pub fn encryptor(
        &self,
        room_id: &RoomId,
        algorithm: &EventEncryptionAlgorithm,
    ) -> Result<Arc<RoomEncryptor>, EventError> {
        if let Some(existing) = self.encryptors.read().unwrap().get(room_id) {
            if existing.algorithm() != *algorithm {
                warn!(
                    room_id = room_id.as_str(),
                    bound = %existing.algorithm(),
                    requested = %algorithm,
                    "ignoring an attempt to change the encryption algorithm of a room"
                );
            }
            return Ok(existing.clone());
        }

        let encryptor = Arc::new(self.registry.encryptor(room_id, algorithm)?);
        self.encryptors.write().unwrap().insert(room_id.clone(), encryptor.clone());

        Ok(encryptor)
    }

    /// The decryptor for the given room (or the to-device channel) and
    /// algorithm.
    pub fn decryptor(
        &self,
        room_id: Option<&RoomId>,
        algorithm: &EventEncryptionAlgorithm,
    ) -> Result<Arc<RoomDecryptor>, EventError> {
        let key = (room_id.cloned(), algorithm.clone());

        if let Some(existing) = self.decryptors.read().unwrap().get(&key) {
            return Ok(existing.clone());
        }

        let decryptor = Arc::new(self.registry.decryptor(room_id, algorithm)?);
        self.decryptors.write().unwrap().insert(key, decryptor.clone());

        Ok(decryptor)
    }
}

impl RoomDecryptor {
    /// Decrypt a group encrypted room event.
    pub async fn decrypt_room_event(
        &self,
        content: &MegolmV1Content,
    ) -> MegolmResult<DecryptedGroupEvent> {
        match self {
            Self::Megolm(d) => d.decrypt(content).await,
            // Room events never arrive olm encrypted through this path.
            Self::Olm(_) => Err(EventError::UnsupportedAlgorithm.into()),
        }
    }

    /// Decrypt a pairwise encrypted event.
    pub async fn decrypt_olm_event(
        &self,
        sender: &UserId,
        content: &OlmV1Content,
    ) -> OlmResult<DecryptedToDevice> {
        match self {
            Self::Olm(d) => d.decrypt(sender, content).await,
            Self::Megolm(_) => Err(OlmError::Event(EventError::UnsupportedAlgorithm)),
        }
    }
}
