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

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock as StdRwLock,
    },
    time::{Duration, Instant},
};

use lattice_common::{DeviceId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vodozemac::megolm::{
    DecryptionError, ExportedSessionKey, GroupSession, InboundGroupSession as InnerInbound,
    InboundGroupSessionPickle, MegolmMessage, SessionConfig, SessionKey,
};

use crate::{
    error::SessionCreationError,
    types::{events::RoomKeyContent, EventEncryptionAlgorithm},
};

const ROTATION_PERIOD: Duration = Duration::from_millis(604800000);
const ROTATION_MESSAGES: u64 = 100;

/// Settings controlling how outbound group sessions are created and rotated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionSettings {
    /// The algorithm group messages are encrypted with.
    pub algorithm: EventEncryptionAlgorithm,
    /// Rotate the session once it is older than this.
    pub rotation_period: Duration,
    /// Rotate the session after this many encrypted messages.
    pub rotation_period_msgs: u64,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
        }
    }
}

/// An outbound group session, ratcheting forward for every encrypted room
/// message.
///
/// Clones share the ratchet, the message count and the set of devices the
/// session key was shared with.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<Mutex<GroupSession>>,
    session_id: Arc<str>,
    room_id: RoomId,
    creation_time: Instant,
    message_count: Arc<AtomicU64>,
    shared_with: Arc<StdRwLock<HashSet<(UserId, DeviceId)>>>,
    settings: Arc<EncryptionSettings>,
}

impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("message_count", &self.message_count.load(Ordering::SeqCst))
            .finish()
    }
}

impl OutboundGroupSession {
    /// Create a new group session bound to the given room.
    pub fn new(room_id: RoomId, settings: EncryptionSettings) -> Self {
        let inner = GroupSession::new(SessionConfig::version_1());

        Self {
            session_id: inner.session_id().into(),
            inner: Mutex::new(inner).into(),
            room_id,
            creation_time: Instant::now(),
            message_count: AtomicU64::new(0).into(),
            shared_with: Default::default(),
            settings: settings.into(),
        }
    }

    /// The unique id of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The room this session encrypts messages for.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Has the session reached its age or message count limit?
    ///
    /// Expired sessions must never encrypt again; a fresh session gets
    /// created and shared instead.
    pub fn expired(&self) -> bool {
        self.message_count.load(Ordering::SeqCst) >= self.settings.rotation_period_msgs
            || self.creation_time.elapsed() >= self.settings.rotation_period
    }

    /// The current session key, used to share the session with other
    /// devices. Only reveals ratchet states from this point forward.
    pub async fn session_key(&self) -> SessionKey {
        self.inner.lock().await.session_key()
    }

    /// The room key event content carrying this session to another device.
    pub async fn as_room_key_content(&self) -> RoomKeyContent {
        RoomKeyContent {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: self.room_id.clone(),
            session_id: self.session_id.to_string(),
            session_key: self.session_key().await.to_base64(),
        }
    }

    /// Encrypt the given plaintext, bumping the message count.
    pub async fn encrypt(&self, plaintext: &str) -> MegolmMessage {
        let message = self.inner.lock().await.encrypt(plaintext);
        self.message_count.fetch_add(1, Ordering::SeqCst);

        message
    }

    /// Remember that the session key was shared with the given devices.
    pub fn mark_shared_with(&self, devices: impl IntoIterator<Item = (UserId, DeviceId)>) {
        self.shared_with.write().unwrap().extend(devices);
    }

    /// Was the session key already shared with this device?
    pub fn is_shared_with(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        self.shared_with.read().unwrap().contains(&(user_id.clone(), device_id.clone()))
    }
}

/// A received group session, able to decrypt messages for a single room.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerInbound>>,
    session_id: Arc<str>,
    first_known_index: u32,
    /// The room this session is bound to. Messages claiming another room
    /// must be rejected.
    pub room_id: RoomId,
    /// The curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The ed25519 keys the creating device claimed, carried along so
    /// exported keys keep their provenance.
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// Whether the session arrived through an import rather than a live
    /// room key event.
    pub imported: bool,
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

/// A group session key in the portable export format.
#[derive(Clone, Serialize, Deserialize)]
pub struct ExportedRoomKey {
    /// The algorithm the key is used with.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room the session is bound to.
    pub room_id: RoomId,
    /// The curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The id of the session.
    pub session_id: String,
    /// The ratchet state at the earliest exportable index.
    pub session_key: String,
    /// The ed25519 keys the creating device claimed.
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// Devices the key passed through before reaching us.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl fmt::Debug for ExportedRoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Deliberately omits the session key material.
        f.debug_struct("ExportedRoomKey")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

/// The typed persisted form of an [`InboundGroupSession`].
#[derive(Serialize, Deserialize)]
pub struct PickledInboundGroupSession {
    /// The pickled ratchet state.
    pub pickle: InboundGroupSessionPickle,
    /// The room the session is bound to.
    pub room_id: RoomId,
    /// The curve25519 key of the creating device.
    pub sender_key: String,
    /// The claimed ed25519 keys of the creating device.
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// Whether the session arrived through an import.
    pub imported: bool,
}

impl InboundGroupSession {
    /// Create an inbound session from a freshly shared session key.
    pub fn new(
        session_key: &SessionKey,
        room_id: RoomId,
        sender_key: String,
        sender_claimed_keys: BTreeMap<String, String>,
    ) -> Self {
        let inner = InnerInbound::new(session_key, SessionConfig::version_1());

        Self {
            session_id: inner.session_id().into(),
            first_known_index: inner.first_known_index(),
            inner: Mutex::new(inner).into(),
            room_id,
            sender_key,
            sender_claimed_keys,
            imported: false,
        }
    }

    /// Restore an inbound session from an exported room key.
    pub fn from_export(exported: &ExportedRoomKey) -> Result<Self, SessionCreationError> {
        let session_key = ExportedSessionKey::from_base64(&exported.session_key)?;
        let inner = InnerInbound::import(&session_key, SessionConfig::version_1());

        Ok(Self {
            session_id: inner.session_id().into(),
            first_known_index: inner.first_known_index(),
            inner: Mutex::new(inner).into(),
            room_id: exported.room_id.clone(),
            sender_key: exported.sender_key.clone(),
            sender_claimed_keys: exported.sender_claimed_keys.clone(),
            imported: true,
        })
    }

    /// The unique id of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The earliest ratchet index this session can decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Decrypt the given message, returning the plaintext and the ratchet
    /// index it was encrypted at.
    pub async fn decrypt(
        &self,
        message: &MegolmMessage,
    ) -> Result<(Vec<u8>, u32), DecryptionError> {
        let decrypted = self.inner.lock().await.decrypt(message)?;

        Ok((decrypted.plaintext, decrypted.message_index))
    }

    /// Export the session at its earliest known index.
    pub async fn export(&self) -> ExportedRoomKey {
        let session_key = self
            .inner
            .lock()
            .await
            .export_at(self.first_known_index)
            .expect("sessions can always export their first known index");

        ExportedRoomKey {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: self.room_id.clone(),
            sender_key: self.sender_key.clone(),
            session_id: self.session_id.to_string(),
            session_key: session_key.to_base64(),
            sender_claimed_keys: self.sender_claimed_keys.clone(),
            forwarding_curve25519_key_chain: Vec::new(),
        }
    }

    /// Persist the session state.
    pub async fn pickle(&self) -> PickledInboundGroupSession {
        PickledInboundGroupSession {
            pickle: self.inner.lock().await.pickle(),
            room_id: self.room_id.clone(),
            sender_key: self.sender_key.clone(),
            sender_claimed_keys: self.sender_claimed_keys.clone(),
            imported: self.imported,
        }
    }

    /// Restore an inbound session from its persisted state.
    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Self {
        let inner = InnerInbound::from_pickle(pickle.pickle);

        Self {
            session_id: inner.session_id().into(),
            first_known_index: inner.first_known_index(),
            inner: Mutex::new(inner).into(),
            room_id: pickle.room_id,
            sender_key: pickle.sender_key,
            sender_claimed_keys: pickle.sender_claimed_keys,
            imported: pickle.imported,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lattice_common::RoomId;

    use super::{EncryptionSettings, ExportedRoomKey, InboundGroupSession, OutboundGroupSession};

    fn room_id() -> RoomId {
        RoomId::parse("!test:localhost").unwrap()
    }

    #[tokio::test]
    async fn group_round_trip() {
        let outbound = OutboundGroupSession::new(room_id(), EncryptionSettings::default());
        let inbound = InboundGroupSession::new(
            &outbound.session_key().await,
            room_id(),
            "sender_key".to_owned(),
            Default::default(),
        );

        assert_eq!(outbound.session_id(), inbound.session_id());

        let message = outbound.encrypt("secret room message").await;
        let (plaintext, index) = inbound.decrypt(&message).await.unwrap();

        assert_eq!(plaintext, b"secret room message");
        assert_eq!(index, 0);
    }

    #[tokio::test]
    async fn message_count_expires_the_session() {
        let settings = EncryptionSettings { rotation_period_msgs: 2, ..Default::default() };
        let outbound = OutboundGroupSession::new(room_id(), settings);

        assert!(!outbound.expired());
        outbound.encrypt("one").await;
        assert!(!outbound.expired());
        outbound.encrypt("two").await;
        assert!(outbound.expired());
    }

    #[tokio::test]
    async fn age_expires_the_session() {
        let settings =
            EncryptionSettings { rotation_period: Duration::from_secs(0), ..Default::default() };
        let outbound = OutboundGroupSession::new(room_id(), settings);

        assert!(outbound.expired());
    }

    #[tokio::test]
    async fn export_only_reveals_later_indices() {
        let outbound = OutboundGroupSession::new(room_id(), EncryptionSettings::default());

        let early_message = outbound.encrypt("before the export point").await;

        // Join the session only after the first message was sent.
        let inbound = InboundGroupSession::new(
            &outbound.session_key().await,
            room_id(),
            "sender_key".to_owned(),
            Default::default(),
        );
        assert_eq!(inbound.first_known_index(), 1);
        inbound.decrypt(&early_message).await.unwrap_err();

        let exported: ExportedRoomKey = inbound.export().await;
        let imported = InboundGroupSession::from_export(&exported).unwrap();

        assert!(imported.imported);
        assert_eq!(imported.first_known_index(), 1);

        let late_message = outbound.encrypt("after the export point").await;
        let (plaintext, index) = imported.decrypt(&late_message).await.unwrap();
        assert_eq!(plaintext, b"after the export point");
        assert_eq!(index, 1);

        // The early message stays out of reach even for the imported copy.
        imported.decrypt(&early_message).await.unwrap_err();
    }

    #[tokio::test]
    async fn pickle_round_trip() {
        let outbound = OutboundGroupSession::new(room_id(), EncryptionSettings::default());
        let inbound = InboundGroupSession::new(
            &outbound.session_key().await,
            room_id(),
            "sender_key".to_owned(),
            Default::default(),
        );

        let restored = InboundGroupSession::from_pickle(inbound.pickle().await);
        assert_eq!(restored.session_id(), outbound.session_id());

        let message = outbound.encrypt("survives the pickle").await;
        let (plaintext, _) = restored.decrypt(&message).await.unwrap();
        assert_eq!(plaintext, b"survives the pickle");
    }
}
