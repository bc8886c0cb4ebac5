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

//! Session bookkeeping for both ratchets.
//!
//! Owns the account, establishes and selects pairwise sessions, tracks the
//! active outbound group session per room, and guards inbound group sessions
//! against replays and cross-room reuse.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock},
};

use lattice_common::{DeviceId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use vodozemac::{olm::OlmMessage, Curve25519PublicKey};

use crate::{
    error::{EventError, MegolmError, MegolmResult, OlmError, OlmResult},
    identities::DeviceIdentity,
    olm::{
        Account, EncryptionSettings, ExportedRoomKey, IdentityKeys, InboundGroupSession,
        OutboundGroupSession, Session,
    },
    store::{CryptoStore, CryptoStoreError},
    types::{
        events::{DecryptedOlmPayload, MegolmV1Content, OlmV1Content},
        EventEncryptionAlgorithm,
    },
};

/// A decrypted to-device event together with the sender keys that secured
/// it.
#[derive(Debug)]
pub struct DecryptedToDevice {
    /// The verified plaintext payload.
    pub payload: DecryptedOlmPayload,
    /// The curve25519 key the message arrived over.
    pub sender_key: String,
    /// The ed25519 key the sender claimed. Only trustworthy once the device
    /// is verified.
    pub claimed_ed25519_key: String,
}

/// A decrypted room event together with its provenance.
#[derive(Debug)]
pub struct DecryptedGroupEvent {
    /// The decrypted event, a JSON object with `type` and `content`.
    pub event: Value,
    /// The ratchet index the event was encrypted at.
    pub message_index: u32,
    /// The ed25519 keys the session creator claimed when sharing the key.
    pub sender_claimed_keys: BTreeMap<String, String>,
}

/// The statistics of a finished room key import.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomKeyImportResult {
    /// The number of keys that were actually added.
    pub imported_count: usize,
    /// The number of keys the import file contained.
    pub total_count: usize,
    /// The imported session ids, grouped by room and session creator.
    pub keys: BTreeMap<RoomId, BTreeMap<String, BTreeSet<String>>>,
}

/// Owns the account and every live ratchet session.
#[derive(Clone, Debug)]
pub(crate) struct SessionManager {
    account: Arc<Mutex<Account>>,
    store: Arc<dyn CryptoStore>,

    own_user_id: UserId,
    own_device_id: DeviceId,
    own_identity_keys: IdentityKeys,

    /// The active outbound group session per room.
    outbound_sessions: Arc<StdRwLock<HashMap<RoomId, OutboundGroupSession>>>,
    /// The highest consumed ratchet index per room and inbound group
    /// session. An index at or below the watermark is a replay.
    seen_indices: Arc<StdMutex<HashMap<(RoomId, String), u32>>>,
}

impl SessionManager {
    pub fn new(account: Account, store: Arc<dyn CryptoStore>) -> Self {
        Self {
            own_user_id: account.user_id().clone(),
            own_device_id: account.device_id().clone(),
            own_identity_keys: account.identity_keys(),
            account: Arc::new(Mutex::new(account)),
            store,
            outbound_sessions: Default::default(),
            seen_indices: Default::default(),
        }
    }

    /// The account, shared with the engine for key uploads.
    pub fn account(&self) -> Arc<Mutex<Account>> {
        self.account.clone()
    }

    pub fn own_user_id(&self) -> &UserId {
        &self.own_user_id
    }

    pub fn own_device_id(&self) -> &DeviceId {
        &self.own_device_id
    }

    pub fn own_identity_keys(&self) -> IdentityKeys {
        self.own_identity_keys
    }

    /// Establish a new outbound pairwise session with the device, consuming
    /// the claimed one-time key.
    pub async fn create_outbound_session(
        &self,
        device: &DeviceIdentity,
        one_time_key: &crate::types::SignedOneTimeKey,
    ) -> OlmResult<Session> {
        let session = self.account.lock().await.create_outbound_session(device, one_time_key)?;
        self.store.save_sessions(std::slice::from_ref(&session)).await?;

        debug!(
            user_id = device.user_id().as_str(),
            device_id = device.device_id().as_str(),
            session_id = session.session_id(),
            "created a new outbound Olm session"
        );

        Ok(session)
    }

    /// Is there an established pairwise session with the given device?
    pub async fn has_session_with(&self, device: &DeviceIdentity) -> OlmResult<bool> {
        let Some(sender_key) = device.curve25519_key() else {
            return Ok(false);
        };

        Ok(!self.store.get_sessions(&sender_key.to_base64()).await?.is_empty())
    }

    /// Encrypt an event for a single device over the pairwise channel.
    ///
    /// The advanced ratchet state is persisted before the ciphertext is
    /// handed out, so a crash can't reuse a message key.
    pub async fn encrypt_to_device(
        &self,
        device: &DeviceIdentity,
        event_type: &str,
        content: Value,
    ) -> OlmResult<OlmV1Content> {
        let recipient_key = device
            .curve25519_key()
            .ok_or_else(|| {
                crate::error::SessionCreationError::DeviceMissingCurveKey(
                    device.user_id().clone(),
                    device.device_id().clone(),
                )
            })?
            .to_base64();
        let recipient_signing_key = device
            .ed25519_key()
            .ok_or(crate::error::SignatureError::MissingSigningKey)
            .map_err(OlmError::Signature)?;

        let session = self
            .preferred_session(&recipient_key)
            .await?
            .ok_or_else(|| OlmError::MissingSession(recipient_key.clone()))?;

        let payload = DecryptedOlmPayload {
            sender: self.own_user_id.clone(),
            keys: BTreeMap::from([(
                "ed25519".to_owned(),
                self.own_identity_keys.ed25519.to_base64(),
            )]),
            recipient: device.user_id().clone(),
            recipient_keys: BTreeMap::from([(
                "ed25519".to_owned(),
                recipient_signing_key.to_base64(),
            )]),
            event_type: event_type.to_owned(),
            content,
        };

        let message = session.encrypt(&serde_json::to_string(&payload)?).await;
        self.store.save_sessions(std::slice::from_ref(&session)).await?;

        Ok(OlmV1Content {
            sender_key: self.own_identity_keys.curve25519.to_base64(),
            ciphertext: BTreeMap::from([(recipient_key, message)]),
        })
    }

    /// When several sessions exist with a device, both sides must pick the
    /// same one or they'll endlessly ratchet past each other. The session
    /// with the lexicographically smallest id wins.
    async fn preferred_session(&self, sender_key: &str) -> OlmResult<Option<Session>> {
        let mut sessions = self.store.get_sessions(sender_key).await?;
        sessions.sort_by(|a, b| a.session_id().cmp(b.session_id()));

        Ok(sessions.into_iter().next())
    }

    /// Decrypt a pairwise encrypted event and check that its plaintext is
    /// bound to us and to the claimed sender.
    pub async fn decrypt_to_device(
        &self,
        sender: &UserId,
        content: &OlmV1Content,
    ) -> OlmResult<DecryptedToDevice> {
        let own_key = self.own_identity_keys.curve25519.to_base64();
        let message =
            content.ciphertext.get(&own_key).ok_or(EventError::MissingCiphertext)?;

        let plaintext = self.decrypt_olm_message(&content.sender_key, message).await?;
        let payload: DecryptedOlmPayload = serde_json::from_slice(&plaintext)?;

        if payload.recipient != self.own_user_id {
            return Err(
                EventError::BadRecipient(payload.recipient, self.own_user_id.clone()).into()
            );
        }

        if payload.recipient_keys.get("ed25519").map(String::as_str)
            != Some(self.own_identity_keys.ed25519.to_base64().as_str())
        {
            return Err(EventError::BadRecipientKey.into());
        }

        if payload.sender != *sender {
            return Err(EventError::MismatchedSender(payload.sender, sender.clone()).into());
        }

        let claimed_ed25519_key = payload
            .keys
            .get("ed25519")
            .cloned()
            .ok_or(EventError::MissingField("keys.ed25519"))?;

        Ok(DecryptedToDevice {
            payload,
            sender_key: content.sender_key.clone(),
            claimed_ed25519_key,
        })
    }

    /// Try every known session with the sender; a pre-key message that no
    /// session accepts establishes a new inbound session.
    async fn decrypt_olm_message(
        &self,
        sender_key: &str,
        message: &OlmMessage,
    ) -> OlmResult<Vec<u8>> {
        let mut sessions = self.store.get_sessions(sender_key).await?;
        sessions.sort_by(|a, b| a.session_id().cmp(b.session_id()));

        for session in sessions {
            match session.decrypt(message).await {
                Ok(plaintext) => {
                    self.store.save_sessions(std::slice::from_ref(&session)).await?;
                    return Ok(plaintext);
                }
                // Another session with this device may still match.
                Err(_) => continue,
            }
        }

        match message {
            OlmMessage::PreKey(prekey) => {
                let sender_key = Curve25519PublicKey::from_base64(sender_key)
                    .map_err(crate::error::SessionCreationError::InvalidCurveKey)?;

                let mut account = self.account.lock().await;
                let (session, plaintext) = account.create_inbound_session(sender_key, prekey)?;

                // The one-time key is gone, persist the account first.
                self.store.save_account(account.pickle()).await?;
                drop(account);
                self.store.save_sessions(std::slice::from_ref(&session)).await?;

                debug!(
                    sender_key = sender_key.to_base64(),
                    session_id = session.session_id(),
                    "created a new inbound Olm session"
                );

                Ok(plaintext)
            }
            OlmMessage::Normal(_) => Err(OlmError::MissingSession(sender_key.to_owned())),
        }
    }

    /// The active outbound group session of a room, if it exists and hasn't
    /// expired.
    pub fn outbound_group_session(&self, room_id: &RoomId) -> Option<OutboundGroupSession> {
        self.outbound_sessions
            .read()
            .unwrap()
            .get(room_id)
            .filter(|s| !s.expired())
            .cloned()
    }

    /// Create a fresh outbound group session for the room, installing our
    /// own inbound copy so we can decrypt our own messages.
    pub async fn create_outbound_group_session(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> MegolmResult<OutboundGroupSession> {
        let outbound = OutboundGroupSession::new(room_id.clone(), settings);

        let inbound = InboundGroupSession::new(
            &outbound.session_key().await,
            room_id.clone(),
            self.own_identity_keys.curve25519.to_base64(),
            BTreeMap::from([(
                "ed25519".to_owned(),
                self.own_identity_keys.ed25519.to_base64(),
            )]),
        );
        self.store.save_inbound_group_session(inbound).await?;

        debug!(
            room_id = room_id.as_str(),
            session_id = outbound.session_id(),
            "created a new outbound group session"
        );

        self.outbound_sessions.write().unwrap().insert(room_id.clone(), outbound.clone());

        Ok(outbound)
    }

    /// Encrypt a room event with the given outbound group session.
    pub async fn encrypt_group_message(
        &self,
        session: &OutboundGroupSession,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<MegolmV1Content> {
        let payload = json!({
            "room_id": session.room_id(),
            "type": event_type,
            "content": content,
        });

        let ciphertext = session.encrypt(&serde_json::to_string(&payload)?).await;

        Ok(MegolmV1Content {
            sender_key: self.own_identity_keys.curve25519.to_base64(),
            device_id: self.own_device_id.clone(),
            session_id: session.session_id().to_owned(),
            ciphertext,
        })
    }

    /// Store a received inbound group session. Returns `false` if we
    /// already hold a session under the same triplet; the first key wins.
    pub async fn add_inbound_group_session(
        &self,
        session: InboundGroupSession,
    ) -> Result<bool, CryptoStoreError> {
        self.store.save_inbound_group_session(session).await
    }

    /// Decrypt a group encrypted room event.
    pub async fn decrypt_group_message(
        &self,
        room_id: &RoomId,
        content: &MegolmV1Content,
    ) -> MegolmResult<DecryptedGroupEvent> {
        let session = self
            .store
            .get_inbound_group_session(room_id, &content.sender_key, &content.session_id)
            .await?
            .ok_or(MegolmError::MissingRoomKey)?;

        // The lookup is keyed by room, but a session restored from an
        // untrusted backup could still carry a foreign binding.
        if session.room_id != *room_id {
            return Err(EventError::MismatchedRoom {
                expected: room_id.clone(),
                actual: Some(session.room_id.clone()),
            }
            .into());
        }

        let (plaintext, index) = session.decrypt(&content.ciphertext).await?;

        let payload: Value = serde_json::from_slice(&plaintext)?;

        let payload_room = payload
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

        let event_type =
            payload.get("type").cloned().ok_or(EventError::MissingField("type"))?;
        let event_content =
            payload.get("content").cloned().ok_or(EventError::MissingField("content"))?;

        // Only consume the index once the payload checks passed, so a
        // rejected event doesn't burn the watermark for the real one.
        self.check_message_index(room_id, session.session_id(), index)?;

        Ok(DecryptedGroupEvent {
            event: json!({ "type": event_type, "content": event_content }),
            message_index: index,
            sender_claimed_keys: session.sender_claimed_keys.clone(),
        })
    }

    /// Enforce a strictly increasing ratchet index per room and session. A
    /// repeated or retreating index means a replayed message.
    fn check_message_index(
        &self,
        room_id: &RoomId,
        session_id: &str,
        index: u32,
    ) -> MegolmResult<()> {
        let mut seen = self.seen_indices.lock().unwrap();
        let key = (room_id.clone(), session_id.to_owned());

        match seen.get(&key) {
            Some(highest) if index <= *highest => Err(MegolmError::DuplicateMessageIndex {
                session_id: session_id.to_owned(),
                index,
            }),
            _ => {
                seen.insert(key, index);
                Ok(())
            }
        }
    }

    /// Export every held inbound group session at its earliest known index.
    pub async fn export_group_sessions(
        &self,
    ) -> Result<Vec<ExportedRoomKey>, CryptoStoreError> {
        let sessions = self.store.get_inbound_group_sessions().await?;
        let mut exported = Vec::with_capacity(sessions.len());

        for session in sessions {
            exported.push(session.export().await);
        }

        Ok(exported)
    }

    /// Import previously exported room keys, validating each the same way a
    /// live room key event is validated. Invalid entries are skipped.
    pub async fn import_group_sessions(
        &self,
        exported: Vec<ExportedRoomKey>,
    ) -> Result<RoomKeyImportResult, CryptoStoreError> {
        let mut result = RoomKeyImportResult { total_count: exported.len(), ..Default::default() };

        for key in exported {
            if key.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
                warn!(
                    session_id = key.session_id,
                    algorithm = %key.algorithm,
                    "skipping an exported key with an unsupported algorithm"
                );
                continue;
            }

            let session = match InboundGroupSession::from_export(&key) {
                Ok(session) => session,
                Err(e) => {
                    warn!(
                        session_id = key.session_id,
                        error = %e,
                        "skipping an unparsable exported key"
                    );
                    continue;
                }
            };

            // The session id is derived from the ratchet itself; a mismatch
            // means the export record was tampered with.
            if session.session_id() != key.session_id {
                warn!(
                    session_id = key.session_id,
                    "skipping an exported key whose session id doesn't match its ratchet"
                );
                continue;
            }

            if self.store.save_inbound_group_session(session.clone()).await? {
                result.imported_count += 1;
                result
                    .keys
                    .entry(session.room_id.clone())
                    .or_default()
                    .entry(session.sender_key.clone())
                    .or_default()
                    .insert(session.session_id().to_owned());
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use lattice_common::{DeviceId, RoomId, UserId};
    use serde_json::json;

    use super::SessionManager;
    use crate::{
        error::{MegolmError, OlmError},
        identities::DeviceIdentity,
        olm::{Account, EncryptionSettings, InboundGroupSession},
        store::MemoryStore,
    };

    fn manager(user: &str, device: &str) -> SessionManager {
        let account = Account::new(UserId::parse(user).unwrap(), DeviceId::new(device));
        SessionManager::new(account, Arc::new(MemoryStore::new()))
    }

    fn room_id() -> RoomId {
        RoomId::parse("!room:localhost").unwrap()
    }

    /// Wire two managers together with a fresh pairwise session, alice
    /// having the outbound side.
    async fn connect(alice: &SessionManager, bob: &SessionManager) -> DeviceIdentity {
        let bob_device = {
            let account = bob.account();
            let mut account = account.lock().await;
            account.generate_one_time_keys(1);
            let one_time_key =
                account.signed_one_time_keys().unwrap().into_values().next().unwrap();
            account.mark_keys_as_published();

            let device = DeviceIdentity::new(account.device_keys().unwrap()).unwrap();
            drop(account);

            alice.create_outbound_session(&device, &one_time_key).await.unwrap();
            device
        };

        bob_device
    }

    #[tokio::test]
    async fn to_device_round_trip() {
        let alice = manager("@alice:localhost", "ALICEDEV");
        let bob = manager("@bob:localhost", "BOBDEV");
        let bob_device = connect(&alice, &bob).await;

        let content = alice
            .encrypt_to_device(&bob_device, "m.test", json!({ "hello": "bob" }))
            .await
            .unwrap();

        let decrypted = bob.decrypt_to_device(alice.own_user_id(), &content).await.unwrap();

        assert_eq!(decrypted.payload.event_type, "m.test");
        assert_eq!(decrypted.payload.content, json!({ "hello": "bob" }));
        assert_eq!(decrypted.sender_key, alice.own_identity_keys().curve25519.to_base64());
        assert_eq!(
            decrypted.claimed_ed25519_key,
            alice.own_identity_keys().ed25519.to_base64()
        );

        // And back over the now established session.
        let alice_device =
            DeviceIdentity::new(alice.account().lock().await.device_keys().unwrap()).unwrap();
        let content = bob
            .encrypt_to_device(&alice_device, "m.test", json!({ "hello": "alice" }))
            .await
            .unwrap();
        let decrypted = alice.decrypt_to_device(bob.own_user_id(), &content).await.unwrap();
        assert_eq!(decrypted.payload.content, json!({ "hello": "alice" }));
    }

    #[tokio::test]
    async fn messages_for_other_recipients_are_rejected() {
        let alice = manager("@alice:localhost", "ALICEDEV");
        let bob = manager("@bob:localhost", "BOBDEV");
        let bob_device = connect(&alice, &bob).await;

        let content =
            alice.encrypt_to_device(&bob_device, "m.test", json!({})).await.unwrap();

        // A server lying about the sender gets caught by the payload check.
        let wrong_sender = UserId::parse("@mallory:localhost").unwrap();
        let err = bob.decrypt_to_device(&wrong_sender, &content).await.unwrap_err();
        assert_matches!(err, OlmError::Event(_));
    }

    #[tokio::test]
    async fn messages_not_addressed_to_us_are_rejected() {
        let alice = manager("@alice:localhost", "ALICEDEV");
        let bob = manager("@bob:localhost", "BOBDEV");
        let charlie = manager("@charlie:localhost", "CHARLIEDEV");
        let bob_device = connect(&alice, &bob).await;

        let content =
            alice.encrypt_to_device(&bob_device, "m.test", json!({})).await.unwrap();

        // Charlie has no ciphertext addressed to him at all.
        let err = charlie.decrypt_to_device(alice.own_user_id(), &content).await.unwrap_err();
        assert_matches!(err, OlmError::Event(crate::error::EventError::MissingCiphertext));
    }

    #[tokio::test]
    async fn group_message_round_trip() {
        let alice = manager("@alice:localhost", "ALICEDEV");

        let session = alice
            .create_outbound_group_session(&room_id(), EncryptionSettings::default())
            .await
            .unwrap();
        let content = alice
            .encrypt_group_message(&session, "m.room.message", json!({ "body": "hi" }))
            .await
            .unwrap();

        // Our own inbound copy decrypts it.
        let decrypted = alice.decrypt_group_message(&room_id(), &content).await.unwrap();
        assert_eq!(decrypted.message_index, 0);
        assert_eq!(decrypted.event["type"], "m.room.message");
        assert_eq!(decrypted.event["content"]["body"], "hi");
        assert_eq!(
            decrypted.sender_claimed_keys["ed25519"],
            alice.own_identity_keys().ed25519.to_base64()
        );
    }

    #[tokio::test]
    async fn replayed_messages_are_rejected() {
        let alice = manager("@alice:localhost", "ALICEDEV");

        let session = alice
            .create_outbound_group_session(&room_id(), EncryptionSettings::default())
            .await
            .unwrap();
        let content = alice
            .encrypt_group_message(&session, "m.room.message", json!({ "body": "hi" }))
            .await
            .unwrap();

        alice.decrypt_group_message(&room_id(), &content).await.unwrap();

        let err = alice.decrypt_group_message(&room_id(), &content).await.unwrap_err();
        assert_matches!(err, MegolmError::DuplicateMessageIndex { index: 0, .. });
    }

    #[test]
    fn replay_watermarks_are_scoped_per_room() {
        let alice = manager("@alice:localhost", "ALICEDEV");
        let other_room = RoomId::parse("!other:localhost").unwrap();

        alice.check_message_index(&room_id(), "session", 0).unwrap();

        // The same session id and index in another room is not a replay.
        alice.check_message_index(&other_room, "session", 0).unwrap();

        let err = alice.check_message_index(&room_id(), "session", 0).unwrap_err();
        assert_matches!(err, MegolmError::DuplicateMessageIndex { index: 0, .. });

        // A retreating index in the same room is one.
        alice.check_message_index(&room_id(), "session", 5).unwrap();
        let err = alice.check_message_index(&room_id(), "session", 3).unwrap_err();
        assert_matches!(err, MegolmError::DuplicateMessageIndex { index: 3, .. });
    }

    #[tokio::test]
    async fn room_mismatch_is_a_hard_failure() {
        let alice = manager("@alice:localhost", "ALICEDEV");
        let other_room = RoomId::parse("!other:localhost").unwrap();

        let session = alice
            .create_outbound_group_session(&room_id(), EncryptionSettings::default())
            .await
            .unwrap();

        // Re-bind the same ratchet to a different room, as a malicious
        // server replaying a room key would.
        let stolen = InboundGroupSession::new(
            &session.session_key().await,
            other_room.clone(),
            alice.own_identity_keys().curve25519.to_base64(),
            Default::default(),
        );
        alice.add_inbound_group_session(stolen).await.unwrap();

        let content = alice
            .encrypt_group_message(&session, "m.room.message", json!({ "body": "hi" }))
            .await
            .unwrap();

        // The ciphertext decrypts, but the payload names the original room.
        let err = alice.decrypt_group_message(&other_room, &content).await.unwrap_err();
        assert_matches!(err, MegolmError::Event(crate::error::EventError::MismatchedRoom { .. }));
    }

    #[tokio::test]
    async fn missing_session_is_reported() {
        let alice = manager("@alice:localhost", "ALICEDEV");
        let bob = manager("@bob:localhost", "BOBDEV");

        let session = alice
            .create_outbound_group_session(&room_id(), EncryptionSettings::default())
            .await
            .unwrap();
        let content = alice
            .encrypt_group_message(&session, "m.room.message", json!({ "body": "hi" }))
            .await
            .unwrap();

        // Bob never received the room key.
        let err = bob.decrypt_group_message(&room_id(), &content).await.unwrap_err();
        assert_matches!(err, MegolmError::MissingRoomKey);
    }

    #[tokio::test]
    async fn export_import_moves_keys_between_devices() {
        let alice = manager("@alice:localhost", "ALICEDEV");
        let bob = manager("@bob:localhost", "BOBDEV");

        let session = alice
            .create_outbound_group_session(&room_id(), EncryptionSettings::default())
            .await
            .unwrap();

        let exported = alice.export_group_sessions().await.unwrap();
        assert_eq!(exported.len(), 1);

        let result = bob.import_group_sessions(exported.clone()).await.unwrap();
        assert_eq!(result.imported_count, 1);
        assert_eq!(result.total_count, 1);

        // Importing the same keys again is a no-op.
        let result = bob.import_group_sessions(exported).await.unwrap();
        assert_eq!(result.imported_count, 0);
        assert_eq!(result.total_count, 1);

        let content = alice
            .encrypt_group_message(&session, "m.room.message", json!({ "body": "hi" }))
            .await
            .unwrap();
        let decrypted = bob.decrypt_group_message(&room_id(), &content).await.unwrap();
        assert_eq!(decrypted.event["content"]["body"], "hi");
    }
}
