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
    collections::{HashMap, HashSet},
    sync::RwLock as StdRwLock,
};

use async_trait::async_trait;
use lattice_common::{DeviceId, RoomId, TransactionId, UserId};
use serde_json::Value;

use super::{CryptoStore, Result};
use crate::{
    gossiping::{OutgoingRoomKeyRequest, RoomKeyRequestState},
    identities::DeviceIdentity,
    olm::{InboundGroupSession, PickledAccount, Session},
    types::{events::RoomKeyRequestBody, EventEncryptionAlgorithm},
};

/// An in-memory, non-persistent [`CryptoStore`].
///
/// Everything is lost on drop. Useful for tests and for embedders that keep
/// their own persistence outside the engine.
#[derive(Debug, Default)]
pub struct MemoryStore {
    account: StdRwLock<Option<Value>>,
    sessions: StdRwLock<HashMap<String, Vec<Session>>>,
    inbound_group_sessions: StdRwLock<HashMap<(RoomId, String, String), InboundGroupSession>>,
    devices: StdRwLock<HashMap<UserId, HashMap<DeviceId, DeviceIdentity>>>,
    room_algorithms: StdRwLock<HashMap<RoomId, EventEncryptionAlgorithm>>,
    key_requests: StdRwLock<HashMap<TransactionId, OutgoingRoomKeyRequest>>,
    key_requests_by_body: StdRwLock<HashMap<RoomKeyRequestBody, TransactionId>>,
    device_announced: StdRwLock<bool>,
    global_blacklist: StdRwLock<bool>,
    blacklisted_rooms: StdRwLock<HashSet<RoomId>>,
}

impl MemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<PickledAccount>> {
        self.account
            .read()
            .unwrap()
            .clone()
            .map(|pickle| Ok(serde_json::from_value(pickle)?))
            .transpose()
    }

    async fn save_account(&self, account: PickledAccount) -> Result<()> {
        *self.account.write().unwrap() = Some(serde_json::to_value(&account)?);
        Ok(())
    }

    async fn save_sessions(&self, sessions: &[Session]) -> Result<()> {
        let mut map = self.sessions.write().unwrap();

        for session in sessions {
            let entry = map.entry(session.sender_key().to_base64()).or_default();

            if !entry.iter().any(|s| s.session_id() == session.session_id()) {
                entry.push(session.clone());
            }
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Vec<Session>> {
        Ok(self.sessions.read().unwrap().get(sender_key).cloned().unwrap_or_default())
    }

    async fn save_inbound_group_session(&self, session: InboundGroupSession) -> Result<bool> {
        let key = (
            session.room_id.clone(),
            session.sender_key.clone(),
            session.session_id().to_owned(),
        );
        let mut map = self.inbound_group_sessions.write().unwrap();

        if map.contains_key(&key) {
            Ok(false)
        } else {
            map.insert(key, session);
            Ok(true)
        }
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        let key = (room_id.clone(), sender_key.to_owned(), session_id.to_owned());
        Ok(self.inbound_group_sessions.read().unwrap().get(&key).cloned())
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        Ok(self.inbound_group_sessions.read().unwrap().values().cloned().collect())
    }

    async fn save_devices(&self, devices: &[DeviceIdentity]) -> Result<()> {
        let mut map = self.devices.write().unwrap();

        for device in devices {
            map.entry(device.user_id().clone())
                .or_default()
                .insert(device.device_id().clone(), device.clone());
        }

        Ok(())
    }

    async fn delete_device(&self, user_id: &UserId, device_id: &DeviceId) -> Result<()> {
        if let Some(devices) = self.devices.write().unwrap().get_mut(user_id) {
            devices.remove(device_id);
        }

        Ok(())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceIdentity>> {
        Ok(self.devices.read().unwrap().get(user_id).and_then(|d| d.get(device_id)).cloned())
    }

    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<HashMap<DeviceId, DeviceIdentity>> {
        Ok(self.devices.read().unwrap().get(user_id).cloned().unwrap_or_default())
    }

    async fn get_room_algorithm(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<EventEncryptionAlgorithm>> {
        Ok(self.room_algorithms.read().unwrap().get(room_id).cloned())
    }

    async fn set_room_algorithm(
        &self,
        room_id: &RoomId,
        algorithm: EventEncryptionAlgorithm,
    ) -> Result<()> {
        self.room_algorithms.write().unwrap().insert(room_id.clone(), algorithm);
        Ok(())
    }

    async fn save_outgoing_key_request(&self, request: OutgoingRoomKeyRequest) -> Result<()> {
        self.key_requests_by_body
            .write()
            .unwrap()
            .insert(request.body.clone(), request.request_id.clone());
        self.key_requests.write().unwrap().insert(request.request_id.clone(), request);

        Ok(())
    }

    async fn delete_outgoing_key_request(&self, request_id: &TransactionId) -> Result<()> {
        if let Some(request) = self.key_requests.write().unwrap().remove(request_id) {
            let mut by_body = self.key_requests_by_body.write().unwrap();

            // Only drop the body index if it still points at this request; a
            // resend may already have claimed the body with a fresh id.
            if by_body.get(&request.body) == Some(request_id) {
                by_body.remove(&request.body);
            }
        }

        Ok(())
    }

    async fn get_outgoing_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<OutgoingRoomKeyRequest>> {
        Ok(self.key_requests.read().unwrap().get(request_id).cloned())
    }

    async fn get_key_request_by_body(
        &self,
        body: &RoomKeyRequestBody,
    ) -> Result<Option<OutgoingRoomKeyRequest>> {
        let id = self.key_requests_by_body.read().unwrap().get(body).cloned();
        Ok(id.and_then(|id| self.key_requests.read().unwrap().get(&id).cloned()))
    }

    async fn get_key_requests_by_state(
        &self,
        state: RoomKeyRequestState,
    ) -> Result<Vec<OutgoingRoomKeyRequest>> {
        Ok(self
            .key_requests
            .read()
            .unwrap()
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect())
    }

    async fn is_device_announced(&self) -> Result<bool> {
        Ok(*self.device_announced.read().unwrap())
    }

    async fn set_device_announced(&self) -> Result<()> {
        *self.device_announced.write().unwrap() = true;
        Ok(())
    }

    async fn get_global_blacklist(&self) -> Result<bool> {
        Ok(*self.global_blacklist.read().unwrap())
    }

    async fn set_global_blacklist(&self, blacklist: bool) -> Result<()> {
        *self.global_blacklist.write().unwrap() = blacklist;
        Ok(())
    }

    async fn get_room_blacklist(&self, room_id: &RoomId) -> Result<bool> {
        Ok(self.blacklisted_rooms.read().unwrap().contains(room_id))
    }

    async fn set_room_blacklist(&self, room_id: &RoomId, blacklist: bool) -> Result<()> {
        let mut rooms = self.blacklisted_rooms.write().unwrap();

        if blacklist {
            rooms.insert(room_id.clone());
        } else {
            rooms.remove(room_id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lattice_common::{DeviceId, RoomId, UserId};

    use super::MemoryStore;
    use crate::{
        identities::DeviceIdentity,
        olm::{Account, EncryptionSettings, InboundGroupSession, OutboundGroupSession},
        store::CryptoStore,
    };

    fn room_id() -> RoomId {
        RoomId::parse("!test:localhost").unwrap()
    }

    #[tokio::test]
    async fn account_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load_account().await.unwrap().is_none());

        let account =
            Account::new(UserId::parse("@alice:localhost").unwrap(), DeviceId::new("ALICEDEV"));
        store.save_account(account.pickle()).await.unwrap();

        let loaded = store.load_account().await.unwrap().unwrap();
        let restored = Account::from_pickle(loaded);
        assert_eq!(restored.identity_keys(), account.identity_keys());
    }

    #[tokio::test]
    async fn inbound_group_sessions_are_never_replaced() {
        let store = MemoryStore::new();
        let outbound = OutboundGroupSession::new(room_id(), EncryptionSettings::default());

        let session = InboundGroupSession::new(
            &outbound.session_key().await,
            room_id(),
            "sender_key".to_owned(),
            Default::default(),
        );

        assert!(store.save_inbound_group_session(session.clone()).await.unwrap());
        // The second save with the same triplet is a no-op.
        assert!(!store.save_inbound_group_session(session).await.unwrap());

        assert_eq!(store.get_inbound_group_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn devices_are_stored_and_deleted() {
        let store = MemoryStore::new();
        let account =
            Account::new(UserId::parse("@bob:localhost").unwrap(), DeviceId::new("BOBDEV"));
        let device = DeviceIdentity::new(account.device_keys().unwrap()).unwrap();

        store.save_devices(&[device.clone()]).await.unwrap();
        assert!(store
            .get_device(device.user_id(), device.device_id())
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.get_user_devices(device.user_id()).await.unwrap().len(), 1);

        store.delete_device(device.user_id(), device.device_id()).await.unwrap();
        assert!(store
            .get_device(device.user_id(), device.device_id())
            .await
            .unwrap()
            .is_none());
    }
}
