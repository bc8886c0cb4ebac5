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

//! The persistence boundary of the engine.
//!
//! Everything the engine must survive a restart with goes through the
//! [`CryptoStore`] trait. The crate ships a [`MemoryStore`] used in tests
//! and by embedders that handle persistence elsewhere.

use std::collections::HashMap;

use async_trait::async_trait;
use lattice_common::{DeviceId, RoomId, TransactionId, UserId};
use thiserror::Error;

use crate::{
    gossiping::{OutgoingRoomKeyRequest, RoomKeyRequestState},
    identities::DeviceIdentity,
    olm::{InboundGroupSession, PickledAccount, Session},
    types::{events::RoomKeyRequestBody, EventEncryptionAlgorithm},
};

mod memorystore;

pub use memorystore::MemoryStore;

/// The error type for the storage layer.
#[derive(Error, Debug)]
pub enum CryptoStoreError {
    /// A value couldn't be serialized for storage or deserialized back.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// The storage backend failed.
    #[error("the storage backend failed: {0}")]
    Backend(String),
}

type Result<T> = std::result::Result<T, CryptoStoreError>;

/// Trait collecting everything the engine persists.
///
/// Implementations must apply each call atomically; the engine orders its
/// calls so that ratchet state is persisted before the matching ciphertext
/// leaves the engine.
#[async_trait]
pub trait CryptoStore: Send + Sync + std::fmt::Debug {
    /// Load the pickled account, if one was stored before.
    async fn load_account(&self) -> Result<Option<PickledAccount>>;

    /// Persist the account.
    async fn save_account(&self, account: PickledAccount) -> Result<()>;

    /// Persist the given pairwise sessions.
    async fn save_sessions(&self, sessions: &[Session]) -> Result<()>;

    /// All pairwise sessions established with the device owning the given
    /// curve25519 identity key.
    async fn get_sessions(&self, sender_key: &str) -> Result<Vec<Session>>;

    /// Persist an inbound group session.
    ///
    /// A session already present under the same `(room_id, sender_key,
    /// session_id)` is kept untouched and `false` returned, so an attacker
    /// can't replace a key we already hold.
    async fn save_inbound_group_session(&self, session: InboundGroupSession) -> Result<bool>;

    /// Look up an inbound group session.
    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>>;

    /// Every stored inbound group session.
    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>>;

    /// Persist the given devices.
    async fn save_devices(&self, devices: &[DeviceIdentity]) -> Result<()>;

    /// Remove a device, used only when the server reports it as deleted.
    async fn delete_device(&self, user_id: &UserId, device_id: &DeviceId) -> Result<()>;

    /// Look up a single device of a user.
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceIdentity>>;

    /// All known devices of a user.
    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<HashMap<DeviceId, DeviceIdentity>>;

    /// The encryption algorithm a room was configured with.
    async fn get_room_algorithm(&self, room_id: &RoomId)
        -> Result<Option<EventEncryptionAlgorithm>>;

    /// Bind a room to an encryption algorithm. The binding is permanent.
    async fn set_room_algorithm(
        &self,
        room_id: &RoomId,
        algorithm: EventEncryptionAlgorithm,
    ) -> Result<()>;

    /// Persist an outgoing room key request, indexing it by id and body.
    async fn save_outgoing_key_request(&self, request: OutgoingRoomKeyRequest) -> Result<()>;

    /// Forget an outgoing room key request.
    async fn delete_outgoing_key_request(&self, request_id: &TransactionId) -> Result<()>;

    /// Look up an outgoing key request by its request id.
    async fn get_outgoing_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<OutgoingRoomKeyRequest>>;

    /// Look up an outgoing key request by the key it asks for.
    async fn get_key_request_by_body(
        &self,
        body: &RoomKeyRequestBody,
    ) -> Result<Option<OutgoingRoomKeyRequest>>;

    /// All outgoing key requests currently in the given state.
    async fn get_key_requests_by_state(
        &self,
        state: RoomKeyRequestState,
    ) -> Result<Vec<OutgoingRoomKeyRequest>>;

    /// Was the `m.new_device` announcement already sent for this device?
    async fn is_device_announced(&self) -> Result<bool>;

    /// Record that the `m.new_device` announcement went out.
    async fn set_device_announced(&self) -> Result<()>;

    /// Should unverified devices be excluded from all rooms?
    async fn get_global_blacklist(&self) -> Result<bool>;

    /// Set the global unverified-device policy.
    async fn set_global_blacklist(&self, blacklist: bool) -> Result<()>;

    /// Should unverified devices be excluded from this room?
    async fn get_room_blacklist(&self, room_id: &RoomId) -> Result<bool>;

    /// Set the per-room unverified-device policy.
    async fn set_room_blacklist(&self, room_id: &RoomId, blacklist: bool) -> Result<()>;
}
