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

//! Test helpers: an in-memory server standing in for the network.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex as StdMutex,
    },
};

use async_trait::async_trait;
use lattice_common::{DeviceId, RoomId, ServerName, UserId};
use serde_json::Value;
use tokio::sync::watch;

use crate::{
    machine::MembershipSource,
    network::{
        ConnectivityMonitor, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest,
        KeysQueryResponse, KeysUploadRequest, KeysUploadResponse, NetworkClient, NetworkError,
        ToDeviceRequest,
    },
    types::SignedOneTimeKey,
};

/// A scriptable [`NetworkClient`] recording every request it receives.
#[derive(Debug, Default)]
pub(crate) struct MockNetwork {
    queries: StdMutex<Vec<KeysQueryRequest>>,
    uploads: StdMutex<Vec<KeysUploadRequest>>,
    claims: StdMutex<Vec<KeysClaimRequest>>,
    to_device: StdMutex<Vec<ToDeviceRequest>>,

    device_keys: StdMutex<BTreeMap<UserId, BTreeMap<DeviceId, Value>>>,
    one_time_keys: StdMutex<BTreeMap<(UserId, DeviceId), Vec<SignedOneTimeKey>>>,
    otk_count: AtomicU64,
    fail_to_device: AtomicBool,
    failing_servers: StdMutex<BTreeSet<ServerName>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the given raw device key payload on key queries.
    pub fn add_device_keys(&self, user_id: UserId, device_id: DeviceId, keys: Value) {
        self.device_keys.lock().unwrap().entry(user_id).or_default().insert(device_id, keys);
    }

    /// Remove a device from the served device list.
    pub fn remove_device(&self, user_id: &UserId, device_id: &DeviceId) {
        if let Some(devices) = self.device_keys.lock().unwrap().get_mut(user_id) {
            devices.remove(device_id);
        }
    }

    /// Make a one-time key claimable for the given device.
    pub fn add_one_time_key(&self, user_id: UserId, device_id: DeviceId, key: SignedOneTimeKey) {
        self.one_time_keys.lock().unwrap().entry((user_id, device_id)).or_default().push(key);
    }

    /// Pretend the given server is unreachable for key queries.
    pub fn set_server_failure(&self, server: ServerName, failing: bool) {
        let mut servers = self.failing_servers.lock().unwrap();
        if failing {
            servers.insert(server);
        } else {
            servers.remove(&server);
        }
    }

    /// Make every to-device send fail.
    pub fn fail_to_device(&self, fail: bool) {
        self.fail_to_device.store(fail, Ordering::SeqCst);
    }

    /// Pretend the server holds this many unclaimed one-time keys.
    pub fn set_otk_count(&self, count: u64) {
        self.otk_count.store(count, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }

    pub fn uploads(&self) -> Vec<KeysUploadRequest> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn to_device_requests(&self) -> Vec<ToDeviceRequest> {
        self.to_device.lock().unwrap().clone()
    }
}

/// A scriptable [`MembershipSource`].
#[derive(Debug, Default)]
pub(crate) struct StubMembership {
    rooms: StdMutex<BTreeMap<RoomId, Vec<UserId>>>,
}

impl StubMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_members(&self, room_id: RoomId, members: Vec<UserId>) {
        self.rooms.lock().unwrap().insert(room_id, members);
    }
}

#[async_trait]
impl MembershipSource for StubMembership {
    async fn encrypted_rooms(&self) -> Vec<RoomId> {
        self.rooms.lock().unwrap().keys().cloned().collect()
    }

    async fn joined_members(&self, room_id: &RoomId) -> Vec<UserId> {
        self.rooms.lock().unwrap().get(room_id).cloned().unwrap_or_default()
    }
}

/// A [`ConnectivityMonitor`] the test can flip on and off.
#[derive(Debug)]
pub(crate) struct ToggleConnectivity {
    sender: watch::Sender<bool>,
}

impl ToggleConnectivity {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self { sender }
    }

    pub fn set_online(&self, online: bool) {
        self.sender.send_replace(online);
    }
}

impl ConnectivityMonitor for ToggleConnectivity {
    fn watch_connectivity(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl NetworkClient for MockNetwork {
    async fn upload_keys(
        &self,
        request: KeysUploadRequest,
    ) -> Result<KeysUploadResponse, NetworkError> {
        self.otk_count.fetch_add(request.one_time_keys.len() as u64, Ordering::SeqCst);
        self.uploads.lock().unwrap().push(request);

        Ok(KeysUploadResponse {
            one_time_key_counts: BTreeMap::from([(
                "signed_curve25519".to_owned(),
                self.otk_count.load(Ordering::SeqCst),
            )]),
        })
    }

    async fn query_keys(
        &self,
        request: KeysQueryRequest,
    ) -> Result<KeysQueryResponse, NetworkError> {
        // Yield once so concurrent callers get a chance to attach to the
        // same in-flight query.
        tokio::task::yield_now().await;

        let users: Vec<UserId> = request.device_keys.keys().cloned().collect();
        self.queries.lock().unwrap().push(request);

        let failing = self.failing_servers.lock().unwrap().clone();
        let device_keys = self.device_keys.lock().unwrap();

        let mut response = KeysQueryResponse::default();
        for user in users {
            if failing.contains(&user.server_name()) {
                continue;
            }

            response
                .device_keys
                .insert(user.clone(), device_keys.get(&user).cloned().unwrap_or_default());
        }
        for server in failing {
            response
                .failures
                .insert(server, serde_json::json!({ "errcode": "M_UNREACHABLE" }));
        }

        Ok(response)
    }

    async fn claim_one_time_keys(
        &self,
        request: KeysClaimRequest,
    ) -> Result<KeysClaimResponse, NetworkError> {
        let mut response = KeysClaimResponse::default();
        let mut keys = self.one_time_keys.lock().unwrap();

        for (user_id, devices) in &request.one_time_keys {
            for device_id in devices.keys() {
                let Some(key) = keys
                    .get_mut(&(user_id.clone(), device_id.clone()))
                    .and_then(|k| k.pop())
                else {
                    continue;
                };

                response
                    .one_time_keys
                    .entry(user_id.clone())
                    .or_default()
                    .entry(device_id.clone())
                    .or_default()
                    .insert("signed_curve25519:claimed".to_owned(), key);
            }
        }

        self.claims.lock().unwrap().push(request);

        Ok(response)
    }

    async fn send_to_device(&self, request: ToDeviceRequest) -> Result<(), NetworkError> {
        if self.fail_to_device.load(Ordering::SeqCst) {
            return Err(NetworkError::Transport("to-device sending disabled".to_owned()));
        }

        self.to_device.lock().unwrap().push(request);
        Ok(())
    }
}
