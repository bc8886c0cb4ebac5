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
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock},
};

use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use lattice_common::{DeviceId, FailuresCache, ServerName, UserId};
use tracing::{debug, instrument, trace, warn};

use super::DeviceIdentity;
use crate::{
    error::{OlmError, OlmResult},
    network::{KeysQueryRequest, NetworkClient},
    store::CryptoStore,
    types::DeviceKeys,
};

type DeviceMap = HashMap<DeviceId, DeviceIdentity>;
type QueryResult = Result<BTreeMap<UserId, DeviceMap>, Arc<OlmError>>;
type SharedQuery = Shared<BoxFuture<'static, QueryResult>>;

/// The local replica of the federated device key directory.
///
/// Serves device lists out of the store, refreshes them over the network
/// when they are stale, coalesces concurrent refreshes for the same user
/// into one query, and backs off from servers that keep failing.
#[derive(Clone, Debug)]
pub struct DeviceKeyDirectory {
    own_user_id: UserId,
    own_device_id: DeviceId,
    store: Arc<dyn CryptoStore>,
    network: Arc<dyn NetworkClient>,
    /// Servers whose users we couldn't query recently.
    failures: FailuresCache<ServerName>,
    /// Users whose device list may be stale and needs a refresh.
    outdated: Arc<StdRwLock<HashSet<UserId>>>,
    /// Queries currently on the wire, keyed by every user they cover.
    #[allow(clippy::type_complexity)]
    in_flight: Arc<StdMutex<HashMap<UserId, SharedQuery>>>,
}

impl DeviceKeyDirectory {
    pub(crate) fn new(
        own_user_id: UserId,
        own_device_id: DeviceId,
        store: Arc<dyn CryptoStore>,
        network: Arc<dyn NetworkClient>,
    ) -> Self {
        Self {
            own_user_id,
            own_device_id,
            store,
            network,
            failures: FailuresCache::new(),
            outdated: Default::default(),
            in_flight: Default::default(),
        }
    }

    /// Flag the device lists of the given users as possibly stale.
    pub fn mark_outdated(&self, users: impl IntoIterator<Item = UserId>) {
        self.outdated.write().unwrap().extend(users);
    }

    /// The users currently flagged as having a stale device list.
    pub fn outdated_users(&self) -> Vec<UserId> {
        self.outdated.read().unwrap().iter().cloned().collect()
    }

    /// A single device of a user, from the local replica only.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> OlmResult<Option<DeviceIdentity>> {
        Ok(self.store.get_device(user_id, device_id).await?)
    }

    /// Refresh every user flagged as outdated, except those whose server is
    /// in backoff.
    pub async fn refresh_outdated(&self) -> OlmResult<()> {
        let users: Vec<UserId> = self
            .outdated_users()
            .into_iter()
            .filter(|u| !self.failures.contains(&u.server_name()))
            .collect();

        if !users.is_empty() {
            self.download_keys(users, true).await?;
        }

        Ok(())
    }

    /// The device lists of the given users.
    ///
    /// Users with a fresh local replica are served from the store; the rest
    /// are fetched, unless `force` refetches everyone. Concurrent calls
    /// asking for the same user share a single network query. Users whose
    /// server is in failure backoff are served from the replica and stay
    /// flagged as outdated.
    #[instrument(skip(self, users))]
    pub async fn download_keys(
        &self,
        users: Vec<UserId>,
        force: bool,
    ) -> OlmResult<BTreeMap<UserId, DeviceMap>> {
        let mut result = BTreeMap::new();
        let mut need_query = Vec::new();

        for user in users {
            let cached = self.store.get_user_devices(&user).await?;
            let outdated = self.outdated.read().unwrap().contains(&user);

            if !force && !cached.is_empty() && !outdated {
                result.insert(user, cached);
            } else if self.failures.contains(&user.server_name()) {
                trace!(
                    user_id = user.as_str(),
                    "the user's server is in failure backoff, serving the local replica"
                );
                self.mark_outdated([user.clone()]);
                result.insert(user, cached);
            } else {
                need_query.push(user);
            }
        }

        if need_query.is_empty() {
            return Ok(result);
        }

        // Attach to in-flight queries where possible, start one batched
        // query for everyone else.
        let mut waiting: Vec<(Vec<UserId>, SharedQuery)> = Vec::new();
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let mut fresh = Vec::new();

            for user in need_query {
                if let Some(query) = in_flight.get(&user) {
                    trace!(user_id = user.as_str(), "attaching to an in-flight key query");
                    waiting.push((vec![user], query.clone()));
                } else {
                    fresh.push(user);
                }
            }

            if !fresh.is_empty() {
                let query = self.clone().run_query(fresh.clone()).boxed().shared();
                for user in &fresh {
                    in_flight.insert(user.clone(), query.clone());
                }
                waiting.push((fresh, query));
            }
        }

        for (users, query) in waiting {
            let devices = query.await.map_err(OlmError::KeysQuery)?;

            for user in users {
                result.insert(user.clone(), devices.get(&user).cloned().unwrap_or_default());
            }
        }

        Ok(result)
    }

    /// Run one batched key query and record the results, detaching the
    /// covered users from the in-flight table when done.
    async fn run_query(self, users: Vec<UserId>) -> QueryResult {
        let result = self.query_and_store(&users).await.map_err(Arc::new);

        let mut in_flight = self.in_flight.lock().unwrap();
        for user in &users {
            in_flight.remove(user);
        }

        result
    }

    async fn query_and_store(&self, users: &[UserId]) -> OlmResult<BTreeMap<UserId, DeviceMap>> {
        let request = KeysQueryRequest {
            device_keys: users.iter().map(|u| (u.clone(), Vec::new())).collect(),
        };
        let response = self.network.query_keys(request).await?;

        if !response.failures.is_empty() {
            debug!(failures = ?response.failures.keys(), "some servers failed the key query");
            self.failures.extend(response.failures.keys().cloned());
        }

        let mut result = BTreeMap::new();

        for user in users {
            if response.failures.contains_key(&user.server_name()) {
                // Keep the stale flag so the next maintenance pass retries.
                self.mark_outdated([user.clone()]);
                result.insert(user.clone(), self.store.get_user_devices(user).await?);
                continue;
            }

            self.failures.remove([&user.server_name()].into_iter());

            let received = response.device_keys.get(user).cloned().unwrap_or_default();
            let devices = self.handle_device_list(user, received).await?;

            self.outdated.write().unwrap().remove(user);
            result.insert(user.clone(), devices);
        }

        Ok(result)
    }

    /// Fold a freshly downloaded device list into the local replica.
    ///
    /// Payloads failing validation are dropped; known devices keep their
    /// pinned signing key; devices missing from the response are deleted.
    async fn handle_device_list(
        &self,
        user_id: &UserId,
        received: BTreeMap<DeviceId, serde_json::Value>,
    ) -> OlmResult<DeviceMap> {
        let mut replica = self.store.get_user_devices(user_id).await?;
        let mut changed = Vec::new();
        let mut seen = HashSet::new();

        for (device_id, payload) in received {
            let device_keys: DeviceKeys = match serde_json::from_value(payload) {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(
                        user_id = user_id.as_str(),
                        device_id = device_id.as_str(),
                        error = %e,
                        "received an unparsable device key payload"
                    );
                    continue;
                }
            };

            if device_keys.user_id != *user_id || device_keys.device_id != device_id {
                warn!(
                    user_id = user_id.as_str(),
                    device_id = device_id.as_str(),
                    "device key payload envelope doesn't match its contents"
                );
                continue;
            }

            seen.insert(device_id.clone());

            match replica.get(&device_id) {
                Some(existing) => {
                    if let Err(e) = existing.update(&device_keys) {
                        warn!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            error = %e,
                            "rejected a device key update"
                        );
                    } else {
                        changed.push(existing.clone());
                    }
                }
                None => match DeviceIdentity::new(device_keys) {
                    Ok(device) => {
                        // Our own current device is trivially acknowledged.
                        if *user_id == self.own_user_id && device_id == self.own_device_id {
                            device.set_known(true);
                        }

                        debug!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            "discovered a new device"
                        );
                        replica.insert(device_id, device.clone());
                        changed.push(device);
                    }
                    Err(e) => {
                        warn!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            error = %e,
                            "rejected an invalid device key payload"
                        );
                    }
                },
            }
        }

        let removed: Vec<DeviceId> =
            replica.keys().filter(|id| !seen.contains(*id)).cloned().collect();
        for device_id in removed {
            debug!(
                user_id = user_id.as_str(),
                device_id = device_id.as_str(),
                "a device was removed on the server"
            );
            self.store.delete_device(user_id, &device_id).await?;
            replica.remove(&device_id);
        }

        self.store.save_devices(&changed).await?;

        Ok(replica)
    }
}
