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

//! The engine façade tying everything together.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use lattice_common::{DeviceId, RoomId, UserId};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};
use vodozemac::megolm::SessionKey;

use crate::{
    algorithms::{encryption_failure, AlgorithmRegistry, RoomCryptoDispatcher},
    error::{CryptoError, EncryptionError, OlmResult},
    gossiping::OutgoingKeyRequestManager,
    identities::{DeviceIdentity, DeviceKeyDirectory, LocalTrust},
    network::{ConnectivityMonitor, KeysUploadRequest, NetworkClient, NetworkError, ToDeviceRequest},
    olm::{Account, EncryptionSettings, InboundGroupSession},
    session_manager::{DecryptedToDevice, RoomKeyImportResult, SessionManager},
    store::{CryptoStore, CryptoStoreError},
    types::{
        events::{EncryptedEventContent, RoomKeyContent, RoomKeyRequestBody},
        EventEncryptionAlgorithm,
    },
};

/// Where the engine is in its startup lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// The engine was created but never started.
    NotStarted,
    /// Startup is running: initial key uploads and announcements.
    Starting,
    /// Startup finished, the engine is fully operational.
    Started,
}

/// Who is in which encrypted room.
///
/// Room state lives outside the engine; this is how the engine asks for it.
#[async_trait]
pub trait MembershipSource: Send + Sync + std::fmt::Debug {
    /// Every room the local user has encryption enabled in.
    async fn encrypted_rooms(&self) -> Vec<RoomId>;

    /// The joined members of a room.
    async fn joined_members(&self, room_id: &RoomId) -> Vec<UserId>;
}

/// Tunables for the engine.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// How outbound group sessions are created and rotated.
    pub encryption: EncryptionSettings,
    /// Refuse to encrypt for rooms containing devices the application never
    /// acknowledged.
    pub block_on_unknown_devices: bool,
    /// How many one-time keys to generate and upload per request.
    pub one_time_key_batch_size: u64,
    /// How long to wait before retrying a failed startup request.
    pub retry_delay: Duration,
    /// The minimum interval between one-time key top-ups.
    pub maintenance_interval: Duration,
    /// How long queued room key requests sit before being sent.
    pub key_request_delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            encryption: EncryptionSettings::default(),
            block_on_unknown_devices: true,
            one_time_key_batch_size: 10,
            retry_delay: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(60),
            key_request_delay: Duration::from_millis(500),
        }
    }
}

/// The result of decrypting an event.
///
/// Decryption failures are carried here rather than returned as call
/// failures, so the caller can render an undecryptable placeholder and
/// attach the reason to it.
#[derive(Debug)]
pub struct DecryptedEvent {
    /// The decrypted event, a JSON object with `type` and `content`. Absent
    /// when decryption failed.
    pub clear_event: Option<Value>,
    /// The curve25519 key the event arrived over.
    pub sender_curve25519_key: Option<String>,
    /// The ed25519 key the sender claimed. Trustworthy only once the
    /// sending device is verified.
    pub claimed_ed25519_key: Option<String>,
    /// The group session id for room events.
    pub session_id: Option<String>,
    /// Why decryption failed, if it did.
    pub error: Option<CryptoError>,
}

impl DecryptedEvent {
    /// Did decryption succeed?
    pub fn is_decrypted(&self) -> bool {
        self.clear_event.is_some()
    }

    fn failure(error: CryptoError) -> Self {
        Self {
            clear_event: None,
            sender_curve25519_key: None,
            claimed_ed25519_key: None,
            session_id: None,
            error: Some(error),
        }
    }
}

/// The end-to-end encryption engine.
///
/// One instance per device. All public methods take `&self`; the engine is
/// cheap to clone and safe to share.
#[derive(Clone, Debug)]
pub struct CryptoEngine {
    inner: Arc<EngineInner>,
}

#[derive(Debug)]
struct EngineInner {
    sessions: SessionManager,
    directory: DeviceKeyDirectory,
    dispatcher: RoomCryptoDispatcher,
    key_requests: OutgoingKeyRequestManager,
    store: Arc<dyn CryptoStore>,
    network: Arc<dyn NetworkClient>,
    membership: Arc<dyn MembershipSource>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    settings: EngineSettings,
    block_on_unknown_devices: Arc<AtomicBool>,

    state: watch::Sender<EngineState>,
    /// Serializes startup; later callers wait for the first one.
    start_lock: Mutex<()>,
    /// The outgoing lane: encryptions run strictly one at a time, in call
    /// order, so ratchet advances hit the store in the order they happened.
    encryption_lane: Mutex<()>,
    /// The incoming lane, independent of the outgoing one.
    decryption_lane: Mutex<()>,
    last_key_maintenance: StdMutex<Option<Instant>>,
}

impl CryptoEngine {
    /// Create an engine for the given device, restoring the account from
    /// the store or creating a fresh identity.
    pub async fn new(
        user_id: UserId,
        device_id: DeviceId,
        store: Arc<dyn CryptoStore>,
        network: Arc<dyn NetworkClient>,
        membership: Arc<dyn MembershipSource>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        settings: EngineSettings,
    ) -> Result<Self, CryptoStoreError> {
        let account = match store.load_account().await? {
            Some(pickle) => {
                if pickle.user_id != user_id || pickle.device_id != device_id {
                    return Err(CryptoStoreError::Backend(format!(
                        "the stored account belongs to {} {}, not {} {}",
                        pickle.user_id, pickle.device_id, user_id, device_id
                    )));
                }
                Account::from_pickle(pickle)
            }
            None => {
                let account = Account::new(user_id.clone(), device_id.clone());
                store.save_account(account.pickle()).await?;
                info!(
                    user_id = user_id.as_str(),
                    device_id = device_id.as_str(),
                    "created a new cryptographic identity"
                );
                account
            }
        };

        let sessions = SessionManager::new(account, store.clone());
        let directory =
            DeviceKeyDirectory::new(user_id, device_id.clone(), store.clone(), network.clone());
        let key_requests = OutgoingKeyRequestManager::new(
            device_id,
            store.clone(),
            network.clone(),
            settings.key_request_delay,
        );
        let block_on_unknown_devices =
            Arc::new(AtomicBool::new(settings.block_on_unknown_devices));

        let registry = AlgorithmRegistry {
            sessions: sessions.clone(),
            directory: directory.clone(),
            store: store.clone(),
            network: network.clone(),
            membership: membership.clone(),
            key_requests: key_requests.clone(),
            encryption_settings: settings.encryption.clone(),
            block_on_unknown_devices: block_on_unknown_devices.clone(),
        };

        let (state, _) = watch::channel(EngineState::NotStarted);

        Ok(Self {
            inner: Arc::new(EngineInner {
                sessions,
                directory,
                dispatcher: RoomCryptoDispatcher::new(registry),
                key_requests,
                store,
                network,
                membership,
                connectivity,
                settings,
                block_on_unknown_devices,
                state,
                start_lock: Mutex::new(()),
                encryption_lane: Mutex::new(()),
                decryption_lane: Mutex::new(()),
                last_key_maintenance: StdMutex::new(None),
            }),
        })
    }

    /// The current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    /// Subscribe to lifecycle state changes.
    pub fn state_updates(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    /// Run startup: wait for connectivity, publish our device keys, top up
    /// the one-time key pool, and announce the device to encrypted rooms.
    ///
    /// Idempotent; concurrent callers wait for the first one to finish.
    /// Network failures are retried indefinitely, so this only returns an
    /// error when the store fails.
    #[instrument(skip(self))]
    pub async fn start(&self) -> OlmResult<()> {
        if self.state() == EngineState::Started {
            return Ok(());
        }

        let _guard = self.inner.start_lock.lock().await;
        if self.state() == EngineState::Started {
            return Ok(());
        }

        // Hold off while the application is offline; startup resumes by
        // itself once connectivity returns.
        let mut connectivity = self.inner.connectivity.watch_connectivity();
        while !*connectivity.borrow_and_update() {
            debug!("waiting for connectivity before starting");
            if connectivity.changed().await.is_err() {
                // The monitor is gone; assume we're online and find out.
                break;
            }
        }

        self.inner.state.send_replace(EngineState::Starting);

        self.upload_device_keys().await?;
        self.run_key_maintenance(true).await?;
        self.announce_new_device().await?;

        self.inner.state.send_replace(EngineState::Started);
        info!("the encryption engine is ready");

        self.inner.key_requests.schedule_drain();

        Ok(())
    }

    /// Reset the lifecycle so the next [`CryptoEngine::start`] runs startup
    /// again. Already-published keys stay published.
    pub fn stop(&self) {
        self.inner.state.send_replace(EngineState::NotStarted);
    }

    /// Retry a network request until it succeeds.
    async fn with_retries<T, F, Fut>(&self, mut request: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, NetworkError>>,
    {
        loop {
            match request().await {
                Ok(value) => return value,
                Err(e) => {
                    warn!(error = %e, "a request failed, retrying");
                    tokio::time::sleep(self.inner.settings.retry_delay).await;
                }
            }
        }
    }

    /// Publish our signed device keys, once.
    async fn upload_device_keys(&self) -> OlmResult<()> {
        let account = self.inner.sessions.account();
        let account = account.lock().await;

        if account.shared() {
            return Ok(());
        }

        let device_keys = account.device_keys()?;
        let response = self
            .with_retries(|| {
                let request = KeysUploadRequest {
                    device_keys: Some(device_keys.clone()),
                    ..Default::default()
                };
                async move { self.inner.network.upload_keys(request).await }
            })
            .await;

        account.mark_as_shared();
        if let Some(count) = response.one_time_key_counts.get("signed_curve25519") {
            account.update_uploaded_key_count(*count);
        }
        self.inner.store.save_account(account.pickle()).await?;

        info!("published the device keys");

        Ok(())
    }

    /// Top up the server-side one-time key pool to half the ratchet's
    /// capacity, in batches.
    ///
    /// The server count is authoritative: an empty upload fetches it first,
    /// so a key pool drained from another login is noticed.
    async fn run_key_maintenance(&self, force: bool) -> OlmResult<()> {
        if !force {
            let last = self.inner.last_key_maintenance.lock().unwrap();
            if let Some(last) = *last {
                if last.elapsed() < self.inner.settings.maintenance_interval {
                    return Ok(());
                }
            }
        }

        let response = self
            .with_retries(|| async move {
                self.inner.network.upload_keys(KeysUploadRequest::default()).await
            })
            .await;
        let server_count =
            response.one_time_key_counts.get("signed_curve25519").copied().unwrap_or(0);

        let account = self.inner.sessions.account();
        let target = {
            let account = account.lock().await;
            account.update_uploaded_key_count(server_count);
            (account.max_one_time_keys() as u64 / 2).saturating_sub(server_count)
        };

        if target > 0 {
            debug!(count = target, "topping up the one-time key pool");
        }

        let mut remaining = target;
        while remaining > 0 {
            let batch = remaining.min(self.inner.settings.one_time_key_batch_size);

            let one_time_keys = {
                let mut account = account.lock().await;
                account.generate_one_time_keys(batch as usize);
                account.signed_one_time_keys()?
            };

            let response = self
                .with_retries(|| {
                    let request = KeysUploadRequest {
                        device_keys: None,
                        one_time_keys: one_time_keys.clone(),
                    };
                    async move { self.inner.network.upload_keys(request).await }
                })
                .await;

            {
                let mut account = account.lock().await;
                account.mark_keys_as_published();
                if let Some(count) = response.one_time_key_counts.get("signed_curve25519") {
                    account.update_uploaded_key_count(*count);
                }
                self.inner.store.save_account(account.pickle()).await?;
            }

            remaining -= batch;
        }

        *self.inner.last_key_maintenance.lock().unwrap() = Some(Instant::now());

        Ok(())
    }

    /// Tell the members of every encrypted room that this device exists, so
    /// their clients know to share new room keys with it. Sent once per
    /// device, ever.
    async fn announce_new_device(&self) -> OlmResult<()> {
        if self.inner.store.is_device_announced().await? {
            return Ok(());
        }

        let rooms = self.inner.membership.encrypted_rooms().await;

        let mut recipients: BTreeMap<UserId, BTreeMap<DeviceId, Value>> = BTreeMap::new();
        let content = json!({
            "device_id": self.inner.sessions.own_device_id(),
            "rooms": rooms,
        });

        for room in &rooms {
            for member in self.inner.membership.joined_members(room).await {
                recipients
                    .entry(member)
                    .or_default()
                    .insert(DeviceId::new("*"), content.clone());
            }
        }

        if !recipients.is_empty() {
            self.with_retries(|| {
                let request = ToDeviceRequest::new("m.new_device", recipients.clone());
                async move { self.inner.network.send_to_device(request).await }
            })
            .await;

            info!(rooms = rooms.len(), "announced this device to encrypted rooms");
        }

        self.inner.store.set_device_announced().await?;

        Ok(())
    }

    /// Bind a room to an encryption algorithm.
    ///
    /// Returns `true` when the room was newly bound. The binding is
    /// permanent: a later call with a different algorithm is ignored with a
    /// warning, since downgrading a room's encryption mid-flight is exactly
    /// what a malicious server would ask for.
    pub async fn set_room_encryption(
        &self,
        room_id: &RoomId,
        algorithm: EventEncryptionAlgorithm,
    ) -> Result<bool, CryptoStoreError> {
        match self.inner.store.get_room_algorithm(room_id).await? {
            Some(existing) if existing != algorithm => {
                warn!(
                    room_id = room_id.as_str(),
                    bound = %existing,
                    requested = %algorithm,
                    "ignoring an attempt to re-bind an encrypted room"
                );
                Ok(false)
            }
            Some(_) => Ok(false),
            None => {
                self.inner.store.set_room_algorithm(room_id, algorithm).await?;

                // The members' devices will be needed soon.
                let members = self.inner.membership.joined_members(room_id).await;
                self.inner.directory.mark_outdated(members);

                info!(room_id = room_id.as_str(), "enabled encryption for the room");
                Ok(true)
            }
        }
    }

    /// Encrypt a room event.
    ///
    /// Starts the engine if needed, resolves the room's algorithm binding,
    /// and runs the encryption on the serialized outgoing lane.
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> Result<EncryptedEventContent, EncryptionError> {
        let algorithm = self
            .inner
            .store
            .get_room_algorithm(room_id)
            .await?
            .ok_or_else(|| EncryptionError::NotEnabled(room_id.clone()))?;

        self.start().await.map_err(|e| encryption_failure(algorithm.clone(), &e))?;

        let _lane = self.inner.encryption_lane.lock().await;

        let encryptor = self
            .inner
            .dispatcher
            .encryptor(room_id, &algorithm)
            .map_err(|e| encryption_failure(algorithm.clone(), &e))?;

        encryptor.encrypt(event_type, content).await
    }

    /// Decrypt a room event.
    ///
    /// Never fails as a call: undecryptable events come back with the
    /// failure attached so the caller can render a placeholder. A missing
    /// room key additionally queues a key request towards our other
    /// devices.
    pub async fn decrypt_room_event(
        &self,
        room_id: &RoomId,
        sender: &UserId,
        content: &EncryptedEventContent,
    ) -> DecryptedEvent {
        let _lane = self.inner.decryption_lane.lock().await;

        match content {
            EncryptedEventContent::MegolmV1AesSha2(c) => {
                let decryptor = match self
                    .inner
                    .dispatcher
                    .decryptor(Some(room_id), &content.algorithm())
                {
                    Ok(decryptor) => decryptor,
                    Err(e) => return DecryptedEvent::failure(e.into()),
                };

                match decryptor.decrypt_room_event(c).await {
                    Ok(decrypted) => DecryptedEvent {
                        clear_event: Some(decrypted.event),
                        sender_curve25519_key: Some(c.sender_key.clone()),
                        claimed_ed25519_key: decrypted
                            .sender_claimed_keys
                            .get("ed25519")
                            .cloned(),
                        session_id: Some(c.session_id.clone()),
                        error: None,
                    },
                    Err(e) => {
                        debug!(
                            room_id = room_id.as_str(),
                            session_id = c.session_id,
                            error = %e,
                            "failed to decrypt a room event"
                        );
                        DecryptedEvent {
                            session_id: Some(c.session_id.clone()),
                            sender_curve25519_key: Some(c.sender_key.clone()),
                            ..DecryptedEvent::failure(e.into())
                        }
                    }
                }
            }
            EncryptedEventContent::OlmV1Curve25519AesSha2(c) => {
                let decryptor = match self
                    .inner
                    .dispatcher
                    .decryptor(Some(room_id), &content.algorithm())
                {
                    Ok(decryptor) => decryptor,
                    Err(e) => return DecryptedEvent::failure(e.into()),
                };

                match decryptor.decrypt_olm_event(sender, c).await {
                    Ok(decrypted) => DecryptedEvent {
                        clear_event: Some(json!({
                            "type": decrypted.payload.event_type,
                            "content": decrypted.payload.content,
                        })),
                        sender_curve25519_key: Some(decrypted.sender_key),
                        claimed_ed25519_key: Some(decrypted.claimed_ed25519_key),
                        session_id: None,
                        error: None,
                    },
                    Err(e) => DecryptedEvent {
                        sender_curve25519_key: Some(c.sender_key.clone()),
                        ..DecryptedEvent::failure(e.into())
                    },
                }
            }
        }
    }

    /// Decrypt a to-device event and process its payload.
    ///
    /// Room keys carried in `m.room_key` payloads are installed and any
    /// matching outgoing key request withdrawn.
    pub async fn receive_to_device_event(
        &self,
        sender: &UserId,
        content: &EncryptedEventContent,
    ) -> DecryptedEvent {
        let _lane = self.inner.decryption_lane.lock().await;

        let EncryptedEventContent::OlmV1Curve25519AesSha2(c) = content else {
            // Group encryption can't address a single device.
            return DecryptedEvent::failure(CryptoError::UnsupportedAlgorithm);
        };

        let decryptor = match self.inner.dispatcher.decryptor(None, &content.algorithm()) {
            Ok(decryptor) => decryptor,
            Err(e) => return DecryptedEvent::failure(e.into()),
        };

        match decryptor.decrypt_olm_event(sender, c).await {
            Ok(decrypted) => {
                if decrypted.payload.event_type == "m.room_key" {
                    if let Err(e) = self.receive_room_key(&decrypted).await {
                        warn!(error = %e, "failed to process a received room key");
                    }
                }

                DecryptedEvent {
                    clear_event: Some(json!({
                        "type": decrypted.payload.event_type,
                        "content": decrypted.payload.content,
                    })),
                    sender_curve25519_key: Some(decrypted.sender_key),
                    claimed_ed25519_key: Some(decrypted.claimed_ed25519_key),
                    session_id: None,
                    error: None,
                }
            }
            Err(e) => {
                warn!(
                    sender = sender.as_str(),
                    error = %e,
                    "failed to decrypt a to-device event"
                );
                DecryptedEvent {
                    sender_curve25519_key: Some(c.sender_key.clone()),
                    ..DecryptedEvent::failure(e.into())
                }
            }
        }
    }

    /// Install a group session delivered over a pairwise channel.
    async fn receive_room_key(&self, decrypted: &DecryptedToDevice) -> OlmResult<()> {
        let content: RoomKeyContent =
            serde_json::from_value(decrypted.payload.content.clone())?;

        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            warn!(
                algorithm = %content.algorithm,
                "received a room key for an unsupported algorithm"
            );
            return Ok(());
        }

        let session_key = match SessionKey::from_base64(&content.session_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    session_id = content.session_id,
                    error = %e,
                    "received an unparsable room key"
                );
                return Ok(());
            }
        };

        let session = InboundGroupSession::new(
            &session_key,
            content.room_id.clone(),
            decrypted.sender_key.clone(),
            BTreeMap::from([("ed25519".to_owned(), decrypted.claimed_ed25519_key.clone())]),
        );

        if self.inner.sessions.add_inbound_group_session(session).await? {
            info!(
                room_id = content.room_id.as_str(),
                session_id = content.session_id,
                "received a new room key"
            );

            // We may have been asking for exactly this key.
            let body = RoomKeyRequestBody {
                algorithm: content.algorithm,
                room_id: content.room_id,
                sender_key: decrypted.sender_key.clone(),
                session_id: content.session_id,
            };
            self.inner.key_requests.received_requested_key(&body).await?;
        }

        Ok(())
    }

    /// Run the periodic maintenance that follows a completed sync: refresh
    /// stale device lists, top up one-time keys, and nudge the key request
    /// queue.
    pub async fn on_sync_completed(&self) {
        if self.state() != EngineState::Started {
            return;
        }

        if let Err(e) = self.inner.directory.refresh_outdated().await {
            warn!(error = %e, "failed to refresh outdated device lists");
        }

        if let Err(e) = self.run_key_maintenance(false).await {
            warn!(error = %e, "failed to run one-time key maintenance");
        }

        self.inner.key_requests.schedule_drain();
    }

    /// A single device of a user, from the local replica.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceIdentity>, CryptoStoreError> {
        self.inner.store.get_device(user_id, device_id).await
    }

    /// The devices of a user, downloading them when the replica is empty or
    /// stale.
    pub async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> OlmResult<HashMap<DeviceId, DeviceIdentity>> {
        let mut devices = self.inner.directory.download_keys(vec![user_id.clone()], false).await?;

        Ok(devices.remove(user_id).unwrap_or_default())
    }

    /// Assign a local trust state to a device. Verifying or blacklisting a
    /// device also acknowledges it.
    pub async fn set_device_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> Result<(), CryptoStoreError> {
        let Some(device) = self.inner.store.get_device(user_id, device_id).await? else {
            return Err(CryptoStoreError::Backend(format!(
                "no such device: {user_id} {device_id}"
            )));
        };

        device.set_trust_state(trust);
        device.set_known(true);
        self.inner.store.save_devices(std::slice::from_ref(&device)).await
    }

    /// Acknowledge a device without changing its trust, unblocking group
    /// encryption under the unknown-device policy.
    pub async fn set_device_known(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        known: bool,
    ) -> Result<(), CryptoStoreError> {
        let Some(device) = self.inner.store.get_device(user_id, device_id).await? else {
            return Err(CryptoStoreError::Backend(format!(
                "no such device: {user_id} {device_id}"
            )));
        };

        device.set_known(known);
        self.inner.store.save_devices(std::slice::from_ref(&device)).await
    }

    /// Refuse to encrypt for never-acknowledged devices, or allow them.
    pub fn set_block_on_unknown_devices(&self, block: bool) {
        self.inner.block_on_unknown_devices.store(block, Ordering::SeqCst);
    }

    /// Exclude unverified devices from every room.
    pub async fn set_global_blacklist_unverified(
        &self,
        blacklist: bool,
    ) -> Result<(), CryptoStoreError> {
        self.inner.store.set_global_blacklist(blacklist).await
    }

    /// Exclude unverified devices from a single room.
    pub async fn set_room_blacklist_unverified(
        &self,
        room_id: &RoomId,
        blacklist: bool,
    ) -> Result<(), CryptoStoreError> {
        self.inner.store.set_room_blacklist(room_id, blacklist).await
    }

    /// Export every held room key into a passphrase protected container.
    pub async fn export_room_keys(
        &self,
        passphrase: &str,
        rounds: u32,
    ) -> Result<String, crate::error::KeyExportError> {
        let keys = self.inner.sessions.export_group_sessions().await?;

        crate::file_encryption::encrypt_room_key_export(&keys, passphrase, rounds)
    }

    /// Import room keys from a passphrase protected container.
    ///
    /// Authentication failure imports nothing; individually invalid keys
    /// are skipped and reflected in the returned counts.
    pub async fn import_room_keys(
        &self,
        export: &str,
        passphrase: &str,
    ) -> Result<RoomKeyImportResult, crate::error::KeyExportError> {
        let keys = crate::file_encryption::decrypt_room_key_export(export, passphrase)?;

        Ok(self.inner.sessions.import_group_sessions(keys).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use assert_matches::assert_matches;
    use lattice_common::{DeviceId, RoomId, UserId};
    use serde_json::json;
    use vodozemac::megolm::{GroupSession, SessionConfig};

    use super::{CryptoEngine, EngineSettings, EngineState};
    use crate::{
        error::{CryptoError, EncryptionError, KeyExportError},
        network::AlwaysOnline,
        olm::Account,
        store::MemoryStore,
        testing::{MockNetwork, StubMembership, ToggleConnectivity},
        types::{events::EncryptedEventContent, EventEncryptionAlgorithm},
    };

    fn alice_id() -> UserId {
        UserId::parse("@alice:localhost").unwrap()
    }

    fn alice_device() -> DeviceId {
        DeviceId::new("ALICEDEVICE")
    }

    fn bob_id() -> UserId {
        UserId::parse("@bob:localhost").unwrap()
    }

    fn bob_device() -> DeviceId {
        DeviceId::new("BOBDEVICE")
    }

    fn room_id() -> RoomId {
        RoomId::parse("!test:localhost").unwrap()
    }

    fn test_settings() -> EngineSettings {
        EngineSettings {
            retry_delay: Duration::from_millis(10),
            key_request_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn engine(
        user_id: UserId,
        device_id: DeviceId,
        network: Arc<MockNetwork>,
        membership: Arc<StubMembership>,
    ) -> CryptoEngine {
        CryptoEngine::new(
            user_id,
            device_id,
            Arc::new(MemoryStore::new()),
            network,
            membership,
            Arc::new(AlwaysOnline::new()),
            test_settings(),
        )
        .await
        .unwrap()
    }

    /// Hand one engine's published identity keys to another engine's server.
    fn relay_published_keys(from: &MockNetwork, to: &MockNetwork, user: UserId, device: DeviceId) {
        for upload in from.uploads() {
            if let Some(device_keys) = upload.device_keys {
                to.add_device_keys(
                    user.clone(),
                    device.clone(),
                    serde_json::to_value(device_keys).unwrap(),
                );
            }
            for key in upload.one_time_keys.into_values() {
                to.add_one_time_key(user.clone(), device.clone(), key);
            }
        }
    }

    #[tokio::test]
    async fn startup_publishes_device_keys_and_fills_the_key_pool() {
        let net = Arc::new(MockNetwork::new());
        let engine =
            engine(alice_id(), alice_device(), net.clone(), Arc::new(StubMembership::new())).await;

        assert_eq!(engine.state(), EngineState::NotStarted);
        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Started);

        let uploads = net.uploads();
        assert!(uploads[0].device_keys.is_some(), "the first upload must carry the device keys");

        let max = Account::new(alice_id(), alice_device()).max_one_time_keys() as u64;
        let uploaded: u64 = uploads.iter().map(|u| u.one_time_keys.len() as u64).sum();
        assert_eq!(uploaded, max / 2);

        // A second start must not re-publish anything.
        let uploads_before = net.uploads().len();
        engine.start().await.unwrap();
        assert_eq!(net.uploads().len(), uploads_before);
    }

    #[tokio::test]
    async fn startup_accounts_for_keys_the_server_already_holds() {
        let net = Arc::new(MockNetwork::new());
        net.set_otk_count(30);

        let engine =
            engine(alice_id(), alice_device(), net.clone(), Arc::new(StubMembership::new())).await;
        engine.start().await.unwrap();

        let max = Account::new(alice_id(), alice_device()).max_one_time_keys() as u64;
        let uploaded: u64 = net.uploads().iter().map(|u| u.one_time_keys.len() as u64).sum();
        assert_eq!(uploaded, max / 2 - 30);
    }

    #[tokio::test]
    async fn startup_waits_for_connectivity() {
        let net = Arc::new(MockNetwork::new());
        let connectivity = Arc::new(ToggleConnectivity::new(false));
        let engine = CryptoEngine::new(
            alice_id(),
            alice_device(),
            Arc::new(MemoryStore::new()),
            net.clone(),
            Arc::new(StubMembership::new()),
            connectivity.clone(),
            test_settings(),
        )
        .await
        .unwrap();

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.start().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.state(), EngineState::NotStarted);
        assert!(net.uploads().is_empty());

        connectivity.set_online(true);
        task.await.unwrap().unwrap();
        assert_eq!(engine.state(), EngineState::Started);
    }

    #[tokio::test]
    async fn a_new_device_is_announced_exactly_once() {
        let net = Arc::new(MockNetwork::new());
        let membership = Arc::new(StubMembership::new());
        membership.set_members(room_id(), vec![alice_id(), bob_id()]);

        let engine = engine(alice_id(), alice_device(), net.clone(), membership).await;
        engine.start().await.unwrap();

        let announcements: Vec<_> = net
            .to_device_requests()
            .into_iter()
            .filter(|r| r.event_type == "m.new_device")
            .collect();
        assert_eq!(announcements.len(), 1);
        assert!(announcements[0].messages[&bob_id()].contains_key(&DeviceId::new("*")));

        engine.stop();
        engine.start().await.unwrap();

        let announcements = net
            .to_device_requests()
            .into_iter()
            .filter(|r| r.event_type == "m.new_device")
            .count();
        assert_eq!(announcements, 1);
    }

    #[tokio::test]
    async fn encrypting_needs_an_enabled_room() {
        let net = Arc::new(MockNetwork::new());
        let engine =
            engine(alice_id(), alice_device(), net, Arc::new(StubMembership::new())).await;

        let err = engine
            .encrypt_room_event(&room_id(), "m.room.message", json!({ "body": "hello" }))
            .await
            .unwrap_err();

        assert_matches!(err, EncryptionError::NotEnabled(_));
    }

    #[tokio::test]
    async fn a_room_binds_to_its_first_algorithm() {
        let net = Arc::new(MockNetwork::new());
        let engine =
            engine(alice_id(), alice_device(), net, Arc::new(StubMembership::new())).await;

        assert!(engine
            .set_room_encryption(&room_id(), EventEncryptionAlgorithm::MegolmV1AesSha2)
            .await
            .unwrap());
        assert!(!engine
            .set_room_encryption(&room_id(), EventEncryptionAlgorithm::OlmV1Curve25519AesSha2)
            .await
            .unwrap());

        // The original binding survives the downgrade attempt.
        let engine2 = engine.clone();
        let algorithm = engine2.inner.store.get_room_algorithm(&room_id()).await.unwrap();
        assert_eq!(algorithm, Some(EventEncryptionAlgorithm::MegolmV1AesSha2));
    }

    #[tokio::test]
    async fn group_messages_flow_end_to_end() {
        let alice_net = Arc::new(MockNetwork::new());
        let bob_net = Arc::new(MockNetwork::new());
        let membership = Arc::new(StubMembership::new());
        membership.set_members(room_id(), vec![alice_id(), bob_id()]);

        let alice = engine(alice_id(), alice_device(), alice_net.clone(), membership).await;
        let bob =
            engine(bob_id(), bob_device(), bob_net.clone(), Arc::new(StubMembership::new())).await;

        bob.start().await.unwrap();
        relay_published_keys(&bob_net, &alice_net, bob_id(), bob_device());

        alice.start().await.unwrap();
        alice
            .set_room_encryption(&room_id(), EventEncryptionAlgorithm::MegolmV1AesSha2)
            .await
            .unwrap();

        // Bob's device has never been acknowledged, sending must block.
        let err = alice
            .encrypt_room_event(&room_id(), "m.room.message", json!({ "body": "it's a secret" }))
            .await
            .unwrap_err();
        assert_matches!(err, EncryptionError::UnknownDevices(_));

        alice.set_device_known(&bob_id(), &bob_device(), true).await.unwrap();

        let content = alice
            .encrypt_room_event(&room_id(), "m.room.message", json!({ "body": "it's a secret" }))
            .await
            .unwrap();

        // The room key went out to Bob over the pairwise channel; deliver it.
        let request = alice_net
            .to_device_requests()
            .into_iter()
            .find(|r| r.event_type == "m.room.encrypted")
            .unwrap();
        let encrypted: EncryptedEventContent =
            serde_json::from_value(request.messages[&bob_id()][&bob_device()].clone()).unwrap();

        let key_event = bob.receive_to_device_event(&alice_id(), &encrypted).await;
        assert_eq!(key_event.clear_event.as_ref().unwrap()["type"], "m.room_key");

        let decrypted = bob.decrypt_room_event(&room_id(), &alice_id(), &content).await;
        assert!(decrypted.error.is_none());
        assert_eq!(decrypted.clear_event.unwrap()["content"]["body"], "it's a secret");
        assert!(decrypted.session_id.is_some());
        assert!(decrypted.claimed_ed25519_key.is_some());
    }

    #[tokio::test]
    async fn a_missing_room_key_is_requested_from_our_devices() {
        let net = Arc::new(MockNetwork::new());
        let engine =
            engine(bob_id(), bob_device(), net.clone(), Arc::new(StubMembership::new())).await;

        let mut outbound = GroupSession::new(SessionConfig::version_1());
        let payload = json!({ "room_id": room_id(), "type": "m.room.message", "content": {} });
        let ciphertext = outbound.encrypt(serde_json::to_string(&payload).unwrap().as_bytes());

        let content =
            EncryptedEventContent::MegolmV1AesSha2(crate::types::events::MegolmV1Content {
                sender_key: "mPVBpXkXk5BzJCtUyjapuJXHOXZbbrXhyPkvMDXjgTo".to_owned(),
                device_id: alice_device(),
                session_id: outbound.session_id(),
                ciphertext,
            });

        let event = engine.decrypt_room_event(&room_id(), &alice_id(), &content).await;
        assert!(!event.is_decrypted());
        assert_matches!(event.error, Some(CryptoError::UnknownInboundSession));

        // The request goes out after the batching delay.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(net
            .to_device_requests()
            .iter()
            .any(|r| r.event_type == "m.room_key_request"));
    }

    #[tokio::test]
    async fn room_keys_survive_an_export_import_round_trip() {
        let alice_net = Arc::new(MockNetwork::new());
        let membership = Arc::new(StubMembership::new());
        membership.set_members(room_id(), vec![alice_id()]);

        let alice = engine(alice_id(), alice_device(), alice_net, membership).await;
        alice
            .set_room_encryption(&room_id(), EventEncryptionAlgorithm::MegolmV1AesSha2)
            .await
            .unwrap();
        let content = alice
            .encrypt_room_event(&room_id(), "m.room.message", json!({ "body": "archived" }))
            .await
            .unwrap();

        let export = alice.export_room_keys("a secret passphrase", 10).await.unwrap();

        let bob = engine(
            bob_id(),
            bob_device(),
            Arc::new(MockNetwork::new()),
            Arc::new(StubMembership::new()),
        )
        .await;

        let err = bob.import_room_keys(&export, "the wrong passphrase").await.unwrap_err();
        assert_matches!(err, KeyExportError::AuthenticationFailed);

        let result = bob.import_room_keys(&export, "a secret passphrase").await.unwrap();
        assert_eq!(result.imported_count, 1);

        let decrypted = bob.decrypt_room_event(&room_id(), &alice_id(), &content).await;
        assert_eq!(decrypted.clear_event.unwrap()["content"]["body"], "archived");
    }

    #[tokio::test]
    async fn sync_maintenance_tops_up_the_key_pool() {
        let net = Arc::new(MockNetwork::new());
        let engine = CryptoEngine::new(
            alice_id(),
            alice_device(),
            Arc::new(MemoryStore::new()),
            net.clone(),
            Arc::new(StubMembership::new()),
            Arc::new(AlwaysOnline::new()),
            EngineSettings { maintenance_interval: Duration::ZERO, ..test_settings() },
        )
        .await
        .unwrap();

        engine.start().await.unwrap();
        let uploaded_at_start: u64 =
            net.uploads().iter().map(|u| u.one_time_keys.len() as u64).sum();

        // Another login drained the pool behind our back.
        net.set_otk_count(0);
        engine.on_sync_completed().await;

        let uploaded: u64 = net.uploads().iter().map(|u| u.one_time_keys.len() as u64).sum();
        assert_eq!(uploaded, uploaded_at_start * 2);
    }
}
