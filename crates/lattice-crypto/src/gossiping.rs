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

//! Outgoing room key requests.
//!
//! When a room message can't be decrypted because its group session never
//! arrived, we ask our other devices for the key. Requests are deduplicated
//! by the key they ask for, persisted, and drained by a delayed background
//! task so bursts of undecryptable events produce a trickle of requests.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use lattice_common::{DeviceId, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    network::{NetworkClient, ToDeviceRequest},
    store::{CryptoStore, CryptoStoreError},
    types::events::{RoomKeyRequestBody, RoomKeyRequestContent},
};

/// The send state of an outgoing room key request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomKeyRequestState {
    /// Queued, waiting for the drain task.
    Unsent,
    /// Sent to the recipients, awaiting a key or a cancellation.
    Sent,
    /// The request should be withdrawn.
    CancellationPending,
    /// The request should be withdrawn and then re-issued fresh.
    CancellationPendingAndWillResend,
    /// Sending failed; kept for inspection, never retried automatically.
    Failed,
}

/// A persisted outgoing room key request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutgoingRoomKeyRequest {
    /// The unique id of the request, reused by its cancellation.
    pub request_id: TransactionId,
    /// The key being requested.
    pub body: RoomKeyRequestBody,
    /// The devices the request is sent to. A device id of `*` addresses
    /// every device of the user.
    pub recipients: BTreeMap<UserId, Vec<DeviceId>>,
    /// Where the request is in its lifecycle.
    pub state: RoomKeyRequestState,
}

/// Manages the lifecycle of outgoing room key requests.
#[derive(Clone, Debug)]
pub(crate) struct OutgoingKeyRequestManager {
    inner: Arc<ManagerInner>,
}

#[derive(Debug)]
struct ManagerInner {
    device_id: DeviceId,
    store: Arc<dyn CryptoStore>,
    network: Arc<dyn NetworkClient>,
    /// How long queued requests sit before the drain runs.
    send_delay: Duration,
    /// Set while a drain is scheduled, so bursts arm only one timer.
    drain_scheduled: AtomicBool,
    /// Set while a drain is running, so drains never overlap.
    drain_running: AtomicBool,
}

impl OutgoingKeyRequestManager {
    pub fn new(
        device_id: DeviceId,
        store: Arc<dyn CryptoStore>,
        network: Arc<dyn NetworkClient>,
        send_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                device_id,
                store,
                network,
                send_delay,
                drain_scheduled: AtomicBool::new(false),
                drain_running: AtomicBool::new(false),
            }),
        }
    }

    /// Queue a request for the given room key.
    ///
    /// A live request for the same key, whatever its state, suppresses the
    /// new one.
    pub async fn request_key(
        &self,
        body: RoomKeyRequestBody,
        recipients: BTreeMap<UserId, Vec<DeviceId>>,
    ) -> Result<(), CryptoStoreError> {
        if let Some(existing) = self.inner.store.get_key_request_by_body(&body).await? {
            debug!(
                request_id = existing.request_id.as_str(),
                session_id = body.session_id,
                "a key request for this session already exists"
            );
            return Ok(());
        }

        let request = OutgoingRoomKeyRequest {
            request_id: TransactionId::generate(),
            body,
            recipients,
            state: RoomKeyRequestState::Unsent,
        };

        info!(
            request_id = request.request_id.as_str(),
            session_id = request.body.session_id,
            room_id = request.body.room_id.as_str(),
            "queueing a room key request"
        );

        self.inner.store.save_outgoing_key_request(request).await?;
        self.schedule_drain();

        Ok(())
    }

    /// Withdraw the request for the given key, optionally re-issuing it as a
    /// fresh request once the cancellation went out.
    pub async fn cancel_request(
        &self,
        body: &RoomKeyRequestBody,
        resend: bool,
    ) -> Result<(), CryptoStoreError> {
        let Some(mut request) = self.inner.store.get_key_request_by_body(body).await? else {
            return Ok(());
        };

        match request.state {
            RoomKeyRequestState::Unsent => {
                // Never sent, nothing to withdraw on the wire.
                if !resend {
                    self.inner.store.delete_outgoing_key_request(&request.request_id).await?;
                }
            }
            RoomKeyRequestState::Sent | RoomKeyRequestState::Failed => {
                request.state = if resend {
                    RoomKeyRequestState::CancellationPendingAndWillResend
                } else {
                    RoomKeyRequestState::CancellationPending
                };
                self.inner.store.save_outgoing_key_request(request).await?;
                self.schedule_drain();
            }
            RoomKeyRequestState::CancellationPending if resend => {
                request.state = RoomKeyRequestState::CancellationPendingAndWillResend;
                self.inner.store.save_outgoing_key_request(request).await?;
                self.schedule_drain();
            }
            _ => {}
        }

        Ok(())
    }

    /// The requested key arrived, the matching request can be withdrawn.
    pub async fn received_requested_key(
        &self,
        body: &RoomKeyRequestBody,
    ) -> Result<(), CryptoStoreError> {
        self.cancel_request(body, false).await
    }

    /// Arm the drain timer unless it is already armed.
    pub fn schedule_drain(&self) {
        if self.inner.drain_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(manager.inner.send_delay).await;
            manager.inner.drain_scheduled.store(false, Ordering::SeqCst);

            // A drain already being mid-flight will re-arm the timer itself
            // if work remains.
            if manager.inner.drain_running.swap(true, Ordering::SeqCst) {
                return;
            }

            if let Err(e) = manager.drain_one().await {
                warn!(error = %e, "failed to drain the room key request queue");
            }

            manager.inner.drain_running.store(false, Ordering::SeqCst);

            match manager.has_pending_work().await {
                Ok(true) => manager.schedule_drain(),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "failed to check for pending room key requests"),
            }
        });
    }

    async fn has_pending_work(&self) -> Result<bool, CryptoStoreError> {
        use RoomKeyRequestState::*;

        for state in [Unsent, CancellationPending, CancellationPendingAndWillResend] {
            if !self.inner.store.get_key_requests_by_state(state).await?.is_empty() {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Process a single queued request or cancellation.
    ///
    /// Only one item per tick; a failing server slows the queue down instead
    /// of hammering it, and the re-armed timer keeps later items moving.
    async fn drain_one(&self) -> Result<(), CryptoStoreError> {
        use RoomKeyRequestState::*;

        for state in [CancellationPending, CancellationPendingAndWillResend] {
            if let Some(request) =
                self.inner.store.get_key_requests_by_state(state).await?.into_iter().next()
            {
                return self.send_cancellation(request).await;
            }
        }

        if let Some(request) =
            self.inner.store.get_key_requests_by_state(Unsent).await?.into_iter().next()
        {
            return self.send_request(request).await;
        }

        Ok(())
    }

    async fn send_request(
        &self,
        mut request: OutgoingRoomKeyRequest,
    ) -> Result<(), CryptoStoreError> {
        let content = RoomKeyRequestContent::new_request(
            request.body.clone(),
            self.inner.device_id.clone(),
            request.request_id.clone(),
        );

        match self.send_to_recipients(&request, &content).await {
            Ok(()) => {
                info!(
                    request_id = request.request_id.as_str(),
                    session_id = request.body.session_id,
                    "sent a room key request"
                );
                request.state = RoomKeyRequestState::Sent;
            }
            Err(e) => {
                warn!(
                    request_id = request.request_id.as_str(),
                    error = %e,
                    "failed to send a room key request"
                );
                request.state = RoomKeyRequestState::Failed;
            }
        }

        self.inner.store.save_outgoing_key_request(request).await
    }

    async fn send_cancellation(
        &self,
        mut request: OutgoingRoomKeyRequest,
    ) -> Result<(), CryptoStoreError> {
        let resend = request.state == RoomKeyRequestState::CancellationPendingAndWillResend;
        let content = RoomKeyRequestContent::new_cancellation(
            self.inner.device_id.clone(),
            request.request_id.clone(),
        );

        match self.send_to_recipients(&request, &content).await {
            Ok(()) => {
                info!(
                    request_id = request.request_id.as_str(),
                    "withdrew a room key request"
                );
                self.inner.store.delete_outgoing_key_request(&request.request_id).await?;

                if resend {
                    let fresh = OutgoingRoomKeyRequest {
                        request_id: TransactionId::generate(),
                        body: request.body,
                        recipients: request.recipients,
                        state: RoomKeyRequestState::Unsent,
                    };
                    self.inner.store.save_outgoing_key_request(fresh).await?;
                }

                Ok(())
            }
            Err(e) => {
                warn!(
                    request_id = request.request_id.as_str(),
                    error = %e,
                    "failed to withdraw a room key request"
                );
                request.state = RoomKeyRequestState::Failed;
                self.inner.store.save_outgoing_key_request(request).await
            }
        }
    }

    async fn send_to_recipients(
        &self,
        request: &OutgoingRoomKeyRequest,
        content: &RoomKeyRequestContent,
    ) -> Result<(), crate::network::NetworkError> {
        let content = serde_json::to_value(content)
            .map_err(|e| crate::network::NetworkError::Transport(e.to_string()))?;

        let messages = request
            .recipients
            .iter()
            .map(|(user, devices)| {
                (user.clone(), devices.iter().map(|d| (d.clone(), content.clone())).collect())
            })
            .collect();

        self.inner
            .network
            .send_to_device(ToDeviceRequest::new("m.room_key_request", messages))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc, time::Duration};

    use lattice_common::{DeviceId, RoomId, UserId};

    use super::{OutgoingKeyRequestManager, RoomKeyRequestState};
    use crate::{
        store::{CryptoStore, MemoryStore},
        testing::MockNetwork,
        types::{events::RoomKeyRequestBody, EventEncryptionAlgorithm},
    };

    fn body(session_id: &str) -> RoomKeyRequestBody {
        RoomKeyRequestBody {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: RoomId::parse("!room:localhost").unwrap(),
            sender_key: "sender_key".to_owned(),
            session_id: session_id.to_owned(),
        }
    }

    fn recipients() -> BTreeMap<UserId, Vec<DeviceId>> {
        BTreeMap::from([(
            UserId::parse("@alice:localhost").unwrap(),
            vec![DeviceId::new("*")],
        )])
    }

    fn manager(
        store: Arc<MemoryStore>,
        network: Arc<MockNetwork>,
    ) -> OutgoingKeyRequestManager {
        OutgoingKeyRequestManager::new(
            DeviceId::new("OURDEVICE"),
            store,
            network,
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn requests_are_deduplicated_by_body() {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(MockNetwork::new());
        let manager = manager(store.clone(), network.clone());

        manager.request_key(body("session"), recipients()).await.unwrap();
        manager.request_key(body("session"), recipients()).await.unwrap();

        let pending =
            store.get_key_requests_by_state(RoomKeyRequestState::Unsent).await.unwrap();
        assert_eq!(pending.len(), 1);

        // A request for a different session is not suppressed.
        manager.request_key(body("other"), recipients()).await.unwrap();
        let pending =
            store.get_key_requests_by_state(RoomKeyRequestState::Unsent).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn drain_sends_queued_requests() {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(MockNetwork::new());
        let manager = manager(store.clone(), network.clone());

        manager.request_key(body("session"), recipients()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sent = network.to_device_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, "m.room_key_request");

        let request = store.get_key_request_by_body(&body("session")).await.unwrap().unwrap();
        assert_eq!(request.state, RoomKeyRequestState::Sent);
    }

    #[tokio::test]
    async fn failed_sends_mark_the_request() {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(MockNetwork::new());
        network.fail_to_device(true);
        let manager = manager(store.clone(), network.clone());

        manager.request_key(body("session"), recipients()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let request = store.get_key_request_by_body(&body("session")).await.unwrap().unwrap();
        assert_eq!(request.state, RoomKeyRequestState::Failed);
    }

    #[tokio::test]
    async fn received_key_withdraws_a_sent_request() {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(MockNetwork::new());
        let manager = manager(store.clone(), network.clone());

        manager.request_key(body("session"), recipients()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        manager.received_requested_key(&body("session")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // One request followed by one cancellation on the wire.
        let sent = network.to_device_requests();
        assert_eq!(sent.len(), 2);
        let cancellation = &sent[1].messages.values().next().unwrap();
        let content = cancellation.values().next().unwrap();
        assert_eq!(content["action"], "request_cancellation");

        // The request is gone from the store.
        assert!(store.get_key_request_by_body(&body("session")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancellation_with_resend_requeues_a_fresh_request() {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(MockNetwork::new());
        let manager = manager(store.clone(), network.clone());

        manager.request_key(body("session"), recipients()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let original =
            store.get_key_request_by_body(&body("session")).await.unwrap().unwrap();

        manager.cancel_request(&body("session"), true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The fresh request was re-sent under a new id.
        let request = store.get_key_request_by_body(&body("session")).await.unwrap().unwrap();
        assert_ne!(request.request_id, original.request_id);
        assert_eq!(request.state, RoomKeyRequestState::Sent);

        // Wire order: request, cancellation, fresh request.
        let sent = network.to_device_requests();
        assert_eq!(sent.len(), 3);
    }
}
