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

//! The transport boundary of the engine.
//!
//! The engine never performs network IO itself, it describes the requests it
//! needs through [`NetworkClient`] and lets the embedding application carry
//! them out.

use std::collections::BTreeMap;

use async_trait::async_trait;
use lattice_common::{DeviceId, ServerName, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::types::{DeviceKeys, SignedOneTimeKey};

/// Error returned by the transport layer.
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// The request never reached the server.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a non-success status.
    #[error("the server returned status {status}: {message}")]
    Http {
        /// The HTTP status code.
        status: u16,
        /// The error message from the response body.
        message: String,
    },
}

/// A request uploading our device keys and fresh one-time keys.
///
/// Both fields are optional; an empty upload is a valid way to learn the
/// server-side one-time key count from the response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// The signed public identity keys of this device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// New signed one-time keys, keyed by `signed_curve25519:<key_id>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: BTreeMap<String, SignedOneTimeKey>,
}

/// The response to a key upload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadResponse {
    /// The number of unclaimed one-time keys the server now holds for us,
    /// keyed by key algorithm.
    pub one_time_key_counts: BTreeMap<String, u64>,
}

/// A request for the device lists of a set of users.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryRequest {
    /// The users whose device keys should be returned. An empty device list
    /// requests all devices of the user.
    pub device_keys: BTreeMap<UserId, Vec<DeviceId>>,
}

/// The response to a device key query.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// The device keys, per user and device. Values are raw JSON since the
    /// engine validates them before deserializing.
    pub device_keys: BTreeMap<UserId, BTreeMap<DeviceId, Value>>,
    /// Remote servers that could not be reached, mapped to the failure
    /// status. Users on these servers get retried with backoff.
    #[serde(default)]
    pub failures: BTreeMap<ServerName, Value>,
}

/// A request claiming one-time keys so new pairwise sessions can be created.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimRequest {
    /// The keys to claim, mapping user and device to the wanted key
    /// algorithm.
    pub one_time_keys: BTreeMap<UserId, BTreeMap<DeviceId, String>>,
}

/// The response to a one-time key claim.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// The claimed keys, keyed by user, device, and
    /// `signed_curve25519:<key_id>`.
    pub one_time_keys: BTreeMap<UserId, BTreeMap<DeviceId, BTreeMap<String, SignedOneTimeKey>>>,
    /// Servers that could not be reached.
    #[serde(default)]
    pub failures: BTreeMap<ServerName, Value>,
}

/// A to-device message batch, delivered directly to devices without being
/// part of any room timeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceRequest {
    /// The type of the events being sent, e.g. `m.room.encrypted`.
    pub event_type: String,
    /// A transaction id making the request idempotent on retries.
    pub txn_id: TransactionId,
    /// Per-recipient message contents. A device id of `*` addresses all
    /// devices of the user.
    pub messages: BTreeMap<UserId, BTreeMap<DeviceId, Value>>,
}

impl ToDeviceRequest {
    /// Create a new to-device request with a fresh transaction id.
    pub fn new(event_type: &str, messages: BTreeMap<UserId, BTreeMap<DeviceId, Value>>) -> Self {
        Self { event_type: event_type.to_owned(), txn_id: TransactionId::generate(), messages }
    }
}

/// The network requests the engine needs carried out.
#[async_trait]
pub trait NetworkClient: Send + Sync + std::fmt::Debug {
    /// Upload device keys and one-time keys to our server.
    async fn upload_keys(&self, request: KeysUploadRequest)
        -> Result<KeysUploadResponse, NetworkError>;

    /// Fetch the device lists of the given users.
    async fn query_keys(&self, request: KeysQueryRequest)
        -> Result<KeysQueryResponse, NetworkError>;

    /// Claim one-time keys for the given devices.
    async fn claim_one_time_keys(
        &self,
        request: KeysClaimRequest,
    ) -> Result<KeysClaimResponse, NetworkError>;

    /// Send a batch of to-device messages.
    async fn send_to_device(&self, request: ToDeviceRequest) -> Result<(), NetworkError>;
}

/// A source of connectivity information the engine uses to defer startup and
/// maintenance while the application is offline.
pub trait ConnectivityMonitor: Send + Sync + std::fmt::Debug {
    /// Subscribe to connectivity changes. The receiver holds `true` while
    /// the network is reachable.
    fn watch_connectivity(&self) -> watch::Receiver<bool>;
}

/// A [`ConnectivityMonitor`] that always reports the network as reachable.
#[derive(Debug)]
pub struct AlwaysOnline {
    sender: watch::Sender<bool>,
}

impl AlwaysOnline {
    /// Create a new always-online monitor.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(true);
        Self { sender }
    }
}

impl Default for AlwaysOnline {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor for AlwaysOnline {
    fn watch_connectivity(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}
