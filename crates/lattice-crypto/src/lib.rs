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

#![doc = include_str!("../README.md")]
#![warn(missing_docs, missing_debug_implementations)]

pub mod error;
pub mod file_encryption;
pub mod gossiping;
pub mod identities;
pub mod machine;
pub mod network;
pub mod olm;
pub mod store;
pub mod types;

pub(crate) mod algorithms;
pub(crate) mod session_manager;
#[cfg(test)]
pub(crate) mod testing;

pub use error::{
    CryptoError, EncryptionError, EventError, KeyExportError, MegolmError, OlmError,
    SessionCreationError, SignatureError,
};
pub use file_encryption::{decrypt_room_key_export, encrypt_room_key_export};
pub use gossiping::{OutgoingRoomKeyRequest, RoomKeyRequestState};
pub use identities::{DeviceIdentity, LocalTrust};
pub use machine::{
    CryptoEngine, DecryptedEvent, EngineSettings, EngineState, MembershipSource,
};
pub use network::{
    AlwaysOnline, ConnectivityMonitor, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest,
    KeysQueryResponse, KeysUploadRequest, KeysUploadResponse, NetworkClient, NetworkError,
    ToDeviceRequest,
};
pub use olm::{EncryptionSettings, ExportedRoomKey};
pub use session_manager::RoomKeyImportResult;
pub use store::{CryptoStore, CryptoStoreError, MemoryStore};
pub use types::EventEncryptionAlgorithm;
