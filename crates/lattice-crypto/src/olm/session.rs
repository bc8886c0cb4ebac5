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

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vodozemac::{
    olm::{DecryptionError, OlmMessage, Session as InnerSession, SessionPickle},
    Curve25519PublicKey,
};

/// An established pairwise channel with another device.
///
/// Cloning is cheap and clones share the ratchet state, so every copy
/// observes the same message chain.
#[derive(Clone)]
pub struct Session {
    session_id: Arc<str>,
    sender_key: Curve25519PublicKey,
    inner: Arc<Mutex<InnerSession>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("sender_key", &self.sender_key.to_base64())
            .finish()
    }
}

/// The typed persisted form of a [`Session`].
#[derive(Serialize, Deserialize)]
pub struct PickledSession {
    /// The pickled double ratchet state.
    pub pickle: SessionPickle,
    /// The curve25519 identity key of the other device.
    pub sender_key: Curve25519PublicKey,
}

impl Session {
    pub(crate) fn new(inner: InnerSession, sender_key: Curve25519PublicKey) -> Self {
        Self { session_id: inner.session_id().into(), sender_key, inner: Mutex::new(inner).into() }
    }

    /// The unique id of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The curve25519 identity key of the device on the other end.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// Encrypt the given plaintext, advancing the sending ratchet.
    pub async fn encrypt(&self, plaintext: &str) -> OlmMessage {
        self.inner.lock().await.encrypt(plaintext)
    }

    /// Try to decrypt the given message with this session.
    ///
    /// Failure is non-fatal for normal messages since another session with
    /// the same device may match.
    pub async fn decrypt(&self, message: &OlmMessage) -> Result<Vec<u8>, DecryptionError> {
        self.inner.lock().await.decrypt(message)
    }

    /// Persist the session state.
    pub async fn pickle(&self) -> PickledSession {
        PickledSession {
            pickle: self.inner.lock().await.pickle(),
            sender_key: self.sender_key,
        }
    }

    /// Restore a session from its persisted state.
    pub fn from_pickle(pickle: PickledSession) -> Self {
        let inner = InnerSession::from_pickle(pickle.pickle);
        Self::new(inner, pickle.sender_key)
    }
}
