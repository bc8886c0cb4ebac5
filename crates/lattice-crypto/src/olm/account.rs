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
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use lattice_common::{DeviceId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vodozemac::{
    olm::{Account as InnerAccount, AccountPickle, PreKeyMessage, SessionConfig},
    Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature,
};

use super::Session;
use crate::{
    error::{SessionCreationError, SignatureError},
    identities::DeviceIdentity,
    types::{canonical_json, verify_signed_json, DeviceKeys, EventEncryptionAlgorithm,
            SignedOneTimeKey},
};

/// The public identity key pair of an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityKeys {
    /// The long lived signing key of the account.
    pub ed25519: Ed25519PublicKey,
    /// The key used to establish pairwise sessions.
    pub curve25519: Curve25519PublicKey,
}

/// The local device's cryptographic identity.
///
/// Owns the long lived identity key pair and the pool of one-time keys, and
/// is the only thing that can sign payloads on behalf of this device.
pub struct Account {
    inner: InnerAccount,
    user_id: UserId,
    device_id: DeviceId,
    identity_keys: IdentityKeys,
    /// Whether our device keys were ever uploaded to the server.
    shared: Arc<AtomicBool>,
    /// The number of signed one-time keys the server reported as unclaimed.
    uploaded_key_count: Arc<AtomicU64>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys)
            .field("shared", &self.shared())
            .finish()
    }
}

/// The typed persisted form of an [`Account`].
#[derive(Serialize, Deserialize)]
pub struct PickledAccount {
    /// The user id of the account's owner.
    pub user_id: UserId,
    /// The device id of the account.
    pub device_id: DeviceId,
    /// The pickled ratchet state.
    pub pickle: AccountPickle,
    /// Whether the device keys were uploaded.
    pub shared: bool,
    /// The last known server-side one-time key count.
    pub uploaded_key_count: u64,
}

impl Account {
    const ALGORITHMS: [EventEncryptionAlgorithm; 2] = [
        EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
        EventEncryptionAlgorithm::MegolmV1AesSha2,
    ];

    /// Create a fresh account with a new identity key pair.
    pub fn new(user_id: UserId, device_id: DeviceId) -> Self {
        let inner = InnerAccount::new();
        let identity_keys =
            IdentityKeys { ed25519: inner.ed25519_key(), curve25519: inner.curve25519_key() };

        Self {
            inner,
            user_id,
            device_id,
            identity_keys,
            shared: AtomicBool::new(false).into(),
            uploaded_key_count: AtomicU64::new(0).into(),
        }
    }

    /// The id of the user that owns this account.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The id of the device this account belongs to.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public identity keys of the account.
    pub fn identity_keys(&self) -> IdentityKeys {
        self.identity_keys
    }

    /// Have the device keys been uploaded yet?
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::SeqCst)
    }

    /// Mark the device keys as uploaded.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::SeqCst);
    }

    /// The last one-time key count the server reported.
    pub fn uploaded_key_count(&self) -> u64 {
        self.uploaded_key_count.load(Ordering::SeqCst)
    }

    /// Remember the one-time key count the server reported.
    pub fn update_uploaded_key_count(&self, count: u64) {
        self.uploaded_key_count.store(count, Ordering::SeqCst);
    }

    /// The maximum number of one-time keys the ratchet can hold.
    pub fn max_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys()
    }

    /// Generate `count` fresh one-time keys.
    pub fn generate_one_time_keys(&mut self, count: usize) {
        self.inner.generate_one_time_keys(count);
    }

    /// Mark the currently unpublished one-time keys as published.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Sign the given message with our ed25519 key.
    pub fn sign(&self, message: &str) -> Ed25519Signature {
        self.inner.sign(message.as_bytes())
    }

    /// Sign the canonical form of the given JSON object.
    pub fn sign_json(&self, value: Value) -> Result<Ed25519Signature, SignatureError> {
        Ok(self.sign(&canonical_json(value)?))
    }

    fn signature_map(&self, signature: Ed25519Signature) -> BTreeMap<UserId, BTreeMap<String, String>> {
        BTreeMap::from([(
            self.user_id.clone(),
            BTreeMap::from([(format!("ed25519:{}", self.device_id), signature.to_base64())]),
        )])
    }

    /// Our signed device keys, ready for upload.
    pub fn device_keys(&self) -> Result<DeviceKeys, SignatureError> {
        let mut device_keys = DeviceKeys {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            algorithms: Self::ALGORITHMS.to_vec(),
            keys: BTreeMap::from([
                (
                    format!("curve25519:{}", self.device_id),
                    self.identity_keys.curve25519.to_base64(),
                ),
                (format!("ed25519:{}", self.device_id), self.identity_keys.ed25519.to_base64()),
            ]),
            signatures: Default::default(),
            unsigned: Value::Null,
        };

        let signature = self.sign_json(serde_json::to_value(&device_keys)?)?;
        device_keys.signatures = self.signature_map(signature);

        Ok(device_keys)
    }

    /// The unpublished one-time keys, signed and keyed for upload.
    pub fn signed_one_time_keys(
        &self,
    ) -> Result<BTreeMap<String, SignedOneTimeKey>, SignatureError> {
        let mut keys = BTreeMap::new();

        for (key_id, key) in self.inner.one_time_keys() {
            let signature = self.sign_json(json!({ "key": key.to_base64() }))?;
            let signed = SignedOneTimeKey {
                key: key.to_base64(),
                signatures: self.signature_map(signature),
            };

            keys.insert(format!("signed_curve25519:{}", key_id.to_base64()), signed);
        }

        Ok(keys)
    }

    /// Create a new outbound session towards the given device, using a
    /// claimed one-time key.
    ///
    /// The one-time key's signature is verified against the device's pinned
    /// ed25519 key before any session state is created.
    pub fn create_outbound_session(
        &self,
        device: &DeviceIdentity,
        one_time_key: &SignedOneTimeKey,
    ) -> Result<Session, SessionCreationError> {
        let signing_key = device.ed25519_key().ok_or_else(|| {
            SessionCreationError::InvalidSignature {
                user_id: device.user_id().clone(),
                device_id: device.device_id().clone(),
                source: SignatureError::MissingSigningKey,
            }
        })?;

        verify_signed_json(
            &signing_key,
            device.user_id(),
            &format!("ed25519:{}", device.device_id()),
            &serde_json::to_value(one_time_key)?,
        )
        .map_err(|source| SessionCreationError::InvalidSignature {
            user_id: device.user_id().clone(),
            device_id: device.device_id().clone(),
            source,
        })?;

        let identity_key = device.curve25519_key().ok_or_else(|| {
            SessionCreationError::DeviceMissingCurveKey(
                device.user_id().clone(),
                device.device_id().clone(),
            )
        })?;
        let one_time_key = Curve25519PublicKey::from_base64(&one_time_key.key)?;

        let session =
            self.inner.create_outbound_session(SessionConfig::version_1(), identity_key, one_time_key);

        Ok(Session::new(session, identity_key))
    }

    /// Create a new inbound session from a pre-key message, returning the
    /// session together with the decrypted plaintext of the first message.
    pub fn create_inbound_session(
        &mut self,
        sender_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<(Session, Vec<u8>), SessionCreationError> {
        let result = self.inner.create_inbound_session(sender_key, message)?;

        Ok((Session::new(result.session, sender_key), result.plaintext))
    }

    /// Persist the account state.
    pub fn pickle(&self) -> PickledAccount {
        PickledAccount {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            pickle: self.inner.pickle(),
            shared: self.shared(),
            uploaded_key_count: self.uploaded_key_count(),
        }
    }

    /// Restore the account from its persisted state.
    pub fn from_pickle(pickle: PickledAccount) -> Self {
        let inner = InnerAccount::from_pickle(pickle.pickle);
        let identity_keys =
            IdentityKeys { ed25519: inner.ed25519_key(), curve25519: inner.curve25519_key() };

        Self {
            inner,
            user_id: pickle.user_id,
            device_id: pickle.device_id,
            identity_keys,
            shared: AtomicBool::new(pickle.shared).into(),
            uploaded_key_count: AtomicU64::new(pickle.uploaded_key_count).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use lattice_common::{DeviceId, UserId};

    use super::Account;
    use crate::types::verify_signed_json;

    fn account() -> Account {
        Account::new(UserId::parse("@alice:localhost").unwrap(), DeviceId::new("ALICEDEV"))
    }

    #[test]
    fn device_keys_are_self_signed() {
        let account = account();
        let device_keys = account.device_keys().unwrap();

        assert_eq!(device_keys.ed25519_key().unwrap(), account.identity_keys().ed25519);
        assert_eq!(device_keys.curve25519_key().unwrap(), account.identity_keys().curve25519);

        verify_signed_json(
            &account.identity_keys().ed25519,
            account.user_id(),
            &format!("ed25519:{}", account.device_id()),
            &serde_json::to_value(&device_keys).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn one_time_keys_are_signed() {
        let mut account = account();
        account.generate_one_time_keys(5);

        let keys = account.signed_one_time_keys().unwrap();
        assert_eq!(keys.len(), 5);

        for (key_id, key) in &keys {
            assert!(key_id.starts_with("signed_curve25519:"));
            verify_signed_json(
                &account.identity_keys().ed25519,
                account.user_id(),
                &format!("ed25519:{}", account.device_id()),
                &serde_json::to_value(key).unwrap(),
            )
            .unwrap();
        }

        account.mark_keys_as_published();
        assert!(account.signed_one_time_keys().unwrap().is_empty());
    }

    #[test]
    fn pickle_round_trip() {
        let account = account();
        account.mark_as_shared();
        account.update_uploaded_key_count(42);

        let restored = Account::from_pickle(account.pickle());

        assert_eq!(restored.identity_keys(), account.identity_keys());
        assert!(restored.shared());
        assert_eq!(restored.uploaded_key_count(), 42);
    }
}
