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

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock as StdRwLock,
};

use lattice_common::{DeviceId, UserId};
use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    error::SignatureError,
    types::{verify_signed_json, DeviceKeys, EventEncryptionAlgorithm},
};

/// The local trust the user assigned to a device.
///
/// Trust is a purely local decision, it is never uploaded or shared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device hasn't been verified.
    #[default]
    Unverified,
    /// The user confirmed the device's keys out of band.
    Verified,
    /// The user refuses to encrypt for this device.
    Blacklisted,
}

/// A remote device with validated, pinned identity keys.
///
/// Clones share their state, so a trust change through one handle is visible
/// through every other.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    user_id: UserId,
    device_id: DeviceId,
    keys: Arc<StdRwLock<DeviceKeys>>,
    trust_state: Arc<StdRwLock<LocalTrust>>,
    /// Whether the application acknowledged this device. Freshly discovered
    /// devices start out unknown and may block group encryption.
    known: Arc<AtomicBool>,
}

impl DeviceIdentity {
    /// Validate a device key payload and create the identity from it.
    ///
    /// The payload must carry an ed25519 signing key and a valid
    /// self-signature made with it.
    pub fn new(device_keys: DeviceKeys) -> Result<Self, SignatureError> {
        Self::verify_self_signature(&device_keys)?;

        Ok(Self {
            user_id: device_keys.user_id.clone(),
            device_id: device_keys.device_id.clone(),
            keys: Arc::new(StdRwLock::new(device_keys)),
            trust_state: Default::default(),
            known: AtomicBool::new(false).into(),
        })
    }

    fn verify_self_signature(device_keys: &DeviceKeys) -> Result<(), SignatureError> {
        let signing_key = device_keys.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;

        verify_signed_json(
            &signing_key,
            &device_keys.user_id,
            &format!("ed25519:{}", device_keys.device_id),
            &serde_json::to_value(device_keys)?,
        )
    }

    /// The id of the user that owns the device.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique id of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The pinned ed25519 signing key of the device.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.keys.read().unwrap().ed25519_key()
    }

    /// The curve25519 identity key of the device.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.keys.read().unwrap().curve25519_key()
    }

    /// Does the device support the given encryption algorithm?
    pub fn supports_algorithm(&self, algorithm: &EventEncryptionAlgorithm) -> bool {
        self.keys.read().unwrap().algorithms.contains(algorithm)
    }

    /// The local trust assigned to this device.
    pub fn trust_state(&self) -> LocalTrust {
        *self.trust_state.read().unwrap()
    }

    /// Assign a new local trust state.
    pub fn set_trust_state(&self, trust: LocalTrust) {
        *self.trust_state.write().unwrap() = trust;
    }

    /// Was the device verified by the user?
    pub fn is_verified(&self) -> bool {
        self.trust_state() == LocalTrust::Verified
    }

    /// Did the user refuse to encrypt for this device?
    pub fn is_blacklisted(&self) -> bool {
        self.trust_state() == LocalTrust::Blacklisted
    }

    /// Has the application acknowledged this device?
    pub fn is_known(&self) -> bool {
        self.known.load(Ordering::SeqCst)
    }

    /// Record whether the application acknowledged this device.
    pub fn set_known(&self, known: bool) {
        self.known.store(known, Ordering::SeqCst);
    }

    /// Apply a re-downloaded key payload to this device.
    ///
    /// The payload is verified against the *pinned* signing key; a payload
    /// carrying a different ed25519 key is rejected and the pinned key kept,
    /// since a key swap on an existing device id means the server (or the
    /// device) is lying.
    pub fn update(&self, device_keys: &DeviceKeys) -> Result<(), SignatureError> {
        if self.user_id != device_keys.user_id {
            return Err(SignatureError::UserIdMismatch(
                device_keys.user_id.clone(),
                self.user_id.clone(),
            ));
        }
        if self.device_id != device_keys.device_id {
            return Err(SignatureError::DeviceIdMismatch(
                device_keys.device_id.clone(),
                self.device_id.clone(),
            ));
        }

        let pinned = self.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;
        let new_key = device_keys.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;

        if pinned != new_key {
            return Err(SignatureError::SigningKeyChanged);
        }

        verify_signed_json(
            &pinned,
            &device_keys.user_id,
            &format!("ed25519:{}", device_keys.device_id),
            &serde_json::to_value(device_keys)?,
        )?;

        *self.keys.write().unwrap() = device_keys.clone();

        Ok(())
    }

    /// The raw key payload, used when persisting the device.
    pub fn as_device_keys(&self) -> DeviceKeys {
        self.keys.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use lattice_common::{DeviceId, UserId};

    use super::{DeviceIdentity, LocalTrust};
    use crate::{error::SignatureError, olm::Account};

    fn account() -> Account {
        Account::new(UserId::parse("@alice:localhost").unwrap(), DeviceId::new("ALICEDEV"))
    }

    #[test]
    fn valid_self_signature_is_accepted() {
        let account = account();
        let device = DeviceIdentity::new(account.device_keys().unwrap()).unwrap();

        assert_eq!(device.ed25519_key().unwrap(), account.identity_keys().ed25519);
        assert_eq!(device.trust_state(), LocalTrust::Unverified);
        assert!(!device.is_known());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let account = account();
        let mut device_keys = account.device_keys().unwrap();

        // Swap in a different curve25519 key after signing.
        let other = Account::new(
            UserId::parse("@mallory:localhost").unwrap(),
            DeviceId::new("EVIL"),
        );
        device_keys.keys.insert(
            "curve25519:ALICEDEV".to_owned(),
            other.identity_keys().curve25519.to_base64(),
        );

        DeviceIdentity::new(device_keys).unwrap_err();
    }

    #[test]
    fn signing_key_is_pinned() {
        let account = account();
        let device = DeviceIdentity::new(account.device_keys().unwrap()).unwrap();

        // A different account claiming the same user and device ids.
        let imposter =
            Account::new(UserId::parse("@alice:localhost").unwrap(), DeviceId::new("ALICEDEV"));
        let err = device.update(&imposter.device_keys().unwrap()).unwrap_err();

        assert_matches!(err, SignatureError::SigningKeyChanged);
        // The pinned key survives the rejected update.
        assert_eq!(device.ed25519_key().unwrap(), account.identity_keys().ed25519);
    }

    #[test]
    fn update_with_the_same_key_succeeds() {
        let account = account();
        let device = DeviceIdentity::new(account.device_keys().unwrap()).unwrap();

        device.update(&account.device_keys().unwrap()).unwrap();
    }

    #[test]
    fn trust_is_shared_between_clones() {
        let account = account();
        let device = DeviceIdentity::new(account.device_keys().unwrap()).unwrap();
        let clone = device.clone();

        device.set_trust_state(LocalTrust::Verified);
        device.set_known(true);

        assert!(clone.is_verified());
        assert!(clone.is_known());
    }
}
