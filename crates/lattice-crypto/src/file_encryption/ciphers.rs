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

use aes::{
    cipher::{KeyIvInit, StreamCipher},
    Aes256,
};
use ctr::Ctr128BE;
use hmac::{digest::MacError, Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::{thread_rng, RngCore};
use sha2::{Sha256, Sha512};
use zeroize::Zeroize;

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub(crate) const KEY_SIZE: usize = 32;
pub(crate) const SALT_SIZE: usize = 16;
pub(crate) const IV_SIZE: usize = 16;
pub(crate) const MAC_SIZE: usize = 32;

/// The AES and HMAC key pair derived from an export passphrase.
///
/// The keys are wiped from memory when dropped.
pub(crate) struct PassphraseKeys {
    aes_key: Box<[u8; KEY_SIZE]>,
    mac_key: Box<[u8; KEY_SIZE]>,
}

impl PassphraseKeys {
    /// Stretch the passphrase into an encryption and an authentication key.
    ///
    /// PBKDF2 with HMAC-SHA512 produces 64 bytes; the first half keys
    /// AES-256-CTR, the second half keys HMAC-SHA256.
    pub fn from_passphrase(passphrase: &str, rounds: u32, salt: &[u8; SALT_SIZE]) -> Self {
        let mut expanded = Box::new([0u8; KEY_SIZE * 2]);
        pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), salt, rounds, &mut *expanded);

        let mut aes_key = Box::new([0u8; KEY_SIZE]);
        let mut mac_key = Box::new([0u8; KEY_SIZE]);
        aes_key.copy_from_slice(&expanded[..KEY_SIZE]);
        mac_key.copy_from_slice(&expanded[KEY_SIZE..]);

        expanded.zeroize();

        Self { aes_key, mac_key }
    }

    /// A random IV with the highest counter bit cleared, so the 64-bit
    /// counter half can't overflow mid-stream.
    pub fn generate_iv() -> [u8; IV_SIZE] {
        let mut iv = [0u8; IV_SIZE];
        thread_rng().fill_bytes(&mut iv);
        iv[8] &= 0x7f;

        iv
    }

    pub fn encrypt(&self, plaintext: &[u8], iv: &[u8; IV_SIZE]) -> Vec<u8> {
        let mut ciphertext = plaintext.to_owned();

        let mut cipher = Aes256Ctr::new(self.aes_key.as_slice().into(), iv.into());
        cipher.apply_keystream(&mut ciphertext);

        ciphertext
    }

    pub fn decrypt(&self, ciphertext: &[u8], iv: &[u8; IV_SIZE]) -> Vec<u8> {
        // CTR mode is symmetric.
        self.encrypt(ciphertext, iv)
    }

    pub fn mac(&self, message: &[u8]) -> Vec<u8> {
        let mut hmac = HmacSha256::new_from_slice(self.mac_key.as_slice())
            .expect("HMAC accepts keys of any size");
        hmac.update(message);

        hmac.finalize().into_bytes().to_vec()
    }

    pub fn verify_mac(&self, message: &[u8], tag: &[u8]) -> Result<(), MacError> {
        let mut hmac = HmacSha256::new_from_slice(self.mac_key.as_slice())
            .expect("HMAC accepts keys of any size");
        hmac.update(message);

        hmac.verify_slice(tag)
    }
}

impl Drop for PassphraseKeys {
    fn drop(&mut self) {
        self.aes_key.zeroize();
        self.mac_key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::PassphraseKeys;

    #[test]
    fn encryption_round_trip() {
        let salt = [1u8; 16];
        let keys = PassphraseKeys::from_passphrase("it's a secret", 10, &salt);
        let iv = PassphraseKeys::generate_iv();

        let ciphertext = keys.encrypt(b"hello world", &iv);
        assert_ne!(ciphertext, b"hello world");

        assert_eq!(keys.decrypt(&ciphertext, &iv), b"hello world");
    }

    #[test]
    fn mac_catches_tampering() {
        let salt = [1u8; 16];
        let keys = PassphraseKeys::from_passphrase("it's a secret", 10, &salt);

        let mut message = b"an authenticated message".to_vec();
        let tag = keys.mac(&message);
        keys.verify_mac(&message, &tag).unwrap();

        message[0] ^= 0x01;
        keys.verify_mac(&message, &tag).unwrap_err();
    }

    #[test]
    fn iv_counter_bit_is_clamped() {
        for _ in 0..32 {
            let iv = PassphraseKeys::generate_iv();
            assert_eq!(iv[8] & 0x80, 0);
        }
    }
}
