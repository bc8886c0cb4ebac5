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

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{thread_rng, RngCore};
use zeroize::Zeroize;

use super::ciphers::{PassphraseKeys, IV_SIZE, MAC_SIZE, SALT_SIZE};
use crate::{error::KeyExportError, olm::ExportedRoomKey};

const HEADER: &str = "-----BEGIN LATTICE SESSION DATA-----";
const FOOTER: &str = "-----END LATTICE SESSION DATA-----";
const VERSION: u8 = 1;

/// The offset where the ciphertext starts: version byte, salt, IV, and the
/// big-endian PBKDF2 round count.
const PAYLOAD_START: usize = 1 + SALT_SIZE + IV_SIZE + 4;

/// Serialize and encrypt the given room keys into an armored, passphrase
/// protected container.
pub fn encrypt_room_key_export(
    keys: &[ExportedRoomKey],
    passphrase: &str,
    rounds: u32,
) -> Result<String, KeyExportError> {
    let mut plaintext = serde_json::to_string(keys)?;

    let mut salt = [0u8; SALT_SIZE];
    thread_rng().fill_bytes(&mut salt);
    let iv = PassphraseKeys::generate_iv();

    let derived = PassphraseKeys::from_passphrase(passphrase, rounds, &salt);
    let ciphertext = derived.encrypt(plaintext.as_bytes(), &iv);
    plaintext.zeroize();

    let mut payload = Vec::with_capacity(PAYLOAD_START + ciphertext.len() + MAC_SIZE);
    payload.push(VERSION);
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&iv);
    payload.extend_from_slice(&rounds.to_be_bytes());
    payload.extend_from_slice(&ciphertext);

    // The MAC covers everything before it, container metadata included.
    let mac = derived.mac(&payload);
    payload.extend_from_slice(&mac);

    Ok(format!("{HEADER}\n{}\n{FOOTER}", STANDARD.encode(payload)))
}

/// Decrypt an armored room key container.
///
/// The MAC is checked before anything is decrypted; a wrong passphrase or a
/// tampered file yields [`KeyExportError::AuthenticationFailed`] and nothing
/// else happens.
pub fn decrypt_room_key_export(
    export: &str,
    passphrase: &str,
) -> Result<Vec<ExportedRoomKey>, KeyExportError> {
    let payload = STANDARD
        .decode(extract_payload(export)?)
        .map_err(|_| KeyExportError::MalformedExportFile)?;

    if payload.len() < PAYLOAD_START + MAC_SIZE {
        return Err(KeyExportError::MalformedExportFile);
    }

    if payload[0] != VERSION {
        return Err(KeyExportError::UnsupportedVersion);
    }

    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    let mut rounds = [0u8; 4];
    salt.copy_from_slice(&payload[1..1 + SALT_SIZE]);
    iv.copy_from_slice(&payload[1 + SALT_SIZE..1 + SALT_SIZE + IV_SIZE]);
    rounds.copy_from_slice(&payload[1 + SALT_SIZE + IV_SIZE..PAYLOAD_START]);
    let rounds = u32::from_be_bytes(rounds);

    let mac_start = payload.len() - MAC_SIZE;
    let derived = PassphraseKeys::from_passphrase(passphrase, rounds, &salt);

    derived
        .verify_mac(&payload[..mac_start], &payload[mac_start..])
        .map_err(|_| KeyExportError::AuthenticationFailed)?;

    let mut plaintext = derived.decrypt(&payload[PAYLOAD_START..mac_start], &iv);
    let keys = serde_json::from_slice(&plaintext)?;
    plaintext.zeroize();

    Ok(keys)
}

/// The base64 payload between the armor markers, whitespace stripped.
fn extract_payload(export: &str) -> Result<String, KeyExportError> {
    let mut lines = export.lines().map(str::trim);

    if !lines.any(|l| l == HEADER) {
        return Err(KeyExportError::MalformedExportFile);
    }

    let mut payload = String::new();
    let mut terminated = false;

    for line in lines {
        if line == FOOTER {
            terminated = true;
            break;
        }
        payload.push_str(line);
    }

    if !terminated || payload.is_empty() {
        return Err(KeyExportError::MalformedExportFile);
    }

    Ok(payload)
}
