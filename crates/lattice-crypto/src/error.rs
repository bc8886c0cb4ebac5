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

//! Error conditions.

use std::{collections::BTreeMap, sync::Arc};

use lattice_common::{DeviceId, RoomId, UserId};
use serde_json::Error as SerdeError;
use thiserror::Error;

use crate::{network::NetworkError, store::CryptoStoreError, types::EventEncryptionAlgorithm};

pub type OlmResult<T> = Result<T, OlmError>;
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    Event(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] SerdeError),

    /// A pairwise session couldn't be established with a device.
    #[error(transparent)]
    SessionCreation(#[from] SessionCreationError),

    /// A signature on a key or payload failed to verify.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store: {0}")]
    Store(#[from] CryptoStoreError),

    /// The network layer returned an error.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Decryption failed because no established session matched the incoming
    /// message.
    #[error("no matching Olm session found for the sender key {0}")]
    MissingSession(String),

    /// The underlying Olm ratchet rejected the message.
    #[error(transparent)]
    Decryption(#[from] vodozemac::olm::DecryptionError),

    /// A batched device key query, shared with concurrent callers, failed.
    /// All callers attached to the in-flight query receive this error.
    #[error("the batched device key query failed: {0}")]
    KeysQuery(#[from] Arc<OlmError>),
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    Event(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] SerdeError),

    /// Decryption failed because we're missing the room key that was used to
    /// encrypt the event.
    #[error("can't find the room key that was used to encrypt the event")]
    MissingRoomKey,

    /// The message index was already consumed on this session, either a
    /// replayed message or a badly misbehaving sender.
    #[error(
        "duplicate message index, possible replay attack: session {session_id}, index {index}"
    )]
    DuplicateMessageIndex {
        /// The unique id of the group session the message belongs to.
        session_id: String,
        /// The repeated or retreating ratchet index.
        index: u32,
    },

    /// The encrypted megolm message couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// The underlying group ratchet rejected the message.
    #[error(transparent)]
    Decryption(#[from] vodozemac::megolm::DecryptionError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error that occurs when an encrypted event is malformed or inconsistent
/// with its envelope.
#[derive(Error, Debug)]
pub enum EventError {
    /// The message was encrypted with an algorithm we don't support.
    #[error("the message was encrypted using an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The decrypted payload is missing a required field.
    #[error("the decrypted payload is missing the {0} field")]
    MissingField(&'static str),

    /// The encrypted message doesn't contain a ciphertext for our device.
    #[error("the encrypted message doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    /// The message was encrypted for another user.
    #[error("the message was encrypted for {0}, but we are {1}")]
    BadRecipient(UserId, UserId),

    /// The recipient signing key recorded in the plaintext isn't ours.
    #[error("the recipient ed25519 key recorded in the message isn't our own")]
    BadRecipientKey,

    /// The sender recorded in the plaintext doesn't match the sender of the
    /// encrypted envelope.
    #[error("mismatched sender, got {0}, expected {1}")]
    MismatchedSender(UserId, UserId),

    /// The room id recorded in the room key doesn't match the room the event
    /// was sent in. Accepting this would let a malicious server replay a
    /// message into a different room.
    #[error("the room id of the room key doesn't match, expected {expected}, got {actual:?}")]
    MismatchedRoom {
        /// The room the event claims to belong to.
        expected: RoomId,
        /// The room the session is actually bound to, if any.
        actual: Option<RoomId>,
    },
}

/// Error type describing failures while checking or creating signatures over
/// canonical JSON objects.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The signature was made using an unsupported algorithm.
    #[error("the signature used an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The signing key that should verify the signature is missing.
    #[error("the signing key is missing from the object that signed the message")]
    MissingSigningKey,

    /// The signed JSON value isn't an object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The object doesn't contain a signature from the expected user and key.
    #[error("the JSON object doesn't contain the requested signature")]
    NoSignatureFound,

    /// The signature couldn't be decoded.
    #[error("the given signature is not valid and can't be decoded")]
    InvalidSignature,

    /// The signing key for a known device has changed; the pinned key is
    /// kept and the new payload is rejected.
    #[error("the signing key of a known device has changed, keeping the pinned key")]
    SigningKeyChanged,

    /// The signature failed to verify.
    #[error(transparent)]
    Verification(#[from] vodozemac::SignatureError),

    /// The public key isn't a valid ed25519 or curve25519 key.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),

    /// The object couldn't be serialized into canonical form.
    #[error(transparent)]
    Json(#[from] SerdeError),

    /// The user id in the payload doesn't match the envelope.
    #[error("user id mismatch in the signed payload, got {0}, expected {1}")]
    UserIdMismatch(UserId, UserId),

    /// The device id in the payload doesn't match the envelope.
    #[error("device id mismatch in the signed payload, got {0}, expected {1}")]
    DeviceIdMismatch(DeviceId, DeviceId),
}

/// Error that occurs when a one-time key or room key can't be turned into a
/// usable session.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    /// No one-time key was claimed for the device.
    #[error("tried to create a new Olm session for {0} {1}, but no one-time key was supplied")]
    OneTimeKeyMissing(UserId, DeviceId),

    /// The signature of the claimed one-time key failed to verify.
    #[error("the one-time key signature for {user_id} {device_id} failed to verify: {source}")]
    InvalidSignature {
        /// The user the key was claimed for.
        user_id: UserId,
        /// The device the key was claimed for.
        device_id: DeviceId,
        /// Why the signature check failed.
        source: SignatureError,
    },

    /// The device is missing its curve25519 identity key.
    #[error("tried to create an Olm session for {0} {1}, but the device has no curve25519 key")]
    DeviceMissingCurveKey(UserId, DeviceId),

    /// A key in the payload isn't a valid curve25519 key.
    #[error(transparent)]
    InvalidCurveKey(#[from] vodozemac::KeyError),

    /// The underlying ratchet rejected the pre-key message.
    #[error(transparent)]
    InboundCreation(#[from] vodozemac::olm::SessionCreationError),

    /// A group session key couldn't be decoded.
    #[error(transparent)]
    InvalidSessionKey(#[from] vodozemac::megolm::SessionKeyDecodeError),

    /// The payload couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] SerdeError),
}

/// Error surfaced to the caller when encrypting an event fails.
///
/// Unlike decryption failures, these are returned as call failures since the
/// caller must decide whether to block sending.
#[derive(Error, Debug)]
pub enum EncryptionError {
    /// The room has no encryption algorithm configured.
    #[error("encryption is not enabled in room {0}")]
    NotEnabled(RoomId),

    /// Encryption with the room's algorithm failed.
    #[error("unable to encrypt with {algorithm}: {reason}")]
    UnableToEncrypt {
        /// The algorithm the encryption was attempted with.
        algorithm: EventEncryptionAlgorithm,
        /// A human readable description of the failure.
        reason: String,
    },

    /// The room contains devices that have never been seen before and the
    /// unknown-device policy blocks sending until they are resolved.
    #[error("the room contains previously unknown devices")]
    UnknownDevices(BTreeMap<UserId, Vec<DeviceId>>),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error describing a failed room key export or import.
#[derive(Error, Debug)]
pub enum KeyExportError {
    /// The export file uses a container version we don't understand.
    #[error("the export file uses an unsupported container version")]
    UnsupportedVersion,

    /// The export file is missing its armor markers, isn't valid base64 or
    /// is truncated.
    #[error("the export file is malformed")]
    MalformedExportFile,

    /// The HMAC over the export file didn't verify, either the file was
    /// tampered with or the passphrase is wrong. Nothing was imported.
    #[error("the authentication of the export file failed, wrong passphrase?")]
    AuthenticationFailed,

    /// The decrypted export payload couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] SerdeError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// A typed decryption failure, attached to the affected event instead of
/// being returned as a call failure, so the caller can render a "cannot
/// decrypt" placeholder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Decryption failed for a reason without a more precise category.
    #[error("unable to decrypt: {0}")]
    UnableToDecrypt(String),

    /// The group session that encrypted this message isn't known, a room key
    /// request may have been issued for it.
    #[error("the room key used to encrypt the event isn't known")]
    UnknownInboundSession,

    /// The session's recorded room doesn't match the room of the event.
    #[error("room id mismatch, expected {expected}, got {actual:?}")]
    RoomIdMismatch {
        /// The room the event was received in.
        expected: RoomId,
        /// The room the session is bound to.
        actual: Option<RoomId>,
    },

    /// A message index on this session was consumed twice, possible replay.
    #[error("duplicate message index on session {session_id}, index {index}")]
    DuplicateMessageIndex {
        /// The group session id.
        session_id: String,
        /// The replayed index.
        index: u32,
    },

    /// The decrypted payload is missing required fields.
    #[error("the decrypted payload is missing the {0} field")]
    MissingFields(&'static str),

    /// The message was encrypted for a different user.
    #[error("the message was encrypted for {0}, but we are {1}")]
    BadRecipient(UserId, UserId),

    /// The recipient key recorded in the message isn't ours.
    #[error("the recipient key recorded in the message isn't our own")]
    BadRecipientKey,

    /// The message was encrypted with an unsupported algorithm.
    #[error("the message was encrypted using an unsupported algorithm")]
    UnsupportedAlgorithm,
}

impl From<EventError> for CryptoError {
    fn from(e: EventError) -> Self {
        match e {
            EventError::UnsupportedAlgorithm => Self::UnsupportedAlgorithm,
            EventError::MissingField(field) => Self::MissingFields(field),
            EventError::MissingCiphertext => Self::MissingFields("ciphertext"),
            EventError::BadRecipient(got, us) => Self::BadRecipient(got, us),
            EventError::BadRecipientKey => Self::BadRecipientKey,
            EventError::MismatchedRoom { expected, actual } => {
                Self::RoomIdMismatch { expected, actual }
            }
            e @ EventError::MismatchedSender(..) => Self::UnableToDecrypt(e.to_string()),
        }
    }
}

impl From<MegolmError> for CryptoError {
    fn from(e: MegolmError) -> Self {
        match e {
            MegolmError::Event(e) => e.into(),
            MegolmError::MissingRoomKey => Self::UnknownInboundSession,
            MegolmError::DuplicateMessageIndex { session_id, index } => {
                Self::DuplicateMessageIndex { session_id, index }
            }
            e => Self::UnableToDecrypt(e.to_string()),
        }
    }
}

impl From<OlmError> for CryptoError {
    fn from(e: OlmError) -> Self {
        match e {
            OlmError::Event(e) => e.into(),
            e => Self::UnableToDecrypt(e.to_string()),
        }
    }
}
