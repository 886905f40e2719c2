//! State token codec
//!
//! Issues and verifies the short-lived signed tokens that bind an OAuth
//! redirect round trip to the (user, tool) request that initiated it,
//! using HMAC-SHA256 with constant-time comparison to prevent timing attacks.
//!
//! The codec is stateless: the token carries its own expiry and nothing is
//! persisted for the round trip. Single-use is enforced by the broker, whose
//! connection upsert makes a replayed-but-unexpired token at worst
//! re-establish the same connection.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::CryptoKey;

type HmacSha256 = Hmac<Sha256>;

/// Long enough for a user to complete the provider login, short enough to
/// bound replay.
pub const STATE_TTL_SECONDS: i64 = 600;

const NONCE_LEN: usize = 16;

/// Claims embedded in a state token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    pub nonce: String,
    pub user_id: Uuid,
    pub tool_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

/// Errors that can occur while verifying a state token
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state token is malformed")]
    Malformed,

    #[error("state token signature mismatch")]
    SignatureMismatch,

    #[error("state token has expired")]
    Expired,
}

/// Issues and verifies signed state tokens with a server-held key.
#[derive(Clone)]
pub struct StateCodec {
    key: CryptoKey,
}

impl StateCodec {
    pub fn new(key: CryptoKey) -> Self {
        Self { key }
    }

    /// Issue a state token for the given (user, tool) round trip.
    /// Returns the opaque encoded value and its expiry.
    pub fn issue(&self, user_id: Uuid, tool_id: &str) -> (String, DateTime<Utc>) {
        self.issue_at(user_id, tool_id, Utc::now())
    }

    /// Clock-injected variant of [`issue`](Self::issue).
    pub fn issue_at(
        &self,
        user_id: Uuid,
        tool_id: &str,
        now: DateTime<Utc>,
    ) -> (String, DateTime<Utc>) {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce_bytes);

        let expires_at = now + Duration::seconds(STATE_TTL_SECONDS);
        let payload = StatePayload {
            nonce: base64_url::encode(&nonce_bytes),
            user_id,
            tool_id: tool_id.to_string(),
            issued_at: now.timestamp(),
            expires_at: expires_at.timestamp(),
        };

        let payload_bytes =
            serde_json::to_vec(&payload).expect("state payload serializes to JSON");
        let signature = self.sign(&payload_bytes);

        let value = format!(
            "{}.{}",
            base64_url::encode(&payload_bytes),
            base64_url::encode(&signature)
        );

        (value, expires_at)
    }

    /// Verify a state value: structural parse, constant-time signature check,
    /// then expiry. Any failure is indistinguishable to the caller.
    pub fn verify(&self, value: &str) -> Result<StatePayload, StateError> {
        self.verify_at(value, Utc::now())
    }

    /// Clock-injected variant of [`verify`](Self::verify).
    pub fn verify_at(&self, value: &str, now: DateTime<Utc>) -> Result<StatePayload, StateError> {
        let (payload_part, signature_part) =
            value.split_once('.').ok_or(StateError::Malformed)?;

        let payload_bytes =
            base64_url::decode(payload_part).map_err(|_| StateError::Malformed)?;
        let provided_signature =
            base64_url::decode(signature_part).map_err(|_| StateError::Malformed)?;

        // Authenticate before parsing anything out of the payload.
        let expected_signature = self.sign(&payload_bytes);
        let matches: bool = expected_signature
            .as_slice()
            .ct_eq(provided_signature.as_slice())
            .into();
        if !matches {
            return Err(StateError::SignatureMismatch);
        }

        let payload: StatePayload =
            serde_json::from_slice(&payload_bytes).map_err(|_| StateError::Malformed)?;

        if payload.expires_at <= now.timestamp() {
            return Err(StateError::Expired);
        }

        Ok(payload)
    }

    fn sign(&self, payload_bytes: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(payload_bytes);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> StateCodec {
        StateCodec::new(CryptoKey::new(vec![0x42; 32]).expect("valid test key"))
    }

    #[test]
    fn issue_verify_roundtrip() {
        let codec = codec();
        let user_id = Uuid::new_v4();

        let (value, expires_at) = codec.issue(user_id, "github");
        let payload = codec.verify(&value).expect("fresh state verifies");

        assert_eq!(payload.user_id, user_id);
        assert_eq!(payload.tool_id, "github");
        assert_eq!(payload.expires_at, expires_at.timestamp());
    }

    #[test]
    fn expired_state_is_rejected() {
        let codec = codec();
        let issued = Utc::now();

        let (value, _) = codec.issue_at(Uuid::new_v4(), "jira", issued);

        let just_before = issued + Duration::seconds(STATE_TTL_SECONDS - 1);
        assert!(codec.verify_at(&value, just_before).is_ok());

        let just_after = issued + Duration::seconds(STATE_TTL_SECONDS + 1);
        let err = codec.verify_at(&value, just_after).unwrap_err();
        assert!(matches!(err, StateError::Expired));
    }

    #[test]
    fn every_single_byte_mutation_is_rejected() {
        let codec = codec();
        let (value, _) = codec.issue(Uuid::new_v4(), "slack");

        let bytes = value.as_bytes();
        for index in 0..bytes.len() {
            let mut mutated = bytes.to_vec();
            mutated[index] ^= 0x01;
            let Ok(mutated) = String::from_utf8(mutated) else {
                continue;
            };
            assert!(
                codec.verify(&mutated).is_err(),
                "mutation at byte {} was accepted",
                index
            );
        }
    }

    #[test]
    fn signature_from_different_key_is_rejected() {
        let issuing = codec();
        let verifying = StateCodec::new(CryptoKey::new(vec![0x43; 32]).expect("valid test key"));

        let (value, _) = issuing.issue(Uuid::new_v4(), "figma");
        let err = verifying.verify(&value).unwrap_err();
        assert!(matches!(err, StateError::SignatureMismatch));
    }

    #[test]
    fn structurally_corrupt_values_are_rejected() {
        let codec = codec();

        for garbage in ["", "no-separator", ".", "a.b", "!!!.???", "a.b.c"] {
            assert!(codec.verify(garbage).is_err(), "accepted '{}'", garbage);
        }
    }

    #[test]
    fn nonces_differ_between_issues() {
        let codec = codec();
        let user_id = Uuid::new_v4();

        let (first, _) = codec.issue(user_id, "github");
        let (second, _) = codec.issue(user_id, "github");
        assert_ne!(first, second);

        let first_payload = codec.verify(&first).unwrap();
        let second_payload = codec.verify(&second).unwrap();
        assert_ne!(first_payload.nonce, second_payload.nonce);
    }
}
