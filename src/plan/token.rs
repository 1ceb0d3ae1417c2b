//! Deletion tokens: HMAC-SHA256 over a canonical JSON payload.
//!
//! The payload's field order is fixed by the struct and the file names are
//! sorted, so the same plan always signs to the same bytes.

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_LEN: usize = 16;

#[derive(Serialize)]
struct TokenPayload<'a> {
    filenames: Vec<&'a str>,
    created_at: String,
    plan_id: &'a str,
    nonce: String,
}

/// Signs and verifies tokens with a secret generated once per instance.
pub struct TokenSigner {
    secret: [u8; 32],
}

impl TokenSigner {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret }
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    pub fn new_nonce() -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        nonce
    }

    fn mac(&self, filenames: &[String], created_at: DateTime<Utc>, plan_id: &str, nonce: &[u8]) -> HmacSha256 {
        let mut sorted: Vec<&str> = filenames.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let payload = TokenPayload {
            filenames: sorted,
            created_at: created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            plan_id,
            nonce: hex::encode(nonce),
        };
        // Serializing a struct of strings cannot fail.
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(&bytes);
        mac
    }

    pub fn sign(&self, filenames: &[String], created_at: DateTime<Utc>, plan_id: &str, nonce: &[u8]) -> String {
        hex::encode(
            self.mac(filenames, created_at, plan_id, nonce)
                .finalize()
                .into_bytes(),
        )
    }

    /// Constant-time check of a hex token.
    pub fn verify(
        &self,
        token: &str,
        filenames: &[String],
        created_at: DateTime<Utc>,
        plan_id: &str,
        nonce: &[u8],
    ) -> bool {
        let Ok(provided) = hex::decode(token.trim()) else {
            return false;
        };
        self.mac(filenames, created_at, plan_id, nonce)
            .verify_slice(&provided)
            .is_ok()
    }
}
