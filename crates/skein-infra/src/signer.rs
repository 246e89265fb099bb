//! Execution token signer.
//!
//! Mints the bearer token scoped to one execution, behind the core
//! `TokenSigner` port. The token is an HMAC-SHA256 tag over the execution
//! id, hex-encoded; verification on the callback side recomputes the tag
//! with the same key.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use skein_core::executor::TokenSigner;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub struct HmacTokenSigner {
    key: Vec<u8>,
}

impl HmacTokenSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Constant-time check that a presented token belongs to an execution.
    pub fn verify(&self, execution_id: &Uuid, token: &str) -> bool {
        let Ok(expected) = hex_decode(token) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            return false;
        };
        mac.update(execution_id.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

impl TokenSigner for HmacTokenSigner {
    fn token_for(&self, execution_id: &Uuid) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(execution_id.as_bytes());
        let tag = mac.finalize().into_bytes();
        tag.iter().fold(String::with_capacity(64), |mut out, b| {
            use std::fmt::Write;
            let _ = write!(out, "{b:02x}");
            out
        })
    }
}

fn hex_decode(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
