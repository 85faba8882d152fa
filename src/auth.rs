//! Challenge/response device authentication.
//!
//! The gateway mints a random nonce at HELLO and the device answers with an
//! RSA-PKCS#1 v1.5 / SHA-256 signature over the exact UTF-8 string
//! `deviceId + "." + nonce`. Verification is fail-closed: every error path
//! yields `false`, never an `Err` or a panic.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::sha2::Sha256;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use tracing::debug;

use crate::registry::CachedRegistry;

const NONCE_BYTES: usize = 24;

/// Fresh base64 nonce for one challenge.
pub fn new_nonce() -> String {
    let mut raw = [0u8; NONCE_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    BASE64.encode(raw)
}

pub struct DeviceAuthenticator {
    registry: Arc<CachedRegistry>,
}

impl DeviceAuthenticator {
    pub fn new(registry: Arc<CachedRegistry>) -> Self {
        Self { registry }
    }

    pub async fn verify(&self, device_id: &str, nonce: &str, sig_b64: &str) -> bool {
        let pem = match self.registry.certificate(device_id).await {
            Ok(Some(pem)) => pem,
            Ok(None) => {
                debug!(device = %device_id, "no certificate registered");
                return false;
            }
            Err(err) => {
                debug!(device = %device_id, error = %err, "certificate lookup failed");
                return false;
            }
        };
        let signature = match BASE64.decode(sig_b64) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(device = %device_id, error = %err, "signature is not valid base64");
                return false;
            }
        };
        verify_signature(device_id, nonce, &pem, &signature)
    }
}

fn verify_signature(device_id: &str, nonce: &str, pem: &str, signature: &[u8]) -> bool {
    let key = match RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
    {
        Ok(key) => key,
        Err(err) => {
            debug!(device = %device_id, error = %err, "unusable device key PEM");
            return false;
        }
    };
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    let message = format!("{device_id}.{nonce}");
    VerifyingKey::<Sha256>::new(key)
        .verify(message.as_bytes(), &signature)
        .is_ok()
}
