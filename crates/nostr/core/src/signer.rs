//! Signing capability.
//!
//! Key material stays behind this trait. Implementations may hold a local key,
//! talk to a remote bunker or a browser extension.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::nip01::{Event, Nip01Error, UnsignedEvent};

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signer rejected the request: {0}")]
    Rejected(String),

    #[error("operation not supported by this signer: {0}")]
    Unsupported(&'static str),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error(transparent)]
    Event(#[from] Nip01Error),
}

#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex x-only public key.
    async fn get_public_key(&self) -> Result<String, SignerError>;

    async fn sign(&self, event: UnsignedEvent) -> Result<Event, SignerError>;

    async fn encrypt(&self, plaintext: &str, counterparty: &str) -> Result<String, SignerError>;

    async fn decrypt(&self, ciphertext: &str, counterparty: &str) -> Result<String, SignerError>;
}

/// Decrypt untrusted content. Malformed payloads yield `None`.
pub async fn decrypt_content(
    signer: &dyn Signer,
    ciphertext: &str,
    counterparty: &str,
) -> Option<String> {
    match signer.decrypt(ciphertext, counterparty).await {
        Ok(plaintext) => Some(plaintext),
        Err(e) => {
            debug!(error = %e, "could not decrypt content");
            None
        }
    }
}
