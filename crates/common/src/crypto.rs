//! RSA key handling for `ActivityPub` signatures.
//!
//! Delivery jobs never embed a parsed key; they carry a [`PrivateKeySource`]
//! that is resolved on the worker right before signing.
//!
//! # Examples
//!
//! ```
//! use tern_common::crypto::{generate_rsa_keypair, PrivateKeySource};
//!
//! # async fn example() -> tern_common::AppResult<()> {
//! let keypair = generate_rsa_keypair()?;
//! let source = PrivateKeySource::Pem(keypair.private_key_pem);
//! let _key = source.load().await?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
};
use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

/// RSA key pair in PEM format.
#[derive(Debug, Clone)]
pub struct RsaKeypair {
    /// Public key in PEM format (SPKI encoding).
    pub public_key_pem: String,
    /// Private key in PEM format (PKCS#8 encoding).
    pub private_key_pem: String,
}

/// Default RSA key size (2048 bits).
const RSA_KEY_SIZE: usize = 2048;

/// Where the private key of a signing actor lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum PrivateKeySource {
    /// PEM text stored alongside the job.
    Pem(String),
    /// Path to a PEM file owned by the local user.
    File(PathBuf),
}

impl PrivateKeySource {
    /// Read and parse the key.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Storage`] if the file cannot be read, and
    /// [`AppError::Signing`] if the PEM is not a PKCS#8 RSA private key.
    pub async fn load(&self) -> AppResult<RsaPrivateKey> {
        match self {
            Self::Pem(pem) => parse_private_key(pem),
            Self::File(path) => {
                let pem = tokio::fs::read_to_string(path).await.map_err(|e| {
                    AppError::Storage(format!("Failed to read key {}: {e}", path.display()))
                })?;
                parse_private_key(&pem)
            }
        }
    }
}

/// Generate a new 2048-bit RSA key pair.
///
/// # Errors
///
/// Returns [`AppError::Internal`] if key generation or PEM encoding fails.
pub fn generate_rsa_keypair() -> AppResult<RsaKeypair> {
    let mut rng = rand::thread_rng();

    let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_SIZE)
        .map_err(|e| AppError::Internal(format!("Failed to generate RSA key: {e}")))?;

    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(format!("Failed to encode private key: {e}")))?
        .to_string();

    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(format!("Failed to encode public key: {e}")))?;

    Ok(RsaKeypair {
        public_key_pem,
        private_key_pem,
    })
}

/// Parse a PKCS#8 RSA private key from PEM.
pub fn parse_private_key(pem: &str) -> AppResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .map_err(|e| AppError::Signing(format!("Failed to parse private key: {e}")))
}

/// Parse an SPKI RSA public key from PEM.
pub fn parse_public_key(pem: &str) -> AppResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| AppError::Signing(format!("Failed to parse public key: {e}")))
}
