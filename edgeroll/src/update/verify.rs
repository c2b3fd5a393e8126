//! Checksum and signature verification of downloaded artifacts

use std::collections::HashSet;
use std::path::Path;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::FleetError;
use crate::filesys::file::File;
use crate::models::update::Update;
use crate::utils::normalize_checksum;

/// Compare the SHA-256 of `path` with `expected` (`sha256:` prefix optional)
pub async fn verify_checksum(path: &Path, expected: &str) -> Result<(), FleetError> {
    let expected = normalize_checksum(expected)?;
    let actual = File::new(path).sha256().await?;
    if actual != expected {
        return Err(FleetError::Integrity(format!(
            "checksum mismatch: expected {}, got {}",
            expected, actual
        )));
    }
    Ok(())
}

/// Checks the signature attached to an update
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, update: &Update, signature: &str) -> Result<(), FleetError>;
}

/// Claims a release signature carries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureClaims {
    pub version: String,
    pub checksum: String,
}

/// Accepts HS256 JWTs whose claims name the update's version and checksum
pub struct JwtSignatureVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtSignatureVerifier {
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::new();
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }
}

impl SignatureVerifier for JwtSignatureVerifier {
    fn verify(&self, update: &Update, signature: &str) -> Result<(), FleetError> {
        let token = decode::<SignatureClaims>(signature, &self.key, &self.validation)
            .map_err(|e| FleetError::Integrity(format!("invalid signature: {}", e)))?;
        let claims = token.claims;

        if claims.version != update.version {
            return Err(FleetError::Integrity(format!(
                "signature is for version {}, update is {}",
                claims.version, update.version
            )));
        }
        let signed = normalize_checksum(&claims.checksum)
            .map_err(|e| FleetError::Integrity(format!("signed checksum: {}", e)))?;
        if signed != normalize_checksum(&update.checksum)? {
            return Err(FleetError::Integrity(
                "signature does not cover the update checksum".to_string(),
            ));
        }
        Ok(())
    }
}
