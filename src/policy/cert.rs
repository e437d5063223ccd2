//! Certificate table entries.
//!
//! Policies carry certificates as base64 DER. The TLS provider consumes the
//! DER bytes; this module only decodes them and derives a fingerprint for
//! logging and comparison.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

use crate::core::PolicyError;

/// A named DER certificate.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    /// Certificate name in the policy.
    pub name: String,
    der: Vec<u8>,
}

impl Certificate {
    /// Create a certificate from DER bytes.
    pub fn from_der(name: impl Into<String>, der: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            der,
        }
    }

    /// Decode a certificate from base64 DER.
    pub fn from_base64(name: impl Into<String>, encoded: &str) -> Result<Self, PolicyError> {
        let name = name.into();
        let der = decode_base64(encoded).map_err(|reason| PolicyError::InvalidCertificate {
            name: name.clone(),
            reason,
        })?;
        if der.is_empty() {
            return Err(PolicyError::InvalidCertificate {
                name,
                reason: "empty certificate".into(),
            });
        }
        Ok(Self { name, der })
    }

    /// DER bytes.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// SHA-256 fingerprint of the DER bytes, lowercase hex.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fingerprint = self.fingerprint();
        f.debug_struct("Certificate")
            .field("name", &self.name)
            .field("len", &self.der.len())
            .field("sha256", &&fingerprint[..16])
            .finish()
    }
}

fn decode_base64(input: &str) -> Result<Vec<u8>, String> {
    // Policies often wrap long certificates.
    let compact: String = input.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD.decode(compact).map_err(|e| e.to_string())
}
