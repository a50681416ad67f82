//! Public-key JWK representation.
//!
//! Fields are declared in sorted order so that `serde_json` serialization
//! of this struct *is* the canonical deterministic encoding. Every DID
//! derivation and credential embedding goes through [`PublicKeyJwk::canonical_json`];
//! reordering the fields changes derived identifiers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// JWS algorithm for P-256 ECDSA with SHA-256.
pub const ALG_ES256: &str = "ES256";
/// JWK curve name for P-256.
pub const CRV_P256: &str = "P-256";
/// JWK key type for elliptic-curve keys.
pub const KTY_EC: &str = "EC";

fn default_alg() -> String {
    ALG_ES256.to_string()
}

/// A P-256 public key in JWK form.
///
/// Immutable once produced for a given key generation; two calls against the
/// same underlying key yield identical structs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyJwk {
    /// Signature algorithm (`ES256`). Tolerated absent on decode.
    #[serde(default = "default_alg")]
    pub alg: String,
    /// Curve (`P-256`).
    pub crv: String,
    /// Key type (`EC`).
    pub kty: String,
    /// X coordinate, base64url without padding.
    pub x: String,
    /// Y coordinate, base64url without padding.
    pub y: String,
}

impl PublicKeyJwk {
    /// Builds a JWK from an uncompressed SEC1 point (65 bytes, `0x04` tag).
    ///
    /// # Errors
    /// Returns [`KeyError::InvalidKeyMaterial`] if the encoding is not an
    /// uncompressed P-256 point.
    pub fn from_sec1(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != 65 || bytes[0] != 0x04 {
            return Err(KeyError::InvalidKeyMaterial(format!(
                "expected 65-byte uncompressed SEC1 point, got {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            alg: ALG_ES256.to_string(),
            crv: CRV_P256.to_string(),
            kty: KTY_EC.to_string(),
            x: URL_SAFE_NO_PAD.encode(&bytes[1..33]),
            y: URL_SAFE_NO_PAD.encode(&bytes[33..65]),
        })
    }

    /// Decodes the coordinates back to fixed 32-byte arrays.
    ///
    /// # Errors
    /// Returns [`KeyError::InvalidKeyMaterial`] if either coordinate is not
    /// 32 bytes of valid base64url.
    pub fn coordinates(&self) -> Result<([u8; 32], [u8; 32]), KeyError> {
        let decode = |name: &str, value: &str| -> Result<[u8; 32], KeyError> {
            let bytes = URL_SAFE_NO_PAD
                .decode(value)
                .map_err(|e| KeyError::InvalidKeyMaterial(format!("{name}: {e}")))?;
            bytes.try_into().map_err(|_| {
                KeyError::InvalidKeyMaterial(format!("{name}: coordinate is not 32 bytes"))
            })
        };
        Ok((decode("x", &self.x)?, decode("y", &self.y)?))
    }

    /// Canonical deterministic JSON encoding (sorted keys, no whitespace).
    ///
    /// # Panics
    /// Panics if JSON serialization of a plain string struct fails, which
    /// cannot happen.
    #[must_use]
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("string-only struct serializes")
    }
}
