//! Compact JWS primitives: base64url segments, header shape, and ES256
//! signature canonicalization/verification.
//!
//! Wire format (must match exactly for interop):
//! `base64url(header).base64url(payload).base64url(rawSignature)`: no
//! padding, `.` separators, exactly three segments. The raw signature is
//! the fixed-width 64-byte `(r, s)` concatenation; platform primitives
//! that emit DER are canonicalized before concatenation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cardkit_keystore::PublicKeyJwk;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::EncodedPoint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// `typ` value for credential JWTs.
pub const TYP_JWT: &str = "JWT";

/// Compact JWS protected header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Signature algorithm, always `ES256` here.
    pub alg: String,
    /// Token media type.
    pub typ: String,
    /// Verification-method id of the signing key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

impl Header {
    /// Header for an ES256 credential signed under `kid`.
    #[must_use]
    pub fn es256(kid: impl Into<String>) -> Self {
        Self {
            alg: cardkit_keystore::ALG_ES256.to_string(),
            typ: TYP_JWT.to_string(),
            kid: Some(kid.into()),
        }
    }
}

/// Serializes `value` to JSON and base64url-encodes it.
///
/// # Errors
/// Returns [`Error::InvalidData`] if serialization fails.
pub fn encode_segment<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decodes a base64url segment to raw bytes.
///
/// # Errors
/// Returns [`Error::InvalidData`] on invalid base64url.
pub fn decode_segment_bytes(segment: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| Error::InvalidData(format!("base64url segment: {e}")))
}

/// Decodes a base64url segment and deserializes it as JSON.
///
/// # Errors
/// Returns [`Error::InvalidData`] on invalid base64url or JSON.
pub fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T> {
    let bytes = decode_segment_bytes(segment)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Splits a compact JWT into its three segments.
///
/// # Errors
/// Returns [`Error::InvalidData`] unless the token has exactly three
/// non-empty dot-separated segments.
pub fn split_compact(token: &str) -> Result<(&str, &str, &str)> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() && !s.is_empty() => {
            Ok((h, p, s))
        }
        _ => Err(Error::InvalidData("not a 3-segment compact JWT".to_string())),
    }
}

/// Canonicalizes an ECDSA signature to the fixed-width 64-byte `(r, s)`
/// form, accepting either raw or ASN.1 DER input.
///
/// # Errors
/// Returns [`Error::Cryptographic`] when the bytes are neither a valid
/// raw nor a valid DER P-256 signature.
pub fn normalize_signature(bytes: &[u8]) -> Result<[u8; 64]> {
    let signature = if bytes.len() == 64 {
        Signature::from_slice(bytes)
            .map_err(|e| Error::Cryptographic(format!("raw signature: {e}")))?
    } else {
        Signature::from_der(bytes)
            .map_err(|e| Error::Cryptographic(format!("der signature: {e}")))?
    };
    let mut raw = [0_u8; 64];
    raw.copy_from_slice(&signature.to_bytes());
    Ok(raw)
}

/// Verifies a raw ES256 signature over `message` with the key in `jwk`.
///
/// A cryptographic mismatch is a *result* (`Ok(false)`), not an error;
/// errors are reserved for malformed key material.
///
/// # Errors
/// Returns [`Error::Cryptographic`] when the JWK does not describe a
/// valid P-256 point.
pub fn verify_es256(jwk: &PublicKeyJwk, message: &[u8], signature: &[u8; 64]) -> Result<bool> {
    let (x, y) = jwk.coordinates().map_err(|e| Error::Cryptographic(e.to_string()))?;
    let point = EncodedPoint::from_affine_coordinates(&x.into(), &y.into(), false);
    let key = VerifyingKey::from_encoded_point(&point)
        .map_err(|e| Error::Cryptographic(format!("public key: {e}")))?;

    let Ok(signature) = Signature::from_slice(signature) else {
        return Ok(false);
    };
    Ok(key.verify(message, &signature).is_ok())
}
