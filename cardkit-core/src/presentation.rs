//! Offline OIDC4VP-style presentation exchange.
//!
//! A simplified, QR/URL-carried subset of OpenID for Verifiable
//! Presentations: the whole request travels base64url-encoded inside a
//! custom-scheme URI, the response comes back as a callback URI with
//! `state` and `vp_token` query parameters. In-flight requests are
//! tracked by their opaque `state` token and are strictly single-use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::credential::{CredentialEngine, ImportedCredential};
use crate::error::{Error, Result};

/// URI schemes and OIDC client identity for the exchange protocol.
///
/// Constructed at the composition root; the scheme doubles as the
/// payload-sniffing prefix for imports.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Custom URI scheme, e.g. `cardkit`.
    pub scheme: String,
    /// OIDC `client_id` for requests created by this instance.
    pub client_id: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self { scheme: "cardkit".to_string(), client_id: "cardkit".to_string() }
    }
}

impl ProtocolConfig {
    /// Prefix of presentation-request URIs.
    #[must_use]
    pub fn request_prefix(&self) -> String {
        format!("{}://?request=", self.scheme)
    }

    /// Prefix of response callback URIs.
    #[must_use]
    pub fn callback_prefix(&self) -> String {
        format!("{}://callback", self.scheme)
    }
}

/// A field constraint inside an input descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConstraint {
    /// JSONPath selectors the submitted credential must satisfy.
    pub path: Vec<String>,
}

/// Constraints of an input descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// Required fields.
    pub fields: Vec<FieldConstraint>,
}

/// One requested input of a presentation definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDescriptor {
    /// Descriptor id.
    pub id: String,
    /// Human-readable purpose.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    /// Field constraints.
    pub constraints: Constraints,
}

/// What the requester asks the peer to present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationDefinition {
    /// Definition id.
    pub id: String,
    /// Requested inputs.
    pub input_descriptors: Vec<InputDescriptor>,
}

/// An OIDC4VP-style presentation request.
///
/// `state` is the unique tracking key until the request is consumed or
/// abandoned; `nonce` binds the eventual response to this request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationRequest {
    /// Requesting client.
    pub client_id: String,
    /// Callback URI for the response.
    pub redirect_uri: String,
    /// Always `vp_token`.
    pub response_type: String,
    /// Response delivery mode.
    pub response_mode: String,
    /// OIDC scope.
    pub scope: String,
    /// Opaque single-use tracking token.
    pub state: String,
    /// Response-binding nonce.
    pub nonce: String,
    /// What to present.
    pub presentation_definition: PresentationDefinition,
}

/// A freshly created request with its QR-encodable URI.
#[derive(Debug, Clone)]
pub struct CreatedRequest {
    /// The request as registered.
    pub request: PresentationRequest,
    /// The full request URI, ready for QR rendering.
    pub qr_string: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

struct PendingRequest {
    request: PresentationRequest,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

/// Builds and parses presentation requests/responses and tracks in-flight
/// requests by `state`.
pub struct PresentationProtocol {
    engine: Arc<CredentialEngine>,
    config: ProtocolConfig,
    // Registration and lookup-then-remove consumption race from different
    // tasks; one exclusive lock keeps both atomic.
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl PresentationProtocol {
    /// Creates a protocol instance over `engine`.
    #[must_use]
    pub fn new(engine: Arc<CredentialEngine>, config: ProtocolConfig) -> Self {
        Self { engine, config, pending: Mutex::new(HashMap::new()) }
    }

    /// Creates, registers, and URI-encodes a new presentation request.
    ///
    /// # Errors
    /// Returns [`Error::InvalidData`] if the request cannot be serialized.
    pub fn create_request(&self) -> Result<CreatedRequest> {
        let request = PresentationRequest {
            client_id: self.config.client_id.clone(),
            redirect_uri: self.config.callback_prefix(),
            response_type: "vp_token".to_string(),
            response_mode: "fragment".to_string(),
            scope: "openid".to_string(),
            state: random_token(),
            nonce: random_token(),
            presentation_definition: contact_card_definition(),
        };

        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&request)?);
        let created = CreatedRequest {
            qr_string: format!("{}{encoded}", self.config.request_prefix()),
            created_at: Utc::now(),
            request: request.clone(),
        };

        self.pending.lock().unwrap().insert(
            request.state.clone(),
            PendingRequest { request, created_at: created.created_at },
        );
        Ok(created)
    }

    /// Parses a request URI produced by [`Self::create_request`] on a peer.
    ///
    /// # Errors
    /// Returns [`Error::InvalidData`] when the URI does not carry a valid
    /// encoded request.
    pub fn parse_request(&self, uri: &str) -> Result<PresentationRequest> {
        let encoded = uri
            .strip_prefix(&self.config.request_prefix())
            .ok_or_else(|| Error::InvalidData("not a presentation request URI".to_string()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| Error::InvalidData(format!("request parameter: {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Builds the callback URI answering `request` with `vp_token`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidData`] when the request's redirect URI is
    /// unparseable.
    pub fn build_response_uri(&self, request: &PresentationRequest, vp_token: &str) -> Result<String> {
        let mut url = Url::parse(&request.redirect_uri)
            .map_err(|e| Error::InvalidData(format!("redirect_uri: {e}")))?;
        url.query_pairs_mut()
            .append_pair("state", &request.state)
            .append_pair("vp_token", vp_token);
        Ok(url.into())
    }

    /// Consumes a response callback: claims the pending request by `state`
    /// (each `state` can be consumed at most once) and imports the
    /// presented credential.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] for an unknown or already-consumed
    /// `state` and [`Error::InvalidData`] for a malformed callback. When
    /// the import itself fails the claimed request is re-registered and
    /// the failure propagated.
    pub fn handle_response(&self, uri: &str) -> Result<ImportedCredential> {
        let url = Url::parse(uri).map_err(|e| Error::InvalidData(format!("callback: {e}")))?;
        let mut state = None;
        let mut vp_token = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "state" => state = Some(value.into_owned()),
                "vp_token" => vp_token = Some(value.into_owned()),
                _ => {}
            }
        }
        let state = state.ok_or_else(|| Error::InvalidData("callback missing state".to_string()))?;
        let vp_token =
            vp_token.ok_or_else(|| Error::InvalidData("callback missing vp_token".to_string()))?;

        // Atomic claim: a concurrent delivery of the same state loses here.
        let entry = self
            .pending
            .lock()
            .unwrap()
            .remove(&state)
            .ok_or_else(|| Error::NotFound(format!("no pending request for state {state}")))?;

        match self.engine.import_presented(&vp_token) {
            Ok(imported) => Ok(imported),
            Err(e) => {
                self.pending.lock().unwrap().insert(state, entry);
                Err(e)
            }
        }
    }

    /// Number of in-flight requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// The pending request registered under `state`, if any.
    #[must_use]
    pub fn pending_request(&self, state: &str) -> Option<PresentationRequest> {
        self.pending.lock().unwrap().get(state).map(|p| p.request.clone())
    }
}

fn contact_card_definition() -> PresentationDefinition {
    PresentationDefinition {
        id: "contact-card-exchange".to_string(),
        input_descriptors: vec![InputDescriptor {
            id: "contact-card".to_string(),
            purpose: Some("Share your contact card".to_string()),
            constraints: Constraints {
                fields: vec![FieldConstraint {
                    path: vec!["$.credentialSubject.displayName".to_string()],
                }],
            },
        }],
    }
}

/// 16 random bytes, hex-encoded. Collision probability is negligible;
/// treated as globally unique for the process lifetime.
fn random_token() -> String {
    let mut bytes = [0_u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
