//! Published identity state and the discrete event stream.
//!
//! `IdentityState` is an immutable snapshot: every mutation clones the
//! last published value, applies its change, and replaces the whole
//! snapshot, so readers never observe a partial write. Callers that need
//! a precise history of individual changes consume [`CoordinatorEvent`]s
//! instead of diffing snapshots.

use std::collections::HashMap;

use cardkit_keystore::PublicKeyJwk;
use chrono::{DateTime, Utc};
use strum::Display;

use crate::credential::VerificationStatus;
use crate::did::DidDocument;
use crate::presentation::PresentationRequest;

/// Membership standing in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum MembershipStatus {
    /// The commitment is present in the group's member list.
    Active,
    /// Reserved for rosters that can mark stale membership; refresh never
    /// produces this on its own.
    Outdated,
}

/// A group-membership summary for the current identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    /// Group id.
    pub group_id: String,
    /// Group display name.
    pub name: String,
    /// Membership standing.
    pub status: MembershipStatus,
}

/// The identity's own profile as currently published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentProfile {
    /// ZK identity commitment, once the bundle exists.
    pub zk_commitment: Option<String>,
    /// The active DID.
    pub active_did: Option<String>,
    /// Group memberships recomputed at the last refresh.
    pub memberships: Vec<GroupMembership>,
}

/// Why an import happened, mirroring the payload classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ImportKind {
    /// An OIDC response callback consumed a pending request.
    OidcResponse,
    /// A peer's presentation request was parsed.
    OidcRequest,
    /// A DID document was cached.
    DidDocument,
    /// A bare public JWK was cached.
    PublicJwk,
    /// A raw private key replaced the ZK identity.
    ZkPrivateKey,
    /// A credential JWT was imported.
    Credential,
}

/// Record of a completed import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEvent {
    /// What was imported.
    pub kind: ImportKind,
    /// Human-readable summary for UI surfaces.
    pub summary: String,
    /// When the import completed.
    pub timestamp: DateTime<Utc>,
}

/// A discrete per-credential verification update.
///
/// Emitted for single [`super::IdentityCoordinator::update_status`] calls
/// only; bulk merges publish a new snapshot without discrete events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationEvent {
    /// The credential whose status changed.
    pub credential_id: String,
    /// The new status.
    pub status: VerificationStatus,
    /// When the update was published.
    pub timestamp: DateTime<Utc>,
}

/// Kinds of OIDC tracking events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum OidcEventKind {
    /// A presentation request was registered.
    RequestCreated,
}

/// An OIDC request-tracking event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcEvent {
    /// Event kind.
    pub kind: OidcEventKind,
    /// The request's `state` token.
    pub state: String,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
}

/// Discrete events emitted alongside snapshot publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// An import completed.
    Import(ImportEvent),
    /// A single credential's verification status changed.
    Verification(VerificationEvent),
    /// An OIDC request-tracking change.
    Oidc(OidcEvent),
}

/// The coordinator-owned state snapshot.
#[derive(Debug, Clone, Default)]
pub struct IdentityState {
    /// Whether the DID-load step of a refresh is in flight.
    pub is_loading: bool,
    /// The current identity profile.
    pub profile: CurrentProfile,
    /// The active DID's document.
    pub did_document: Option<DidDocument>,
    /// Cached documents by DID.
    pub cached_documents: HashMap<String, DidDocument>,
    /// Cached JWKs by DID.
    pub cached_jwks: HashMap<String, PublicKeyJwk>,
    /// Verification status by credential id.
    pub verification_cache: HashMap<String, VerificationStatus>,
    /// When the verification cache last changed.
    pub last_verification_update: Option<DateTime<Utc>>,
    /// The most recent completed import.
    pub last_import: Option<ImportEvent>,
    /// The most recent error, for UI observation.
    pub last_error: Option<String>,
    /// Outbound presentation requests tracked by `state`.
    pub active_requests: HashMap<String, PresentationRequest>,
    /// The most recent OIDC tracking event.
    pub last_oidc_event: Option<OidcEvent>,
}
