//! Identity and credential core for CardKit, a peer-to-peer contact
//! sharing application.
//!
//! Each user holds a locally-generated P-256 identity (custodied by
//! `cardkit-keystore`), derives DID representations from it, issues and
//! verifies self-signed JWT credentials describing a shareable contact
//! card, and exchanges credentials over an offline, QR/URL-carried
//! OIDC4VP-style protocol.
//!
//! # Architecture
//!
//! Leaves first:
//!
//! 1. [`cardkit_keystore::SecureKeyStore`] — key custody with tiered
//!    hardware/software fallback.
//! 2. [`did::DidResolver`] — DID identifiers and documents derived from
//!    the key store's public key.
//! 3. [`credential::CredentialEngine`] — JWT credential issuance,
//!    verification, and import.
//! 4. [`presentation::PresentationProtocol`] — request/response exchange
//!    tracked by single-use `state` tokens.
//! 5. [`coordinator::IdentityCoordinator`] — snapshot-publishing state
//!    machine and import pipeline; the API the application consumes.
//!
//! All services are explicitly constructed and wired at the composition
//! root; collaborator backends (credential library, ZK identity engine,
//! group roster, cache persistence) are injected through the traits in
//! [`credential`] and [`provider`].

pub mod coordinator;
pub mod credential;
pub mod did;
mod error;
pub mod jose;
pub mod presentation;
pub mod profile;
pub mod provider;

pub use coordinator::{Collaborators, IdentityCoordinator};
pub use credential::{
    CredentialEngine, CredentialLibrary, IssueOptions, IssuedCredential, MemoryLibrary,
    StoredCredential, VerificationStatus,
};
pub use did::{DidDescriptor, DidDocument, DidMethod, DidResolver};
pub use error::{Error, Result};
pub use presentation::{PresentationProtocol, PresentationRequest, ProtocolConfig};
pub use profile::{ContactCard, ProfileSnapshot};
