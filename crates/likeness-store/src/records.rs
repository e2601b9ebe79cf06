use chrono::{DateTime, Utc};
use likeness_core::{FaceSignature, IdentityId, SignatureId};
use serde::Serialize;

/// A person enrolled in the system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
    pub created: DateTime<Utc>,
}

/// One persisted signature and its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignatureRecord {
    pub id: SignatureId,
    pub identity_id: IdentityId,
    /// Reference to the archived source image.
    pub image_ref: String,
    pub created: DateTime<Utc>,
    #[serde(skip)]
    pub signature: FaceSignature,
}

/// An identity together with all signature records it owns, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityProfile {
    #[serde(flatten)]
    pub identity: Identity,
    pub signatures: Vec<SignatureRecord>,
}

impl IdentityProfile {
    /// An identity without signatures can never be recognized.
    pub fn is_complete(&self) -> bool {
        !self.signatures.is_empty()
    }
}
