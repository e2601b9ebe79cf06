//! Enrollment and recognition workflows.
//!
//! A [`Pipeline`] owns one extractor, the signature store and the image
//! archive. It is driven from a single thread; every operation runs to a
//! terminal outcome and leaves no partial state behind.

use crate::archive::{ArchiveError, ImageArchive};
use chrono::Utc;
use likeness_core::{
    EuclideanMatcher, ExtractError, Extraction, FaceSignature, IdentityId, ImageKind,
    MatchDecision, SignatureExtractor, SignatureId,
};
use likeness_store::{Identity, IdentityProfile, SignatureStore, StoreError};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("extractor produces {extractor}-d signatures but the store holds {store}-d signatures")]
    DimensionMismatch { extractor: usize, store: usize },
}

/// Raw image handed in by a caller.
#[derive(Debug, Clone, Copy)]
pub struct Upload<'a> {
    pub bytes: &'a [u8],
    pub kind: ImageKind,
    /// Caller-supplied file name; only used to name the archived copy.
    pub filename: &'a str,
}

/// Why a request ended without producing a result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    Decode { message: String },
    NoFaceFound,
    UnknownIdentity { identity_id: IdentityId },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Enrollment {
    Persisted {
        identity: Identity,
        signature_id: SignatureId,
        image_ref: String,
    },
    Rejected(Rejection),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Recognition {
    Matched {
        identity: IdentityProfile,
        distance: f32,
    },
    /// A valid negative result.
    NoMatch { closest: Option<f32> },
    Rejected(Rejection),
}

/// Store population and matching parameters.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub identities: usize,
    pub signatures: usize,
    pub signature_dim: usize,
    pub match_threshold: f32,
}

pub struct Pipeline<E> {
    extractor: E,
    store: SignatureStore,
    archive: ImageArchive,
    matcher: EuclideanMatcher,
    discard_incomplete: bool,
}

impl<E: SignatureExtractor> Pipeline<E> {
    /// Fails if the extractor and the store disagree on dimensionality.
    pub fn new(
        extractor: E,
        store: SignatureStore,
        archive: ImageArchive,
        matcher: EuclideanMatcher,
        discard_incomplete: bool,
    ) -> Result<Self, WorkflowError> {
        if extractor.dimension() != store.dimension() {
            return Err(WorkflowError::DimensionMismatch {
                extractor: extractor.dimension(),
                store: store.dimension(),
            });
        }
        Ok(Self {
            extractor,
            store,
            archive,
            matcher,
            discard_incomplete,
        })
    }

    /// Enroll an image under an existing identity.
    pub fn enroll(
        &mut self,
        identity_id: IdentityId,
        upload: Upload<'_>,
    ) -> Result<Enrollment, WorkflowError> {
        let signature = match self.signature_of(upload.bytes, upload.kind)? {
            Ok(signature) => signature,
            Err(rejection) => {
                tracing::info!(identity = identity_id, ?rejection, "enrollment rejected");
                return Ok(Enrollment::Rejected(rejection));
            }
        };

        let image_ref = self.archive.store(upload.filename, upload.bytes)?;
        let signature_id = match self.store.add(identity_id, &signature, &image_ref) {
            Ok(id) => id,
            Err(err) => {
                self.discard_image(&image_ref);
                return match err {
                    StoreError::UnknownIdentity(identity_id) => {
                        tracing::info!(identity = identity_id, "enrollment rejected: unknown identity");
                        Ok(Enrollment::Rejected(Rejection::UnknownIdentity { identity_id }))
                    }
                    other => Err(other.into()),
                };
            }
        };

        // Single writer: the identity cannot vanish between `add` and here.
        let identity = self
            .store
            .get_identity(identity_id)?
            .ok_or(StoreError::UnknownIdentity(identity_id))?;

        tracing::info!(identity = identity_id, signature = signature_id, %image_ref, "enrollment persisted");
        Ok(Enrollment::Persisted {
            identity,
            signature_id,
            image_ref,
        })
    }

    /// Create a new identity named `name`, then enroll the image under it.
    ///
    /// When the enrollment does not persist and `discard_incomplete` is set,
    /// the new identity is deleted again.
    pub fn enroll_new(&mut self, name: &str, upload: Upload<'_>) -> Result<Enrollment, WorkflowError> {
        let identity = self.store.create_identity(name, Utc::now())?;
        let result = self.enroll(identity.id, upload);

        let persisted = matches!(result, Ok(Enrollment::Persisted { .. }));
        if !persisted && self.discard_incomplete {
            if let Err(err) = self.store.delete_identity(identity.id) {
                tracing::warn!(identity = identity.id, error = %err, "failed to discard incomplete identity");
            }
        }
        result
    }

    /// Identify the person in an image.
    pub fn recognize(&mut self, bytes: &[u8], kind: ImageKind) -> Result<Recognition, WorkflowError> {
        let signature = match self.signature_of(bytes, kind)? {
            Ok(signature) => signature,
            Err(rejection) => return Ok(Recognition::Rejected(rejection)),
        };

        let mut best = self.matcher.begin(&signature);
        let visited = self
            .store
            .for_each_candidate(|c| best.offer(c.identity_id, &c.signature))?;
        let decision = best.decide(self.matcher.threshold());
        tracing::debug!(candidates = visited, ?decision, "recognition scan finished");

        match decision {
            MatchDecision::Accepted {
                identity_id,
                distance,
            } => match self.store.identity_profile(identity_id)? {
                Some(identity) => {
                    tracing::info!(identity = identity_id, distance, "face recognized");
                    Ok(Recognition::Matched { identity, distance })
                }
                None => Ok(Recognition::NoMatch {
                    closest: Some(distance),
                }),
            },
            MatchDecision::NoMatch { closest } => {
                tracing::info!(?closest, "no matching identity");
                Ok(Recognition::NoMatch { closest })
            }
        }
    }

    pub fn identity(&self, id: IdentityId) -> Result<Option<IdentityProfile>, WorkflowError> {
        Ok(self.store.identity_profile(id)?)
    }

    pub fn identities(&self) -> Result<Vec<Identity>, WorkflowError> {
        Ok(self.store.list_identities()?)
    }

    /// Delete an identity, its signatures and their archived images.
    ///
    /// Returns `false` if no such identity existed.
    pub fn delete_identity(&mut self, id: IdentityId) -> Result<bool, WorkflowError> {
        let Some(profile) = self.store.delete_identity(id)? else {
            return Ok(false);
        };
        for record in &profile.signatures {
            self.discard_image(&record.image_ref);
        }
        Ok(true)
    }

    /// Undo a persisted enrollment nobody received.
    ///
    /// With `created_identity` the whole identity goes (it was made for this
    /// enrollment); otherwise only the new signature record and its image.
    pub fn revert_enrollment(
        &mut self,
        outcome: &Enrollment,
        created_identity: bool,
    ) -> Result<(), WorkflowError> {
        let Enrollment::Persisted {
            identity,
            signature_id,
            image_ref,
        } = outcome
        else {
            return Ok(());
        };
        if created_identity {
            self.delete_identity(identity.id)?;
        } else {
            self.store.remove_signature(*signature_id)?;
            self.discard_image(image_ref);
        }
        tracing::info!(identity = identity.id, signature = signature_id, "enrollment reverted");
        Ok(())
    }

    pub fn status(&self) -> Result<PipelineStatus, WorkflowError> {
        Ok(PipelineStatus {
            identities: self.store.list_identities()?.len(),
            signatures: self.store.signature_count()?,
            signature_dim: self.store.dimension(),
            match_threshold: self.matcher.threshold(),
        })
    }

    /// Decode and extract. Domain rejections are the inner `Err`.
    fn signature_of(
        &mut self,
        bytes: &[u8],
        kind: ImageKind,
    ) -> Result<Result<FaceSignature, Rejection>, WorkflowError> {
        match self.extractor.extract_bytes(bytes, kind) {
            Ok(Extraction::Signature(signature)) => {
                if signature.dimension() != self.store.dimension() {
                    return Err(WorkflowError::DimensionMismatch {
                        extractor: signature.dimension(),
                        store: self.store.dimension(),
                    });
                }
                Ok(Ok(signature))
            }
            Ok(Extraction::NoFaceFound) => Ok(Err(Rejection::NoFaceFound)),
            Err(ExtractError::Decode(err)) => Ok(Err(Rejection::Decode {
                message: err.to_string(),
            })),
            Err(err) => Err(err.into()),
        }
    }

    fn discard_image(&self, image_ref: &str) {
        if let Err(err) = self.archive.discard(image_ref) {
            tracing::warn!(image_ref, error = %err, "failed to discard archived image");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pipeline, png, ColourExtractor, BLACK, BLUE, RED};
    use likeness_core::DEFAULT_MATCH_THRESHOLD;

    fn upload<'a>(bytes: &'a [u8], filename: &'a str) -> Upload<'a> {
        Upload { bytes, kind: ImageKind::Png, filename }
    }

    fn archived_files(p: &Pipeline<ColourExtractor>) -> usize {
        match std::fs::read_dir(p.archive.root().join("trained")) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[test]
    fn test_end_to_end_scenario() {
        let (mut p, _tmp) = pipeline(DEFAULT_MATCH_THRESHOLD);
        let image_a = png(RED);
        let image_b = png(BLUE);
        let no_face = png(BLACK);

        let ana = match p.enroll_new("Ana", upload(&image_a, "a.png")).unwrap() {
            Enrollment::Persisted { identity, .. } => identity,
            other => panic!("expected persisted, got {other:?}"),
        };
        let profile = p.identity(ana.id).unwrap().unwrap();
        assert_eq!(profile.identity.name, "Ana");
        assert_eq!(profile.signatures.len(), 1);

        match p.recognize(&image_a, ImageKind::Png).unwrap() {
            Recognition::Matched { identity, distance } => {
                assert_eq!(identity.identity.name, "Ana");
                assert!(distance < 1e-6);
            }
            other => panic!("expected a match, got {other:?}"),
        }

        assert!(matches!(
            p.recognize(&image_b, ImageKind::Png).unwrap(),
            Recognition::NoMatch { closest: Some(_) }
        ));

        assert_eq!(
            p.recognize(&no_face, ImageKind::Png).unwrap(),
            Recognition::Rejected(Rejection::NoFaceFound)
        );

        assert!(p.delete_identity(ana.id).unwrap());
        assert_eq!(
            p.recognize(&image_a, ImageKind::Png).unwrap(),
            Recognition::NoMatch { closest: None }
        );
        assert_eq!(archived_files(&p), 0);
    }

    #[test]
    fn test_no_face_leaves_no_state() {
        let (mut p, _tmp) = pipeline(DEFAULT_MATCH_THRESHOLD);
        let outcome = p.enroll_new("Ghost", upload(&png(BLACK), "g.png")).unwrap();
        assert_eq!(outcome, Enrollment::Rejected(Rejection::NoFaceFound));
        assert!(p.identities().unwrap().is_empty());
        assert_eq!(archived_files(&p), 0);
    }

    #[test]
    fn test_incomplete_identity_kept_when_configured() {
        let (mut p, _tmp) = pipeline(DEFAULT_MATCH_THRESHOLD);
        p.discard_incomplete = false;
        p.enroll_new("Ghost", upload(&png(BLACK), "g.png")).unwrap();
        let identities = p.identities().unwrap();
        assert_eq!(identities.len(), 1);
        assert!(!p.identity(identities[0].id).unwrap().unwrap().is_complete());
    }

    #[test]
    fn test_decode_error_distinct_from_no_face() {
        let (mut p, _tmp) = pipeline(DEFAULT_MATCH_THRESHOLD);
        match p.recognize(b"not a png", ImageKind::Png).unwrap() {
            Recognition::Rejected(Rejection::Decode { .. }) => {}
            other => panic!("expected decode rejection, got {other:?}"),
        }
        let outcome = p.enroll_new("Bad", upload(b"not a png", "bad.png")).unwrap();
        assert!(matches!(outcome, Enrollment::Rejected(Rejection::Decode { .. })));
    }

    #[test]
    fn test_enroll_unknown_identity_discards_image() {
        let (mut p, _tmp) = pipeline(DEFAULT_MATCH_THRESHOLD);
        let outcome = p.enroll(404, upload(&png(RED), "a.png")).unwrap();
        assert_eq!(
            outcome,
            Enrollment::Rejected(Rejection::UnknownIdentity { identity_id: 404 })
        );
        assert_eq!(p.status().unwrap().signatures, 0);
        assert_eq!(archived_files(&p), 0);
    }

    #[test]
    fn test_reenroll_adds_second_record() {
        let (mut p, _tmp) = pipeline(DEFAULT_MATCH_THRESHOLD);
        let ana = match p.enroll_new("Ana", upload(&png(RED), "a1.png")).unwrap() {
            Enrollment::Persisted { identity, .. } => identity,
            other => panic!("expected persisted, got {other:?}"),
        };
        let first = p.identity(ana.id).unwrap().unwrap().signatures;

        let outcome = p.enroll(ana.id, upload(&png([190, 30, 30]), "a2.png")).unwrap();
        assert!(matches!(outcome, Enrollment::Persisted { .. }));

        let both = p.identity(ana.id).unwrap().unwrap().signatures;
        assert_eq!(both.len(), 2);
        assert_eq!(both[0], first[0]);
        assert_ne!(both[0].id, both[1].id);
        assert_eq!(archived_files(&p), 2);
    }

    #[test]
    fn test_revert_enrollment_of_new_identity() {
        let (mut p, _tmp) = pipeline(DEFAULT_MATCH_THRESHOLD);
        let outcome = p.enroll_new("Ana", upload(&png(RED), "a.png")).unwrap();
        p.revert_enrollment(&outcome, true).unwrap();

        let status = p.status().unwrap();
        assert_eq!((status.identities, status.signatures), (0, 0));
        assert_eq!(archived_files(&p), 0);
    }

    #[test]
    fn test_revert_enrollment_keeps_existing_identity() {
        let (mut p, _tmp) = pipeline(DEFAULT_MATCH_THRESHOLD);
        let Enrollment::Persisted { identity, .. } =
            p.enroll_new("Ana", upload(&png(RED), "a1.png")).unwrap()
        else {
            panic!("expected persisted");
        };
        let outcome = p.enroll(identity.id, upload(&png(RED), "a2.png")).unwrap();
        p.revert_enrollment(&outcome, false).unwrap();

        let profile = p.identity(identity.id).unwrap().unwrap();
        assert_eq!(profile.signatures.len(), 1);
        assert!(profile.signatures[0].image_ref.ends_with("-a1.png"));
        assert_eq!(archived_files(&p), 1);

        // Rejections have nothing to undo.
        p.revert_enrollment(&Enrollment::Rejected(Rejection::NoFaceFound), true)
            .unwrap();
        assert!(p.identity(identity.id).unwrap().is_some());
    }

    #[test]
    fn test_identity_without_signatures_never_wins() {
        let (mut p, _tmp) = pipeline(10.0);
        p.store.create_identity("Empty", Utc::now()).unwrap();
        let bo = match p.enroll_new("Bo", upload(&png(BLUE), "b.png")).unwrap() {
            Enrollment::Persisted { identity, .. } => identity,
            other => panic!("expected persisted, got {other:?}"),
        };
        // A huge threshold accepts anything, so the only possible winner is Bo.
        match p.recognize(&png(RED), ImageKind::Png).unwrap() {
            Recognition::Matched { identity, .. } => assert_eq!(identity.identity.id, bo.id),
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn test_nearest_identity_wins() {
        let (mut p, _tmp) = pipeline(DEFAULT_MATCH_THRESHOLD);
        p.enroll_new("Ana", upload(&png(RED), "a.png")).unwrap();
        p.enroll_new("Bo", upload(&png(BLUE), "b.png")).unwrap();
        match p.recognize(&png([20, 30, 190]), ImageKind::Png).unwrap() {
            Recognition::Matched { identity, .. } => assert_eq!(identity.identity.name, "Bo"),
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn test_dimension_mismatch_rejected_at_construction() {
        let tmp = tempfile::TempDir::new().unwrap();
        let result = Pipeline::new(
            ColourExtractor,
            SignatureStore::open_in_memory(512).unwrap(),
            ImageArchive::new(tmp.path()),
            EuclideanMatcher::default(),
            true,
        );
        assert!(matches!(
            result,
            Err(WorkflowError::DimensionMismatch { extractor: 3, store: 512 })
        ));
    }

    #[test]
    fn test_outcome_json_shape() {
        let json = serde_json::to_value(Recognition::Rejected(Rejection::NoFaceFound)).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["reason"], "no_face_found");

        let json = serde_json::to_value(Recognition::NoMatch { closest: None }).unwrap();
        assert_eq!(json["outcome"], "no_match");
    }
}
