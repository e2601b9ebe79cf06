use crate::engine::{EngineError, EngineHandle, ImagePayload};
use likeness_core::ImageKind;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use zbus::{fdo, interface};

/// D-Bus interface for the likeness daemon.
///
/// Bus name: org.freedesktop.Likeness1
/// Object path: /org/freedesktop/Likeness1
pub struct LikenessService {
    engine: EngineHandle,
    allowed_types: Vec<ImageKind>,
    timeout: Duration,
}

impl LikenessService {
    pub fn new(engine: EngineHandle, allowed_types: Vec<ImageKind>, timeout: Duration) -> Self {
        Self {
            engine,
            allowed_types,
            timeout,
        }
    }

    fn payload(&self, mime: &str, filename: &str, image: Vec<u8>) -> fdo::Result<ImagePayload> {
        let kind = ImageKind::from_mime(mime)
            .filter(|kind| self.allowed_types.contains(kind))
            .ok_or_else(|| fdo::Error::InvalidArgs(format!("image type not allowed: {mime}")))?;
        Ok(ImagePayload {
            bytes: image,
            kind,
            filename: filename.to_string(),
        })
    }

    /// Await an engine call under the request timeout.
    async fn call<T>(&self, fut: impl Future<Output = Result<T, EngineError>>) -> fdo::Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                tracing::error!(error = %err, "request failed");
                Err(fdo::Error::Failed(err.to_string()))
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "request timed out");
                Err(fdo::Error::TimedOut(format!(
                    "no result within {}s",
                    self.timeout.as_secs()
                )))
            }
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.freedesktop.Likeness1")]
impl LikenessService {
    /// Create a new identity and enroll its first image.
    async fn enroll(
        &self,
        name: &str,
        mime: &str,
        filename: &str,
        image: Vec<u8>,
    ) -> fdo::Result<String> {
        tracing::info!(name, mime, bytes = image.len(), "enroll requested");
        if name.trim().is_empty() {
            return Err(fdo::Error::InvalidArgs("name must not be empty".into()));
        }
        let payload = self.payload(mime, filename, image)?;
        let outcome = self
            .call(self.engine.enroll_new(name.trim().to_string(), payload))
            .await?;
        to_json(&outcome)
    }

    /// Add an image to an existing identity.
    async fn enroll_identity(
        &self,
        id: i64,
        mime: &str,
        filename: &str,
        image: Vec<u8>,
    ) -> fdo::Result<String> {
        tracing::info!(id, mime, bytes = image.len(), "enroll_identity requested");
        let payload = self.payload(mime, filename, image)?;
        let outcome = self.call(self.engine.enroll(id, payload)).await?;
        to_json(&outcome)
    }

    /// Identify the person in an image.
    ///
    /// The query image is only held for the duration of the call; unlike
    /// enrollment images it is never written to the archive.
    async fn recognize(&self, mime: &str, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(mime, bytes = image.len(), "recognize requested");
        let payload = self.payload(mime, "query", image)?;
        let outcome = self.call(self.engine.recognize(payload)).await?;
        to_json(&outcome)
    }

    async fn get_identity(&self, id: i64) -> fdo::Result<String> {
        match self.call(self.engine.identity(id)).await? {
            Some(profile) => to_json(&profile),
            None => Err(fdo::Error::UnknownObject(format!("no identity {id}"))),
        }
    }

    /// Remove an identity with all its signatures. Returns false if absent.
    async fn delete_identity(&self, id: i64) -> fdo::Result<bool> {
        tracing::info!(id, "delete_identity requested");
        self.call(self.engine.delete_identity(id)).await
    }

    async fn list_identities(&self) -> fdo::Result<String> {
        let identities = self.call(self.engine.identities()).await?;
        to_json(&identities)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let status = self.call(self.engine.status()).await?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": status.identities,
            "signatures": status.signatures,
            "signature_dim": status.signature_dim,
            "match_threshold": status.match_threshold,
            "allowed_types": self.allowed_types.iter().map(|k| k.mime()).collect::<Vec<_>>(),
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine;
    use crate::testing::{pipeline, png, RED};
    use likeness_core::DEFAULT_MATCH_THRESHOLD;

    fn service(allowed: Vec<ImageKind>) -> (LikenessService, tempfile::TempDir) {
        let (p, tmp) = pipeline(DEFAULT_MATCH_THRESHOLD);
        let engine = engine::spawn(p).unwrap();
        (LikenessService::new(engine, allowed, Duration::from_secs(5)), tmp)
    }

    #[tokio::test]
    async fn test_disallowed_mime_is_invalid_args() {
        let (svc, _tmp) = service(vec![ImageKind::Png]);
        let err = svc.payload("image/jpeg", "a.jpg", vec![1]).unwrap_err();
        assert!(matches!(err, fdo::Error::InvalidArgs(_)));
        let err = svc.payload("image/gif", "a.gif", vec![1]).unwrap_err();
        assert!(matches!(err, fdo::Error::InvalidArgs(_)));
        assert!(svc.payload("image/png", "a.png", vec![1]).is_ok());
    }

    #[tokio::test]
    async fn test_timed_out_enrollment_leaves_no_record() {
        let (p, _tmp) = pipeline(DEFAULT_MATCH_THRESHOLD);
        let engine = engine::spawn(p).unwrap();
        let hasty = LikenessService::new(engine.clone(), vec![ImageKind::Png], Duration::ZERO);
        let patient = LikenessService::new(engine, vec![ImageKind::Png], Duration::from_secs(5));

        let err = hasty
            .enroll("Ana", "image/png", "ana.png", png(RED))
            .await
            .unwrap_err();
        assert!(matches!(err, fdo::Error::TimedOut(_)));

        // The engine is sequential, so this runs after the abandoned enrollment.
        let status: serde_json::Value =
            serde_json::from_str(&patient.status().await.unwrap()).unwrap();
        assert_eq!(status["identities"], 0);
        assert_eq!(status["signatures"], 0);
    }

    #[tokio::test]
    async fn test_empty_image_is_a_decode_rejection() {
        let (svc, _tmp) = service(vec![ImageKind::Png]);
        let reply = svc.recognize("image/png", Vec::new()).await.unwrap();
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["outcome"], "rejected");
        assert_eq!(reply["reason"], "decode");

        let reply = svc.enroll("Ana", "image/png", "ana.png", Vec::new()).await.unwrap();
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["reason"], "decode");
    }

    #[tokio::test]
    async fn test_outcomes_as_json() {
        let (svc, _tmp) = service(vec![ImageKind::Png]);
        let reply = svc.enroll("Ana", "image/png", "ana.png", png(RED)).await.unwrap();
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["outcome"], "persisted");
        assert_eq!(reply["identity"]["name"], "Ana");
        let id = reply["identity"]["id"].as_i64().unwrap();

        let reply = svc.recognize("image/png", png(RED)).await.unwrap();
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["outcome"], "matched");
        assert_eq!(reply["identity"]["id"], id);

        let reply = svc.recognize("image/png", png([0, 0, 0])).await.unwrap();
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["outcome"], "rejected");
        assert_eq!(reply["reason"], "no_face_found");

        assert!(svc.delete_identity(id).await.unwrap());
        assert!(matches!(
            svc.get_identity(id).await.unwrap_err(),
            fdo::Error::UnknownObject(_)
        ));
    }
}
