use crate::archive::ImageArchive;
use crate::config::Config;
use crate::workflow::{Enrollment, Pipeline, PipelineStatus, Recognition, Upload, WorkflowError};
use likeness_core::{EuclideanMatcher, IdentityId, ImageKind, OnnxExtractor, SignatureExtractor};
use likeness_store::{Identity, IdentityProfile, SignatureStore};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Workflow(#[from] WorkflowError),
    #[error("failed to load models: {0}")]
    Models(#[from] likeness_core::ExtractError),
    #[error("failed to open signature store: {0}")]
    Store(#[from] likeness_store::StoreError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Raw image as received from a caller.
#[derive(Debug)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub kind: ImageKind,
    pub filename: String,
}

impl ImagePayload {
    fn upload(&self) -> Upload<'_> {
        Upload {
            bytes: &self.bytes,
            kind: self.kind,
            filename: &self.filename,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, WorkflowError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    EnrollNew {
        name: String,
        image: ImagePayload,
        reply: Reply<Enrollment>,
    },
    Enroll {
        identity_id: IdentityId,
        image: ImagePayload,
        reply: Reply<Enrollment>,
    },
    Recognize {
        image: ImagePayload,
        reply: Reply<Recognition>,
    },
    Identity {
        identity_id: IdentityId,
        reply: Reply<Option<IdentityProfile>>,
    },
    Delete {
        identity_id: IdentityId,
        reply: Reply<bool>,
    },
    List {
        reply: Reply<Vec<Identity>>,
    },
    Status {
        reply: Reply<PipelineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Create an identity named `name` and enroll its first image.
    pub async fn enroll_new(&self, name: String, image: ImagePayload) -> Result<Enrollment, EngineError> {
        self.request(|reply| EngineRequest::EnrollNew { name, image, reply })
            .await
    }

    /// Add an image to an existing identity.
    pub async fn enroll(
        &self,
        identity_id: IdentityId,
        image: ImagePayload,
    ) -> Result<Enrollment, EngineError> {
        self.request(|reply| EngineRequest::Enroll {
            identity_id,
            image,
            reply,
        })
        .await
    }

    pub async fn recognize(&self, image: ImagePayload) -> Result<Recognition, EngineError> {
        self.request(|reply| EngineRequest::Recognize { image, reply })
            .await
    }

    pub async fn identity(&self, identity_id: IdentityId) -> Result<Option<IdentityProfile>, EngineError> {
        self.request(|reply| EngineRequest::Identity { identity_id, reply })
            .await
    }

    pub async fn delete_identity(&self, identity_id: IdentityId) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::Delete { identity_id, reply })
            .await
    }

    pub async fn identities(&self) -> Result<Vec<Identity>, EngineError> {
        self.request(|reply| EngineRequest::List { reply }).await
    }

    pub async fn status(&self) -> Result<PipelineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// Load the models, open the store and start the engine thread.
///
/// Fails fast at startup if any resource is unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let extractor = OnnxExtractor::load(&config.model_dir)?;
    tracing::info!(dir = %config.model_dir.display(), "ONNX models loaded");

    let store = SignatureStore::open(&config.db_path, config.signature_dim)?;

    let archive = ImageArchive::new(&config.storage_dir);
    tracing::info!(dir = %archive.root().display(), "image archive ready");

    let pipeline = Pipeline::new(
        extractor,
        store,
        archive,
        EuclideanMatcher::new(config.match_threshold),
        config.discard_incomplete,
    )?;
    spawn(pipeline)
}

/// Run `pipeline` on a dedicated OS thread and return a handle to it.
pub fn spawn<E>(mut pipeline: Pipeline<E>) -> Result<EngineHandle, EngineError>
where
    E: SignatureExtractor + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("likeness-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle(&mut pipeline, req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

/// Process one request.
///
/// A closed reply channel means the caller gave up (usually a timeout).
/// Such requests are skipped when not yet started, and an enrollment that
/// persisted after its caller left is reverted, so a reported failure never
/// leaves records behind.
fn handle<E: SignatureExtractor>(pipeline: &mut Pipeline<E>, req: EngineRequest) {
    match req {
        EngineRequest::EnrollNew { name, image, reply } => {
            if abandoned(&reply) {
                return;
            }
            let result = pipeline.enroll_new(&name, image.upload());
            if let Err(Ok(outcome)) = reply.send(result) {
                revert(pipeline, &outcome, true);
            }
        }
        EngineRequest::Enroll {
            identity_id,
            image,
            reply,
        } => {
            if abandoned(&reply) {
                return;
            }
            let result = pipeline.enroll(identity_id, image.upload());
            if let Err(Ok(outcome)) = reply.send(result) {
                revert(pipeline, &outcome, false);
            }
        }
        EngineRequest::Recognize { image, reply } => {
            let _ = reply.send(pipeline.recognize(&image.bytes, image.kind));
        }
        EngineRequest::Identity { identity_id, reply } => {
            let _ = reply.send(pipeline.identity(identity_id));
        }
        EngineRequest::Delete { identity_id, reply } => {
            if abandoned(&reply) {
                return;
            }
            let _ = reply.send(pipeline.delete_identity(identity_id));
        }
        EngineRequest::List { reply } => {
            let _ = reply.send(pipeline.identities());
        }
        EngineRequest::Status { reply } => {
            let _ = reply.send(pipeline.status());
        }
    }
}

fn abandoned<T>(reply: &Reply<T>) -> bool {
    let closed = reply.is_closed();
    if closed {
        tracing::info!("caller gone before the request started; skipped");
    }
    closed
}

fn revert<E: SignatureExtractor>(pipeline: &mut Pipeline<E>, outcome: &Enrollment, created_identity: bool) {
    tracing::warn!("caller gone after enrollment persisted; reverting");
    if let Err(err) = pipeline.revert_enrollment(outcome, created_identity) {
        tracing::error!(error = %err, "failed to revert abandoned enrollment");
    }
}
