//! The document state machine.
//!
//! `draft → generated → signed → submitted → accepted | rejected | error`
//!
//! Retryable failures while signing or submitting move the document to `error` and queue
//! it for the sweep. The lifecycle is the queue's [`SyncHandler`]: queued work resumes
//! from the document's current state rather than starting over.
use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{
    BodyError, Clave, ClaveError, ConsecutiveNumber, DocumentBodyBuilder, DocumentRepository,
    DocumentState, DraftRequest, ElectronicDocument, RepositoryError, ResponseMessage,
};
use crate::{
    api::{AuthorityResponse, AuthorityStatus, HaciendaError, Submission, SubmissionClient},
    certificate::{self, CertificateError, CertificateStore},
    clock::{costa_rica_time, Clock},
    queue::{Enqueue, OfflineQueue, QueueEntry, QueueError, QueueOperation, QueuePriority, SyncHandler},
    rate_limit::{RateLimitError, RateLimiter},
    sign::{DocumentSigner, SigningError},
    ErrorKind,
};

/// How long a submission waits for a rate limit token by default.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Cannot {operation} a document in state {state}")]
    InvalidState {
        operation: &'static str,
        state: DocumentState,
    },
    #[error("Document {0} has a transition in progress")]
    Busy(u64),
    #[error("Document {0} not found")]
    NotFound(u64),
    #[error("Document {id} has no {what}")]
    Missing { id: u64, what: &'static str },
    #[error("Unknown status: {0}")]
    UnknownStatus(String),
    #[error("Document body could not be built: {0}")]
    Body(#[from] BodyError),
    #[error(transparent)]
    Clave(#[from] ClaveError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Api(#[from] HaciendaError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::InvalidState { .. }
            | LifecycleError::Busy(_)
            | LifecycleError::NotFound(_)
            | LifecycleError::Missing { .. }
            | LifecycleError::Body(_)
            | LifecycleError::Clave(_) => ErrorKind::Caller,
            LifecycleError::UnknownStatus(_) => ErrorKind::UnknownStatus,
            LifecycleError::Certificate(err) => err.kind(),
            LifecycleError::Signing(err) => err.kind(),
            LifecycleError::Api(err) => err.kind(),
            LifecycleError::RateLimit(err) => err.kind(),
            LifecycleError::Queue(err) => err.kind(),
            LifecycleError::Repository(_) => ErrorKind::Storage,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            LifecycleError::Api(err) => err.is_retryable(),
            LifecycleError::RateLimit(err) => err.is_retryable(),
            LifecycleError::UnknownStatus(_) => true,
            _ => false,
        }
    }
}

/// Marks a document as owned by one transition until dropped.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<u64>>,
    id: u64,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

pub struct DocumentLifecycle {
    repository: Arc<dyn DocumentRepository>,
    body_builder: Arc<dyn DocumentBodyBuilder>,
    certificates: Arc<dyn CertificateStore>,
    client: Arc<dyn SubmissionClient>,
    limiter: Arc<RateLimiter>,
    queue: Arc<OfflineQueue>,
    clock: Arc<dyn Clock>,
    acquire_timeout: Duration,
    in_flight: Mutex<HashSet<u64>>,
}

impl fmt::Debug for DocumentLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentLifecycle")
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

// Public API
impl DocumentLifecycle {
    pub fn new(
        repository: Arc<dyn DocumentRepository>,
        body_builder: Arc<dyn DocumentBodyBuilder>,
        certificates: Arc<dyn CertificateStore>,
        client: Arc<dyn SubmissionClient>,
        limiter: Arc<RateLimiter>,
        queue: Arc<OfflineQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            body_builder,
            certificates,
            client,
            limiter,
            queue,
            clock,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Record a finalized transaction as a draft.
    pub async fn create(&self, request: DraftRequest) -> Result<ElectronicDocument, LifecycleError> {
        let document = self
            .repository
            .insert(ElectronicDocument::draft(request, self.clock.now()))
            .await?;
        info!(
            document = document.id(),
            doc_type = document.document_type().abbreviation(),
            "document drafted"
        );
        Ok(document)
    }

    pub async fn get(&self, id: u64) -> Result<ElectronicDocument, LifecycleError> {
        self.load(id).await
    }

    /// `draft → generated`: assign the consecutive number and clave, build the body.
    pub async fn generate(&self, id: u64) -> Result<ElectronicDocument, LifecycleError> {
        let _claim = self.claim(id)?;
        let mut document = self.load(id).await?;
        require(&document, "generate", DocumentState::Draft)?;

        let consecutive = ConsecutiveNumber::new(
            document.branch,
            document.terminal,
            document.document_type,
            document.id,
        )?;
        let date = costa_rica_time(document.issued_at).date_naive();
        let clave =
            Clave::generate_random(date, &document.issuer_id, &consecutive, document.situation)?;
        let body = self.body_builder.build(&document, &clave, &consecutive)?;

        document.consecutive = Some(consecutive);
        document.clave = Some(clave);
        document.unsigned_body = Some(body);
        self.transition(&mut document, DocumentState::Generated);
        self.save(&mut document).await?;
        Ok(document)
    }

    /// `generated → signed`.
    pub async fn sign(&self, id: u64) -> Result<ElectronicDocument, LifecycleError> {
        let _claim = self.claim(id)?;
        let mut document = self.load(id).await?;
        require(&document, "sign", DocumentState::Generated)?;
        self.sign_loaded(&mut document, false).await?;
        Ok(document)
    }

    /// `signed → submitted | accepted | rejected`.
    ///
    /// Only a `signed` document may be submitted; anything else is a caller error and
    /// leaves the document untouched.
    pub async fn submit(&self, id: u64) -> Result<ElectronicDocument, LifecycleError> {
        let _claim = self.claim(id)?;
        let mut document = self.load(id).await?;
        require(&document, "submit", DocumentState::Signed)?;
        self.submit_loaded(&mut document, false).await?;
        Ok(document)
    }

    /// Re-poll a `submitted` document.
    pub async fn check_status(&self, id: u64) -> Result<ElectronicDocument, LifecycleError> {
        let _claim = self.claim(id)?;
        let mut document = self.load(id).await?;
        require(&document, "check the status of", DocumentState::Submitted)?;
        self.check_loaded(&mut document, false).await?;
        Ok(document)
    }

    /// Draft, generate, sign and submit in one call.
    pub async fn issue(&self, request: DraftRequest) -> Result<ElectronicDocument, LifecycleError> {
        let id = self.create(request).await?.id();
        self.generate(id).await?;
        self.sign(id).await?;
        self.submit(id).await
    }

    /// Queue an `error` document for another try, e.g. after a certificate was replaced.
    pub async fn requeue(
        &self,
        id: u64,
        priority: QueuePriority,
    ) -> Result<QueueEntry, LifecycleError> {
        let document = self.load(id).await?;
        require(&document, "requeue", DocumentState::Error)?;
        let operation = if document.signed_body.is_none() {
            QueueOperation::Sign
        } else if awaits_verdict(&document) {
            QueueOperation::CheckStatus
        } else {
            QueueOperation::Submit
        };
        Ok(self
            .queue
            .enqueue(Enqueue {
                document_id: id,
                operation,
                priority,
                signed_body: document.signed_body.clone(),
                error: document.error_message.clone(),
            })
            .await?)
    }
}

// Private API
impl DocumentLifecycle {
    fn claim(&self, id: u64) -> Result<Claim<'_>, LifecycleError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(id) {
            return Err(LifecycleError::Busy(id));
        }
        Ok(Claim {
            in_flight: &self.in_flight,
            id,
        })
    }

    async fn load(&self, id: u64) -> Result<ElectronicDocument, LifecycleError> {
        self.repository
            .get(id)
            .await?
            .ok_or(LifecycleError::NotFound(id))
    }

    async fn save(&self, document: &mut ElectronicDocument) -> Result<(), LifecycleError> {
        document.updated_at = self.clock.now();
        self.repository.update(document).await?;
        Ok(())
    }

    fn transition(&self, document: &mut ElectronicDocument, to: DocumentState) {
        if document.state != to {
            info!(
                document = document.id,
                from = %document.state,
                to = %to,
                "document transition"
            );
        }
        document.state = to;
    }

    async fn sign_loaded(
        &self,
        document: &mut ElectronicDocument,
        from_queue: bool,
    ) -> Result<(), LifecycleError> {
        let unsigned = document.unsigned_body.clone().ok_or(LifecycleError::Missing {
            id: document.id,
            what: "unsigned body",
        })?;
        match self.produce_signature(&unsigned).await {
            Ok(signed) => {
                document.signed_body = Some(signed);
                document.error_message = None;
                self.transition(document, DocumentState::Signed);
                self.save(document).await
            }
            Err(err) => {
                self.record_failure(document, &err, QueueOperation::Sign, from_queue)
                    .await;
                Err(err)
            }
        }
    }

    async fn produce_signature(&self, unsigned: &str) -> Result<String, LifecycleError> {
        let bundle = self.certificates.signing_bundle().await?;
        certificate::ensure_valid_now(bundle.certificate(), self.clock.as_ref())?;
        let signed = DocumentSigner::new(bundle).sign_xml(unsigned, self.clock.now())?;
        Ok(signed.into_xml())
    }

    async fn submit_loaded(
        &self,
        document: &mut ElectronicDocument,
        from_queue: bool,
    ) -> Result<(), LifecycleError> {
        let submission = Submission {
            clave: document
                .clave
                .as_ref()
                .map(Clave::to_string)
                .ok_or(LifecycleError::Missing {
                    id: document.id,
                    what: "clave",
                })?,
            signed_xml: document.signed_body.clone().ok_or(LifecycleError::Missing {
                id: document.id,
                what: "signed body",
            })?,
            issuer_id: document.issuer_id.clone(),
            receiver_id: document.receiver_id.clone(),
        };
        match self.call_submit(&submission).await {
            Ok(response) => {
                document.submitted_at = Some(self.clock.now());
                self.apply_response(document, &response, from_queue).await
            }
            Err(err) => {
                self.record_failure(document, &err, QueueOperation::Submit, from_queue)
                    .await;
                Err(err)
            }
        }
    }

    async fn call_submit(&self, submission: &Submission) -> Result<AuthorityResponse, LifecycleError> {
        self.limiter.acquire(self.acquire_timeout).await?;
        Ok(self.client.submit(submission).await?)
    }

    async fn check_loaded(
        &self,
        document: &mut ElectronicDocument,
        from_queue: bool,
    ) -> Result<(), LifecycleError> {
        let clave = document.clave.clone().ok_or(LifecycleError::Missing {
            id: document.id,
            what: "clave",
        })?;
        self.limiter.acquire(self.acquire_timeout).await?;
        match self.client.check_status(clave.as_str()).await {
            Ok(response) => self.apply_response(document, &response, from_queue).await,
            Err(err) => {
                warn!(document = document.id, error = %err, "status check failed");
                Err(err.into())
            }
        }
    }

    async fn apply_response(
        &self,
        document: &mut ElectronicDocument,
        response: &AuthorityResponse,
        from_queue: bool,
    ) -> Result<(), LifecycleError> {
        document
            .responses
            .push(ResponseMessage::from_response(response, self.clock.now()));
        document.authority_status = Some(response.status().clone());
        match response.status() {
            AuthorityStatus::Accepted => {
                document.error_message = None;
                self.transition(document, DocumentState::Accepted);
            }
            AuthorityStatus::Rejected => {
                document.error_message = Some(
                    response
                        .message_detail()
                        .unwrap_or("Rejected by Hacienda")
                        .to_string(),
                );
                self.transition(document, DocumentState::Rejected);
            }
            AuthorityStatus::Received | AuthorityStatus::Processing => {
                document.error_message = None;
                self.transition(document, DocumentState::Submitted);
            }
            AuthorityStatus::Unknown(raw) => {
                let err = LifecycleError::UnknownStatus(raw.clone());
                self.record_failure(document, &err, QueueOperation::CheckStatus, from_queue)
                    .await;
                return Err(err);
            }
        }
        self.save(document).await
    }

    /// Persist the failure on the document and queue retryable ones.
    async fn record_failure(
        &self,
        document: &mut ElectronicDocument,
        err: &LifecycleError,
        operation: QueueOperation,
        from_queue: bool,
    ) {
        document.error_message = Some(err.to_string());
        document.retry_count += 1;
        self.transition(document, DocumentState::Error);
        if let Err(save_err) = self.save(document).await {
            error!(document = document.id, error = %save_err, "failed to persist document error");
        }
        if !err.is_retryable() {
            warn!(document = document.id, kind = ?err.kind(), error = %err, "document needs operator attention");
            return;
        }
        if from_queue {
            return;
        }
        let enqueued = self
            .queue
            .enqueue(Enqueue {
                document_id: document.id,
                operation,
                priority: QueuePriority::Normal,
                signed_body: document.signed_body.clone(),
                error: document.error_message.clone(),
            })
            .await;
        if let Err(queue_err) = enqueued {
            error!(document = document.id, error = %queue_err, "failed to queue document for retry");
        }
    }

    /// Continue a queued document from wherever it stopped.
    async fn resume(&self, entry: &QueueEntry) -> Result<(), LifecycleError> {
        let _claim = self.claim(entry.document_id)?;
        let mut document = self.load(entry.document_id).await?;
        if document.state.is_final() {
            debug!(document = document.id, state = %document.state, "queued document already settled");
            return Ok(());
        }
        if document.signed_body.is_none() {
            document.signed_body = entry.signed_body.clone();
        }
        // Hacienda already holds the document once it answered; never post it twice.
        if entry.operation == QueueOperation::CheckStatus || awaits_verdict(&document) {
            return self.check_loaded(&mut document, true).await;
        }
        match document.state {
            DocumentState::Generated | DocumentState::Error if document.signed_body.is_none() => {
                self.sign_loaded(&mut document, true).await?;
                self.submit_loaded(&mut document, true).await
            }
            DocumentState::Signed | DocumentState::Error => {
                self.submit_loaded(&mut document, true).await
            }
            state => Err(LifecycleError::InvalidState {
                operation: "resume",
                state,
            }),
        }
    }
}

/// Hacienda answered for this document without a final verdict.
fn awaits_verdict(document: &ElectronicDocument) -> bool {
    document.state == DocumentState::Submitted
        || matches!(document.authority_status, Some(AuthorityStatus::Unknown(_)))
}

fn require(
    document: &ElectronicDocument,
    operation: &'static str,
    expected: DocumentState,
) -> Result<(), LifecycleError> {
    if document.state == expected {
        Ok(())
    } else {
        Err(LifecycleError::InvalidState {
            operation,
            state: document.state,
        })
    }
}

#[async_trait]
impl SyncHandler for DocumentLifecycle {
    async fn is_online(&self) -> bool {
        self.client.test_connection().await
    }

    async fn sync(&self, entry: &QueueEntry) -> Result<(), crate::Error> {
        Ok(self.resume(entry).await?)
    }

    async fn poll_submitted(&self, limit: usize) -> Result<usize, crate::Error> {
        let documents = self
            .repository
            .find_by_state(DocumentState::Submitted, limit)
            .await
            .map_err(LifecycleError::from)?;
        let mut polled = 0;
        for document in documents {
            match self.check_status(document.id()).await {
                Ok(_) => polled += 1,
                Err(err) => warn!(document = document.id(), error = %err, "status poll failed"),
            }
        }
        Ok(polled)
    }
}
