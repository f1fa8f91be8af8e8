//! Electronic document model and lifecycle.
pub mod clave;
pub mod lifecycle;
pub mod repository;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use clave::{Clave, ClaveError, ConsecutiveNumber, SituationCode};
pub use lifecycle::{DocumentLifecycle, LifecycleError};
pub use repository::{DocumentRepository, InMemoryDocumentRepository, RepositoryError};

use crate::{
    api::{AuthorityResponse, AuthorityStatus, IdentificationType},
    clock::costa_rica_time,
    xml::{constants::DOCUMENT_NS_BASE, Document, Element},
};

/// Sales above this many colones need a full invoice instead of a ticket.
pub const TICKET_LIMIT_CENTS: u64 = 1_000_000 * 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    /// FE, factura electrónica.
    Invoice,
    /// ND, nota de débito.
    DebitNote,
    /// NC, nota de crédito.
    CreditNote,
    /// TE, tiquete electrónico.
    Ticket,
}

impl DocumentType {
    pub fn code(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "01",
            DocumentType::DebitNote => "02",
            DocumentType::CreditNote => "03",
            DocumentType::Ticket => "04",
        }
    }

    pub fn from_code(code: &str) -> Result<Self, ClaveError> {
        match code {
            "01" => Ok(DocumentType::Invoice),
            "02" => Ok(DocumentType::DebitNote),
            "03" => Ok(DocumentType::CreditNote),
            "04" => Ok(DocumentType::Ticket),
            other => Err(ClaveError::UnknownDocumentType(other.to_string())),
        }
    }

    pub fn abbreviation(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "FE",
            DocumentType::DebitNote => "ND",
            DocumentType::CreditNote => "NC",
            DocumentType::Ticket => "TE",
        }
    }

    pub fn root_element(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "FacturaElectronica",
            DocumentType::DebitNote => "NotaDebitoElectronica",
            DocumentType::CreditNote => "NotaCreditoElectronica",
            DocumentType::Ticket => "TiqueteElectronico",
        }
    }

    pub fn namespace(&self) -> String {
        let schema = match self {
            DocumentType::Invoice => "facturaElectronica",
            DocumentType::DebitNote => "notaDebitoElectronica",
            DocumentType::CreditNote => "notaCreditoElectronica",
            DocumentType::Ticket => "tiqueteElectronico",
        };
        format!("{DOCUMENT_NS_BASE}{schema}")
    }

    /// Refunds are credit notes and debit adjustments are debit notes. Sales up to
    /// one million colones inclusive are tickets, larger ones invoices.
    pub fn classify(kind: TransactionKind, total_cents: u64) -> Self {
        match kind {
            TransactionKind::Refund => DocumentType::CreditNote,
            TransactionKind::DebitAdjustment => DocumentType::DebitNote,
            TransactionKind::Sale if total_cents <= TICKET_LIMIT_CENTS => DocumentType::Ticket,
            TransactionKind::Sale => DocumentType::Invoice,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    Sale,
    Refund,
    DebitAdjustment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentState {
    Draft,
    Generated,
    Signed,
    Submitted,
    Accepted,
    Rejected,
    Error,
}

impl DocumentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentState::Draft => "draft",
            DocumentState::Generated => "generated",
            DocumentState::Signed => "signed",
            DocumentState::Submitted => "submitted",
            DocumentState::Accepted => "accepted",
            DocumentState::Rejected => "rejected",
            DocumentState::Error => "error",
        }
    }

    /// The authority has given its verdict.
    pub fn is_final(&self) -> bool {
        matches!(self, DocumentState::Accepted | DocumentState::Rejected)
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of one authority response. Never modified once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    received_at: DateTime<Utc>,
    status: AuthorityStatus,
    http_status: u16,
    response_xml: Option<String>,
    decoded_message: Option<String>,
    code: Option<String>,
    detail: Option<String>,
}

impl ResponseMessage {
    pub fn from_response(response: &AuthorityResponse, received_at: DateTime<Utc>) -> Self {
        Self {
            received_at,
            status: response.status().clone(),
            http_status: response.http_status(),
            response_xml: response.response_xml().map(str::to_string),
            decoded_message: response.decoded_message().map(str::to_string),
            code: response.message_code().map(str::to_string),
            detail: response.message_detail().map(str::to_string),
        }
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn status(&self) -> &AuthorityStatus {
        &self.status
    }

    pub fn http_status(&self) -> u16 {
        self.http_status
    }

    pub fn response_xml(&self) -> Option<&str> {
        self.response_xml.as_deref()
    }

    pub fn decoded_message(&self) -> Option<&str> {
        self.decoded_message.as_deref()
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

/// Inputs for a new draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftRequest {
    pub transaction: TransactionKind,
    pub total_cents: u64,
    pub issuer_id: String,
    pub receiver_id: Option<String>,
    pub branch: u16,
    pub terminal: u32,
    pub situation: SituationCode,
}

/// A tax document and everything the lifecycle has learned about it.
///
/// Fields change only through [`DocumentLifecycle`]; documents are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectronicDocument {
    id: u64,
    document_type: DocumentType,
    state: DocumentState,
    issuer_id: String,
    receiver_id: Option<String>,
    branch: u16,
    terminal: u32,
    situation: SituationCode,
    total_cents: u64,
    issued_at: DateTime<Utc>,
    consecutive: Option<ConsecutiveNumber>,
    clave: Option<Clave>,
    unsigned_body: Option<String>,
    signed_body: Option<String>,
    authority_status: Option<AuthorityStatus>,
    error_message: Option<String>,
    retry_count: u32,
    submitted_at: Option<DateTime<Utc>>,
    responses: Vec<ResponseMessage>,
    updated_at: DateTime<Utc>,
}

impl ElectronicDocument {
    pub(crate) fn draft(request: DraftRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            document_type: DocumentType::classify(request.transaction, request.total_cents),
            state: DocumentState::Draft,
            issuer_id: request.issuer_id,
            receiver_id: request.receiver_id.filter(|id| !id.trim().is_empty()),
            branch: request.branch,
            terminal: request.terminal,
            situation: request.situation,
            total_cents: request.total_cents,
            issued_at: now,
            consecutive: None,
            clave: None,
            unsigned_body: None,
            signed_body: None,
            authority_status: None,
            error_message: None,
            retry_count: 0,
            submitted_at: None,
            responses: Vec::new(),
            updated_at: now,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn issuer_id(&self) -> &str {
        &self.issuer_id
    }

    pub fn receiver_id(&self) -> Option<&str> {
        self.receiver_id.as_deref()
    }

    pub fn branch(&self) -> u16 {
        self.branch
    }

    pub fn terminal(&self) -> u32 {
        self.terminal
    }

    pub fn situation(&self) -> SituationCode {
        self.situation
    }

    pub fn total_cents(&self) -> u64 {
        self.total_cents
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn consecutive(&self) -> Option<&ConsecutiveNumber> {
        self.consecutive.as_ref()
    }

    pub fn clave(&self) -> Option<&Clave> {
        self.clave.as_ref()
    }

    pub fn unsigned_body(&self) -> Option<&str> {
        self.unsigned_body.as_deref()
    }

    pub fn signed_body(&self) -> Option<&str> {
        self.signed_body.as_deref()
    }

    pub fn authority_status(&self) -> Option<&AuthorityStatus> {
        self.authority_status.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn responses(&self) -> &[ResponseMessage] {
        &self.responses
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct BodyError(pub String);

/// Produces the unsigned document body. Content assembly lives outside this crate.
pub trait DocumentBodyBuilder: Send + Sync {
    fn build(
        &self,
        document: &ElectronicDocument,
        clave: &Clave,
        consecutive: &ConsecutiveNumber,
    ) -> Result<String, BodyError>;
}

/// Emits the identifying header of a document and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkeletonBodyBuilder;

impl SkeletonBodyBuilder {
    fn party(name: &str, id_number: &str) -> Element {
        let id_type = IdentificationType::infer(id_number);
        let number: String = id_number
            .chars()
            .filter(|c| *c != '-' && !c.is_whitespace())
            .collect();
        Element::new(name).with_child(
            Element::new("Identificacion")
                .with_child(Element::new("Tipo").with_text(id_type.code()))
                .with_child(Element::new("Numero").with_text(number)),
        )
    }
}

impl DocumentBodyBuilder for SkeletonBodyBuilder {
    fn build(
        &self,
        document: &ElectronicDocument,
        clave: &Clave,
        consecutive: &ConsecutiveNumber,
    ) -> Result<String, BodyError> {
        let document_type = document.document_type();
        let issued = costa_rica_time(document.issued_at()).format("%Y-%m-%dT%H:%M:%S%:z");
        let mut root = Element::new(document_type.root_element())
            .with_namespace(None, &document_type.namespace())
            .with_child(Element::new("Clave").with_text(clave.as_str()))
            .with_child(Element::new("NumeroConsecutivo").with_text(consecutive.to_string()))
            .with_child(Element::new("FechaEmision").with_text(issued.to_string()))
            .with_child(Self::party("Emisor", document.issuer_id()));
        if let Some(receiver) = document.receiver_id() {
            root = root.with_child(Self::party("Receptor", receiver));
        }
        Ok(Document::new(root).to_xml_string())
    }
}
