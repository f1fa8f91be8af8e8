//! Hacienda reception API client and response types.
use std::sync::Arc;

use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use reqwest::{header::HeaderMap, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    clock::{costa_rica_time, Clock, SystemClock},
    config::Config,
    document::Clave,
    xml::Document,
    ErrorKind,
};

/// Longest upstream body quoted in an error message.
const MAX_ERROR_BODY: usize = 500;
/// Remaining-quota level below which the rate limit header is logged.
const LOW_RATE_LIMIT_REMAINING: u32 = 5;

/// Errors returned by the Hacienda API client. None of them are retried by the client.
#[derive(Error, Debug)]
pub enum HaciendaError {
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Hacienda returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Invalid response from Hacienda: {0}")]
    InvalidResponse(String),
    #[error("Client state error: {0}")]
    ClientState(String),
}

impl From<reqwest::Error> for HaciendaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HaciendaError::Timeout(err.to_string())
        } else if err.is_connect() {
            HaciendaError::ConnectionRefused(err.to_string())
        } else {
            HaciendaError::Network(err.to_string())
        }
    }
}

impl HaciendaError {
    /// Transport failures, throttling and server-side errors may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            HaciendaError::Timeout(_)
            | HaciendaError::ConnectionRefused(_)
            | HaciendaError::Network(_) => true,
            HaciendaError::Http { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            HaciendaError::InvalidResponse(_) | HaciendaError::ClientState(_) => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HaciendaError::ClientState(_) => ErrorKind::Caller,
            HaciendaError::InvalidResponse(_) => ErrorKind::ApiRejection,
            err if err.is_retryable() => ErrorKind::Transport,
            _ => ErrorKind::ApiRejection,
        }
    }
}

/// Identification type codes used by the reception API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentificationType {
    /// Cédula física, 9 digits.
    Individual,
    /// Cédula jurídica, 10 digits starting with 3.
    LegalEntity,
    /// DIMEX, 11 or 12 digits.
    ForeignResident,
    /// NITE, other 10-digit numbers.
    TaxExempt,
    /// Anything else, treated as a non-domiciled foreigner.
    Foreign,
}

impl IdentificationType {
    /// Infer the type from the number alone. Dashes and spaces are ignored.
    pub fn infer(id_number: &str) -> Self {
        let digits = normalize_id(id_number);
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return IdentificationType::Foreign;
        }
        match digits.len() {
            9 => IdentificationType::Individual,
            10 if digits.starts_with('3') => IdentificationType::LegalEntity,
            10 => IdentificationType::TaxExempt,
            11 | 12 => IdentificationType::ForeignResident,
            _ => IdentificationType::Foreign,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            IdentificationType::Individual => "01",
            IdentificationType::LegalEntity => "02",
            IdentificationType::ForeignResident => "03",
            IdentificationType::TaxExempt => "04",
            IdentificationType::Foreign => "05",
        }
    }
}

fn normalize_id(id_number: &str) -> String {
    id_number
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect()
}

/// Issuer or receiver identification as posted to the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identification {
    #[serde(rename = "tipoIdentificacion")]
    id_type: String,
    #[serde(rename = "numeroIdentificacion")]
    number: String,
}

impl Identification {
    pub fn infer(id_number: &str) -> Self {
        Self {
            id_type: IdentificationType::infer(id_number).code().to_string(),
            number: normalize_id(id_number),
        }
    }

    pub fn id_type(&self) -> &str {
        &self.id_type
    }

    pub fn number(&self) -> &str {
        &self.number
    }
}

/// A signed document ready to post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub clave: String,
    pub signed_xml: String,
    pub issuer_id: String,
    pub receiver_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReceptionRequest<'a> {
    clave: &'a str,
    fecha: String,
    emisor: Identification,
    #[serde(skip_serializing_if = "Option::is_none")]
    receptor: Option<Identification>,
    #[serde(rename = "comprobanteXml")]
    comprobante_xml: String,
}

#[derive(Debug, Deserialize)]
struct ReceptionBody {
    clave: Option<String>,
    fecha: Option<String>,
    #[serde(rename = "ind-estado")]
    ind_estado: Option<String>,
    #[serde(rename = "respuesta-xml")]
    respuesta_xml: Option<String>,
}

/// Processing status reported by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthorityStatus {
    Accepted,
    Rejected,
    Received,
    Processing,
    Unknown(String),
}

impl AuthorityStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "aceptado" => AuthorityStatus::Accepted,
            "rechazado" => AuthorityStatus::Rejected,
            "recibido" => AuthorityStatus::Received,
            "procesando" => AuthorityStatus::Processing,
            _ => AuthorityStatus::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AuthorityStatus::Accepted => "aceptado",
            AuthorityStatus::Rejected => "rechazado",
            AuthorityStatus::Received => "recibido",
            AuthorityStatus::Processing => "procesando",
            AuthorityStatus::Unknown(raw) => raw,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthorityStatus::Accepted | AuthorityStatus::Rejected)
    }
}

/// Parsed reception or status response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityResponse {
    clave: Option<String>,
    status: AuthorityStatus,
    date: Option<String>,
    http_status: u16,
    response_xml: Option<String>,
    decoded_message: Option<String>,
    message_code: Option<String>,
    message_detail: Option<String>,
}

impl AuthorityResponse {
    /// A bare response, as produced by a 202 with an empty body.
    pub fn new(status: AuthorityStatus, http_status: u16) -> Self {
        Self {
            clave: None,
            status,
            date: None,
            http_status,
            response_xml: None,
            decoded_message: None,
            message_code: None,
            message_detail: None,
        }
    }

    pub fn with_message(mut self, code: Option<&str>, detail: Option<&str>) -> Self {
        self.message_code = code.map(str::to_string);
        self.message_detail = detail.map(str::to_string);
        self
    }

    pub fn clave(&self) -> Option<&str> {
        self.clave.as_deref()
    }

    pub fn status(&self) -> &AuthorityStatus {
        &self.status
    }

    pub fn date(&self) -> Option<&str> {
        self.date.as_deref()
    }

    pub fn http_status(&self) -> u16 {
        self.http_status
    }

    /// The `respuesta-xml` payload as received (base64).
    pub fn response_xml(&self) -> Option<&str> {
        self.response_xml.as_deref()
    }

    /// The decoded `MensajeHacienda` document.
    pub fn decoded_message(&self) -> Option<&str> {
        self.decoded_message.as_deref()
    }

    /// `Mensaje` code from the decoded document (1 accepted, 2 partially, 3 rejected).
    pub fn message_code(&self) -> Option<&str> {
        self.message_code.as_deref()
    }

    /// `DetalleMensaje` from the decoded document.
    pub fn message_detail(&self) -> Option<&str> {
        self.message_detail.as_deref()
    }

    fn from_body(body: ReceptionBody, http_status: u16) -> Self {
        let status = body
            .ind_estado
            .as_deref()
            .map(AuthorityStatus::parse)
            .unwrap_or_else(|| AuthorityStatus::Unknown(String::new()));
        let decoded_message = body.respuesta_xml.as_deref().and_then(decode_response_xml);
        let (message_code, message_detail) = decoded_message
            .as_deref()
            .map(message_fields)
            .unwrap_or_default();
        Self {
            clave: body.clave,
            status,
            date: body.fecha,
            http_status,
            response_xml: body.respuesta_xml,
            decoded_message,
            message_code,
            message_detail,
        }
    }
}

fn decode_response_xml(encoded: &str) -> Option<String> {
    let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    match Base64::decode_vec(&cleaned) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            warn!(error = %e, "respuesta-xml is not valid base64");
            None
        }
    }
}

fn message_fields(xml: &str) -> (Option<String>, Option<String>) {
    let Ok(document) = Document::parse(xml) else {
        return (None, None);
    };
    let field = |name: &str| {
        document
            .root
            .child(name)
            .map(|el| el.text().trim().to_string())
            .filter(|text| !text.is_empty())
    };
    (field("Mensaje"), field("DetalleMensaje"))
}

/// The reception API operations the lifecycle depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubmissionClient: Send + Sync {
    /// Post a signed document for reception.
    async fn submit(&self, submission: &Submission) -> Result<AuthorityResponse, HaciendaError>;

    /// Query the processing status of a previously posted document.
    async fn check_status(&self, clave: &str) -> Result<AuthorityResponse, HaciendaError>;

    /// Whether the reception endpoint is reachable at all.
    async fn test_connection(&self) -> bool;
}

/// Hacienda reception API client.
///
/// # Examples
/// ```rust,no_run
/// use factura_core::api::HaciendaClient;
/// use factura_core::config::{Config, Credentials, EnvironmentType};
///
/// let client = HaciendaClient::new(Config::new(
///     EnvironmentType::Sandbox,
///     Credentials::new("cpf-01-0101-0101@stag.comprobanteselectronicos.go.cr", "secret"),
/// ))?;
/// # let _ = client;
/// # Ok::<(), factura_core::api::HaciendaError>(())
/// ```
pub struct HaciendaClient {
    config: Config,
    client: Client,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for HaciendaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaciendaClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// Public API
impl HaciendaClient {
    /// Create a new API client using the provided configuration.
    ///
    /// # Errors
    /// Returns [`HaciendaError::ClientState`] if the HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self, HaciendaError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self, HaciendaError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| HaciendaError::ClientState(format!("HTTP client: {e}")))?;
        Ok(Self {
            config,
            client,
            clock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[async_trait]
impl SubmissionClient for HaciendaClient {
    async fn submit(&self, submission: &Submission) -> Result<AuthorityResponse, HaciendaError> {
        ensure_clave(&submission.clave)?;
        let receptor = submission
            .receiver_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(Identification::infer);
        let payload = ReceptionRequest {
            clave: &submission.clave,
            fecha: self.local_timestamp(),
            emisor: Identification::infer(&submission.issuer_id),
            receptor,
            comprobante_xml: Base64::encode_string(submission.signed_xml.as_bytes()),
        };

        let url = self.build_endpoint("recepcion");
        debug!(clave = %submission.clave, url = %url, "submitting document");
        let response = self
            .client
            .post(url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .basic_auth(
                self.config.credentials().username(),
                Some(self.config.credentials().password()),
            )
            .json(&payload)
            .send()
            .await?;
        parse_response(response).await
    }

    async fn check_status(&self, clave: &str) -> Result<AuthorityResponse, HaciendaError> {
        ensure_clave(clave)?;
        let url = self.build_endpoint(&format!("recepcion/{clave}"));
        debug!(clave = %clave, "checking document status");
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .basic_auth(
                self.config.credentials().username(),
                Some(self.config.credentials().password()),
            )
            .send()
            .await?;
        parse_response(response).await
    }

    async fn test_connection(&self) -> bool {
        let url = self.build_endpoint("recepcion/test");
        let result = self
            .client
            .get(url)
            .basic_auth(
                self.config.credentials().username(),
                Some(self.config.credentials().password()),
            )
            .send()
            .await;
        match result {
            // Any answer from the service proves the link is up.
            Ok(response) => matches!(response.status().as_u16(), 200 | 400 | 404),
            Err(e) => {
                debug!(error = %e, "connection test failed");
                false
            }
        }
    }
}

// Private API
impl HaciendaClient {
    fn build_endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url(), path.trim_start_matches('/'))
    }

    fn local_timestamp(&self) -> String {
        costa_rica_time(self.clock.now())
            .format("%Y-%m-%dT%H:%M:%S%:z")
            .to_string()
    }
}

/// The clave becomes part of the request path, so only well-formed ones leave the process.
fn ensure_clave(clave: &str) -> Result<(), HaciendaError> {
    Clave::parse(clave)
        .map(|_| ())
        .map_err(|e| HaciendaError::ClientState(format!("invalid clave '{clave}': {e}")))
}

async fn parse_response(response: reqwest::Response) -> Result<AuthorityResponse, HaciendaError> {
    let status = response.status();
    warn_on_low_quota(response.headers());
    let error_cause = response
        .headers()
        .get("X-Error-Cause")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();

    if !status.is_success() {
        return Err(HaciendaError::Http {
            status: status.as_u16(),
            message: extract_error_message(&body, error_cause.as_deref()),
        });
    }

    if body.trim().is_empty() {
        if status == StatusCode::ACCEPTED {
            return Ok(AuthorityResponse::new(AuthorityStatus::Received, status.as_u16()));
        }
        return Err(HaciendaError::InvalidResponse(format!(
            "status {status}: empty body"
        )));
    }

    let parsed = serde_json::from_str::<ReceptionBody>(&body)
        .map_err(|e| HaciendaError::InvalidResponse(format!("status {status}: {e}")))?;
    Ok(AuthorityResponse::from_body(parsed, status.as_u16()))
}

fn warn_on_low_quota(headers: &HeaderMap) {
    let remaining = headers
        .get("X-Ratelimit-Remaining")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u32>().ok());
    if let Some(remaining) = remaining {
        if remaining < LOW_RATE_LIMIT_REMAINING {
            warn!(remaining, "Hacienda rate limit nearly exhausted");
        }
    }
}

fn extract_error_message(body: &str, error_cause: Option<&str>) -> String {
    let mut message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| message_from_json(&json))
        .unwrap_or_else(|| truncate(body.trim(), MAX_ERROR_BODY));
    if let Some(cause) = error_cause.filter(|cause| !cause.is_empty()) {
        if message.is_empty() {
            message = cause.to_string();
        } else {
            message = format!("{message} (cause: {cause})");
        }
    }
    message
}

fn message_from_json(json: &serde_json::Value) -> Option<String> {
    const FIELDS: [&str; 6] = [
        "message",
        "error",
        "mensaje",
        "detalle-mensaje",
        "descripcion",
        "errorMessage",
    ];
    for field in FIELDS {
        if let Some(text) = json.get(field).and_then(|value| value.as_str()) {
            if !text.trim().is_empty() {
                return Some(text.trim().to_string());
            }
        }
    }
    let errors = json.get("errors")?.as_array()?;
    let joined = errors
        .iter()
        .filter_map(|error| match error {
            serde_json::Value::String(text) => Some(text.clone()),
            other => other
                .get("message")
                .and_then(|value| value.as_str())
                .map(str::to_string),
        })
        .collect::<Vec<_>>()
        .join("; ");
    (!joined.is_empty()).then_some(joined)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}
