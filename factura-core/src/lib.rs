//! Signing and submission pipeline for Costa Rica electronic documents (Hacienda v4.4).
//!
//! Covers the certificate store, XML canonicalization, XAdES-EPES signing, the
//! Hacienda reception API client, a shared token-bucket rate limiter, the retry/offline
//! queue and the document lifecycle that ties them together.
//!
//! # Examples
//! ```rust
//! use factura_core::config::{Config, Credentials, EnvironmentType};
//!
//! let config = Config::new(EnvironmentType::Sandbox, Credentials::new("user", "secret"));
//! assert!(config.base_url().ends_with("/recepcion-sandbox/v1/"));
//! ```
pub mod api;
pub mod certificate;
pub mod clock;
pub mod config;
pub mod document;
pub mod queue;
pub mod rate_limit;
pub mod sign;
pub mod xml;

use thiserror::Error;

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Xml(#[from] xml::XmlError),
    #[error(transparent)]
    Certificate(#[from] certificate::CertificateError),
    #[error(transparent)]
    Signing(#[from] sign::SigningError),
    #[error(transparent)]
    Api(#[from] api::HaciendaError),
    #[error(transparent)]
    RateLimit(#[from] rate_limit::RateLimitError),
    #[error(transparent)]
    Queue(#[from] queue::QueueError),
    #[error(transparent)]
    Clave(#[from] document::ClaveError),
    #[error(transparent)]
    Lifecycle(#[from] document::LifecycleError),
}

/// Coarse classification used to decide between retrying and surfacing to an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Certificate,
    CertificateExpired,
    Signing,
    RateLimitTimeout,
    Transport,
    ApiRejection,
    UnknownStatus,
    Caller,
    Storage,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Configuration,
            Error::Xml(_) => ErrorKind::Signing,
            Error::Certificate(err) => err.kind(),
            Error::Signing(err) => err.kind(),
            Error::Api(err) => err.kind(),
            Error::RateLimit(err) => err.kind(),
            Error::Queue(err) => err.kind(),
            Error::Clave(_) => ErrorKind::Caller,
            Error::Lifecycle(err) => err.kind(),
        }
    }

    /// Whether the failure is transient and may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Api(err) => err.is_retryable(),
            Error::RateLimit(err) => err.is_retryable(),
            Error::Lifecycle(err) => err.is_retryable(),
            _ => false,
        }
    }
}
