//! Signing certificate and private key loading, validation and caching.
//!
//! Two input encodings are accepted: a password-protected PKCS#12 archive bundling the
//! certificate with its key, or a certificate file (PEM or DER) paired with a separately
//! supplied PKCS#8 / PKCS#1 key that may itself be password-encrypted.
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{pkcs1::DecodeRsaPrivateKey, BigUint, RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use x509_cert::{
    der::{asn1::ObjectIdentifier, pem::LineEnding, Decode, DecodePem, Encode, EncodePem},
    name::Name,
    Certificate,
};

use crate::{clock::Clock, ErrorKind};

/// Remaining validity below which a certificate is reported as expiring soon.
pub const EXPIRY_WARNING_DAYS: i64 = 30;

const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Certificate source is missing: {0}")]
    Missing(String),
    #[error("Unable to read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Wrong password for certificate or private key")]
    WrongPassword,
    #[error("Password required to decrypt the private key")]
    PasswordRequired,
    #[error("Unable to parse certificate material: {0}")]
    Parse(String),
    #[error("No private key found in certificate source")]
    MissingPrivateKey,
    #[error("No certificate found in certificate source")]
    MissingCertificate,
    #[error("Private key does not match the certificate public key")]
    KeyMismatch,
    #[error("Certificate not valid before {not_before}")]
    NotYetValid { not_before: DateTime<Utc> },
    #[error("Certificate expired on {not_after}")]
    Expired { not_after: DateTime<Utc> },
}

impl CertificateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CertificateError::Expired { .. } | CertificateError::NotYetValid { .. } => {
                ErrorKind::CertificateExpired
            }
            _ => ErrorKind::Certificate,
        }
    }
}

/// Raw certificate material as supplied by the operator.
#[derive(Clone)]
pub enum CertificateSource {
    Pkcs12(Vec<u8>),
    Pem {
        certificate: Vec<u8>,
        private_key: Vec<u8>,
    },
}

impl fmt::Debug for CertificateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateSource::Pkcs12(bytes) => {
                f.debug_tuple("Pkcs12").field(&bytes.len()).finish()
            }
            CertificateSource::Pem { certificate, .. } => f
                .debug_struct("Pem")
                .field("certificate", &certificate.len())
                .field("private_key", &"<redacted>")
                .finish(),
        }
    }
}

impl CertificateSource {
    pub fn pkcs12_file(path: &Path) -> Result<Self, CertificateError> {
        Ok(CertificateSource::Pkcs12(read_file(path)?))
    }

    pub fn pem_files(certificate: &Path, private_key: &Path) -> Result<Self, CertificateError> {
        Ok(CertificateSource::Pem {
            certificate: read_file(certificate)?,
            private_key: read_file(private_key)?,
        })
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, CertificateError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(CertificateError::Missing(path.display().to_string()))
        }
        Err(source) => Err(CertificateError::Unreadable {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// A parsed X.509 signing certificate.
#[derive(Debug, Clone)]
pub struct SigningCertificate {
    der: Vec<u8>,
    certificate: Certificate,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl SigningCertificate {
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let certificate = Certificate::from_der(der)
            .map_err(|e| CertificateError::Parse(format!("certificate DER: {e}")))?;
        Self::from_certificate(certificate)
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, CertificateError> {
        let certificate = Certificate::from_pem(pem)
            .map_err(|e| CertificateError::Parse(format!("certificate PEM: {e}")))?;
        Self::from_certificate(certificate)
    }

    fn from_certificate(certificate: Certificate) -> Result<Self, CertificateError> {
        let der = certificate
            .to_der()
            .map_err(|e| CertificateError::Parse(format!("certificate encoding: {e}")))?;
        let validity = &certificate.tbs_certificate.validity;
        let not_before = to_datetime(validity.not_before.to_unix_duration())?;
        let not_after = to_datetime(validity.not_after.to_unix_duration())?;
        Ok(Self {
            der,
            certificate,
            not_before,
            not_after,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn subject(&self) -> String {
        self.certificate.tbs_certificate.subject.to_string()
    }

    pub fn issuer(&self) -> String {
        self.certificate.tbs_certificate.issuer.to_string()
    }

    /// Serial number as an unsigned decimal string.
    pub fn serial_decimal(&self) -> String {
        decimal_serial(self.certificate.tbs_certificate.serial_number.as_bytes())
    }

    /// Base64 SHA-256 of the DER encoding.
    pub fn digest_base64(&self) -> String {
        Base64::encode_string(&Sha256::digest(&self.der))
    }

    pub fn public_key(&self) -> Result<RsaPublicKey, CertificateError> {
        let spki = self
            .certificate
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| CertificateError::Parse(format!("public key encoding: {e}")))?;
        RsaPublicKey::from_public_key_der(&spki)
            .map_err(|e| CertificateError::Parse(format!("certificate key is not RSA: {e}")))
    }

    pub fn to_pem(&self) -> Result<String, CertificateError> {
        self.certificate
            .to_pem(LineEnding::LF)
            .map_err(|e| CertificateError::Parse(format!("PEM encoding: {e}")))
    }
}

fn to_datetime(since_epoch: std::time::Duration) -> Result<DateTime<Utc>, CertificateError> {
    i64::try_from(since_epoch.as_secs())
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| CertificateError::Parse("validity time out of range".into()))
}

/// Certificate plus the private key that signs with it. The key is never serialized.
#[derive(Clone)]
pub struct CertificateBundle {
    certificate: SigningCertificate,
    private_key: RsaPrivateKey,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("subject", &self.certificate.subject())
            .field("serial", &self.certificate.serial_decimal())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl CertificateBundle {
    /// Pair a certificate with its key, rejecting keys that belong to another certificate.
    pub fn new(
        certificate: SigningCertificate,
        private_key: RsaPrivateKey,
    ) -> Result<Self, CertificateError> {
        if certificate.public_key()? != private_key.to_public_key() {
            return Err(CertificateError::KeyMismatch);
        }
        Ok(Self {
            certificate,
            private_key,
        })
    }

    pub fn certificate(&self) -> &SigningCertificate {
        &self.certificate
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }
}

/// Load a certificate and private key from either supported encoding.
///
/// # Errors
/// Returns [`CertificateError`] when the source is empty, the password is wrong, or the
/// material cannot be parsed.
pub fn load(
    source: &CertificateSource,
    password: Option<&str>,
) -> Result<CertificateBundle, CertificateError> {
    let bundle = match source {
        CertificateSource::Pkcs12(bytes) => load_pkcs12(bytes, password)?,
        CertificateSource::Pem {
            certificate,
            private_key,
        } => {
            if certificate.is_empty() {
                return Err(CertificateError::Missing("certificate".into()));
            }
            if private_key.is_empty() {
                return Err(CertificateError::Missing("private key".into()));
            }
            let certificate = parse_certificate(certificate)?;
            let private_key = parse_private_key(private_key, password)?;
            CertificateBundle::new(certificate, private_key)?
        }
    };
    debug!(
        subject = %bundle.certificate.subject(),
        not_after = %bundle.certificate.not_after(),
        "loaded signing certificate"
    );
    Ok(bundle)
}

fn load_pkcs12(bytes: &[u8], password: Option<&str>) -> Result<CertificateBundle, CertificateError> {
    if bytes.is_empty() {
        return Err(CertificateError::Missing("PKCS#12 archive".into()));
    }
    let password = password.unwrap_or("");
    let pfx = p12::PFX::parse(bytes)
        .map_err(|e| CertificateError::Parse(format!("PKCS#12 archive: {e:?}")))?;
    if !pfx.verify_mac(password) {
        return Err(CertificateError::WrongPassword);
    }

    let key_der = pfx
        .key_bags(password)
        .map_err(|e| CertificateError::Parse(format!("PKCS#12 key bag: {e:?}")))?
        .into_iter()
        .next()
        .ok_or(CertificateError::MissingPrivateKey)?;
    let private_key = RsaPrivateKey::from_pkcs8_der(&key_der)
        .map_err(|e| CertificateError::Parse(format!("PKCS#12 private key: {e}")))?;

    let certificates = pfx
        .cert_x509_bags(password)
        .map_err(|e| CertificateError::Parse(format!("PKCS#12 certificate bag: {e:?}")))?;
    if certificates.is_empty() {
        return Err(CertificateError::MissingCertificate);
    }

    // Archives may carry the issuing chain; pick the certificate the key belongs to.
    let public_key = private_key.to_public_key();
    for der in &certificates {
        let certificate = SigningCertificate::from_der(der)?;
        if certificate.public_key().ok().as_ref() == Some(&public_key) {
            return CertificateBundle::new(certificate, private_key);
        }
    }
    Err(CertificateError::KeyMismatch)
}

fn parse_certificate(bytes: &[u8]) -> Result<SigningCertificate, CertificateError> {
    if looks_like_pem(bytes) {
        SigningCertificate::from_pem(bytes)
    } else {
        SigningCertificate::from_der(bytes)
    }
}

fn parse_private_key(bytes: &[u8], password: Option<&str>) -> Result<RsaPrivateKey, CertificateError> {
    if !looks_like_pem(bytes) {
        return match password {
            Some(password) => RsaPrivateKey::from_pkcs8_encrypted_der(bytes, password.as_bytes())
                .map_err(|_| CertificateError::WrongPassword),
            None => RsaPrivateKey::from_pkcs8_der(bytes)
                .map_err(|e| CertificateError::Parse(format!("private key DER: {e}"))),
        };
    }

    let pem = std::str::from_utf8(bytes)
        .map_err(|e| CertificateError::Parse(format!("private key PEM: {e}")))?;
    if pem.contains("BEGIN ENCRYPTED PRIVATE KEY") {
        let password = password.ok_or(CertificateError::PasswordRequired)?;
        return RsaPrivateKey::from_pkcs8_encrypted_pem(pem, password.as_bytes())
            .map_err(|_| CertificateError::WrongPassword);
    }
    if pem.contains("BEGIN RSA PRIVATE KEY") {
        if pem.contains("Proc-Type: 4,ENCRYPTED") {
            return Err(CertificateError::Parse(
                "legacy encrypted PKCS#1 keys are not supported, convert the key to PKCS#8".into(),
            ));
        }
        return RsaPrivateKey::from_pkcs1_pem(pem)
            .map_err(|e| CertificateError::Parse(format!("PKCS#1 private key: {e}")));
    }
    RsaPrivateKey::from_pkcs8_pem(pem)
        .map_err(|e| CertificateError::Parse(format!("PKCS#8 private key: {e}")))
}

fn looks_like_pem(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .is_some_and(|start| bytes[start..].starts_with(b"-----BEGIN"))
}

/// Outcome of checking a certificate against a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateStatus {
    Valid { days_remaining: i64 },
    NotYetValid { not_before: DateTime<Utc> },
    Expired { not_after: DateTime<Utc> },
}

impl CertificateStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, CertificateStatus::Valid { .. })
    }

    /// Soft warning: valid, but fewer than [`EXPIRY_WARNING_DAYS`] remain.
    pub fn expires_soon(&self) -> bool {
        matches!(self, CertificateStatus::Valid { days_remaining } if *days_remaining < EXPIRY_WARNING_DAYS)
    }
}

/// Check the validity window. Both bounds are inclusive.
pub fn validate(certificate: &SigningCertificate, now: DateTime<Utc>) -> CertificateStatus {
    if now < certificate.not_before() {
        return CertificateStatus::NotYetValid {
            not_before: certificate.not_before(),
        };
    }
    if now > certificate.not_after() {
        return CertificateStatus::Expired {
            not_after: certificate.not_after(),
        };
    }
    let status = CertificateStatus::Valid {
        days_remaining: (certificate.not_after() - now).num_days(),
    };
    if status.expires_soon() {
        warn!(
            subject = %certificate.subject(),
            not_after = %certificate.not_after(),
            "signing certificate expires in less than {EXPIRY_WARNING_DAYS} days"
        );
    }
    status
}

/// [`validate`], turning an invalid window into an error.
pub fn ensure_valid(
    certificate: &SigningCertificate,
    now: DateTime<Utc>,
) -> Result<i64, CertificateError> {
    match validate(certificate, now) {
        CertificateStatus::Valid { days_remaining } => Ok(days_remaining),
        CertificateStatus::NotYetValid { not_before } => {
            Err(CertificateError::NotYetValid { not_before })
        }
        CertificateStatus::Expired { not_after } => Err(CertificateError::Expired { not_after }),
    }
}

/// PEM text of the certificate, for diagnostics.
pub fn export_pem(certificate: &SigningCertificate) -> Result<String, CertificateError> {
    certificate.to_pem()
}

/// Diagnostic summary of a signing certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    pub subject_cn: Option<String>,
    pub subject_org: Option<String>,
    pub issuer_cn: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub days_until_expiry: i64,
    pub serial_number: String,
    pub is_valid: bool,
}

impl CertificateInfo {
    pub fn new(certificate: &SigningCertificate, now: DateTime<Utc>) -> Self {
        let tbs = &certificate.certificate.tbs_certificate;
        Self {
            subject_cn: name_attribute(&tbs.subject, OID_COMMON_NAME),
            subject_org: name_attribute(&tbs.subject, OID_ORGANIZATION),
            issuer_cn: name_attribute(&tbs.issuer, OID_COMMON_NAME),
            not_before: certificate.not_before(),
            not_after: certificate.not_after(),
            days_until_expiry: (certificate.not_after() - now).num_days(),
            serial_number: certificate.serial_decimal(),
            is_valid: validate(certificate, now).is_valid(),
        }
    }
}

fn name_attribute(name: &Name, oid: ObjectIdentifier) -> Option<String> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == oid)
        .and_then(|atv| {
            let rendered = atv.to_string();
            rendered
                .split_once('=')
                .map(|(_, value)| value.replace('\\', ""))
        })
}

/// Big-endian serial bytes as the decimal string Hacienda and XAdES `X509SerialNumber` expect.
fn decimal_serial(bytes: &[u8]) -> String {
    BigUint::from_bytes_be(bytes).to_string()
}

/// Supplies the bundle used for signing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn signing_bundle(&self) -> Result<Arc<CertificateBundle>, CertificateError>;

    /// Drop any cached material so the next call reloads it.
    fn invalidate(&self);
}

/// Where a [`FileCertificateStore`] finds its material.
#[derive(Debug, Clone)]
pub enum CertificatePaths {
    Pkcs12(PathBuf),
    Pem {
        certificate: PathBuf,
        private_key: PathBuf,
    },
}

/// Loads certificate material from disk once and caches it until invalidated.
pub struct FileCertificateStore {
    paths: CertificatePaths,
    password: Option<String>,
    cached: Mutex<Option<Arc<CertificateBundle>>>,
}

impl fmt::Debug for FileCertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCertificateStore")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl FileCertificateStore {
    pub fn new(paths: CertificatePaths, password: Option<String>) -> Self {
        Self {
            paths,
            password,
            cached: Mutex::new(None),
        }
    }

    fn cached(&self) -> Option<Arc<CertificateBundle>> {
        self.cached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn read(path: &Path) -> Result<Vec<u8>, CertificateError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CertificateError::Missing(path.display().to_string()))
            }
            Err(source) => Err(CertificateError::Unreadable {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[async_trait]
impl CertificateStore for FileCertificateStore {
    async fn signing_bundle(&self) -> Result<Arc<CertificateBundle>, CertificateError> {
        if let Some(bundle) = self.cached() {
            return Ok(bundle);
        }
        let source = match &self.paths {
            CertificatePaths::Pkcs12(path) => CertificateSource::Pkcs12(Self::read(path).await?),
            CertificatePaths::Pem {
                certificate,
                private_key,
            } => CertificateSource::Pem {
                certificate: Self::read(certificate).await?,
                private_key: Self::read(private_key).await?,
            },
        };
        let bundle = Arc::new(load(&source, self.password.as_deref())?);
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = Some(bundle.clone());
        Ok(bundle)
    }

    fn invalidate(&self) {
        debug!("invalidating cached signing certificate");
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// A store over an already loaded bundle.
#[derive(Debug, Clone)]
pub struct StaticCertificateStore {
    bundle: Arc<CertificateBundle>,
}

impl StaticCertificateStore {
    pub fn new(bundle: CertificateBundle) -> Self {
        Self {
            bundle: Arc::new(bundle),
        }
    }
}

#[async_trait]
impl CertificateStore for StaticCertificateStore {
    async fn signing_bundle(&self) -> Result<Arc<CertificateBundle>, CertificateError> {
        Ok(self.bundle.clone())
    }

    fn invalidate(&self) {}
}

/// Validity check against a clock, used by callers holding a [`Clock`] handle.
pub fn ensure_valid_now(
    certificate: &SigningCertificate,
    clock: &dyn Clock,
) -> Result<i64, CertificateError> {
    ensure_valid(certificate, clock.now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixture(name: &str) -> Vec<u8> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures/certs")
            .join(name);
        std::fs::read(path).expect("fixture")
    }

    fn pem_bundle() -> CertificateBundle {
        let source = CertificateSource::Pem {
            certificate: fixture("signer.cert.pem"),
            private_key: fixture("signer.key.pem"),
        };
        load(&source, None).expect("load pem")
    }

    #[test]
    fn serial_renders_in_decimal() {
        assert_eq!(decimal_serial(&[]), "0");
        assert_eq!(decimal_serial(&[0x01, 0x00]), "256");
        assert_eq!(
            decimal_serial(&[0x1A, 0x2B, 0x3C, 0x4D, 0x5E, 0x6F, 0x70, 0x81]),
            "1885667171979194497"
        );
    }

    #[test]
    fn validity_bounds_are_inclusive() {
        let bundle = pem_bundle();
        let cert = bundle.certificate();
        assert!(validate(cert, cert.not_before()).is_valid());
        assert!(validate(cert, cert.not_after()).is_valid());
        assert!(matches!(
            validate(cert, cert.not_before() - chrono::Duration::seconds(1)),
            CertificateStatus::NotYetValid { .. }
        ));
        assert!(matches!(
            validate(cert, cert.not_after() + chrono::Duration::seconds(1)),
            CertificateStatus::Expired { .. }
        ));
    }

    #[test]
    fn expiring_soon_is_a_soft_warning() {
        let bundle = pem_bundle();
        let cert = bundle.certificate();
        let status = validate(cert, cert.not_after() - chrono::Duration::days(10));
        assert!(status.is_valid());
        assert!(status.expires_soon());
        let status = validate(cert, Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
        assert!(!status.expires_soon());
    }

    #[test]
    fn ensure_valid_maps_window_to_errors() {
        let bundle = pem_bundle();
        let cert = bundle.certificate();
        let err = ensure_valid(cert, Utc.with_ymd_and_hms(2050, 1, 1, 0, 0, 0).unwrap())
            .expect_err("expired");
        assert!(matches!(err, CertificateError::Expired { .. }));
        assert_eq!(err.kind(), ErrorKind::CertificateExpired);
    }

    #[test]
    fn empty_sources_are_missing() {
        let err = load(&CertificateSource::Pkcs12(Vec::new()), Some("x")).expect_err("missing");
        assert!(matches!(err, CertificateError::Missing(_)));
        let err = load(
            &CertificateSource::Pem {
                certificate: fixture("signer.cert.pem"),
                private_key: Vec::new(),
            },
            None,
        )
        .expect_err("missing key");
        assert!(matches!(err, CertificateError::Missing(_)));
    }

    #[test]
    fn bundle_debug_hides_key() {
        let debug = format!("{:?}", pem_bundle());
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("PRIVATE"));
    }

    #[tokio::test]
    async fn mocked_store_returns_bundle() {
        let bundle = Arc::new(pem_bundle());
        let mut store = MockCertificateStore::new();
        let expected = bundle.clone();
        store
            .expect_signing_bundle()
            .times(1)
            .returning(move || Ok(expected.clone()));
        let loaded = store.signing_bundle().await.expect("bundle");
        assert_eq!(loaded.certificate().der(), bundle.certificate().der());
    }
}
