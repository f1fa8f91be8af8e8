use chrono::{DateTime, TimeZone, Utc};
use factura_core::certificate::{self, CertificateBundle, CertificateSource};
use std::path::{Path, PathBuf};

pub const FIXTURE_PASSWORD: &str = "fixture-pass";
pub const SIGNER_SERIAL: &str = "1885667171979194497";

pub fn fixture_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(relative)
}

pub fn fixture_bytes(relative: &str) -> Vec<u8> {
    std::fs::read(fixture_path(relative)).expect("read fixture")
}

#[allow(dead_code)]
pub fn fixture_text(relative: &str) -> String {
    std::fs::read_to_string(fixture_path(relative)).expect("read fixture")
}

#[allow(dead_code)]
pub fn pem_source(key: &str) -> CertificateSource {
    CertificateSource::Pem {
        certificate: fixture_bytes("certs/signer.cert.pem"),
        private_key: fixture_bytes(key),
    }
}

#[allow(dead_code)]
pub fn signer_bundle() -> CertificateBundle {
    certificate::load(&pem_source("certs/signer.key.pem"), None).expect("signer bundle")
}

/// A moment inside the fixture certificate's validity window.
#[allow(dead_code)]
pub fn fixture_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, 16, 0, 0).unwrap()
}
