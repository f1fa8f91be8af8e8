mod common;

use chrono::{TimeZone, Utc};
use common::{fixture_bytes, fixture_now, fixture_path, pem_source, FIXTURE_PASSWORD, SIGNER_SERIAL};
use factura_core::certificate::{
    self, CertificateError, CertificateInfo, CertificatePaths, CertificateSource,
    CertificateStore, FileCertificateStore, SigningCertificate,
};
use factura_core::ErrorKind;

#[test]
fn pkcs12_archive_loads_with_password() {
    let source = CertificateSource::pkcs12_file(&fixture_path("certs/signer.p12")).expect("read");
    let bundle = certificate::load(&source, Some(FIXTURE_PASSWORD)).expect("load p12");
    assert_eq!(bundle.certificate().serial_decimal(), SIGNER_SERIAL);
}

#[test]
fn pkcs12_wrong_password_is_reported() {
    let source = CertificateSource::Pkcs12(fixture_bytes("certs/signer.p12"));
    let err = certificate::load(&source, Some("not-it")).expect_err("wrong password");
    assert!(matches!(err, CertificateError::WrongPassword), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Certificate);
}

#[test]
fn pem_pair_loads_in_every_key_encoding() {
    for (key, password) in [
        ("certs/signer.key.pem", None),
        ("certs/signer.key.pkcs1.pem", None),
        ("certs/signer.key.enc.pem", Some(FIXTURE_PASSWORD)),
    ] {
        let bundle = certificate::load(&pem_source(key), password)
            .unwrap_or_else(|e| panic!("{key}: {e}"));
        assert_eq!(bundle.certificate().serial_decimal(), SIGNER_SERIAL);
    }
}

#[test]
fn der_certificate_is_accepted() {
    let source = CertificateSource::Pem {
        certificate: fixture_bytes("certs/signer.cert.der"),
        private_key: fixture_bytes("certs/signer.key.pem"),
    };
    certificate::load(&source, None).expect("der certificate");
}

#[test]
fn encrypted_key_needs_the_right_password() {
    let source = pem_source("certs/signer.key.enc.pem");
    assert!(matches!(
        certificate::load(&source, None),
        Err(CertificateError::PasswordRequired)
    ));
    assert!(matches!(
        certificate::load(&source, Some("nope")),
        Err(CertificateError::WrongPassword)
    ));
}

#[test]
fn foreign_key_does_not_match() {
    let err = certificate::load(&pem_source("certs/other.key.pem"), None).expect_err("mismatch");
    assert!(matches!(err, CertificateError::KeyMismatch), "{err:?}");
}

#[test]
fn corrupted_material_is_a_parse_error() {
    let source = CertificateSource::Pem {
        certificate: b"-----BEGIN CERTIFICATE-----\nbm90IGEgY2VydA==\n-----END CERTIFICATE-----\n"
            .to_vec(),
        private_key: fixture_bytes("certs/signer.key.pem"),
    };
    let err = certificate::load(&source, None).expect_err("corrupt");
    assert!(matches!(err, CertificateError::Parse(_)), "{err:?}");

    let truncated = fixture_bytes("certs/signer.p12")[..64].to_vec();
    let err = certificate::load(&CertificateSource::Pkcs12(truncated), Some(FIXTURE_PASSWORD))
        .expect_err("truncated archive");
    assert!(matches!(err, CertificateError::Parse(_)), "{err:?}");
}

#[test]
fn missing_file_is_reported_by_path() {
    let err = CertificateSource::pkcs12_file(&fixture_path("certs/absent.p12"))
        .expect_err("missing");
    match err {
        CertificateError::Missing(path) => assert!(path.ends_with("absent.p12")),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn expired_certificate_fails_validation() {
    let source = CertificateSource::Pem {
        certificate: fixture_bytes("certs/expired.cert.pem"),
        private_key: fixture_bytes("certs/signer.key.pem"),
    };
    let bundle = certificate::load(&source, None).expect("loading ignores validity");
    let err = certificate::ensure_valid(bundle.certificate(), fixture_now()).expect_err("expired");
    assert_eq!(err.kind(), ErrorKind::CertificateExpired);
    assert!(err.to_string().starts_with("Certificate expired on 2021-01-01"));
}

#[test]
fn info_summarizes_subject_and_window() {
    let bundle = common::signer_bundle();
    let info = CertificateInfo::new(bundle.certificate(), fixture_now());
    assert_eq!(info.subject_cn.as_deref(), Some("COMERCIAL EJEMPLO S.A."));
    assert_eq!(info.subject_org.as_deref(), Some("Comercial Ejemplo S.A."));
    assert_eq!(info.not_after, Utc.with_ymd_and_hms(2044, 1, 1, 0, 0, 0).unwrap());
    assert_eq!(info.serial_number, SIGNER_SERIAL);
    assert!(info.is_valid);
    assert!(info.days_until_expiry > 6_800);

    let pem = certificate::export_pem(bundle.certificate()).expect("pem");
    assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    let reparsed = SigningCertificate::from_pem(pem.as_bytes()).expect("reparse");
    assert_eq!(reparsed.der(), bundle.certificate().der());
}

#[tokio::test]
async fn file_store_caches_until_invalidated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = dir.path().join("firma.p12");
    std::fs::copy(fixture_path("certs/signer.p12"), &archive).expect("copy");

    let store = FileCertificateStore::new(
        CertificatePaths::Pkcs12(archive.clone()),
        Some(FIXTURE_PASSWORD.to_string()),
    );
    let first = store.signing_bundle().await.expect("load");
    std::fs::remove_file(&archive).expect("remove");
    let cached = store.signing_bundle().await.expect("cached");
    assert!(std::sync::Arc::ptr_eq(&first, &cached));

    store.invalidate();
    let err = store.signing_bundle().await.expect_err("reload after removal");
    assert!(matches!(err, CertificateError::Missing(_)), "{err:?}");
}
