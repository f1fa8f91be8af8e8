use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use httpmock::{Method::GET, Method::POST, MockServer};

const FIXTURE_PASSWORD: &str = "fixture-pass";
const TICKET_CLAVE: &str = "50601012500310112345600100001040000000001100000001";

fn cli_exe() -> &'static str {
    env!("CARGO_BIN_EXE_factura")
}

fn core_fixture(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("factura-core")
        .join("tests")
        .join("fixtures")
        .join(relative)
}

fn factura() -> Command {
    let mut command = Command::new(cli_exe());
    for var in [
        "FACTURA_CONFIG",
        "FACTURA_ENV",
        "FACTURA_HACIENDA_USER",
        "FACTURA_HACIENDA_PASSWORD",
        "FACTURA_HACIENDA_BASE_URL",
        "FACTURA_CERT_PASSWORD",
    ] {
        command.env_remove(var);
    }
    command
}

fn run(command: &mut Command) -> Output {
    command.output().expect("run factura")
}

fn assert_success(output: &Output, what: &str) -> String {
    assert!(
        output.status.success(),
        "{what} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

fn sign_ticket(output: &Path) {
    let out = run(factura().args([
        "sign",
        path_str(&core_fixture("documents/tiquete.xml")),
        "--cert",
        path_str(&core_fixture("certs/signer.cert.pem")),
        "--key",
        path_str(&core_fixture("certs/signer.key.pem")),
        "--output",
        path_str(output),
    ]));
    assert_success(&out, "sign");
}

#[test]
fn clave_command_is_deterministic_with_security_code() {
    let out = run(factura().args([
        "clave",
        "--issuer",
        "3-101-123456",
        "--doc-type",
        "01",
        "--sequence",
        "1",
        "--date",
        "2025-01-01",
        "--security-code",
        "1",
    ]));
    let stdout = assert_success(&out, "clave");
    assert_eq!(
        stdout.trim(),
        "50601012500310112345600100001010000000001100000001"
    );
}

#[test]
fn clave_command_rejects_unknown_document_type() {
    let out = run(factura().args(["clave", "--issuer", "3101123456", "--doc-type", "99", "--sequence", "1"]));
    assert!(!out.status.success());
}

#[test]
fn digest_command_prints_base64_sha256() {
    let fixture = core_fixture("documents/tiquete.xml");
    let exclusive = assert_success(&run(factura().args(["digest", path_str(&fixture)])), "digest");
    let inclusive = assert_success(
        &run(factura().args(["digest", "--inclusive", path_str(&fixture)])),
        "digest --inclusive",
    );
    assert_eq!(exclusive.trim().len(), 44);
    assert_ne!(exclusive, inclusive);
}

#[test]
fn sign_then_verify_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signed = dir.path().join("tiquete.signed.xml");
    sign_ticket(&signed);
    assert!(std::fs::read_to_string(&signed)
        .expect("read signed")
        .contains("<ds:SignatureValue"));

    let stdout = assert_success(&run(factura().args(["verify", path_str(&signed)])), "verify");
    let report: serde_json::Value = serde_json::from_str(&stdout).expect("json");
    assert_eq!(report["valid"], true);
    assert_eq!(report["serial_number"], "1885667171979194497");
}

#[test]
fn verify_rejects_tampered_documents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signed = dir.path().join("signed.xml");
    sign_ticket(&signed);
    let tampered = std::fs::read_to_string(&signed)
        .expect("read signed")
        .replace("3390.00000", "1.00000");
    std::fs::write(&signed, tampered).expect("write tampered");

    let out = run(factura().args(["verify", path_str(&signed)]));
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("Digest mismatch"));
}

#[test]
fn pkcs12_password_is_read_from_environment() {
    let out = run(factura()
        .env("FACTURA_CERT_PASSWORD", FIXTURE_PASSWORD)
        .args(["cert-info", "--p12", path_str(&core_fixture("certs/signer.p12"))]));
    let stdout = assert_success(&out, "cert-info");
    let info: serde_json::Value = serde_json::from_str(&stdout).expect("json");
    assert_eq!(info["subject_cn"], "COMERCIAL EJEMPLO S.A.");
    assert_eq!(info["serial_number"], "1885667171979194497");

    let out = run(factura().args(["cert-info", "--p12", path_str(&core_fixture("certs/signer.p12"))]));
    assert!(!out.status.success(), "missing password must fail");
}

#[test]
fn cert_export_prints_pem() {
    let out = run(factura().args([
        "cert-export",
        "--cert",
        path_str(&core_fixture("certs/signer.cert.pem")),
        "--key",
        path_str(&core_fixture("certs/signer.key.pem")),
    ]));
    let stdout = assert_success(&out, "cert-export");
    assert!(stdout.starts_with("-----BEGIN CERTIFICATE-----"));
}

#[test]
fn submit_posts_signed_document() {
    let server = MockServer::start();
    let reception = server.mock(|when, then| {
        when.method(POST)
            .path("/recepcion")
            .body_contains(format!("\"clave\":\"{TICKET_CLAVE}\""))
            .body_contains("\"numeroIdentificacion\":\"3101123456\"");
        then.status(202);
    });
    let dir = tempfile::tempdir().expect("tempdir");
    let signed = dir.path().join("signed.xml");
    sign_ticket(&signed);

    let out = run(factura()
        .env("FACTURA_HACIENDA_USER", "cpj-3-101-123456")
        .env("FACTURA_HACIENDA_PASSWORD", "secret")
        .env("FACTURA_HACIENDA_BASE_URL", server.base_url())
        .args([
            "submit",
            path_str(&signed),
            "--bucket-dir",
            path_str(dir.path()),
        ]));
    let stdout = assert_success(&out, "submit");
    reception.assert();
    let response: serde_json::Value = serde_json::from_str(&stdout).expect("json");
    assert_eq!(response["status"], "recibido");
    assert!(dir.path().join("hacienda_api.bucket.json").exists());
}

#[test]
fn status_reports_authority_state() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path(format!("/recepcion/{TICKET_CLAVE}"));
        then.status(200).json_body(serde_json::json!({
            "clave": TICKET_CLAVE,
            "ind-estado": "aceptado",
        }));
    });
    let base_url = server.base_url();
    let out = run(factura().args([
        "status",
        TICKET_CLAVE,
        "--user",
        "u",
        "--password",
        "p",
        "--base-url",
        base_url.as_str(),
    ]));
    let stdout = assert_success(&out, "status");
    let response: serde_json::Value = serde_json::from_str(&stdout).expect("json");
    assert_eq!(response["status"], "aceptado");
    assert_eq!(response["clave"], TICKET_CLAVE);
}

#[test]
fn authority_commands_need_credentials() {
    let out = run(factura().args(["ping"]));
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("Hacienda user is required"));
}

#[test]
fn ping_fails_when_unreachable() {
    let out = run(factura().args([
        "ping",
        "--user",
        "u",
        "--password",
        "p",
        "--base-url",
        "http://127.0.0.1:9/",
    ]));
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("not accessible"));
}

#[test]
fn bucket_commands_inspect_and_reset() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out = run(factura().args(["bucket-inspect", "--dir", path_str(dir.path())]));
    let stdout = assert_success(&out, "bucket-inspect");
    let snapshot: serde_json::Value = serde_json::from_str(&stdout).expect("json");
    assert_eq!(snapshot["capacity"], 20.0);
    assert_eq!(snapshot["lifetime_requests"], 0);

    let out = run(factura().args([
        "bucket-reset",
        "--dir",
        path_str(dir.path()),
        "--key",
        "terminal-7",
    ]));
    let stdout = assert_success(&out, "bucket-reset");
    assert_eq!(stdout.trim(), "reset terminal-7");
    assert!(dir.path().join("terminal-7.bucket.json").exists());
}
