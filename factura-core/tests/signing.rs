mod common;

use std::sync::Arc;

use base64ct::{Base64, Encoding};
use common::{fixture_bytes, fixture_now, fixture_text, FIXTURE_PASSWORD, SIGNER_SERIAL};
use factura_core::sign::{self, DocumentSigner, SigningError};
use factura_core::xml::Document;
use factura_core::ErrorKind;

const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
const XADES_NS: &str = "http://uri.etsi.org/01903/v1.3.2#";

fn signer() -> DocumentSigner {
    DocumentSigner::new(Arc::new(common::signer_bundle()))
}

#[test]
fn pos_ticket_signs_and_verifies() {
    let unsigned = fixture_text("documents/tiquete.xml");
    let signed = signer().sign_xml(&unsigned, fixture_now()).expect("sign");

    let certificate = sign::verify(signed.xml()).expect("verify");
    assert_eq!(certificate.serial_decimal(), SIGNER_SERIAL);
    assert_eq!(signed.signing_time(), fixture_now());
}

#[test]
fn signature_structure_follows_xades_epes() {
    let unsigned = fixture_text("documents/tiquete.xml");
    let signed = signer().sign_xml(&unsigned, fixture_now()).expect("sign");
    let document = Document::parse(signed.xml()).expect("parse");

    let signature = document
        .root
        .child_elements()
        .last()
        .expect("root has children");
    assert_eq!(signature.name, "Signature");
    assert_eq!(signature.attribute("Id"), Some(signed.signature_id()));
    assert_eq!(signature.namespaces[0].uri, DS_NS);

    let signed_info = signature.child("SignedInfo").expect("SignedInfo");
    let references: Vec<_> = signed_info
        .child_elements()
        .filter(|el| el.name == "Reference")
        .collect();
    assert_eq!(references.len(), 3);
    assert_eq!(references[0].attribute("URI"), Some(""));
    assert!(references[2]
        .attribute("Type")
        .is_some_and(|t| t.ends_with("#SignedProperties")));

    let qualifying = signature
        .child("Object")
        .and_then(|object| object.child("QualifyingProperties"))
        .expect("QualifyingProperties");
    assert!(qualifying.namespaces.iter().any(|ns| ns.uri == XADES_NS));
    let signed_properties = qualifying
        .child("SignedProperties")
        .and_then(|p| p.child("SignedSignatureProperties"))
        .expect("SignedSignatureProperties");
    assert_eq!(
        signed_properties.child("SigningTime").map(|t| t.text()),
        Some("2025-03-14T16:00:00Z".to_string())
    );
    assert!(signed_properties.child("SignaturePolicyIdentifier").is_some());
}

#[test]
fn signed_body_is_base64_for_transport() {
    let unsigned = "<FacturaElectronica><Clave>1</Clave></FacturaElectronica>";
    let signed = signer().sign_xml(unsigned, fixture_now()).expect("sign");
    assert_eq!(
        signed.document_digest(),
        sign::document_digest(unsigned, true).expect("digest")
    );
    let decoded = Base64::decode_vec(&signed.to_xml_base64()).expect("decode");
    assert_eq!(decoded, signed.xml().as_bytes());
}

#[test]
fn pkcs12_signer_matches_pem_signer_certificate() {
    let from_p12 = DocumentSigner::from_pkcs12(&fixture_bytes("certs/signer.p12"), FIXTURE_PASSWORD)
        .expect("p12 signer");
    assert_eq!(from_p12.certificate().der(), signer().certificate().der());
}

#[test]
fn editing_a_signed_ticket_breaks_verification() {
    let unsigned = fixture_text("documents/tiquete.xml");
    let signed = signer().sign_xml(&unsigned, fixture_now()).expect("sign");
    let tampered = signed
        .xml()
        .replace("<TotalComprobante", "<TotalComprobante data-edit=\"1\"");
    match sign::verify(&tampered) {
        Err(SigningError::DigestMismatch { reference }) => assert_eq!(reference, ""),
        other => panic!("expected a digest mismatch, got {other:?}"),
    }
}

#[test]
fn inclusive_and_exclusive_digests_differ_on_unused_namespaces() {
    let xml = fixture_text("documents/tiquete.xml");
    let exclusive = sign::document_digest(&xml, true).expect("exclusive");
    let inclusive = sign::document_digest(&xml, false).expect("inclusive");
    assert_eq!(exclusive.len(), 44);
    assert_eq!(inclusive.len(), 44);
    // xmlns:xsd only appears inside an attribute value, so exclusive C14N drops it.
    assert_ne!(exclusive, inclusive);
}

#[test]
fn unparseable_input_is_a_signing_failure() {
    let err = signer()
        .sign_xml("<Tiquete><Clave></Tiquete>", fixture_now())
        .expect_err("mismatched tags");
    assert_eq!(err.kind(), ErrorKind::Signing);
}
