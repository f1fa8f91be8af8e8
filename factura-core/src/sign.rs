//! XAdES-EPES enveloped signatures over electronic documents.
//!
//! The signature carries three references, all canonicalized with exclusive C14N and
//! digested with SHA-256: the whole document (enveloped-signature transform), the
//! `KeyInfo` block and the XAdES `SignedProperties` block. `SignedInfo` is signed with
//! RSA PKCS#1 v1.5 over SHA-256.
use std::sync::Arc;

use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use rsa::{
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    signature::{SignatureEncoding, Signer, Verifier},
    traits::PublicKeyParts,
    RsaPublicKey,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    certificate::{self, CertificateBundle, CertificateError, SigningCertificate},
    xml::{
        canonicalize_document, canonicalize_in_scope,
        constants::{
            C14N_EXCLUSIVE, DS_NS, ENVELOPED_SIGNATURE, POLICY_DESCRIPTION, POLICY_DIGEST,
            POLICY_IDENTIFIER, RSA_SHA256, SHA256, SIGNED_PROPERTIES_TYPE, XADES_NS,
        },
        C14nMode, Document, Element, NamespaceScope, Node, ParseOptions, XmlError,
    },
    ErrorKind,
};

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Signing error: {0}")]
    SigningError(String),
    #[error(transparent)]
    Xml(#[from] XmlError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error("Document already carries a signature")]
    AlreadySigned,
    #[error("Malformed signature: {0}")]
    Malformed(String),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Digest mismatch for reference '{reference}'")]
    DigestMismatch { reference: String },
    #[error("Signature value does not verify against the embedded certificate")]
    InvalidSignature,
}

impl SigningError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SigningError::Certificate(err) => err.kind(),
            _ => ErrorKind::Signing,
        }
    }
}

/// A signed document, ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    xml: String,
    signature_id: String,
    document_digest: String,
    signing_time: DateTime<Utc>,
}

impl SignedDocument {
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn into_xml(self) -> String {
        self.xml
    }

    pub fn signature_id(&self) -> &str {
        &self.signature_id
    }

    /// Base64 SHA-256 of the canonical unsigned document.
    pub fn document_digest(&self) -> &str {
        &self.document_digest
    }

    pub fn signing_time(&self) -> DateTime<Utc> {
        self.signing_time
    }

    pub fn to_xml_base64(&self) -> String {
        Base64::encode_string(self.xml.as_bytes())
    }
}

/// Identifiers tying the signature parts together.
#[derive(Debug, Clone)]
struct SignatureIds {
    signature: String,
    signature_value: String,
    reference: String,
    key_info: String,
    signed_properties: String,
}

impl SignatureIds {
    fn generate() -> Self {
        let uid = Uuid::new_v4().simple().to_string();
        Self {
            signature: format!("Signature-{uid}"),
            signature_value: format!("SignatureValue-{uid}"),
            reference: format!("Reference-{uid}"),
            key_info: format!("KeyInfo-{uid}"),
            signed_properties: format!("SignedProperties-{uid}"),
        }
    }
}

/// Signs documents with one certificate bundle.
///
/// # Examples
/// ```rust,no_run
/// use factura_core::sign::DocumentSigner;
///
/// let cert = std::fs::read("signer.cert.pem")?;
/// let key = std::fs::read("signer.key.pem")?;
/// let signer = DocumentSigner::from_pem(&cert, &key, None)?;
/// let signed = signer.sign_xml("<FacturaElectronica/>", chrono::Utc::now())?;
/// println!("{}", signed.xml());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct DocumentSigner {
    bundle: Arc<CertificateBundle>,
}

impl DocumentSigner {
    pub fn new(bundle: Arc<CertificateBundle>) -> Self {
        Self { bundle }
    }

    pub fn from_pem(
        certificate_pem: &[u8],
        private_key_pem: &[u8],
        password: Option<&str>,
    ) -> Result<Self, SigningError> {
        let source = certificate::CertificateSource::Pem {
            certificate: certificate_pem.to_vec(),
            private_key: private_key_pem.to_vec(),
        };
        Ok(Self::new(Arc::new(certificate::load(&source, password)?)))
    }

    pub fn from_pkcs12(archive: &[u8], password: &str) -> Result<Self, SigningError> {
        let source = certificate::CertificateSource::Pkcs12(archive.to_vec());
        Ok(Self::new(Arc::new(certificate::load(&source, Some(password))?)))
    }

    pub fn certificate(&self) -> &SigningCertificate {
        self.bundle.certificate()
    }

    /// Sign `xml` and return the document with the signature appended to its root.
    ///
    /// Whitespace-only text is stripped before signing. The input is never modified in
    /// place, so a failure leaves no partial signature behind.
    ///
    /// # Errors
    /// Returns [`SigningError`] for malformed XML, an already signed document, or a
    /// cryptographic failure.
    pub fn sign_xml(
        &self,
        xml: &str,
        signing_time: DateTime<Utc>,
    ) -> Result<SignedDocument, SigningError> {
        let mut document = Document::parse_with(
            xml,
            ParseOptions {
                strip_blank_text: true,
            },
        )?;
        if find_signature(&document.root).is_some() {
            return Err(SigningError::AlreadySigned);
        }

        let ids = SignatureIds::generate();
        let document_digest =
            digest_base64(&canonicalize_document(&document, C14nMode::Exclusive, None));

        let certificate = self.bundle.certificate();
        let public_key = self.bundle.private_key().to_public_key();
        let mut signature = Element::new("ds:Signature")
            .with_namespace(Some("ds"), DS_NS)
            .with_attribute("Id", ids.signature.clone())
            .with_child(signed_info(&ids, &document_digest))
            .with_child(
                Element::new("ds:SignatureValue").with_attribute("Id", ids.signature_value.clone()),
            )
            .with_child(key_info(&ids, certificate, &public_key))
            .with_child(
                Element::new("ds:Object")
                    .with_child(qualifying_properties(&ids, certificate, signing_time)),
            );

        // Sub-resource digests are taken where the elements will finally live.
        let root_scope = NamespaceScope::default().enter(&document.root);
        let key_info_digest = subtree_digest(&signature, &root_scope, &ids.key_info)?;
        let signed_properties_digest =
            subtree_digest(&signature, &root_scope, &ids.signed_properties)?;
        {
            let signed_info = child_mut(&mut signature, "SignedInfo")?;
            set_reference_digest(signed_info, &format!("#{}", ids.key_info), &key_info_digest)?;
            set_reference_digest(
                signed_info,
                &format!("#{}", ids.signed_properties),
                &signed_properties_digest,
            )?;
        }

        let signature_scope = root_scope.enter(&signature);
        let signed_info = signature
            .child("SignedInfo")
            .ok_or_else(|| SigningError::SigningError("SignedInfo not built".into()))?;
        let canonical_signed_info =
            canonicalize_in_scope(signed_info, &signature_scope, C14nMode::Exclusive);
        let signing_key = SigningKey::<Sha256>::new(self.bundle.private_key().clone());
        let signature_value = signing_key
            .try_sign(&canonical_signed_info)
            .map_err(|e| SigningError::SigningError(format!("RSA signing failed: {e}")))?;
        child_mut(&mut signature, "SignatureValue")?
            .set_text(Base64::encode_string(&signature_value.to_bytes()));

        document.root.children.push(Node::Element(signature));
        debug!(signature_id = %ids.signature, digest = %document_digest, "signed document");
        Ok(SignedDocument {
            xml: document.to_xml_string(),
            signature_id: ids.signature,
            document_digest,
            signing_time,
        })
    }
}

/// Base64 SHA-256 of the canonical form of a whole document.
pub fn document_digest(xml: &str, exclusive: bool) -> Result<String, SigningError> {
    let document = Document::parse(xml)?;
    let mode = if exclusive {
        C14nMode::Exclusive
    } else {
        C14nMode::Inclusive
    };
    Ok(digest_base64(&canonicalize_document(&document, mode, None)))
}

/// Verify an enveloped signature: every reference digest and the signature value.
///
/// # Errors
/// Returns [`SigningError::DigestMismatch`] naming the failing reference, or
/// [`SigningError::InvalidSignature`] when the signature value does not verify.
pub fn verify(signed_xml: &str) -> Result<SigningCertificate, SigningError> {
    let document = Document::parse(signed_xml)?;
    let signature = find_signature(&document.root)
        .ok_or_else(|| SigningError::Malformed("no ds:Signature under the root".into()))?;
    let signature_scope = NamespaceScope::along(&[&document.root, signature]);
    let signed_info = required_child(signature, "SignedInfo")?;

    let c14n_method = algorithm_of(required_child(signed_info, "CanonicalizationMethod")?)?;
    let signed_info_mode = C14nMode::from_algorithm(c14n_method)
        .ok_or_else(|| SigningError::UnsupportedAlgorithm(c14n_method.to_string()))?;
    let signature_method = algorithm_of(required_child(signed_info, "SignatureMethod")?)?;
    if signature_method != RSA_SHA256 {
        return Err(SigningError::UnsupportedAlgorithm(signature_method.to_string()));
    }

    let mut references = 0;
    for reference in signed_info.child_elements().filter(|el| el.name == "Reference") {
        references += 1;
        verify_reference(&document, signature, reference)?;
    }
    if references == 0 {
        return Err(SigningError::Malformed("SignedInfo has no references".into()));
    }

    let certificate = embedded_certificate(signature)?;
    let public_key = certificate.public_key()?;
    let signature_value = Base64::decode_vec(&strip_whitespace(
        &required_child(signature, "SignatureValue")?.text(),
    ))
    .map_err(|e| SigningError::Malformed(format!("SignatureValue: {e}")))?;
    let signature_value = Signature::try_from(signature_value.as_slice())
        .map_err(|_| SigningError::InvalidSignature)?;
    let canonical = canonicalize_in_scope(signed_info, &signature_scope, signed_info_mode);
    VerifyingKey::<Sha256>::new(public_key)
        .verify(&canonical, &signature_value)
        .map_err(|_| SigningError::InvalidSignature)?;
    Ok(certificate)
}

fn verify_reference(
    document: &Document,
    signature: &Element,
    reference: &Element,
) -> Result<(), SigningError> {
    let uri = reference
        .attribute("URI")
        .ok_or_else(|| SigningError::Malformed("Reference without URI".into()))?;
    let digest_method = algorithm_of(required_child(reference, "DigestMethod")?)?;
    if digest_method != SHA256 {
        return Err(SigningError::UnsupportedAlgorithm(digest_method.to_string()));
    }
    let expected = strip_whitespace(&required_child(reference, "DigestValue")?.text());

    let mut enveloped = false;
    let mut mode = C14nMode::Inclusive;
    if let Some(transforms) = reference.child("Transforms") {
        for transform in transforms.child_elements() {
            let algorithm = algorithm_of(transform)?;
            if algorithm == ENVELOPED_SIGNATURE {
                enveloped = true;
            } else if let Some(c14n) = C14nMode::from_algorithm(algorithm) {
                mode = c14n;
            } else {
                return Err(SigningError::UnsupportedAlgorithm(algorithm.to_string()));
            }
        }
    }

    let canonical = if uri.is_empty() {
        let exclude = if enveloped { Some(signature) } else { None };
        canonicalize_document(document, mode, exclude)
    } else {
        let id = uri.strip_prefix('#').ok_or_else(|| {
            SigningError::UnsupportedAlgorithm(format!("external reference URI '{uri}'"))
        })?;
        let located = document
            .root
            .find_by_id(&NamespaceScope::default(), id)
            .ok_or_else(|| SigningError::Malformed(format!("reference target '{uri}' not found")))?;
        canonicalize_in_scope(located.element, &located.inherited, mode)
    };

    if digest_base64(&canonical) != expected {
        return Err(SigningError::DigestMismatch {
            reference: uri.to_string(),
        });
    }
    Ok(())
}

fn embedded_certificate(signature: &Element) -> Result<SigningCertificate, SigningError> {
    let encoded = required_child(signature, "KeyInfo")
        .and_then(|key_info| required_child(key_info, "X509Data"))
        .and_then(|data| required_child(data, "X509Certificate"))?
        .text();
    let der = Base64::decode_vec(&strip_whitespace(&encoded))
        .map_err(|e| SigningError::Malformed(format!("X509Certificate: {e}")))?;
    Ok(SigningCertificate::from_der(&der)?)
}

fn find_signature(root: &Element) -> Option<&Element> {
    let root_scope = NamespaceScope::default().enter(root);
    root.child_elements().find(|child| {
        child.name == "Signature" && root_scope.enter(child).element_ns(child) == Some(DS_NS)
    })
}

fn signed_info(ids: &SignatureIds, document_digest: &str) -> Element {
    let document_reference = Element::new("ds:Reference")
        .with_attribute("Id", ids.reference.clone())
        .with_attribute("URI", "")
        .with_child(
            Element::new("ds:Transforms")
                .with_child(transform(ENVELOPED_SIGNATURE))
                .with_child(transform(C14N_EXCLUSIVE)),
        )
        .with_child(digest_method())
        .with_child(Element::new("ds:DigestValue").with_text(document_digest));

    Element::new("ds:SignedInfo")
        .with_child(Element::new("ds:CanonicalizationMethod").with_attribute("Algorithm", C14N_EXCLUSIVE))
        .with_child(Element::new("ds:SignatureMethod").with_attribute("Algorithm", RSA_SHA256))
        .with_child(document_reference)
        .with_child(pending_reference(&format!("#{}", ids.key_info), None))
        .with_child(pending_reference(
            &format!("#{}", ids.signed_properties),
            Some(SIGNED_PROPERTIES_TYPE),
        ))
}

fn pending_reference(uri: &str, reference_type: Option<&str>) -> Element {
    let mut reference = Element::new("ds:Reference");
    if let Some(reference_type) = reference_type {
        reference.set_attribute("Type", reference_type);
    }
    reference
        .with_attribute("URI", uri)
        .with_child(Element::new("ds:Transforms").with_child(transform(C14N_EXCLUSIVE)))
        .with_child(digest_method())
        .with_child(Element::new("ds:DigestValue"))
}

fn transform(algorithm: &str) -> Element {
    Element::new("ds:Transform").with_attribute("Algorithm", algorithm)
}

fn digest_method() -> Element {
    Element::new("ds:DigestMethod").with_attribute("Algorithm", SHA256)
}

fn key_info(ids: &SignatureIds, certificate: &SigningCertificate, public_key: &RsaPublicKey) -> Element {
    Element::new("ds:KeyInfo")
        .with_attribute("Id", ids.key_info.clone())
        .with_child(
            Element::new("ds:X509Data").with_child(
                Element::new("ds:X509Certificate")
                    .with_text(Base64::encode_string(certificate.der())),
            ),
        )
        .with_child(
            Element::new("ds:KeyValue").with_child(
                Element::new("ds:RSAKeyValue")
                    .with_child(
                        Element::new("ds:Modulus")
                            .with_text(Base64::encode_string(&public_key.n().to_bytes_be())),
                    )
                    .with_child(
                        Element::new("ds:Exponent")
                            .with_text(Base64::encode_string(&public_key.e().to_bytes_be())),
                    ),
            ),
        )
}

fn qualifying_properties(
    ids: &SignatureIds,
    certificate: &SigningCertificate,
    signing_time: DateTime<Utc>,
) -> Element {
    let signing_certificate = Element::new("xades:SigningCertificate").with_child(
        Element::new("xades:Cert")
            .with_child(
                Element::new("xades:CertDigest")
                    .with_child(digest_method())
                    .with_child(Element::new("ds:DigestValue").with_text(certificate.digest_base64())),
            )
            .with_child(
                Element::new("xades:IssuerSerial")
                    .with_child(Element::new("ds:X509IssuerName").with_text(certificate.issuer()))
                    .with_child(
                        Element::new("ds:X509SerialNumber").with_text(certificate.serial_decimal()),
                    ),
            ),
    );

    let policy = Element::new("xades:SignaturePolicyIdentifier").with_child(
        Element::new("xades:SignaturePolicyId")
            .with_child(
                Element::new("xades:SigPolicyId")
                    .with_child(Element::new("xades:Identifier").with_text(POLICY_IDENTIFIER))
                    .with_child(Element::new("xades:Description").with_text(POLICY_DESCRIPTION)),
            )
            .with_child(
                Element::new("xades:SigPolicyHash")
                    .with_child(digest_method())
                    .with_child(Element::new("ds:DigestValue").with_text(POLICY_DIGEST)),
            ),
    );

    let signed_signature_properties = Element::new("xades:SignedSignatureProperties")
        .with_child(
            Element::new("xades:SigningTime")
                .with_text(signing_time.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        )
        .with_child(signing_certificate)
        .with_child(policy);

    let data_object_properties = Element::new("xades:SignedDataObjectProperties").with_child(
        Element::new("xades:DataObjectFormat")
            .with_attribute("ObjectReference", format!("#{}", ids.reference))
            .with_child(Element::new("xades:MimeType").with_text("text/xml")),
    );

    Element::new("xades:QualifyingProperties")
        .with_namespace(Some("xades"), XADES_NS)
        .with_attribute("Target", format!("#{}", ids.signature))
        .with_child(
            Element::new("xades:SignedProperties")
                .with_attribute("Id", ids.signed_properties.clone())
                .with_child(signed_signature_properties)
                .with_child(data_object_properties),
        )
}

fn subtree_digest(
    signature: &Element,
    root_scope: &NamespaceScope,
    id: &str,
) -> Result<String, SigningError> {
    let located = signature
        .find_by_id(root_scope, id)
        .ok_or_else(|| SigningError::SigningError(format!("element '{id}' not built")))?;
    Ok(digest_base64(&canonicalize_in_scope(
        located.element,
        &located.inherited,
        C14nMode::Exclusive,
    )))
}

fn set_reference_digest(signed_info: &mut Element, uri: &str, digest: &str) -> Result<(), SigningError> {
    let reference = signed_info
        .child_elements_mut()
        .find(|el| el.name == "Reference" && el.attribute("URI") == Some(uri))
        .ok_or_else(|| SigningError::SigningError(format!("reference '{uri}' not built")))?;
    child_mut(reference, "DigestValue")?.set_text(digest);
    Ok(())
}

fn child_mut<'a>(element: &'a mut Element, name: &str) -> Result<&'a mut Element, SigningError> {
    element
        .child_elements_mut()
        .find(|el| el.name == name)
        .ok_or_else(|| SigningError::SigningError(format!("{name} not built")))
}

fn required_child<'a>(element: &'a Element, name: &str) -> Result<&'a Element, SigningError> {
    element.child(name).ok_or_else(|| {
        SigningError::Malformed(format!("{} has no {name}", element.qualified_name()))
    })
}

fn algorithm_of(element: &Element) -> Result<&str, SigningError> {
    element.attribute("Algorithm").ok_or_else(|| {
        SigningError::Malformed(format!("{} has no Algorithm", element.qualified_name()))
    })
}

fn digest_base64(bytes: &[u8]) -> String {
    Base64::encode_string(&Sha256::digest(bytes))
}

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::Path;

    const UNSIGNED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<FacturaElectronica xmlns="https://cdn.comprobanteselectronicos.go.cr/xml-schemas/v4.4/facturaElectronica">
  <Clave>50601012500310112345600100001010000000001100000001</Clave>
  <NumeroConsecutivo>00100001010000000001</NumeroConsecutivo>
</FacturaElectronica>"#;

    fn signer() -> DocumentSigner {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/certs");
        let cert = std::fs::read(dir.join("signer.cert.pem")).expect("cert");
        let key = std::fs::read(dir.join("signer.key.pem")).expect("key");
        DocumentSigner::from_pem(&cert, &key, None).expect("signer")
    }

    fn signing_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 15, 30, 0).unwrap()
    }

    #[test]
    fn signature_is_last_child_with_three_references() {
        let signed = signer().sign_xml(UNSIGNED, signing_time()).expect("sign");
        let doc = Document::parse(signed.xml()).expect("parse");
        let last = doc.root.child_elements().last().expect("children");
        assert_eq!(last.qualified_name(), "ds:Signature");

        let signed_info = last.child("SignedInfo").expect("SignedInfo");
        let references: Vec<_> = signed_info
            .child_elements()
            .filter(|el| el.name == "Reference")
            .collect();
        assert_eq!(references.len(), 3);
        assert_eq!(references[0].attribute("URI"), Some(""));
        assert!(references[1].attribute("URI").is_some_and(|uri| uri.starts_with("#KeyInfo-")));
        assert_eq!(references[2].attribute("Type"), Some(SIGNED_PROPERTIES_TYPE));
        for reference in references {
            assert!(!reference.child("DigestValue").expect("digest").text().is_empty());
        }
    }

    #[test]
    fn document_reference_matches_unsigned_digest() {
        let signed = signer().sign_xml(UNSIGNED, signing_time()).expect("sign");
        let stripped = Document::parse_with(
            UNSIGNED,
            ParseOptions {
                strip_blank_text: true,
            },
        )
        .expect("parse")
        .to_xml_string();
        assert_eq!(
            signed.document_digest(),
            document_digest(&stripped, true).expect("digest")
        );
    }

    #[test]
    fn signed_document_verifies() {
        let signed = signer().sign_xml(UNSIGNED, signing_time()).expect("sign");
        let certificate = verify(signed.xml()).expect("verify");
        assert_eq!(certificate.serial_decimal(), "1885667171979194497");
    }

    #[test]
    fn signing_time_is_recorded_in_utc() {
        let signed = signer().sign_xml(UNSIGNED, signing_time()).expect("sign");
        assert!(signed
            .xml()
            .contains("<xades:SigningTime>2025-06-01T15:30:00Z</xades:SigningTime>"));
    }

    #[test]
    fn tampered_content_fails_document_digest() {
        let signed = signer().sign_xml(UNSIGNED, signing_time()).expect("sign");
        let tampered = signed.xml().replace("00100001010000000001", "00100001010000000002");
        let err = verify(&tampered).expect_err("tampered");
        assert!(matches!(err, SigningError::DigestMismatch { reference } if reference.is_empty()));
    }

    #[test]
    fn tampered_signing_time_fails_signed_properties_digest() {
        let signed = signer().sign_xml(UNSIGNED, signing_time()).expect("sign");
        let tampered = signed.xml().replace("2025-06-01T15:30:00Z", "2025-06-01T15:31:00Z");
        let err = verify(&tampered).expect_err("tampered");
        assert!(matches!(err, SigningError::DigestMismatch { reference } if reference.starts_with("#SignedProperties-")));
    }

    #[test]
    fn resigning_is_rejected() {
        let signer = signer();
        let signed = signer.sign_xml(UNSIGNED, signing_time()).expect("sign");
        let err = signer
            .sign_xml(signed.xml(), signing_time())
            .expect_err("already signed");
        assert!(matches!(err, SigningError::AlreadySigned));
    }

    #[test]
    fn malformed_input_is_a_signing_error() {
        let err = signer()
            .sign_xml("<FacturaElectronica>", signing_time())
            .expect_err("malformed");
        assert!(matches!(err, SigningError::Xml(_)));
        assert_eq!(err.kind(), ErrorKind::Signing);
    }

    #[test]
    fn signatures_differ_across_signing_times() {
        let signer = signer();
        let first = signer.sign_xml(UNSIGNED, signing_time()).expect("first");
        let second = signer
            .sign_xml(UNSIGNED, signing_time() + chrono::Duration::seconds(1))
            .expect("second");
        assert_eq!(first.document_digest(), second.document_digest());
        assert_ne!(first.xml(), second.xml());
        verify(second.xml()).expect("second verifies");
    }
}
