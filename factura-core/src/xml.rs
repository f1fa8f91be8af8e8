//! Owned XML tree, parsing, serialization and canonicalization.
//!
//! Signing needs byte-exact control over namespace declarations and attribute order,
//! so documents are parsed into an owned [`Element`] tree rather than deserialized into
//! typed structs.
//!
//! # Examples
//! ```rust
//! use factura_core::xml::{canonicalize, Document};
//!
//! let doc = Document::parse(r#"<a xmlns="urn:x" b="2"   a="1"><c/></a>"#)?;
//! let canonical = canonicalize(&doc.root, true);
//! assert_eq!(canonical, br#"<a xmlns="urn:x" a="1" b="2"><c></c></a>"#);
//! # Ok::<(), factura_core::xml::XmlError>(())
//! ```
pub mod c14n;
pub mod constants;
pub mod tree;

use thiserror::Error;

pub use c14n::{C14nMode, canonicalize_document, canonicalize_in_scope};
pub use tree::{
    Attribute, Document, Element, Located, NamespaceDecl, NamespaceScope, Node, ParseOptions,
};

/// Errors raised while reading XML input.
#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML parse error: {0}")]
    Parse(String),
    #[error("Unbound namespace prefix '{0}'")]
    UnboundPrefix(String),
    #[error("Missing root element")]
    MissingRoot,
}

/// Canonicalize a standalone element.
///
/// The element is treated as a document subset apex with no inherited namespaces. Use
/// [`canonicalize_in_scope`] when the element sits inside a larger document.
pub fn canonicalize(element: &Element, exclusive: bool) -> Vec<u8> {
    let mode = if exclusive {
        C14nMode::Exclusive
    } else {
        C14nMode::Inclusive
    };
    canonicalize_in_scope(element, &NamespaceScope::default(), mode)
}
