//! Canonical XML 1.0 and Exclusive XML Canonicalization 1.0, both without comments.
use std::collections::{BTreeMap, BTreeSet};

use super::constants::{C14N_EXCLUSIVE, C14N_INCLUSIVE};
use super::tree::{Attribute, Document, Element, NamespaceScope, Node};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum C14nMode {
    Inclusive,
    Exclusive,
}

impl C14nMode {
    pub fn algorithm(&self) -> &'static str {
        match self {
            C14nMode::Inclusive => C14N_INCLUSIVE,
            C14nMode::Exclusive => C14N_EXCLUSIVE,
        }
    }

    pub fn from_algorithm(uri: &str) -> Option<Self> {
        match uri {
            C14N_INCLUSIVE => Some(C14nMode::Inclusive),
            C14N_EXCLUSIVE => Some(C14nMode::Exclusive),
            _ => None,
        }
    }
}

/// Canonicalize `element` as the apex of a document subset. `inherited` holds the namespace
/// bindings its ancestors put in scope.
pub fn canonicalize_in_scope(
    element: &Element,
    inherited: &NamespaceScope,
    mode: C14nMode,
) -> Vec<u8> {
    let mut writer = Writer::new(mode, None);
    if mode == C14nMode::Inclusive {
        // Inclusive C14N carries ancestor xml:* attributes onto the subset apex.
        writer.apex_attributes = inherited
            .xml_attributes()
            .map(|(name, value)| Attribute {
                prefix: Some("xml".to_string()),
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect();
    }
    writer.element(element, inherited, &Rendered::default());
    writer.out
}

/// Canonicalize a whole document. `exclude` removes one element subtree from the node set,
/// which is how the enveloped-signature transform is applied.
pub fn canonicalize_document(
    document: &Document,
    mode: C14nMode,
    exclude: Option<&Element>,
) -> Vec<u8> {
    let mut writer = Writer::new(mode, exclude);
    for node in &document.prolog {
        if writer.node(node, &NamespaceScope::default(), &Rendered::default()) {
            writer.out.push(b'\n');
        }
    }
    writer.element(&document.root, &NamespaceScope::default(), &Rendered::default());
    for node in &document.epilog {
        if matches!(node, Node::ProcessingInstruction { .. }) {
            writer.out.push(b'\n');
            writer.node(node, &NamespaceScope::default(), &Rendered::default());
        }
    }
    writer.out
}

/// Namespace declarations already emitted by output ancestors.
#[derive(Debug, Clone, Default)]
struct Rendered(BTreeMap<Option<String>, String>);

impl Rendered {
    fn get(&self, prefix: Option<&str>) -> &str {
        self.0
            .get(&prefix.map(str::to_string))
            .map(String::as_str)
            .unwrap_or("")
    }
}

struct Writer<'a> {
    mode: C14nMode,
    exclude: Option<&'a Element>,
    apex_attributes: Vec<Attribute>,
    out: Vec<u8>,
}

impl<'a> Writer<'a> {
    fn new(mode: C14nMode, exclude: Option<&'a Element>) -> Self {
        Self {
            mode,
            exclude,
            apex_attributes: Vec::new(),
            out: Vec::new(),
        }
    }

    // Returns whether anything was written.
    fn node(&mut self, node: &Node, scope: &NamespaceScope, rendered: &Rendered) -> bool {
        match node {
            Node::Element(element) => self.element(element, scope, rendered),
            Node::Text(text) => {
                escape_text(&mut self.out, text);
                true
            }
            Node::Comment(_) => false,
            Node::ProcessingInstruction { target, content } => {
                self.out.extend_from_slice(b"<?");
                self.out.extend_from_slice(target.as_bytes());
                if !content.is_empty() {
                    self.out.push(b' ');
                    self.out.extend_from_slice(content.as_bytes());
                }
                self.out.extend_from_slice(b"?>");
                true
            }
        }
    }

    fn element(&mut self, element: &Element, inherited: &NamespaceScope, rendered: &Rendered) -> bool {
        if self
            .exclude
            .is_some_and(|excluded| std::ptr::eq(excluded, element))
        {
            return false;
        }

        let scope = inherited.enter(element);
        let declarations = match self.mode {
            C14nMode::Inclusive => inclusive_declarations(&scope, rendered),
            C14nMode::Exclusive => exclusive_declarations(element, &scope, rendered),
        };

        let mut rendered_here = rendered.clone();
        for (prefix, uri) in &declarations {
            rendered_here.0.insert(prefix.clone(), uri.clone());
        }

        let name = element.qualified_name();
        self.out.push(b'<');
        self.out.extend_from_slice(name.as_bytes());
        for (prefix, uri) in &declarations {
            match prefix {
                Some(prefix) => {
                    self.out.extend_from_slice(b" xmlns:");
                    self.out.extend_from_slice(prefix.as_bytes());
                }
                None => self.out.extend_from_slice(b" xmlns"),
            }
            self.out.extend_from_slice(b"=\"");
            escape_attribute(&mut self.out, uri);
            self.out.push(b'"');
        }

        let inherited_attributes: Vec<Attribute> = std::mem::take(&mut self.apex_attributes)
            .into_iter()
            .filter(|inherited| {
                !element.attributes.iter().any(|own| {
                    own.prefix.as_deref() == Some("xml") && own.name == inherited.name
                })
            })
            .collect();
        let mut attributes: Vec<_> = element
            .attributes
            .iter()
            .chain(&inherited_attributes)
            .map(|attr| {
                let ns = match attr.prefix.as_deref() {
                    Some(prefix) => scope.resolve(Some(prefix)).unwrap_or(""),
                    None => "",
                };
                ((ns, attr.name.as_str()), attr)
            })
            .collect();
        attributes.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, attr) in attributes {
            self.out.push(b' ');
            self.out.extend_from_slice(attr.qualified_name().as_bytes());
            self.out.extend_from_slice(b"=\"");
            escape_attribute(&mut self.out, &attr.value);
            self.out.push(b'"');
        }
        self.out.push(b'>');

        for child in &element.children {
            self.node(child, &scope, &rendered_here);
        }

        self.out.extend_from_slice(b"</");
        self.out.extend_from_slice(name.as_bytes());
        self.out.push(b'>');
        true
    }
}

// Every in-scope binding that differs from what the output ancestors rendered.
fn inclusive_declarations(
    scope: &NamespaceScope,
    rendered: &Rendered,
) -> BTreeMap<Option<String>, String> {
    let mut declarations = BTreeMap::new();
    let mut default_seen = false;
    for (prefix, uri) in scope.bindings() {
        if prefix == Some("xml") {
            continue;
        }
        if prefix.is_none() {
            default_seen = true;
        }
        if rendered.get(prefix) != uri {
            declarations.insert(prefix.map(str::to_string), uri.to_string());
        }
    }
    if !default_seen && !rendered.get(None).is_empty() {
        declarations.insert(None, String::new());
    }
    declarations
}

// Only the prefixes the element and its attributes visibly utilize.
fn exclusive_declarations(
    element: &Element,
    scope: &NamespaceScope,
    rendered: &Rendered,
) -> BTreeMap<Option<String>, String> {
    let mut utilized: BTreeSet<Option<&str>> = BTreeSet::new();
    utilized.insert(element.prefix.as_deref());
    for attr in &element.attributes {
        if let Some(prefix) = attr.prefix.as_deref() {
            utilized.insert(Some(prefix));
        }
    }

    let mut declarations = BTreeMap::new();
    for prefix in utilized {
        if prefix == Some("xml") {
            continue;
        }
        let uri = scope.resolve(prefix).unwrap_or("");
        if rendered.get(prefix) != uri {
            declarations.insert(prefix.map(str::to_string), uri.to_string());
        }
    }
    declarations
}

fn escape_text(out: &mut Vec<u8>, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.extend_from_slice(b"&amp;"),
            '<' => out.extend_from_slice(b"&lt;"),
            '>' => out.extend_from_slice(b"&gt;"),
            '\r' => out.extend_from_slice(b"&#xD;"),
            other => push_char(out, other),
        }
    }
}

fn escape_attribute(out: &mut Vec<u8>, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.extend_from_slice(b"&amp;"),
            '<' => out.extend_from_slice(b"&lt;"),
            '"' => out.extend_from_slice(b"&quot;"),
            '\t' => out.extend_from_slice(b"&#x9;"),
            '\n' => out.extend_from_slice(b"&#xA;"),
            '\r' => out.extend_from_slice(b"&#xD;"),
            other => push_char(out, other),
        }
    }
}

fn push_char(out: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}
