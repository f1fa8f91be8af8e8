use std::collections::BTreeMap;
use std::fmt::Write;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::constants::XML_NS;
use super::XmlError;

/// A namespace declaration carried by an element. `prefix == None` is the default namespace;
/// an empty `uri` on the default namespace undeclares it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceDecl {
    pub prefix: Option<String>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub prefix: Option<String>,
    pub name: String,
    pub value: String,
}

impl Attribute {
    pub fn qualified_name(&self) -> String {
        qualify(self.prefix.as_deref(), &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
    ProcessingInstruction { target: String, content: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub prefix: Option<String>,
    pub name: String,
    pub namespaces: Vec<NamespaceDecl>,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

/// An element found by [`Element::find`], together with the namespace bindings its
/// ancestors put in scope.
#[derive(Debug, Clone)]
pub struct Located<'a> {
    pub element: &'a Element,
    pub inherited: NamespaceScope,
}

impl Element {
    /// Create an element from a possibly prefixed name such as `ds:Signature`.
    pub fn new(qualified_name: &str) -> Self {
        let (prefix, name) = split_qname(qualified_name);
        Self {
            prefix,
            name,
            namespaces: Vec::new(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, prefix: Option<&str>, uri: &str) -> Self {
        self.namespaces.push(NamespaceDecl {
            prefix: prefix.map(str::to_string),
            uri: uri.to_string(),
        });
        self
    }

    pub fn with_attribute(mut self, qualified_name: &str, value: impl Into<String>) -> Self {
        self.set_attribute(qualified_name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn qualified_name(&self) -> String {
        qualify(self.prefix.as_deref(), &self.name)
    }

    pub fn set_attribute(&mut self, qualified_name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(existing) = self
            .attributes
            .iter_mut()
            .find(|attr| attr.qualified_name() == qualified_name)
        {
            existing.value = value;
            return;
        }
        let (prefix, name) = split_qname(qualified_name);
        self.attributes.push(Attribute {
            prefix,
            name,
            value,
        });
    }

    /// Look up an attribute by its qualified name as written in the document.
    pub fn attribute(&self, qualified_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.qualified_name() == qualified_name)
            .map(|attr| attr.value.as_str())
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            _ => None,
        })
    }

    pub fn child_elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            _ => None,
        })
    }

    /// First direct child with the given local name.
    pub fn child(&self, local_name: &str) -> Option<&Element> {
        self.child_elements().find(|el| el.name == local_name)
    }

    /// Concatenated text of the direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Replace all children with a single text node.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children = vec![Node::Text(text.into())];
    }

    /// Remove whitespace-only text nodes from this subtree.
    pub fn strip_blank_text(&mut self) {
        self.children.retain(|node| match node {
            Node::Text(text) => !text.chars().all(char::is_whitespace),
            _ => true,
        });
        for child in self.child_elements_mut() {
            child.strip_blank_text();
        }
    }

    /// Depth-first search for the first element matching `pred`, which receives the
    /// element and the namespace scope in effect on it.
    pub fn find<'a>(
        &'a self,
        inherited: &NamespaceScope,
        pred: &dyn Fn(&Element, &NamespaceScope) -> bool,
    ) -> Option<Located<'a>> {
        let scope = inherited.enter(self);
        if pred(self, &scope) {
            return Some(Located {
                element: self,
                inherited: inherited.clone(),
            });
        }
        self.child_elements()
            .find_map(|child| child.find(&scope, pred))
    }

    /// Find the element carrying `Id="<id>"` anywhere in this subtree.
    pub fn find_by_id<'a>(&'a self, inherited: &NamespaceScope, id: &str) -> Option<Located<'a>> {
        self.find(inherited, &|el, _| el.attribute("Id") == Some(id))
    }
}

/// Namespace bindings in scope at some point of a document, plus the `xml:*` attributes
/// (`xml:lang`, `xml:space`, ...) the nearest ancestors set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceScope {
    bindings: BTreeMap<Option<String>, String>,
    xml_attributes: BTreeMap<String, String>,
}

impl NamespaceScope {
    /// Scope in effect inside `element`, given that `self` is in effect on its parent.
    pub fn enter(&self, element: &Element) -> NamespaceScope {
        let mut scope = self.clone();
        for decl in &element.namespaces {
            scope.bindings.insert(decl.prefix.clone(), decl.uri.clone());
        }
        for attr in element
            .attributes
            .iter()
            .filter(|attr| attr.prefix.as_deref() == Some("xml"))
        {
            scope
                .xml_attributes
                .insert(attr.name.clone(), attr.value.clone());
        }
        scope
    }

    /// Scope in effect inside the last element of `path`, walking from the document root.
    pub fn along(path: &[&Element]) -> NamespaceScope {
        path.iter()
            .fold(NamespaceScope::default(), |scope, el| scope.enter(el))
    }

    /// Resolve a prefix. The default namespace resolves to `None` when undeclared.
    pub fn resolve(&self, prefix: Option<&str>) -> Option<&str> {
        if prefix == Some("xml") {
            return Some(XML_NS);
        }
        self.bindings
            .get(&prefix.map(str::to_string))
            .map(String::as_str)
            .filter(|uri| !uri.is_empty())
    }

    pub(crate) fn bindings(&self) -> impl Iterator<Item = (Option<&str>, &str)> {
        self.bindings
            .iter()
            .map(|(prefix, uri)| (prefix.as_deref(), uri.as_str()))
    }

    pub(crate) fn xml_attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.xml_attributes
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Namespace URI of `element`, which must be the element this scope was entered for.
    pub fn element_ns(&self, element: &Element) -> Option<&str> {
        self.resolve(element.prefix.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Drop whitespace-only text nodes, as XML signers conventionally do before signing.
    pub strip_blank_text: bool,
}

/// A parsed document: the root element plus comments and processing instructions around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub prolog: Vec<Node>,
    pub root: Element,
    pub epilog: Vec<Node>,
}

impl Document {
    pub fn new(root: Element) -> Self {
        Self {
            prolog: Vec::new(),
            root,
            epilog: Vec::new(),
        }
    }

    pub fn parse(xml: &str) -> Result<Self, XmlError> {
        Self::parse_with(xml, ParseOptions::default())
    }

    pub fn parse_with(xml: &str, options: ParseOptions) -> Result<Self, XmlError> {
        let normalized = normalize_line_endings(xml);
        let mut reader = Reader::from_str(&normalized);
        let mut stack: Vec<(Element, NamespaceScope)> = Vec::new();
        let mut builder = DocumentBuilder::default();

        loop {
            let event = reader.read_event().map_err(|e| {
                XmlError::Parse(format!("{e} at byte {}", reader.error_position()))
            })?;
            match event {
                Event::Start(start) => {
                    let element = element_from_start(&start)?;
                    let scope = entered_scope(&stack, &element)?;
                    stack.push((element, scope));
                }
                Event::Empty(start) => {
                    let element = element_from_start(&start)?;
                    entered_scope(&stack, &element)?;
                    builder.attach(&mut stack, Node::Element(element))?;
                }
                Event::End(_) => {
                    let (element, _) = stack
                        .pop()
                        .ok_or_else(|| XmlError::Parse("unexpected closing tag".into()))?;
                    builder.attach(&mut stack, Node::Element(element))?;
                }
                Event::Text(text) => {
                    let value = text
                        .unescape()
                        .map_err(|e| XmlError::Parse(format!("invalid text: {e}")))?;
                    builder.text(&mut stack, &value)?;
                }
                Event::CData(data) => {
                    let value = String::from_utf8(data.into_inner().into_owned())
                        .map_err(|e| XmlError::Parse(format!("invalid CDATA: {e}")))?;
                    builder.text(&mut stack, &value)?;
                }
                Event::Comment(comment) => {
                    let value = String::from_utf8(comment.into_inner().into_owned())
                        .map_err(|e| XmlError::Parse(format!("invalid comment: {e}")))?;
                    builder.attach(&mut stack, Node::Comment(value))?;
                }
                Event::PI(pi) => {
                    let target = utf8(pi.target())?.to_string();
                    let content = utf8(pi.content())?.trim_start().to_string();
                    builder.attach(&mut stack, Node::ProcessingInstruction { target, content })?;
                }
                Event::Decl(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
        }

        if let Some((open, _)) = stack.last() {
            return Err(XmlError::Parse(format!(
                "unclosed element <{}>",
                open.qualified_name()
            )));
        }
        let mut document = builder.finish()?;
        if options.strip_blank_text {
            document.root.strip_blank_text();
        }
        Ok(document)
    }

    /// Serialize with an XML declaration. Empty elements use the short form.
    pub fn to_xml_string(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        for node in &self.prolog {
            write_node(&mut out, node);
        }
        write_element(&mut out, &self.root);
        for node in &self.epilog {
            write_node(&mut out, node);
        }
        out
    }
}

#[derive(Default)]
struct DocumentBuilder {
    prolog: Vec<Node>,
    root: Option<Element>,
    epilog: Vec<Node>,
}

impl DocumentBuilder {
    fn attach(
        &mut self,
        stack: &mut [(Element, NamespaceScope)],
        node: Node,
    ) -> Result<(), XmlError> {
        if let Some((parent, _)) = stack.last_mut() {
            parent.children.push(node);
            return Ok(());
        }
        match node {
            Node::Element(element) => {
                if self.root.is_some() {
                    return Err(XmlError::Parse("multiple root elements".into()));
                }
                self.root = Some(element);
            }
            Node::Text(_) => {}
            other if self.root.is_none() => self.prolog.push(other),
            other => self.epilog.push(other),
        }
        Ok(())
    }

    fn text(&mut self, stack: &mut [(Element, NamespaceScope)], value: &str) -> Result<(), XmlError> {
        let Some((parent, _)) = stack.last_mut() else {
            if value.chars().all(char::is_whitespace) {
                return Ok(());
            }
            return Err(XmlError::Parse("text outside the root element".into()));
        };
        if let Some(Node::Text(previous)) = parent.children.last_mut() {
            previous.push_str(value);
        } else {
            parent.children.push(Node::Text(value.to_string()));
        }
        Ok(())
    }

    fn finish(self) -> Result<Document, XmlError> {
        let root = self.root.ok_or(XmlError::MissingRoot)?;
        Ok(Document {
            prolog: self.prolog,
            root,
            epilog: self.epilog,
        })
    }
}

fn entered_scope(
    stack: &[(Element, NamespaceScope)],
    element: &Element,
) -> Result<NamespaceScope, XmlError> {
    let scope = match stack.last() {
        Some((_, parent_scope)) => parent_scope.enter(element),
        None => NamespaceScope::default().enter(element),
    };
    if let Some(prefix) = element.prefix.as_deref() {
        if scope.resolve(Some(prefix)).is_none() {
            return Err(XmlError::UnboundPrefix(prefix.to_string()));
        }
    }
    for attr in &element.attributes {
        if let Some(prefix) = attr.prefix.as_deref() {
            if scope.resolve(Some(prefix)).is_none() {
                return Err(XmlError::UnboundPrefix(prefix.to_string()));
            }
        }
    }
    Ok(scope)
}

fn element_from_start(start: &BytesStart) -> Result<Element, XmlError> {
    let mut element = Element::new(utf8(start.name().as_ref())?);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Parse(format!("invalid attribute: {e}")))?;
        let key = utf8(attr.key.as_ref())?;
        let value = normalize_attribute_value(utf8(attr.value.as_ref())?)?;
        if key == "xmlns" {
            element.namespaces.push(NamespaceDecl {
                prefix: None,
                uri: value,
            });
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            element.namespaces.push(NamespaceDecl {
                prefix: Some(prefix.to_string()),
                uri: value,
            });
        } else {
            let (prefix, name) = split_qname(key);
            element.attributes.push(Attribute {
                prefix,
                name,
                value,
            });
        }
    }
    Ok(element)
}

// Literal whitespace in attribute values becomes a space; character references survive.
fn normalize_attribute_value(raw: &str) -> Result<String, XmlError> {
    let spaced: String = raw
        .chars()
        .map(|c| if matches!(c, '\t' | '\n' | '\r') { ' ' } else { c })
        .collect();
    quick_xml::escape::unescape(&spaced)
        .map(|value| value.into_owned())
        .map_err(|e| XmlError::Parse(format!("invalid attribute value: {e}")))
}

fn normalize_line_endings(xml: &str) -> String {
    xml.replace("\r\n", "\n").replace('\r', "\n")
}

fn utf8(bytes: &[u8]) -> Result<&str, XmlError> {
    std::str::from_utf8(bytes).map_err(|e| XmlError::Parse(format!("invalid UTF-8: {e}")))
}

pub(crate) fn split_qname(qualified_name: &str) -> (Option<String>, String) {
    match qualified_name.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, qualified_name.to_string()),
    }
}

pub(crate) fn qualify(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}:{name}"),
        None => name.to_string(),
    }
}

fn write_node(out: &mut String, node: &Node) {
    match node {
        Node::Element(element) => write_element(out, element),
        Node::Text(text) => {
            for c in text.chars() {
                match c {
                    '&' => out.push_str("&amp;"),
                    '<' => out.push_str("&lt;"),
                    '>' => out.push_str("&gt;"),
                    '\r' => out.push_str("&#13;"),
                    other => out.push(other),
                }
            }
        }
        Node::Comment(comment) => {
            let _ = write!(out, "<!--{comment}-->");
        }
        Node::ProcessingInstruction { target, content } => {
            if content.is_empty() {
                let _ = write!(out, "<?{target}?>");
            } else {
                let _ = write!(out, "<?{target} {content}?>");
            }
        }
    }
}

fn write_element(out: &mut String, element: &Element) {
    let name = element.qualified_name();
    out.push('<');
    out.push_str(&name);
    for decl in &element.namespaces {
        match decl.prefix.as_deref() {
            Some(prefix) => {
                let _ = write!(out, " xmlns:{prefix}=\"");
            }
            None => out.push_str(" xmlns=\""),
        }
        push_attribute_value(out, &decl.uri);
        out.push('"');
    }
    for attr in &element.attributes {
        let _ = write!(out, " {}=\"", attr.qualified_name());
        push_attribute_value(out, &attr.value);
        out.push('"');
    }
    if element.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in &element.children {
        write_node(out, child);
    }
    let _ = write!(out, "</{name}>");
}

fn push_attribute_value(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#9;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            other => out.push(other),
        }
    }
}
