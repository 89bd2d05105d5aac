//! Minimal XML element tree
//!
//! Stanza payloads are small and shallow; this keeps a plain tree with
//! namespace inheritance, a builder API for assembly and a roxmltree-based
//! parser for inbound stanzas.

use crate::error::{Result, StanzaError};

/// One XML element with resolved namespace
#[derive(Clone, Debug, PartialEq)]
pub struct Element {
    name: String,
    ns: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

/// Child node: nested element or character data
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ns: None,
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Set the element namespace
    pub fn ns(mut self, ns: impl Into<String>) -> Self {
        self.ns = Some(ns.into());
        self
    }

    /// Add an attribute
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((name.into(), value.into()));
        self
    }

    /// Add a child element
    pub fn child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    /// Add character data
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    pub fn get_attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Required attribute, as error otherwise
    pub fn req_attr(&self, name: &str) -> Result<&str> {
        self.get_attr(name)
            .ok_or_else(|| StanzaError::MissingAttribute(format!("{}@{}", self.name, name)))
    }

    /// Concatenated character data of direct text children
    pub fn content(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// Direct element children
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child with the given local name
    pub fn find_child(&self, name: &str) -> Option<&Element> {
        self.children().find(|e| e.name == name)
    }

    /// First child with the given local name in one of the namespaces
    pub fn find_child_in(&self, name: &str, namespaces: &[&str]) -> Option<&Element> {
        self.children()
            .find(|e| e.name == name && e.ns.as_deref().is_some_and(|ns| namespaces.contains(&ns)))
    }

    /// All children with the given local name
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children().filter(move |e| e.name == name)
    }

    /// Serialize to an XML string
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write(&mut out, None);
        out
    }

    fn write(&self, out: &mut String, parent_ns: Option<&str>) {
        out.push('<');
        out.push_str(&self.name);
        if let Some(ns) = &self.ns {
            if parent_ns != Some(ns.as_str()) {
                out.push_str(" xmlns=\"");
                out.push_str(&escape(ns));
                out.push('"');
            }
        }
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape(value));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        let own_ns = self.ns.as_deref().or(parent_ns);
        for node in &self.children {
            match node {
                Node::Element(e) => e.write(out, own_ns),
                Node::Text(t) => out.push_str(&escape(t)),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Parse a stanza from its XML text
    pub fn parse(xml: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(xml)?;
        Ok(convert(doc.root_element()))
    }
}

fn convert(node: roxmltree::Node<'_, '_>) -> Element {
    let mut element = Element::new(node.tag_name().name());
    element.ns = node.tag_name().namespace().map(str::to_string);
    for attr in node.attributes() {
        element.attrs.push((attr.name().to_string(), attr.value().to_string()));
    }
    for child in node.children() {
        if child.is_element() {
            element.children.push(Node::Element(convert(child)));
        } else if child.is_text() {
            if let Some(text) = child.text() {
                if !text.trim().is_empty() {
                    element.children.push(Node::Text(text.to_string()));
                }
            }
        }
    }
    element
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
