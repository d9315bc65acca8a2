//! Minimal element tree over quick-xml

use crate::{RemotingError, Result};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use remoting_proto::ProtocolError;
use std::fmt::Write;

/// One XML element with its attributes, text and children
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    /// Local name
    pub name: String,
    /// Attributes in document order
    pub attributes: Vec<(String, String)>,
    /// Concatenated text content
    pub text: String,
    /// Child elements
    pub children: Vec<Element>,
}

impl Element {
    /// Create an empty element
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add an attribute
    pub fn attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.push((key.into(), value.to_string()));
        self
    }

    /// Set the text content
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Append a child
    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// Append a child in place
    pub fn push(&mut self, child: Element) {
        self.children.push(child);
    }

    /// Look an attribute up
    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Look an attribute up, failing when absent
    pub fn require_attr(&self, key: &str) -> Result<&str> {
        self.get_attr(key).ok_or_else(|| {
            xml_error(format!("<{}> is missing attribute {}", self.name, key))
        })
    }

    /// Parse an attribute
    pub fn parse_attr<T: std::str::FromStr>(&self, key: &str) -> Result<T> {
        let raw = self.require_attr(key)?;
        raw.parse()
            .map_err(|_| xml_error(format!("<{}> has invalid {}={:?}", self.name, key, raw)))
    }

    /// First child with the given name
    pub fn find(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Children with the given name
    pub fn find_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// The only child, whatever its name
    pub fn single_child(&self) -> Result<&Element> {
        match self.children.as_slice() {
            [only] => Ok(only),
            other => Err(xml_error(format!(
                "<{}> should have one child, found {}",
                self.name,
                other.len()
            ))),
        }
    }

    /// Serialize to a string
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out);
        out
    }

    fn write_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            let _ = write!(out, " {}=\"{}\"", key, escape(value.as_str()));
        }

        if self.text.is_empty() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }

        out.push('>');
        out.push_str(&escape(self.text.as_str()));
        for child in &self.children {
            child.write_into(out);
        }
        let _ = write!(out, "</{}>", self.name);
    }

    /// Parse a document and return its root element
    pub fn parse(xml: &str) -> Result<Element> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(false);

        let mut stack: Vec<Element> = Vec::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) => stack.push(start_element(e)?),
                Ok(Event::Empty(ref e)) => {
                    let element = start_element(e)?;
                    if let Some(root) = close(&mut stack, element) {
                        return Ok(root);
                    }
                }
                Ok(Event::End(_)) => {
                    let mut element = stack
                        .pop()
                        .ok_or_else(|| xml_error("unbalanced closing tag"))?;
                    if !element.children.is_empty() && element.text.trim().is_empty() {
                        element.text.clear();
                    }
                    if let Some(root) = close(&mut stack, element) {
                        return Ok(root);
                    }
                }
                Ok(Event::Text(e)) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&e.unescape()?);
                    }
                }
                Ok(Event::CData(e)) => {
                    if let Some(current) = stack.last_mut() {
                        let raw = e.into_inner();
                        current.text.push_str(
                            std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidUtf8)?,
                        );
                    }
                }
                Ok(Event::Eof) => return Err(xml_error("document has no complete root element")),
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn start_element(e: &BytesStart<'_>) -> Result<Element> {
    let name = std::str::from_utf8(e.local_name().as_ref())
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_string();

    let mut element = Element::new(name);
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = std::str::from_utf8(attr.key.local_name().as_ref())
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();
        let value = attr.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

/// Attach a finished element to its parent, returning it when it is the root
fn close(stack: &mut [Element], element: Element) -> Option<Element> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            None
        }
        None => Some(element),
    }
}

pub(crate) fn xml_error(msg: impl Into<String>) -> RemotingError {
    RemotingError::Protocol(ProtocolError::Xml(msg.into()))
}
