//! The structured message tree exchanged over the connection.
//!
//! A [`Message`] is one XML element: a tag, a set of attributes, ordered
//! child elements and optional text content. Inbound messages are parsed
//! from complete fragments handed over by the frame codec; outbound
//! messages are built in place and serialized with [`Message::to_xml`].

use std::collections::BTreeMap;
use std::fmt;

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

use crate::error::LinkError;

// ── Attribute names ──────────────────────────────────────────────

/// Attribute carrying the correlation id of a command and its response.
pub const ATTR_SEQUENCE_ID: &str = "sequence-id";

/// Attribute reporting the command-level outcome on a response.
pub const ATTR_SUCCESS: &str = "success";

// ── Text ─────────────────────────────────────────────────────────

/// Literal text content of an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Text {
    /// Character data, escaped on output.
    Escaped(String),
    /// Opaque payload, written as a CDATA section and never re-parsed as
    /// markup by the peer.
    Raw(String),
}

impl Text {
    pub fn as_str(&self) -> &str {
        match self {
            Text::Escaped(s) | Text::Raw(s) => s,
        }
    }

    fn push_str(&mut self, more: &str) {
        match self {
            Text::Escaped(s) | Text::Raw(s) => s.push_str(more),
        }
    }
}

// ── Message ──────────────────────────────────────────────────────

/// One element of the message tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    tag: String,
    attrs: BTreeMap<String, String>,
    children: Vec<Message>,
    text: Option<Text>,
    /// Text following this element inside its parent, before the next
    /// sibling.
    tail: Option<String>,
}

impl Message {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    // ── Builders ─────────────────────────────────────────────────

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: Message) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.set_text(text);
        self
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn attrs(&self) -> &BTreeMap<String, String> {
        &self.attrs
    }

    /// Set an attribute, replacing any previous value.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        self.attrs.remove(name)
    }

    pub fn children(&self) -> &[Message] {
        &self.children
    }

    /// Append a child element and return a mutable reference to it.
    pub fn push_child(&mut self, child: Message) -> &mut Message {
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// First direct child with the given tag.
    pub fn child(&self, tag: &str) -> Option<&Message> {
        self.children.iter().find(|c| c.tag == tag)
    }

    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Message> + 'a {
        self.children.iter().filter(move |c| c.tag == tag)
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_ref().map(Text::as_str)
    }

    pub fn text_content(&self) -> Option<&Text> {
        self.text.as_ref()
    }

    pub fn set_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.text = Some(Text::Escaped(text.into()));
        self
    }

    /// Set text that must reach the peer verbatim (CDATA).
    pub fn set_raw_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.text = Some(Text::Raw(text.into()));
        self
    }

    /// Text between the end of this element and its next sibling.
    pub fn tail(&self) -> Option<&str> {
        self.tail.as_deref()
    }

    pub fn set_tail(&mut self, tail: impl Into<String>) -> &mut Self {
        self.tail = Some(tail.into());
        self
    }

    // ── Path lookups ─────────────────────────────────────────────

    /// First descendant reached by a `/`-separated path of tags,
    /// relative to this element (`"event/type"`).
    pub fn find(&self, path: &str) -> Option<&Message> {
        self.find_all(path).next()
    }

    /// Every descendant reached by a `/`-separated path of tags.
    pub fn find_all<'a, 'p>(&'a self, path: &'p str) -> Box<dyn Iterator<Item = &'a Message> + 'p>
    where
        'a: 'p,
    {
        let mut current: Box<dyn Iterator<Item = &'a Message> + 'p> =
            Box::new(std::iter::once(self));
        for step in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            current = Box::new(
                current.flat_map(move |m: &'a Message| m.children.iter().filter(move |c| c.tag == step)),
            );
        }
        current
    }

    /// First element at `path` whose `attr` equals `value`
    /// (the `path[@attr='value']` lookup).
    pub fn find_where(&self, path: &str, attr: &str, value: &str) -> Option<&Message> {
        self.find_all(path).find(|m| m.attr(attr) == Some(value))
    }

    // ── Protocol conveniences ────────────────────────────────────

    /// The correlation id carried by this message, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.attr(ATTR_SEQUENCE_ID)
    }

    /// Whether a response reports command-level success.
    pub fn is_success(&self) -> bool {
        self.attr(ATTR_SUCCESS) == Some("true")
    }

    // ── Parsing ──────────────────────────────────────────────────

    /// Parse one complete fragment into a message tree.
    ///
    /// The fragment must contain exactly one root element. Whitespace-only
    /// text is dropped; all other text is kept as it arrived. Text after a
    /// child element becomes that child's [`tail`](Self::tail).
    pub fn parse(fragment: &str) -> Result<Message, LinkError> {
        let mut reader = Reader::from_str(fragment);

        let mut stack: Vec<Message> = Vec::new();
        let mut root: Option<Message> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| LinkError::malformed(fragment, e))?;
            match event {
                Event::Start(start) => {
                    if root.is_some() {
                        return Err(LinkError::malformed(fragment, "content after root element"));
                    }
                    stack.push(element_from(&start, fragment)?);
                }
                Event::Empty(start) => {
                    let element = element_from(&start, fragment)?;
                    attach(&mut stack, &mut root, element, fragment)?;
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| LinkError::malformed(fragment, "unbalanced end tag"))?;
                    attach(&mut stack, &mut root, element, fragment)?;
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| LinkError::malformed(fragment, e))?;
                    if text.trim().is_empty() {
                        continue;
                    }
                    let top = stack
                        .last_mut()
                        .ok_or_else(|| LinkError::malformed(fragment, "text outside root element"))?;
                    if let Some(last) = top.children.last_mut() {
                        last.tail.get_or_insert_with(String::new).push_str(&text);
                    } else {
                        match top.text.as_mut() {
                            Some(existing) => existing.push_str(&text),
                            None => top.text = Some(Text::Escaped(text.into_owned())),
                        }
                    }
                }
                Event::CData(cdata) => {
                    let raw = cdata.into_inner();
                    let raw = std::str::from_utf8(&raw)?;
                    let top = stack
                        .last_mut()
                        .ok_or_else(|| LinkError::malformed(fragment, "CDATA outside root element"))?;
                    if let Some(last) = top.children.last_mut() {
                        last.tail.get_or_insert_with(String::new).push_str(raw);
                        continue;
                    }
                    let mut merged = top.text.take().map(|t| t.as_str().to_owned()).unwrap_or_default();
                    merged.push_str(raw);
                    top.text = Some(Text::Raw(merged));
                }
                Event::Eof => break,
                // Comments, declarations, processing instructions.
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(LinkError::malformed(fragment, "unclosed element"));
        }
        root.ok_or_else(|| LinkError::malformed(fragment, "no root element"))
    }

    // ── Serialization ────────────────────────────────────────────

    /// Serialize to XML text.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.tag);
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape(value.as_str()));
            out.push('"');
        }

        if self.children.is_empty() && self.text.is_none() {
            out.push_str("/>");
            return;
        }
        out.push('>');

        match &self.text {
            Some(Text::Escaped(s)) => out.push_str(&escape(s.as_str())),
            Some(Text::Raw(s)) => {
                // A literal "]]>" would end the section early; split it.
                out.push_str("<![CDATA[");
                out.push_str(&s.replace("]]>", "]]]]><![CDATA[>"));
                out.push_str("]]>");
            }
            None => {}
        }
        for child in &self.children {
            child.write_xml(out);
            if let Some(tail) = &child.tail {
                out.push_str(&escape(tail.as_str()));
            }
        }

        out.push_str("</");
        out.push_str(&self.tag);
        out.push('>');
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

impl std::str::FromStr for Message {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Message::parse(s)
    }
}

// ── Parse helpers ────────────────────────────────────────────────

fn element_from(start: &BytesStart<'_>, fragment: &str) -> Result<Message, LinkError> {
    let tag = std::str::from_utf8(start.name().as_ref())?.to_owned();
    let mut element = Message::new(tag);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| LinkError::malformed(fragment, e))?;
        let key = std::str::from_utf8(attr.key.as_ref())?.to_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| LinkError::malformed(fragment, e))?
            .into_owned();
        element.attrs.insert(key, value);
    }
    Ok(element)
}

fn attach(
    stack: &mut [Message],
    root: &mut Option<Message>,
    element: Message,
    fragment: &str,
) -> Result<(), LinkError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(LinkError::malformed(fragment, "more than one root element")),
    }
    Ok(())
}
