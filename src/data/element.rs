//! Element tree - The parsed unit of the game's markup stream
//!
//! Elements are built while their start tag is open (`ElementBuilder`) and
//! frozen into an immutable `Element` when the end tag is seen. Downstream
//! components only ever see frozen elements.

use serde::Serialize;

/// Reserved name for a run of literal text (not a real tag)
pub const TEXT_NAME: &str = ":text";

/// Name of the synthetic wrapper produced for a pushStream/popStream region
pub const STREAM_NAME: &str = "stream";

/// Construction state of an element
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ElementState {
    Open,
    Closed,
}

/// Ordered attribute map with unique keys
///
/// Insertion order is preserved. Inserting an existing key replaces its value
/// in place (the wire can repeat a key, last write wins).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        for (k, v) in iter {
            attrs.insert(k, v);
        }
        attrs
    }
}

/// A closed, immutable node of the markup tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Element {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Attributes::is_empty")]
    attributes: Attributes,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<Element>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_id: Option<String>,
}

impl Element {
    /// Build a text-run element directly (already closed)
    pub fn text_run(text: impl Into<String>, stream_id: Option<String>) -> Self {
        Self {
            name: TEXT_NAME.to_string(),
            text: Some(text.into()),
            attributes: Attributes::new(),
            children: Vec::new(),
            stream_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key)
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// Frozen elements are always closed
    pub fn state(&self) -> ElementState {
        ElementState::Closed
    }

    pub fn is_text(&self) -> bool {
        self.name == TEXT_NAME
    }

    pub fn is_stream_wrapper(&self) -> bool {
        self.name == STREAM_NAME
    }

    /// Concatenated literal text of this element and all descendants, in
    /// document order
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        if let Some(text) = &self.text {
            out.push_str(text);
        }
        for child in &self.children {
            child.collect_text(out);
        }
    }

    /// Take ownership of the children (used when unwrapping a stream wrapper)
    pub fn into_children(self) -> Vec<Element> {
        self.children
    }
}

/// An element whose end tag has not been seen yet
///
/// Only the parser holds builders. Adjacent text is coalesced into a single
/// `:text` child so a text run split by chunking still yields one child.
#[derive(Debug)]
pub struct ElementBuilder {
    name: String,
    attributes: Attributes,
    children: Vec<Element>,
    stream_id: Option<String>,
    pending_text: String,
    /// True for the synthetic wrapper opened by pushStream
    stream_wrapper: bool,
}

impl ElementBuilder {
    pub fn new(name: impl Into<String>, attributes: Attributes, stream_id: Option<String>) -> Self {
        Self {
            name: name.into(),
            attributes,
            children: Vec::new(),
            stream_id,
            pending_text: String::new(),
            stream_wrapper: false,
        }
    }

    /// Synthetic `stream` wrapper for a pushStream region
    pub fn stream_wrapper(channel: &str) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert("id", channel);
        let mut builder = Self::new(STREAM_NAME, attributes, Some(channel.to_string()));
        builder.stream_wrapper = true;
        builder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stream_wrapper(&self) -> bool {
        self.stream_wrapper
    }

    pub fn state(&self) -> ElementState {
        ElementState::Open
    }

    pub fn push_text(&mut self, text: &str) {
        self.pending_text.push_str(text);
    }

    pub fn push_child(&mut self, child: Element) {
        self.flush_text();
        self.children.push(child);
    }

    fn flush_text(&mut self) {
        if !self.pending_text.is_empty() {
            let text = std::mem::take(&mut self.pending_text);
            self.children
                .push(Element::text_run(text, self.stream_id.clone()));
        }
    }

    /// Close the element; its children never change after this
    pub fn close(mut self) -> Element {
        self.flush_text();
        Element {
            name: self.name,
            text: None,
            attributes: self.attributes,
            children: self.children,
            stream_id: self.stream_id,
        }
    }
}
