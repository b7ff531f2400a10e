//! Incremental parser for the game's markup stream
//!
//! The server (through Lich) sends XML-ish markup with no alignment between
//! TCP chunks and tags. `StreamParser` keeps the nesting stack, the active
//! stream context and the unconsumed tail between calls, and drives
//! quick-xml over the complete prefix of each buffered chunk.

use crate::data::{Attributes, Element, ElementBuilder};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Largest unconsumed tail carried between calls
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Most input consumed while an element stays open before giving up on it
pub const MAX_OPEN_BYTES: usize = 256 * 1024;

/// Deepest allowed element nesting
pub const MAX_DEPTH: usize = 128;

/// Tag that is guaranteed well-formed once per turn; used to resynchronize
const RESYNC_TAG: &str = "<prompt";

const PROMPT: &str = "prompt";
const PUSH_STREAM: &str = "pushStream";
const POP_STREAM: &str = "popStream";

/// Recoverable parse failures. These are logged, never returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed markup at byte {offset}: {reason}")]
    Malformed { offset: u64, reason: String },

    #[error("mismatched end tag </{found}> at byte {offset} (open element is <{expected}>)")]
    MismatchedEnd {
        offset: u64,
        expected: String,
        found: String,
    },

    #[error("nesting deeper than {limit} at byte {offset}")]
    TooDeep { offset: u64, limit: usize },

    #[error("{what} exceeded {limit} bytes at byte {offset}")]
    Overflow {
        offset: u64,
        what: &'static str,
        limit: usize,
    },
}

impl ParseError {
    pub fn offset(&self) -> u64 {
        match self {
            Self::Malformed { offset, .. }
            | Self::MismatchedEnd { offset, .. }
            | Self::TooDeep { offset, .. }
            | Self::Overflow { offset, .. } => *offset,
        }
    }
}

/// Channel context opened by pushStream and closed by popStream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamContext {
    pub active_stream_id: Option<String>,
}

impl StreamContext {
    pub fn in_stream(&self) -> bool {
        self.active_stream_id.is_some()
    }
}

/// A parse error plus where in the current input the failing token starts
struct Failure {
    error: ParseError,
    token_start: usize,
}

/// Session-long parser state; one instance per connection
#[derive(Debug, Default)]
pub struct StreamParser {
    /// Open elements, outermost first
    stack: Vec<ElementBuilder>,
    stream: StreamContext,
    /// Unconsumed tail (partial tag or trailing text) from the previous call
    pending: String,
    /// Bytes consumed this session, for error offsets
    consumed: u64,
    /// Session offset where the outermost open element started
    open_since: Option<u64>,
    errors: u64,
    last_error: Option<ParseError>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the top-level elements completed by it, in
    /// document order
    pub fn parse(&mut self, chunk: &str) -> Vec<Element> {
        let mut input = std::mem::take(&mut self.pending);
        input.push_str(chunk);

        let cut = complete_prefix_len(&input);
        let mut elements = Vec::new();
        let mut start = 0;

        while start < cut {
            match self.run(&input[..cut], start, &mut elements) {
                Ok(()) => break,
                Err(failure) => {
                    self.recover(failure.error);
                    match find_resync(&input[..cut], failure.token_start) {
                        Some(pos) => {
                            tracing::debug!(
                                "Resynchronizing at prompt (byte {})",
                                self.consumed + pos as u64
                            );
                            start = pos;
                        }
                        None => break,
                    }
                }
            }
        }

        let tail = &input[cut..];
        if tail.len() > MAX_PENDING_BYTES {
            let offset = self.consumed + cut as u64;
            self.recover(ParseError::Overflow {
                offset,
                what: "unterminated input",
                limit: MAX_PENDING_BYTES,
            });
            self.consumed += input.len() as u64;
        } else {
            self.pending = tail.to_string();
            self.consumed += cut as u64;
        }

        match self.open_since {
            Some(since) if !self.stack.is_empty() => {
                if self.consumed.saturating_sub(since) > MAX_OPEN_BYTES as u64 {
                    let open = self.stack.first().map(|b| b.name().to_string());
                    tracing::debug!("Abandoning open element {:?}", open);
                    self.recover(ParseError::Overflow {
                        offset: self.consumed,
                        what: "open element",
                        limit: MAX_OPEN_BYTES,
                    });
                }
            }
            _ => self.open_since = None,
        }

        elements
    }

    /// Emit trailing top-level text held back waiting for markup
    ///
    /// Only text with no open tags is flushed; a partial tag stays buffered.
    pub fn flush(&mut self) -> Vec<Element> {
        if !self.stack.is_empty() || self.pending.is_empty() || self.pending.contains('<') {
            return Vec::new();
        }

        let raw = std::mem::take(&mut self.pending);
        self.consumed += raw.len() as u64;
        let text = match quick_xml::escape::unescape(&raw) {
            Ok(text) => text.into_owned(),
            Err(e) => {
                tracing::warn!("Flushing text with bad entity as-is: {}", e);
                raw
            }
        };
        vec![Element::text_run(text, self.stream.active_stream_id.clone())]
    }

    /// Forget all session state (call on disconnect)
    pub fn reset(&mut self) {
        if !self.stack.is_empty() || self.stream.in_stream() {
            tracing::debug!(
                "Resetting parser with {} open element(s), stream {:?}",
                self.stack.len(),
                self.stream.active_stream_id
            );
        }
        self.stack.clear();
        self.stream = StreamContext::default();
        self.pending.clear();
        self.consumed = 0;
        self.open_since = None;
    }

    /// Number of unmatched open tags (including a stream wrapper)
    pub fn open_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn stream_context(&self) -> &StreamContext {
        &self.stream
    }

    pub fn active_stream(&self) -> Option<&str> {
        self.stream.active_stream_id.as_deref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn error_count(&self) -> u64 {
        self.errors
    }

    pub fn last_error(&self) -> Option<&ParseError> {
        self.last_error.as_ref()
    }

    /// Parse `input[start..]`, which ends on a token boundary
    fn run(&mut self, input: &str, start: usize, out: &mut Vec<Element>) -> Result<(), Failure> {
        let mut reader = Reader::from_str(&input[start..]);
        let config = reader.config_mut();
        config.check_end_names = false;
        config.allow_unmatched_ends = true;
        config.expand_empty_elements = false;

        loop {
            let token_start = start + reader.buffer_position() as usize;
            let at = self.consumed + token_start as u64;
            let fail = |error: ParseError| Failure { error, token_start };

            let event = reader.read_event().map_err(|e| {
                fail(ParseError::Malformed {
                    offset: at,
                    reason: e.to_string(),
                })
            })?;

            match event {
                Event::Start(ref e) => self.on_start(e, false, at, out).map_err(fail)?,
                Event::Empty(ref e) => self.on_start(e, true, at, out).map_err(fail)?,
                Event::End(ref e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    self.on_end(&name, at, out).map_err(fail)?;
                }
                Event::Text(ref t) => {
                    let text = t.unescape().map_err(|e| {
                        fail(ParseError::Malformed {
                            offset: at,
                            reason: e.to_string(),
                        })
                    })?;
                    self.on_text(&text, out);
                }
                Event::CData(c) => {
                    let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                    self.on_text(&text, out);
                }
                Event::Eof => return Ok(()),
                // Comments, declarations and processing instructions carry no content
                _ => {}
            }
        }
    }

    fn on_start(
        &mut self,
        tag: &BytesStart,
        self_closing: bool,
        at: u64,
        out: &mut Vec<Element>,
    ) -> Result<(), ParseError> {
        // An unterminated quote lets the reader run on into the next tag
        if tag.contains(&b'<') {
            return Err(ParseError::Malformed {
                offset: at,
                reason: "'<' inside tag".to_string(),
            });
        }

        let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
        let attributes = read_attributes(tag).map_err(|reason| ParseError::Malformed {
            offset: at,
            reason,
        })?;

        // Every turn ends with a top-level prompt, so anything still open
        // besides a stream wrapper was never terminated
        if name == PROMPT && self.stack.iter().any(|b| !b.is_stream_wrapper()) {
            let open = self
                .stack
                .iter()
                .rev()
                .find(|b| !b.is_stream_wrapper())
                .map(|b| b.name().to_string())
                .unwrap_or_default();
            self.recover(ParseError::Malformed {
                offset: at,
                reason: format!("<{}> still open at prompt", open),
            });
        }

        match name.as_str() {
            // <pushStream id='speech'/>
            PUSH_STREAM => self.push_stream(attributes, at, out),
            // <popStream/>
            POP_STREAM => {
                self.pop_stream(out);
                Ok(())
            }
            _ => {
                let builder =
                    ElementBuilder::new(name, attributes, self.stream.active_stream_id.clone());
                if self_closing {
                    self.emit(builder.close(), out);
                    Ok(())
                } else {
                    self.open(builder, at)
                }
            }
        }
    }

    fn on_end(&mut self, name: &str, at: u64, out: &mut Vec<Element>) -> Result<(), ParseError> {
        match name {
            // </popStream> closes the stream like <popStream/>
            POP_STREAM => {
                self.pop_stream(out);
                return Ok(());
            }
            PUSH_STREAM => return Ok(()),
            _ => {}
        }

        let matching = self
            .stack
            .iter()
            .rposition(|b| !b.is_stream_wrapper() && b.name() == name);

        match matching {
            None => {
                tracing::debug!("Ignoring unmatched end tag </{}> at byte {}", name, at);
                Ok(())
            }
            Some(index) if index + 1 == self.stack.len() => {
                self.close_top(out);
                Ok(())
            }
            Some(_) => Err(ParseError::MismatchedEnd {
                offset: at,
                expected: self
                    .stack
                    .last()
                    .map(|b| b.name().to_string())
                    .unwrap_or_default(),
                found: name.to_string(),
            }),
        }
    }

    fn on_text(&mut self, text: &str, out: &mut Vec<Element>) {
        if text.is_empty() {
            return;
        }
        match self.stack.last_mut() {
            Some(parent) => parent.push_text(text),
            None => out.push(Element::text_run(
                text,
                self.stream.active_stream_id.clone(),
            )),
        }
    }

    fn push_stream(
        &mut self,
        attributes: Attributes,
        at: u64,
        out: &mut Vec<Element>,
    ) -> Result<(), ParseError> {
        let Some(id) = attributes.get("id").map(|s| s.to_string()) else {
            tracing::warn!("pushStream without id at byte {}, ignoring", at);
            return Ok(());
        };

        // A push inside an active stream replaces it: the current wrapper is
        // emitted and the new channel starts fresh.
        if let Some(previous) = self.stream.active_stream_id.clone() {
            tracing::debug!("pushStream '{}' replaces active stream '{}'", id, previous);
            self.close_stream(out);
        }

        self.open(ElementBuilder::stream_wrapper(&id), at)?;
        self.stream.active_stream_id = Some(id);
        Ok(())
    }

    fn pop_stream(&mut self, out: &mut Vec<Element>) {
        if !self.close_stream(out) {
            tracing::debug!("popStream with no active stream, ignoring");
        }
    }

    /// Close the innermost stream wrapper, implicitly closing anything opened
    /// inside it. Returns false when no stream is open.
    fn close_stream(&mut self, out: &mut Vec<Element>) -> bool {
        let Some(index) = self.stack.iter().rposition(|b| b.is_stream_wrapper()) else {
            self.stream = StreamContext::default();
            return false;
        };

        while self.stack.len() > index + 1 {
            if let Some(top) = self.stack.last() {
                tracing::debug!("Implicitly closing <{}> at end of stream", top.name());
            }
            self.close_top(out);
        }
        self.close_top(out);
        self.stream = StreamContext::default();
        true
    }

    fn open(&mut self, builder: ElementBuilder, at: u64) -> Result<(), ParseError> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(ParseError::TooDeep {
                offset: at,
                limit: MAX_DEPTH,
            });
        }
        if self.stack.is_empty() {
            self.open_since = Some(at);
        }
        self.stack.push(builder);
        Ok(())
    }

    fn close_top(&mut self, out: &mut Vec<Element>) {
        if let Some(builder) = self.stack.pop() {
            let element = builder.close();
            self.emit(element, out);
        }
    }

    /// Hand a closed element to its parent, or to the caller if top-level
    fn emit(&mut self, element: Element, out: &mut Vec<Element>) {
        match self.stack.last_mut() {
            Some(parent) => parent.push_child(element),
            None => out.push(element),
        }
    }

    fn recover(&mut self, error: ParseError) {
        tracing::warn!(
            "Parse error, discarding {} open element(s): {}",
            self.stack.len(),
            error
        );
        self.errors += 1;
        self.last_error = Some(error);
        self.stack.clear();
        self.stream = StreamContext::default();
        self.open_since = None;
    }
}

/// Lenient attribute reader: either quote style, unquoted or valueless
/// attributes, duplicate keys resolved last-write-wins
fn read_attributes(tag: &BytesStart) -> Result<Attributes, String> {
    let mut attributes = Attributes::new();
    let mut iter = tag.html_attributes();
    iter.with_checks(false);

    for attr in iter {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|e| e.to_string())?;
        attributes.insert(key, value.into_owned());
    }

    Ok(attributes)
}

/// Byte length of the prefix of `input` that ends on a complete tag
///
/// Quotes are honored inside tags so `>` in an attribute value does not end
/// the tag, but `<` always starts a new token (it cannot appear in a valid
/// attribute value), which keeps a broken tag from swallowing the rest.
fn complete_prefix_len(input: &str) -> usize {
    let mut cut = 0;
    let mut in_tag = false;
    let mut quote: Option<u8> = None;

    for (i, &b) in input.as_bytes().iter().enumerate() {
        match b {
            b'<' => {
                in_tag = true;
                quote = None;
            }
            b'"' | b'\'' if in_tag => {
                quote = match quote {
                    None => Some(b),
                    Some(q) if q == b => None,
                    open => open,
                };
            }
            b'>' if in_tag && quote.is_none() => {
                in_tag = false;
                cut = i + 1;
            }
            _ => {}
        }
    }

    cut
}

/// Position of the next prompt tag strictly after the failing token
fn find_resync(input: &str, token_start: usize) -> Option<usize> {
    let skip = input[token_start..]
        .chars()
        .next()
        .map(|c| c.len_utf8())
        .unwrap_or(0);
    let mut from = token_start + skip;

    while let Some(found) = input[from..].find(RESYNC_TAG) {
        let pos = from + found;
        let next = input[pos + RESYNC_TAG.len()..].chars().next();
        if matches!(next, Some(c) if c.is_whitespace() || c == '>' || c == '/') {
            return Some(pos);
        }
        from = pos + RESYNC_TAG.len();
    }

    None
}
