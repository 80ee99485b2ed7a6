//! Frame data model: parsed headers, content, and classification.

use std::fmt;

use indexmap::IndexMap;
use percent_encoding::percent_decode_str;

use crate::constants::{
    CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_COMMAND_REPLY, HEADER_CONTENT_TYPE, HEADER_EVENT_NAME,
    HEADER_REPLY_TEXT, TABLE_END_MARKER,
};

/// Ordered mapping of header names to values.
///
/// Names are case-normalized on insertion: lowercased, with `-` folded to
/// `_`, so `Content-Type` reads back as `content_type`. Insertion order is
/// preserved, and lookups normalize the queried name the same way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
    entries: IndexMap<String, String>,
}

impl HeaderMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a header name: lowercase, `-` → `_`.
    pub fn normalize(name: &str) -> String {
        name.trim().to_ascii_lowercase().replace('-', "_")
    }

    /// Insert a header, normalizing the name. A repeated name overwrites
    /// the earlier value.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries.insert(Self::normalize(name), value.into());
    }

    /// Look up a header by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(Self::normalize(name).as_str())
            .map(|s| s.as_str())
    }

    /// Whether a header is present.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(Self::normalize(name).as_str())
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize back to a wire header block, one `name: value` line per
    /// entry, without the terminating blank line.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

/// Content block of a frame after secondary parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// Plain text (the raw content contains no `:`).
    Text(String),
    /// Header-shaped content parsed into a nested map, e.g. an embedded
    /// event's own header block.
    Fields(HeaderMap),
}

/// Frame classification, derived from headers and content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Direct response to an `api` command (`content_type: api/response`).
    ApiResponse,
    /// Direct response to any other command (`content_type: command/reply`).
    CommandReply,
    /// Asynchronously pushed event, identified by an `event_name` content
    /// field.
    Event,
    /// Protocol control or unrecognized frame (auth challenge, disconnect
    /// notice, …).
    Other,
}

/// Reply-text classification per the wire protocol.
///
/// Commands return `+OK …` on success and `-ERR …` on failure. A handful
/// (`getvar`) return a bare value with no prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplyStatus {
    /// `reply_text` starts with `+OK` or is absent/empty.
    Ok,
    /// `reply_text` starts with `-ERR`.
    Err,
    /// `reply_text` present but matches neither prefix.
    Other,
}

/// One header-block-plus-optional-content unit exchanged over the
/// connection. Immutable after construction; consumed by the correlator
/// or the router and then discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    headers: HeaderMap,
    raw_content: String,
    content: Content,
}

impl Frame {
    /// Build a frame from an already-parsed header block and its raw
    /// content.
    ///
    /// Secondary content parsing happens here: content containing a `:`
    /// anywhere is parsed as a nested header block, anything else stays
    /// plain text. The colon sniff is inherited protocol behavior: free
    /// text that happens to contain a colon parses as fields, and
    /// [`raw_content`](Self::raw_content) keeps the untouched text for
    /// callers that want it.
    pub fn new(headers: HeaderMap, raw_content: String) -> Self {
        let content = if raw_content.contains(':') {
            Content::Fields(parse_content_fields(&raw_content))
        } else {
            Content::Text(raw_content.clone())
        };
        Self {
            headers,
            raw_content,
            content,
        }
    }

    /// The frame's header block.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Look up a header by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The unparsed content block.
    pub fn raw_content(&self) -> &str {
        &self.raw_content
    }

    /// The content block after secondary parsing.
    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Look up a field of header-shaped content. `None` for plain-text
    /// content or a missing field.
    pub fn content_field(&self, name: &str) -> Option<&str> {
        match &self.content {
            Content::Fields(fields) => fields.get(name),
            Content::Text(_) => None,
        }
    }

    /// Classification, computed from headers and content on every call.
    ///
    /// The event check runs first: an event frame carries its payload as a
    /// nested header block with an `event_name` field, and must never be
    /// mistaken for a command reply. Exactly one branch applies per frame.
    pub fn kind(&self) -> FrameKind {
        if self.content_field(HEADER_EVENT_NAME).is_some() {
            return FrameKind::Event;
        }
        match self.header(HEADER_CONTENT_TYPE) {
            Some(CONTENT_TYPE_API_RESPONSE) => FrameKind::ApiResponse,
            Some(CONTENT_TYPE_COMMAND_REPLY) => FrameKind::CommandReply,
            _ => FrameKind::Other,
        }
    }

    /// `content_type` header value.
    pub fn content_type(&self) -> Option<&str> {
        self.header(HEADER_CONTENT_TYPE)
    }

    /// Event name from the content fields, for [`FrameKind::Event`] frames.
    pub fn event_name(&self) -> Option<&str> {
        self.content_field(HEADER_EVENT_NAME)
    }

    /// Raw `reply_text` header value (e.g. `+OK`, `-ERR invalid command`).
    pub fn reply_text(&self) -> Option<&str> {
        self.header(HEADER_REPLY_TEXT)
    }

    /// Classification of the `reply_text` header.
    pub fn reply_status(&self) -> ReplyStatus {
        match self.reply_text() {
            None | Some("") => ReplyStatus::Ok,
            Some(t) if t.starts_with("+OK") => ReplyStatus::Ok,
            Some(t) if t.starts_with("-ERR") => ReplyStatus::Err,
            Some(_) => ReplyStatus::Other,
        }
    }

    /// Parse tabular "database-style" content: a `|`-delimited column
    /// header row, data rows, and a final `+OK` status line.
    ///
    /// Cells are consumed left-to-right against the column names, so a row
    /// with fewer cells than columns yields a partially-filled record
    /// (missing columns are absent) and extra cells are dropped. Returns
    /// an empty list when the trailing `+OK` line is missing or nothing
    /// precedes it.
    ///
    /// ```
    /// # use switchboard::{Frame, HeaderMap};
    /// let frame = Frame::new(HeaderMap::new(), "name|agents\nsupport|3\n+OK".into());
    /// let records = frame.db_records();
    /// assert_eq!(records.len(), 1);
    /// assert_eq!(records[0].get("name").map(String::as_str), Some("support"));
    /// ```
    pub fn db_records(&self) -> Vec<IndexMap<String, String>> {
        let mut lines: Vec<&str> = self.raw_content.split('\n').collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        if lines.pop() != Some(TABLE_END_MARKER) {
            return Vec::new();
        }
        if lines.is_empty() {
            return Vec::new();
        }

        let columns: Vec<&str> = lines.remove(0).split('|').collect();
        let mut records = Vec::with_capacity(lines.len());
        for line in lines {
            let mut cells = line.split('|');
            let mut record = IndexMap::new();
            for column in &columns {
                match cells.next() {
                    Some(cell) => {
                        record.insert((*column).to_string(), cell.to_string());
                    }
                    None => break,
                }
            }
            records.push(record);
        }
        records
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} frame", self.kind())?;
        if let Some(name) = self.event_name() {
            write!(f, " ({name})")?;
        }
        Ok(())
    }
}

/// Parse header-shaped content into a map.
///
/// Lenient, unlike the outer header block: lines without a `:` are skipped
/// (content is payload, not framing). Values are percent-decoded the way
/// the switch encodes event header values, falling back to the raw text on
/// invalid sequences.
fn parse_content_fields(raw: &str) -> HeaderMap {
    let mut fields = HeaderMap::new();
    for line in raw.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().is_empty() {
            continue;
        }
        let raw_value = value.trim_start().trim_end_matches(['\r', '\n']);
        let value = percent_decode_str(raw_value)
            .decode_utf8()
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| raw_value.to_string());
        fields.insert(name, value);
    }
    fields
}
