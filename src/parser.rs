//! Incremental frame extraction from the inbound byte stream.

use tracing::trace;

use crate::constants::{HEADER_CONTENT_LENGTH, MAX_BUFFER_SIZE, MAX_FRAME_SIZE};
use crate::error::{Error, Result};
use crate::frame::{Frame, HeaderMap};

/// Attempt to extract one complete frame from the start of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, never a partial frame.
/// On success, returns the frame and the number of bytes consumed so the
/// caller can trim its buffer.
///
/// The header block ends at the first blank line (`\n\n`). A
/// `content_length` header fixes the content block to exactly that many
/// bytes after it; without one, the content is empty. Content length is
/// taken from the raw bytes before any secondary content parsing.
///
/// A non-blank header line without a `:` separator is a fatal
/// [`Error::InvalidHeader`]: frame boundaries are ambiguous afterwards,
/// so the connection must be torn down rather than resynchronized.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    let Some(header_end) = find_header_terminator(buf) else {
        return Ok(None);
    };

    let header_str = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| Error::protocol("invalid UTF-8 in header block"))?;
    let headers = parse_header_block(header_str)?;

    let content_len = match headers.get(HEADER_CONTENT_LENGTH) {
        Some(raw) => {
            let len: usize = raw
                .trim()
                .parse()
                .map_err(|_| Error::protocol(format!("invalid content-length: {raw:?}")))?;
            if len > MAX_FRAME_SIZE {
                return Err(Error::protocol(format!(
                    "content-length {len} exceeds limit {MAX_FRAME_SIZE}"
                )));
            }
            len
        }
        None => 0,
    };

    let content_start = header_end + 2;
    let frame_end = content_start + content_len;
    if buf.len() < frame_end {
        return Ok(None);
    }

    let raw_content = std::str::from_utf8(&buf[content_start..frame_end])
        .map_err(|_| Error::protocol("invalid UTF-8 in content block"))?
        .to_string();

    Ok(Some((Frame::new(headers, raw_content), frame_end)))
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Parse a header block (without its terminating blank line) into a map.
fn parse_header_block(block: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in block.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::InvalidHeader {
                line: line.to_string(),
            });
        };
        headers.insert(name, value.trim_start().trim_end_matches(['\r', '\n']));
    }
    Ok(headers)
}

/// Stateful parser owning one connection's inbound buffer.
///
/// Feed bytes as they arrive, then drain complete frames with
/// [`next_frame`](Self::next_frame) until it reports that more bytes are
/// needed.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: Vec<u8>,
}

impl FrameParser {
    /// Create a parser with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_BUFFER_SIZE {
            return Err(Error::protocol(format!(
                "inbound buffer exceeds {MAX_BUFFER_SIZE} bytes without a frame boundary"
            )));
        }
        Ok(())
    }

    /// Extract the next complete frame, trimming the consumed bytes.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match parse_frame(&self.buf)? {
            Some((frame, consumed)) => {
                self.buf.drain(..consumed);
                trace!(consumed, buffered = self.buf.len(), "extracted frame");
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Bytes buffered while waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;

    #[test]
    fn test_parse_headers_only_frame() {
        let data = b"Content-Type: auth/request\n\n";
        let (frame, consumed) = parse_frame(data).unwrap().unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(frame.content_type(), Some("auth/request"));
        assert_eq!(frame.raw_content(), "");
    }

    #[test]
    fn test_parse_frame_with_content() {
        let data = b"Content-Type: api/response\nContent-Length: 2\n\nOK";
        let (frame, consumed) = parse_frame(data).unwrap().unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(frame.kind(), FrameKind::ApiResponse);
        assert_eq!(frame.raw_content(), "OK");
    }

    #[test]
    fn test_partial_header_block_needs_more() {
        let data = b"Content-Type: auth/requ";
        assert!(parse_frame(data).unwrap().is_none());
    }

    #[test]
    fn test_partial_content_needs_more() {
        let data = b"Content-Type: api/response\nContent-Length: 10\n\ntest";
        assert!(parse_frame(data).unwrap().is_none());
    }

    #[test]
    fn test_completing_bytes_yields_original_frame() {
        let full = b"Content-Type: api/response\nContent-Length: 5\n\nhello";
        let mut parser = FrameParser::new();
        for chunk in full.chunks(3) {
            parser.feed(chunk).unwrap();
        }
        // Feeding everything in tiny chunks must still produce the frame
        // that a single-shot parse would.
        let frame = parser.next_frame().unwrap().unwrap();
        let (expected, _) = parse_frame(full).unwrap().unwrap();
        assert_eq!(frame, expected);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_truncated_feeds_never_yield_a_frame() {
        let full = b"Content-Type: api/response\nContent-Length: 5\n\nhello";
        for cut in 1..full.len() {
            let mut parser = FrameParser::new();
            parser.feed(&full[..cut]).unwrap();
            assert!(
                parser.next_frame().unwrap().is_none(),
                "no frame expected from {cut} bytes"
            );
        }
    }

    #[test]
    fn test_malformed_header_line_is_fatal() {
        let data = b"Content-Type: auth/request\nbogus line without separator\n\n";
        let err = parse_frame(data).unwrap_err();
        assert!(
            matches!(err, Error::InvalidHeader { ref line } if line == "bogus line without separator")
        );
    }

    #[test]
    fn test_non_numeric_content_length_rejected() {
        let data = b"Content-Type: api/response\nContent-Length: abc\n\n";
        assert!(parse_frame(data).is_err());
    }

    #[test]
    fn test_oversized_content_length_rejected() {
        let data = format!(
            "Content-Type: api/response\nContent-Length: {}\n\n",
            MAX_FRAME_SIZE + 1
        );
        assert!(parse_frame(data.as_bytes()).is_err());
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut parser = FrameParser::new();
        parser
            .feed(b"Content-Type: auth/request\n\nContent-Type: api/response\nContent-Length: 2\n\nOK")
            .unwrap();

        let first = parser.next_frame().unwrap().unwrap();
        assert_eq!(first.content_type(), Some("auth/request"));

        let second = parser.next_frame().unwrap().unwrap();
        assert_eq!(second.content_type(), Some("api/response"));
        assert_eq!(second.raw_content(), "OK");

        assert!(parser.next_frame().unwrap().is_none());
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_crlf_line_endings_stripped_from_values() {
        let data = b"Content-Type: command/reply\r\nReply-Text: +OK\r\n\n";
        let (frame, _) = parse_frame(data).unwrap().unwrap();
        assert_eq!(frame.reply_text(), Some("+OK"));
    }

    #[test]
    fn test_header_round_trip() {
        let data = b"Content-Type: command/reply\nReply-Text: +OK accepted\nJob-UUID: abc-123\n\n";
        let (frame, _) = parse_frame(data).unwrap().unwrap();
        let wire = frame.headers().to_wire();
        let reparsed = parse_header_block(&wire).unwrap();
        assert_eq!(frame.headers(), &reparsed);
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let data = b"Content-Type: api/response\xff\n\n";
        assert!(parse_frame(data).is_err());
    }
}
