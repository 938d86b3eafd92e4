//! Incremental XMPP stream framing.
//!
//! A TCP read never lines up with stanza boundaries: one read may carry half
//! a stanza, or three. [`FrameReader`] accumulates bytes across reads and
//! yields one complete top-level element at a time, plus the stream header
//! and the closing `</stream:stream>` as distinct frames.

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Maximum size of buffered data that does not yet form a complete frame.
///
/// Typical stanzas are a few KB. Anything that grows past this without
/// closing is either malicious or a broken server.
pub const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The server's `<stream:stream ...>` opening tag (raw text).
    StreamOpen(String),
    /// The server's `</stream:stream>`.
    StreamClose,
    /// One complete top-level element (raw text).
    Element(String),
}

/// Outcome of a single extraction attempt over a byte buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Extracted {
    /// A complete frame and the number of bytes it consumed.
    Frame(Frame, usize),
    /// Not enough data yet.
    Incomplete,
    /// Malformed XML. `skip` bytes should be dropped before retrying.
    Malformed { detail: String, skip: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    /// Between stanzas, or before the stream header.
    Idle,
    /// Inside a top-level stanza.
    InStanza,
}

fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn is_stream_tag(qname: &[u8], local_name: &[u8]) -> bool {
    qname == b"stream:stream" || local_name == b"stream"
}

/// Whether a quick-xml error only means the input stops mid-construct.
fn is_truncation(err: &quick_xml::Error) -> bool {
    matches!(
        err,
        quick_xml::Error::Syntax(
            SyntaxError::UnclosedTag
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedPIOrXmlDecl
                | SyntaxError::UnclosedDoctype
        )
    )
}

/// Extract the first complete frame from `buffer`.
pub fn extract_frame(buffer: &[u8]) -> Extracted {
    // `</stream:stream>` shows up without its opening tag in the buffer.
    let first = buffer.iter().position(|b| !b.is_ascii_whitespace());
    if let Some(start) = first {
        if buffer[start..].starts_with(b"</stream:stream>") {
            return Extracted::Frame(Frame::StreamClose, start + b"</stream:stream>".len());
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut stanza_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                if state == ParserState::Idle
                    && is_stream_tag(e.name().as_ref(), e.name().local_name().as_ref())
                {
                    let tag_end = reader.buffer_position() as usize;
                    return Extracted::Frame(
                        Frame::StreamOpen(bytes_to_string(&buffer[pos..tag_end])),
                        tag_end,
                    );
                }

                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InStanza;
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if state == ParserState::Idle && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    if is_stream_tag(e.name().as_ref(), e.name().local_name().as_ref()) {
                        return Extracted::Frame(
                            Frame::StreamOpen(bytes_to_string(&buffer[pos..tag_end])),
                            tag_end,
                        );
                    }
                    return Extracted::Frame(
                        Frame::Element(bytes_to_string(&buffer[pos..tag_end])),
                        tag_end,
                    );
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if depth == 0 && is_stream_tag(e.name().as_ref(), e.name().local_name().as_ref()) {
                    return Extracted::Frame(Frame::StreamClose, reader.buffer_position() as usize);
                }

                depth = depth.saturating_sub(1);
                if state == ParserState::InStanza && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Extracted::Frame(
                        Frame::Element(bytes_to_string(&buffer[stanza_start..tag_end])),
                        tag_end,
                    );
                }
            }
            Ok(Event::Eof) => return Extracted::Incomplete,
            Err(e) if is_truncation(&e) => return Extracted::Incomplete,
            Err(e) => {
                let skip = (reader.buffer_position() as usize).clamp(1, buffer.len().max(1));
                return Extracted::Malformed {
                    detail: e.to_string(),
                    skip,
                };
            }
        }
    }
}

/// Buffered frame reader. Owns only the pending bytes, so it survives the
/// socket being split into halves once the session starts.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet framed.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Return the next frame already in the buffer, if any. Malformed data
    /// is skipped and reported as `StanzaDecode`.
    pub fn try_next(&mut self) -> Result<Option<Frame>> {
        match extract_frame(&self.buffer) {
            Extracted::Frame(frame, consumed) => {
                self.buffer.drain(..consumed);
                Ok(Some(frame))
            }
            Extracted::Incomplete => {
                if self.buffer.iter().all(u8::is_ascii_whitespace) {
                    // Whitespace keepalives between stanzas.
                    self.buffer.clear();
                }
                Ok(None)
            }
            Extracted::Malformed { detail, skip } => {
                warn!(skip, error = %detail, "Dropping malformed XML from stream");
                self.buffer.drain(..skip.min(self.buffer.len()));
                Err(Error::StanzaDecode(detail))
            }
        }
    }

    /// Read until a complete frame is available.
    ///
    /// A clean EOF and the buffer cap both surface as `TransportRead`.
    pub async fn next_frame<R>(&mut self, reader: &mut R) -> Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.try_next()? {
                return Ok(frame);
            }
            if self.buffer.len() > MAX_STANZA_BUFFER_SIZE {
                return Err(Error::TransportRead(format!(
                    "incomplete stanza exceeds {MAX_STANZA_BUFFER_SIZE} bytes"
                )));
            }

            let n = reader
                .read(&mut chunk)
                .await
                .map_err(|e| Error::TransportRead(e.to_string()))?;
            if n == 0 {
                return Err(Error::TransportRead("connection closed".to_string()));
            }
            debug!(target: "fluux_client::transport", bytes = n, "recv");
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}
