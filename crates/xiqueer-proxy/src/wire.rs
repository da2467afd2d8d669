//! HTTP/1.1 message framing.
//!
//! Just enough of HTTP/1.1 for a permissive proxy: a start line, an ordered
//! header list, and a body framed by `Content-Length` or chunked transfer
//! coding. Bodies are always fully buffered and re-emitted with a single
//! `Content-Length`, so a chunked message read here is never written back
//! chunked.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{ProxyError, Result};

/// Upper bound for a message head and for a single chunk-size line.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// A single header line, name and value trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Case-insensitive name comparison.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// A request or response read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Request line or status line, without CRLF.
    pub start_line: String,
    /// Headers in wire order; duplicates preserved.
    pub headers: Vec<Header>,
    /// Decoded body.
    pub body: Vec<u8>,
}

impl WireMessage {
    pub fn new(start_line: impl Into<String>, headers: Vec<Header>, body: Vec<u8>) -> Self {
        Self {
            start_line: start_line.into(),
            headers,
            body,
        }
    }

    /// Value of the first header named `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.is(name))
            .map(|h| h.value.as_str())
    }

    /// Number of headers named `name`.
    pub fn header_count(&self, name: &str) -> usize {
        self.headers.iter().filter(|h| h.is(name)).count()
    }

    /// Whether any `Transfer-Encoding` header declares chunked coding.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .iter()
            .any(|h| h.is("Transfer-Encoding") && declares_chunked(&h.value))
    }

    /// Serializes the message with a recomputed `Content-Length`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.start_line.len() + 64 * self.headers.len() + self.body.len() + 32);

        push_latin1(&mut out, &self.start_line);
        out.extend_from_slice(b"\r\n");

        for header in &self.headers {
            if header.is("Content-Length")
                || (header.is("Transfer-Encoding") && declares_chunked(&header.value))
            {
                continue;
            }
            push_latin1(&mut out, &header.name);
            out.extend_from_slice(b": ");
            push_latin1(&mut out, &header.value);
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Reads one message.
///
/// Returns `Ok(None)` when the stream ends before the first byte.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<WireMessage>>
where
    R: AsyncBufRead + Unpin,
{
    let head = match read_head(reader).await? {
        Some(head) => head,
        None => return Ok(None),
    };

    let (start_line, headers) = parse_head(&head);
    let mut message = WireMessage::new(start_line, headers, Vec::new());

    message.body = if message.is_chunked() {
        read_chunked_body(reader).await?
    } else if let Some(value) = message.header("Content-Length") {
        let length = value.trim().parse::<u64>().unwrap_or(0);
        read_exact_body(reader, length).await?
    } else {
        Vec::new()
    };

    Ok(Some(message))
}

async fn read_head<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();

    loop {
        let remaining = (MAX_HEAD_BYTES + 1 - head.len()) as u64;
        let read = (&mut *reader)
            .take(remaining)
            .read_until(b'\n', &mut head)
            .await?;

        if read == 0 {
            return if head.is_empty() {
                Ok(None)
            } else {
                Err(ProxyError::Truncated("message head"))
            };
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::HeaderTooLarge {
                limit: MAX_HEAD_BYTES,
            });
        }
        if head.ends_with(b"\r\n\r\n") {
            return Ok(Some(head));
        }
    }
}

fn parse_head(head: &[u8]) -> (String, Vec<Header>) {
    // ISO-8859-1 maps every byte to the code point of the same value
    let text: String = head.iter().map(|&b| char::from(b)).collect();

    let mut lines = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.is_empty());

    let start_line = lines.next().unwrap_or_default().to_string();
    let headers = lines
        .filter_map(|line| match line.find(':') {
            Some(idx) if idx > 0 => Some(Header::new(
                line[..idx].trim(),
                line[idx + 1..].trim(),
            )),
            _ => None,
        })
        .collect();

    (start_line, headers)
}

async fn read_exact_body<R>(reader: &mut R, length: u64) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    (&mut *reader).take(length).read_to_end(&mut body).await?;

    if (body.len() as u64) < length {
        return Err(ProxyError::Truncated("message body"));
    }
    Ok(body)
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();

    loop {
        let line = read_chunk_line(reader).await?;
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size_field, 16)
            .map_err(|_| ProxyError::MalformedChunk(format!("bad chunk size {:?}", size_field)))?;

        if size == 0 {
            // Single trailer line, normally the empty line ending the message
            read_chunk_line(reader).await?;
            return Ok(body);
        }

        let chunk = read_exact_body(reader, size).await?;
        body.extend_from_slice(&chunk);

        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .await
            .map_err(|e| ProxyError::from_read(e, "chunk terminator"))?;
    }
}

async fn read_chunk_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    (&mut *reader)
        .take(MAX_HEAD_BYTES as u64 + 1)
        .read_until(b'\n', &mut raw)
        .await?;

    match raw.last() {
        Some(b'\n') => {
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            Ok(raw.iter().map(|&b| char::from(b)).collect())
        }
        _ if raw.len() > MAX_HEAD_BYTES => Err(ProxyError::MalformedChunk(
            "chunk size line too long".to_string(),
        )),
        _ => Err(ProxyError::Truncated("chunk size line")),
    }
}

fn declares_chunked(value: &str) -> bool {
    value.to_ascii_lowercase().contains("chunked")
}

fn push_latin1(out: &mut Vec<u8>, text: &str) {
    out.extend(text.chars().map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?')));
}
