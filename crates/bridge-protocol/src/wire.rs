//! HTTP/1.1 wire framing for tunneled Runtime API exchanges.
//!
//! The bridge carries whole HTTP requests and responses as message bodies:
//! a head in standard HTTP/1.1 syntax followed by the body, framed with
//! `Content-Length` when the length is known and chunked transfer encoding
//! otherwise. This preserves streaming semantics end to end without a
//! request/response queue primitive.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, ReadBuf};

use crate::error::{Error, Result};
use crate::writer::BridgeWriter;

/// Cap on a single head line; anything longer is treated as malformed.
const MAX_LINE: usize = 64 * 1024;

/// Copy granularity for body streaming.
const COPY_BUF: usize = 16 * 1024;

/// Head of a tunneled request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
}

/// Head of a tunneled response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Writes a request head and streams its body through `writer`.
///
/// The body is framed by `Content-Length` when the head carries one,
/// otherwise chunked transfer encoding is applied.
pub async fn write_request<B>(
    writer: &mut BridgeWriter,
    head: &RequestHead,
    body: &mut B,
) -> Result<()>
where
    B: AsyncRead + Unpin,
{
    let chunked = needs_chunked(&head.headers);
    let mut text = Vec::with_capacity(256);
    text.extend_from_slice(format!("{} {} HTTP/1.1\r\n", head.method, head.path).as_bytes());
    write_headers(&mut text, &head.headers, chunked);
    writer.write(&text).await?;
    copy_body(writer, body, chunked).await
}

/// Writes a response head and streams its body through `writer`.
pub async fn write_response<B>(
    writer: &mut BridgeWriter,
    head: &ResponseHead,
    body: &mut B,
) -> Result<()>
where
    B: AsyncRead + Unpin,
{
    let chunked = needs_chunked(&head.headers);
    let mut text = Vec::with_capacity(256);
    let reason = head.status.canonical_reason().unwrap_or("Unknown");
    text.extend_from_slice(
        format!("HTTP/1.1 {} {}\r\n", head.status.as_u16(), reason).as_bytes(),
    );
    write_headers(&mut text, &head.headers, chunked);
    writer.write(&text).await?;
    copy_body(writer, body, chunked).await
}

fn needs_chunked(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::CONTENT_LENGTH) {
        return false;
    }
    !headers
        .get(header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn write_headers(text: &mut Vec<u8>, headers: &HeaderMap, add_chunked: bool) {
    for (name, value) in headers.iter() {
        text.extend_from_slice(name.as_str().as_bytes());
        text.extend_from_slice(b": ");
        text.extend_from_slice(value.as_bytes());
        text.extend_from_slice(b"\r\n");
    }
    if add_chunked {
        text.extend_from_slice(b"transfer-encoding: chunked\r\n");
    }
    text.extend_from_slice(b"\r\n");
}

async fn copy_body<B>(writer: &mut BridgeWriter, body: &mut B, chunked: bool) -> Result<()>
where
    B: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        let n = body.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if chunked {
            writer.write(format!("{n:x}\r\n").as_bytes()).await?;
            writer.write(&buf[..n]).await?;
            writer.write(b"\r\n").await?;
        } else {
            writer.write(&buf[..n]).await?;
        }
    }
    if chunked {
        writer.write(b"0\r\n\r\n").await?;
    }
    Ok(())
}

/// Parses a request head and returns it with a body reader.
pub async fn read_request<R>(mut reader: R) -> Result<(RequestHead, WireBody<R>)>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_head_line(&mut reader).await?;
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .and_then(|m| m.parse::<Method>().ok())
        .ok_or_else(|| Error::InvalidHttp(format!("bad request line: {line}")))?;
    let path = parts
        .next()
        .ok_or_else(|| Error::InvalidHttp(format!("bad request line: {line}")))?
        .to_string();

    let headers = read_headers(&mut reader).await?;
    let mode = match framed_mode(&headers)? {
        Some(mode) => mode,
        // A request without framing headers has no body.
        None => Mode::Done,
    };
    Ok((
        RequestHead {
            method,
            path,
            headers,
        },
        WireBody::new(reader, mode),
    ))
}

/// Parses a response head and returns it with a body reader.
///
/// Responses without framing headers are read to end-of-stream, which in
/// bridge terms is the final packet of the message.
pub async fn read_response<R>(mut reader: R) -> Result<(ResponseHead, WireBody<R>)>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_head_line(&mut reader).await?;
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") {
        return Err(Error::InvalidHttp(format!("bad status line: {line}")));
    }
    let status = parts
        .next()
        .and_then(|s| StatusCode::from_bytes(s.as_bytes()).ok())
        .ok_or_else(|| Error::InvalidHttp(format!("bad status line: {line}")))?;

    let headers = read_headers(&mut reader).await?;
    let mode = match framed_mode(&headers)? {
        Some(mode) => mode,
        None if has_no_body(status) => Mode::Done,
        None => Mode::UntilEof,
    };
    Ok((ResponseHead { status, headers }, WireBody::new(reader, mode)))
}

fn has_no_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn framed_mode(headers: &HeaderMap) -> Result<Option<Mode>> {
    if let Some(value) = headers.get(header::CONTENT_LENGTH) {
        let length = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::InvalidHttp("bad content-length".to_string()))?;
        return Ok(Some(if length == 0 {
            Mode::Done
        } else {
            Mode::Exact { remaining: length }
        }));
    }
    if headers
        .get(header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        return Ok(Some(Mode::Chunked(Chunk::Size)));
    }
    Ok(None)
}

async fn read_head_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;
    let mut line = String::new();
    let n = reader.take(MAX_LINE as u64).read_line(&mut line).await?;
    if n == 0 {
        return Err(Error::InvalidHttp("unexpected end of stream".to_string()));
    }
    if !line.ends_with('\n') && n >= MAX_LINE {
        return Err(Error::InvalidHttp("head line too long".to_string()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn read_headers<R>(reader: &mut R) -> Result<HeaderMap>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();
    loop {
        let line = read_head_line(reader).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidHttp(format!("bad header line: {line}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| Error::InvalidHttp(format!("bad header name: {name}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| Error::InvalidHttp(format!("bad header value for {name}")))?;
        headers.append(name, value);
    }
}

#[derive(Debug)]
enum Mode {
    Exact { remaining: u64 },
    Chunked(Chunk),
    UntilEof,
    Done,
}

#[derive(Debug)]
enum Chunk {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailer,
}

/// Body of a parsed wire message.
///
/// Honors `Content-Length`, chunked transfer encoding, or read-to-EOF
/// depending on the head it was parsed with.
pub struct WireBody<R> {
    reader: R,
    mode: Mode,
    line: Vec<u8>,
}

impl<R> WireBody<R> {
    fn new(reader: R, mode: Mode) -> Self {
        Self {
            reader,
            mode,
            line: Vec::new(),
        }
    }
}

/// Accumulates bytes into `line` until a `\n` lands. Ready when the line is
/// complete.
fn poll_line<R>(
    mut reader: Pin<&mut R>,
    line: &mut Vec<u8>,
    cx: &mut Context<'_>,
) -> Poll<std::io::Result<()>>
where
    R: AsyncBufRead,
{
    loop {
        let buf = ready!(reader.as_mut().poll_fill_buf(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside chunked framing",
            )));
        }
        if line.len() + buf.len() > MAX_LINE {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "chunk line too long",
            )));
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                line.extend_from_slice(&buf[..=pos]);
                reader.as_mut().consume(pos + 1);
                return Poll::Ready(Ok(()));
            }
            None => {
                line.extend_from_slice(buf);
                let n = buf.len();
                reader.as_mut().consume(n);
            }
        }
    }
}

impl<R> AsyncRead for WireBody<R>
where
    R: AsyncBufRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.mode {
                Mode::Done => return Poll::Ready(Ok(())),
                Mode::Exact { remaining } => {
                    let buf = ready!(Pin::new(&mut this.reader).poll_fill_buf(cx))?;
                    if buf.is_empty() {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "stream ended before content-length was satisfied",
                        )));
                    }
                    let n = buf
                        .len()
                        .min(*remaining as usize)
                        .min(out.remaining());
                    if n == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    out.put_slice(&buf[..n]);
                    Pin::new(&mut this.reader).consume(n);
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        this.mode = Mode::Done;
                    }
                    return Poll::Ready(Ok(()));
                }
                Mode::UntilEof => {
                    let buf = ready!(Pin::new(&mut this.reader).poll_fill_buf(cx))?;
                    if buf.is_empty() {
                        this.mode = Mode::Done;
                        return Poll::Ready(Ok(()));
                    }
                    let n = buf.len().min(out.remaining());
                    if n == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    out.put_slice(&buf[..n]);
                    Pin::new(&mut this.reader).consume(n);
                    return Poll::Ready(Ok(()));
                }
                Mode::Chunked(chunk) => match chunk {
                    Chunk::Size => {
                        ready!(poll_line(Pin::new(&mut this.reader), &mut this.line, cx))?;
                        let text = String::from_utf8_lossy(&this.line);
                        let size_token = text.trim().split(';').next().unwrap_or("").to_string();
                        this.line.clear();
                        let size = u64::from_str_radix(&size_token, 16).map_err(|_| {
                            std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                format!("bad chunk size: {size_token}"),
                            )
                        })?;
                        this.mode = if size == 0 {
                            Mode::Chunked(Chunk::Trailer)
                        } else {
                            Mode::Chunked(Chunk::Data { remaining: size })
                        };
                    }
                    Chunk::Data { remaining } => {
                        let buf = ready!(Pin::new(&mut this.reader).poll_fill_buf(cx))?;
                        if buf.is_empty() {
                            return Poll::Ready(Err(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "stream ended inside a chunk",
                            )));
                        }
                        let n = buf
                            .len()
                            .min(*remaining as usize)
                            .min(out.remaining());
                        if n == 0 {
                            return Poll::Ready(Ok(()));
                        }
                        out.put_slice(&buf[..n]);
                        Pin::new(&mut this.reader).consume(n);
                        *remaining -= n as u64;
                        if *remaining == 0 {
                            this.mode = Mode::Chunked(Chunk::DataEnd);
                        }
                        return Poll::Ready(Ok(()));
                    }
                    Chunk::DataEnd => {
                        ready!(poll_line(Pin::new(&mut this.reader), &mut this.line, cx))?;
                        this.line.clear();
                        this.mode = Mode::Chunked(Chunk::Size);
                    }
                    Chunk::Trailer => {
                        ready!(poll_line(Pin::new(&mut this.reader), &mut this.line, cx))?;
                        let done = this.line.iter().all(|&b| b == b'\r' || b == b'\n');
                        this.line.clear();
                        if done {
                            this.mode = Mode::Done;
                            return Poll::Ready(Ok(()));
                        }
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    async fn parse_response(raw: &[u8]) -> (ResponseHead, Vec<u8>) {
        let (head, mut body) = read_response(BufReader::new(raw)).await.unwrap();
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        (head, out)
    }

    #[tokio::test]
    async fn parses_content_length_response() {
        let raw = b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\n\r\n{\"ok\":true}";
        let (head, body) = parse_response(raw).await;
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.headers["content-type"], "application/json");
        assert_eq!(body, b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn parses_chunked_response() {
        let raw = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let (head, body) = parse_response(raw).await;
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn parses_response_without_framing_to_eof() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\npayload until eof";
        let (_, body) = parse_response(raw).await;
        assert_eq!(body, b"payload until eof");
    }

    #[tokio::test]
    async fn parses_request_with_body() {
        let raw =
            b"POST /2018-06-01/runtime/invocation/abc/response HTTP/1.1\r\ncontent-length: 4\r\n\r\nbody";
        let (head, mut body) = read_request(BufReader::new(&raw[..])).await.unwrap();
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.path, "/2018-06-01/runtime/invocation/abc/response");
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"body");
    }

    #[tokio::test]
    async fn request_without_framing_has_empty_body() {
        let raw = b"GET /2018-06-01/runtime/invocation/next HTTP/1.1\r\naccept: */*\r\n\r\n";
        let (head, mut body) = read_request(BufReader::new(&raw[..])).await.unwrap();
        assert_eq!(head.method, Method::GET);
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn truncated_content_length_is_an_error() {
        let raw = b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nshort";
        let (_, mut body) = read_response(BufReader::new(&raw[..])).await.unwrap();
        let mut out = Vec::new();
        let err = body.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn malformed_status_line_is_rejected() {
        let raw = b"garbage\r\n\r\n";
        assert!(read_response(BufReader::new(&raw[..])).await.is_err());
    }
}
