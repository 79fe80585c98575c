//! Wire protocol between portal clients and the portal server.
//!
//! Two primitives travel over the stream, both big-endian:
//! - a raw 4-byte signed integer
//! - a string list: `outer_length:i32`, then `outer_length` bytes holding
//!   `count:i32` followed by `count` entries of `(len:i32, len bytes of UTF-8)`
//!
//! The outer length bounds how much a reader pulls for one frame; the body
//! buffer only grows with bytes that actually arrive. A full exchange is one
//! string-list frame from the client (the request), then one integer (status)
//! and one two-element string-list frame (`[stdout, stderr]`) from the server.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::PortalError;

/// Size of every length and count prefix.
const PREFIX_LEN: usize = 4;

fn map_eof(e: std::io::Error) -> PortalError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        PortalError::TruncatedStream
    } else {
        PortalError::Io(e)
    }
}

/// Read exactly four bytes as a signed integer.
pub async fn read_i32<R: AsyncRead + Unpin>(reader: &mut R) -> crate::Result<i32> {
    reader.read_i32().await.map_err(map_eof)
}

/// Write exactly four bytes.
pub async fn write_i32<W: AsyncWrite + Unpin>(writer: &mut W, value: i32) -> crate::Result<()> {
    writer.write_i32(value).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one string-list frame.
pub async fn read_strings<R: AsyncRead + Unpin>(reader: &mut R) -> crate::Result<Vec<String>> {
    let outer = read_i32(reader).await?;
    read_body(reader, outer).await
}

/// Like [`read_strings`], but a stream that closes before its first byte yields `None`.
pub async fn read_strings_if_any<R>(reader: &mut R) -> crate::Result<Option<Vec<String>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_LEN];
    let first = reader.read(&mut prefix).await?;
    if first == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut prefix[first..])
        .await
        .map_err(map_eof)?;
    read_body(reader, i32::from_be_bytes(prefix)).await.map(Some)
}

async fn read_body<R: AsyncRead + Unpin>(reader: &mut R, outer: i32) -> crate::Result<Vec<String>> {
    let outer = usize::try_from(outer)
        .map_err(|_| PortalError::MalformedFrame(format!("negative frame length {outer}")))?;
    if outer < PREFIX_LEN {
        return Err(PortalError::MalformedFrame(format!(
            "frame length {outer} cannot hold an item count"
        )));
    }

    let mut body = Vec::new();
    reader.take(outer as u64).read_to_end(&mut body).await?;
    if body.len() < outer {
        return Err(PortalError::TruncatedStream);
    }
    decode_strings(&body)
}

/// Write one string-list frame; returns once the whole frame is written.
pub async fn write_strings<W, S>(writer: &mut W, strings: &[S]) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
    S: AsRef<str>,
{
    let frame = encode_strings(strings)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode a string list including its outer length prefix.
pub fn encode_strings<S: AsRef<str>>(strings: &[S]) -> crate::Result<Vec<u8>> {
    let body_len = PREFIX_LEN
        + strings
            .iter()
            .map(|s| PREFIX_LEN + s.as_ref().len())
            .sum::<usize>();
    let outer = i32::try_from(body_len).map_err(|_| PortalError::FrameTooLarge(body_len))?;
    let count = i32::try_from(strings.len()).map_err(|_| PortalError::FrameTooLarge(body_len))?;

    let mut frame = Vec::with_capacity(PREFIX_LEN + body_len);
    frame.extend_from_slice(&outer.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    for s in strings {
        let bytes = s.as_ref().as_bytes();
        // Fits: each item is bounded by the already-checked total.
        frame.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
        frame.extend_from_slice(bytes);
    }
    Ok(frame)
}

/// Decode a frame body (everything after the outer length).
pub fn decode_strings(body: &[u8]) -> crate::Result<Vec<String>> {
    let mut cursor = Cursor { buf: body, pos: 0 };
    let count = cursor.length("item count")?;
    // Every entry needs at least its own prefix, so cap the preallocation.
    let mut strings = Vec::with_capacity(count.min(body.len() / PREFIX_LEN));
    for index in 0..count {
        let len = cursor.length("item length")?;
        let bytes = cursor.take(len).ok_or_else(|| {
            PortalError::MalformedFrame(format!("item {index} overruns the frame"))
        })?;
        let s = String::from_utf8(bytes.to_vec())
            .map_err(|e| PortalError::MalformedFrame(format!("item {index}: {e}")))?;
        strings.push(s);
    }
    if cursor.pos != body.len() {
        return Err(PortalError::MalformedFrame(format!(
            "{} trailing bytes after {count} items",
            body.len() - cursor.pos
        )));
    }
    Ok(strings)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn length(&mut self, what: &str) -> crate::Result<usize> {
        let raw = self
            .take(PREFIX_LEN)
            .ok_or_else(|| PortalError::MalformedFrame(format!("missing {what}")))?;
        let value = i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        usize::try_from(value)
            .map_err(|_| PortalError::MalformedFrame(format!("negative {what} {value}")))
    }
}

/// A tool invocation: the tool name followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub tool: String,
    pub args: Vec<String>,
}

impl Request {
    pub fn new(tool: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }

    /// Build a request from a decoded frame; element 0 is the tool name.
    pub fn from_strings(mut strings: Vec<String>) -> crate::Result<Self> {
        if strings.is_empty() {
            return Err(PortalError::EmptyRequest);
        }
        let tool = strings.remove(0);
        Ok(Self {
            tool,
            args: strings,
        })
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> crate::Result<Self> {
        Self::from_strings(read_strings(reader).await?)
    }

    /// Read a request, or `None` if the peer hung up without sending anything.
    pub async fn read_if_any<R: AsyncRead + Unpin>(reader: &mut R) -> crate::Result<Option<Self>> {
        match read_strings_if_any(reader).await? {
            Some(strings) => Self::from_strings(strings).map(Some),
            None => Ok(None),
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> crate::Result<()> {
        let mut strings = Vec::with_capacity(self.args.len() + 1);
        strings.push(self.tool.as_str());
        strings.extend(self.args.iter().map(String::as_str));
        write_strings(writer, &strings).await
    }
}

/// Outcome of one tool invocation, output fully buffered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Response {
    /// Status plus a single diagnostic line on stderr.
    pub fn failure(status: i32, message: impl std::fmt::Display) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: format!("{message}\n"),
        }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> crate::Result<Self> {
        let status = read_i32(reader).await?;
        let strings = read_strings(reader).await?;
        let [stdout, stderr]: [String; 2] = strings.try_into().map_err(|v: Vec<String>| {
            PortalError::MalformedFrame(format!("expected 2 output streams, got {}", v.len()))
        })?;
        Ok(Self {
            status,
            stdout,
            stderr,
        })
    }

    /// Status and both outputs as one contiguous write.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> crate::Result<()> {
        let mut buf = self.status.to_be_bytes().to_vec();
        buf.extend(encode_strings(&[&self.stdout, &self.stderr])?);
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn round_trip(list: Vec<String>) -> Vec<String> {
        let (mut a, mut b) = duplex(64 * 1024);
        write_strings(&mut a, &list).await.unwrap();
        read_strings(&mut b).await.unwrap()
    }

    #[tokio::test]
    async fn test_string_list_round_trip() {
        let cases = vec![
            vec![],
            vec![String::new()],
            vec!["javac".to_string(), "-d".to_string(), "out".to_string()],
            vec!["dup".to_string(), "dup".to_string(), String::new()],
            vec!["ünïcødé ✓".to_string(), "tab\tnew\nline\0nul".to_string()],
        ];
        for list in cases {
            assert_eq!(round_trip(list.clone()).await, list);
        }
    }

    #[tokio::test]
    async fn test_i32_round_trip_extremes() {
        let (mut a, mut b) = duplex(64);
        for n in [0, 1, -1, i32::MIN, i32::MAX, 127] {
            write_i32(&mut a, n).await.unwrap();
            assert_eq!(read_i32(&mut b).await.unwrap(), n);
        }
    }

    #[test]
    fn test_encode_layout() {
        let frame = encode_strings(&["ab", ""]).unwrap();
        // outer = 4 (count) + (4 + 2) + (4 + 0)
        assert_eq!(
            frame,
            vec![0, 0, 0, 14, 0, 0, 0, 2, 0, 0, 0, 2, b'a', b'b', 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn test_read_i32_truncated() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);
        assert!(matches!(
            read_i32(&mut b).await,
            Err(PortalError::TruncatedStream)
        ));
    }

    #[tokio::test]
    async fn test_read_strings_truncated_body() {
        let (mut a, mut b) = duplex(64);
        // Declares 100 bytes but delivers 8 before closing
        a.write_all(&[0, 0, 0, 100, 0, 0, 0, 1, 0, 0, 0, 5])
            .await
            .unwrap();
        drop(a);
        assert!(matches!(
            read_strings(&mut b).await,
            Err(PortalError::TruncatedStream)
        ));
    }

    #[tokio::test]
    async fn test_huge_declared_length_with_short_body() {
        let (mut a, mut b) = duplex(64);
        // "GET " read as a length is over a gigabyte; only a few bytes follow
        a.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(a);
        assert!(matches!(
            read_strings(&mut b).await,
            Err(PortalError::TruncatedStream)
        ));
    }

    #[tokio::test]
    async fn test_request_absent_when_peer_sends_nothing() {
        let (a, mut b) = duplex(64);
        drop(a);
        assert_eq!(Request::read_if_any(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_request_split_prefix_is_still_read() {
        let (mut a, mut b) = duplex(64);
        let frame = encode_strings(&["echo", "hi"]).unwrap();
        let reader = tokio::spawn(async move { Request::read_if_any(&mut b).await });
        // Deliver the length prefix one byte at a time
        for byte in &frame[..PREFIX_LEN] {
            a.write_all(&[*byte]).await.unwrap();
            tokio::task::yield_now().await;
        }
        a.write_all(&frame[PREFIX_LEN..]).await.unwrap();
        let request = reader.await.unwrap().unwrap();
        assert_eq!(request, Some(Request::new("echo", vec!["hi".to_string()])));
    }

    #[tokio::test]
    async fn test_partial_prefix_is_truncated() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);
        assert!(matches!(
            Request::read_if_any(&mut b).await,
            Err(PortalError::TruncatedStream)
        ));
    }

    #[tokio::test]
    async fn test_read_strings_negative_length() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&(-8i32).to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_strings(&mut b).await,
            Err(PortalError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_item_overrun() {
        // count 1, item claims 10 bytes, only 2 present
        let body = [0, 0, 0, 1, 0, 0, 0, 10, b'h', b'i'];
        assert!(matches!(
            decode_strings(&body),
            Err(PortalError::MalformedFrame(msg)) if msg.contains("overruns")
        ));
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let body = [0, 0, 0, 0, 0xff];
        assert!(matches!(
            decode_strings(&body),
            Err(PortalError::MalformedFrame(msg)) if msg.contains("trailing")
        ));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let body = [0, 0, 0, 1, 0, 0, 0, 2, 0xc3, 0x28];
        assert!(matches!(
            decode_strings(&body),
            Err(PortalError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_request_from_empty_frame() {
        assert!(matches!(
            Request::from_strings(vec![]),
            Err(PortalError::EmptyRequest)
        ));
    }

    #[tokio::test]
    async fn test_request_and_response_exchange() {
        let (mut client, mut server) = duplex(4096);
        let request = Request::new("echo", vec!["hello".to_string()]);
        request.write_to(&mut client).await.unwrap();
        assert_eq!(Request::read_from(&mut server).await.unwrap(), request);

        let response = Response {
            status: 3,
            stdout: "hello\n".to_string(),
            stderr: "warning\n".to_string(),
        };
        response.write_to(&mut server).await.unwrap();
        assert_eq!(Response::read_from(&mut client).await.unwrap(), response);
    }

    #[tokio::test]
    async fn test_response_with_wrong_arity() {
        let (mut a, mut b) = duplex(256);
        write_i32(&mut a, 0).await.unwrap();
        write_strings(&mut a, &["only-stdout"]).await.unwrap();
        assert!(matches!(
            Response::read_from(&mut b).await,
            Err(PortalError::MalformedFrame(msg)) if msg.contains("got 1")
        ));
    }
}
