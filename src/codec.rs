//! Content-Length framing over a duplex byte transport.
//!
//! Every message travels as `Content-Length: N\r\n\r\n{json}`. The framing
//! layer knows nothing about message semantics — it hands complete
//! `serde_json::Value` frames up and writes them back down.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single message body (8 MiB). Guards against a peer
/// declaring an absurd Content-Length.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Reads framed messages from an async byte stream.
pub struct MessageReader<R> {
    input: BufReader<R>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: BufReader::new(input),
        }
    }

    /// Read the next message.
    ///
    /// `Ok(None)` means the peer closed the stream between messages; EOF
    /// anywhere inside a frame is an error, as are malformed headers.
    pub async fn recv(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(length) = self.read_content_length().await? else {
            return Ok(None);
        };
        if length > MAX_BODY_BYTES {
            bail!("declared body of {length} bytes exceeds the {MAX_BODY_BYTES} byte limit");
        }

        let mut body = vec![0u8; length];
        self.input
            .read_exact(&mut body)
            .await
            .context("reading message body")?;
        let frame = serde_json::from_slice(&body).context("decoding message body")?;
        Ok(Some(frame))
    }

    /// Consume header lines up to the blank separator and return the
    /// Content-Length value, or `None` on clean EOF before any header byte.
    async fn read_content_length(&mut self) -> Result<Option<usize>> {
        let mut length: Option<usize> = None;
        let mut line = String::new();
        let mut mid_frame = false;

        loop {
            line.clear();
            let read = self
                .input
                .read_line(&mut line)
                .await
                .context("reading message header")?;
            if read == 0 {
                // EOF after a partial header block is a truncated frame,
                // not a clean shutdown.
                if mid_frame {
                    bail!("stream ended inside a message header");
                }
                return Ok(None);
            }
            mid_frame = true;

            let header = line.trim();
            if header.is_empty() {
                break;
            }
            // The header name is matched case-insensitively; anything that
            // is not Content-Length (Content-Type, usually) is skipped.
            if let Some((name, value)) = header.split_once(':')
                && name.trim().eq_ignore_ascii_case("content-length")
            {
                length = Some(
                    value
                        .trim()
                        .parse()
                        .context("malformed Content-Length value")?,
                );
            }
        }

        match length {
            Some(length) => Ok(Some(length)),
            None => bail!("message headers carried no Content-Length"),
        }
    }
}

/// Writes framed messages to an async byte stream.
pub struct MessageWriter<W> {
    output: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    /// Frame and write one message. Content-Length counts bytes, not chars.
    pub async fn send(&mut self, message: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(message).context("encoding message")?;
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);

        self.output
            .write_all(&frame)
            .await
            .context("writing message")?;
        self.output.flush().await.context("flushing message")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let message = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "initialize",
            "params": { "rootUri": "file:///work" }
        });

        let mut wire = Vec::new();
        MessageWriter::new(&mut wire).send(&message).await.unwrap();

        let mut reader = MessageReader::new(wire.as_slice());
        assert_eq!(reader.recv().await.unwrap().unwrap(), message);
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let first = serde_json::json!({"id": 1});
        let second = serde_json::json!({"id": 2});

        let mut wire = Vec::new();
        let mut writer = MessageWriter::new(&mut wire);
        writer.send(&first).await.unwrap();
        writer.send(&second).await.unwrap();

        let mut reader = MessageReader::new(wire.as_slice());
        assert_eq!(reader.recv().await.unwrap().unwrap(), first);
        assert_eq!(reader.recv().await.unwrap().unwrap(), second);
    }

    #[tokio::test]
    async fn test_empty_stream_is_clean_eof() {
        let mut reader = MessageReader::new(&b""[..]);
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_headers_is_error() {
        let mut reader = MessageReader::new(&b"Content-Length: 10\r\n"[..]);
        assert!(reader.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_eof_inside_body_is_error() {
        let mut reader = MessageReader::new(&b"Content-Length: 50\r\n\r\n{}"[..]);
        assert!(reader.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_content_length_is_error() {
        let mut reader =
            MessageReader::new(&b"Content-Type: application/vscode-jsonrpc\r\n\r\n{}"[..]);
        assert!(reader.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_header_name_is_case_insensitive() {
        let body = r#"{"id":3}"#;
        let wire = format!("content-length: {}\r\n\r\n{body}", body.len());
        let mut reader = MessageReader::new(wire.as_bytes());
        assert_eq!(reader.recv().await.unwrap().unwrap()["id"], 3);
    }

    #[tokio::test]
    async fn test_unknown_headers_are_skipped() {
        let body = r#"{"id":4}"#;
        let wire = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let mut reader = MessageReader::new(wire.as_bytes());
        assert_eq!(reader.recv().await.unwrap().unwrap()["id"], 4);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let wire = format!("Content-Length: {}\r\n\r\n", MAX_BODY_BYTES + 1);
        let mut reader = MessageReader::new(wire.as_bytes());
        assert!(reader.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_non_numeric_content_length_rejected() {
        let mut reader = MessageReader::new(&b"Content-Length: many\r\n\r\n"[..]);
        assert!(reader.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_content_length_counts_bytes() {
        // "ü" is two bytes in UTF-8; the header must reflect that.
        let message = serde_json::json!({"s": "ü"});
        let mut wire = Vec::new();
        MessageWriter::new(&mut wire).send(&message).await.unwrap();

        let text = String::from_utf8(wire.clone()).unwrap();
        let body = serde_json::to_string(&message).unwrap();
        assert!(text.starts_with(&format!("Content-Length: {}\r\n\r\n", body.len())));

        let mut reader = MessageReader::new(wire.as_slice());
        assert_eq!(reader.recv().await.unwrap().unwrap()["s"], "ü");
    }
}
