//! LSP base-protocol framing.
//!
//! Messages travel as `Content-Length: N\r\n\r\n{json}` over the server's
//! stdio. [`MessageReader`] and [`MessageWriter`] handle one direction
//! each; everything above this layer works with `serde_json::Value`.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single message body. Workspace-wide diagnostic
/// reports can get large, but anything past this is a broken peer.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Parse a single `Key: value` header line; returns the content length
/// when the key is `Content-Length`. Matched case-insensitively for
/// robustness even though servers send the canonical spelling.
fn content_length_of(line: &str) -> Result<Option<usize>> {
    let Some((key, value)) = line.split_once(':') else {
        bail!("header line without ':': {line:?}");
    };
    if !key.trim().eq_ignore_ascii_case("content-length") {
        // Content-Type and friends are legal; skip them.
        return Ok(None);
    }
    let length = value
        .trim()
        .parse::<usize>()
        .with_context(|| format!("bad Content-Length value {:?}", value.trim()))?;
    Ok(Some(length))
}

/// Reads framed JSON-RPC messages from the server's stdout.
pub struct MessageReader<R> {
    input: BufReader<R>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: BufReader::new(input),
        }
    }

    /// Next message, or `Ok(None)` on a clean end-of-stream.
    ///
    /// EOF between messages is a normal close; EOF inside a header block
    /// or body is an error.
    pub async fn read_message(&mut self) -> Result<Option<serde_json::Value>> {
        let mut length: Option<usize> = None;
        let mut line = String::new();
        let mut mid_headers = false;

        loop {
            line.clear();
            let n = self
                .input
                .read_line(&mut line)
                .await
                .context("reading header line")?;
            if n == 0 {
                if mid_headers {
                    bail!("stream ended inside a header block");
                }
                return Ok(None);
            }
            mid_headers = true;

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }
            if let Some(parsed) = content_length_of(trimmed)? {
                length = Some(parsed);
            }
        }

        let Some(length) = length else {
            bail!("header block without Content-Length");
        };
        if length > MAX_BODY_BYTES {
            bail!("refusing {length}-byte message (limit {MAX_BODY_BYTES})");
        }

        let mut body = vec![0u8; length];
        self.input
            .read_exact(&mut body)
            .await
            .context("reading message body")?;

        serde_json::from_slice(&body)
            .context("decoding message body")
            .map(Some)
    }
}

/// Writes framed JSON-RPC messages to the server's stdin.
pub struct MessageWriter<W> {
    output: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    pub async fn write_message(&mut self, message: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(message).context("encoding message body")?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.output
            .write_all(header.as_bytes())
            .await
            .context("writing message header")?;
        self.output
            .write_all(&body)
            .await
            .context("writing message body")?;
        self.output.flush().await.context("flushing message")?;
        Ok(())
    }
}
