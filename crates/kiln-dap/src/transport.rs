//! Content-Length framed message transport.
//!
//! DAP frames are `Content-Length: <n>\r\n\r\n<json>`. The reader tolerates
//! extra header fields and bare-`\n` line endings; the writer always emits
//! the canonical form.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::AdapterError;
use crate::protocol::Message;

const CONTENT_LENGTH: &str = "content-length:";

/// Read one framed message. Returns `None` on clean end-of-stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, AdapterError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return if saw_header {
                Err(AdapterError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame header",
                )))
            } else {
                Ok(None)
            };
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        saw_header = true;
        if let Some(value) = strip_header(trimmed) {
            let parsed = value.trim().parse::<usize>().map_err(|_| {
                AdapterError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad Content-Length {value:?}"),
                ))
            })?;
            content_length = Some(parsed);
        }
    }

    let len = content_length.ok_or(AdapterError::MissingContentLength)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Write one framed message.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), AdapterError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn strip_header(line: &str) -> Option<&str> {
    let lower = line.to_ascii_lowercase();
    lower
        .starts_with(CONTENT_LENGTH)
        .then(|| &line[CONTENT_LENGTH.len()..])
}
