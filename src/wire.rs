//! Newline-delimited JSON transport: one [`Request`] per line in, one
//! [`Response`] per line out, answered in order.

use std::sync::Arc;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};

use crate::desk::{Desk, Request, Response};
use crate::limits::MAX_LINE_LEN;
use crate::sweeper::local_now;

/// One inbound frame.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(String),
    /// A line over `MAX_LINE_LEN`; its bytes are skipped up to the next newline.
    Oversized,
}

/// `LinesCodec` that reports an oversized line as a frame instead of an error,
/// so `Framed` keeps reading after it.
struct RequestCodec {
    lines: LinesCodec,
}

impl RequestCodec {
    fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_LEN),
        }
    }

    fn wrap(result: Result<Option<String>, LinesCodecError>) -> Result<Option<Frame>, LinesCodecError> {
        match result {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Oversized)),
            Err(e) => Err(e),
        }
    }
}

impl Decoder for RequestCodec {
    type Item = Frame;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, LinesCodecError> {
        Self::wrap(self.lines.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, LinesCodecError> {
        Self::wrap(self.lines.decode_eof(buf))
    }
}

impl Encoder<String> for RequestCodec {
    type Error = LinesCodecError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), LinesCodecError> {
        self.lines.encode(line, dst)
    }
}

/// Serve one client until it hangs up.
pub async fn process_connection<S>(socket: S, desk: Arc<Desk>) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, RequestCodec::new());

    while let Some(frame) = framed.next().await {
        let resp = match frame? {
            Frame::Line(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Request>(&line) {
                    Ok(req) => desk.handle(req, local_now()).await,
                    Err(e) => Response::error("bad_request", format!("malformed request: {e}")),
                }
            }
            Frame::Oversized => {
                Response::error("bad_request", format!("request longer than {MAX_LINE_LEN} bytes"))
            }
        };
        framed.send(encode(&resp)).await?;
    }
    Ok(())
}

fn encode(resp: &Response) -> String {
    match serde_json::to_string(resp) {
        Ok(line) => line,
        Err(e) => {
            tracing::error!("failed to encode response: {e}");
            r#"{"type":"error","error":{"code":"internal","message":"unencodable response"}}"#.to_string()
        }
    }
}
