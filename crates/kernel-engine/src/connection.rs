//! Length-prefixed framing for running the channel over a byte stream.
//!
//! Every envelope travels as one frame:
//!
//! ```text
//! [4 bytes: payload length (big-endian u32)] [JSON-encoded Envelope]
//! ```
//!
//! `spawn_framed` turns a reader/writer pair (stdio, a Unix socket, a
//! `tokio::io::duplex` in tests) into an `Endpoint`.

use std::io;
use std::sync::Arc;

use log::{debug, error, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::channel::{ChannelError, Endpoint, Envelope, QueueTransport};

/// Maximum frame size: 64 MiB. Image outputs arrive base64-encoded inside a
/// single result message, so frames can be large.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 4;

fn oversized(len: usize) -> ChannelError {
    ChannelError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("envelope frame of {} bytes exceeds {}", len, MAX_FRAME_SIZE),
    ))
}

/// Encode `envelope` into a complete frame, header included.
fn encode(envelope: &Envelope) -> Result<Vec<u8>, ChannelError> {
    let mut frame = vec![0u8; HEADER_LEN];
    serde_json::to_writer(&mut frame, envelope)?;
    let len = frame.len() - HEADER_LEN;
    if len > MAX_FRAME_SIZE {
        return Err(oversized(len));
    }
    frame[..HEADER_LEN].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(frame)
}

/// Write one envelope as a single frame and flush.
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), ChannelError> {
    let frame = encode(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next envelope. `Ok(None)` is a clean disconnect between frames.
///
/// A body that is not a valid envelope yields `ChannelError::Serialize`
/// with the frame fully consumed, so the stream stays in sync and the caller
/// may keep reading. Any other error leaves the stream unusable.
pub async fn read_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Envelope>, ChannelError> {
    let mut header = [0u8; HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header).await {
        return match e.kind() {
            io::ErrorKind::UnexpectedEof => Ok(None),
            _ => Err(e.into()),
        };
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(oversized(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Wire a byte stream into a channel endpoint.
///
/// A writer task drains outbound envelopes into frames; when a write fails
/// it stops, which closes the queue and makes later sends fail with
/// `ChannelError::Closed`. A reader task decodes inbound frames until EOF.
/// Frames that are not valid envelopes are logged and skipped.
pub fn spawn_framed<R, W>(mut reader: R, mut writer: W) -> Endpoint
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            match write_envelope(&mut writer, &envelope).await {
                Ok(()) => {}
                // Only this envelope is lost; the stream is untouched.
                Err(ChannelError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    error!("[connection] dropping outbound envelope: {}", e);
                }
                Err(e) => {
                    error!("[connection] write failed, closing transport: {}", e);
                    break;
                }
            }
        }
        debug!("[connection] writer stopped");
    });

    tokio::spawn(async move {
        loop {
            match read_envelope(&mut reader).await {
                Ok(Some(envelope)) => {
                    if in_tx.send(envelope).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("[connection] peer disconnected");
                    break;
                }
                Err(ChannelError::Serialize(e)) => {
                    warn!("[connection] dropping malformed frame: {}", e)
                }
                Err(e) => {
                    error!("[connection] read failed: {}", e);
                    break;
                }
            }
        }
    });

    Endpoint::new(Arc::new(QueueTransport::new(out_tx)), in_rx)
}
