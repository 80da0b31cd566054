//! Framed transport over one TCP stream.
//!
//! The read half is wrapped in a [`FrameReader`] that reassembles
//! length-prefixed frames, so partial reads never corrupt message
//! boundaries. The write half is owned by a dedicated writer task fed
//! through a bounded channel: sending is non-blocking relative to
//! receiving, and a full buffer is a fatal connection error rather than a
//! silent drop.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use parley_shared::constants::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
use parley_shared::error::ProtocolError;
use parley_shared::protocol::Frame;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Outbound write buffer full")]
    WriteBufferFull,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Reads complete frames off the owned read half of a TCP stream.
pub struct FrameReader {
    read_half: OwnedReadHalf,
}

impl FrameReader {
    pub fn new(read_half: OwnedReadHalf) -> Self {
        Self { read_half }
    }

    /// Wait for the next complete frame.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream at a frame boundary.
    /// A stream cut mid-frame is an error.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match self.read_half.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(header) as usize;
        if len == 0 {
            return Err(ProtocolError::Truncated.into());
        }
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(len).into());
        }

        let mut body = vec![0u8; len];
        self.read_half.read_exact(&mut body).await?;

        let frame = Frame::decode_body(&body)?;
        trace!(frame = ?frame.frame_type(), len, "Frame received");
        Ok(Some(frame))
    }
}

/// Handle to the writer task for one connection.
#[derive(Clone)]
pub struct FrameWriter {
    tx: mpsc::Sender<Frame>,
}

impl FrameWriter {
    /// Queue a frame for sending.
    ///
    /// Never blocks: a full buffer means the peer is not draining its
    /// socket and the connection must be torn down.
    pub fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ConnectionError::WriteBufferFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ConnectionError::Closed),
        }
    }
}

/// Spawn the writer task owning the write half.
///
/// Dropping every [`FrameWriter`] clone closes the channel; the task then
/// flushes pending writes and shuts the stream down, which resolves the
/// peer's pending read with end-of-stream.
pub fn spawn_writer(mut write_half: OwnedWriteHalf, capacity: usize) -> FrameWriter {
    let (tx, mut rx) = mpsc::channel::<Frame>(capacity);

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let wire = match frame.encode() {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if let Err(e) = write_half.write_all(&wire).await {
                debug!(error = %e, "Write failed, closing writer");
                return;
            }
            if let Err(e) = write_half.flush().await {
                debug!(error = %e, "Flush failed, closing writer");
                return;
            }
        }
        // Channel closed: clean teardown.
        let _ = write_half.shutdown().await;
    });

    FrameWriter { tx }
}
