//! Framed duplex stream shared by a connection's read loop and its writers.
//!
//! Reads come from a single task; writes are serialised behind a lock so two
//! outbound frames never interleave. `close()` may be called from anywhere and
//! makes a blocked read return end-of-stream.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

use crate::protocol::Message;
use crate::wire::{self, FrameDecodeError, FrameEncodeError};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Stream {
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    closed: watch::Sender<bool>,
}

impl Stream {
    /// Wrap any byte stream (TCP socket, TLS session, in-memory duplex).
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (closed, _) = watch::channel(false);
        Self {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            closed,
        }
    }

    /// Read one message. `Ok(None)` on a clean end of stream or after `close()`.
    pub async fn read_message(&self) -> Result<Option<Message>, StreamError> {
        let closed = self.closed.subscribe();
        if self.is_closed() {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            res = read_frame(&mut reader) => res,
            _ = wait_closed(closed) => Ok(None),
        }
    }

    /// Write one message as a whole frame and flush it.
    pub async fn write_message(&self, msg: &Message) -> Result<(), StreamError> {
        let frame = wire::encode_frame(msg)?;
        let closed = self.closed.subscribe();
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        tokio::select! {
            res = write_frame(&mut writer, &frame) => res,
            _ = wait_closed(closed) => Err(StreamError::Closed),
        }
    }

    /// Close both directions. Returns false if the stream was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }
        let mut writer = self.writer.lock().await;
        // Best effort: the peer may already be gone.
        let _ = writer.shutdown().await;
        true
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

async fn read_frame(reader: &mut BoxedReader) -> Result<Option<Message>, StreamError> {
    let mut prefix = [0u8; wire::LEN_SIZE];
    // End of stream is only clean on a frame boundary.
    if reader.read(&mut prefix[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut prefix[1..]).await?;
    let len = wire::frame_len(prefix)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(wire::decode_payload(&payload)?))
}

async fn write_frame(writer: &mut BoxedWriter, frame: &[u8]) -> Result<(), StreamError> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}

/// Error reading or writing a framed message.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Decode(#[from] FrameDecodeError),
    #[error("{0}")]
    Encode(#[from] FrameEncodeError),
    #[error("stream closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn messages_cross_a_duplex_pair() {
        let (a, b) = tokio::io::duplex(4096);
        let (a, b) = (Stream::new(a), Stream::new(b));
        let msg = Message::request(1, "ping", json!({}));
        a.write_message(&msg).await.unwrap();
        assert_eq!(b.read_message().await.unwrap(), Some(msg));
    }

    #[tokio::test]
    async fn peer_shutdown_reads_as_clean_end() {
        let (a, b) = tokio::io::duplex(4096);
        let (a, b) = (Stream::new(a), Stream::new(b));
        assert!(a.close().await);
        assert!(b.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_unblocks_pending_read() {
        let (a, _b) = tokio::io::duplex(4096);
        let a = std::sync::Arc::new(Stream::new(a));
        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.read_message().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.close().await;
        let res = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read should return after close")
            .unwrap();
        assert!(res.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_writes() {
        let (a, _b) = tokio::io::duplex(4096);
        let a = Stream::new(a);
        assert!(a.close().await);
        assert!(!a.close().await);
        assert!(a.is_closed());
        let err = a.write_message(&Message::new()).await.unwrap_err();
        assert!(matches!(err, StreamError::Closed));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        use tokio::io::AsyncWriteExt;
        let (mut raw, b) = tokio::io::duplex(4096);
        let b = Stream::new(b);
        raw.write_all(&[10, 0, 0, 0, b'{']).await.unwrap();
        drop(raw);
        assert!(matches!(b.read_message().await, Err(StreamError::Io(_))));
    }

    #[tokio::test]
    async fn garbage_payload_is_a_decode_error() {
        use tokio::io::AsyncWriteExt;
        let (mut raw, b) = tokio::io::duplex(4096);
        let b = Stream::new(b);
        raw.write_all(&[3, 0, 0, 0, b'n', b'o', b'!']).await.unwrap();
        assert!(matches!(b.read_message().await, Err(StreamError::Decode(_))));
    }
}
