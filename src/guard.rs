//! Serialized writes to the active connection
use super::*;
use std::io::{Error, ErrorKind, Result};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of the one active socket, shared between the session driver
/// and the device executor.
///
/// Every [send](SocketGuard::send) holds the lock for the whole frame, so
/// frames from different writers never interleave on the wire. Cloning the
/// guard clones the handle, not the socket.
#[derive(Clone)]
pub struct SocketGuard {
    writer: Arc<Mutex<Option<BoxedWriter>>>,
    send_timeout: Duration,
}

impl SocketGuard {
    pub fn new<W>(writer: W, send_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Some(Box::new(writer)))),
            send_timeout,
        }
    }

    /// Writes one complete frame.
    ///
    /// Waits for any other writer to finish first. The write itself is
    /// bounded by the send timeout; a closed guard fails with `NotConnected`.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        let mut slot = self.writer.lock().await;
        let writer = slot
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "socket already closed"))?;

        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.send_timeout, write).await {
            Ok(res) => res,
            Err(_) => Err(Error::new(
                ErrorKind::TimedOut,
                format!("send of {} bytes timed out", frame.len()),
            )),
        }
    }

    /// Shuts the socket down and drops it. Later sends fail, later closes
    /// do nothing.
    pub async fn close(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                debug!("Shutdown of closed socket failed: {:?}", err);
            }
        }
    }

    pub async fn is_open(&self) -> bool {
        self.writer.lock().await.is_some()
    }
}
