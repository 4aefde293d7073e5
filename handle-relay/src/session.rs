//! Sessions and their outbound delivery path.
//!
//! Every connection owns a bounded frame queue drained by a dedicated writer
//! task. Anything that wants to talk to a client (the dispatcher routing a
//! message, the connection handler reporting an error) pushes onto that queue
//! without waiting, so a slow socket never holds up the sender.

use std::{
    fmt,
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc::{self, error::TrySendError},
    time::timeout,
};
use tracing::{debug, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one accepted connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered handle bound to the connection that claimed it.
#[derive(Debug, Clone)]
pub struct Session {
    pub handle: String,
    pub id: SessionId,
    pub outbound: Outbound,
}

/// Limits applied to each connection's outbound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundConfig {
    /// Frames that may wait for the writer before new ones are dropped.
    pub capacity: NonZeroUsize,
    /// Upper bound on a single socket write.
    pub write_timeout: Duration,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(64).unwrap_or(NonZeroUsize::MIN),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Write capability for one connection.
///
/// Cloning is cheap; all clones feed the same queue, so writes to one
/// connection are serialized by its writer task.
#[derive(Debug, Clone)]
pub struct Outbound {
    id: SessionId,
    frames: mpsc::Sender<Vec<u8>>,
}

impl Outbound {
    /// Creates an outbound queue without a writer attached. The receiver gets
    /// newline-terminated frames.
    pub fn channel(id: SessionId, capacity: NonZeroUsize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (frames, receiver) = mpsc::channel(capacity.get());
        (Self { id, frames }, receiver)
    }

    /// Queues one frame, appending the line terminator.
    ///
    /// Never waits. Returns `false` when the frame was dropped because the
    /// queue is full or the writer has stopped.
    pub fn send(&self, frame: impl Into<Vec<u8>>) -> bool {
        let mut frame = frame.into();
        frame.push(b'\n');

        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session = %self.id, "outbound queue full; dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session = %self.id, "outbound writer stopped; dropping frame");
                false
            }
        }
    }
}

/// Spawns the writer task for a connection and returns its queue.
///
/// The task ends once every `Outbound` clone is dropped, or on the first
/// failed or timed out write.
pub fn spawn_writer<W>(writer: W, id: SessionId, config: OutboundConfig) -> Outbound
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (outbound, frames) = Outbound::channel(id, config.capacity);
    tokio::spawn(run_writer(writer, frames, id, config.write_timeout));
    outbound
}

async fn run_writer<W>(
    mut writer: W,
    mut frames: mpsc::Receiver<Vec<u8>>,
    id: SessionId,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        match timeout(write_timeout, write_frame(&mut writer, &frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(session = %id, error = ?err, "failed to write to client");
                break;
            }
            Err(_) => {
                warn!(session = %id, ?write_timeout, "write to client timed out");
                break;
            }
        }
    }

    // Closing the receiver makes later `Outbound::send` calls fail fast.
    frames.close();
    if let Err(err) = writer.shutdown().await {
        debug!(session = %id, error = ?err, "failed to shut down client writer");
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}
