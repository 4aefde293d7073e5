//! Per-connection protocol handling.
//!
//! A connection is split in two: the read half stays with the handler, which
//! decodes one line at a time and turns it into dispatcher requests; the write
//! half goes to a session writer task (see [`crate::session`]).

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader},
    net::TcpStream,
};
use tracing::{debug, info, warn};

use crate::{
    codec::{self, Message, ProtocolError, Request},
    dispatcher::DispatcherHandle,
    session::{self, Outbound, OutboundConfig, Session, SessionId},
};

/// Serves an accepted TCP connection until the peer goes away.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: DispatcherHandle,
    config: OutboundConfig,
) {
    let (reader, writer) = stream.into_split();
    let id = SessionId::next();
    info!(%peer, session = %id, "client connected");

    match serve(BufReader::new(reader), writer, id, dispatcher, config).await {
        Ok(()) => info!(%peer, session = %id, "client disconnected"),
        Err(err) => warn!(%peer, session = %id, error = ?err, "client connection closed with error"),
    }
}

/// Runs the read loop of one connection over any byte stream.
///
/// Returns once the stream ends or a read fails. In both cases the
/// connection's handle, if any, has been unregistered by then.
pub async fn serve<R, W>(
    mut reader: R,
    writer: W,
    id: SessionId,
    dispatcher: DispatcherHandle,
    config: OutboundConfig,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let outbound = session::spawn_writer(writer, id, config);
    let mut connection = Connection::new(id, outbound, dispatcher);

    let result = connection.read_loop(&mut reader).await;
    connection.leave().await;
    result
}

/// Protocol state of one connection.
pub struct Connection {
    id: SessionId,
    handle: Option<String>,
    outbound: Outbound,
    dispatcher: DispatcherHandle,
}

impl Connection {
    pub fn new(id: SessionId, outbound: Outbound, dispatcher: DispatcherHandle) -> Self {
        Self {
            id,
            handle: None,
            outbound,
            dispatcher,
        }
    }

    /// The handle this connection last registered under.
    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    async fn read_loop<R>(&mut self, reader: &mut R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = Vec::new();
        loop {
            line.clear();
            let bytes = reader
                .read_until(b'\n', &mut line)
                .await
                .context("failed to read from client")?;
            if bytes == 0 {
                return Ok(());
            }
            self.handle_line(&line).await?;
        }
    }

    /// Decodes and executes one received line.
    ///
    /// Protocol errors are answered on the connection and do not end it; an
    /// error is only returned when the dispatcher has gone away.
    pub async fn handle_line(&mut self, line: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(line);
        debug!(
            session = %self.id,
            handle = self.handle().unwrap_or_default(),
            line = text.trim_end(),
            "client command"
        );

        match codec::decode_request(line) {
            Ok(None) => Ok(()),
            Ok(Some(Request::Register(handle))) => self.register(handle).await,
            Ok(Some(Request::Unicast { recipient, message })) => {
                self.unicast(recipient, message).await
            }
            Err(err) => {
                self.reject(&err);
                Ok(())
            }
        }
    }

    async fn register(&mut self, handle: String) -> Result<()> {
        if let Some(previous) = self.handle.replace(handle.clone()) {
            if previous != handle {
                self.dispatcher.unregister(previous, self.id).await?;
            }
        }

        self.dispatcher
            .register(Session {
                handle,
                id: self.id,
                outbound: self.outbound.clone(),
            })
            .await
    }

    async fn unicast(&mut self, recipient: String, message: Message) -> Result<()> {
        let Some(sender) = self.handle.clone() else {
            self.reject(&ProtocolError::NotRegistered);
            return Ok(());
        };
        self.dispatcher.unicast(sender, recipient, message).await
    }

    fn reject(&self, error: &ProtocolError) {
        debug!(session = %self.id, %error, "rejected client command");
        self.outbound.send(codec::frame_error(error));
    }

    /// Releases the connection's handle. Safe to call more than once.
    pub async fn leave(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.dispatcher.unregister(handle, self.id).await {
                debug!(session = %self.id, error = ?err, "could not unregister on disconnect");
            }
        }
    }
}
