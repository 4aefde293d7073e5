use std::{future::Future, net::SocketAddr, num::NonZeroUsize, time::Duration};

use anyhow::{Result, bail};
use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    connection, console,
    dispatcher::{Dispatcher, DispatcherHandle},
    session::OutboundConfig,
};

/// Runtime settings of a relay server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub outbound_capacity: NonZeroUsize,
    pub write_timeout: Duration,
    /// Sender handle shown on console broadcasts.
    pub console_handle: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let outbound = OutboundConfig::default();
        Self {
            outbound_capacity: outbound.capacity,
            write_timeout: outbound.write_timeout,
            console_handle: "system".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn outbound(&self) -> OutboundConfig {
        OutboundConfig {
            capacity: self.outbound_capacity,
            write_timeout: self.write_timeout,
        }
    }
}

type ConsoleInput = Box<dyn AsyncBufRead + Send + Unpin>;
type ConsoleOutput = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Server {
    listener: TcpListener,
    dispatcher: Dispatcher,
    handle: DispatcherHandle,
    config: RelayConfig,
    console: Option<(ConsoleInput, ConsoleOutput)>,
}

impl Server {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        let (dispatcher, handle) = Dispatcher::new();
        Self {
            listener,
            dispatcher,
            handle,
            config,
            console: None,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves the operator console on `input`/`output` once the server runs.
    ///
    /// A server has at most one console; attaching a second one fails.
    pub fn attach_console<R, W>(&mut self, input: R, output: W) -> Result<()>
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        if self.console.is_some() {
            bail!("a console is already attached");
        }
        self.console = Some((Box::new(input), Box::new(output)));
        Ok(())
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            dispatcher,
            handle,
            config,
            console: attached_console,
        } = self;
        let outbound = config.outbound();
        tokio::spawn(dispatcher.run());
        if let Some((input, output)) = attached_console {
            console::spawn(handle.clone(), config.console_handle, input, output);
        }
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &handle, outbound);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    dispatcher: &DispatcherHandle,
    outbound: OutboundConfig,
) {
    match result {
        Ok((stream, peer)) => {
            let dispatcher = dispatcher.clone();
            tokio::spawn(connection::handle_connection(stream, peer, dispatcher, outbound));
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}
