//! Operator console.
//!
//! Reads `CLIENTS` and `ALL <text>` lines and answers on its own output.
//! Exactly one console task runs per server; it feeds the dispatcher through
//! the same handle the connections use.

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    codec::{self, ConsoleCommand},
    dispatcher::DispatcherHandle,
};

/// Spawns the console task. It ends when `input` reaches end of stream.
pub fn spawn<R, W>(
    dispatcher: DispatcherHandle,
    sender: String,
    input: R,
    output: W,
) -> JoinHandle<()>
where
    R: AsyncBufRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        match run(dispatcher, &sender, input, output).await {
            Ok(()) => info!("console input closed"),
            Err(err) => warn!(error = ?err, "console stopped"),
        }
    })
}

/// Reads console commands until end of input. Broadcasts go out as `sender`.
pub async fn run<R, W>(
    dispatcher: DispatcherHandle,
    sender: &str,
    mut input: R,
    mut output: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = input
            .read_until(b'\n', &mut line)
            .await
            .context("failed to read console input")?;
        if bytes == 0 {
            return Ok(());
        }

        let reply = match codec::decode_console(&line) {
            Ok(None) => continue,
            Ok(Some(ConsoleCommand::ListClients)) => dispatcher.list_clients().await?.to_string(),
            Ok(Some(ConsoleCommand::Broadcast(body))) => dispatcher
                .broadcast(sender.to_string(), body)
                .await?
                .to_string(),
            Err(_) => codec::CONSOLE_COMMAND_NOT_FOUND.to_string(),
        };
        write_line(&mut output, &reply).await?;
    }
}

async fn write_line<W>(output: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}
