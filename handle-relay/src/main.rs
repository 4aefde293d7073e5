use anyhow::Result;
use clap::Parser;
use tokio::{io::BufReader, net::TcpListener};
use tracing::{info, warn};

use handle_relay::{cli::Cli, server::Server};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr so stdout carries only console replies.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let listener = TcpListener::bind(cli.listen).await?;
    let mut server = Server::new(listener, cli.relay_config());
    let addr = server.local_addr()?;
    info!("relay listening on {}", addr);
    println!("relay listening on {addr}");

    if !cli.no_console {
        server.attach_console(BufReader::new(tokio::io::stdin()), tokio::io::stdout())?;
    }

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("relay exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
