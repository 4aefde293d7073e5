use std::{net::SocketAddr, num::NonZeroUsize, time::Duration};

use clap::Parser;

use crate::server::RelayConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,

    /// Frames queued per client before further frames to it are dropped.
    #[arg(long, default_value = "64")]
    pub outbound_capacity: NonZeroUsize,

    /// Milliseconds a single write to a client may take before it is abandoned.
    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,

    /// Sender handle used for console broadcasts.
    #[arg(long, default_value = "system")]
    pub console_handle: String,

    /// Do not read operator commands from stdin.
    #[arg(long)]
    pub no_console: bool,
}

impl Cli {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            outbound_capacity: self.outbound_capacity,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            console_handle: self.console_handle.clone(),
        }
    }
}
