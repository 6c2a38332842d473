use std::net::SocketAddr;

use clap::Parser;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:9999";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: SocketAddr,
}
