use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "passage",
    about = "HTTP CONNECT forwarding proxy with traffic limiting and a coalescing DNS resolver"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the proxy server
    Serve(ServeArgs),
    /// Validate the configuration and exit
    Check(CheckArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Listen address, overriding the config file
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<SocketAddr>,

    /// Load configuration from this file instead of ./passage.toml
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Load configuration from this file instead of ./passage.toml
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,
}
