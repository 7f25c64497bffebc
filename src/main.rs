//! btc-listener CLI Application
//!
//! Connects to a Bitcoin node and prints the traffic it relays.

use btc_listener::cli::{self, ListenOptions};
use btc_listener::network::NetworkParameters;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "btc-listener")]
#[command(version)]
#[command(about = "Listen to a Bitcoin peer over the P2P protocol", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a peer and print transactions and blocks
    Listen {
        /// Peer to connect to, as host or host:port
        #[arg(short, long)]
        peer: String,

        /// Network: mainnet, testnet, regtest or signet
        #[arg(short, long)]
        network: Option<NetworkParameters>,

        /// Address to watch through a bloom filter (repeatable)
        #[arg(short, long = "address")]
        addresses: Vec<String>,

        /// Bloom filter false positive rate
        #[arg(long)]
        fp_rate: Option<f64>,

        /// JSON connection config
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the hash each address commits to
    Address {
        /// Addresses to decode
        #[arg(required = true)]
        addresses: Vec<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Listen {
            peer,
            network,
            addresses,
            fp_rate,
            config,
        } => {
            let options = ListenOptions {
                peer,
                network,
                addresses,
                fp_rate,
                config,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_listen(options))?;
        }

        Commands::Address { addresses } => {
            cli::cmd_address(&addresses)?;
        }
    }

    Ok(())
}
