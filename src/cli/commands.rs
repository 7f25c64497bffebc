//! CLI commands for the listener
//!
//! Implements the command handlers for the CLI interface.

use crate::crypto::address_hash;
use crate::network::{
    BlockEvent, Connection, ConnectionConfig, ConnectionEvent, NetworkParameters,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Options for `listen`
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    pub peer: String,
    pub network: Option<NetworkParameters>,
    pub addresses: Vec<String>,
    pub fp_rate: Option<f64>,
    pub config: Option<PathBuf>,
}

/// Build the connection config: file first, then command-line overrides
pub fn load_config(options: &ListenOptions) -> CliResult<ConnectionConfig> {
    let mut config = match &options.config {
        Some(path) => ConnectionConfig::from_file(path)?,
        None => ConnectionConfig::default(),
    };
    if let Some(network) = options.network {
        config.network = network;
    }
    if let Some(rate) = options.fp_rate {
        if !(rate > 0.0 && rate < 1.0) {
            return Err(format!("false positive rate must be in (0, 1), got {}", rate).into());
        }
        config.filter.false_positive_rate = rate;
    }
    Ok(config)
}

/// Resolve `host[:port]`, defaulting the port to the network's
pub async fn resolve_peer(peer: &str, network: NetworkParameters) -> CliResult<SocketAddr> {
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = peer.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, network.default_port()));
    }

    let target = if peer.contains(':') {
        peer.to_string()
    } else {
        format!("{}:{}", peer, network.default_port())
    };
    let mut resolved = tokio::net::lookup_host(target).await?;
    resolved
        .next()
        .ok_or_else(|| format!("could not resolve {}", peer).into())
}

/// Connect to a peer and print its traffic until Ctrl-C or disconnect
pub async fn cmd_listen(options: ListenOptions) -> CliResult<()> {
    let config = load_config(&options)?;
    let network = config.network;
    let connection = Connection::new(config);
    if !options.addresses.is_empty() {
        connection.set_filter_list(options.addresses.clone())?;
    }

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<()>();
    connection.on_connection_event(move |event, connection| {
        match event {
            ConnectionEvent::Connected => {
                println!("🔌 Connected to {:?}", connection.peer_addr());
            }
            ConnectionEvent::Verack => {
                println!(
                    "🤝 Handshake complete (version {:?}, services {:#x})",
                    connection.negotiated_version(),
                    connection.peer_services().bits()
                );
            }
            ConnectionEvent::Disconnected => {
                println!("📴 Disconnected");
                // The receiver is gone once we are shutting down
                let _ = closed_tx.send(());
            }
        }
        Ok(())
    });

    connection.on_transaction(|tx, _| {
        println!(
            "💸 tx {} ({} in, {} out, {} sat)",
            tx.txid(),
            tx.inputs.len(),
            tx.outputs.len(),
            tx.total_output()
        );
        Ok(())
    });

    connection.on_block(|event, _| {
        match event {
            BlockEvent::Full(block) => {
                println!(
                    "🧱 block {} ({} transactions)",
                    block.hash(),
                    block.transactions.len()
                );
            }
            BlockEvent::Filtered(block) => {
                println!(
                    "🧱 filtered block {} ({} of {} transactions matched)",
                    block.hash(),
                    block.matched_tx_ids.len(),
                    block.total_transactions
                );
                for txid in &block.matched_tx_ids {
                    println!("   └─ {}", txid);
                }
            }
        }
        Ok(())
    });

    let addr = resolve_peer(&options.peer, network).await?;
    println!("🌐 Listening to {} on {}...", addr, network);
    if !options.addresses.is_empty() {
        println!("   Watching {} address(es)", options.addresses.len());
    }
    connection.connect(addr).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\n📴 Shutting down...");
            connection.disconnect().await?;
        }
        _ = closed_rx.recv() => {
            // Peer went away; reap the dispatch task
            connection.disconnect().await.ok();
        }
    }

    Ok(())
}

/// Print the 20-byte hash each address commits to
pub fn cmd_address(addresses: &[String]) -> CliResult<()> {
    for address in addresses {
        let hash = address_hash(address)?;
        println!("{} {}", hex::encode(hash), address);
    }
    Ok(())
}
