//! Command-line front end

pub mod commands;

pub use commands::{cmd_address, cmd_listen, load_config, resolve_peer, CliResult, ListenOptions};
