//! Standalone relay server.
//!
//! Usage:
//!   tucan_relay [port] [max_clients] [--wait-for-all]
//!   tucan_relay --config <file.json>

use anyhow::{bail, Context, Result};
use tucan_core::{ServerCallbacks, ServerConfig, ServerTransport};

const DEFAULT_PORT: u16 = 7777;

fn parse_args(args: &[String]) -> Result<ServerConfig> {
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        let path = args.get(pos + 1).context("--config needs a file path")?;
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        return ServerConfig::from_json(&json)
            .with_context(|| format!("Failed to parse config file {}", path));
    }

    let mut config = ServerConfig::new(DEFAULT_PORT);
    let mut positional = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--wait-for-all" => config.wait_for_all = true,
            flag if flag.starts_with("--") => bail!("Unknown option: {}", flag),
            value => positional.push(value),
        }
    }

    if let Some(port) = positional.first() {
        config.port = port
            .parse()
            .with_context(|| format!("Invalid port: {}", port))?;
    }
    if let Some(max) = positional.get(1) {
        let max: usize = max
            .parse()
            .with_context(|| format!("Invalid max_clients: {}", max))?;
        config.max_clients = Some(max);
    }
    if positional.len() > 2 {
        bail!("Too many arguments");
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tucan_core::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = parse_args(&args)?;

    let callbacks = ServerCallbacks::new()
        .with_client_connect(|endpoint| tracing::info!("Client connected: {}", endpoint))
        .with_client_disconnect(|endpoint| tracing::info!("Client disconnected: {}", endpoint));
    let mut server =
        ServerTransport::start(config, callbacks).context("Failed to start relay server")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down ({} clients connected)", server.client_count());
    server.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_positional() {
        let config = parse_args(&args(&["9000", "4", "--wait-for-all"])).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_clients, Some(4));
        assert!(config.wait_for_all);

        let config = parse_args(&[]).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_clients, None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args(&["port"])).is_err());
        assert!(parse_args(&args(&["1", "2", "3"])).is_err());
        assert!(parse_args(&args(&["--verbose"])).is_err());
        assert!(parse_args(&args(&["--config"])).is_err());
    }
}
