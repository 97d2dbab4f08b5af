mod http;

use clap::Parser;
use sse_relay_core::{LocalMultiplexer, RelayConfig, DEFAULT_HEARTBEAT_INTERVAL};
use std::{future::IntoFuture, net::SocketAddr, sync::Arc, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:7878";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    debug: bool,
    heartbeat_interval: Duration,
}

#[derive(Parser, Debug)]
#[command(name = "sse-relay-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL.as_secs())]
    heartbeat_secs: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            eprintln!("invalid_addr: {err} ({})", config.addr);
            return;
        }
    };
    init_logging(&config);

    let relay_config = RelayConfig {
        heartbeat_interval: config.heartbeat_interval,
    };
    let bus = Arc::new(LocalMultiplexer::new());
    let state = match http::AppState::new(relay_config, bus) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "relay_setup_failed", error = %err);
            return;
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "relay_error", error = %err, addr = %addr);
            return;
        }
    };

    info!(
        event = "relay_start",
        addr = %addr,
        heartbeat_secs = config.heartbeat_interval.as_secs()
    );

    // Event streams never end; dropping the server releases every session.
    tokio::select! {
        served = axum::serve(listener, http::router(state)).into_future() => {
            if let Err(err) = served {
                error!(event = "relay_error", error = %err);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(event = "relay_stop", addr = %addr);
        }
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr),
        debug: args.debug || env_flag("SSE_RELAY_DEBUG"),
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
    }
}

/// `RUST_LOG` wins when set; otherwise `--debug`, then `SSE_RELAY_LOG_LEVEL`.
fn init_logging(config: &Config) {
    let fallback = log_level(config.debug, std::env::var("SSE_RELAY_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn log_level(debug: bool, configured: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    configured
        .filter(|level| !level.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).ok().as_deref().map(str::trim),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("on")
    )
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("SSE_RELAY_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_ADDR.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_take_precedence() {
        assert_eq!(resolve_addr("0.0.0.0:9000"), "0.0.0.0:9000");
    }

    #[test]
    fn debug_overrides_configured_level() {
        assert_eq!(log_level(true, Some("warn".to_string())), "debug");
        assert_eq!(log_level(false, Some("warn".to_string())), "warn");
        assert_eq!(log_level(false, Some("  ".to_string())), "info");
        assert_eq!(log_level(false, None), "info");
    }

    #[test]
    fn args_parse_defaults() {
        let args = Args::parse_from(["sse-relay-hub"]);
        assert_eq!(args.heartbeat_secs, 15);
        assert!(!args.debug);
        assert!(args.addr.is_empty());

        let args = Args::parse_from(["sse-relay-hub", "--heartbeat-secs", "5", "--debug"]);
        assert_eq!(args.heartbeat_secs, 5);
        assert!(args.debug);
    }
}
