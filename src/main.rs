//! Thin CLI layer: parse args, initialize logging, run the server.
//!
//! Usage: `ember_web [port] [host] [pool_size]`
//! Defaults: port 8080, host 127.0.0.1, pool size 10.
//! Exit code 0 on clean shutdown, 1 on startup failure.

use clap::{builder::RangedU64ValueParser, command, value_parser, Arg};
use ember_web::{NoopMetrics, Server, ServerConfig, TracingLog};
use std::{process::ExitCode, sync::Arc};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level comes from `RUST_LOG`, defaulting to `info`.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let matches = command!()
        .about("Security-first HTTP/1.1 origin server")
        .arg(
            Arg::new("port")
                .help("Port to listen on")
                .value_parser(value_parser!(u16))
                .default_value("8080"),
        )
        .arg(
            Arg::new("host")
                .help("Address to bind")
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::new("pool_size")
                .help("Number of worker tasks")
                .value_parser(RangedU64ValueParser::<usize>::new().range(1..))
                .default_value("10"),
        )
        .arg(
            Arg::new("root")
                .long("root")
                .help("Resource root directory")
                .default_value("./static"),
        )
        .get_matches();

    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let host = matches
        .get_one::<String>("host")
        .cloned()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let pool_size = matches.get_one::<usize>("pool_size").copied().unwrap_or(10);
    let root = matches
        .get_one::<String>("root")
        .cloned()
        .unwrap_or_else(|| "./static".to_string());

    let mut config = ServerConfig::new(host, port, root);
    config.server.workers = pool_size;

    match Server::bind(config, Arc::new(TracingLog), Arc::new(NoopMetrics)) {
        Ok(server) => {
            server.run().await;
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "startup failed");
            ExitCode::FAILURE
        }
    }
}
