#![warn(clippy::pedantic)]
#![allow(clippy::wildcard_imports)]

mod server;
mod settings;

use clap::Parser;
use std::collections::HashSet;
use std::env;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use dns_resolver::SharedCache;

use crate::server::Server;
use crate::settings::Settings;

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser)]
/// A caching recursive DNS resolver for small networks.
///
/// recursor answers A, NS, PTR, and AAAA queries over UDP by walking
/// the delegation hierarchy from a configured root nameserver.
/// Positive answers are cached under their TTLs, and the cache is
/// persisted across restarts.
///
/// It is not a fully-featured internet-facing nameserver: there is no
/// TCP fallback, no DNSSEC, and no EDNS(0).
struct Args {
    /// Path to the configuration file
    #[clap(short, long, value_parser)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging();

    let settings = match Settings::new(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(error) => {
            tracing::error!(?error, "could not load configuration");
            process::exit(1);
        }
    };

    let cache = SharedCache::new(&settings.cache_filepath);
    cache.load().await;
    cache.start_sweeper(Duration::from_secs(settings.clean_period));

    let server = match Server::bind(&settings, cache.clone()).await {
        Ok(server) => server,
        Err(error) => {
            tracing::error!(?error, "could not bind UDP socket");
            process::exit(1);
        }
    };
    if let Ok(address) = server.local_addr() {
        tracing::info!(%address, root = %settings.root_server_ip, "server started");
    }

    tokio::select! {
        () = server.run() => (),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
    }

    // closing the listening socket before the final persist; in-flight
    // handlers are left to fail their sends
    drop(server);
    cache.shutdown().await;
}

fn begin_logging() {
    let log_format = env::var("RUST_LOG_FORMAT").unwrap_or_default();
    let log_format = log_format.split(',').collect::<HashSet<&str>>();

    let logger = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());

    if log_format.contains("json") {
        if log_format.contains("no-time") {
            logger.json().without_time().init();
        } else {
            logger.json().init();
        }
    } else if log_format.contains("no-time") {
        logger.without_time().init();
    } else {
        logger.init();
    }
}
