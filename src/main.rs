use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pacproxy::build_resolver;
use pacproxy::config::Config;
use pacproxy::server::ProxyServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::parse();

    let default_level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let resolver = build_resolver(&config.pac, &config.cache).await?;
    let server = ProxyServer::new(resolver, config.http.clone())?;

    let listener = TcpListener::bind(config.http.addr).await?;
    info!(addr = %listener.local_addr()?, "starting server");

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = &result {
                error!(error = %e, "server stopped");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
