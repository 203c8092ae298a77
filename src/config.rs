use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

/// Forward proxy routing requests according to a PAC script.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(flatten)]
    pub pac: PacConfig,

    #[command(flatten)]
    pub cache: CacheConfig,

    #[command(flatten)]
    pub http: ListenerConfig,

    /// Enable debug logging
    #[arg(short, long, env = "PACPROXY_VERBOSE")]
    pub verbose: bool,
}

#[derive(Debug, Clone, Args)]
pub struct PacConfig {
    /// URL (http, https, file) or path of the PAC script; empty connects directly
    #[arg(long = "pac-url", env = "PACPROXY_PAC_URL", default_value = "")]
    pub url: String,

    /// Directory that file based PAC scripts must be located in
    #[arg(long = "pac-root", env = "PACPROXY_PAC_ROOT", default_value = "/")]
    pub root: PathBuf,

    /// Skip certificate verification when fetching the PAC script over https
    #[arg(long = "pac-insecure", env = "PACPROXY_PAC_INSECURE")]
    pub insecure: bool,
}

impl Default for PacConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            root: PathBuf::from("/"),
            insecure: false,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct CacheConfig {
    /// How long a resolved upstream is reused for the same scheme and host
    #[arg(
        long = "cache-item-ttl",
        env = "PACPROXY_CACHE_ITEM_TTL",
        default_value = "30m",
        value_parser = humantime::parse_duration
    )]
    pub item_ttl: Duration,

    /// How often expired cache entries are removed
    #[arg(
        long = "cache-gc-interval",
        env = "PACPROXY_CACHE_GC_INTERVAL",
        default_value = "15m",
        value_parser = humantime::parse_duration
    )]
    pub gc_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            item_ttl: Duration::from_secs(30 * 60),
            gc_interval: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ListenerConfig {
    /// Address to listen on
    #[arg(
        long = "addr",
        env = "PACPROXY_ADDR",
        default_value = ":8080",
        value_parser = parse_listen_addr
    )]
    pub addr: SocketAddr,

    /// Time allowed for a client to send the request head
    #[arg(
        long = "read-header-timeout",
        env = "PACPROXY_READ_HEADER_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub read_header_timeout: Duration,

    /// Largest accepted request head in bytes
    #[arg(long = "max-header-bytes", env = "PACPROXY_MAX_HEADER_BYTES", default_value_t = 640 * 1024)]
    pub max_header_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            read_header_timeout: Duration::from_secs(10),
            max_header_bytes: 640 * 1024,
        }
    }
}

/// Parses a listen address, accepting the host-less `:port` form for all interfaces.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, String> {
    let addr = match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => addr.to_string(),
    };

    addr.parse()
        .map_err(|e| format!("invalid listen address {:?}: {}", addr, e))
}
