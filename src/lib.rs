//! Forward proxy that routes each request according to a PAC script.

use std::sync::Arc;

pub mod cache;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod handler;
mod head;
pub mod pac;
pub mod proxy_types;
pub mod resolver;
mod rewind;
pub mod server;
pub mod tunnel;

use crate::cache::CachedResolver;
use crate::config::{CacheConfig, PacConfig};
use crate::error::PacError;
use crate::resolver::{PacResolver, Resolve};

/// Builds the cached, PAC backed resolver shared by all connections.
///
/// Must be called from within a tokio runtime.
pub async fn build_resolver(pac: &PacConfig, cache: &CacheConfig) -> Result<Arc<dyn Resolve>, PacError> {
    let resolver = PacResolver::from_config(pac).await?;
    Ok(Arc::new(CachedResolver::new(resolver, cache)))
}
