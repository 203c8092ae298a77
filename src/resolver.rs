use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::PacConfig;
use crate::error::{PacError, ResolveError};
use crate::pac::{PacEngine, PacSource};
use crate::proxy_types::{FallbackList, RequestTarget, Upstream};

/// Decides which upstream a request should be routed through.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, target: &RequestTarget) -> Result<Upstream, ResolveError>;
}

#[async_trait]
impl<R: Resolve + ?Sized> Resolve for Arc<R> {
    async fn resolve(&self, target: &RequestTarget) -> Result<Upstream, ResolveError> {
        (**self).resolve(target).await
    }
}

enum Script {
    Direct,
    Pac(PacEngine),
}

/// Resolves requests by evaluating a PAC script, or always direct when none is configured.
pub struct PacResolver {
    script: Mutex<Script>,
}

impl PacResolver {
    pub fn direct() -> Self {
        Self {
            script: Mutex::new(Script::Direct),
        }
    }

    pub async fn from_source(source: Vec<u8>) -> Result<Self, PacError> {
        let engine = PacEngine::compile(source).await?;
        Ok(Self {
            script: Mutex::new(Script::Pac(engine)),
        })
    }

    pub async fn from_config(config: &PacConfig) -> Result<Self, PacError> {
        if config.url.is_empty() {
            info!("no pac url provided. defaulting direct connections");
            return Ok(Self::direct());
        }

        info!(url = %config.url, "configuring upstream proxies using pac");
        let source = PacSource::parse(&config.url)?.read(config).await?;
        Self::from_source(source).await
    }

    async fn find_proxy(&self, target: &RequestTarget) -> Result<Option<String>, PacError> {
        let script = self.script.lock().await;
        match &*script {
            Script::Direct => Ok(None),
            Script::Pac(engine) => engine.find_proxy(&target.to_string(), target.host()).await,
        }
    }
}

#[async_trait]
impl Resolve for PacResolver {
    async fn resolve(&self, target: &RequestTarget) -> Result<Upstream, ResolveError> {
        let started = Instant::now();
        let raw = self.find_proxy(target).await?;

        for candidate in FallbackList::new(raw.as_deref()) {
            let candidate = candidate?;

            debug!(
                url = %target,
                target = %candidate,
                elapsed = ?started.elapsed(),
                "resolved upstream proxy"
            );

            if !candidate.is_supported() {
                warn!(target = %candidate, "skipping unsupported upstream proxy");
                continue;
            }

            return Ok(candidate);
        }

        Err(ResolveError::NoUpstream)
    }
}
