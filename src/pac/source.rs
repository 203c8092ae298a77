use std::path::{Path, PathBuf};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, info};
use url::Url;

use crate::config::PacConfig;
use crate::error::PacError;

/// Where a PAC script is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacSource {
    Http(Uri),
    File(PathBuf),
}

impl PacSource {
    /// Accepts `http`, `https` and `file` URLs, or a plain filesystem path.
    pub fn parse(source: &str) -> Result<Self, PacError> {
        match Url::parse(source) {
            Ok(url) => match url.scheme() {
                "http" | "https" => url
                    .as_str()
                    .parse::<Uri>()
                    .map(PacSource::Http)
                    .map_err(|_| PacError::InvalidSource(source.to_string())),
                "file" => url
                    .to_file_path()
                    .map(PacSource::File)
                    .map_err(|_| PacError::InvalidSource(source.to_string())),
                _ => Err(PacError::InvalidSource(source.to_string())),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(PacSource::File(source.into())),
            Err(_) => Err(PacError::InvalidSource(source.to_string())),
        }
    }

    /// Reads the script. Files must live below `config.root`.
    pub async fn read(&self, config: &PacConfig) -> Result<Vec<u8>, PacError> {
        match self {
            PacSource::Http(uri) => fetch(uri, config.insecure).await,
            PacSource::File(path) => read_file(path, &config.root).await,
        }
    }
}

async fn fetch(uri: &Uri, insecure: bool) -> Result<Vec<u8>, PacError> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);

    let tls = hyper_tls::native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(insecure)
        .build()?;
    let https = HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));

    let client = Client::builder(TokioExecutor::new()).build::<_, Empty<Bytes>>(https);

    info!(url = %uri, insecure, "fetching pac script");
    let request = Request::get(uri.clone())
        .body(Empty::new())
        .map_err(|e| PacError::Fetch(e.to_string()))?;

    let response = client
        .request(request)
        .await
        .map_err(|e| PacError::Fetch(e.to_string()))?;

    if !response.status().is_success() {
        return Err(PacError::FetchStatus(response.status()));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| PacError::Fetch(e.to_string()))?
        .to_bytes();

    debug!(url = %uri, bytes = body.len(), "fetched pac script");
    Ok(body.to_vec())
}

async fn read_file(path: &Path, root: &Path) -> Result<Vec<u8>, PacError> {
    let root = tokio::fs::canonicalize(root).await?;
    let relative = path.strip_prefix("/").unwrap_or(path);
    let resolved = tokio::fs::canonicalize(root.join(relative)).await?;

    if !resolved.starts_with(&root) {
        return Err(PacError::OutsideRoot(path.display().to_string()));
    }

    info!(path = %resolved.display(), "reading pac script");
    Ok(tokio::fs::read(resolved).await?)
}
