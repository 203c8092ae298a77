use hyper::StatusCode;
use thiserror::Error;

/// Startup-time failures while acquiring or compiling a PAC script.
#[derive(Debug, Error)]
pub enum PacError {
    #[error("could not compile pac script: {0}")]
    Compile(String),
    #[error("pac script does not define a callable FindProxyForURL(url, host)")]
    MissingEntryPoint,
    #[error("pac script failed while evaluating FindProxyForURL: {0}")]
    Evaluation(String),
    #[error("pac engine is no longer running")]
    EngineUnavailable,
    #[error("could not read pac url: {0}")]
    Fetch(String),
    #[error("could not read pac url: {0}")]
    FetchStatus(StatusCode),
    #[error("invalid pac source {0:?}")]
    InvalidSource(String),
    #[error("pac file {0} is outside of the configured root")]
    OutsideRoot(String),
    #[error("tls setup failed: {0}")]
    Tls(#[from] hyper_tls::native_tls::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single entry of the fallback list could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("invalid target {0:?}: expected DIRECT")]
    ExpectedDirect(String),
    #[error("invalid target {0:?}: expected DIRECT or TYPE HOST")]
    ExpectedTypeHost(String),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("could not resolve valid upstream proxy")]
    NoUpstream,
    #[error(transparent)]
    Script(#[from] PacError),
    #[error("invalid request target: {0}")]
    InvalidTarget(String),
}

/// Errors raised while handling a single proxied request or tunnel.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("connection does not support hijacking")]
    HijackUnsupported,
    #[error("could not dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("upstream proxy refused tunnel: {0}")]
    UpstreamRefused(String),
    #[error("malformed http head: {0}")]
    MalformedHead(String),
    #[error("http head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("timed out reading http head")]
    Timeout,
    #[error("tls error: {0}")]
    Tls(#[from] hyper_tls::native_tls::Error),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("http error: {0}")]
    Http(#[from] hyper::http::Error),
    #[error("round trip failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Status reported to the client when the error happens before any response was written.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::HijackUnsupported | ProxyError::Http(_) | ProxyError::Tls(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::MalformedHead(_) => StatusCode::BAD_REQUEST,
            ProxyError::HeadTooLarge(_) => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn test_forwarding_failures_map_to_bad_gateway() {
        let err = ProxyError::from(ResolveError::NoUpstream);
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        let err = ProxyError::Dial {
            addr: "127.0.0.1:1".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_hijack_unsupported_is_internal_error() {
        assert_eq!(
            ProxyError::HijackUnsupported.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_target_errors_render_the_offending_entry() {
        let err = TargetError::ExpectedDirect("GARBAGE".to_string());
        assert_eq!(err.to_string(), "invalid target \"GARBAGE\": expected DIRECT");
    }
}
