use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, PROXY_AUTHORIZATION};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::error::ProxyError;
use crate::proxy_types::RequestTarget;
use crate::resolver::Resolve;

mod connector;

pub(crate) use connector::{dial, establish_tunnel};
pub use connector::{UpstreamConnector, UpstreamStream};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Hop-by-hop headers meant for this proxy, never for the next hop.
const PROXY_HEADERS: [HeaderName; 2] = [
    HeaderName::from_static("proxy-connection"),
    PROXY_AUTHORIZATION,
];

/// Relays non-CONNECT requests, letting the resolver pick the route per scheme and host.
pub struct Forwarder {
    client: Client<HttpsConnector<UpstreamConnector>, Incoming>,
}

impl Forwarder {
    pub fn new(resolver: Arc<dyn Resolve>) -> Result<Self, ProxyError> {
        let tls = tokio_native_tls::TlsConnector::from(hyper_tls::native_tls::TlsConnector::new()?);
        let connector = HttpsConnector::from((UpstreamConnector::new(resolver, tls.clone()), tls));

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }

    pub async fn forward(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        RequestTarget::from_uri(req.uri())?;

        debug!(url = %req.uri(), "clearing proxy headers");
        clear_proxy_headers(&mut req);

        let response = self.client.request(req).await?;
        debug!(status = %response.status(), "copying response");

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

fn clear_proxy_headers<B>(req: &mut Request<B>) {
    for header in &PROXY_HEADERS {
        req.headers_mut().remove(header);
    }
}

#[cfg(test)]
mod forwarder_tests {
    use super::*;

    #[test]
    fn test_clear_proxy_headers() {
        let mut req = Request::get("http://example.com/")
            .header("Proxy-Connection", "keep-alive")
            .header("Proxy-Authorization", "Basic Zm9vOmJhcg==")
            .header("Accept", "*/*")
            .body(())
            .unwrap();

        clear_proxy_headers(&mut req);

        assert!(req.headers().get("proxy-connection").is_none());
        assert!(req.headers().get("proxy-authorization").is_none());
        assert_eq!(req.headers().get("accept").unwrap(), "*/*");
    }
}
