use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::forwarder::{Forwarder, ProxyBody};
use crate::proxy_types::RequestTarget;
use crate::resolver::Resolve;
use crate::tunnel::{open_target, relay_upgraded};

pub fn error_response(status: StatusCode) -> Response<ProxyBody> {
    let text = status.canonical_reason().unwrap_or_default();
    let mut response = Response::new(
        Full::new(Bytes::from(format!("{}\n", text)))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
}

/// Entry point for requests served by hyper.
///
/// CONNECT requests only reach this point when they follow other requests on a kept-alive
/// connection. They are tunneled through hyper's upgrade mechanism, so a chained upstream's
/// answer is not relayed verbatim: the client gets `200` once the tunnel is up, or an error
/// status.
pub async fn handle_request(
    req: Request<Incoming>,
    forwarder: Arc<Forwarder>,
    resolver: Arc<dyn Resolve>,
) -> Result<Response<ProxyBody>, Infallible> {
    let method = req.method().clone();
    let url = req.uri().to_string();
    debug!(method = %method, url = %url, "serve http");

    let result = if method == Method::CONNECT {
        connect(req, resolver).await
    } else {
        forwarder.forward(req).await
    };

    Ok(result.unwrap_or_else(|e| {
        warn!(method = %method, url = %url, error = %e, "could not proxy request");
        error_response(e.status())
    }))
}

async fn connect<B>(mut req: Request<B>, resolver: Arc<dyn Resolve>) -> Result<Response<ProxyBody>, ProxyError> {
    if req.extensions().get::<OnUpgrade>().is_none() {
        return Err(ProxyError::HijackUnsupported);
    }

    let authority = req.uri().authority().map(|a| a.as_str()).unwrap_or_default();
    let target = RequestTarget::connect(authority)?;
    let stream = open_target(resolver.as_ref(), &target).await?;

    let upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => relay_upgraded(upgraded, stream, target).await,
            Err(e) => warn!(url = %target, error = %e, "could not take over connection"),
        }
    });

    Ok(Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed()))
}
