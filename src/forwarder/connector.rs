//! Connector that asks the resolver where each outbound connection should go.

use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use hyper::http::uri::Authority;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_native_tls::{TlsConnector, TlsStream};
use tower_service::Service;
use tracing::debug;

use crate::error::{ProxyError, ResolveError};
use crate::head::{parse_response_status, read_head};
use crate::proxy_types::{RequestTarget, Upstream};
use crate::resolver::Resolve;
use crate::rewind::Rewind;

const TUNNEL_RESPONSE_LIMIT: usize = 64 * 1024;

/// Dials either the origin or the upstream proxy chosen for it.
///
/// Plain `http` destinations behind an upstream are reported as proxied, which makes the
/// client send absolute-form request targets. `https` destinations behind an upstream get a
/// CONNECT tunnel first so TLS can run end to end. `HTTPS` upstreams are spoken to over TLS.
#[derive(Clone)]
pub struct UpstreamConnector {
    resolver: Arc<dyn Resolve>,
    tls: TlsConnector,
}

impl UpstreamConnector {
    pub fn new(resolver: Arc<dyn Resolve>, tls: TlsConnector) -> Self {
        Self { resolver, tls }
    }

    async fn connect(
        resolver: Arc<dyn Resolve>,
        tls: TlsConnector,
        uri: Uri,
    ) -> Result<UpstreamStream, ProxyError> {
        let target = RequestTarget::from_uri(&uri)?;
        let upstream = resolver.resolve(&target).await?;

        let (scheme, host) = match upstream {
            Upstream::Direct => {
                debug!(url = %target, "connecting to target directly");
                let stream = dial(&target.dial_address()).await?;
                return Ok(UpstreamStream::new(UpstreamIo::Tcp { stream }, Bytes::new(), false));
            }
            Upstream::Proxy { scheme, host } => (scheme, host),
        };

        let mut io = dial_upstream(&tls, &scheme, &host).await?;

        if target.scheme() == "https" {
            debug!(url = %target, upstream = %host, "tunneling through upstream proxy");
            let buffered = establish_tunnel(&mut io, &target.dial_address()).await?;
            Ok(UpstreamStream::new(io, buffered, false))
        } else {
            debug!(url = %target, upstream = %host, "forwarding through upstream proxy");
            Ok(UpstreamStream::new(io, Bytes::new(), true))
        }
    }
}

pub(crate) async fn dial(addr: &str) -> Result<TcpStream, ProxyError> {
    let stream = TcpStream::connect(addr).await.map_err(|source| ProxyError::Dial {
        addr: addr.to_string(),
        source,
    })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn dial_upstream(tls: &TlsConnector, scheme: &str, host: &str) -> Result<UpstreamIo, ProxyError> {
    let stream = dial(host).await?;

    if scheme != "https" {
        return Ok(UpstreamIo::Tcp { stream });
    }

    let domain = tls_domain(host)?;
    let stream = tls.connect(&domain, stream).await?;
    Ok(UpstreamIo::Tls { stream })
}

/// Name the upstream certificate is verified against: the host without port or brackets.
fn tls_domain(host: &str) -> Result<String, ProxyError> {
    let authority = Authority::from_str(host)
        .map_err(|e| ResolveError::InvalidTarget(format!("{}: {}", host, e)))?;

    Ok(authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string())
}

/// Asks an upstream proxy to open a tunnel to `authority` and waits for its verdict.
///
/// Returns whatever the upstream already sent past its response head.
pub(crate) async fn establish_tunnel<S>(stream: &mut S, authority: &str) -> Result<Bytes, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut buf = BytesMut::new();
    let end = read_head(stream, &mut buf, TUNNEL_RESPONSE_LIMIT).await?;
    let (code, reason) = parse_response_status(&buf[..end])?;

    if !(200..300).contains(&code) {
        return Err(ProxyError::UpstreamRefused(format!("{} {}", code, reason)));
    }

    Ok(buf.split_off(end).freeze())
}

impl Service<Uri> for UpstreamConnector {
    type Response = UpstreamStream;
    type Error = ProxyError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let resolver = Arc::clone(&self.resolver);
        Box::pin(Self::connect(resolver, self.tls.clone(), uri))
    }
}

pin_project! {
    #[project = UpstreamIoProj]
    enum UpstreamIo {
        Tcp { #[pin] stream: TcpStream },
        Tls { #[pin] stream: TlsStream<TcpStream> },
    }
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.project() {
            UpstreamIoProj::Tcp { stream } => stream.poll_read(cx, buf),
            UpstreamIoProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.project() {
            UpstreamIoProj::Tcp { stream } => stream.poll_write(cx, buf),
            UpstreamIoProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.project() {
            UpstreamIoProj::Tcp { stream } => stream.poll_flush(cx),
            UpstreamIoProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.project() {
            UpstreamIoProj::Tcp { stream } => stream.poll_shutdown(cx),
            UpstreamIoProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

pin_project! {
    /// Connection to an origin or upstream proxy, plain or TLS.
    pub struct UpstreamStream {
        #[pin]
        inner: TokioIo<Rewind<UpstreamIo>>,
        proxied: bool,
    }
}

impl UpstreamStream {
    fn new(io: UpstreamIo, buffered: Bytes, proxied: bool) -> Self {
        Self {
            inner: TokioIo::new(Rewind::new(io, buffered)),
            proxied,
        }
    }
}

impl Connection for UpstreamStream {
    fn connected(&self) -> Connected {
        Connected::new().proxy(self.proxied)
    }
}

impl Read for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl Write for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
