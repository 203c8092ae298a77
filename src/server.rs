use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::config::ListenerConfig;
use crate::error::ProxyError;
use crate::forwarder::Forwarder;
use crate::handler::handle_request;
use crate::head::{parse_connect_target, read_head};
use crate::proxy_types::RequestTarget;
use crate::resolver::Resolve;
use crate::rewind::Rewind;
use crate::tunnel::{tunnel, ConnectRequest, Hijacked};

const CONNECT_PREFIX: &[u8] = b"CONNECT ";

/// hyper refuses read buffers smaller than this.
const MIN_BUF_SIZE: usize = 8192;

/// Accepts proxy clients and dispatches each connection to the forwarder or the tunnel.
pub struct ProxyServer {
    resolver: Arc<dyn Resolve>,
    forwarder: Arc<Forwarder>,
    config: ListenerConfig,
}

impl ProxyServer {
    pub fn new(resolver: Arc<dyn Resolve>, config: ListenerConfig) -> Result<Self, ProxyError> {
        let forwarder = Arc::new(Forwarder::new(Arc::clone(&resolver))?);
        Ok(Self {
            resolver,
            forwarder,
            config,
        })
    }

    /// Serves connections until accepting fails.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let server = Arc::new(self);

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&server);

            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream, peer).await {
                    warn!(peer = %peer, error = %e, "connection failed");
                }
            });
        }
    }

    async fn serve_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<(), ProxyError> {
        let mut buf = BytesMut::new();
        let is_connect = tokio::time::timeout(
            self.config.read_header_timeout,
            sniff_connect(&mut stream, &mut buf),
        )
        .await
        .map_err(|_| ProxyError::Timeout)??;

        match is_connect {
            Some(true) => self.hijack(stream, buf, peer).await,
            Some(false) => self.serve_http(stream, buf.freeze()).await,
            None => Ok(()),
        }
    }

    async fn serve_http(&self, stream: TcpStream, prefix: Bytes) -> Result<(), ProxyError> {
        let forwarder = Arc::clone(&self.forwarder);
        let resolver = Arc::clone(&self.resolver);
        let service = service_fn(move |req| {
            handle_request(req, Arc::clone(&forwarder), Arc::clone(&resolver))
        });

        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.read_header_timeout)
            .max_buf_size(self.config.max_header_bytes.max(MIN_BUF_SIZE))
            .serve_connection(TokioIo::new(Rewind::new(stream, prefix)), service)
            .with_upgrades()
            .await?;

        Ok(())
    }

    async fn hijack(&self, mut stream: TcpStream, mut buf: BytesMut, peer: SocketAddr) -> Result<(), ProxyError> {
        let request = tokio::time::timeout(
            self.config.read_header_timeout,
            read_connect(&mut stream, &mut buf, self.config.max_header_bytes),
        )
        .await
        .map_err(|_| ProxyError::Timeout)
        .and_then(|request| request);

        let request = match request {
            Ok(request) => request,
            Err(e @ (ProxyError::MalformedHead(_) | ProxyError::HeadTooLarge(_))) => {
                let status = e.status();
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or_default()
                );
                stream.write_all(response.as_bytes()).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let url = request.target.to_string();
        debug!(peer = %peer, url = %url, "hijacked connection for tunnel");

        let client = Hijacked {
            stream,
            buffered: buf.freeze(),
        };

        if let Err(e) = tunnel(Arc::clone(&self.resolver), client, request).await {
            warn!(method = "CONNECT", url = %url, error = %e, "could not proxy request");
        }

        Ok(())
    }
}

/// Reads just enough to tell whether the connection opens with a CONNECT request.
///
/// Returns `None` when the client closed without sending anything.
async fn sniff_connect(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<Option<bool>, ProxyError> {
    while buf.len() < CONNECT_PREFIX.len() {
        if !CONNECT_PREFIX.starts_with(&buf[..]) {
            return Ok(Some(false));
        }

        if stream.read_buf(buf).await? == 0 {
            return Ok((!buf.is_empty()).then_some(false));
        }
    }

    Ok(Some(buf.starts_with(CONNECT_PREFIX)))
}

/// Reads and parses a CONNECT head, leaving any bytes after it in `buf`.
async fn read_connect(stream: &mut TcpStream, buf: &mut BytesMut, limit: usize) -> Result<ConnectRequest, ProxyError> {
    let end = read_head(stream, buf, limit).await?;
    let head = buf.split_to(end).freeze();

    let authority = parse_connect_target(&head)?;
    let target = RequestTarget::connect(&authority)
        .map_err(|e| ProxyError::MalformedHead(e.to_string()))?;

    Ok(ConnectRequest { target, head })
}
