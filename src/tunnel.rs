use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use socket2::SockRef;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::forwarder::{dial, establish_tunnel};
use crate::proxy_types::{RequestTarget, Upstream};
use crate::resolver::Resolve;
use crate::rewind::Rewind;

/// Sent to the client when a tunnel to the target itself is ready.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection established\r\n\r\n";

/// A client connection taken over from the HTTP layer.
pub struct Hijacked {
    pub stream: TcpStream,
    /// Bytes the client sent after the CONNECT head.
    pub buffered: Bytes,
}

/// A parsed CONNECT request together with its raw head.
pub struct ConnectRequest {
    pub target: RequestTarget,
    pub head: Bytes,
}

/// Opens a tunnel for a hijacked CONNECT request and relays bytes until both sides are done.
///
/// Both connections are closed when this returns, on every path.
pub async fn tunnel(
    resolver: Arc<dyn Resolve>,
    client: Hijacked,
    request: ConnectRequest,
) -> Result<(), ProxyError> {
    let started = Instant::now();
    let Hijacked {
        stream: mut client,
        buffered,
    } = client;

    let upstream = resolver.resolve(&request.target).await?;

    let mut target = match &upstream {
        Upstream::Direct => {
            debug!(url = %request.target, "establishing tunnel to target directly");
            dial(&request.target.dial_address()).await?
        }
        Upstream::Proxy { host, .. } => {
            debug!(url = %request.target, upstream = %upstream, "establishing tunnel through another proxy");
            dial(host).await?
        }
    };

    match &upstream {
        // the upstream answers the client itself once relaying starts
        Upstream::Proxy { .. } => target.write_all(&request.head).await?,
        Upstream::Direct => client.write_all(CONNECTION_ESTABLISHED).await?,
    }

    if !buffered.is_empty() {
        target.write_all(&buffered).await?;
    }

    let (client_read, client_write) = client.into_split();
    let (target_read, target_write) = target.into_split();

    let to_target = tokio::spawn(pump(client_read, target_write));
    let to_client = tokio::spawn(pump(target_read, client_write));

    let (sent, received) = tokio::join!(to_target, to_client);

    debug!(
        url = %request.target,
        upstream = %upstream,
        sent = sent.unwrap_or_default(),
        received = received.unwrap_or_default(),
        duration = ?started.elapsed(),
        "tunnel closed"
    );

    Ok(())
}

/// Connects to the target of a CONNECT request that was parsed by hyper.
///
/// When routed through another proxy, that proxy is asked for a tunnel and only its verdict
/// is kept; anything it sent after its response head is replayed into the tunnel.
pub(crate) async fn open_target(
    resolver: &dyn Resolve,
    target: &RequestTarget,
) -> Result<Rewind<TcpStream>, ProxyError> {
    let upstream = resolver.resolve(target).await?;

    let Upstream::Proxy { host, .. } = &upstream else {
        debug!(url = %target, "establishing tunnel to target directly");
        let stream = dial(&target.dial_address()).await?;
        return Ok(Rewind::new(stream, Bytes::new()));
    };

    debug!(url = %target, upstream = %upstream, "establishing tunnel through another proxy");
    let mut stream = dial(host).await?;
    let buffered = establish_tunnel(&mut stream, &target.dial_address()).await?;
    Ok(Rewind::new(stream, buffered))
}

/// Relays between an upgraded client connection and its target until both sides are done.
pub(crate) async fn relay_upgraded(client: Upgraded, mut target: Rewind<TcpStream>, url: RequestTarget) {
    let started = Instant::now();
    let mut client = TokioIo::new(client);

    match tokio::io::copy_bidirectional(&mut client, &mut target).await {
        Ok((sent, received)) => debug!(
            url = %url,
            sent,
            received,
            duration = ?started.elapsed(),
            "tunnel closed"
        ),
        Err(e) => warn!(url = %url, error = %e, "error while tunneling data"),
    }
}

/// Copies `src` into `dst` until end of stream, then half-closes both.
async fn pump(mut src: OwnedReadHalf, mut dst: OwnedWriteHalf) -> u64 {
    let copied = match tokio::io::copy(&mut src, &mut dst).await {
        Ok(copied) => copied,
        Err(e) => {
            warn!(error = %e, "error while tunneling data");
            0
        }
    };

    if let Err(e) = SockRef::from(src.as_ref()).shutdown(std::net::Shutdown::Read) {
        debug!(error = %e, "could not close source reader");
    }

    if let Err(e) = dst.shutdown().await {
        debug!(error = %e, "could not close target writer");
    }

    copied
}

#[cfg(test)]
mod tunnel_tests {
    use super::*;
    use crate::resolver::PacResolver;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_direct_tunnel_relays_buffered_bytes() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();

        let (mut client, proxied) = socket_pair().await;
        let request = ConnectRequest {
            target: RequestTarget::connect(&origin_addr.to_string()).unwrap(),
            head: Bytes::new(),
        };
        let hijacked = Hijacked {
            stream: proxied,
            buffered: Bytes::from_static(b"early"),
        };

        let resolver: Arc<dyn Resolve> = Arc::new(PacResolver::direct());
        let handle = tokio::spawn(tunnel(resolver, hijacked, request));

        let (mut accepted, _) = origin.accept().await.unwrap();
        let mut early = [0u8; 5];
        accepted.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"early");

        let mut established = vec![0u8; CONNECTION_ESTABLISHED.len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(established, CONNECTION_ESTABLISHED);

        drop(accepted);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_aborts_without_response() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);

        let (mut client, proxied) = socket_pair().await;
        let request = ConnectRequest {
            target: RequestTarget::connect(&closed_addr.to_string()).unwrap(),
            head: Bytes::new(),
        };
        let hijacked = Hijacked {
            stream: proxied,
            buffered: Bytes::new(),
        };

        let resolver: Arc<dyn Resolve> = Arc::new(PacResolver::direct());
        let result = tunnel(resolver, hijacked, request).await;
        assert!(matches!(result, Err(ProxyError::Dial { .. })));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_open_target_replays_bytes_after_upstream_answer() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut head = Vec::new();
            while !head.ends_with(b"\r\n\r\n") {
                head.push(socket.read_u8().await.unwrap());
            }
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nhello")
                .await
                .unwrap();
        });

        let script = format!(
            "function FindProxyForURL(url, host) {{ return \"PROXY {}\"; }}",
            upstream_addr
        );
        let resolver = PacResolver::from_source(script.into_bytes()).await.unwrap();
        let target = RequestTarget::connect("secure.example:443").unwrap();

        let mut stream = open_target(&resolver, &target).await.unwrap();
        let mut greeting = [0u8; 5];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"hello");
    }
}
