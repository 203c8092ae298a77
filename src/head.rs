//! Reading raw HTTP/1 heads off sockets the hyper server does not own.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProxyError;

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;

/// Reads from `stream` into `buf` until it holds a complete head, returning the head length.
///
/// Bytes following the head stay in `buf`.
pub(crate) async fn read_head<S>(stream: &mut S, buf: &mut BytesMut, limit: usize) -> Result<usize, ProxyError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_head_end(buf) {
            return Ok(end);
        }

        if buf.len() >= limit {
            return Err(ProxyError::HeadTooLarge(limit));
        }

        buf.reserve(READ_CHUNK);
        if stream.read_buf(buf).await? == 0 {
            return Err(ProxyError::MalformedHead("connection closed before end of head".to_string()));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|position| position + 4)
}

/// Request line target of a CONNECT head, e.g. `example.com:443`.
pub(crate) fn parse_connect_target(head: &[u8]) -> Result<String, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::MalformedHead("incomplete request head".to_string()))
        }
        Err(e) => return Err(ProxyError::MalformedHead(e.to_string())),
    }

    match (request.method, request.path) {
        (Some(method), Some(path)) if method.eq_ignore_ascii_case("CONNECT") => Ok(path.to_string()),
        (method, _) => Err(ProxyError::MalformedHead(format!(
            "expected CONNECT, got {}",
            method.unwrap_or("nothing")
        ))),
    }
}

/// Status code and reason of a response head.
pub(crate) fn parse_response_status(head: &[u8]) -> Result<(u16, String), ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::MalformedHead("incomplete response head".to_string()))
        }
        Err(e) => return Err(ProxyError::MalformedHead(e.to_string())),
    }

    let code = response
        .code
        .ok_or_else(|| ProxyError::MalformedHead("missing status code".to_string()))?;

    Ok((code, response.reason.unwrap_or_default().to_string()))
}

#[cfg(test)]
mod head_tests {
    use super::*;

    #[tokio::test]
    async fn test_read_head_keeps_trailing_bytes() {
        let mut stream: &[u8] = b"CONNECT a.example:443 HTTP/1.1\r\nHost: a.example:443\r\n\r\n\x16\x03\x01";
        let mut buf = BytesMut::new();

        let end = read_head(&mut stream, &mut buf, 1024).await.unwrap();
        assert_eq!(&buf[end..], b"\x16\x03\x01");
        assert_eq!(parse_connect_target(&buf[..end]).unwrap(), "a.example:443");
    }

    #[tokio::test]
    async fn test_read_head_limit() {
        let mut stream: &[u8] = b"CONNECT a.example:443 HTTP/1.1\r\nX-Padding: aaaaaaaaaaaaaaaaaaaaaaaa";
        let mut buf = BytesMut::new();

        let result = read_head(&mut stream, &mut buf, 16).await;
        assert!(matches!(result, Err(ProxyError::HeadTooLarge(16))));
    }

    #[tokio::test]
    async fn test_read_head_eof() {
        let mut stream: &[u8] = b"CONNECT a.example:443 HTTP/1.1\r\n";
        let mut buf = BytesMut::new();

        let result = read_head(&mut stream, &mut buf, 1024).await;
        assert!(matches!(result, Err(ProxyError::MalformedHead(_))));
    }

    #[test]
    fn test_parse_connect_target_rejects_other_methods() {
        let result = parse_connect_target(b"GET / HTTP/1.1\r\n\r\n");
        assert!(matches!(result, Err(ProxyError::MalformedHead(_))));
    }

    #[test]
    fn test_parse_response_status() {
        let (code, reason) =
            parse_response_status(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").unwrap();
        assert_eq!(code, 407);
        assert_eq!(reason, "Proxy Authentication Required");
    }
}
