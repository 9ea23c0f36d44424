//! Minimal HTTP/1.1 front for the relay listener
//!
//! Only the request head is parsed; the tunnel upgrade hands the socket (and
//! any bytes read past the head) to the WebSocket layer.

use super::RelayError;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest request head accepted
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// A parsed request head
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Look up a header value, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Path without the query string
    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or_default()
    }

    /// Validate a WebSocket upgrade request and return its key
    pub fn websocket_key(&self) -> Result<&str, RelayError> {
        if self.method != "GET" {
            return Err(RelayError::BadRequest(format!(
                "{} not allowed for upgrade",
                self.method
            )));
        }
        let upgrade = self.header("upgrade").unwrap_or_default();
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(RelayError::BadRequest("missing websocket upgrade".into()));
        }
        let connection = self.header("connection").unwrap_or_default();
        if !connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        {
            return Err(RelayError::BadRequest("missing connection upgrade".into()));
        }
        if self.header("sec-websocket-version") != Some("13") {
            return Err(RelayError::BadRequest(
                "unsupported websocket version".into(),
            ));
        }
        self.header("sec-websocket-key")
            .filter(|key| !key.is_empty())
            .ok_or_else(|| RelayError::BadRequest("missing websocket key".into()))
    }
}

/// Read one request head, returning it with whatever was read past its end
pub async fn read_request_head<S>(stream: &mut S) -> Result<(RequestHead, Vec<u8>), RelayError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(RelayError::BadRequest(
                "connection closed before request head".into(),
            ));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req
            .parse(&buf)
            .map_err(|e| RelayError::BadRequest(format!("invalid http request: {}", e)))?
        {
            httparse::Status::Complete(n) => {
                let head = RequestHead {
                    method: req.method.unwrap_or_default().to_string(),
                    path: req.path.unwrap_or_default().to_string(),
                    headers: req
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_string(),
                                String::from_utf8_lossy(h.value).trim().to_string(),
                            )
                        })
                        .collect(),
                };
                return Ok((head, buf[n..].to_vec()));
            }
            httparse::Status::Partial => {
                if buf.len() > MAX_HEAD_SIZE {
                    return Err(RelayError::BadRequest("http header too large".into()));
                }
            }
        }
    }
}

/// Write a complete response and flush it
pub async fn write_response<S>(
    stream: &mut S,
    status: u16,
    reason: &str,
    content_type: &str,
    body: &str,
) -> Result<(), RelayError>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        status,
        reason,
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Body of the liveness endpoint
pub fn status_body(connections: usize) -> String {
    serde_json::json!({
        "status": "healthy",
        "version": crate::VERSION,
        "connections": connections,
    })
    .to_string()
}

/// Body served at `/`
pub fn banner_body(ws_path: &str) -> String {
    serde_json::json!({
        "message": "Bridge Tunnel Relay",
        "status": "running",
        "version": crate::VERSION,
        "websocket_endpoint": ws_path,
    })
    .to_string()
}
