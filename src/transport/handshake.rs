// ABOUTME: HTTP/1.1 upgrade handshake for client WebSocket connections
// ABOUTME: Builds the upgrade request and validates the 101 response

use base64::Engine;
use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use url::Url;

/// Upper bound on the size of the response head
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Failure while opening a WebSocket
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The endpoint could not be parsed
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Only ws, wss, http and https are supported
    #[error("unsupported protocol: {0}")]
    UnsupportedScheme(String),

    /// Dial, read or write failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or negotiation failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// The server answered with something other than 101
    #[error("unexpected response status {status} {reason}")]
    UnexpectedStatus {
        /// HTTP status code
        status: u16,
        /// Reason phrase
        reason: String,
    },

    /// A required upgrade header was missing or wrong
    #[error("invalid upgrade response: {0}")]
    InvalidUpgrade(&'static str),

    /// The response head could not be parsed
    #[error("malformed response: {0}")]
    Malformed(String),

    /// A request header name or value would break the request framing
    #[error("invalid request header: {0}")]
    InvalidHeader(String),
}

/// Parsed WebSocket endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    /// Whether the connection uses TLS
    pub secure: bool,
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Request target (path and query)
    pub resource: String,
}

impl WsUrl {
    /// Parse a `ws://`, `wss://`, `http://` or `https://` endpoint
    pub fn parse(endpoint: &str) -> Result<Self, HandshakeError> {
        let url = Url::parse(endpoint).map_err(|e| HandshakeError::InvalidUrl(e.to_string()))?;

        let secure = match url.scheme() {
            "ws" | "http" => false,
            "wss" | "https" => true,
            other => return Err(HandshakeError::UnsupportedScheme(other.to_string())),
        };

        let host = url
            .host_str()
            .ok_or_else(|| HandshakeError::InvalidUrl(format!("{} has no host", endpoint)))?
            .to_string();
        let port = url.port().unwrap_or(if secure { 443 } else { 80 });

        let mut resource = url.path().to_string();
        if resource.is_empty() {
            resource.push('/');
        }
        if let Some(query) = url.query() {
            resource.push('?');
            resource.push_str(query);
        }

        Ok(Self {
            secure,
            host,
            port,
            resource,
        })
    }

    /// Value for the `Host` header
    pub fn host_header(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Random base64 `Sec-WebSocket-Key`
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// Build the upgrade request
///
/// Header names must be non-empty tokens without `:`, and neither names nor
/// values may contain CR or LF.
pub fn build_request(
    url: &WsUrl,
    key: &str,
    headers: &[(String, String)],
) -> Result<String, HandshakeError> {
    let mut request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n",
        url.resource,
        url.host_header(),
        key
    );

    for (name, value) in headers {
        if name.is_empty() || name.contains(':') || has_line_break(name) {
            return Err(HandshakeError::InvalidHeader(format!("bad name {:?}", name)));
        }
        if has_line_break(value) {
            return Err(HandshakeError::InvalidHeader(format!(
                "line break in value of {}",
                name
            )));
        }
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }

    request.push_str("\r\n");
    Ok(request)
}

fn has_line_break(s: &str) -> bool {
    s.contains(['\r', '\n'])
}

/// Validate a response head (everything before the blank line)
pub fn validate_response(head: &str, key: &str) -> Result<(), HandshakeError> {
    let mut lines = head.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| HandshakeError::Malformed("empty response".to_string()))?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(HandshakeError::Malformed(format!(
            "bad status line: {}",
            status_line
        )));
    }

    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| HandshakeError::Malformed(format!("bad status line: {}", status_line)))?;
    let reason = parts.next().unwrap_or_default().to_string();

    if status != 101 {
        return Err(HandshakeError::UnexpectedStatus { status, reason });
    }

    let mut upgrade = false;
    let mut connection = false;
    let mut accept = None;

    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::Malformed(format!("bad header line: {}", line)))?;
        let value = value.trim();

        match name.trim().to_ascii_lowercase().as_str() {
            "upgrade" => upgrade = value.eq_ignore_ascii_case("websocket"),
            "connection" => {
                connection = value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            }
            "sec-websocket-accept" => accept = Some(value.to_string()),
            _ => {}
        }
    }

    if !upgrade {
        return Err(HandshakeError::InvalidUpgrade("Upgrade: websocket"));
    }
    if !connection {
        return Err(HandshakeError::InvalidUpgrade("Connection: Upgrade"));
    }
    match accept {
        Some(accept) if accept == derive_accept_key(key.as_bytes()) => Ok(()),
        Some(_) => Err(HandshakeError::InvalidUpgrade("Sec-WebSocket-Accept mismatch")),
        None => Err(HandshakeError::InvalidUpgrade("Sec-WebSocket-Accept")),
    }
}

/// Run the client handshake over `stream`
///
/// Returns any bytes the server sent after the response head so the frame
/// decoder can start from them.
pub async fn perform<S>(
    stream: &mut S,
    url: &WsUrl,
    headers: &[(String, String)],
) -> Result<BytesMut, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let request = build_request(url, &key, headers)?;
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    let head_len = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(HandshakeError::Malformed("response head too large".to_string()));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            )));
        }
    };

    let head = buf.split_to(head_len + 4);
    let head = std::str::from_utf8(&head[..head_len])
        .map_err(|_| HandshakeError::Malformed("response head is not UTF-8".to_string()))?;
    validate_response(head, &key)?;

    Ok(buf)
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
