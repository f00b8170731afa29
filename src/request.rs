use crate::config::ClientConfig;
use crate::error::Error;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::{timeout, Duration};
use url::Url;

const HTTP_REQUEST_DELIMITER: &str = "\r\n\r\n";

// Everything the client opener needs to reach the server and drive the
// upgrade: the serialized request plus the resolved connect target
pub(crate) struct UpgradeRequest {
    pub request: String,
    pub host_with_port: String,
    pub host: String,
    pub use_tls: bool,
}

// Turns a ws/wss URL into the upgrade request the client sends, along with
// the TCP connect target derived from the same URL
pub(crate) fn construct_http_request(
    ws_url: &str,
    key: &str,
    config: &ClientConfig,
) -> Result<UpgradeRequest, Error> {
    let parsed_url = Url::parse(ws_url)?;

    // the scheme fixes the fallback port and decides whether the opener
    // has to run a TLS handshake before the HTTP exchange
    let (fallback_port, use_tls): (u16, bool) = match parsed_url.scheme() {
        "ws" | "http" => (80, false),
        "wss" | "https" => (443, true),
        _ => return Err(Error::InvalidSchemeURL),
    };

    let host = parsed_url.host_str().ok_or(Error::URLNoHost)?;
    let port = parsed_url.port().unwrap_or(fallback_port);

    // the Host header repeats a port only when the URL spelled one out,
    // while the connect target always needs host and port together
    let request_host_field = match parsed_url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => String::from(host),
    };
    let host_with_port = format!("{}:{}", host, port);

    let request_path = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    // the request is assembled as one string and goes onto the wire as-is
    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nOrigin: {}://{}\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\nContent-Length: 0\r\n",
        request_path,
        request_host_field,
        parsed_url.scheme(),
        host,
        key,
    );

    // userinfo in the URL becomes basic auth on the upgrade request
    if !parsed_url.username().is_empty() {
        let credentials = format!(
            "{}:{}",
            parsed_url.username(),
            parsed_url.password().unwrap_or("")
        );
        request.push_str(&format!(
            "Authorization: Basic {}\r\n",
            BASE64_STANDARD.encode(credentials)
        ));
    }

    if let Some(protocol) = &config.protocol {
        request.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
    }
    if let Some(extensions) = &config.extensions {
        request.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", extensions));
    }
    request.push_str("\r\n");

    Ok(UpgradeRequest {
        request,
        host_with_port,
        host: String::from(host),
        use_tls,
    })
}

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    // Reads and parses one HTTP request head (plus a Content-Length body
    // when announced). The whole read is deadline-bounded so a socket that
    // connects and then goes quiet can't pin the acceptor.
    pub(crate) async fn parse_http_request<R: AsyncRead + Unpin>(
        reader: &mut BufReader<R>,
    ) -> Result<HttpRequest, Error> {
        let mut buffer = String::new();

        timeout(Duration::from_secs(5), async {
            while let Ok(bytes_read) = reader.read_line(&mut buffer).await {
                if bytes_read == 0 || buffer.ends_with(HTTP_REQUEST_DELIMITER) {
                    break;
                }
            }
        })
        .await?;

        let (header_part, _) = buffer
            .split_once(HTTP_REQUEST_DELIMITER)
            .ok_or(Error::IncompleteHTTPRequest)?;

        // request line first: method, uri, version
        let mut lines = header_part.lines();
        let request_line = lines.next().ok_or(Error::InvalidHTTPRequestLine)?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or(Error::InvalidHTTPRequestLine)?.to_string();
        let uri = parts.next().ok_or(Error::InvalidHTTPRequestLine)?.to_string();
        let version = parts.next().ok_or(Error::InvalidHTTPRequestLine)?.to_string();

        // header names are folded to lowercase so lookups are
        // case-insensitive
        let mut headers = HashMap::new();
        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim().to_lowercase(), value.trim().to_string());
            }
        }

        let body = if let Some(content_length) = headers.get("content-length") {
            let length: usize = content_length
                .parse()
                .map_err(|_| Error::InvalidContentLength)?;
            let mut body_buf = vec![0; length];
            reader.read_exact(&mut body_buf).await?;
            body_buf
        } else {
            Vec::new()
        };

        Ok(HttpRequest {
            method,
            uri,
            version,
            headers,
            body,
        })
    }

    pub fn get_header_value(&self, key: &str) -> Option<String> {
        self.headers.get(&key.to_lowercase()).cloned()
    }
}
