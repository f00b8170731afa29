use crate::error::Error;
use rustls::ServerConfig as RustlsConfig;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

const DEFAULT_MAX_FRAME_SIZE: usize = 16 << 20;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 << 20;

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub web_socket_config: Option<WebSocketConfig>,
    pub tls_config: Option<Arc<RustlsConfig>>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub web_socket_config: WebSocketConfig,
    /// Extra PEM CA bundle, trusted in addition to the bundled webpki roots.
    pub ca_file: Option<String>,
    /// When false, the server certificate is accepted without verification.
    /// Only meant for self-signed test setups.
    pub check_server_certificate: bool,
    /// Value offered as `Sec-WebSocket-Protocol`. When set, the server must
    /// echo a value back or the handshake fails.
    pub protocol: Option<String>,
    /// Value offered as `Sec-WebSocket-Extensions`. When set, the server
    /// must echo a value back or the handshake fails. The echoed value is
    /// only recorded, never interpreted.
    pub extensions: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            web_socket_config: WebSocketConfig::default(),
            ca_file: None,
            check_server_certificate: true,
            protocol: None,
            extensions: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub max_frame_size: Option<usize>,
    pub max_message_size: Option<usize>,
    /// Outbound data messages are split into fragments of at most this many
    /// payload bytes. Defaults to `max_frame_size`.
    pub fragment_size: Option<usize>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            max_message_size: Some(DEFAULT_MAX_MESSAGE_SIZE),
            max_frame_size: Some(DEFAULT_MAX_FRAME_SIZE),
            fragment_size: None,
        }
    }
}

impl WebSocketConfig {
    pub(crate) fn max_frame_size(&self) -> usize {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub(crate) fn fragment_size(&self) -> usize {
        self.fragment_size.unwrap_or_else(|| self.max_frame_size())
    }
}

/// Loads a PEM certificate chain and private key into a rustls server
/// config, ready to be placed in [`ServerConfig::tls_config`].
pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<Arc<RustlsConfig>, Error> {
    let cert_chain = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| Error::IOError {
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key in file"),
        })?;

    let config = RustlsConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;

    Ok(Arc::new(config))
}
