use crate::config::{ClientConfig, WebSocketConfig};
use crate::connection::{ConnectionState, ConnectionStatus, WSConnection};
use crate::error::Error;
use crate::read::{ReadStream, ReaderKind};
use crate::request::{construct_http_request, HttpRequest};
use crate::split::{WSReader, WSWriter};
use crate::stream::SocketStream;
use crate::utils::{generate_websocket_accept_value, generate_websocket_key};
use crate::write::{Writer, WriterKind};
use bytes::BytesMut;
use log::debug;
use pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{timeout, Duration};
use tokio_rustls::{TlsConnector, TlsStream};
use tokio_stream::wrappers::ReceiverStream;

const SWITCHING_PROTOCOLS_RESPONSE: &str =
    "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {}\r\n\r\n";

// Upper bound for the response head a server may send back on the upgrade
const MAX_RESPONSE_HEAD: usize = 4096;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHANNEL_CAPACITY: usize = 100;

/// Negotiation results captured verbatim from the upgrade exchange. The
/// values are recorded for the application, never interpreted.
#[derive(Debug, Clone, Default)]
pub struct Negotiated {
    pub protocol: String,
    pub extensions: String,
}

/// The HTTP response kept for diagnostics when a client upgrade was refused.
#[derive(Debug, Clone, Default)]
pub struct HandshakeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Accepts an incoming stream as a server-side WebSocket connection,
/// performing the HTTP/1.1 upgrade exchange on it.
pub async fn accept_async(stream: impl Into<SocketStream>) -> Result<WSConnection, Error> {
    accept_async_with_config(stream, None).await
}

pub async fn accept_async_with_config(
    stream: impl Into<SocketStream>,
    config: Option<WebSocketConfig>,
) -> Result<WSConnection, Error> {
    let (read_half, mut write_half) = split(stream.into());
    let mut buf_reader = BufReader::new(read_half);

    let request = HttpRequest::parse_http_request(&mut buf_reader).await?;
    let key = validate_upgrade_request(&request)?;

    let accept_value = generate_websocket_accept_value(&key);
    let response = SWITCHING_PROTOCOLS_RESPONSE.replace("{}", &accept_value);
    write_half.write_all(response.as_bytes()).await?;
    write_half.flush().await?;

    // Whatever the client offered is captured as-is; protocol selection and
    // extension semantics stay with the embedding application
    let negotiated = Negotiated {
        protocol: request
            .get_header_value("Sec-WebSocket-Protocol")
            .unwrap_or_default(),
        extensions: request
            .get_header_value("Sec-WebSocket-Extensions")
            .unwrap_or_default(),
    };

    Ok(spawn_connection(
        buf_reader,
        write_half,
        WriterKind::Server,
        negotiated,
        config.unwrap_or_default(),
    ))
}

/// Adopts a socket whose HTTP upgrade was already answered by an embedding
/// host server (which surfaced the raw stream after its 101 response),
/// together with the negotiated values the host settled on.
pub fn accept_upgraded(
    stream: impl Into<SocketStream>,
    negotiated: Negotiated,
    config: Option<WebSocketConfig>,
) -> WSConnection {
    let (read_half, write_half) = split(stream.into());
    spawn_connection(
        BufReader::new(read_half),
        write_half,
        WriterKind::Server,
        negotiated,
        config.unwrap_or_default(),
    )
}

/// Opens a client connection to a `ws://` or `wss://` URL (the `http`/
/// `https` schemes are accepted as aliases).
pub async fn connect_async(url: &str) -> Result<WSConnection, Error> {
    connect_async_with_config(url, None).await
}

pub async fn connect_async_with_config(
    url: &str,
    client_config: Option<ClientConfig>,
) -> Result<WSConnection, Error> {
    let config = client_config.unwrap_or_default();
    let key = generate_websocket_key();
    let upgrade = construct_http_request(url, &key, &config)?;

    let tcp_stream = TcpStream::connect(&upgrade.host_with_port).await?;
    let stream = if upgrade.use_tls {
        let connector = TlsConnector::from(build_tls_client_config(&config)?);
        let domain = ServerName::try_from(upgrade.host.clone())?;
        let tls_stream = connector.connect(domain, tcp_stream).await?;
        SocketStream::Secure(TlsStream::from(tls_stream))
    } else {
        SocketStream::Plain(tcp_stream)
    };

    let (read_half, mut write_half) = split(stream);
    let mut buf_reader = BufReader::new(read_half);

    write_half.write_all(upgrade.request.as_bytes()).await?;
    write_half.flush().await?;

    let negotiated = timeout(
        HANDSHAKE_TIMEOUT,
        verify_upgrade_response(&mut buf_reader, &key, &config),
    )
    .await??;

    Ok(spawn_connection(
        buf_reader,
        write_half,
        WriterKind::Client,
        negotiated,
        config.web_socket_config,
    ))
}

fn validate_upgrade_request(request: &HttpRequest) -> Result<String, Error> {
    if request.method != "GET" || request.version != "HTTP/1.1" {
        return Err(Error::InvalidHTTPHandshake);
    }
    if let Some(version) = request.get_header_value("Sec-WebSocket-Version") {
        if version.trim() != "13" {
            return Err(Error::InvalidHTTPHandshake);
        }
    }

    let connection = request
        .get_header_value("Connection")
        .ok_or(Error::NoConnectionHeaderPresent)?;
    if !connection.to_lowercase().contains("upgrade") {
        return Err(Error::NoConnectionHeaderPresent);
    }

    let upgrade = request
        .get_header_value("Upgrade")
        .ok_or(Error::NoUpgradeHeaderPresent)?;
    if !upgrade.to_lowercase().contains("websocket") {
        return Err(Error::NoUpgradeHeaderPresent);
    }

    request
        .get_header_value("Host")
        .ok_or(Error::NoHostHeaderPresent)?;

    request
        .get_header_value("Sec-WebSocket-Key")
        .ok_or(Error::NoSecWebsocketKey)
}

// Reads the response head and checks everything RFC 6455 requires from a
// 101: status, Upgrade, Connection, the accept hash, and echoes for
// whatever the client offered. On failure the whole response, body
// included, is preserved inside the returned error.
async fn verify_upgrade_response(
    buf_reader: &mut BufReader<ReadHalf<SocketStream>>,
    key: &str,
    config: &ClientConfig,
) -> Result<Negotiated, Error> {
    let head = read_response_head(buf_reader).await?;

    let mut header_slots = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut header_slots);
    if response.parse(&head)?.is_partial() {
        return Err(Error::IncompleteHTTPRequest);
    }

    let status = response.code.unwrap_or(0);
    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut accept_ok = false;
    let mut content_length = 0usize;
    let mut negotiated = Negotiated::default();
    let mut collected: Vec<(String, String)> = Vec::new();

    for header in response.headers.iter() {
        let name = header.name.to_string();
        let value = String::from_utf8_lossy(header.value).trim().to_string();
        match name.to_lowercase().as_str() {
            "upgrade" => upgrade_ok = value.eq_ignore_ascii_case("websocket"),
            "connection" => connection_ok = value.to_lowercase().contains("upgrade"),
            "sec-websocket-accept" => {
                accept_ok = value == generate_websocket_accept_value(key);
            }
            "sec-websocket-protocol" => negotiated.protocol = value.clone(),
            "sec-websocket-extensions" => negotiated.extensions = value.clone(),
            "content-length" => content_length = value.parse().unwrap_or(0),
            _ => {}
        }
        collected.push((name, value));
    }

    let mut accepted = status == 101 && upgrade_ok && connection_ok && accept_ok;
    // An offered protocol or extension must be answered
    if config.protocol.is_some() && negotiated.protocol.is_empty() {
        accepted = false;
    }
    if config.extensions.is_some() && negotiated.extensions.is_empty() {
        accepted = false;
    }

    if accepted {
        return Ok(negotiated);
    }

    debug!("websocket upgrade refused with status {}", status);

    // Keep the refusal body around for the caller's diagnostics
    let mut body = vec![0u8; content_length];
    if content_length > 0 && buf_reader.read_exact(&mut body).await.is_err() {
        body.clear();
    }

    Err(Error::HandshakeFailed {
        response: Box::new(HandshakeResponse {
            status,
            headers: collected,
            body,
        }),
    })
}

async fn read_response_head(
    buf_reader: &mut BufReader<ReadHalf<SocketStream>>,
) -> Result<Vec<u8>, Error> {
    let mut head = BytesMut::with_capacity(MAX_RESPONSE_HEAD);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::IncompleteHTTPRequest);
        }
        buf_reader.read_exact(&mut byte).await?;
        head.extend_from_slice(&byte);
    }

    Ok(head.to_vec())
}

// Shared plumbing of both roles: wires the split stream halves to a writer
// handle and the reader loop, and detaches the loop as its own task. The
// task is the single place that broadcasts the Closed status.
fn spawn_connection(
    buf_reader: BufReader<ReadHalf<SocketStream>>,
    write_half: WriteHalf<SocketStream>,
    kind: WriterKind,
    negotiated: Negotiated,
    config: WebSocketConfig,
) -> WSConnection {
    let reader_kind = match kind {
        WriterKind::Client => ReaderKind::Client,
        WriterKind::Server => ReaderKind::Server,
    };

    let writer = Arc::new(Mutex::new(Writer::new(write_half, kind)));
    let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
    let (close_tx, close_rx) = watch::channel(false);

    let state = Arc::new(ConnectionState::new());
    state.set_status(ConnectionStatus::Open);

    let mut read_stream = ReadStream::new(
        buf_reader,
        reader_kind,
        read_tx,
        writer.clone(),
        config.clone(),
        state.clone(),
        close_rx,
    );

    let task_state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = read_stream.poll_messages().await {
            debug!("reader loop finished with error: {}", err);
            let _ = read_stream.read_tx.send(Err(err)).await;
        }
        task_state.set_status(ConnectionStatus::Closed);
    });

    let ws_writer = WSWriter::new(writer, config, state, close_tx, negotiated);
    WSConnection::new(WSReader::new(ReceiverStream::new(read_rx)), ws_writer)
}

fn build_tls_client_config(config: &ClientConfig) -> Result<Arc<rustls::ClientConfig>, Error> {
    if !config.check_server_certificate {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth();
        return Ok(Arc::new(tls_config));
    }

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_file) = &config.ca_file {
        let mut reader = std::io::BufReader::new(std::fs::File::open(ca_file)?);
        for cert in rustls_pemfile::certs(&mut reader) {
            root_store.add(cert?)?;
        }
    }

    Ok(Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    ))
}

// Verifier that waves any certificate through, for connections made with
// check_server_certificate disabled against self-signed peers
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &pki_types::CertificateDer<'_>,
        _intermediates: &[pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
