use crate::config::{ServerConfig, WebSocketConfig};
use crate::connection::WSConnection;
use crate::error::Error as WsError;
use crate::event::{new_connection_id, Event, EventStream, ID};
use crate::handshake::accept_async_with_config;
use crate::registry::ConnectionRegistry;
use crate::split::WSReader;
use crate::stream::SocketStream;
use futures::StreamExt;
use log::info;
use std::io::Error;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Sender};
use tokio_rustls::{TlsAcceptor, TlsStream};

const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// A ready to use websockets server.
///
/// Binds the given port and returns an [`EventStream`]: the accept loop and
/// all per-connection work run detached, and the application consumes
/// connections, messages, disconnects and errors as stream items.
pub async fn start_server_with_config(
    port: u16,
    config: Option<ServerConfig>,
) -> Result<EventStream, Error> {
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("websocket server listening on port {}", port);

    let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let registry = Arc::new(ConnectionRegistry::new());

    tokio::spawn(accept_loop(
        listener,
        config.unwrap_or_default(),
        events,
        registry.clone(),
    ));

    Ok(EventStream::new(receiver, registry))
}

pub async fn start_server(port: u16) -> Result<EventStream, Error> {
    start_server_with_config(port, None).await
}

// Accepts sockets forever. Each one gets a fresh id, goes through the
// (optional) TLS and websocket handshakes, is registered, announced, and
// then pumped by its own task. The loop only ends once the application
// dropped the EventStream.
async fn accept_loop(
    listener: TcpListener,
    config: ServerConfig,
    events: Sender<Event>,
    registry: Arc<ConnectionRegistry>,
) {
    let acceptor = config.tls_config.clone().map(TlsAcceptor::from);

    loop {
        let id = new_connection_id();

        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(err) => {
                if events.send(Event::Error(id, err.into())).await.is_err() {
                    return;
                }
                continue;
            }
        };

        match open_connection(stream, acceptor.clone(), config.web_socket_config.clone()).await {
            Ok(connection) => {
                let (reader, writer) = connection.split();

                registry.add(id);
                if events.send(Event::NewClient(id, writer)).await.is_err() {
                    registry.remove(id);
                    return;
                }

                tokio::spawn(pump_messages(id, reader, events.clone(), registry.clone()));
            }
            Err(err) => {
                if events.send(Event::Error(id, err)).await.is_err() {
                    return;
                }
            }
        }
    }
}

// Unwraps TLS when an acceptor is configured, then runs the upgrade
async fn open_connection(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    config: Option<WebSocketConfig>,
) -> Result<WSConnection, WsError> {
    let socket_stream = match acceptor {
        Some(acceptor) => SocketStream::Secure(TlsStream::from(acceptor.accept(stream).await?)),
        None => SocketStream::Plain(stream),
    };

    accept_async_with_config(socket_stream, config).await
}

// Forwards one connection's inbound messages into the event channel until
// the connection dies, then unregisters it (waking registry waiters) and
// reports the disconnect
async fn pump_messages(
    id: ID,
    mut reader: WSReader,
    events: Sender<Event>,
    registry: Arc<ConnectionRegistry>,
) {
    while let Some(result) = reader.next().await {
        let delivered = match result {
            Ok(message) => events.send(Event::NewMessage(id, message)).await,
            Err(err) => {
                let _ = events.send(Event::Error(id, err)).await;
                break;
            }
        };
        if delivered.is_err() {
            break;
        }
    }

    registry.remove(id);
    let _ = events.send(Event::Disconnect(id)).await;
}
