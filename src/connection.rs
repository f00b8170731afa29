use crate::error::Error;
use crate::message::Message;
use crate::split::{WSReader, WSWriter};
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

/// Lifecycle of one connection. `Connecting` only exists while the upgrade
/// exchange runs; the reader loop drives the `Open -> Closing -> Closed`
/// transitions and is the only place that broadcasts `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Shared status cell of one connection: a watch channel so closure can be
/// awaited from any handle, and the one-shot close request flag observed by
/// the reader loop.
pub(crate) struct ConnectionState {
    status: watch::Sender<ConnectionStatus>,
    close_requested: AtomicBool,
}

impl ConnectionState {
    pub(crate) fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        Self {
            status,
            close_requested: AtomicBool::new(false),
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    // First caller wins; every later close request is a no-op
    pub(crate) fn request_close(&self) -> bool {
        self.close_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Waits until the connection reaches `Closed`. A zero timeout waits
    /// indefinitely; otherwise the current status is reported once the
    /// deadline passes.
    pub(crate) async fn wait_close(&self, timeout_ms: u64) -> ConnectionStatus {
        let mut status_rx = self.status.subscribe();
        let closed = async move {
            loop {
                if *status_rx.borrow_and_update() == ConnectionStatus::Closed {
                    return;
                }
                if status_rx.changed().await.is_err() {
                    return;
                }
            }
        };

        if timeout_ms == 0 {
            closed.await;
        } else {
            let _ = timeout(Duration::from_millis(timeout_ms), closed).await;
        }
        self.status()
    }
}

/// One live WebSocket connection: a stream of incoming messages plus the
/// write handle, created by `handshake::accept_async*` on the server side or
/// `handshake::connect_async*` on the client side.
pub struct WSConnection {
    reader: WSReader,
    writer: WSWriter,
}

impl WSConnection {
    pub(crate) fn new(reader: WSReader, writer: WSWriter) -> Self {
        Self { reader, writer }
    }

    /// Splits the connection, so incoming messages can be consumed in one
    /// task while another one holds the writer
    pub fn split(self) -> (WSReader, WSWriter) {
        (self.reader, self.writer)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.writer.status()
    }

    /// Blocks until the connection is fully closed, or until `timeout_ms`
    /// milliseconds passed (zero waits forever). Returns the status observed
    /// when the wait ended.
    pub async fn wait_close(&self, timeout_ms: u64) -> ConnectionStatus {
        self.writer.wait_close(timeout_ms).await
    }

    /// Subprotocol the peer settled on during the handshake, verbatim; empty
    /// when none was negotiated.
    pub fn negotiated_protocol(&self) -> &str {
        self.writer.negotiated_protocol()
    }

    /// Extensions value captured from the handshake, verbatim; empty when
    /// none was negotiated. The value is recorded, never interpreted.
    pub fn negotiated_extensions(&self) -> &str {
        self.writer.negotiated_extensions()
    }

    pub async fn send_message(&mut self, message: Message) -> Result<(), Error> {
        self.writer.send_message(message).await
    }

    // Bytes sent through the shorthand go out as a text message
    pub async fn send(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.writer.send(data).await
    }

    pub async fn send_as_binary(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.writer.send_as_binary(data).await
    }

    pub async fn send_as_text(&mut self, data: String) -> Result<(), Error> {
        self.writer.send_as_text(data).await
    }

    pub async fn send_ping(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.writer.send_ping(payload).await
    }

    /// Requests the closing handshake without waiting for it to finish.
    /// Calling it again is safe and sends nothing further.
    pub fn send_close_signal(&self) -> Result<(), Error> {
        self.writer.send_close_signal()
    }

    /// Performs the full closing handshake: requests the close and waits
    /// until the connection reached `Closed`
    pub async fn close_connection(&mut self) -> Result<(), Error> {
        self.writer.close_connection().await
    }
}

impl Stream for WSConnection {
    type Item = Result<Message, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.reader).poll_next(cx)
    }
}
