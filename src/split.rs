use crate::config::WebSocketConfig;
use crate::connection::{ConnectionState, ConnectionStatus};
use crate::error::Error;
use crate::frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD};
use crate::handshake::Negotiated;
use crate::message::Message;
use crate::stream::SocketStream;
use crate::write::Writer;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::WriteHalf;
use tokio::sync::{watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;

/// Receiving half of a connection, a stream of the messages the reader loop
/// assembled. Ends after an error item or once the connection closed.
pub struct WSReader {
    read_rx: ReceiverStream<Result<Message, Error>>,
}

impl WSReader {
    pub(crate) fn new(read_rx: ReceiverStream<Result<Message, Error>>) -> Self {
        Self { read_rx }
    }
}

impl Stream for WSReader {
    type Item = Result<Message, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.read_rx).poll_next(cx)
    }
}

/// Sending half of a connection. Cheap to clone; every clone shares the
/// underlying socket writer, and a message is written atomically with
/// respect to other clones.
#[derive(Clone)]
pub struct WSWriter {
    writer: Arc<Mutex<Writer<WriteHalf<SocketStream>>>>,
    config: WebSocketConfig,
    state: Arc<ConnectionState>,
    close_tx: watch::Sender<bool>,
    negotiated: Negotiated,
}

impl WSWriter {
    pub(crate) fn new(
        writer: Arc<Mutex<Writer<WriteHalf<SocketStream>>>>,
        config: WebSocketConfig,
        state: Arc<ConnectionState>,
        close_tx: watch::Sender<bool>,
        negotiated: Negotiated,
    ) -> Self {
        Self {
            writer,
            config,
            state,
            close_tx,
            negotiated,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    pub async fn wait_close(&self, timeout_ms: u64) -> ConnectionStatus {
        self.state.wait_close(timeout_ms).await
    }

    pub fn negotiated_protocol(&self) -> &str {
        &self.negotiated.protocol
    }

    pub fn negotiated_extensions(&self) -> &str {
        &self.negotiated.extensions
    }

    /// Raises the close request observed by the reader loop, which then
    /// performs the closing handshake. Idempotent: only the first call has
    /// an effect, later ones return Ok without sending anything.
    pub fn send_close_signal(&self) -> Result<(), Error> {
        if self.state.request_close() {
            let _ = self.close_tx.send(true);
        }
        Ok(())
    }

    /// Requests the close and then waits until the reader loop finished the
    /// closing handshake, which is bounded against unresponsive peers, so
    /// this returns even when the other side never answers.
    pub async fn close_connection(&mut self) -> Result<(), Error> {
        self.send_close_signal()?;
        self.state.wait_close(0).await;
        Ok(())
    }

    pub async fn send_message(&mut self, message: Message) -> Result<(), Error> {
        self.write_message(message).await
    }

    // Bytes sent through the shorthand go out as a text message
    pub async fn send(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.write_message(Message::Text(String::from_utf8(data)?))
            .await
    }

    pub async fn send_as_binary(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.write_message(Message::Binary(data)).await
    }

    pub async fn send_as_text(&mut self, data: String) -> Result<(), Error> {
        self.write_message(Message::Text(data)).await
    }

    // The ping payload is what the peer is expected to echo in its pong
    pub async fn send_ping(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.write_control(OpCode::Ping, payload).await
    }

    pub async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.write_control(OpCode::Pong, payload).await
    }

    pub(crate) async fn write_message(&mut self, message: Message) -> Result<(), Error> {
        self.ensure_open()?;

        if let Message::Pong(payload) = message {
            return self.write_control(OpCode::Pong, payload).await;
        }

        if message.as_binary().len() > self.config.max_message_size() {
            return Err(Error::MaxMessageSize);
        }

        // Each fragment size is limited by max_frame_size config,
        // that had been given by the user, or the default max frame size
        let fragment_size = self.config.fragment_size();
        if fragment_size > self.config.max_frame_size() {
            return Err(Error::CustomFragmentSizeExceeded(
                fragment_size,
                self.config.max_frame_size(),
            ));
        }

        let frames = message.to_frames(fragment_size)?;
        self.write_frames(frames).await
    }

    // Control frames are never fragmented and carry at most 125 payload bytes
    async fn write_control(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<(), Error> {
        self.ensure_open()?;

        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::ControlFramePayloadSize);
        }

        self.write_frames(vec![Frame::new(true, opcode, payload)])
            .await
    }

    pub(crate) async fn write_frames(&mut self, frames: Vec<Frame>) -> Result<(), Error> {
        // The writer is held for the whole message, so fragments of
        // messages sent from concurrent handles never interleave on the wire
        let mut writer = self.writer.lock().await;
        for frame in frames {
            writer.write_frame(frame).await?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), Error> {
        match self.state.status() {
            ConnectionStatus::Open => Ok(()),
            _ => Err(Error::ConnectionClosed),
        }
    }
}
