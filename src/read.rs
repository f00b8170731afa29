use crate::config::WebSocketConfig;
use crate::connection::{ConnectionState, ConnectionStatus};
use crate::error::Error;
use crate::frame::{Frame, OpCode, BIT_FIN, BIT_MASK, LEN_MASK, MAX_CONTROL_PAYLOAD};
use crate::message::Message;
use crate::write::Writer;
use log::debug;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::mpsc::Sender;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Duration};

/// Bounded number of receive attempts while collecting the peer's close
/// reply after this side sent a close frame.
pub(crate) const MAX_CLOSE_RETRY: u32 = 10;
/// Poll quantum for close-reply attempts.
pub(crate) const CLOSE_RETRY_INTERVAL: Duration = Duration::from_millis(50);
// Guard against peers that announced a payload and then stall mid-frame
const PAYLOAD_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
pub(crate) enum ReaderKind {
    Client,
    Server,
}

#[derive(Clone)]
struct FragmentedMessage {
    fragments: Vec<u8>,
    op_code: OpCode,
}

pub(crate) struct ReadStream<R, W> {
    buf_reader: BufReader<R>,
    kind: ReaderKind,
    fragmented_message: Option<FragmentedMessage>,
    pub(crate) read_tx: Sender<Result<Message, Error>>,
    writer: Arc<Mutex<Writer<W>>>,
    config: WebSocketConfig,
    state: Arc<ConnectionState>,
    close_rx: watch::Receiver<bool>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> ReadStream<R, W> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buf_reader: BufReader<R>,
        kind: ReaderKind,
        read_tx: Sender<Result<Message, Error>>,
        writer: Arc<Mutex<Writer<W>>>,
        config: WebSocketConfig,
        state: Arc<ConnectionState>,
        close_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            buf_reader,
            kind,
            fragmented_message: None,
            read_tx,
            writer,
            config,
            state,
            close_rx,
        }
    }

    /// The reader loop of one connection. Decodes frames, assembles
    /// fragmented messages, answers control frames and reacts to a close
    /// request raised by the writer handle. Returns when the connection has
    /// reached its end of life; the caller broadcasts the final status.
    pub async fn poll_messages(&mut self) -> Result<(), Error> {
        let mut close_rx = self.close_rx.clone();
        loop {
            if *close_rx.borrow_and_update() {
                return self.initiate_close().await;
            }

            let next_frame = tokio::select! {
                biased;
                changed = close_rx.changed() => {
                    // a changed error means every writer handle is gone, so
                    // nothing can be sent on this connection anymore; both
                    // cases close at the top of the loop
                    if changed.is_err() {
                        return self.initiate_close().await;
                    }
                    continue;
                }
                frame = Self::read_frame_from(&mut self.buf_reader, self.kind, &self.config) => frame,
            };

            if !self.handle_frame(next_frame?).await? {
                return Ok(());
            }
        }
    }

    // Returns false once the close handshake completed and the loop must end
    async fn handle_frame(&mut self, frame: Frame) -> Result<bool, Error> {
        match frame.opcode {
            // a data frame without FIN opens a fragmented message, and only
            // one of those may be in flight per connection
            OpCode::Text | OpCode::Binary if !frame.final_fragment => {
                if self.fragmented_message.is_none() {
                    self.fragmented_message = Some(FragmentedMessage {
                        op_code: frame.opcode,
                        fragments: frame.payload,
                    });
                } else {
                    Err(Error::FragmentedInProgress)?
                }
            }
            // continuation frames only make sense inside a fragmented
            // message; they extend the buffered payload in arrival order
            OpCode::Continue => {
                let Some(ref mut fragmented_message) = self.fragmented_message else {
                    return Err(Error::InvalidContinuationFrame);
                };
                fragmented_message
                    .fragments
                    .extend_from_slice(&frame.payload);

                if fragmented_message.fragments.len() > self.config.max_message_size() {
                    Err(Error::MaxMessageSize)?;
                }

                // On the final fragment the whole message is delivered with
                // the opcode of its first frame
                if frame.final_fragment {
                    if let Some(fragmented_message) = self.fragmented_message.take() {
                        self.transmit_message(Frame::new(
                            true,
                            fragmented_message.op_code,
                            fragmented_message.fragments,
                        ))
                        .await?;
                    }
                }
            }
            OpCode::Text | OpCode::Binary => {
                // a fresh data frame may not preempt an unfinished
                // fragmented message
                if self.fragmented_message.is_some() {
                    Err(Error::InvalidFrameFragmentation)?
                }

                self.transmit_message(frame).await?;
            }
            OpCode::Close => {
                // The peer started the close handshake, so we reply with a
                // close frame of our own and stop reading
                debug!("close frame received, finishing the close handshake");
                self.send_close_frame().await?;
                self.state.set_status(ConnectionStatus::Closed);
                return Ok(false);
            }
            OpCode::Ping => {
                self.send_pong_frame(frame.payload).await?;
            }
            OpCode::Pong => {
                // Pongs are not consumed by the loop, the end-user may want
                // to observe them for keepalive accounting
                self.read_tx
                    .send(Ok(Message::Pong(frame.payload)))
                    .await
                    .map_err(|_| Error::CommunicationError)?;
            }
        }
        Ok(true)
    }

    /// Performs the closing handshake from this side: sends a close frame,
    /// then polls a bounded number of times for the peer's close reply so an
    /// unresponsive peer can't hold the shutdown hostage.
    async fn initiate_close(&mut self) -> Result<(), Error> {
        self.send_close_frame().await?;
        self.state.set_status(ConnectionStatus::Closing);

        for _ in 0..MAX_CLOSE_RETRY {
            match timeout(
                CLOSE_RETRY_INTERVAL,
                Self::read_frame_from(&mut self.buf_reader, self.kind, &self.config),
            )
            .await
            {
                Ok(Ok(frame)) if frame.opcode == OpCode::Close => break,
                // data frames still in flight are drained and dropped
                Ok(Ok(_)) => continue,
                // peer is gone or talking garbage, nothing left to wait for
                Ok(Err(_)) => break,
                // quantum elapsed with no frame, try again
                Err(_) => continue,
            }
        }

        self.state.set_status(ConnectionStatus::Closed);
        Ok(())
    }

    async fn send_pong_frame(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        // RFC 6455 wants the ping payload echoed back in the pong
        let pong_frame = Frame::new(true, OpCode::Pong, payload);
        self.writer.lock().await.write_frame(pong_frame).await
    }

    async fn send_close_frame(&mut self) -> Result<(), Error> {
        self.writer
            .lock()
            .await
            .write_frame(Frame::new(true, OpCode::Close, Vec::new()))
            .await
    }

    #[cfg(test)]
    pub(crate) async fn read_frame(&mut self) -> Result<Frame, Error> {
        Self::read_frame_from(&mut self.buf_reader, self.kind, &self.config).await
    }

    async fn read_frame_from(
        buf_reader: &mut BufReader<R>,
        kind: ReaderKind,
        config: &WebSocketConfig,
    ) -> Result<Frame, Error> {
        // byte 0 carries FIN, the three reserved bits and the opcode
        // nibble; byte 1 carries the mask flag and the 7-bit length code
        let mut header = [0u8; 2];
        Self::read_exact_or_disconnect(buf_reader, &mut header).await?;

        let final_fragment = (header[0] & BIT_FIN) != 0;
        let opcode = OpCode::from(header[0] & 0b0000_1111)?;

        // the reserved bits signal extensions, and none is ever negotiated
        if header[0] & 0b0111_0000 != 0 {
            return Err(Error::RSVNotZero);
        }

        // close, ping and pong must fit in a single frame
        if !final_fragment && opcode.is_control() {
            Err(Error::ControlFramesFragmented)?;
        }

        let masked = (header[1] & BIT_MASK) != 0;

        // masking is directional: clients always mask, servers never do,
        // and a frame on the wrong side of that rule kills the connection
        match kind {
            ReaderKind::Server if !masked => Err(Error::UnmaskedFrame)?,
            ReaderKind::Client if masked => Err(Error::MaskedFrame)?,
            _ => {}
        }

        let length_code = header[1] & LEN_MASK;

        // a control payload is capped at 125 bytes, which also forbids the
        // extended length codes
        if opcode.is_control() && length_code as usize > MAX_CONTROL_PAYLOAD {
            Err(Error::ControlFramePayloadSize)?;
        }

        let length = Self::read_payload_length(buf_reader, length_code).await?;
        if length > config.max_frame_size() {
            Err(Error::MaxFrameSize)?;
        }

        let mask = if masked {
            let mut mask = [0u8; 4];
            Self::read_exact_or_disconnect(buf_reader, &mut mask).await?;
            Some(mask)
        } else {
            None
        };

        let mut payload = vec![0u8; length];

        // Bounding the payload read avoids connections that pass the
        // handshake and then trickle a frame forever to pin the reader
        timeout(
            PAYLOAD_READ_TIMEOUT,
            Self::read_exact_or_disconnect(buf_reader, &mut payload),
        )
        .await??;

        // undo the per-frame XOR key; payloads are stored in the clear
        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }

        Ok(Frame::incoming(final_fragment, opcode, payload, masked))
    }

    // A code up to 125 is the payload length itself; 126 and 127 announce
    // a 16-bit or 64-bit big-endian length in the bytes that follow
    async fn read_payload_length(buf_reader: &mut BufReader<R>, code: u8) -> Result<usize, Error> {
        match code {
            126 => {
                let mut ext = [0u8; 2];
                Self::read_exact_or_disconnect(buf_reader, &mut ext).await?;
                Ok(u16::from_be_bytes(ext) as usize)
            }
            127 => {
                let mut ext = [0u8; 8];
                Self::read_exact_or_disconnect(buf_reader, &mut ext).await?;
                Ok(u64::from_be_bytes(ext) as usize)
            }
            code => Ok(code as usize),
        }
    }

    // A short read means the peer went away mid-frame, which the rest of the
    // crate treats differently from a hard IO failure
    async fn read_exact_or_disconnect(
        buf_reader: &mut BufReader<R>,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        match buf_reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Disconnected),
            Err(err) => Err(err.into()),
        }
    }

    async fn transmit_message(&mut self, frame: Frame) -> Result<(), Error> {
        // text payloads are rejected before delivery unless they are UTF-8
        if frame.opcode == OpCode::Text {
            String::from_utf8(frame.payload.clone())?;
        }

        self.read_tx
            .send(Ok(Message::from_frame(frame)?))
            .await
            .map_err(|_| Error::CommunicationError)
    }
}
