use crate::error::Error;
use crate::frame::{Frame, OpCode};

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    /// Unsolicited or reply pong received from the peer. Pings are answered
    /// by the reader loop and never surface here.
    Pong(Vec<u8>),
}

impl Message {
    // An assembled frame turns into the message variant matching its
    // opcode; text payloads must hold valid UTF-8
    pub fn from_frame(frame: Frame) -> Result<Self, Error> {
        match frame.opcode {
            OpCode::Text => Ok(Message::Text(String::from_utf8(frame.payload)?)),
            OpCode::Binary => Ok(Message::Binary(frame.payload)),
            OpCode::Pong => Ok(Message::Pong(frame.payload)),
            _ => Err(Error::InvalidOpcode),
        }
    }

    pub fn is_pong(&self) -> bool {
        matches!(self, Message::Pong(_))
    }

    /// Payload bytes of the message, whatever its variant.
    pub fn as_binary(&self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(data) | Message::Pong(data) => data.clone(),
        }
    }

    /// Payload rendered as a string, when it holds valid UTF-8.
    pub fn as_text(&self) -> Result<String, Error> {
        match self {
            Message::Text(text) => Ok(text.clone()),
            Message::Binary(data) | Message::Pong(data) => Ok(String::from_utf8(data.clone())?),
        }
    }

    /// Splits a data message into wire frames of at most `fragment_size`
    /// payload bytes each. The message opcode travels on the first frame
    /// only, the rest are continuations, and FIN marks the last one.
    pub fn to_frames(self, fragment_size: usize) -> Result<Vec<Frame>, Error> {
        let (opcode, payload) = match self {
            Message::Text(text) => (OpCode::Text, text.into_bytes()),
            Message::Binary(data) => (OpCode::Binary, data),
            // pongs are control frames; the send path emits them directly
            Message::Pong(_) => return Err(Error::InvalidOpcode),
        };

        if payload.is_empty() {
            return Ok(vec![Frame::new(true, opcode, payload)]);
        }

        let chunks = payload.chunks(fragment_size);
        let last = chunks.len() - 1;
        let frames = chunks
            .enumerate()
            .map(|(i, chunk)| {
                let frame_opcode = if i == 0 {
                    opcode.clone()
                } else {
                    OpCode::Continue
                };
                Frame::new(i == last, frame_opcode, chunk.to_vec())
            })
            .collect();

        Ok(frames)
    }
}
