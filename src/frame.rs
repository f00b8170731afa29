use crate::error::Error;
use time::OffsetDateTime;

/// FIN bit of the first header byte.
pub const BIT_FIN: u8 = 0x80;
/// Mask bit of the second header byte.
pub const BIT_MASK: u8 = 0x80;
/// Payload length code, low 7 bits of the second header byte.
pub const LEN_MASK: u8 = 0x7F;

/// Largest payload a control frame (close, ping, pong) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, PartialEq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(Error::InvalidOpcode),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// One wire frame: a 2-14 byte header, an optional 4-byte mask and a payload.
///
/// `masked` records whether the frame arrived masked on the wire; the payload
/// itself is always stored unmasked. `datestamp` is the wall-clock creation
/// time of the frame, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct Frame {
    pub final_fragment: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    pub masked: bool,
    pub datestamp: OffsetDateTime,
}

impl Frame {
    pub fn new(final_fragment: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            final_fragment,
            opcode,
            payload,
            masked: false,
            datestamp: OffsetDateTime::now_utc(),
        }
    }

    pub(crate) fn incoming(
        final_fragment: bool,
        opcode: OpCode,
        payload: Vec<u8>,
        masked: bool,
    ) -> Self {
        Self {
            final_fragment,
            opcode,
            payload,
            masked,
            datestamp: OffsetDateTime::now_utc(),
        }
    }
}
