use crate::error::Error;
use crate::frame::{Frame, BIT_FIN, BIT_MASK};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub enum WriterKind {
    Client,
    Server,
}

pub struct Writer<W> {
    write_half: W,
    kind: WriterKind,
}

impl<W: AsyncWrite + Unpin> Writer<W> {
    pub fn new(write_half: W, kind: WriterKind) -> Self {
        Self { write_half, kind }
    }

    /// Serializes one frame onto the wire. Client-role writers draw a fresh
    /// 4-byte mask per frame and obscure the payload with it; server-role
    /// writers send the payload as-is.
    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), Error> {
        let mask = match self.kind {
            WriterKind::Client => Some(fresh_mask()),
            WriterKind::Server => None,
        };

        let header = encode_header(&frame, mask.as_ref());
        self.write_half.write_all(&header).await?;

        match mask {
            Some(mask) => {
                let masked: Vec<u8> = frame
                    .payload
                    .iter()
                    .enumerate()
                    .map(|(i, &byte)| byte ^ mask[i % 4])
                    .collect();
                self.write_half.write_all(&masked).await?;
            }
            None => self.write_half.write_all(&frame.payload).await?,
        }
        self.write_half.flush().await?;

        Ok(())
    }
}

// Header layout: FIN|opcode byte, mask-flag|length-code byte, an extended
// length when the code alone can't express it, then the mask key when one
// applies. The length encoding is picked from this frame's own payload
// size: up to 125 bytes inline, up to u16::MAX as 2 extra big-endian
// bytes, anything larger as 8.
fn encode_header(frame: &Frame, mask: Option<&[u8; 4]>) -> Vec<u8> {
    let mut header = Vec::with_capacity(14);

    let mut first = frame.opcode.as_u8();
    if frame.final_fragment {
        first |= BIT_FIN;
    }
    header.push(first);

    let mask_flag = if mask.is_some() { BIT_MASK } else { 0 };
    let payload_len = frame.payload.len();
    if payload_len <= 125 {
        header.push(mask_flag | payload_len as u8);
    } else if payload_len <= u16::MAX as usize {
        header.push(mask_flag | 126);
        header.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        header.push(mask_flag | 127);
        header.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }

    if let Some(mask) = mask {
        header.extend_from_slice(mask);
    }

    header
}

fn fresh_mask() -> [u8; 4] {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    rng.random()
}
