//! Binary frames of the realtime socket protocol.
//!
//! Every frame starts with a one-byte opcode. `MSG` carries a 4-byte
//! big-endian length followed by a codec-encoded message; `RECEIPT` carries
//! a message id and timestamp; the remaining opcodes have no payload.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown opcode 0x{0:x}")]
    UnknownOpcode(u8),

    #[error("frame truncated: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    #[error("receipt timestamp width {0} is not 0 or 8")]
    InvalidTimestampWidth(u8),

    #[error("receipt id is not valid UTF-8")]
    InvalidId,

    #[error("receipt id longer than {} bytes", u8::MAX)]
    IdTooLong,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Ping = 0x9,
    Pong = 0xA,
    Ack = 0xB,
    ControlSignal = 0xC,
    Msg = 0xD,
    Receipt = 0xE,
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            0xB => Opcode::Ack,
            0xC => Opcode::ControlSignal,
            0xD => Opcode::Msg,
            0xE => Opcode::Receipt,
            other => return Err(FrameError::UnknownOpcode(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ping,
    Pong,
    Ack,
    ControlSignal,
    /// Codec-encoded message bytes.
    Msg(Vec<u8>),
    Receipt { id: String, timestamp: u64 },
}

const TIMESTAMP_WIDTH: u8 = 8;

impl Frame {
    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::Ping => Opcode::Ping,
            Frame::Pong => Opcode::Pong,
            Frame::Ack => Opcode::Ack,
            Frame::ControlSignal => Opcode::ControlSignal,
            Frame::Msg(_) => Opcode::Msg,
            Frame::Receipt { .. } => Opcode::Receipt,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = vec![self.opcode() as u8];
        match self {
            Frame::Msg(body) => {
                out.reserve(4 + body.len());
                out.extend_from_slice(&(body.len() as u32).to_be_bytes());
                out.extend_from_slice(body);
            }
            Frame::Receipt { id, timestamp } => {
                let id_len = u8::try_from(id.len()).map_err(|_| FrameError::IdTooLong)?;
                out.push(id_len);
                out.push(TIMESTAMP_WIDTH);
                out.extend_from_slice(id.as_bytes());
                out.extend_from_slice(&timestamp.to_be_bytes());
            }
            _ => {}
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (&first, rest) = bytes.split_first().ok_or(FrameError::Empty)?;
        let frame = match Opcode::try_from(first)? {
            Opcode::Ping => Frame::Ping,
            Opcode::Pong => Frame::Pong,
            Opcode::Ack => Frame::Ack,
            Opcode::ControlSignal => Frame::ControlSignal,
            Opcode::Msg => {
                let len = u32::from_be_bytes(take::<4>(rest)?) as usize;
                let body = &rest[4..];
                if body.len() < len {
                    return Err(FrameError::Truncated {
                        needed: len,
                        available: body.len(),
                    });
                }
                return finish(Frame::Msg(body[..len].to_vec()), body.len() - len);
            }
            Opcode::Receipt => {
                let [id_len, width] = take::<2>(rest)?;
                if width != 0 && width != TIMESTAMP_WIDTH {
                    return Err(FrameError::InvalidTimestampWidth(width));
                }
                let needed = 2 + id_len as usize + width as usize;
                if rest.len() < needed {
                    return Err(FrameError::Truncated {
                        needed,
                        available: rest.len(),
                    });
                }
                let id_end = 2 + id_len as usize;
                let id = std::str::from_utf8(&rest[2..id_end])
                    .map_err(|_| FrameError::InvalidId)?
                    .to_string();
                let timestamp = if width == 0 {
                    0
                } else {
                    u64::from_be_bytes(take::<8>(&rest[id_end..])?)
                };
                return finish(Frame::Receipt { id, timestamp }, rest.len() - needed);
            }
        };
        finish(frame, rest.len())
    }
}

fn take<const N: usize>(bytes: &[u8]) -> Result<[u8; N], FrameError> {
    bytes
        .get(..N)
        .and_then(|s| s.try_into().ok())
        .ok_or(FrameError::Truncated {
            needed: N,
            available: bytes.len(),
        })
}

fn finish(frame: Frame, trailing: usize) -> Result<Frame, FrameError> {
    if trailing > 0 {
        return Err(FrameError::TrailingBytes(trailing));
    }
    Ok(frame)
}
