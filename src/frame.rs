//! Binary frame codec.
//!
//! Every frame is a little-endian, tightly packed record:
//!
//! ```text
//! preamble:u16 control:u16 command:u16 length:u16 param1:u32 param2:u32 data[length-8] [crc:u32]
//! ```
//!
//! `control` carries the number of bytes after the preamble/control prefix in
//! its low 13 bits, the command-direction bit (15) and the CRC-present bit (14).

use thiserror::Error;

use crate::proto::command::Command;

pub const CMD_PREAMBLE: u16 = 0xA583;
pub const RSP_PREAMBLE: u16 = 0x8A35;

pub const HEADER_LEN: usize = 8;
pub const PARAMS_LEN: usize = 8;
pub const CRC_LEN: usize = 4;
/// Smallest well-formed frame: header plus both parameters.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + PARAMS_LEN;

const CTRL_LEN_MASK: u16 = 0x1FFF;
const CTRL_CMD_BIT: u16 = 1 << 15;
const CTRL_CRC_BIT: u16 = 1 << 14;

/// Set on the command code of every reply to a host request.
pub const RSP_FLAG: u16 = 0x8000;

/// Largest `length` that still fits the control word with a CRC trailer.
pub const MAX_LENGTH: usize = CTRL_LEN_MASK as usize - 8;
/// Largest `data` section a single frame can carry.
pub const MAX_DATA: usize = MAX_LENGTH - PARAMS_LEN;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("short frame: need {needed} bytes, have {have}")]
    Short { needed: usize, have: usize },
    #[error("bad preamble {0:#06x}")]
    BadPreamble(u16),
    #[error("control word {control:#06x} disagrees with length {length}")]
    ControlMismatch { control: u16, length: u16 },
    #[error("declared length {declared} but {actual} payload bytes present")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("data of {0} bytes exceeds the frame maximum of {MAX_DATA}")]
    TooLarge(usize),
    #[error("crc mismatch: frame carries {carried:#010x}, computed {computed:#06x}")]
    CrcMismatch { carried: u32, computed: u16 },
    #[error("unknown command code {0:#06x}")]
    UnknownCommand(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Command,
    Response,
}

impl Direction {
    pub fn preamble(self) -> u16 {
        match self {
            Direction::Command => CMD_PREAMBLE,
            Direction::Response => RSP_PREAMBLE,
        }
    }

    pub fn from_preamble(preamble: u16) -> Result<Self, FramingError> {
        match preamble {
            CMD_PREAMBLE => Ok(Direction::Command),
            RSP_PREAMBLE => Ok(Direction::Response),
            other => Err(FramingError::BadPreamble(other)),
        }
    }
}

/// The fixed 8-byte prefix of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub preamble: u16,
    pub control: u16,
    pub command: u16,
    pub length: u16,
}

impl FrameHeader {
    fn new(direction: Direction, command: u16, length: u16, crc: bool) -> Self {
        let mut control = (4 + length) & CTRL_LEN_MASK;
        if crc {
            control = (control + CRC_LEN as u16) | CTRL_CRC_BIT;
        }
        if direction == Direction::Command {
            control |= CTRL_CMD_BIT;
        }
        Self {
            preamble: direction.preamble(),
            control,
            command,
            length,
        }
    }

    /// Parses and validates a header. Only the first [`HEADER_LEN`] bytes are read.
    pub fn parse(bytes: &[u8]) -> Result<Self, FramingError> {
        if bytes.len() < HEADER_LEN {
            return Err(FramingError::Short {
                needed: HEADER_LEN,
                have: bytes.len(),
            });
        }
        let header = Self {
            preamble: read_u16(bytes, 0),
            control: read_u16(bytes, 2),
            command: read_u16(bytes, 4),
            length: read_u16(bytes, 6),
        };
        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<(), FramingError> {
        let direction = self.direction()?;
        let mismatch = FramingError::ControlMismatch {
            control: self.control,
            length: self.length,
        };
        if (self.control & CTRL_CMD_BIT != 0) != (direction == Direction::Command) {
            return Err(mismatch);
        }
        let trailer = if self.has_crc() { CRC_LEN } else { 0 };
        if (self.control & CTRL_LEN_MASK) as usize != 4 + self.length as usize + trailer {
            return Err(mismatch);
        }
        if (self.length as usize) < PARAMS_LEN {
            return Err(FramingError::LengthMismatch {
                declared: self.length as usize,
                actual: PARAMS_LEN,
            });
        }
        Ok(())
    }

    pub fn direction(&self) -> Result<Direction, FramingError> {
        Direction::from_preamble(self.preamble)
    }

    pub fn has_crc(&self) -> bool {
        self.control & CTRL_CRC_BIT != 0
    }

    /// Total on-wire size of the frame this header announces.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.length as usize + if self.has_crc() { CRC_LEN } else { 0 }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.preamble.to_le_bytes());
        out.extend_from_slice(&self.control.to_le_bytes());
        out.extend_from_slice(&self.command.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
    }
}

/// One decoded frame. `code` is kept raw so replies (`command | RSP_FLAG`)
/// re-encode byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub direction: Direction,
    pub code: u16,
    pub param1: u32,
    pub param2: u32,
    pub data: Vec<u8>,
    pub crc: bool,
}

impl Frame {
    pub fn command(command: Command, param1: u32, param2: u32, data: Vec<u8>) -> Self {
        Self {
            direction: Direction::Command,
            code: command.code(),
            param1,
            param2,
            data,
            crc: false,
        }
    }

    pub fn response(code: u16, param1: u32, param2: u32, data: Vec<u8>) -> Self {
        Self {
            direction: Direction::Response,
            code,
            param1,
            param2,
            data,
            crc: false,
        }
    }

    /// The transfer acknowledgement the device sends before accepting bulk data.
    pub fn ack() -> Self {
        Self::response(Command::AckNack.code(), 0, 0, Vec::new())
    }

    pub fn with_crc(mut self, crc: bool) -> Self {
        self.crc = crc;
        self
    }

    /// Command code with the reply flag stripped, used for correlation.
    pub fn opcode(&self) -> u16 {
        self.code & !RSP_FLAG
    }

    pub fn command_kind(&self) -> Result<Command, FramingError> {
        Command::try_from(self.opcode())
    }

    pub fn is_ack(&self) -> bool {
        self.direction == Direction::Response && self.code == Command::AckNack.code()
    }

    pub fn length(&self) -> usize {
        PARAMS_LEN + self.data.len()
    }

    pub fn header(&self) -> Result<FrameHeader, FramingError> {
        if self.data.len() > MAX_DATA {
            return Err(FramingError::TooLarge(self.data.len()));
        }
        Ok(FrameHeader::new(
            self.direction,
            self.code,
            self.length() as u16,
            self.crc,
        ))
    }

    pub fn encode(&self) -> Result<Vec<u8>, FramingError> {
        let header = self.header()?;
        let mut out = Vec::with_capacity(header.frame_len());
        header.write(&mut out);
        out.extend_from_slice(&self.param1.to_le_bytes());
        out.extend_from_slice(&self.param2.to_le_bytes());
        out.extend_from_slice(&self.data);
        if self.crc {
            let crc = crc16(&out) as u32;
            out.extend_from_slice(&crc.to_le_bytes());
        }
        Ok(out)
    }
}

/// Builds a host command frame.
pub fn encode(
    command: Command,
    param1: u32,
    param2: u32,
    data: &[u8],
) -> Result<Vec<u8>, FramingError> {
    Frame::command(command, param1, param2, data.to_vec()).encode()
}

/// Decodes exactly one frame occupying all of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Frame, FramingError> {
    if bytes.len() < MIN_FRAME_LEN {
        // A wrong sentinel is reported as such even on a short read.
        if bytes.len() >= 2 {
            Direction::from_preamble(read_u16(bytes, 0))?;
        }
        return Err(FramingError::Short {
            needed: MIN_FRAME_LEN,
            have: bytes.len(),
        });
    }
    let header = FrameHeader::parse(bytes)?;
    let trailer = if header.has_crc() { CRC_LEN } else { 0 };
    if bytes.len() != header.frame_len() {
        return Err(FramingError::LengthMismatch {
            declared: header.length as usize,
            actual: bytes.len().saturating_sub(HEADER_LEN + trailer),
        });
    }
    let body_end = bytes.len() - trailer;
    if header.has_crc() {
        // The trailer is a u32 whose upper half is always zero.
        let carried = read_u32(bytes, body_end);
        let computed = crc16(&bytes[..body_end]);
        if carried != u32::from(computed) {
            return Err(FramingError::CrcMismatch { carried, computed });
        }
    }
    Ok(Frame {
        direction: header.direction()?,
        code: header.command,
        param1: read_u32(bytes, HEADER_LEN),
        param2: read_u32(bytes, HEADER_LEN + 4),
        data: bytes[MIN_FRAME_LEN..body_end].to_vec(),
        crc: header.has_crc(),
    })
}

/// CRC-16 with the reflected 0x8005 polynomial and a zero seed.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in bytes {
        crc ^= b as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
    }
    crc
}

pub(crate) fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

pub(crate) fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
