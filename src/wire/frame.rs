// Wire frame: `magic(1)=0xFD | version(1) | type(1) | flags(1) | length(4 BE)
// | payload(length)`. Bit 0 of `flags` marks the payload as compressed.
// Magic/version mismatches are rejected before anything else is parsed.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{DbError, Result};

pub const MAGIC: u8 = 0xFD;
pub const VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = 1 + 1 + 1 + 1 + 4;
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

const FLAG_COMPRESSED: u8 = 0b0000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Query = 0,
    QueryResult = 1,
    Error = 2,
    Prepare = 3,
    PrepareResult = 4,
    Execute = 5,
    Deallocate = 6,
    Auth = 7,
    AuthResult = 8,
    Ping = 9,
    Pong = 10,
}

impl FrameType {
    pub fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(FrameType::Query),
            1 => Ok(FrameType::QueryResult),
            2 => Ok(FrameType::Error),
            3 => Ok(FrameType::Prepare),
            4 => Ok(FrameType::PrepareResult),
            5 => Ok(FrameType::Execute),
            6 => Ok(FrameType::Deallocate),
            7 => Ok(FrameType::Auth),
            8 => Ok(FrameType::AuthResult),
            9 => Ok(FrameType::Ping),
            10 => Ok(FrameType::Pong),
            other => Err(DbError::Protocol(format!("unknown frame type {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub compressed: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, compressed: false, payload }
    }

    pub fn compressed(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, compressed: true, payload }
    }

    pub fn encode(&self) -> Result<BytesMut> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(DbError::Protocol(format!(
                "frame payload {} bytes exceeds max {}",
                self.payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(if self.compressed { FLAG_COMPRESSED } else { 0 });
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a frame from a buffer that already holds at least `HEADER_LEN`
    /// bytes. Returns `None` if the payload has not fully arrived yet.
    pub fn try_decode(buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let magic = buf[0];
        if magic != MAGIC {
            return Err(DbError::InvalidMagic(magic));
        }
        let version = buf[1];
        if version != VERSION {
            return Err(DbError::InvalidVersion(version));
        }
        let frame_type = FrameType::from_u8(buf[2])?;
        let flags = buf[3];
        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        if length > MAX_PAYLOAD_LEN {
            return Err(DbError::Protocol(format!("frame length {length} exceeds max {MAX_PAYLOAD_LEN}")));
        }
        if buf.len() < HEADER_LEN + length {
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let payload = buf.split_to(length).to_vec();
        Ok(Some(Frame {
            frame_type,
            compressed: flags & FLAG_COMPRESSED != 0,
            payload,
        }))
    }
}
