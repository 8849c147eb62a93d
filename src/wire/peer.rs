// Cluster peer framing: Raft and gossip messages are JSON-encoded and
// framed by a 4-byte big-endian length prefix (distinct from the client
// frame format in `frame.rs`, which peers do not use). Raft message types
// are dispatched by a single leading byte in `0x10..=0x16`; gossip messages
// carry their type inside the JSON payload instead.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{DbError, Result};

pub const RAFT_DISPATCH_RANGE: std::ops::RangeInclusive<u8> = 0x10..=0x16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RaftDispatch {
    VoteRequest = 0x10,
    VoteResponse = 0x11,
    PreVoteRequest = 0x12,
    PreVoteResponse = 0x13,
    AppendEntriesRequest = 0x14,
    AppendEntriesResponse = 0x15,
    InstallSnapshot = 0x16,
}

impl RaftDispatch {
    pub fn from_u8(b: u8) -> Result<Self> {
        match b {
            0x10 => Ok(RaftDispatch::VoteRequest),
            0x11 => Ok(RaftDispatch::VoteResponse),
            0x12 => Ok(RaftDispatch::PreVoteRequest),
            0x13 => Ok(RaftDispatch::PreVoteResponse),
            0x14 => Ok(RaftDispatch::AppendEntriesRequest),
            0x15 => Ok(RaftDispatch::AppendEntriesResponse),
            0x16 => Ok(RaftDispatch::InstallSnapshot),
            other => Err(DbError::Protocol(format!("unknown raft dispatch byte {other:#x}"))),
        }
    }
}

/// Encode a raft message: dispatch byte followed by its JSON body, the
/// whole thing length-prefixed.
pub fn encode_raft_message(dispatch: RaftDispatch, body: &impl serde::Serialize) -> Result<BytesMut> {
    let json = serde_json::to_vec(body)?;
    let mut out = BytesMut::with_capacity(4 + 1 + json.len());
    out.put_u32((1 + json.len()) as u32);
    out.put_u8(dispatch as u8);
    out.put_slice(&json);
    Ok(out)
}

/// Encode a gossip message: its type lives inside the JSON payload, so the
/// wire framing is just the length prefix plus the JSON body.
pub fn encode_gossip_message(body: &impl serde::Serialize) -> Result<BytesMut> {
    let json = serde_json::to_vec(body)?;
    let mut out = BytesMut::with_capacity(4 + json.len());
    out.put_u32(json.len() as u32);
    out.put_slice(&json);
    Ok(out)
}

/// Try to pull one length-prefixed message out of `buf`, returning the raw
/// body bytes (dispatch byte still attached for Raft messages). `None`
/// means the buffer does not yet hold a complete message.
pub fn try_decode_message(buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len).to_vec()))
}

pub fn split_raft_dispatch(body: &[u8]) -> Result<(RaftDispatch, &[u8])> {
    let &[dispatch_byte, ref rest @ ..] = body else {
        return Err(DbError::Protocol("raft message shorter than dispatch byte".into()));
    };
    Ok((RaftDispatch::from_u8(dispatch_byte)?, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Ping {
        term: u64,
    }

    #[test]
    fn raft_message_round_trips() {
        let mut buf = encode_raft_message(RaftDispatch::VoteRequest, &Ping { term: 5 }).unwrap();
        let body = try_decode_message(&mut buf).unwrap().unwrap();
        let (dispatch, json) = split_raft_dispatch(&body).unwrap();
        assert_eq!(dispatch, RaftDispatch::VoteRequest);
        let decoded: Ping = serde_json::from_slice(json).unwrap();
        assert_eq!(decoded, Ping { term: 5 });
    }

    #[test]
    fn gossip_message_round_trips() {
        let mut buf = encode_gossip_message(&Ping { term: 9 }).unwrap();
        let body = try_decode_message(&mut buf).unwrap().unwrap();
        let decoded: Ping = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, Ping { term: 9 });
    }

    #[test]
    fn incomplete_message_returns_none() {
        let full = encode_raft_message(RaftDispatch::VoteRequest, &Ping { term: 1 }).unwrap();
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(try_decode_message(&mut partial).unwrap().is_none());
    }
}
