// Stream multiplexer: layers a 4-byte stream id onto the frame header,
// between `flags` and `length`, so many logical request/response streams
// share one transport connection. Clients allocate odd stream ids, servers
// allocate even ones, both counting up monotonically. Each stream gets a
// bounded inbound channel so a slow consumer applies back-pressure without
// blocking the other streams on the connection.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{DbError, Result};
use crate::wire::frame::{FrameType, HEADER_LEN, MAGIC, MAX_PAYLOAD_LEN, VERSION};

pub type StreamId = u32;

pub const MAX_CONCURRENT_STREAMS: usize = 65_536;
const MUX_HEADER_LEN: usize = HEADER_LEN + 4;
const FLAG_COMPRESSED: u8 = 0b0000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosed,
    Closed,
}

#[derive(Debug, Clone)]
pub struct MuxFrame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub compressed: bool,
    pub payload: Vec<u8>,
}

impl MuxFrame {
    pub fn encode(&self) -> Result<BytesMut> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(DbError::Protocol(format!(
                "mux frame payload {} bytes exceeds max {}",
                self.payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        let mut buf = BytesMut::with_capacity(MUX_HEADER_LEN + self.payload.len());
        buf.put_u8(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(if self.compressed { FLAG_COMPRESSED } else { 0 });
        buf.put_u32(self.stream_id);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    pub fn try_decode(buf: &mut BytesMut) -> Result<Option<MuxFrame>> {
        if buf.len() < MUX_HEADER_LEN {
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
        let stream_id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        if length > MAX_PAYLOAD_LEN {
            return Err(DbError::Protocol(format!("mux frame length {length} exceeds max {MAX_PAYLOAD_LEN}")));
        }
        if buf.len() < MUX_HEADER_LEN + length {
            return Ok(None);
        }
        buf.advance(MUX_HEADER_LEN);
        let payload = buf.split_to(length).to_vec();
        Ok(Some(MuxFrame {
            stream_id,
            frame_type,
            compressed: flags & FLAG_COMPRESSED != 0,
            payload,
        }))
    }
}

/// Whether this side of a connection is the stream-id-allocating client
/// (odd ids) or the server (even ids).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

struct Stream {
    state: StreamState,
    inbox: mpsc::Sender<MuxFrame>,
}

/// Per-connection table of open streams. Owns allocation of fresh stream
/// ids and routing of inbound frames to each stream's bounded channel.
pub struct StreamTable {
    side: Side,
    next_id: Mutex<StreamId>,
    streams: Mutex<HashMap<StreamId, Stream>>,
    channel_capacity: usize,
}

impl StreamTable {
    pub fn new(side: Side, channel_capacity: usize) -> Self {
        let first = match side {
            Side::Client => 1,
            Side::Server => 2,
        };
        Self {
            side,
            next_id: Mutex::new(first),
            streams: Mutex::new(HashMap::new()),
            channel_capacity,
        }
    }

    /// Open a new locally-initiated stream, returning its id and the
    /// receiving half of its inbound channel.
    pub fn open(&self) -> Result<(StreamId, mpsc::Receiver<MuxFrame>)> {
        let mut streams = self.streams.lock();
        if streams.len() >= MAX_CONCURRENT_STREAMS {
            return Err(DbError::Capacity("multiplexer: max concurrent streams reached".into()));
        }
        let mut next_id = self.next_id.lock();
        let id = *next_id;
        *next_id += 2;
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        streams.insert(id, Stream { state: StreamState::Open, inbox: tx });
        Ok((id, rx))
    }

    /// Accept a remotely-initiated stream id the first time a frame for it
    /// arrives.
    fn accept(&self, streams: &mut HashMap<StreamId, Stream>, id: StreamId) -> Result<mpsc::Receiver<MuxFrame>> {
        if streams.len() >= MAX_CONCURRENT_STREAMS {
            return Err(DbError::Capacity("multiplexer: max concurrent streams reached".into()));
        }
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        streams.insert(id, Stream { state: StreamState::Open, inbox: tx });
        Ok(rx)
    }

    pub fn state(&self, id: StreamId) -> Option<StreamState> {
        self.streams.lock().get(&id).map(|s| s.state)
    }

    /// Route an inbound frame to its stream, creating the stream if this
    /// side did not originate it. Returns a fresh receiver only the first
    /// time a remote stream is seen; callers that need it should check the
    /// returned `Option`.
    pub async fn dispatch(&self, frame: MuxFrame) -> Result<Option<mpsc::Receiver<MuxFrame>>> {
        let is_remote_initiated = match self.side {
            Side::Client => frame.stream_id % 2 == 0,
            Side::Server => frame.stream_id % 2 == 1,
        };

        let (sender, fresh_rx) = {
            let mut streams = self.streams.lock();
            if !streams.contains_key(&frame.stream_id) {
                if !is_remote_initiated {
                    return Err(DbError::Protocol(format!(
                        "frame for unknown locally-owned stream {}",
                        frame.stream_id
                    )));
                }
                let rx = self.accept(&mut streams, frame.stream_id)?;
                (streams.get(&frame.stream_id).unwrap().inbox.clone(), Some(rx))
            } else {
                (streams.get(&frame.stream_id).unwrap().inbox.clone(), None)
            }
        };

        sender
            .send(frame)
            .await
            .map_err(|_| DbError::Unavailable("multiplexer stream receiver dropped".into()))?;
        Ok(fresh_rx)
    }

    /// Transition a stream toward `HalfClosed`/`Closed` after a terminal
    /// frame from either side, releasing its slot once both sides are done.
    pub fn half_close(&self, id: StreamId) {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get_mut(&id) {
            stream.state = match stream.state {
                StreamState::Open => StreamState::HalfClosed,
                StreamState::HalfClosed => StreamState::Closed,
                StreamState::Closed => StreamState::Closed,
            };
            if stream.state == StreamState::Closed {
                streams.remove(&id);
            }
        }
    }

    /// Force-close a stream immediately, e.g. on cancellation; frees its
    /// slot without leaking the bounded channel.
    pub fn close(&self, id: StreamId) {
        self.streams.lock().remove(&id);
    }

    pub fn open_stream_count(&self) -> usize {
        self.streams.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_frame_round_trips() {
        let frame = MuxFrame { stream_id: 7, frame_type: FrameType::Query, compressed: false, payload: b"hi".to_vec() };
        let mut encoded = frame.encode().unwrap();
        let decoded = MuxFrame::try_decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.stream_id, 7);
        assert_eq!(decoded.payload, b"hi");
    }

    #[test]
    fn client_allocates_odd_ids() {
        let table = StreamTable::new(Side::Client, 8);
        let (id1, _rx1) = table.open().unwrap();
        let (id2, _rx2) = table.open().unwrap();
        assert_eq!(id1 % 2, 1);
        assert_eq!(id2 % 2, 1);
        assert!(id2 > id1);
    }

    #[test]
    fn server_allocates_even_ids() {
        let table = StreamTable::new(Side::Server, 8);
        let (id1, _rx1) = table.open().unwrap();
        assert_eq!(id1 % 2, 0);
    }

    #[tokio::test]
    async fn dispatch_routes_to_originating_stream() {
        let table = StreamTable::new(Side::Client, 8);
        let (id, mut rx) = table.open().unwrap();
        let frame = MuxFrame { stream_id: id, frame_type: FrameType::QueryResult, compressed: false, payload: b"ok".to_vec() };
        table.dispatch(frame).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.payload, b"ok");
    }

    #[tokio::test]
    async fn dispatch_accepts_remote_initiated_stream() {
        let table = StreamTable::new(Side::Client, 8);
        let frame = MuxFrame { stream_id: 2, frame_type: FrameType::Ping, compressed: false, payload: Vec::new() };
        let rx = table.dispatch(frame).await.unwrap();
        assert!(rx.is_some());
    }

    #[test]
    fn half_close_then_close_releases_stream() {
        let table = StreamTable::new(Side::Client, 8);
        let (id, _rx) = table.open().unwrap();
        assert_eq!(table.state(id), Some(StreamState::Open));
        table.half_close(id);
        assert_eq!(table.state(id), Some(StreamState::HalfClosed));
        table.half_close(id);
        assert_eq!(table.state(id), None);
    }
}
