//! Framed binary wire protocol: client/server frames, compression-aware
//! codec, stream multiplexing, and cluster peer (Raft/gossip) framing.

pub mod codec;
pub mod frame;
pub mod mux;
pub mod peer;

pub use codec::FrameCodec;
pub use frame::{Frame, FrameType, MAGIC, MAX_PAYLOAD_LEN, VERSION};
pub use mux::{MuxFrame, Side, StreamId, StreamState, StreamTable, MAX_CONCURRENT_STREAMS};
