// Wire framing round trips: magic/version validation, the stream
// multiplexer's odd/even id allocation, and cluster peer (Raft/gossip)
// framing, all driven through the public `wire` module.

use flydb::wire::frame::{Frame, FrameType, MAGIC, MAX_PAYLOAD_LEN, VERSION};
use flydb::wire::mux::{MuxFrame, Side, StreamTable};
use flydb::DbError;

#[test]
fn decode_rejects_bad_magic_and_version() {
    let frame = Frame::new(FrameType::Ping, b"hello".to_vec());
    let mut good = frame.encode().unwrap();

    let mut bad_magic = good.clone();
    bad_magic[0] = 0x00;
    assert!(matches!(Frame::try_decode(&mut bad_magic), Err(DbError::InvalidMagic(_))));

    let mut bad_version = good.clone();
    bad_version[1] = 0x09;
    assert!(matches!(Frame::try_decode(&mut bad_version), Err(DbError::InvalidVersion(_))));

    let decoded = Frame::try_decode(&mut good).unwrap().unwrap();
    assert_eq!(decoded.payload, b"hello");
    assert_eq!(MAGIC, 0xFD);
    assert_eq!(VERSION, 0x01);
}

#[test]
fn frame_over_max_payload_is_rejected() {
    let frame = Frame::new(FrameType::QueryResult, vec![0u8; MAX_PAYLOAD_LEN + 1]);
    assert!(frame.encode().is_err());
}

#[test]
fn client_and_server_allocate_disjoint_stream_id_spaces() {
    let client = StreamTable::new(Side::Client, 8);
    let server = StreamTable::new(Side::Server, 8);
    let (c1, _) = client.open().unwrap();
    let (c2, _) = client.open().unwrap();
    let (s1, _) = server.open().unwrap();

    assert_eq!(c1 % 2, 1);
    assert_eq!(c2 % 2, 1);
    assert_eq!(s1 % 2, 0);
}

#[tokio::test]
async fn multiplexer_back_pressure_bounds_a_slow_stream() {
    let table = StreamTable::new(Side::Server, 1);
    let frame = MuxFrame { stream_id: 3, frame_type: FrameType::Query, compressed: false, payload: b"one".to_vec() };
    let rx = table.dispatch(frame).await.unwrap();
    assert!(rx.is_some());

    let second = MuxFrame { stream_id: 3, frame_type: FrameType::Query, compressed: false, payload: b"two".to_vec() };
    let outcome = tokio::time::timeout(std::time::Duration::from_millis(50), table.dispatch(second)).await;
    assert!(outcome.is_err(), "a full bounded channel should block the second send until drained");
}

mod peer_framing {
    use flydb::wire::peer::{encode_gossip_message, encode_raft_message, split_raft_dispatch, try_decode_message, RaftDispatch};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Heartbeat {
        term: u64,
    }

    #[test]
    fn raft_dispatch_byte_survives_the_round_trip() {
        let mut buf = encode_raft_message(RaftDispatch::AppendEntriesRequest, &Heartbeat { term: 42 }).unwrap();
        let body = try_decode_message(&mut buf).unwrap().unwrap();
        let (dispatch, json) = split_raft_dispatch(&body).unwrap();
        assert_eq!(dispatch, RaftDispatch::AppendEntriesRequest);
        let decoded: Heartbeat = serde_json::from_slice(json).unwrap();
        assert_eq!(decoded, Heartbeat { term: 42 });
    }

    #[test]
    fn gossip_messages_carry_no_dispatch_byte() {
        let mut buf = encode_gossip_message(&Heartbeat { term: 7 }).unwrap();
        let body = try_decode_message(&mut buf).unwrap().unwrap();
        let decoded: Heartbeat = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, Heartbeat { term: 7 });
    }
}
