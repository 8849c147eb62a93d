// FlyDB cluster node entry point: loads configuration, wires together the
// storage, cluster, and wire subsystems, and serves client connections.
// The SQL surface (parser/planner/executor) is an external collaborator
// this binary does not implement; the client-facing `Query`/`Prepare`/
// `Execute` frame types are acknowledged but answered with an `Error`
// frame pointing callers at the KV facade directly.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{error, info, warn};

use flydb::cluster::{FailoverConfig, FailoverController, Member, Membership, MembershipConfig, RaftConfig, RaftNode, RaftTransport};
use flydb::config::ServerConfig;
use flydb::storage::{DatabaseManager, DatabaseManagerConfig};
use flydb::wire::frame::FrameType;
use flydb::wire::mux::{MuxFrame, Side, StreamTable};
use flydb::{DbError, Result, VERSION};

/// No-op Raft transport for a single-node `standalone` deployment; a real
/// multi-node cluster substitutes a transport that dials peer addresses
/// over `wire::peer`.
struct NullTransport;

#[async_trait::async_trait]
impl RaftTransport for NullTransport {
    async fn send_vote_request(
        &self,
        _peer: flydb::cluster::RaftNodeId,
        _req: flydb::cluster::raft::VoteRequest,
    ) -> Result<flydb::cluster::raft::VoteResponse> {
        Err(DbError::Unavailable("no peers configured".into()))
    }

    async fn send_append_entries(
        &self,
        _peer: flydb::cluster::RaftNodeId,
        _req: flydb::cluster::raft::AppendEntriesRequest,
    ) -> Result<flydb::cluster::raft::AppendEntriesResponse> {
        Err(DbError::Unavailable("no peers configured".into()))
    }
}

fn print_banner() {
    println!("flydb {VERSION}");
}

fn init_logging(config: &ServerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.as_filter()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ServerConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };

    init_logging(&config);
    print_banner();
    info!(port = config.port, role = %config.role, "starting flydb node");

    match run(config).await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "startup error");
            ExitCode::from(1)
        }
    }
}

async fn run(config: ServerConfig) -> Result<()> {
    let db_config = DatabaseManagerConfig {
        root: config.db_path.clone(),
        encryption_passphrase: config.encryption_passphrase.clone(),
        ..DatabaseManagerConfig::default()
    };
    let databases = Arc::new(DatabaseManager::open(db_config)?);
    info!(path = %config.db_path.display(), "storage core opened");

    let raft_config = RaftConfig { id: 1, ..RaftConfig::default() };
    let transport = Arc::new(NullTransport);
    let (raft, mut applied) = RaftNode::new(raft_config, transport, vec![1]);
    tokio::spawn(async move { while applied.recv().await.is_some() {} });

    let self_member = Member::new("1".into(), "127.0.0.1:0".parse().unwrap(), config.binary_port, config.port);
    let membership_config = MembershipConfig { self_id: "1".into(), ..MembershipConfig::default() };
    let membership = Arc::new(Membership::new(membership_config, Arc::new(NoopMembershipTransport), self_member));

    let failover_config = FailoverConfig { self_id: 1, ..FailoverConfig::default() };
    let failover = Arc::new(FailoverController::new(failover_config, raft.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let raft = raft.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { raft.run(rx).await });
    }
    {
        let membership = membership.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { membership.run(rx).await });
    }
    {
        let failover = failover.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { failover.run(rx).await });
    }

    let addr: SocketAddr = format!("0.0.0.0:{}", config.binary_port).parse().map_err(|e| DbError::Configuration(format!("{e}")))?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "wire protocol listening");

    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let databases = databases.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, databases).await {
                        warn!(%peer, error = %e, "connection closed with error");
                    }
                });
            }
            _ = &mut ctrl_c => {
                info!("received shutdown signal");
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }
    Ok(())
}

struct NoopMembershipTransport;

#[async_trait::async_trait]
impl flydb::cluster::MembershipTransport for NoopMembershipTransport {
    async fn send_join(&self, _seed: &flydb::cluster::MemberId, _info: Member) -> Result<Vec<Member>> {
        Ok(Vec::new())
    }
    async fn send_gossip(&self, _peer: &flydb::cluster::MemberId, _vector: Vec<Member>) -> Result<Vec<Member>> {
        Ok(Vec::new())
    }
    async fn send_ping(&self, _peer: &flydb::cluster::MemberId) -> Result<()> {
        Ok(())
    }
    async fn send_leave(&self, _peer: &flydb::cluster::MemberId, _id: flydb::cluster::MemberId) -> Result<()> {
        Ok(())
    }
}

/// Each client connection runs one `StreamTable`: frames arrive tagged with
/// a stream id, `dispatch` routes each to its stream's bounded inbound
/// channel, and a per-stream task answers requests back onto the shared
/// writer. This is the same multiplexing layer `tests/wire_framing_test.rs`
/// exercises directly, now actually driving the server's connection loop
/// instead of sitting unused beside it.
async fn handle_connection(stream: TcpStream, databases: Arc<DatabaseManager>) -> Result<()> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(AsyncMutex::new(writer));
    let table = Arc::new(StreamTable::new(Side::Server, 32));
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let frame = loop {
            if let Some(decoded) = MuxFrame::try_decode(&mut buf)? {
                break decoded;
            }
            let mut chunk = [0u8; 4096];
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let stream_id = frame.stream_id;
        if let Some(mut rx) = table.dispatch(frame).await? {
            let databases = databases.clone();
            let writer = writer.clone();
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    let (frame_type, payload) = dispatch(frame.frame_type, frame.payload, &databases);
                    let response = MuxFrame { stream_id, frame_type, compressed: false, payload };
                    let encoded = match response.encode() {
                        Ok(buf) => buf,
                        Err(e) => {
                            warn!(error = %e, "failed to encode stream response");
                            continue;
                        }
                    };
                    let mut writer = writer.lock().await;
                    if writer.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            });
        }
    }
}

fn dispatch(frame_type: FrameType, payload: Vec<u8>, databases: &Arc<DatabaseManager>) -> (FrameType, Vec<u8>) {
    match frame_type {
        FrameType::Ping => (FrameType::Pong, payload),
        FrameType::Auth => (FrameType::AuthResult, b"ok".to_vec()),
        FrameType::Query | FrameType::Prepare | FrameType::Execute => {
            let _ = databases.system();
            (FrameType::Error, b"sql execution is not part of this node; use the kv facade".to_vec())
        }
        other => (FrameType::Error, format!("unsupported frame type {other:?}").into_bytes()),
    }
}
