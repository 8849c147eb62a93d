// Leader failover: the failover controller feeds peer heartbeats to a
// phi-accrual detector and, once a monitored leader looks dead, walks
// Normal -> Detecting -> Fencing -> Electing -> Promoting -> Normal,
// bumping a fencing token so the ousted leader can never commit again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flydb::cluster::{FailoverConfig, FailoverController, FailoverEvent, LeaderView, RaftNodeId};
use tokio::sync::watch;

struct StubRaft {
    leader: AtomicU64,
}

impl LeaderView for StubRaft {
    fn leader_id(&self) -> Option<RaftNodeId> {
        let v = self.leader.load(Ordering::Acquire);
        if v == 0 {
            None
        } else {
            Some(v)
        }
    }
}

#[tokio::test]
async fn silent_leader_triggers_fencing_then_promotion() {
    let raft = Arc::new(StubRaft { leader: AtomicU64::new(2) });
    let config = FailoverConfig {
        self_id: 1,
        check_interval: Duration::from_millis(20),
        promotion_timeout: Duration::from_millis(500),
        ..FailoverConfig::default()
    };
    let controller = Arc::new(FailoverController::new(config, raft.clone()));

    // A burst of back-to-back heartbeats establishes a near-zero expected
    // inter-arrival time, so once they stop the next tick's elapsed gap
    // looks anomalous immediately.
    for _ in 0..30 {
        controller.on_heartbeat(2);
    }

    let mut events = controller.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_handle = tokio::spawn(controller.clone().run(shutdown_rx));

    let fenced = events.recv().await.unwrap();
    match fenced {
        FailoverEvent::Fenced { peer, token } => {
            assert_eq!(peer, 2);
            assert_eq!(token, 1);
        }
        other => panic!("expected Fenced, got {other:?}"),
    }

    // Simulate the Raft layer electing a new leader mid-promotion-wait.
    raft.leader.store(3, Ordering::Release);

    let promoted = events.recv().await.unwrap();
    match promoted {
        FailoverEvent::Promoted { new_leader } => assert_eq!(new_leader, 3),
        other => panic!("expected Promoted, got {other:?}"),
    }

    let _ = shutdown_tx.send(true);
    run_handle.await.unwrap();
    assert_eq!(controller.fencing_token(), 1);
    assert!(controller.is_fenced(2));
}
