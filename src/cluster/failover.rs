// Phi-accrual failure detection and the failover control loop. Each
// monitored peer gets its own detector tracking heartbeat inter-arrival
// times; once the leader's phi crosses `failure_threshold` the controller
// walks `Normal -> Detecting -> Fencing -> Electing -> Promoting -> Normal`,
// bumping a monotonic fencing token along the way so a recovering old
// leader can never commit again.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};

use crate::cluster::membership::MembershipEvent;
use crate::cluster::raft::{RaftNodeId, RaftNode, RaftTransport};

#[derive(Debug, Clone)]
struct PhiState {
    history: VecDeque<Duration>,
    last_heartbeat: Option<Instant>,
    mean: f64,
    variance: f64,
    sample_count: u64,
}

impl PhiState {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            last_heartbeat: None,
            mean: 0.0,
            variance: 0.0,
            sample_count: 0,
        }
    }

    fn record(&mut self, now: Instant, max_samples: usize) {
        if let Some(last) = self.last_heartbeat {
            let interval = now.duration_since(last);
            self.history.push_back(interval);
            if self.history.len() > max_samples {
                self.history.pop_front();
            }
            self.recompute();
            self.sample_count += 1;
        }
        self.last_heartbeat = Some(now);
    }

    fn recompute(&mut self) {
        if self.history.is_empty() {
            return;
        }
        let sum: Duration = self.history.iter().copied().sum();
        self.mean = sum.as_secs_f64() / self.history.len() as f64;
        let variance_sum: f64 = self
            .history
            .iter()
            .map(|d| {
                let diff = d.as_secs_f64() - self.mean;
                diff * diff
            })
            .sum();
        self.variance = variance_sum / self.history.len() as f64;
    }

    fn phi(&self, now: Instant, min_samples: u64) -> f64 {
        let Some(last) = self.last_heartbeat else { return 0.0 };
        if self.sample_count < min_samples {
            return 0.0;
        }
        let elapsed = now.duration_since(last).as_secs_f64();
        let p = self.survival_probability(elapsed);
        if p <= 0.0 {
            return f64::INFINITY;
        }
        -p.log10()
    }

    /// `1 - F(elapsed; mean, variance)` via the Abramowitz-Stegun normal
    /// CDF approximation.
    fn survival_probability(&self, elapsed: f64) -> f64 {
        if self.mean <= 0.0 || self.variance <= 0.0 {
            return 1.0;
        }
        let std_dev = self.variance.sqrt();
        let z = (elapsed - self.mean) / std_dev;
        let t = 1.0 / (1.0 + 0.2316419 * z.abs());
        let d = 0.3989423 * (-z * z / 2.0).exp();
        let p = d * t * (0.3193815 + t * (-0.3565638 + t * (1.781478 + t * (-1.821256 + t * 1.330274))));
        if z > 0.0 {
            p
        } else {
            1.0 - p
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhiAccrualConfig {
    pub max_samples: usize,
    pub min_samples: u64,
    pub failure_threshold: f64,
}

impl Default for PhiAccrualConfig {
    fn default() -> Self {
        Self { max_samples: 1000, min_samples: 2, failure_threshold: 8.0 }
    }
}

/// One phi-accrual detector per monitored peer.
pub struct PhiAccrualDetector {
    config: PhiAccrualConfig,
    states: RwLock<HashMap<RaftNodeId, PhiState>>,
}

impl PhiAccrualDetector {
    pub fn new(config: PhiAccrualConfig) -> Self {
        Self { config, states: RwLock::new(HashMap::new()) }
    }

    pub fn record_heartbeat(&self, peer: RaftNodeId) {
        let now = Instant::now();
        let mut states = self.states.write();
        states.entry(peer).or_insert_with(PhiState::new).record(now, self.config.max_samples);
    }

    pub fn phi(&self, peer: RaftNodeId) -> f64 {
        let now = Instant::now();
        self.states.read().get(&peer).map(|s| s.phi(now, self.config.min_samples)).unwrap_or(0.0)
    }

    pub fn is_suspected(&self, peer: RaftNodeId) -> bool {
        self.phi(peer) > self.config.failure_threshold
    }

    pub fn remove(&self, peer: RaftNodeId) {
        self.states.write().remove(&peer);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FailoverState {
    Normal = 0,
    Detecting = 1,
    Fencing = 2,
    Electing = 3,
    Promoting = 4,
}

impl FailoverState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FailoverState::Normal,
            1 => FailoverState::Detecting,
            2 => FailoverState::Fencing,
            3 => FailoverState::Electing,
            _ => FailoverState::Promoting,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FailoverEvent {
    Fenced { peer: RaftNodeId, token: u64 },
    Promoted { new_leader: RaftNodeId },
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub self_id: RaftNodeId,
    pub check_interval: Duration,
    pub promotion_timeout: Duration,
    pub phi: PhiAccrualConfig,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            self_id: 0,
            check_interval: Duration::from_millis(250),
            promotion_timeout: Duration::from_secs(10),
            phi: PhiAccrualConfig::default(),
        }
    }
}

/// Source of the current leader id and term, satisfied by `RaftNode` in
/// production and a stub in tests; keeps this module decoupled from the
/// concrete `RaftTransport` type parameter.
pub trait LeaderView: Send + Sync {
    fn leader_id(&self) -> Option<RaftNodeId>;
}

impl<T: RaftTransport + 'static> LeaderView for RaftNode<T> {
    fn leader_id(&self) -> Option<RaftNodeId> {
        RaftNode::leader_id(self)
    }
}

pub struct FailoverController<L: LeaderView> {
    config: FailoverConfig,
    raft: std::sync::Arc<L>,
    detector: PhiAccrualDetector,
    state: AtomicU8,
    fencing_token: AtomicU64,
    fenced_peer: RwLock<Option<RaftNodeId>>,
    events: broadcast::Sender<FailoverEvent>,
}

impl<L: LeaderView + 'static> FailoverController<L> {
    pub fn new(config: FailoverConfig, raft: std::sync::Arc<L>) -> Self {
        let detector = PhiAccrualDetector::new(config.phi.clone());
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            raft,
            detector,
            state: AtomicU8::new(FailoverState::Normal as u8),
            fencing_token: AtomicU64::new(0),
            fenced_peer: RwLock::new(None),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailoverEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> FailoverState {
        FailoverState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn fencing_token(&self) -> u64 {
        self.fencing_token.load(Ordering::Acquire)
    }

    pub fn is_fenced(&self, peer: RaftNodeId) -> bool {
        *self.fenced_peer.read() == Some(peer)
    }

    fn set_state(&self, state: FailoverState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Feed a heartbeat from a peer into its phi-accrual detector.
    pub fn on_heartbeat(&self, peer: RaftNodeId) {
        self.detector.record_heartbeat(peer);
    }

    /// Consume membership events so a peer declared dead by gossip is also
    /// removed from phi tracking.
    pub fn on_membership_event(&self, event: MembershipEvent) {
        if let MembershipEvent::Dead(id) = event {
            if let Ok(peer) = id.parse::<RaftNodeId>() {
                self.detector.remove(peer);
            }
        }
    }

    /// One control-loop tick: check the current leader's phi and drive the
    /// failover state machine if it has crossed the threshold.
    pub async fn tick(&self) {
        let Some(leader) = self.raft.leader_id() else { return };
        if leader == self.config.self_id {
            return;
        }
        if self.state() != FailoverState::Normal {
            return;
        }
        if self.detector.is_suspected(leader) {
            self.run_failover(leader).await;
        }
    }

    async fn run_failover(&self, ousted: RaftNodeId) {
        self.set_state(FailoverState::Detecting);
        self.set_state(FailoverState::Fencing);
        let token = self.fencing_token.fetch_add(1, Ordering::AcqRel) + 1;
        *self.fenced_peer.write() = Some(ousted);
        let _ = self.events.send(FailoverEvent::Fenced { peer: ousted, token });

        self.set_state(FailoverState::Electing);
        // Raft's own heartbeat timer independently starts an election; the
        // controller only waits for it to conclude.

        self.set_state(FailoverState::Promoting);
        let deadline = Instant::now() + self.config.promotion_timeout;
        loop {
            if let Some(new_leader) = self.raft.leader_id() {
                if new_leader != ousted {
                    let _ = self.events.send(FailoverEvent::Promoted { new_leader });
                    break;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.set_state(FailoverState::Normal);
    }

    /// Background driver running the control loop until `shutdown` fires.
    pub async fn run(self: std::sync::Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;
    use std::sync::Arc;

    struct StubLeader {
        leader: StdAtomicU64,
    }

    impl LeaderView for StubLeader {
        fn leader_id(&self) -> Option<RaftNodeId> {
            let v = self.leader.load(Ordering::Acquire);
            if v == 0 {
                None
            } else {
                Some(v)
            }
        }
    }

    #[test]
    fn from_u8_round_trips_every_discriminant() {
        for state in [
            FailoverState::Normal,
            FailoverState::Detecting,
            FailoverState::Fencing,
            FailoverState::Electing,
            FailoverState::Promoting,
        ] {
            assert_eq!(FailoverState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn phi_stays_low_under_steady_heartbeats() {
        let detector = PhiAccrualDetector::new(PhiAccrualConfig::default());
        let mut t = Instant::now();
        for _ in 0..100 {
            detector.record_heartbeat(1);
            t += Duration::from_millis(100);
        }
        assert!(detector.phi(1) < 3.0);
    }

    #[tokio::test]
    async fn suspected_leader_triggers_fencing_and_returns_to_normal() {
        let raft = Arc::new(StubLeader { leader: StdAtomicU64::new(2) });
        let config = FailoverConfig {
            self_id: 1,
            promotion_timeout: Duration::from_millis(200),
            ..FailoverConfig::default()
        };
        let controller = Arc::new(FailoverController::new(config, raft.clone()));

        for _ in 0..20 {
            controller.on_heartbeat(2);
        }

        // Simulate the old leader going silent long enough to look failed,
        // then a new leader being elected mid-promotion-wait.
        let mut events = controller.subscribe();
        let controller2 = controller.clone();
        let raft2 = raft.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            raft2.leader.store(3, Ordering::Release);
            controller2.run_failover(2).await;
        });

        let fenced = events.recv().await.unwrap();
        assert!(matches!(fenced, FailoverEvent::Fenced { peer: 2, .. }));
        let promoted = events.recv().await.unwrap();
        assert!(matches!(promoted, FailoverEvent::Promoted { new_leader: 3 }));
        handle.await.unwrap();
        assert_eq!(controller.state(), FailoverState::Normal);
        assert_eq!(controller.fencing_token(), 1);
        assert!(controller.is_fenced(2));
    }
}
