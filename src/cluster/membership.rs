// SWIM-style gossip membership: a gossip loop exchanges full membership
// vectors with a random peer, a probe loop pings every peer and tracks
// suspicion, and per-peer heartbeats feed a phi-accrual detector (see
// `failover.rs`). Member state transitions are monotone along
// `Joining -> Active -> {Leaving -> Dead, Dead}`; suspicion is tracked
// alongside a member rather than as a state of its own, since the
// member-record contract only allows those four states.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::error::{DbError, Result};

pub type MemberId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Joining,
    Active,
    Leaving,
    Dead,
}

impl MemberState {
    /// Whether `self -> next` is an allowed monotone transition.
    fn can_transition_to(self, next: MemberState) -> bool {
        use MemberState::*;
        if next == self {
            return true;
        }
        matches!(
            (self, next),
            (Joining, Active) | (Joining, Dead) | (Active, Leaving) | (Active, Dead) | (Leaving, Dead)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub addr: SocketAddr,
    pub cluster_port: u16,
    pub data_port: u16,
    pub state: MemberState,
    pub joined_at: SystemTime,
    pub last_seen: SystemTime,
    pub metadata: HashMap<String, String>,
    pub version: u64,
    pub partitions: Vec<u32>,
}

impl Member {
    pub fn new(id: MemberId, addr: SocketAddr, cluster_port: u16, data_port: u16) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            addr,
            cluster_port,
            data_port,
            state: MemberState::Joining,
            joined_at: now,
            last_seen: now,
            metadata: HashMap::new(),
            version: 0,
            partitions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Joined(MemberId),
    Left(MemberId),
    Dead(MemberId),
}

/// Tracks a member that has missed a probe ack but has not yet crossed
/// `dead_timeout`.
struct Suspicion {
    since: Instant,
}

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub self_id: MemberId,
    pub gossip_interval: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub dead_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            self_id: String::new(),
            gossip_interval: Duration::from_millis(200),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            dead_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
pub trait MembershipTransport: Send + Sync {
    async fn send_join(&self, seed: &MemberId, info: Member) -> Result<Vec<Member>>;
    async fn send_gossip(&self, peer: &MemberId, vector: Vec<Member>) -> Result<Vec<Member>>;
    async fn send_ping(&self, peer: &MemberId) -> Result<()>;
    async fn send_leave(&self, peer: &MemberId, id: MemberId) -> Result<()>;
}

pub struct Membership<T: MembershipTransport> {
    config: MembershipConfig,
    transport: Arc<T>,
    members: RwLock<HashMap<MemberId, Member>>,
    suspicions: RwLock<HashMap<MemberId, Suspicion>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl<T: MembershipTransport> Membership<T> {
    pub fn new(config: MembershipConfig, transport: Arc<T>, self_info: Member) -> Self {
        let (events, _) = broadcast::channel(256);
        let mut members = HashMap::new();
        members.insert(config.self_id.clone(), self_info);
        Self {
            config,
            transport,
            members: RwLock::new(members),
            suspicions: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    pub fn members(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    pub fn active_peers(&self) -> Vec<MemberId> {
        self.members
            .read()
            .values()
            .filter(|m| m.id != self.config.self_id && m.state == MemberState::Active)
            .map(|m| m.id.clone())
            .collect()
    }

    fn self_snapshot(&self) -> Member {
        self.members.read().get(&self.config.self_id).cloned().expect("self always present")
    }

    /// Contact a seed address with a Join message, merging the full
    /// membership it returns.
    pub async fn join(&self, seed: &MemberId) -> Result<()> {
        let info = self.self_snapshot();
        let response = self.transport.send_join(seed, info).await?;
        self.merge(response);
        let mut members = self.members.write();
        if let Some(me) = members.get_mut(&self.config.self_id) {
            if me.state == MemberState::Joining {
                me.state = MemberState::Active;
                let _ = self.events.send(MembershipEvent::Joined(me.id.clone()));
            }
        }
        Ok(())
    }

    /// Broadcast a Leave message to every known peer.
    pub async fn leave(&self) {
        let peers: Vec<MemberId> = self.members.read().keys().filter(|id| **id != self.config.self_id).cloned().collect();
        for peer in peers {
            let _ = self.transport.send_leave(&peer, self.config.self_id.clone()).await;
        }
        let mut members = self.members.write();
        if let Some(me) = members.get_mut(&self.config.self_id) {
            me.state = MemberState::Leaving;
        }
    }

    /// Merge an incoming membership vector: the entry with the greater
    /// `last_seen` wins, subject to the monotone state-transition graph.
    pub fn merge(&self, incoming: Vec<Member>) {
        let mut members = self.members.write();
        for member in incoming {
            match members.get_mut(&member.id) {
                None => {
                    let event = match member.state {
                        MemberState::Dead => Some(MembershipEvent::Dead(member.id.clone())),
                        _ => Some(MembershipEvent::Joined(member.id.clone())),
                    };
                    members.insert(member.id.clone(), member);
                    if let Some(e) = event {
                        let _ = self.events.send(e);
                    }
                }
                Some(existing) => {
                    if member.last_seen <= existing.last_seen {
                        continue;
                    }
                    let allowed = existing.state.can_transition_to(member.state)
                        || (member.state == MemberState::Joining && member.joined_at > existing.joined_at);
                    if !allowed {
                        continue;
                    }
                    let transitioned_to_dead = member.state == MemberState::Dead && existing.state != MemberState::Dead;
                    *existing = member;
                    if transitioned_to_dead {
                        let _ = self.events.send(MembershipEvent::Dead(existing.id.clone()));
                    }
                }
            }
        }
    }

    /// One round of the gossip loop: pick a random active peer and
    /// exchange full membership vectors.
    pub async fn gossip_once(&self) -> Result<()> {
        let peers = self.active_peers();
        let Some(peer) = peers.choose(&mut rand::rng()) else {
            return Ok(());
        };
        let vector = self.members();
        let response = self.transport.send_gossip(peer, vector).await?;
        self.merge(response);
        Ok(())
    }

    /// One round of the probe loop: ping every non-self peer, tracking
    /// suspicion and dead transitions.
    pub async fn probe_once(&self) {
        let peers: Vec<MemberId> = self
            .members
            .read()
            .values()
            .filter(|m| m.id != self.config.self_id && m.state != MemberState::Dead)
            .map(|m| m.id.clone())
            .collect();

        for peer in peers {
            let ack = tokio::time::timeout(self.config.probe_timeout, self.transport.send_ping(&peer)).await;
            match ack {
                Ok(Ok(())) => {
                    self.suspicions.write().remove(&peer);
                    let mut members = self.members.write();
                    if let Some(m) = members.get_mut(&peer) {
                        m.last_seen = SystemTime::now();
                    }
                }
                _ => self.mark_suspect_or_dead(&peer),
            }
        }
    }

    fn mark_suspect_or_dead(&self, peer: &MemberId) {
        let now = Instant::now();
        let mut suspicions = self.suspicions.write();
        let since = suspicions.entry(peer.clone()).or_insert(Suspicion { since: now }).since;

        if now.duration_since(since) >= self.config.dead_timeout {
            suspicions.remove(peer);
            drop(suspicions);
            let mut members = self.members.write();
            if let Some(m) = members.get_mut(peer) {
                if m.state != MemberState::Dead {
                    m.state = MemberState::Dead;
                    let _ = self.events.send(MembershipEvent::Dead(peer.clone()));
                }
            }
        }
    }

    /// Background driver running the gossip and probe loops until
    /// `shutdown` is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut gossip_ticker = tokio::time::interval(self.config.gossip_interval);
        let mut probe_ticker = tokio::time::interval(self.config.probe_interval);
        loop {
            tokio::select! {
                _ = gossip_ticker.tick() => {
                    if let Err(e) = self.gossip_once().await {
                        tracing::debug!(error = %e, "gossip round failed");
                    }
                }
                _ = probe_ticker.tick() => {
                    self.probe_once().await;
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FailingTransport {
        unreachable: StdMutex<Vec<MemberId>>,
    }

    #[async_trait]
    impl MembershipTransport for FailingTransport {
        async fn send_join(&self, _seed: &MemberId, _info: Member) -> Result<Vec<Member>> {
            Ok(Vec::new())
        }
        async fn send_gossip(&self, _peer: &MemberId, _vector: Vec<Member>) -> Result<Vec<Member>> {
            Ok(Vec::new())
        }
        async fn send_ping(&self, peer: &MemberId) -> Result<()> {
            if self.unreachable.lock().unwrap().contains(peer) {
                Err(DbError::Unavailable("unreachable in test".into()))
            } else {
                Ok(())
            }
        }
        async fn send_leave(&self, _peer: &MemberId, _id: MemberId) -> Result<()> {
            Ok(())
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn merge_prefers_greater_last_seen() {
        let transport = Arc::new(FailingTransport { unreachable: StdMutex::new(Vec::new()) });
        let self_info = Member::new("n1".into(), addr(), 7000, 7001);
        let config = MembershipConfig { self_id: "n1".into(), ..MembershipConfig::default() };
        let membership = Membership::new(config, transport, self_info);

        let mut older = Member::new("n2".into(), addr(), 7000, 7001);
        older.state = MemberState::Active;
        older.last_seen = SystemTime::UNIX_EPOCH;
        membership.merge(vec![older]);

        let mut newer = Member::new("n2".into(), addr(), 7000, 7001);
        newer.state = MemberState::Leaving;
        newer.last_seen = SystemTime::now();
        membership.merge(vec![newer]);

        let n2 = membership.members().into_iter().find(|m| m.id == "n2").unwrap();
        assert_eq!(n2.state, MemberState::Leaving);
    }

    #[test]
    fn stale_update_is_ignored() {
        let transport = Arc::new(FailingTransport { unreachable: StdMutex::new(Vec::new()) });
        let self_info = Member::new("n1".into(), addr(), 7000, 7001);
        let config = MembershipConfig { self_id: "n1".into(), ..MembershipConfig::default() };
        let membership = Membership::new(config, transport, self_info);

        let mut active = Member::new("n2".into(), addr(), 7000, 7001);
        active.state = MemberState::Active;
        active.last_seen = SystemTime::now();
        membership.merge(vec![active]);

        let mut stale = Member::new("n2".into(), addr(), 7000, 7001);
        stale.state = MemberState::Dead;
        stale.last_seen = SystemTime::UNIX_EPOCH;
        membership.merge(vec![stale]);

        let n2 = membership.members().into_iter().find(|m| m.id == "n2").unwrap();
        assert_eq!(n2.state, MemberState::Active);
    }

    #[tokio::test]
    async fn probe_marks_unreachable_peer_dead_after_dead_timeout() {
        let transport = Arc::new(FailingTransport { unreachable: StdMutex::new(vec!["n2".into()]) });
        let self_info = Member::new("n1".into(), addr(), 7000, 7001);
        let config = MembershipConfig {
            self_id: "n1".into(),
            dead_timeout: Duration::from_millis(1),
            probe_timeout: Duration::from_millis(50),
            ..MembershipConfig::default()
        };
        let membership = Membership::new(config, transport, self_info);
        let mut n2 = Member::new("n2".into(), addr(), 7000, 7001);
        n2.state = MemberState::Active;
        membership.merge(vec![n2]);

        membership.probe_once().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        membership.probe_once().await;

        let n2 = membership.members().into_iter().find(|m| m.id == "n2").unwrap();
        assert_eq!(n2.state, MemberState::Dead);
    }
}
