//! Cluster core: Raft-style replicated log, SWIM-style gossip membership,
//! and a phi-accrual failover controller. The three communicate through
//! typed broadcast/mpsc event channels rather than back-pointers into each
//! other's internal state.

pub mod failover;
pub mod membership;
pub mod raft;

pub use failover::{FailoverConfig, FailoverController, FailoverEvent, FailoverState, LeaderView, PhiAccrualConfig, PhiAccrualDetector};
pub use membership::{Member, MemberId, MemberState, Membership, MembershipConfig, MembershipEvent, MembershipTransport};
pub use raft::{LogEntry, RaftConfig, RaftNode, RaftNodeId, RaftTransport, Role};
