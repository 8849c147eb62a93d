// FlyDB storage/cluster/wire core.
//
// This crate implements the hard core of a distributed SQL database: a
// page-based storage engine with WAL and crash recovery, a Raft-style
// replicated log with SWIM gossip membership and phi-accrual failover, and
// a framed binary wire protocol tying the two together. The SQL surface
// (parser/planner/executor), audit logging, TLS, and client SDKs are
// external collaborators and are not part of this crate.

pub mod cluster;
pub mod compression;
pub mod config;
pub mod error;
pub mod storage;
pub mod wire;

pub use error::{DbError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
