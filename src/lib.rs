//! shardmux - routing and distribution core for a sharded cache proxy.
//!
//! Sits between a protocol/framing layer and many backend cache
//! servers: each pool owns a weighted continuum mapping key hashes to
//! servers, per-server health and ejection state, and a fixed-size
//! multiplexed connection fanout. The registry runs the hot-reload
//! protocol that replaces a pool topology without dropping in-flight
//! requests. Socket I/O and the event loop live outside, behind the
//! [`Driver`] contract.

pub mod config;
pub mod dist;
pub mod driver;
pub mod error;
pub mod hashkit;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod pools;
pub mod server;

pub use config::{Config, LogFormat, LoggingConfig};
pub use dist::DistType;
pub use driver::{ConnId, Driver, SockInfo};
pub use error::{Error, FaultKind};
pub use hashkit::HashType;
pub use pool::{PoolId, ReloadState, ServerPool};
pub use pools::{Completion, Element, Pools};
