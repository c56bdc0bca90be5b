//! caucus-raft: an embeddable Raft consensus participant.
//!
//! One [`Node`] per process member:
//! - Leader election with randomized timeouts and pulse-based failure
//!   detection
//! - Log replication with per-follower cursors and fast backoff
//! - Commit certification against exact quorum agreement
//!
//! The node is a library component: the host supplies a durable [`Store`], a
//! message [`Connector`], and [`Timers`] (tokio-backed in production, manual
//! in tests), then drives it with client requests. Everything else — vote
//! bookkeeping, the log merge, commit advancement, role transitions — happens
//! inside as reactions to messages and timer expiries.
//!
//! Based on the Raft paper (Ongaro & Ousterhout, 2014); log compaction and
//! joint-consensus membership changes are out of scope.
//!
//! ```no_run
//! use caucus_raft::{InMemoryConnector, InMemoryStore, Node, NodeId, RaftConfig, Timers};
//! use std::sync::Arc;
//!
//! # #[tokio::main] async fn main() -> caucus_raft::Result<()> {
//! let connector = Arc::new(InMemoryConnector::new());
//! let node = Node::new(
//!     Box::new(InMemoryStore::new()),
//!     Timers::tokio(),
//!     connector,
//!     RaftConfig::default(),
//!     NodeId(1),
//! )?;
//! node.on_client_request("set x = 1")?;
//! # Ok(()) }
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod node;
pub mod quorum;
pub mod store;
pub mod timer;
pub mod types;

pub use config::RaftConfig;
pub use connector::{Connector, InMemoryConnector, LoggingConnector, MessageHandler};
pub use error::{RaftError, Result};
pub use node::Node;
pub use quorum::Quorum;
pub use store::{DurableState, FileStore, InMemoryStore, Store};
pub use timer::{ElectionTimeout, Heart, ManualTimers, PulseMonitor, TimerCallback, Timers};
pub use types::*;
