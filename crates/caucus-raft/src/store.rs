//! Durable consensus state and the store seam.
//!
//! The node persists three things: its current term, its vote for that term,
//! and the log. A write mutates all three atomically — the mutation closure
//! sees the full [`DurableState`] and the result is durable before `write`
//! returns, so the node never observes a partially persisted update.

use crate::error::Result;
use crate::types::{LogEntry, NodeId, Term};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

/// The state that must survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurableState {
    /// Latest term this node has seen.
    pub current_term: Term,

    /// Candidate that received this node's vote in the current term.
    pub voted_for: Option<NodeId>,

    /// The replicated log.
    pub log: Vec<LogEntry>,
}

/// Durable storage seam, exclusively owned by one node.
pub trait Store: Send {
    fn current_term(&self) -> Term;
    fn voted_for(&self) -> Option<NodeId>;
    fn log(&self) -> Vec<LogEntry>;

    /// Apply `mutate` to the durable state atomically.
    ///
    /// The new values are durable before this returns.
    fn write(&mut self, mutate: &mut dyn FnMut(&mut DurableState)) -> Result<()>;
}

/// Volatile store for tests and embedding.
///
/// Cloning yields another handle onto the same state, so a test can keep one
/// handle for inspection while the node owns the other.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<DurableState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the full durable state, for assertions.
    pub fn snapshot(&self) -> DurableState {
        self.state.lock().clone()
    }
}

impl Store for InMemoryStore {
    fn current_term(&self) -> Term {
        self.state.lock().current_term
    }

    fn voted_for(&self) -> Option<NodeId> {
        self.state.lock().voted_for
    }

    fn log(&self) -> Vec<LogEntry> {
        self.state.lock().log.clone()
    }

    fn write(&mut self, mutate: &mut dyn FnMut(&mut DurableState)) -> Result<()> {
        mutate(&mut self.state.lock());
        Ok(())
    }
}

/// File-backed store: the whole durable state as one JSON document.
///
/// Writes go to a sibling temp file, are synced, and are renamed into place,
/// so a crash mid-write leaves the previous state intact. Suited to the same
/// small clusters the quorum enumeration is: the log is rewritten whole on
/// every persist.
pub struct FileStore {
    path: PathBuf,
    state: DurableState,
}

impl FileStore {
    /// Open the store at `path`, loading existing state or starting fresh
    /// with term 0, no vote, and an empty log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => DurableState::default(),
            Err(error) => return Err(error.into()),
        };

        Ok(Self { path, state })
    }

    fn flush(&self) -> Result<()> {
        let raw = serde_json::to_vec_pretty(&self.state)?;
        let staging = self.path.with_extension("tmp");

        {
            let mut file = std::fs::File::create(&staging)?;
            file.write_all(&raw)?;
            file.sync_all()?;
        }
        std::fs::rename(&staging, &self.path)?;

        Ok(())
    }
}

impl Store for FileStore {
    fn current_term(&self) -> Term {
        self.state.current_term
    }

    fn voted_for(&self) -> Option<NodeId> {
        self.state.voted_for
    }

    fn log(&self) -> Vec<LogEntry> {
        self.state.log.clone()
    }

    fn write(&mut self, mutate: &mut dyn FnMut(&mut DurableState)) -> Result<()> {
        mutate(&mut self.state);
        self.flush()
    }
}
