//! Process lock identity.
//!
//! Reservations are stamped with the lock id of the process that holds
//! them. On startup a store asks the lock service which owners are still
//! live and clears reservations stamped by dead ones, which is how work
//! orphaned by a crash becomes claimable again.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identity of one process's cluster lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockId(String);

impl LockId {
    pub fn new(id: impl Into<String>) -> Self {
        LockId(id.into())
    }

    /// Fresh identity for this process.
    pub fn random() -> Self {
        LockId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The engine's view of the cluster lock service. The real service is an
/// external collaborator; all the stores need from it is this process's
/// identity and a liveness check for reservation owners.
pub trait LockService: Send + Sync {
    /// This process's lock identity.
    fn lock_id(&self) -> &LockId;

    /// Whether the holder of `id` is still alive.
    fn is_live(&self, id: &LockId) -> bool;
}

/// Single-process lock service: only its own identity is live. Suitable for
/// embeddings without an external lock service, and for tests.
pub struct ProcessLockService {
    id: LockId,
}

impl ProcessLockService {
    pub fn new() -> Self {
        ProcessLockService {
            id: LockId::random(),
        }
    }

    pub fn with_id(id: LockId) -> Self {
        ProcessLockService { id }
    }
}

impl Default for ProcessLockService {
    fn default() -> Self {
        Self::new()
    }
}

impl LockService for ProcessLockService {
    fn lock_id(&self) -> &LockId {
        &self.id
    }

    fn is_live(&self, id: &LockId) -> bool {
        *id == self.id
    }
}
