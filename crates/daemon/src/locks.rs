//! Slot lock manager.
//!
//! Locks are advisory between clients of one reader daemon. A shared lock
//! coexists with other shared locks of the same uid; an exclusive lock
//! coexists with nothing held through another socket.

use crate::server::SocketId;
use openct_protocol::{Error, LockType, Result};

/// Peer uid recorded when the kernel cannot tell us.
pub const UNKNOWN_UID: u32 = u32::MAX - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lock {
    slot: usize,
    uid: u32,
    owner: SocketId,
    exclusive: bool,
    handle: u32,
}

/// All locks held on the reader's slots.
#[derive(Debug)]
pub struct LockManager {
    locks: Vec<Lock>,
    next_handle: Option<u32>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Vec::new(),
            next_handle: Some(1),
        }
    }

    /// Acquire a lock on `slot` for `owner`, returning its handle.
    pub fn lock(&mut self, owner: SocketId, uid: u32, slot: usize, kind: LockType) -> Result<u32> {
        let exclusive = kind == LockType::Exclusive;
        let conflict = self
            .locks
            .iter()
            .filter(|l| l.slot == slot && l.owner != owner)
            .any(|l| l.exclusive || exclusive || l.uid != uid);
        if conflict {
            tracing::debug!(slot, uid, ?kind, "Lock refused");
            return Err(Error::Locked);
        }

        let handle = self.next_handle.ok_or(Error::NoMemory)?;
        self.next_handle = handle.checked_add(1);
        self.locks.push(Lock {
            slot,
            uid,
            owner,
            exclusive,
            handle,
        });
        tracing::debug!(slot, uid, ?kind, handle, "Lock granted");
        Ok(handle)
    }

    /// Drop the lock `handle` that `owner` holds on `slot`.
    pub fn unlock(&mut self, owner: SocketId, slot: usize, handle: u32) -> Result<()> {
        let Some(pos) = self
            .locks
            .iter()
            .position(|l| l.owner == owner && l.slot == slot && l.handle == handle)
        else {
            return Err(Error::NoLock);
        };
        self.locks.remove(pos);
        tracing::debug!(slot, handle, "Lock released");
        Ok(())
    }

    /// Drop every lock held through `owner`. Returns how many were dropped.
    pub fn release_all_for(&mut self, owner: SocketId) -> usize {
        let before = self.locks.len();
        self.locks.retain(|l| l.owner != owner);
        let released = before - self.locks.len();
        if released > 0 {
            tracing::debug!(?owner, released, "Released locks of closed socket");
        }
        released
    }

    /// Whether `owner` may talk to the card in `slot`.
    pub fn check_access(&self, owner: SocketId, slot: usize) -> Result<()> {
        let held_elsewhere = self
            .locks
            .iter()
            .any(|l| l.slot == slot && l.exclusive && l.owner != owner);
        if held_elsewhere {
            return Err(Error::Locked);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }
}
