//! Logical lock manager.
//!
//! Locks are held by owners (lock compatibility spaces). An owner never
//! conflicts with itself, and repeated grants of the same mode are counted
//! so each must be released separately.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use arbor_common::{ArborError, LockConfig, Result, RowLocation};

/// Identifier of a lock compatibility space.
pub type LockOwner = u64;

/// Lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Intent to take shared row locks in a table.
    IntentShared,
    /// Intent to take exclusive row locks in a table.
    IntentExclusive,
    /// Shared.
    Shared,
    /// Update: compatible with readers, not with other updaters.
    Update,
    /// Exclusive.
    Exclusive,
    /// Insert-previous-key lock on the row before an insert point.
    /// Only blocks other modes, never other inserters.
    InsertPreviousKey,
}

impl LockMode {
    /// Returns true if a holder in `self` allows a grant in `other`.
    pub fn is_compatible(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IntentShared, IntentShared | IntentExclusive | Shared | Update) => true,
            (IntentExclusive, IntentShared | IntentExclusive) => true,
            (Shared, IntentShared | Shared | Update) => true,
            (Update, IntentShared | Shared) => true,
            (InsertPreviousKey, InsertPreviousKey) => true,
            _ => false,
        }
    }
}

/// What a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// A whole table (base container).
    Table { container_id: u32 },
    /// One base-table row.
    Row {
        container_id: u32,
        location: RowLocation,
    },
    /// The key range before the first key of an index.
    PreviousToFirstKey { container_id: u32 },
    /// Scans positioned on one index leaf.
    Scan { container_id: u32, page_num: u32 },
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Table { container_id } => write!(f, "table {}", container_id),
            LockKey::Row {
                container_id,
                location,
            } => write!(f, "row {} in {}", location, container_id),
            LockKey::PreviousToFirstKey { container_id } => {
                write!(f, "previous-to-first key of {}", container_id)
            }
            LockKey::Scan {
                container_id,
                page_num,
            } => write!(f, "scan on page {} of {}", page_num, container_id),
        }
    }
}

/// Whether a lock request may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Fail immediately instead of waiting.
    NoWait,
    /// Wait up to the configured timeout.
    Wait,
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    owner: LockOwner,
    mode: LockMode,
    count: u32,
}

#[derive(Default)]
struct LockTable {
    /// Granted locks per key.
    locks: HashMap<LockKey, Vec<Holder>>,
    /// Keys each owner holds at least one lock on.
    owned: HashMap<LockOwner, HashSet<LockKey>>,
    /// Key each blocked owner is waiting for.
    waiting: HashMap<LockOwner, (LockKey, LockMode)>,
}

impl LockTable {
    fn conflicts(&self, owner: LockOwner, key: &LockKey, mode: LockMode) -> Vec<LockOwner> {
        self.locks
            .get(key)
            .map(|holders| {
                holders
                    .iter()
                    .filter(|h| h.owner != owner && !h.mode.is_compatible(mode))
                    .map(|h| h.owner)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn grant(&mut self, owner: LockOwner, key: LockKey, mode: LockMode) {
        let holders = self.locks.entry(key).or_default();
        match holders
            .iter_mut()
            .find(|h| h.owner == owner && h.mode == mode)
        {
            Some(holder) => holder.count += 1,
            None => holders.push(Holder {
                owner,
                mode,
                count: 1,
            }),
        }
        self.owned.entry(owner).or_default().insert(key);
    }

    /// Returns true if `owner` blocking on `key` would close a cycle in the
    /// waits-for graph.
    fn would_deadlock(&self, owner: LockOwner, key: &LockKey, mode: LockMode) -> bool {
        let mut stack = self.conflicts(owner, key, mode);
        let mut seen = HashSet::new();
        while let Some(blocker) = stack.pop() {
            if blocker == owner {
                return true;
            }
            if !seen.insert(blocker) {
                continue;
            }
            if let Some((wait_key, wait_mode)) = self.waiting.get(&blocker) {
                stack.extend(self.conflicts(blocker, wait_key, *wait_mode));
            }
        }
        false
    }
}

/// Lock manager shared by every transaction of a transaction manager.
pub struct LockManager {
    config: LockConfig,
    table: Mutex<LockTable>,
    /// Signalled whenever a lock is released.
    released: Condvar,
}

impl LockManager {
    /// Creates an empty lock manager.
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
        }
    }

    /// Requests a lock.
    ///
    /// Returns `Ok(true)` once granted and `Ok(false)` if the request
    /// conflicts and `wait` is `NoWait`. A waiting request fails with
    /// `LockTimeout` or `DeadlockDetected`.
    pub fn lock(
        &self,
        owner: LockOwner,
        key: LockKey,
        mode: LockMode,
        wait: LockWait,
    ) -> Result<bool> {
        let mut table = self.table.lock();
        if table.conflicts(owner, &key, mode).is_empty() {
            table.grant(owner, key, mode);
            return Ok(true);
        }
        if wait == LockWait::NoWait {
            return Ok(false);
        }

        let timeout = Duration::from_millis(self.config.wait_timeout_ms);
        let start = Instant::now();
        loop {
            if self.config.deadlock_detection && table.would_deadlock(owner, &key, mode) {
                table.waiting.remove(&owner);
                warn!(owner, resource = %key, ?mode, "deadlock detected");
                return Err(ArborError::DeadlockDetected);
            }
            table.waiting.insert(owner, (key, mode));

            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                table.waiting.remove(&owner);
                debug!(owner, resource = %key, ?mode, "lock wait timed out");
                return Err(ArborError::LockTimeout {
                    resource: key.to_string(),
                });
            }
            self.released.wait_for(&mut table, remaining);

            if table.conflicts(owner, &key, mode).is_empty() {
                table.waiting.remove(&owner);
                table.grant(owner, key, mode);
                return Ok(true);
            }
        }
    }

    /// Releases one grant of `mode` on `key`. Returns false if none was held.
    pub fn unlock(&self, owner: LockOwner, key: LockKey, mode: LockMode) -> bool {
        let mut table = self.table.lock();
        let Some(holders) = table.locks.get_mut(&key) else {
            return false;
        };
        let Some(pos) = holders
            .iter()
            .position(|h| h.owner == owner && h.mode == mode)
        else {
            return false;
        };

        holders[pos].count -= 1;
        if holders[pos].count == 0 {
            holders.swap_remove(pos);
        }
        let owner_still_holds = holders.iter().any(|h| h.owner == owner);
        if holders.is_empty() {
            table.locks.remove(&key);
        }
        if !owner_still_holds {
            if let Some(keys) = table.owned.get_mut(&owner) {
                keys.remove(&key);
                if keys.is_empty() {
                    table.owned.remove(&owner);
                }
            }
        }
        drop(table);
        self.released.notify_all();
        true
    }

    /// Releases every lock held by `owner`. Returns the number of keys freed.
    pub fn unlock_all(&self, owner: LockOwner) -> usize {
        let mut table = self.table.lock();
        let keys = table.owned.remove(&owner).unwrap_or_default();
        for key in &keys {
            if let Some(holders) = table.locks.get_mut(key) {
                holders.retain(|h| h.owner != owner);
                if holders.is_empty() {
                    table.locks.remove(key);
                }
            }
        }
        table.waiting.remove(&owner);
        drop(table);
        if !keys.is_empty() {
            self.released.notify_all();
        }
        keys.len()
    }

    /// Returns true if `owner` holds `key` in exactly `mode`.
    pub fn is_held(&self, owner: LockOwner, key: &LockKey, mode: LockMode) -> bool {
        self.table
            .lock()
            .locks
            .get(key)
            .map(|holders| holders.iter().any(|h| h.owner == owner && h.mode == mode))
            .unwrap_or(false)
    }

    /// Returns the number of distinct keys `owner` holds locks on.
    pub fn held_count(&self, owner: LockOwner) -> usize {
        self.table
            .lock()
            .owned
            .get(&owner)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Returns the number of keys with at least one granted lock.
    pub fn locked_keys(&self) -> usize {
        self.table.lock().locks.len()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        f.debug_struct("LockManager")
            .field("locked_keys", &table.locks.len())
            .field("waiting", &table.waiting.len())
            .finish()
    }
}
