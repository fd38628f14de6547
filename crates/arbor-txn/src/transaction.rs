//! Transactions and the transaction manager.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use arbor_buffer::{Container, PageLatch};
use arbor_common::{ArborError, LockConfig, Result};
use arbor_wal::{PagePayload, UndoLog};

use crate::lock::{LockKey, LockManager, LockMode, LockOwner, LockWait};

/// Transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(pub u32);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Result of one attempt at post-commit work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostCommitOutcome {
    /// The work finished or is no longer needed.
    Done,
    /// The work could not run now and should be retried later.
    Requeue,
}

/// Work a transaction defers until after it commits.
pub trait PostCommitWork: Send {
    /// Short description for logging.
    fn describe(&self) -> String;

    /// Performs the work, typically in a transaction of its own.
    fn perform(&mut self, manager: &Arc<TransactionManager>) -> Result<PostCommitOutcome>;
}

/// An open scan that can give up its page position before the page is
/// reorganized.
pub trait SavePosition: Send + Sync {
    /// Saves the scan position by key if the scan is positioned on the
    /// latched page, releasing its scan lock. The caller keeps the latch.
    fn save_position(&self, page: &PageLatch) -> Result<()>;
}

type ScanRegistry = Arc<Mutex<Vec<Weak<dyn SavePosition>>>>;

/// Owns the lock manager, the container registry and the post-commit queue.
pub struct TransactionManager {
    lock_manager: LockManager,
    containers: RwLock<HashMap<u32, Arc<Container>>>,
    post_commit: Mutex<VecDeque<Box<dyn PostCommitWork>>>,
    next_txn_id: AtomicU32,
    next_container_id: AtomicU32,
}

impl TransactionManager {
    /// Creates a transaction manager.
    pub fn new(config: LockConfig) -> Arc<Self> {
        Arc::new(Self {
            lock_manager: LockManager::new(config),
            containers: RwLock::new(HashMap::new()),
            post_commit: Mutex::new(VecDeque::new()),
            next_txn_id: AtomicU32::new(1),
            next_container_id: AtomicU32::new(1),
        })
    }

    /// Returns the lock manager.
    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    /// Starts a user transaction.
    pub fn begin(self: &Arc<Self>) -> Arc<Transaction> {
        let id = self.allocate_txn_id();
        debug!(txn = %id, "transaction started");
        Arc::new(Transaction::new(
            id,
            Arc::clone(self),
            false,
            Arc::new(Mutex::new(Vec::new())),
        ))
    }

    fn allocate_txn_id(&self) -> TxnId {
        TxnId(self.next_txn_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Returns a container id not used by any registered container.
    pub fn allocate_container_id(&self) -> u32 {
        loop {
            let id = self.next_container_id.fetch_add(1, Ordering::SeqCst);
            if !self.containers.read().contains_key(&id) {
                return id;
            }
        }
    }

    /// Registers a container so rollback can reach it.
    pub fn register_container(&self, container: Arc<Container>) {
        let id = container.id();
        self.containers.write().insert(id, container);
        // Keep fresh ids clear of containers registered explicitly
        self.next_container_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Looks up a registered container.
    pub fn container(&self, container_id: u32) -> Result<Arc<Container>> {
        self.containers
            .read()
            .get(&container_id)
            .cloned()
            .ok_or(ArborError::ContainerNotFound { container_id })
    }

    /// Unregisters a container.
    pub fn drop_container(&self, container_id: u32) -> Option<Arc<Container>> {
        self.containers.write().remove(&container_id)
    }

    /// Tells every container that a transaction's undo records are gone.
    fn end_unit(&self, txn_id: TxnId) {
        let containers: Vec<Arc<Container>> = self.containers.read().values().cloned().collect();
        for container in containers {
            container.end_unit(txn_id.0);
        }
    }

    fn enqueue_post_commit(&self, work: Vec<Box<dyn PostCommitWork>>) {
        if work.is_empty() {
            return;
        }
        self.post_commit.lock().extend(work);
    }

    /// Returns the number of queued post-commit items.
    pub fn pending_post_commit_work(&self) -> usize {
        self.post_commit.lock().len()
    }

    /// Runs the post-commit items queued so far, in FIFO order.
    ///
    /// Items that ask to be requeued, or that fail on a lock conflict, go
    /// to the back of the queue and are not retried in this call. Returns
    /// the number of items that completed.
    pub fn run_post_commit_work(self: &Arc<Self>) -> usize {
        let batch = self.post_commit.lock().len();
        let mut completed = 0;

        for _ in 0..batch {
            let Some(mut work) = self.post_commit.lock().pop_front() else {
                break;
            };
            match work.perform(self) {
                Ok(PostCommitOutcome::Done) => completed += 1,
                Ok(PostCommitOutcome::Requeue) => {
                    debug!(work = %work.describe(), "post-commit work requeued");
                    self.post_commit.lock().push_back(work);
                }
                Err(e) if e.is_lock_error() => {
                    debug!(work = %work.describe(), error = %e, "post-commit work requeued");
                    self.post_commit.lock().push_back(work);
                }
                Err(e) => {
                    warn!(work = %work.describe(), error = %e, "post-commit work failed");
                }
            }
        }
        completed
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("containers", &self.containers.read().len())
            .field("post_commit", &self.pending_post_commit_work())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// A user or internal transaction.
///
/// An internal transaction has its own lock compatibility space and its own
/// undo log, commits independently of its parent, and shares the parent's
/// registry of open scans.
pub struct Transaction {
    id: TxnId,
    manager: Arc<TransactionManager>,
    internal: bool,
    log: UndoLog,
    state: Mutex<TxnState>,
    post_commit: Mutex<Vec<Box<dyn PostCommitWork>>>,
    scans: ScanRegistry,
}

impl Transaction {
    fn new(
        id: TxnId,
        manager: Arc<TransactionManager>,
        internal: bool,
        scans: ScanRegistry,
    ) -> Self {
        Self {
            id,
            manager,
            internal,
            log: UndoLog::new(id.0),
            state: Mutex::new(TxnState::Active),
            post_commit: Mutex::new(Vec::new()),
            scans,
        }
    }

    /// Returns the transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Returns the lock compatibility space of this transaction.
    pub fn owner(&self) -> LockOwner {
        self.id.0 as LockOwner
    }

    /// Returns true for internal transactions.
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// Returns the undo log page changes are recorded in.
    pub fn log(&self) -> &UndoLog {
        &self.log
    }

    /// Returns the transaction manager.
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Returns true until the transaction commits or aborts.
    pub fn is_active(&self) -> bool {
        *self.state.lock() == TxnState::Active
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(ArborError::TransactionClosed(self.id.0 as u64))
        }
    }

    /// Requests a lock in this transaction's compatibility space.
    pub fn lock(&self, key: LockKey, mode: LockMode, wait: LockWait) -> Result<bool> {
        self.ensure_active()?;
        self.manager
            .lock_manager
            .lock(self.owner(), key, mode, wait)
    }

    /// Releases one grant of a lock.
    pub fn unlock(&self, key: LockKey, mode: LockMode) -> bool {
        self.manager.lock_manager.unlock(self.owner(), key, mode)
    }

    /// Starts an internal transaction for structural changes.
    pub fn start_internal_transaction(&self) -> Result<Arc<Transaction>> {
        self.ensure_active()?;
        let id = self.manager.allocate_txn_id();
        debug!(txn = %id, parent = %self.id, "internal transaction started");
        Ok(Arc::new(Transaction::new(
            id,
            Arc::clone(&self.manager),
            true,
            Arc::clone(&self.scans),
        )))
    }

    /// Queues work to run after this transaction commits. Aborting discards it.
    pub fn add_post_commit_work(&self, work: Box<dyn PostCommitWork>) {
        self.post_commit.lock().push(work);
    }

    /// Registers an open scan so page reorganizations can save its position.
    pub fn register_scan(&self, scan: Weak<dyn SavePosition>) {
        let mut scans = self.scans.lock();
        scans.retain(|s| s.strong_count() > 0);
        scans.push(scan);
    }

    /// Asks every open scan positioned on the latched page to save its
    /// position.
    pub fn save_scan_positions(&self, page: &PageLatch) -> Result<()> {
        let scans: Vec<Arc<dyn SavePosition>> = {
            let mut registry = self.scans.lock();
            registry.retain(|s| s.strong_count() > 0);
            registry.iter().filter_map(Weak::upgrade).collect()
        };
        for scan in scans {
            scan.save_position(page)?;
        }
        Ok(())
    }

    /// Commits: discards the undo log, releases every lock and hands
    /// queued post-commit work to the manager.
    pub fn commit(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != TxnState::Active {
                return Err(ArborError::TransactionClosed(self.id.0 as u64));
            }
            *state = TxnState::Committed;
        }
        self.finish_unit();
        Ok(())
    }

    /// Commits the work done so far and keeps the transaction open.
    ///
    /// Splits commit each level this way before moving to the next, and
    /// scans opened with hold survive it.
    pub fn commit_and_continue(&self) -> Result<()> {
        self.ensure_active()?;
        self.finish_unit();
        Ok(())
    }

    fn finish_unit(&self) {
        let changes = self.log.len();
        self.log.truncate();
        self.manager.end_unit(self.id);
        let released = self.manager.lock_manager.unlock_all(self.owner());
        let work = std::mem::take(&mut *self.post_commit.lock());
        let queued = work.len();
        self.manager.enqueue_post_commit(work);

        debug!(
            txn = %self.id,
            internal = self.internal,
            changes,
            locks = released,
            post_commit = queued,
            "transaction committed"
        );
    }

    /// Aborts: undoes every change newest first, then releases every lock.
    ///
    /// The caller must hold no page latches.
    pub fn abort(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != TxnState::Active {
                return Err(ArborError::TransactionClosed(self.id.0 as u64));
            }
            *state = TxnState::Aborted;
        }

        let records = self.log.take_for_undo()?;
        let undone = records.len();
        let result = records.iter().try_for_each(|record| {
            let payload = PagePayload::deserialize(&record.payload)?;
            self.manager.container(payload.container_id)?.undo(record)
        });
        self.manager.end_unit(self.id);

        self.manager.lock_manager.unlock_all(self.owner());
        self.post_commit.lock().clear();

        match &result {
            Ok(()) => info!(txn = %self.id, internal = self.internal, undone, "transaction aborted"),
            Err(e) => warn!(txn = %self.id, error = %e, "rollback failed"),
        }
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_active() {
            warn!(txn = %self.id, "active transaction dropped, rolling back");
            if let Err(e) = self.abort() {
                warn!(txn = %self.id, error = %e, "rollback on drop failed");
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("internal", &self.internal)
            .field("state", &*self.state.lock())
            .field("changes", &self.log.len())
            .finish()
    }
}
