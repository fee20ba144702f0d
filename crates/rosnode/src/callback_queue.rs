// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Callback queue.
//!
//! I/O threads never run user code. They push [`CallbackEntry`] values here and
//! spinner threads drain them:
//!
//! ```text
//! reader thread ──add_callback──> [ FIFO, bounded per owner ] ──call_available──> user code
//! ```
//!
//! Each entry carries the id of its owner (one subscription callback, one
//! service, ...). Owners are bounded independently with drop-oldest eviction.
//! Callbacks of one owner may run on several spinner threads at once unless
//! the entry is exclusive; `remove_by_id` waits for all of them to finish
//! before returning.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::message::MessageEvent;

/// Identifies the producer of a callback (used for bounding and removal).
pub type OwnerId = u64;

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique owner id.
pub fn next_owner_id() -> OwnerId {
    NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Message delivery function of one subscription callback.
pub type MessageFn = Arc<dyn Fn(MessageEvent) + Send + Sync>;

/// What to run.
pub enum CallbackKind {
    /// Deliver one message to a subscription callback.
    Message { deliver: MessageFn, event: MessageEvent },
    /// Run a service handler and write its reply.
    ServiceCall(Box<dyn FnOnce() + Send>),
    /// Publisher peer connect / disconnect notification.
    PeerEvent(Box<dyn FnOnce() + Send>),
    /// Anything else (action server work, user jobs).
    Generic(Box<dyn FnOnce() + Send>),
}

impl CallbackKind {
    fn invoke(self) {
        match self {
            CallbackKind::Message { deliver, event } => deliver(event),
            CallbackKind::ServiceCall(f) | CallbackKind::PeerEvent(f) | CallbackKind::Generic(f) => f(),
        }
    }
}

/// One queued invocation.
pub struct CallbackEntry {
    pub kind: CallbackKind,
    pub owner_id: OwnerId,
    /// When set, the owner must not run on two threads at once; the flag
    /// marks "currently running".
    pub exclusive: Option<Arc<AtomicBool>>,
}

impl CallbackEntry {
    pub fn new(owner_id: OwnerId, kind: CallbackKind) -> Self {
        Self {
            kind,
            owner_id,
            exclusive: None,
        }
    }

    /// Mark as non-reentrant using the shared `running` flag.
    pub fn exclusive(mut self, running: Arc<AtomicBool>) -> Self {
        self.exclusive = Some(running);
        self
    }
}

/// Outcome of one dispatch call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOneResult {
    Called,
    /// Owner was busy on another thread; entry was re-queued.
    TryAgain,
    /// Owner was removed; entry discarded.
    Disabled,
    Empty,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<CallbackEntry>,
    per_owner: HashMap<OwnerId, usize>,
    enabled: bool,
}

impl QueueState {
    fn push(&mut self, entry: CallbackEntry) {
        *self.per_owner.entry(entry.owner_id).or_insert(0) += 1;
        self.entries.push_back(entry);
    }

    fn pop(&mut self) -> Option<CallbackEntry> {
        let entry = self.entries.pop_front()?;
        self.uncount(entry.owner_id);
        Some(entry)
    }

    fn uncount(&mut self, owner: OwnerId) {
        if let Some(n) = self.per_owner.get_mut(&owner) {
            *n -= 1;
            if *n == 0 {
                self.per_owner.remove(&owner);
            }
        }
    }
}

/// Execution lock of one owner: held shared while its callbacks run and
/// exclusively by `remove_by_id`.
type OwnerLock = Arc<RwLock<()>>;

thread_local! {
    /// Owners with a callback running on this thread, innermost last.
    static RUNNING_OWNERS: RefCell<Vec<OwnerId>> = const { RefCell::new(Vec::new()) };
}

/// Marks `owner` as running on the current thread until dropped.
struct OwnerScope;

impl OwnerScope {
    fn enter(owner: OwnerId) -> Self {
        RUNNING_OWNERS.with(|r| r.borrow_mut().push(owner));
        OwnerScope
    }

    fn is_inside(owner: OwnerId) -> bool {
        RUNNING_OWNERS.with(|r| r.borrow().contains(&owner))
    }
}

impl Drop for OwnerScope {
    fn drop(&mut self) {
        RUNNING_OWNERS.with(|r| {
            r.borrow_mut().pop();
        });
    }
}

/// Multi-producer, multi-consumer callback FIFO.
pub struct CallbackQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    /// Per-owner execution locks. Absent = removed.
    owners: Mutex<HashMap<OwnerId, OwnerLock>>,
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                enabled: true,
                ..Default::default()
            }),
            cond: Condvar::new(),
            owners: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue `entry`. With `max_per_owner > 0`, the owner's oldest entry is
    /// evicted when it already has that many queued. Returns `true` if an
    /// eviction happened.
    pub fn add_callback(&self, entry: CallbackEntry, max_per_owner: usize) -> bool {
        self.owners
            .lock()
            .entry(entry.owner_id)
            .or_insert_with(|| Arc::new(RwLock::new(())));

        let mut state = self.state.lock();
        if !state.enabled {
            return false;
        }

        let owner = entry.owner_id;
        let mut was_full = false;
        if max_per_owner > 0 && state.per_owner.get(&owner).copied().unwrap_or(0) >= max_per_owner {
            if let Some(pos) = state.entries.iter().position(|e| e.owner_id == owner) {
                state.entries.remove(pos);
                state.uncount(owner);
                was_full = true;
            }
        }
        state.push(entry);
        drop(state);
        self.cond.notify_one();
        was_full
    }

    /// Drop queued entries of `owner` and forget it. Blocks while callbacks
    /// of that owner are running on other threads. Called from inside one of
    /// the owner's own callbacks, it does not wait.
    pub fn remove_by_id(&self, owner: OwnerId) {
        let lock = self.owners.lock().get(&owner).cloned();
        let _exclusive = match &lock {
            Some(l) if !OwnerScope::is_inside(owner) => Some(l.write()),
            _ => None,
        };

        self.owners.lock().remove(&owner);
        let mut state = self.state.lock();
        state.entries.retain(|e| e.owner_id != owner);
        state.per_owner.remove(&owner);
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued entries for one owner.
    pub fn pending_for(&self, owner: OwnerId) -> usize {
        self.state.lock().per_owner.get(&owner).copied().unwrap_or(0)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.per_owner.clear();
    }

    /// Stop accepting entries and wake all waiting consumers.
    pub fn disable(&self) {
        self.state.lock().enabled = false;
        self.cond.notify_all();
    }

    pub fn enable(&self) {
        self.state.lock().enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Run one entry, holding its owner's lock shared.
    fn dispatch(&self, entry: CallbackEntry, deferred: &mut HashSet<OwnerId>) -> CallOneResult {
        let owner = entry.owner_id;
        if deferred.contains(&owner) {
            self.state.lock().push(entry);
            return CallOneResult::TryAgain;
        }

        let lock = match self.owners.lock().get(&owner).cloned() {
            Some(l) => l,
            None => return CallOneResult::Disabled,
        };
        let _shared = lock.read_recursive();
        // Removed while we were waiting for the lock.
        if !self.owners.lock().contains_key(&owner) {
            return CallOneResult::Disabled;
        }

        if let Some(running) = &entry.exclusive {
            if running.swap(true, Ordering::AcqRel) {
                deferred.insert(owner);
                self.state.lock().push(entry);
                return CallOneResult::TryAgain;
            }
            let running = running.clone();
            let _scope = OwnerScope::enter(owner);
            entry.kind.invoke();
            running.store(false, Ordering::Release);
        } else {
            let _scope = OwnerScope::enter(owner);
            entry.kind.invoke();
        }
        CallOneResult::Called
    }

    fn wait_nonempty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.entries.is_empty() && state.enabled {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        !state.entries.is_empty()
    }

    /// Run the oldest entry, waiting up to `timeout` for one.
    pub fn call_one(&self, timeout: Duration) -> CallOneResult {
        if !self.wait_nonempty(timeout) {
            return CallOneResult::Empty;
        }
        let entry = match self.state.lock().pop() {
            Some(e) => e,
            None => return CallOneResult::Empty,
        };
        self.dispatch(entry, &mut HashSet::new())
    }

    /// Run everything queued right now, in order, waiting up to `timeout` for
    /// the first entry. Returns the number of callbacks invoked.
    pub fn call_available(&self, timeout: Duration) -> usize {
        if !self.wait_nonempty(timeout) {
            return 0;
        }
        let working: Vec<CallbackEntry> = {
            let mut state = self.state.lock();
            state.per_owner.clear();
            state.entries.drain(..).collect()
        };

        let mut deferred = HashSet::new();
        let mut called = 0;
        for entry in working {
            if self.dispatch(entry, &mut deferred) == CallOneResult::Called {
                called += 1;
            }
        }
        if !deferred.is_empty() {
            self.cond.notify_one();
        }
        called
    }
}

impl std::fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// Spinner
// ============================================================================

/// Background threads draining a queue.
pub struct AsyncSpinner {
    queue: Arc<CallbackQueue>,
    threads: usize,
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl AsyncSpinner {
    pub fn new(queue: Arc<CallbackQueue>, threads: usize) -> Self {
        Self {
            queue,
            threads: threads.max(1),
            running: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    pub fn start(&mut self) -> std::io::Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for i in 0..self.threads {
            let queue = self.queue.clone();
            let running = self.running.clone();
            let handle = thread::Builder::new()
                .name(format!("rosnode-spinner-{}", i))
                .spawn(move || {
                    while running.load(Ordering::Acquire) && queue.is_enabled() {
                        queue.call_available(Duration::from_millis(100));
                    }
                })?;
            self.handles.push(handle);
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for AsyncSpinner {
    fn drop(&mut self) {
        self.stop();
    }
}
