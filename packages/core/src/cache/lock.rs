//! Hierarchy-level locking
//!
//! Population of a hierarchy level is serialized with an advisory, in-process
//! lock keyed by physical level id. Readers never block on cache hits: they
//! read optimistically and only wait when the expected entry is missing, via
//! [`get_result_or_lock`].
//!
//! A lock is reentrant per thread: several lock handles for the same level
//! held by one thread share one registry entry, released when the last
//! handle unlocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::error::{HierarchyError, Result};

#[derive(Debug)]
struct LockEntry {
    owner: ThreadId,
    holders: usize,
    acquired_at: Instant,
}

/// Registry of held level locks, shared by every handle of one cache
#[derive(Debug, Default)]
pub struct LockRegistry {
    entries: Mutex<HashMap<Uuid, LockEntry>>,
    released: Condvar,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<Uuid, LockEntry>>> {
        self.entries
            .lock()
            .map_err(|_| HierarchyError::invariant("lock registry mutex poisoned"))
    }

    /// Whether another thread holds the lock of `level`
    pub fn is_locked_by_other(&self, level: &Uuid) -> Result<bool> {
        let me = thread::current().id();
        Ok(self
            .entries()?
            .get(level)
            .map(|entry| entry.owner != me)
            .unwrap_or(false))
    }

    /// Age of the lock on `level`, if any
    pub fn lock_age(&self, level: &Uuid) -> Result<Option<Duration>> {
        Ok(self.entries()?.get(level).map(|entry| entry.acquired_at.elapsed()))
    }
}

/// Lock handle for one physical hierarchy level
#[derive(Debug)]
pub struct HierarchyLevelLock {
    registry: Arc<LockRegistry>,
    level: Uuid,
    held: AtomicBool,
    timeout: Duration,
    wait_interval: Duration,
    cancel: CancellationToken,
}

impl HierarchyLevelLock {
    pub fn new(
        registry: Arc<LockRegistry>,
        level: Uuid,
        timeout: Duration,
        wait_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            level,
            held: AtomicBool::new(false),
            timeout,
            wait_interval,
            cancel,
        }
    }

    pub fn level(&self) -> Uuid {
        self.level
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Try to take the lock without waiting
    ///
    /// # Returns
    ///
    /// `true` when this handle holds the lock afterwards.
    pub fn try_lock(&self) -> Result<bool> {
        if self.is_held() {
            return Ok(true);
        }
        let me = thread::current().id();
        let mut entries = self.registry.entries()?;
        let entry = entries.entry(self.level).or_insert(LockEntry {
            owner: me,
            holders: 0,
            acquired_at: Instant::now(),
        });
        if entry.owner != me {
            return Ok(false);
        }
        entry.holders += 1;
        self.held.store(true, Ordering::Release);
        tracing::debug!(level = %self.level, "hierarchy level locked");
        Ok(true)
    }

    /// Take the lock, waiting for other holders
    ///
    /// # Errors
    ///
    /// [`HierarchyError::LockTimeout`] after waiting longer than the configured
    /// timeout; [`HierarchyError::Cancelled`] if the request is cancelled.
    pub fn lock(&self) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.try_lock()? {
                return Ok(());
            }
            self.wait_step(started)?;
        }
    }

    /// Block until no other thread holds the lock
    pub fn wait_for_unlock(&self) -> Result<()> {
        let started = Instant::now();
        while self.registry.is_locked_by_other(&self.level)? {
            self.wait_step(started)?;
        }
        Ok(())
    }

    fn wait_step(&self, started: Instant) -> Result<()> {
        self.cancel.check()?;
        if started.elapsed() > self.timeout {
            tracing::warn!(level = %self.level, "timed out waiting for hierarchy level lock");
            return Err(HierarchyError::LockTimeout { level: self.level });
        }
        let entries = self.registry.entries()?;
        let _ = self
            .registry
            .released
            .wait_timeout(entries, self.wait_interval)
            .map_err(|_| HierarchyError::invariant("lock registry mutex poisoned"))?;
        Ok(())
    }

    pub fn unlock(&self) {
        if !self.held.swap(false, Ordering::AcqRel) {
            return;
        }
        match self.registry.entries() {
            Ok(mut entries) => {
                let release = match entries.get_mut(&self.level) {
                    Some(entry) => {
                        entry.holders = entry.holders.saturating_sub(1);
                        entry.holders == 0
                    }
                    None => false,
                };
                if release {
                    entries.remove(&self.level);
                    tracing::debug!(level = %self.level, "hierarchy level unlocked");
                }
            }
            Err(err) => tracing::warn!(level = %self.level, error = %err, "failed to unlock hierarchy level"),
        }
        self.registry.released.notify_all();
    }
}

impl Drop for HierarchyLevelLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Locking behaviour of a provider context
///
/// Contexts without a level lock use [`LockPolicy::NoOp`], which never waits
/// and always reports the lock as held.
#[derive(Debug, Clone, Default)]
pub enum LockPolicy {
    #[default]
    NoOp,
    Level(Arc<HierarchyLevelLock>),
}

impl LockPolicy {
    pub fn try_lock(&self) -> Result<bool> {
        match self {
            LockPolicy::NoOp => Ok(true),
            LockPolicy::Level(lock) => lock.try_lock(),
        }
    }

    pub fn lock(&self) -> Result<()> {
        match self {
            LockPolicy::NoOp => Ok(()),
            LockPolicy::Level(lock) => lock.lock(),
        }
    }

    pub fn unlock(&self) {
        if let LockPolicy::Level(lock) = self {
            lock.unlock();
        }
    }

    pub fn wait_for_unlock(&self) -> Result<()> {
        match self {
            LockPolicy::NoOp => Ok(()),
            LockPolicy::Level(lock) => lock.wait_for_unlock(),
        }
    }

    pub fn is_held(&self) -> bool {
        match self {
            LockPolicy::NoOp => true,
            LockPolicy::Level(lock) => lock.is_held(),
        }
    }
}

/// Read-then-lock retry combinator
///
/// Runs `getter` without locking. On a miss it waits for any writer, reads
/// again, and if the result is still missing tries to take the lock and
/// loops. Returns `Ok(None)` only when the result is missing *and* the
/// caller now holds the lock, meaning the caller is the one that must write.
/// A lock taken here is released again if the result shows up meanwhile.
pub fn get_result_or_lock<T, F>(lock: &LockPolicy, mut getter: F) -> Result<Option<T>>
where
    F: FnMut() -> Result<Option<T>>,
{
    if let Some(result) = getter()? {
        return Ok(Some(result));
    }
    let mut attempts = 0usize;
    let mut acquired = false;
    loop {
        attempts += 1;
        lock.wait_for_unlock()?;
        if let Some(result) = getter()? {
            if acquired {
                lock.unlock();
            }
            if attempts > 1 {
                tracing::debug!(attempts, "cache entry appeared after waiting for writer");
            }
            return Ok(Some(result));
        }
        if lock.is_held() {
            return Ok(None);
        }
        acquired = lock.try_lock()?;
    }
}
