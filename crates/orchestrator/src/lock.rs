//! Universe lock protocol.
//!
//! The lock is advisory: it keeps other tasks from starting a mutation on
//! the same universe but never blocks reads. Multi-universe acquisition is
//! always done in ascending UUID order so two operations over the same set
//! can never wait on each other in a cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use conductor_core::{Error, Result, WaitConfig};
use conductor_workflow::wait::Deadline;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::resource::{ExpectedVersion, ResourceStore, Universe};

/// Acquire/release protocol over a [`ResourceStore`].
#[derive(Clone)]
pub struct ResourceLock {
    store: Arc<dyn ResourceStore>,
}

impl ResourceLock {
    /// Create a lock over a universe store.
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Take the lock of one universe. Returns the record as of lock time.
    pub async fn acquire(&self, uuid: Uuid, expected: ExpectedVersion) -> Result<Universe> {
        let universe = self.store.try_lock(uuid, expected).await?;
        info!(universe = %uuid, version = universe.version, "Universe locked");
        Ok(universe)
    }

    /// Release the lock of one universe. Releasing an unlocked universe is a
    /// no-op.
    pub async fn release(&self, uuid: Uuid, error: Option<&str>) -> Result<()> {
        if self.store.unlock(uuid, error.map(str::to_string)).await? {
            info!(universe = %uuid, failed = error.is_some(), "Universe unlocked");
        } else {
            debug!(universe = %uuid, "Universe already unlocked");
        }
        Ok(())
    }

    /// Lock several universes in ascending UUID order with any-version
    /// semantics. On failure every lock taken by this call is released
    /// before the error is returned.
    pub async fn acquire_many(&self, uuids: &[Uuid]) -> Result<Vec<Universe>> {
        let ordered: BTreeSet<Uuid> = uuids.iter().copied().collect();
        let mut locked = Vec::with_capacity(ordered.len());

        for uuid in ordered {
            match self.acquire(uuid, ExpectedVersion::Any).await {
                Ok(universe) => locked.push(universe),
                Err(e) => {
                    warn!(universe = %uuid, error = %e, "Multi-universe lock failed, rolling back");
                    let taken: Vec<Uuid> = locked.iter().map(|u: &Universe| u.uuid).collect();
                    self.release_all(&taken, None).await;
                    return Err(e);
                }
            }
        }
        Ok(locked)
    }

    /// Like [`acquire_many`](Self::acquire_many), but waits on a busy
    /// universe instead of failing, holding the ones already taken.
    ///
    /// Ascending order guarantees progress: whoever holds the smallest
    /// contested UUID can always take the rest. Gives up with
    /// `ExternalTimeout` once the configured deadline passes.
    pub async fn acquire_many_waiting(
        &self,
        uuids: &[Uuid],
        wait: WaitConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<Universe>> {
        let ordered: BTreeSet<Uuid> = uuids.iter().copied().collect();
        let deadline = Deadline::after(wait.timeout);
        let mut locked: Vec<Universe> = Vec::with_capacity(ordered.len());

        for uuid in ordered {
            let acquired = loop {
                if cancel.is_cancelled() {
                    break Err(Error::cancelled(format!("aborted while waiting for universe {uuid}")));
                }
                match self.store.try_lock(uuid, ExpectedVersion::Any).await {
                    Ok(universe) => break Ok(universe),
                    Err(Error::AlreadyLocked { .. }) if !deadline.is_expired() => {
                        let nap = wait.poll_interval.min(deadline.remaining());
                        tokio::select! {
                            () = cancel.cancelled() => {}
                            () = tokio::time::sleep(nap) => {}
                        }
                    }
                    Err(Error::AlreadyLocked { .. }) => {
                        break Err(Error::external_timeout(
                            format!("lock on universe {uuid}"),
                            deadline.budget_ms(),
                        ));
                    }
                    Err(e) => break Err(e),
                }
            };

            match acquired {
                Ok(universe) => {
                    info!(universe = %uuid, version = universe.version, "Universe locked");
                    locked.push(universe);
                }
                Err(e) => {
                    let held: Vec<Uuid> = locked.iter().map(|u| u.uuid).collect();
                    self.release_all(&held, None).await;
                    return Err(e);
                }
            }
        }
        Ok(locked)
    }

    /// Release every listed universe, ignoring ones that are already
    /// unlocked or no longer exist. Returns how many were released.
    pub async fn release_all(&self, uuids: &[Uuid], error: Option<&str>) -> usize {
        let mut released = 0;
        for uuid in uuids {
            match self.store.unlock(*uuid, error.map(str::to_string)).await {
                Ok(true) => released += 1,
                Ok(false) => debug!(universe = %uuid, "Universe already unlocked"),
                Err(e) => warn!(universe = %uuid, error = %e, "Ignoring failed unlock"),
            }
        }
        if released > 0 {
            info!(released, "Universes unlocked");
        }
        released
    }
}

/// The locks held by one task invocation.
///
/// Cleanup releases them explicitly; if a set is dropped while still
/// holding locks (a body that never reached cleanup), the release is
/// scheduled on the current runtime.
pub struct LockSet {
    lock: ResourceLock,
    held: BTreeMap<Uuid, Universe>,
}

impl LockSet {
    /// Create an empty set.
    pub fn new(lock: ResourceLock) -> Self {
        Self {
            lock,
            held: BTreeMap::new(),
        }
    }

    /// Lock one universe, or return the held snapshot if this set already
    /// holds it.
    pub async fn acquire(&mut self, uuid: Uuid, expected: ExpectedVersion) -> Result<Universe> {
        if let Some(universe) = self.held.get(&uuid) {
            return Ok(universe.clone());
        }
        let universe = self.lock.acquire(uuid, expected).await?;
        self.held.insert(uuid, universe.clone());
        Ok(universe)
    }

    /// Lock every listed universe not already held, in ascending order.
    pub async fn acquire_many(&mut self, uuids: &[Uuid]) -> Result<()> {
        let wanted: Vec<Uuid> = uuids
            .iter()
            .copied()
            .filter(|u| !self.held.contains_key(u))
            .collect();
        for universe in self.lock.acquire_many(&wanted).await? {
            self.held.insert(universe.uuid, universe);
        }
        Ok(())
    }

    /// Check whether this set holds a universe.
    #[must_use]
    pub fn holds(&self, uuid: Uuid) -> bool {
        self.held.contains_key(&uuid)
    }

    /// Snapshot taken when a universe was locked.
    #[must_use]
    pub fn snapshot(&self, uuid: Uuid) -> Option<&Universe> {
        self.held.get(&uuid)
    }

    /// Held universes, ascending.
    #[must_use]
    pub fn held(&self) -> Vec<Uuid> {
        self.held.keys().copied().collect()
    }

    /// Check whether nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Release one universe held by this set.
    pub async fn release(&mut self, uuid: Uuid, error: Option<&str>) -> Result<()> {
        if self.held.remove(&uuid).is_some() {
            self.lock.release(uuid, error).await?;
        }
        Ok(())
    }

    /// Release everything still held, tolerating missing universes.
    pub async fn release_all(&mut self, error: Option<&str>) -> usize {
        let uuids = self.held();
        self.held.clear();
        self.lock.release_all(&uuids, error).await
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let uuids = self.held();
        warn!(?uuids, "Lock set dropped while holding locks");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let lock = self.lock.clone();
                handle.spawn(async move {
                    lock.release_all(&uuids, Some("lock holder dropped")).await;
                });
            }
            Err(_) => {
                tracing::error!(?uuids, "No runtime to release dropped locks");
            }
        }
    }
}
