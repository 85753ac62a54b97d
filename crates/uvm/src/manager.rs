//! Shared state container for the per-kind resource managers.
//!
//! Every manager owns one [`Manager`]: a read/write lock around the
//! kind-specific index, the [`Host`] capability and a name counter. Helpers
//! on [`ManagerState`] are only reachable through a lock guard.

use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uvm_core::{Error, Host, Result};

pub(crate) struct ManagerState<S> {
    host: Option<Arc<dyn Host>>,
    pub(crate) index: S,
    counter: u64,
}

impl<S> ManagerState<S> {
    pub(crate) fn host(&self) -> Result<&Arc<dyn Host>> {
        self.host.as_ref().ok_or(Error::InvalidManagerState)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.host.is_none()
    }

    /// Returns the next unused counter value.
    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.counter;
        self.counter += 1;
        id
    }

    /// Ensures future ids are strictly greater than `id`.
    pub(crate) fn reserve_id(&mut self, id: u64) {
        if self.counter <= id {
            self.counter = id + 1;
        }
    }

    pub(crate) fn take_host(&mut self) -> Option<Arc<dyn Host>> {
        self.host.take()
    }
}

pub(crate) struct Manager<S> {
    state: RwLock<ManagerState<S>>,
}

impl<S> Manager<S> {
    pub(crate) fn new(host: Arc<dyn Host>, index: S) -> Self {
        Self {
            state: RwLock::new(ManagerState {
                host: Some(host),
                index,
                counter: 0,
            }),
        }
    }

    /// Read access for lookups. Fails once the manager is closed.
    pub(crate) async fn read(&self) -> Result<RwLockReadGuard<'_, ManagerState<S>>> {
        let state = self.state.read().await;
        state.host()?;
        Ok(state)
    }

    /// Write access for mutations. Fails once the manager is closed.
    pub(crate) async fn write(&self) -> Result<RwLockWriteGuard<'_, ManagerState<S>>> {
        let state = self.state.write().await;
        state.host()?;
        Ok(state)
    }

    /// Write access regardless of whether the manager is closed. Used by
    /// teardown and by rollback paths racing a close.
    pub(crate) async fn write_any(&self) -> RwLockWriteGuard<'_, ManagerState<S>> {
        self.state.write().await
    }

    pub(crate) async fn host(&self) -> Result<Arc<dyn Host>> {
        self.state.read().await.host().cloned()
    }

    pub(crate) async fn is_closed(&self) -> bool {
        self.state.read().await.is_closed()
    }
}
