//! Keyed state container shared by every store handle.
//!
//! # Design Decisions
//! - Backed by a `tokio::sync::watch` sender: reads borrow, writes notify
//! - Every write is one closure under the write lock; closures never await,
//!   so readers never observe a half-applied transition
//! - Closures must not read the container themselves (the lock is held)

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::watch;

use crate::resources::slice::ResourceSlice;

/// `type → key → slice`
pub type SliceMap = HashMap<String, HashMap<String, ResourceSlice>>;

/// Everything the resource store holds.
#[derive(Debug, Clone, Default)]
pub struct ResourceStoreState {
    pub data: SliceMap,
    /// Caller-supplied context passed to key and data functions.
    pub context: Value,
    /// Prefetched slices, promoted into `data` on first request.
    pub prefetching: SliceMap,
}

impl ResourceStoreState {
    pub fn slice(&self, resource_type: &str, key: &str) -> Option<&ResourceSlice> {
        self.data.get(resource_type)?.get(key)
    }

    pub(crate) fn slice_mut(&mut self, resource_type: &str, key: &str) -> Option<&mut ResourceSlice> {
        self.data.get_mut(resource_type)?.get_mut(key)
    }

    pub(crate) fn prefetched(&self, resource_type: &str, key: &str) -> Option<&ResourceSlice> {
        self.prefetching.get(resource_type)?.get(key)
    }
}

/// A value with get / set / subscribe.
#[derive(Debug)]
pub struct StateContainer<S> {
    sender: watch::Sender<S>,
}

impl<S> StateContainer<S> {
    pub fn new(initial: S) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Read the current state without cloning it.
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.sender.borrow())
    }

    /// Apply a transition and notify subscribers.
    pub fn modify<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut output = None;
        self.sender.send_modify(|state| output = Some(f(state)));
        output.expect("send_modify runs its closure exactly once")
    }

    /// Apply a transition that may turn out to be a no-op; subscribers are
    /// only notified when `f` returns `Some`.
    pub fn modify_if<R>(&self, f: impl FnOnce(&mut S) -> Option<R>) -> Option<R> {
        let mut output = None;
        self.sender.send_if_modified(|state| {
            output = f(state);
            output.is_some()
        });
        output
    }

    /// Replace the whole state.
    pub fn set_state(&self, state: S) {
        self.sender.send_replace(state);
    }

    /// Receiver notified after every write.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.sender.subscribe()
    }
}

impl<S: Clone> StateContainer<S> {
    pub fn get_state(&self) -> S {
        self.sender.borrow().clone()
    }
}

impl<S: Default> Default for StateContainer<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}
