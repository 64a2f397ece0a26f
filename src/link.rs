// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Current Handle Cell
//!
//! A [`Link`] holds the lifecycle state of the connection or the channel along
//! with the live handle when there is one. Only the owning supervisor writes
//! it; every other task reads it by value.

use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of a connection or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Absent,
    Establishing,
    Established,
}

enum Slot<T: ?Sized> {
    Absent,
    Establishing,
    Established(Arc<T>),
}

impl<T: ?Sized> Slot<T> {
    fn state(&self) -> LinkState {
        match self {
            Slot::Absent => LinkState::Absent,
            Slot::Establishing => LinkState::Establishing,
            Slot::Established(_) => LinkState::Established,
        }
    }

    fn holds(&self, handle: &Arc<T>) -> bool {
        match self {
            Slot::Established(current) => {
                Arc::as_ptr(current) as *const () == Arc::as_ptr(handle) as *const ()
            }
            _ => false,
        }
    }
}

/// Shared, watchable cell for one broker handle.
pub struct Link<T: ?Sized> {
    tx: Arc<watch::Sender<Slot<T>>>,
}

impl<T: ?Sized> Clone for Link<T> {
    fn clone(&self) -> Self {
        Link {
            tx: self.tx.clone(),
        }
    }
}

impl<T: ?Sized> Default for Link<T> {
    fn default() -> Self {
        let (tx, _) = watch::channel(Slot::Absent);
        Link { tx: Arc::new(tx) }
    }
}

impl<T: ?Sized> Link<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LinkState {
        self.tx.borrow().state()
    }

    /// The live handle, if the link is established.
    pub fn current(&self) -> Option<Arc<T>> {
        match &*self.tx.borrow() {
            Slot::Established(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    pub(crate) fn establishing(&self) {
        self.tx.send_replace(Slot::Establishing);
    }

    pub(crate) fn establish(&self, handle: Arc<T>) {
        self.tx.send_replace(Slot::Established(handle));
    }

    pub(crate) fn clear(&self) {
        self.tx.send_replace(Slot::Absent);
    }

    /// Resolves once the link no longer holds `handle`.
    pub async fn lost(&self, handle: &Arc<T>) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as `self`, so this never errors
        let _ = rx.wait_for(|slot| !slot.holds(handle)).await;
    }

    /// Resolves once the link reaches `state`.
    pub async fn reached(&self, state: LinkState) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|slot| slot.state() == state).await;
    }
}
