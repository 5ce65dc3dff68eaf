// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use aptos_infallible::Mutex;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A fair permit queue for bounding parallelism.
///
/// Waiters are served in FIFO order. Permits release on drop, so they can
/// neither leak nor be released twice; paths that need an explicit release
/// point go through a [`PermitSlot`].
#[derive(Clone, Debug)]
pub struct AsyncSemaphore {
    inner: Arc<Semaphore>,
}

impl AsyncSemaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Returns immediately while a permit is available, otherwise queues
    /// behind earlier waiters.
    pub async fn acquire(&self) -> Permit {
        let permit = self
            .inner
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        Permit { _permit: permit }
    }

    pub fn available_permits(&self) -> usize {
        self.inner.available_permits()
    }
}

#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

/// A take-once holder so non-RAII call sites can release exactly once and
/// tolerate redundant release calls.
#[derive(Debug)]
pub struct PermitSlot(Mutex<Option<Permit>>);

impl PermitSlot {
    pub fn new(permit: Permit) -> Self {
        Self(Mutex::new(Some(permit)))
    }

    pub fn release(&self) {
        drop(self.0.lock().take());
    }
}
