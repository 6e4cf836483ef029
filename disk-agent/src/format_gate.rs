// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounds the number of concurrent destructive format operations.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A bounded, non-blocking gate in front of mkfs.
///
/// Acquisition never waits: a miss means the caller should requeue itself
/// and try again on a later tick. The permit releases its slot when
/// dropped, on every exit path.
#[derive(Clone, Debug)]
pub struct FormatGate {
    semaphore: Arc<Semaphore>,
}

#[derive(Debug)]
pub struct FormatPermit {
    _permit: OwnedSemaphorePermit,
}

impl FormatGate {
    pub fn new(max_concurrent_ops: usize) -> Self {
        FormatGate { semaphore: Arc::new(Semaphore::new(max_concurrent_ops)) }
    }

    pub fn try_acquire(&self) -> Option<FormatPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| FormatPermit { _permit: permit })
    }

    /// Slots currently available; used for log messages only.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
