// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The last set of tags this agent pushed to the orchestrator, per device.
//!
//! The provision stage needs to distinguish tags it wrote earlier from tags
//! the orchestrator (or an operator) added out-of-band; this cache holds the
//! agent's side of that ledger. It starts uninitialized: the scanner marks
//! it after its first full pass, and the controller refuses to process any
//! event until then.

use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    tags: BTreeMap<String, Vec<String>>,
    initialized: bool,
}

/// Shared between the controller and the scanner; cloneable via `Arc`.
#[derive(Debug, Default)]
pub struct DiskTagCache {
    inner: RwLock<Inner>,
}

impl DiskTagCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags last written for `device`; empty if the device is unknown.
    pub fn get(&self, device: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner.tags.get(device).cloned().unwrap_or_default()
    }

    pub fn set(&self, device: impl Into<String>, tags: Vec<String>) {
        let mut inner = self.inner.write().unwrap();
        inner.tags.insert(device.into(), tags);
    }

    pub fn delete(&self, device: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.tags.remove(device);
    }

    pub fn has(&self, device: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner.tags.contains_key(device)
    }

    pub fn mark_initialized(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        let inner = self.inner.read().unwrap();
        inner.initialized
    }
}
