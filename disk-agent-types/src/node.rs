// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The storage orchestrator's per-node resource.
//!
//! The agent edits `spec.disks` entries keyed by block-device resource name;
//! the orchestrator reports drain progress back through
//! `status.disk_status[..].scheduled_replica`.

use crate::block_device::Metadata;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sentinel tag marking a disk entry for eviction. Set by the agent when
/// unprovisioning starts; the entry is removed once the orchestrator reports
/// no scheduled replicas.
pub const DISK_REMOVE_TAG: &str = "remove";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageNode {
    pub metadata: Metadata,
    pub spec: StorageNodeSpec,
    pub status: StorageNodeStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodeSpec {
    /// Disks offered to the orchestrator, keyed by block-device name.
    #[serde(default)]
    pub disks: BTreeMap<String, DiskEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskEntry {
    /// Mount point backing the disk.
    pub path: String,
    pub allow_scheduling: bool,
    #[serde(default)]
    pub eviction_requested: bool,
    #[serde(default)]
    pub storage_reserved: i64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl DiskEntry {
    pub fn is_eviction_tagged(&self) -> bool {
        self.tags.iter().any(|t| t == DISK_REMOVE_TAG)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodeStatus {
    #[serde(default)]
    pub disk_status: BTreeMap<String, DiskStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskStatus {
    /// Replicas the orchestrator still schedules on this disk. Empty means
    /// the disk has drained and may be removed.
    #[serde(default)]
    pub scheduled_replica: BTreeMap<String, i64>,
}
