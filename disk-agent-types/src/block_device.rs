// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The block-device resource reconciled by the agent.

use crate::condition::{Condition, ConditionType, ConditionUpdate};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carrying the node a resource belongs to.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Label on partition resources naming their parent disk resource.
pub const PARENT_DEVICE_LABEL: &str = "disk-agent/parent-device";

/// Directory under which provisioned devices are mounted unless the
/// (deprecated) per-device override is set.
pub const EXTRA_DISK_MOUNT_PREFIX: &str = "/var/lib/harvester/extra-disks";

/// A block-device resource.
///
/// Resources arrive from a shared store cache; handlers clone before
/// mutating and write back only when the clone differs from the input, so
/// the whole tree derives `Clone` and `PartialEq`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDevice {
    pub metadata: Metadata,
    pub spec: BlockDeviceSpec,
    pub status: BlockDeviceStatus,
}

impl BlockDevice {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// The path this device is mounted on when provisioned.
    ///
    /// A non-empty `spec.file_system.mount_point` overrides the default;
    /// it is only honored for resources that predate the fixed layout.
    pub fn expected_mount_point(&self) -> String {
        if !self.spec.file_system.mount_point.is_empty() {
            return self.spec.file_system.mount_point.clone();
        }
        format!("{}/{}", EXTRA_DISK_MOUNT_PREFIX, self.metadata.name)
    }

    /// Folds a condition update into the resource status.
    pub fn set_condition(&mut self, which: ConditionType, update: ConditionUpdate) {
        crate::condition::apply(&mut self.status.conditions, which, update);
    }

    pub fn condition_is_true(&self, which: ConditionType) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.condition_type == which && c.status)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Non-`None` means the resource is being deleted.
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSpec {
    /// The node whose agent owns this resource.
    pub node_name: String,
    /// Tags to apply to the orchestrator disk entry.
    #[serde(default)]
    pub tags: Vec<String>,
    pub file_system: FilesystemSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemSpec {
    /// Deprecated per-device mount point override.
    #[serde(default)]
    pub mount_point: String,
    /// The user asks the agent to destroy data and create an ext4 filesystem.
    #[serde(default)]
    pub force_formatted: bool,
    /// The user asserts a previously-corrupted filesystem was fixed
    /// externally.
    #[serde(default)]
    pub repaired: bool,
    /// The user asks the disk be exposed to the orchestrator.
    #[serde(default)]
    pub provisioned: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceStatus {
    pub state: DeviceState,
    #[serde(default)]
    pub provision_phase: ProvisionPhase,
    pub device_status: DeviceStatus,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub details: DeviceDetails,
    pub file_system: FilesystemStatus,
    /// True when the device carries a partition table. Partitioned devices
    /// are never mounted by the agent.
    #[serde(default)]
    pub partitioned: bool,
    /// Last path the device was resolved at. Informational; the stable
    /// identifiers in `details` are authoritative.
    #[serde(default)]
    pub dev_path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDetails {
    #[serde(default)]
    pub device_type: DeviceType,
    /// World-wide name, when the hardware provides one.
    #[serde(default)]
    pub wwn: String,
    /// Filesystem UUID.
    #[serde(default)]
    pub uuid: String,
    /// Partition-table UUID.
    #[serde(default)]
    pub pt_uuid: String,
    /// Individual-partition UUID (partition resources only).
    #[serde(default)]
    pub part_uuid: String,
    #[serde(default)]
    pub storage_controller: StorageController,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemStatus {
    /// Observed mount point; empty when not mounted.
    #[serde(default)]
    pub mount_point: String,
    /// Observed filesystem type; empty when unformatted.
    #[serde(default, rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub is_read_only: bool,
    /// Set when a mount failed in a way that implicates the filesystem
    /// itself; cleared by a successful format.
    #[serde(default)]
    pub corrupted: bool,
    /// When the agent last formatted the device. Never cleared by a status
    /// refresh.
    #[serde(default)]
    pub last_formatted_at: Option<DateTime<Utc>>,
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum DeviceType {
    #[default]
    Disk,
    Partition,
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum StorageController {
    Nvme,
    Sata,
    Scsi,
    Virtio,
    #[default]
    Unknown,
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum DeviceState {
    #[default]
    Active,
    Inactive,
}

/// Where the device stands in the provisioning lifecycle.
///
/// There is no explicit "provisioning" phase: the transition from
/// `Unprovisioned` to `Provisioned` happens within a single successful
/// reconcile tick.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum ProvisionPhase {
    #[default]
    Unprovisioned,
    Provisioned,
    Unprovisioning,
}
