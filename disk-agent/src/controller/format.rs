// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Force-format stage: unmount, mkfs, status update.

use super::{Controller, ControllerError, jitter_enqueue_delay};
use crate::facilities::{
    AutoProvisioner, BlockDeviceStore, FsOps, StorageNodeStore,
};
use blockdev_utils::blockinfo::{BlockInfo, FileSystemInfo};
use camino::Utf8Path;
use chrono::Utc;
use disk_agent_types::condition::{ConditionType, ConditionUpdate};
use disk_agent_types::{BlockDevice, value_exists};
use slog::{debug, info};

impl<B, N, I, F, A> Controller<B, N, I, F, A>
where
    B: BlockDeviceStore,
    N: StorageNodeStore,
    I: BlockInfo,
    F: FsOps,
    A: AutoProvisioner,
{
    /// Destroys whatever is on the device and creates a fresh ext4
    /// filesystem.
    ///
    /// Concurrent formats are bounded by the format gate; on a miss the
    /// device is requeued with jitter and the tick ends without error.
    pub(super) async fn force_format(
        &self,
        device: &mut BlockDevice,
        dev_path: &Utf8Path,
        filesystem: Option<&FileSystemInfo>,
    ) -> Result<(), ControllerError> {
        let Some(_permit) = self.format_gate.try_acquire() else {
            info!(
                self.log, "hit maximum concurrent format count, requeueing";
                "device" => device.name(),
                "slots_free" => self.format_gate.available(),
            );
            self.devices.requeue_after(
                &self.namespace,
                device.name(),
                jitter_enqueue_delay(),
            );
            return Ok(());
        };

        if let Some(fs) = filesystem {
            if !fs.mount_point.is_empty() {
                info!(
                    self.log, "unmounting device before format";
                    "device" => device.name(),
                    "mount_point" => %fs.mount_point,
                );
                self.fs_ops
                    .umount(Utf8Path::new(&fs.mount_point))
                    .await?;
            }
        }

        // Reuse an existing UUID where possible so the filesystem UUID
        // stays stable. A disk without a WWN is identified by that UUID,
        // and losing it would orphan the resource. Disks with a WWN keep
        // their identity regardless, so mkfs may pick a fresh UUID.
        let details = &device.status.device_status.details;
        let mut uuid = String::new();
        if !value_exists(&details.wwn) {
            if value_exists(&details.uuid) {
                uuid = details.uuid.clone();
            } else if value_exists(&details.pt_uuid) {
                uuid = details.pt_uuid.clone();
            }
        }

        debug!(
            self.log, "creating ext4 filesystem";
            "device" => device.name(),
            "dev_path" => dev_path.as_str(),
            "reused_uuid" => %uuid,
        );
        let reuse = if uuid.is_empty() { None } else { Some(uuid.as_str()) };
        self.fs_ops.format_ext4(dev_path, reuse).await?;

        // When the reused UUID was the PT-UUID, it is now the filesystem
        // UUID; recording it keeps the path resolver able to find the
        // device on the next tick.
        if !uuid.is_empty() {
            device.status.device_status.details.uuid = uuid;
        }

        self.refresh_filesystem(device, dev_path).await?;
        device.set_condition(
            ConditionType::DeviceFormatting,
            ConditionUpdate::ok(
                false,
                "Done device ext4 filesystem formatting",
            ),
        );
        device.status.device_status.file_system.last_formatted_at =
            Some(Utc::now());
        device.status.device_status.partitioned = false;
        device.status.device_status.file_system.corrupted = false;
        Ok(())
    }
}
