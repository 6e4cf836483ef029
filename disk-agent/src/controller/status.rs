// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Status refresh: re-reading the OS view of a device into the resource.

use super::{Controller, ControllerError};
use crate::facilities::{
    AutoProvisioner, BlockDeviceStore, FsOps, StorageNodeStore,
};
use blockdev_utils::blockinfo::{BlockInfo, DiskInfo, PartitionInfo};
use camino::Utf8Path;
use disk_agent_types::block_device::{
    DeviceDetails, DeviceStatus, DeviceType, FilesystemStatus,
};
use disk_agent_types::BlockDevice;
use slog::info;

impl<B, N, I, F, A> Controller<B, N, I, F, A>
where
    B: BlockDeviceStore,
    N: StorageNodeStore,
    I: BlockInfo,
    F: FsOps,
    A: AutoProvisioner,
{
    /// Rebuilds the device status from the OS and folds it into the
    /// resource. Runs only when no earlier stage produced an update.
    ///
    /// Freshly matched, never-formatted disks may also be flagged for
    /// auto-provisioning here, which triggers a format on the next tick.
    pub(super) async fn update_device_status(
        &self,
        device: &mut BlockDevice,
        dev_path: &Utf8Path,
    ) -> Result<(), ControllerError> {
        let (mut new_status, need_auto_provision) =
            match device.status.device_status.details.device_type {
                DeviceType::Disk => {
                    let disk =
                        self.block_info.disk_by_dev_path(dev_path).await?;
                    let matched = self.scanner.matches_filters(&disk);
                    // Only whole disks can be auto-provisioned.
                    let need =
                        self.scanner.needs_auto_provision(device, matched);
                    (device_status_from_disk(&disk), need)
                }
                DeviceType::Partition => {
                    let parent =
                        self.block_info.parent_dev_path(dev_path).await?;
                    let part = self
                        .block_info
                        .partition_by_dev_path(&parent, dev_path)
                        .await?;
                    (device_status_from_partition(&part), false)
                }
            };

        // A refresh must not erase format history.
        let last_formatted =
            device.status.device_status.file_system.last_formatted_at;
        if last_formatted.is_some()
            && new_status.file_system.last_formatted_at.is_none()
        {
            new_status.file_system.last_formatted_at = last_formatted;
        }

        new_status.dev_path = dev_path.to_string();

        if device.status.device_status != new_status {
            info!(
                self.log, "updating device status from the OS";
                "device" => device.name(),
            );
            device.status.device_status = new_status;
        }

        if need_auto_provision {
            info!(
                self.log, "auto-provisioning device";
                "device" => device.name(),
            );
            device.spec.file_system.force_formatted = true;
            device.spec.file_system.provisioned = true;
        }
        Ok(())
    }
}

fn device_status_from_disk(disk: &DiskInfo) -> DeviceStatus {
    DeviceStatus {
        details: DeviceDetails {
            device_type: DeviceType::Disk,
            wwn: disk.wwn.clone(),
            uuid: disk.fs_uuid.clone(),
            pt_uuid: disk.pt_uuid.clone(),
            part_uuid: String::new(),
            storage_controller: disk.storage_controller,
        },
        file_system: FilesystemStatus {
            mount_point: disk.filesystem.mount_point.clone(),
            fs_type: disk.filesystem.fs_type.clone(),
            is_read_only: disk.filesystem.is_read_only,
            corrupted: false,
            last_formatted_at: None,
        },
        partitioned: disk.partitioned,
        dev_path: disk.dev_path.to_string(),
    }
}

fn device_status_from_partition(part: &PartitionInfo) -> DeviceStatus {
    DeviceStatus {
        details: DeviceDetails {
            device_type: DeviceType::Partition,
            wwn: String::new(),
            uuid: part.fs_uuid.clone(),
            pt_uuid: String::new(),
            part_uuid: part.part_uuid.clone(),
            storage_controller: Default::default(),
        },
        file_system: FilesystemStatus {
            mount_point: part.filesystem.mount_point.clone(),
            fs_type: part.filesystem.fs_type.clone(),
            is_read_only: part.filesystem.is_read_only,
            corrupted: false,
            last_formatted_at: None,
        },
        partitioned: false,
        dev_path: part.dev_path.to_string(),
    }
}
