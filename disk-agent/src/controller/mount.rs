// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mount stage: applies the planner's decision.

use super::{Controller, ControllerError};
use crate::SUPPORTED_FILESYSTEM;
use crate::facilities::{
    AutoProvisioner, BlockDeviceStore, FsOps, StorageNodeStore,
};
use crate::planner::MountPlan;
use blockdev_utils::blockinfo::{BlockInfo, FileSystemInfo};
use camino::Utf8Path;
use disk_agent_types::BlockDevice;
use disk_agent_types::condition::{ConditionType, ConditionUpdate};
use slog::{error, info};

impl<B, N, I, F, A> Controller<B, N, I, F, A>
where
    B: BlockDeviceStore,
    N: StorageNodeStore,
    I: BlockInfo,
    F: FsOps,
    A: AutoProvisioner,
{
    pub(super) async fn update_device_mount(
        &self,
        device: &mut BlockDevice,
        dev_path: &Utf8Path,
        filesystem: Option<&FileSystemInfo>,
        plan: MountPlan,
    ) -> Result<(), ControllerError> {
        info!(
            self.log, "applying mount plan";
            "device" => device.name(),
            "plan" => ?plan,
        );
        if device.status.device_status.partitioned {
            return Err(ControllerError::PartitionedDevice);
        }

        if plan.unmounts() {
            let mount_point = filesystem
                .map(|fs| fs.mount_point.as_str())
                .unwrap_or_default();
            info!(
                self.log, "unmounting device";
                "device" => device.name(),
                "mount_point" => mount_point,
            );
            self.fs_ops.umount(Utf8Path::new(mount_point)).await?;
            device.set_condition(
                ConditionType::DeviceMounted,
                ConditionUpdate::ok(
                    false,
                    format!("Unmounted device from {mount_point}"),
                ),
            );
        }

        if plan.mounts() {
            let mount_point = device.expected_mount_point();
            info!(
                self.log, "mounting device";
                "device" => device.name(),
                "mount_point" => %mount_point,
            );
            if let Err(err) = self
                .fs_ops
                .mount(dev_path, Utf8Path::new(&mount_point))
                .await
            {
                if err.is_filesystem_corrupted() {
                    error!(
                        self.log,
                        "device may be corrupted, recording filesystem state";
                        "device" => device.name(),
                    );
                    device.status.device_status.file_system.corrupted = true;
                    // A fresh corruption invalidates any earlier repair
                    // claim.
                    device.spec.file_system.repaired = false;
                }
                return Err(err.into());
            }
            device.set_condition(
                ConditionType::DeviceMounted,
                ConditionUpdate::ok(
                    true,
                    format!("Mounted device on {mount_point}"),
                ),
            );
        }

        device.status.device_status.file_system.corrupted = false;
        self.refresh_filesystem(device, dev_path).await
    }

    /// Re-reads the filesystem observation into the resource status and
    /// rejects anything other than the one supported filesystem type.
    pub(super) async fn refresh_filesystem(
        &self,
        device: &mut BlockDevice,
        dev_path: &Utf8Path,
    ) -> Result<(), ControllerError> {
        if device.status.device_status.file_system.corrupted {
            // Only the corrupted flag is meaningful right now; the rest of
            // the observation would be noise.
            return Ok(());
        }
        let filesystem = self
            .block_info
            .filesystem_info(dev_path)
            .await?
            .ok_or_else(|| ControllerError::FilesystemUnavailable {
                dev_path: dev_path.to_owned(),
            })?;
        if !filesystem.mount_point.is_empty()
            && !filesystem.fs_type.is_empty()
            && filesystem.fs_type != SUPPORTED_FILESYSTEM
        {
            return Err(ControllerError::UnsupportedFilesystem {
                fs_type: filesystem.fs_type,
            });
        }

        let fs_status = &mut device.status.device_status.file_system;
        fs_status.mount_point = filesystem.mount_point;
        fs_status.fs_type = filesystem.fs_type;
        fs_status.is_read_only = filesystem.is_read_only;
        Ok(())
    }
}
