// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decides what mount work, if any, a device needs.

use blockdev_utils::blockinfo::FileSystemInfo;
use disk_agent_types::BlockDevice;

/// The mount work a reconcile tick should perform.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MountPlan {
    NoOp,
    Mount,
    Unmount,
    /// Mounted somewhere other than the expected mount point.
    UnmountThenMount,
}

impl MountPlan {
    pub fn mounts(&self) -> bool {
        matches!(self, MountPlan::Mount | MountPlan::UnmountThenMount)
    }

    pub fn unmounts(&self) -> bool {
        matches!(self, MountPlan::Unmount | MountPlan::UnmountThenMount)
    }
}

/// Pure function of the declared spec and the observed filesystem state.
///
/// `observed` of `None` means the device is not visible to the block layer
/// yet; nothing can usefully be done this tick.
pub fn plan(
    device: &BlockDevice,
    observed: Option<&FileSystemInfo>,
) -> MountPlan {
    let Some(observed) = observed else {
        return MountPlan::NoOp;
    };

    if device.spec.file_system.provisioned {
        if observed.mount_point.is_empty() {
            return MountPlan::Mount;
        }
        if observed.mount_point == device.expected_mount_point() {
            return MountPlan::NoOp;
        }
        return MountPlan::UnmountThenMount;
    }
    if !observed.mount_point.is_empty() {
        return MountPlan::Unmount;
    }
    MountPlan::NoOp
}
