// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contracts for the controller's external collaborators.
//!
//! The embedding process supplies the store clients and the scanner; the
//! filesystem tooling has a real implementation here. Tests substitute
//! hand-written fakes for all of them.

use blockdev_utils::blockinfo::DiskInfo;
use blockdev_utils::ext4::Ext4;
use blockdev_utils::mount::Mount;
use blockdev_utils::{ext4, mount};
use camino::Utf8Path;
use disk_agent_types::{BlockDevice, StorageNode};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        StoreError::NotFound { kind, name: name.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Client for block-device resources, including the work-queue capability
/// to run a key again later.
pub trait BlockDeviceStore: Send + Sync + 'static {
    /// Fetches a resource; `None` if it does not exist.
    fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<BlockDevice>, StoreError>> + Send;

    fn update(
        &self,
        device: &BlockDevice,
    ) -> impl Future<Output = Result<BlockDevice, StoreError>> + Send;

    fn delete(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn list_by_labels(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<Vec<BlockDevice>, StoreError>> + Send;

    /// Asks the dispatcher to run this key again after `delay`.
    fn requeue_after(&self, namespace: &str, name: &str, delay: Duration);
}

/// Client for the orchestrator's per-node resource.
pub trait StorageNodeStore: Send + Sync + 'static {
    /// Cached read; may lag the authoritative state slightly.
    fn get_cached(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<StorageNode, StoreError>> + Send;

    /// Authoritative read.
    fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<StorageNode, StoreError>> + Send;

    fn update(
        &self,
        node: &StorageNode,
    ) -> impl Future<Output = Result<StorageNode, StoreError>> + Send;
}

/// The scanner's view of which disks deserve automatic provisioning.
pub trait AutoProvisioner: Send + Sync + 'static {
    /// Whether the disk matches the configured auto-provision filters.
    fn matches_filters(&self, disk: &DiskInfo) -> bool;

    /// Whether `device` should be force-formatted and provisioned now.
    /// Implementations are expected to decline devices that were already
    /// formatted by the agent.
    fn needs_auto_provision(
        &self,
        device: &BlockDevice,
        matched: bool,
    ) -> bool;
}

/// Filesystem operations the reconciler performs on devices.
pub trait FsOps: Send + Sync + 'static {
    fn mount(
        &self,
        dev_path: &Utf8Path,
        mount_point: &Utf8Path,
    ) -> impl Future<Output = Result<(), mount::Error>> + Send;

    fn umount(
        &self,
        mount_point: &Utf8Path,
    ) -> impl Future<Output = Result<(), mount::Error>> + Send;

    fn format_ext4(
        &self,
        dev_path: &Utf8Path,
        uuid: Option<&str>,
    ) -> impl Future<Output = Result<(), ext4::Error>> + Send;
}

/// Production [`FsOps`] backed by the mount/umount/mkfs subprocess
/// wrappers.
#[derive(Clone, Debug, Default)]
pub struct RealFsOps {}

impl FsOps for RealFsOps {
    async fn mount(
        &self,
        dev_path: &Utf8Path,
        mount_point: &Utf8Path,
    ) -> Result<(), mount::Error> {
        Mount::mount(dev_path, mount_point).await
    }

    async fn umount(&self, mount_point: &Utf8Path) -> Result<(), mount::Error> {
        Mount::umount(mount_point).await
    }

    async fn format_ext4(
        &self,
        dev_path: &Utf8Path,
        uuid: Option<&str>,
    ) -> Result<(), ext4::Error> {
        Ext4::format(dev_path, uuid).await
    }
}
