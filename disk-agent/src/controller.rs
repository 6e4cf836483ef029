// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The block-device reconciler.
//!
//! One invocation of [`Controller::on_change`] is a reconcile tick for a
//! single resource. Stages run in a fixed priority: format, then mount,
//! then provision/unprovision, then a status refresh. Each stage mutates a
//! local clone; the tick writes the resource back at most once, and only
//! when the clone differs from the input.

mod format;
mod mount;
mod provision;
mod status;

#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::dispatcher::{Event, EventHandler};
use crate::facilities::{
    AutoProvisioner, BlockDeviceStore, FsOps, StorageNodeStore, StoreError,
};
use crate::format_gate::FormatGate;
use crate::path_resolver::{PathResolver, PathResolverError};
use crate::planner::{self, MountPlan};
use crate::tag_cache::DiskTagCache;
use blockdev_utils::blockinfo::{self, BlockInfo};
use blockdev_utils::devlinks::DevLinks;
use blockdev_utils::{ext4, mount as fs_mount};
use camino::{Utf8Path, Utf8PathBuf};
use disk_agent_types::block_device::{
    DeviceState, HOSTNAME_LABEL, PARENT_DEVICE_LABEL, ProvisionPhase,
};
use disk_agent_types::condition::{ConditionType, ConditionUpdate};
use disk_agent_types::BlockDevice;
use rand::Rng;
use slog::{Logger, debug, error, info, o, warn};
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("disk tag cache is not initialized")]
    CacheNotInitialized,

    #[error("failed to resolve persistent device path for block device {name}")]
    ResolvePath {
        name: String,
        #[source]
        err: PathResolverError,
    },

    #[error(
        "partitioned device is not supported, please use a raw block device instead"
    )]
    PartitionedDevice,

    #[error("unsupported filesystem type {fs_type}")]
    UnsupportedFilesystem { fs_type: String },

    #[error("failed to get filesystem info from device path {dev_path}")]
    FilesystemUnavailable { dev_path: Utf8PathBuf },

    #[error(transparent)]
    BlockInfo(#[from] blockinfo::Error),

    #[error(transparent)]
    Mount(#[from] fs_mount::Error),

    #[error(transparent)]
    Mkfs(#[from] ext4::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Controller<B, N, I, F, A> {
    namespace: String,
    node_name: String,
    devices: B,
    nodes: N,
    block_info: I,
    fs_ops: F,
    scanner: A,
    tag_cache: Arc<DiskTagCache>,
    format_gate: FormatGate,
    devlinks: DevLinks,
    log: Logger,
}

impl<B, N, I, F, A> Controller<B, N, I, F, A>
where
    B: BlockDeviceStore,
    N: StorageNodeStore,
    I: BlockInfo,
    F: FsOps,
    A: AutoProvisioner,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        devices: B,
        nodes: N,
        block_info: I,
        fs_ops: F,
        scanner: A,
        tag_cache: Arc<DiskTagCache>,
        devlinks: DevLinks,
        log: &Logger,
    ) -> Self {
        Controller {
            namespace: config.namespace.clone(),
            node_name: config.node_name.clone(),
            devices,
            nodes,
            block_info,
            fs_ops,
            scanner,
            tag_cache,
            format_gate: FormatGate::new(config.max_concurrent_ops),
            devlinks,
            log: log.new(o!("component" => "BlockDeviceController")),
        }
    }

    /// One reconcile tick for `device`.
    ///
    /// Returns the written-back resource when the tick changed it, `None`
    /// otherwise. Conditions recording a stage failure are committed before
    /// the failure is returned.
    pub async fn on_change(
        &self,
        device: Option<&BlockDevice>,
    ) -> Result<Option<BlockDevice>, ControllerError> {
        let Some(device) = device else {
            return Ok(None);
        };
        if device.metadata.deletion_timestamp.is_some()
            || device.spec.node_name != self.node_name
            || device.status.state == DeviceState::Inactive
        {
            return Ok(None);
        }

        // A corrupted device is left alone until the user either asks for a
        // format or asserts an external repair.
        if device.status.device_status.file_system.corrupted
            && !device.spec.file_system.force_formatted
            && !device.spec.file_system.repaired
        {
            return Ok(None);
        }

        if !self.tag_cache.is_initialized() {
            return Err(ControllerError::CacheNotInitialized);
        }

        let mut updated = device.clone();
        let resolver = PathResolver::new(&self.devlinks, &self.block_info);
        let dev_path = resolver.resolve(device).await.map_err(|err| {
            ControllerError::ResolvePath {
                name: device.name().to_string(),
                err,
            }
        })?;
        let filesystem = self.block_info.filesystem_info(&dev_path).await?;
        debug!(
            self.log, "observed filesystem state";
            "device" => device.name(),
            "filesystem" => ?filesystem,
        );

        let need_format = updated.spec.file_system.force_formatted
            && (updated.status.device_status.file_system.corrupted
                || updated
                    .status
                    .device_status
                    .file_system
                    .last_formatted_at
                    .is_none());
        if need_format {
            info!(
                self.log, "preparing to force format device";
                "device" => device.name(),
            );
            let result = self
                .force_format(&mut updated, &dev_path, filesystem.as_ref())
                .await;
            if let Err(err) = &result {
                error!(
                    self.log, "failed to force format device";
                    "device" => device.name(),
                    InlineErrorChain::new(err),
                );
                updated.set_condition(
                    ConditionType::DeviceFormatting,
                    ConditionUpdate::error(err),
                );
            }
            return self.commit(device, updated, result).await;
        }

        let plan = planner::plan(&updated, filesystem.as_ref());
        if plan != MountPlan::NoOp {
            let result = self
                .update_device_mount(
                    &mut updated,
                    &dev_path,
                    filesystem.as_ref(),
                    plan,
                )
                .await;
            if let Err(err) = &result {
                error!(
                    self.log, "failed to update device mount";
                    "device" => device.name(),
                    InlineErrorChain::new(err),
                );
                updated.set_condition(
                    ConditionType::DeviceMounted,
                    ConditionUpdate::error(err),
                );
            }
            return self.commit(device, updated, result).await;
        }

        self.reconcile_provisioning(device, &mut updated).await;

        if updated != *device {
            debug!(
                self.log, "writing back provision state";
                "device" => device.name(),
            );
            return Ok(Some(self.devices.update(&updated).await?));
        }

        // None of the stages produced an update; refresh the status from
        // the OS instead.
        self.update_device_status(&mut updated, &dev_path).await?;
        if updated != *device {
            debug!(
                self.log, "writing back refreshed device status";
                "device" => device.name(),
            );
            return Ok(Some(self.devices.update(&updated).await?));
        }

        Ok(None)
    }

    /// Dispatches between first-time provisioning, tag-drift repair, and
    /// unprovisioning. Failures here are recorded and retried via the work
    /// queue rather than bubbled: the orchestrator may simply be slow.
    async fn reconcile_provisioning(
        &self,
        device: &BlockDevice,
        updated: &mut BlockDevice,
    ) {
        let need_provision = updated.spec.file_system.provisioned;
        match (need_provision, device.status.provision_phase) {
            (true, ProvisionPhase::Provisioned) => {
                let cached = self.tag_cache.get(device.name());
                let synced = same_tag_set(&updated.spec.tags, &cached);
                let missing_on_node = if synced {
                    self.spec_tags_missing_on_node(updated).await
                } else {
                    false
                };
                if !synced || missing_on_node {
                    debug!(
                        self.log, "device tags drifted";
                        "device" => device.name(),
                        "spec_tags" => ?updated.spec.tags,
                        "cached_tags" => ?cached,
                    );
                    if let Err(err) =
                        self.provision_device_to_node(updated).await
                    {
                        error!(
                            self.log, "failed to update device tags on node";
                            "device" => device.name(),
                            "node" => %self.node_name,
                            InlineErrorChain::new(&err),
                        );
                        self.devices.requeue_after(
                            &self.namespace,
                            device.name(),
                            jitter_enqueue_delay(),
                        );
                    }
                }
            }
            (true, ProvisionPhase::Unprovisioned) => {
                info!(
                    self.log, "preparing to provision device to node";
                    "device" => device.name(),
                    "node" => %self.node_name,
                );
                if let Err(err) = self.provision_device_to_node(updated).await
                {
                    error!(
                        self.log, "failed to provision device to node";
                        "device" => device.name(),
                        "node" => %self.node_name,
                        InlineErrorChain::new(&err),
                    );
                    updated.set_condition(
                        ConditionType::DiskAddedToNode,
                        ConditionUpdate::error(&err),
                    );
                    self.devices.requeue_after(
                        &self.namespace,
                        device.name(),
                        jitter_enqueue_delay(),
                    );
                }
            }
            (false, phase) if phase != ProvisionPhase::Unprovisioned => {
                info!(
                    self.log, "preparing to stop provisioning device";
                    "device" => device.name(),
                    "node" => %self.node_name,
                );
                if let Err(err) =
                    self.unprovision_device_from_node(updated).await
                {
                    error!(
                        self.log, "failed to stop provisioning device";
                        "device" => device.name(),
                        "node" => %self.node_name,
                        InlineErrorChain::new(&err),
                    );
                    updated.set_condition(
                        ConditionType::DiskAddedToNode,
                        ConditionUpdate::error(&err),
                    );
                    self.devices.requeue_after(
                        &self.namespace,
                        device.name(),
                        jitter_enqueue_delay(),
                    );
                }
            }
            _ => (),
        }
    }

    /// Tag-drift backstop: even when the cache agrees with the declared
    /// tags, the node entry itself may have lost some.
    async fn spec_tags_missing_on_node(&self, device: &BlockDevice) -> bool {
        match self.nodes.get_cached(&self.namespace, &self.node_name).await {
            Ok(node) => {
                let node_tags = node
                    .spec
                    .disks
                    .get(device.name())
                    .map(|entry| entry.tags.clone())
                    .unwrap_or_default();
                device
                    .spec
                    .tags
                    .iter()
                    .any(|tag| !node_tags.contains(tag))
            }
            // Can't check; run the provision update and let it sort
            // things out.
            Err(_) => true,
        }
    }

    /// Writes back a changed clone, then surfaces the stage result. The
    /// conditions recording a failure reach the store even when the stage
    /// failed.
    async fn commit(
        &self,
        original: &BlockDevice,
        updated: BlockDevice,
        result: Result<(), ControllerError>,
    ) -> Result<Option<BlockDevice>, ControllerError> {
        let written = if updated != *original {
            Some(self.devices.update(&updated).await?)
        } else {
            None
        };
        result?;
        Ok(written)
    }

    /// Cleans up after a deleted disk resource: its partition children are
    /// deleted, detached from the storage node, and unmounted on a best
    /// effort basis.
    pub async fn on_remove(
        &self,
        device: &BlockDevice,
    ) -> Result<(), ControllerError> {
        if !self.tag_cache.is_initialized() {
            return Err(ControllerError::CacheNotInitialized);
        }

        let mut selector = BTreeMap::new();
        selector.insert(HOSTNAME_LABEL.to_string(), self.node_name.clone());
        selector
            .insert(PARENT_DEVICE_LABEL.to_string(), device.name().to_string());
        let children =
            self.devices.list_by_labels(&self.namespace, &selector).await?;
        if children.is_empty() {
            return Ok(());
        }

        for child in &children {
            self.devices.delete(&self.namespace, child.name()).await?;
        }

        let node = match self.nodes.get(&self.namespace, &self.node_name).await
        {
            Ok(node) => node,
            Err(err) if err.is_not_found() => {
                debug!(
                    self.log, "storage node is gone, skipping disk cleanup";
                    "node" => %self.node_name,
                );
                self.tag_cache.delete(device.name());
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let mut node_copy = node.clone();
        for child in &children {
            if !node_copy.spec.disks.contains_key(child.name()) {
                debug!(
                    self.log, "disk not found in storage node";
                    "device" => child.name(),
                    "node" => %self.node_name,
                );
                continue;
            }
            let mount_point =
                child.status.device_status.file_system.mount_point.clone();
            if !mount_point.is_empty() {
                if let Err(err) =
                    self.fs_ops.umount(Utf8Path::new(&mount_point)).await
                {
                    warn!(
                        self.log, "cannot umount disk";
                        "device" => child.name(),
                        "mount_point" => mount_point,
                        InlineErrorChain::new(&err),
                    );
                }
            }
            node_copy.spec.disks.remove(child.name());
        }
        if node_copy != node {
            self.nodes.update(&node_copy).await?;
        }

        self.tag_cache.delete(device.name());
        Ok(())
    }
}

impl<B, N, I, F, A> EventHandler for Controller<B, N, I, F, A>
where
    B: BlockDeviceStore,
    N: StorageNodeStore,
    I: BlockInfo,
    F: FsOps,
    A: AutoProvisioner,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match event {
            Event::Changed(key) => {
                let device = self.devices.get(&self.namespace, key).await?;
                self.on_change(device.as_ref()).await?;
            }
            Event::Removed(device) => {
                self.on_remove(device).await?;
            }
        }
        Ok(())
    }
}

/// Delay before retrying an operation the orchestrator has not caught up
/// with yet. Uniform in [3s, 7s) so herds of devices spread out.
pub(crate) fn jitter_enqueue_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(3_000..7_000))
}

/// Order- and duplicate-insensitive tag comparison.
pub(crate) fn same_tag_set(a: &[String], b: &[String]) -> bool {
    use std::collections::BTreeSet;
    let a: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    let b: BTreeSet<&str> = b.iter().map(String::as_str).collect();
    a == b
}
