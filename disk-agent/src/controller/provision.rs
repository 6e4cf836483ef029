// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provision and unprovision stages: the disk entry on the storage node.

use super::{Controller, ControllerError, jitter_enqueue_delay};
use crate::facilities::{
    AutoProvisioner, BlockDeviceStore, FsOps, StorageNodeStore,
};
use blockdev_utils::blockinfo::BlockInfo;
use disk_agent_types::block_device::ProvisionPhase;
use disk_agent_types::condition::{ConditionType, ConditionUpdate};
use disk_agent_types::node::{DISK_REMOVE_TAG, DiskEntry};
use disk_agent_types::BlockDevice;
use slog::{debug, info};

impl<B, N, I, F, A> Controller<B, N, I, F, A>
where
    B: BlockDeviceStore,
    N: StorageNodeStore,
    I: BlockInfo,
    F: FsOps,
    A: AutoProvisioner,
{
    /// Adds (or re-merges) the device's disk entry on the storage node.
    ///
    /// Idempotent: the node is written only when the intended entry
    /// differs from what it already carries. Tags the orchestrator carries
    /// that this agent never wrote are preserved.
    pub(super) async fn provision_device_to_node(
        &self,
        device: &mut BlockDevice,
    ) -> Result<(), ControllerError> {
        let node = match self
            .nodes
            .get_cached(&self.namespace, &self.node_name)
            .await
        {
            Ok(node) => node,
            Err(err) if err.is_not_found() => {
                self.nodes.get(&self.namespace, &self.node_name).await?
            }
            Err(err) => return Err(err.into()),
        };

        let mut disk_entry = DiskEntry {
            path: device.expected_mount_point(),
            allow_scheduling: true,
            eviction_requested: false,
            storage_reserved: 0,
            tags: device.spec.tags.clone(),
        };

        let mut up_to_date = false;
        if let Some(existing) = node.spec.disks.get(device.name()) {
            // Tags present on the node but never written by this agent
            // belong to the orchestrator or its operator; keep them.
            let respected: Vec<String> = if self.tag_cache.has(device.name())
            {
                let cached = self.tag_cache.get(device.name());
                existing
                    .tags
                    .iter()
                    .filter(|tag| !cached.contains(tag))
                    .cloned()
                    .collect()
            } else {
                existing.tags.clone()
            };
            debug!(
                self.log, "respecting tags only present on the node";
                "device" => device.name(),
                "respected_tags" => ?respected,
            );
            disk_entry.tags = dedupe_tags(
                respected
                    .into_iter()
                    .chain(device.spec.tags.iter().cloned()),
            );
            up_to_date = *existing == disk_entry;
        }

        if !up_to_date
            || !device.condition_is_true(ConditionType::DiskAddedToNode)
        {
            if !up_to_date {
                let mut node_copy = node.clone();
                node_copy
                    .spec
                    .disks
                    .insert(device.name().to_string(), disk_entry);
                self.nodes.update(&node_copy).await?;
            }

            // The node may already carry the disk from an earlier tick
            // whose resource write-back failed; recover the phase either
            // way.
            if !device.condition_is_true(ConditionType::DiskAddedToNode) {
                let msg = format!(
                    "Added disk {} to storage node `{}` as an additional disk",
                    device.name(),
                    node.metadata.name,
                );
                info!(self.log, "{msg}");
                device.status.provision_phase = ProvisionPhase::Provisioned;
                device.set_condition(
                    ConditionType::DiskAddedToNode,
                    ConditionUpdate::ok(true, msg),
                );
            }
        }

        self.tag_cache.set(device.name(), device.spec.tags.clone());
        Ok(())
    }

    /// Two-phase removal of the device's disk entry from the storage node:
    /// first mark the entry for eviction, then delete it once the
    /// orchestrator reports no scheduled replicas.
    pub(super) async fn unprovision_device_from_node(
        &self,
        device: &mut BlockDevice,
    ) -> Result<(), ControllerError> {
        let node = match self.nodes.get(&self.namespace, &self.node_name).await
        {
            Ok(node) => node,
            // Nothing to clean up.
            Err(err) if err.is_not_found() => {
                mark_unprovisioned(device, &self.node_name);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let Some(disk_to_remove) = node.spec.disks.get(device.name()) else {
            info!(
                self.log, "disk not in disks of storage node";
                "device" => device.name(),
                "node" => %self.node_name,
            );
            mark_unprovisioned(device, &self.node_name);
            return Ok(());
        };

        if disk_to_remove.is_eviction_tagged() {
            let drained = node
                .status
                .disk_status
                .get(device.name())
                .map(|status| status.scheduled_replica.is_empty())
                .unwrap_or(false);
            if drained {
                let mut node_copy = node.clone();
                node_copy.spec.disks.remove(device.name());
                self.nodes.update(&node_copy).await?;
                mark_unprovisioned(device, &self.node_name);
                debug!(
                    self.log, "device is unprovisioned";
                    "device" => device.name(),
                );
            } else {
                // Still draining; check again shortly.
                self.devices.requeue_after(
                    &self.namespace,
                    device.name(),
                    jitter_enqueue_delay(),
                );
                debug!(
                    self.log, "device is still unprovisioning";
                    "device" => device.name(),
                );
            }
        } else {
            let mut entry = disk_to_remove.clone();
            entry.allow_scheduling = false;
            entry.eviction_requested = true;
            entry.tags.push(DISK_REMOVE_TAG.to_string());
            let mut node_copy = node.clone();
            node_copy.spec.disks.insert(device.name().to_string(), entry);
            self.nodes.update(&node_copy).await?;

            let msg = format!(
                "Stopped provisioning device {} to storage node `{}`",
                device.name(),
                self.node_name,
            );
            device.status.provision_phase = ProvisionPhase::Unprovisioning;
            device.set_condition(
                ConditionType::DiskAddedToNode,
                ConditionUpdate::ok(false, msg),
            );
        }

        Ok(())
    }
}

fn mark_unprovisioned(device: &mut BlockDevice, node_name: &str) {
    let msg = format!("Disk not in storage node `{node_name}`");
    device.status.provision_phase = ProvisionPhase::Unprovisioned;
    device.set_condition(
        ConditionType::DiskAddedToNode,
        ConditionUpdate::ok(false, msg),
    );
}

/// Removes duplicates while keeping the first occurrence of each tag.
pub(crate) fn dedupe_tags(
    tags: impl IntoIterator<Item = String>,
) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    tags.into_iter().filter(|tag| seen.insert(tag.clone())).collect()
}
