// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Maps a block-device resource to the device path currently backing it.
//!
//! Kernel names move around across reboots and hotplugs; the resource
//! instead records stable identifiers, resolved here through the udev
//! symlink trees in priority order.

use blockdev_utils::blockinfo::{self, BlockInfo};
use blockdev_utils::devlinks::{self, DevLinks};
use camino::Utf8PathBuf;
use disk_agent_types::block_device::{DeviceType, StorageController};
use disk_agent_types::{BlockDevice, value_exists};

#[derive(Debug, thiserror::Error)]
pub enum PathResolverError {
    #[error("WWN/UUID/PTUUID was not found on device {name}")]
    NoStableIdentifier { name: String },

    #[error("PARTUUID was not found on device {name}")]
    NoPartUuid { name: String },

    #[error("no device link for {identifier} of device {name}")]
    LinkVanished { name: String, identifier: String },

    #[error(transparent)]
    DevLinks(#[from] devlinks::Error),

    #[error(transparent)]
    BlockInfo(#[from] blockinfo::Error),
}

pub struct PathResolver<'a, I> {
    devlinks: &'a DevLinks,
    block_info: &'a I,
}

impl<'a, I: BlockInfo> PathResolver<'a, I> {
    pub fn new(devlinks: &'a DevLinks, block_info: &'a I) -> Self {
        PathResolver { devlinks, block_info }
    }

    /// Resolves the persistent device path for `device`.
    ///
    /// Disk identifiers are tried in priority order: WWN, filesystem UUID,
    /// then partition-table UUID. The PT-UUID fallback also checks the
    /// by-uuid tree because a format may have reused the PT-UUID as the
    /// filesystem UUID (see the format stage).
    pub async fn resolve(
        &self,
        device: &BlockDevice,
    ) -> Result<Utf8PathBuf, PathResolverError> {
        let name = device.name();
        let details = &device.status.device_status.details;
        match details.device_type {
            DeviceType::Disk => {
                if value_exists(&details.wwn) {
                    let link = if details.storage_controller
                        == StorageController::Nvme
                    {
                        format!("nvme-{}", details.wwn)
                    } else {
                        format!("wwn-{}", details.wwn)
                    };
                    return self
                        .resolve_or_vanished(devlinks::BY_ID, &link, name)
                        .await;
                }

                if value_exists(&details.uuid) {
                    // A missing by-uuid link falls through to the PT-UUID
                    // rules; the filesystem may have been recreated.
                    if let Some(path) = self
                        .devlinks
                        .resolve(devlinks::BY_UUID, &details.uuid)
                        .await?
                    {
                        return Ok(path);
                    }
                }

                if value_exists(&details.pt_uuid) {
                    if let Some(path) = self
                        .block_info
                        .dev_path_by_pt_uuid(&details.pt_uuid)
                        .await?
                    {
                        return Ok(path);
                    }
                    return self
                        .resolve_or_vanished(
                            devlinks::BY_UUID,
                            &details.pt_uuid,
                            name,
                        )
                        .await;
                }

                Err(PathResolverError::NoStableIdentifier {
                    name: name.to_string(),
                })
            }
            DeviceType::Partition => {
                if !value_exists(&details.part_uuid) {
                    return Err(PathResolverError::NoPartUuid {
                        name: name.to_string(),
                    });
                }
                self.resolve_or_vanished(
                    devlinks::BY_PARTUUID,
                    &details.part_uuid,
                    name,
                )
                .await
            }
        }
    }

    async fn resolve_or_vanished(
        &self,
        subdir: &str,
        link: &str,
        name: &str,
    ) -> Result<Utf8PathBuf, PathResolverError> {
        self.devlinks.resolve(subdir, link).await?.ok_or_else(|| {
            PathResolverError::LinkVanished {
                name: name.to_string(),
                identifier: link.to_string(),
            }
        })
    }
}
