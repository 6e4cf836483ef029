// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Observation of block devices via lsblk and blkid.

use crate::{ExecutionError, execute_async};
use camino::{Utf8Path, Utf8PathBuf};
use disk_agent_types::block_device::StorageController;
use serde::Deserialize;
use std::future::Future;
use tokio::process::Command;

const LSBLK: &str = "/usr/bin/lsblk";
const BLKID: &str = "/sbin/blkid";

const LSBLK_COLUMNS: &str =
    "NAME,PATH,TYPE,FSTYPE,UUID,PTUUID,PARTUUID,WWN,TRAN,MOUNTPOINT,RO,RM,SIZE,PKNAME";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("command output is not valid UTF-8: {0}")]
    NotValidUtf8(#[from] std::string::FromUtf8Error),

    #[error("failed to parse lsblk output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("no block device at {0}")]
    NoDevice(Utf8PathBuf),

    #[error("{0} has no parent device")]
    NoParent(Utf8PathBuf),
}

/// Filesystem state observed on a device. All fields empty/false when the
/// device carries no filesystem.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileSystemInfo {
    /// Empty when not mounted.
    pub mount_point: String,
    /// Empty when unformatted.
    pub fs_type: String,
    pub is_read_only: bool,
}

/// A whole disk as observed by the block layer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiskInfo {
    pub name: String,
    pub dev_path: Utf8PathBuf,
    pub wwn: String,
    pub fs_uuid: String,
    pub pt_uuid: String,
    pub storage_controller: StorageController,
    pub filesystem: FileSystemInfo,
    /// True when the disk carries partitions.
    pub partitioned: bool,
    pub removable: bool,
    pub size_bytes: u64,
}

/// A single partition as observed by the block layer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartitionInfo {
    pub name: String,
    pub dev_path: Utf8PathBuf,
    pub part_uuid: String,
    pub fs_uuid: String,
    pub filesystem: FileSystemInfo,
    pub parent_dev_path: Utf8PathBuf,
    pub size_bytes: u64,
}

/// Read-only access to the kernel's view of block devices.
///
/// In production the implementor is [`Lsblk`]; tests substitute fakes.
pub trait BlockInfo: Send + Sync + 'static {
    /// Observes the filesystem on `dev_path`. `None` means the device is
    /// not (or not yet) visible to the block layer.
    fn filesystem_info(
        &self,
        dev_path: &Utf8Path,
    ) -> impl Future<Output = Result<Option<FileSystemInfo>, Error>> + Send;

    fn disk_by_dev_path(
        &self,
        dev_path: &Utf8Path,
    ) -> impl Future<Output = Result<DiskInfo, Error>> + Send;

    fn partition_by_dev_path(
        &self,
        parent_dev_path: &Utf8Path,
        dev_path: &Utf8Path,
    ) -> impl Future<Output = Result<PartitionInfo, Error>> + Send;

    /// Finds the device whose partition table carries `pt_uuid`, if any.
    fn dev_path_by_pt_uuid(
        &self,
        pt_uuid: &str,
    ) -> impl Future<Output = Result<Option<Utf8PathBuf>, Error>> + Send;

    fn parent_dev_path(
        &self,
        dev_path: &Utf8Path,
    ) -> impl Future<Output = Result<Utf8PathBuf, Error>> + Send;
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Default, Deserialize)]
struct LsblkDevice {
    name: Option<String>,
    path: Option<String>,
    #[serde(rename = "type")]
    device_type: Option<String>,
    fstype: Option<String>,
    uuid: Option<String>,
    ptuuid: Option<String>,
    partuuid: Option<String>,
    wwn: Option<String>,
    tran: Option<String>,
    mountpoint: Option<String>,
    ro: Option<bool>,
    rm: Option<bool>,
    size: Option<u64>,
    pkname: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    fn filesystem(&self) -> FileSystemInfo {
        FileSystemInfo {
            mount_point: field(&self.mountpoint),
            fs_type: field(&self.fstype),
            is_read_only: self.ro.unwrap_or(false),
        }
    }

    fn to_disk(&self) -> DiskInfo {
        DiskInfo {
            name: field(&self.name),
            dev_path: Utf8PathBuf::from(field(&self.path)),
            wwn: field(&self.wwn),
            fs_uuid: field(&self.uuid),
            pt_uuid: field(&self.ptuuid),
            storage_controller: controller_from_transport(
                self.tran.as_deref(),
            ),
            filesystem: self.filesystem(),
            partitioned: self
                .children
                .iter()
                .any(|c| c.device_type.as_deref() == Some("part")),
            removable: self.rm.unwrap_or(false),
            size_bytes: self.size.unwrap_or(0),
        }
    }

    fn to_partition(&self, parent_dev_path: &Utf8Path) -> PartitionInfo {
        PartitionInfo {
            name: field(&self.name),
            dev_path: Utf8PathBuf::from(field(&self.path)),
            part_uuid: field(&self.partuuid),
            fs_uuid: field(&self.uuid),
            filesystem: self.filesystem(),
            parent_dev_path: parent_dev_path.to_owned(),
            size_bytes: self.size.unwrap_or(0),
        }
    }
}

fn field(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn controller_from_transport(tran: Option<&str>) -> StorageController {
    match tran {
        Some("nvme") => StorageController::Nvme,
        Some("sata") | Some("ata") => StorageController::Sata,
        Some("sas") | Some("scsi") | Some("iscsi") | Some("usb") => {
            StorageController::Scsi
        }
        Some("virtio") => StorageController::Virtio,
        _ => StorageController::Unknown,
    }
}

fn parse_lsblk(stdout: Vec<u8>) -> Result<LsblkOutput, Error> {
    let stdout = String::from_utf8(stdout)?;
    Ok(serde_json::from_str(&stdout)?)
}

/// Wraps the 'lsblk' and 'blkid' commands.
#[derive(Clone, Debug, Default)]
pub struct Lsblk {}

impl Lsblk {
    pub fn new() -> Self {
        Lsblk {}
    }

    async fn query(
        &self,
        dev_path: &Utf8Path,
        nodeps: bool,
    ) -> Result<Option<LsblkOutput>, Error> {
        let mut cmd = Command::new(LSBLK);
        cmd.env_clear();
        cmd.env("LC_ALL", "C.UTF-8");
        cmd.arg("--json").arg("--bytes").arg("--paths");
        if nodeps {
            cmd.arg("--nodeps");
        }
        cmd.arg("--output").arg(LSBLK_COLUMNS);
        cmd.arg(dev_path);

        match execute_async(&mut cmd).await {
            Ok(output) => Ok(Some(parse_lsblk(output.stdout)?)),
            // lsblk exits non-zero when the device does not exist; the
            // caller decides whether that is an error.
            Err(ExecutionError::CommandFailure(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl BlockInfo for Lsblk {
    async fn filesystem_info(
        &self,
        dev_path: &Utf8Path,
    ) -> Result<Option<FileSystemInfo>, Error> {
        let Some(output) = self.query(dev_path, true).await? else {
            return Ok(None);
        };
        Ok(output.blockdevices.first().map(|dev| dev.filesystem()))
    }

    async fn disk_by_dev_path(
        &self,
        dev_path: &Utf8Path,
    ) -> Result<DiskInfo, Error> {
        let output = self
            .query(dev_path, false)
            .await?
            .ok_or_else(|| Error::NoDevice(dev_path.to_owned()))?;
        let dev = output
            .blockdevices
            .first()
            .ok_or_else(|| Error::NoDevice(dev_path.to_owned()))?;
        Ok(dev.to_disk())
    }

    async fn partition_by_dev_path(
        &self,
        parent_dev_path: &Utf8Path,
        dev_path: &Utf8Path,
    ) -> Result<PartitionInfo, Error> {
        let output = self
            .query(dev_path, true)
            .await?
            .ok_or_else(|| Error::NoDevice(dev_path.to_owned()))?;
        let dev = output
            .blockdevices
            .first()
            .ok_or_else(|| Error::NoDevice(dev_path.to_owned()))?;
        Ok(dev.to_partition(parent_dev_path))
    }

    async fn dev_path_by_pt_uuid(
        &self,
        pt_uuid: &str,
    ) -> Result<Option<Utf8PathBuf>, Error> {
        let mut cmd = Command::new(BLKID);
        cmd.env_clear();
        cmd.env("LC_ALL", "C.UTF-8");
        cmd.arg("--output")
            .arg("device")
            .arg("--match-token")
            .arg(format!("PTUUID={pt_uuid}"));

        match execute_async(&mut cmd).await {
            Ok(output) => {
                let stdout = String::from_utf8(output.stdout)?;
                let path = stdout.lines().next().unwrap_or("").trim();
                if path.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Utf8PathBuf::from(path)))
                }
            }
            // blkid exits with status 2 when nothing matches.
            Err(ExecutionError::CommandFailure(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn parent_dev_path(
        &self,
        dev_path: &Utf8Path,
    ) -> Result<Utf8PathBuf, Error> {
        let output = self
            .query(dev_path, true)
            .await?
            .ok_or_else(|| Error::NoDevice(dev_path.to_owned()))?;
        let dev = output
            .blockdevices
            .first()
            .ok_or_else(|| Error::NoDevice(dev_path.to_owned()))?;
        match dev.pkname.as_deref() {
            Some(parent) if !parent.is_empty() => {
                // PKNAME is a kernel name even when --paths is given on
                // older util-linux, so normalize either form.
                if parent.starts_with('/') {
                    Ok(Utf8PathBuf::from(parent))
                } else {
                    Ok(Utf8PathBuf::from(format!("/dev/{parent}")))
                }
            }
            _ => Err(Error::NoParent(dev_path.to_owned())),
        }
    }
}
