// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers for calling mount and umount.

use crate::{ExecutionError, execute_async};
use camino::Utf8Path;
use tokio::process::Command;

const MOUNT: &str = "/usr/bin/mount";
const UMOUNT: &str = "/usr/bin/umount";

// Substrings the mount subprocess emits when the ext4 filesystem on the
// source device is damaged, as opposed to the mount point being busy or the
// arguments being wrong.
const CORRUPTION_MARKERS: &[&str] = &[
    "wrong fs type, bad option, bad superblock",
    "structure needs cleaning",
    "can't read superblock",
];

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to create mount point {path}: {err}")]
    MountPoint { path: String, err: std::io::Error },

    #[error("mount execution error: {0}")]
    Execution(#[from] ExecutionError),
}

impl Error {
    /// Returns true when the underlying mount failure implicates the
    /// filesystem itself. Callers mark the device corrupted and wait for the
    /// user to either repair or force-format it.
    pub fn is_filesystem_corrupted(&self) -> bool {
        let Error::Execution(ExecutionError::CommandFailure(info)) = self
        else {
            return false;
        };
        CORRUPTION_MARKERS
            .iter()
            .any(|marker| info.stderr.contains(marker))
    }
}

/// Wraps the 'mount' and 'umount' commands.
pub struct Mount {}

impl Mount {
    /// Mounts `dev_path` on `mount_point`, creating the mount point
    /// directory if needed.
    pub async fn mount(
        dev_path: &Utf8Path,
        mount_point: &Utf8Path,
    ) -> Result<(), Error> {
        tokio::fs::create_dir_all(mount_point).await.map_err(|err| {
            Error::MountPoint { path: mount_point.to_string(), err }
        })?;

        let mut cmd = Command::new(MOUNT);
        cmd.env_clear();
        cmd.env("LC_ALL", "C.UTF-8");
        cmd.arg(dev_path).arg(mount_point);

        execute_async(&mut cmd).await?;
        Ok(())
    }

    pub async fn umount(mount_point: &Utf8Path) -> Result<(), Error> {
        let mut cmd = Command::new(UMOUNT);
        cmd.env_clear();
        cmd.env("LC_ALL", "C.UTF-8");
        cmd.arg(mount_point);

        execute_async(&mut cmd).await?;
        Ok(())
    }
}
