// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helper for calling mkfs.ext4.

use crate::{ExecutionError, execute_async};
use camino::Utf8Path;
use tokio::process::Command;

const MKFS_EXT4: &str = "/sbin/mkfs.ext4";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("mkfs.ext4 execution error: {0}")]
    Execution(#[from] ExecutionError),
}

/// Wraps the 'mkfs.ext4' command.
pub struct Ext4 {}

impl Ext4 {
    /// Creates an ext4 filesystem on `dev_path`, destroying whatever the
    /// device currently holds.
    ///
    /// When `uuid` is supplied the new filesystem reuses it; otherwise mkfs
    /// picks one. `-F` forces formatting even if the device carries an old
    /// filesystem signature or a partition table.
    pub async fn format(
        dev_path: &Utf8Path,
        uuid: Option<&str>,
    ) -> Result<(), Error> {
        let mut cmd = Command::new(MKFS_EXT4);
        cmd.env_clear();
        cmd.env("LC_ALL", "C.UTF-8");
        cmd.arg("-F");
        if let Some(uuid) = uuid {
            cmd.arg("-U").arg(uuid);
        }
        cmd.arg(dev_path);

        execute_async(&mut cmd).await?;
        Ok(())
    }
}
