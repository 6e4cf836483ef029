// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resolution of stable device links under /dev/disk.
//!
//! udev maintains symlink trees keyed by hardware and filesystem
//! identifiers; following one yields the kernel device path currently
//! backing that identifier.

use camino::{Utf8Path, Utf8PathBuf};

const DEV_DISK: &str = "/dev/disk";

pub const BY_ID: &str = "by-id";
pub const BY_UUID: &str = "by-uuid";
pub const BY_PARTUUID: &str = "by-partuuid";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to resolve device link {path}: {err}")]
    Io { path: Utf8PathBuf, err: std::io::Error },

    #[error("device link {0} resolves to a non-UTF-8 path")]
    NotUtf8(Utf8PathBuf),
}

/// Resolves names within the /dev/disk symlink tree.
///
/// The tree root is injectable so tests can run against a scratch
/// directory.
#[derive(Clone, Debug)]
pub struct DevLinks {
    root: Utf8PathBuf,
}

impl Default for DevLinks {
    fn default() -> Self {
        DevLinks { root: Utf8PathBuf::from(DEV_DISK) }
    }
}

impl DevLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<Utf8PathBuf>) -> Self {
        DevLinks { root: root.into() }
    }

    /// Follows `<root>/<subdir>/<name>` to the canonical device path.
    ///
    /// A missing link yields `Ok(None)`: the identifier may simply not have
    /// settled yet. Any other I/O failure is surfaced.
    pub async fn resolve(
        &self,
        subdir: &str,
        name: &str,
    ) -> Result<Option<Utf8PathBuf>, Error> {
        let link = self.root.join(subdir).join(name);
        match tokio::fs::canonicalize(&link).await {
            Ok(path) => {
                let path = Utf8PathBuf::from_path_buf(path)
                    .map_err(|_| Error::NotUtf8(link))?;
                Ok(Some(path))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(err) => Err(Error::Io { path: link, err }),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    async fn tree_with_link(
        subdir: &str,
        name: &str,
    ) -> (Utf8TempDir, Utf8PathBuf) {
        let dir = Utf8TempDir::new().unwrap();
        let target = dir.path().join("sda");
        tokio::fs::write(&target, b"").await.unwrap();
        let linkdir = dir.path().join(subdir);
        tokio::fs::create_dir_all(&linkdir).await.unwrap();
        tokio::fs::symlink(&target, linkdir.join(name)).await.unwrap();
        let canonical =
            Utf8PathBuf::from_path_buf(target.canonicalize().unwrap())
                .unwrap();
        (dir, canonical)
    }

    #[tokio::test]
    async fn follows_symlink_to_device() {
        let (dir, target) =
            tree_with_link(BY_ID, "wwn-0x5000c500a1b2c3d4").await;
        let links = DevLinks::with_root(dir.path().to_owned());
        let resolved = links
            .resolve(BY_ID, "wwn-0x5000c500a1b2c3d4")
            .await
            .unwrap();
        assert_eq!(resolved, Some(target));
    }

    #[tokio::test]
    async fn missing_link_is_none() {
        let dir = Utf8TempDir::new().unwrap();
        let links = DevLinks::with_root(dir.path().to_owned());
        let resolved = links.resolve(BY_UUID, "no-such-uuid").await.unwrap();
        assert_eq!(resolved, None);
    }
}
