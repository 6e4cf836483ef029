// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::*;
use crate::config::Config;
use assert_matches::assert_matches;
use blockdev_utils::blockinfo::{DiskInfo, FileSystemInfo, PartitionInfo};
use blockdev_utils::{CommandFailureInfo, ExecutionError};
use camino_tempfile::Utf8TempDir;
use chrono::Utc;
use disk_agent_types::block_device::{
    BlockDeviceSpec, BlockDeviceStatus, DeviceType, Metadata,
    StorageController,
};
use disk_agent_types::node::{DISK_REMOVE_TAG, DiskEntry, DiskStatus};
use disk_agent_types::StorageNode;
use slog::Discard;
use std::os::unix::process::ExitStatusExt;
use std::sync::Mutex;

fn test_logger() -> Logger {
    Logger::root(Discard, o!())
}

const NAMESPACE: &str = "storage-system";
const NODE: &str = "n1";

// --- fakes ---------------------------------------------------------------

#[derive(Default)]
struct FakeDeviceStore {
    inner: Mutex<FakeDeviceStoreInner>,
}

#[derive(Default)]
struct FakeDeviceStoreInner {
    devices: BTreeMap<String, BlockDevice>,
    updates: Vec<BlockDevice>,
    deletes: Vec<String>,
    requeues: Vec<(String, Duration)>,
}

impl FakeDeviceStore {
    fn insert(&self, device: BlockDevice) {
        let mut inner = self.inner.lock().unwrap();
        inner.devices.insert(device.name().to_string(), device);
    }

    fn stored(&self, name: &str) -> Option<BlockDevice> {
        self.inner.lock().unwrap().devices.get(name).cloned()
    }

    fn update_count(&self) -> usize {
        self.inner.lock().unwrap().updates.len()
    }

    fn requeues(&self) -> Vec<(String, Duration)> {
        self.inner.lock().unwrap().requeues.clone()
    }
}

impl BlockDeviceStore for Arc<FakeDeviceStore> {
    async fn get(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<BlockDevice>, StoreError> {
        Ok(self.inner.lock().unwrap().devices.get(name).cloned())
    }

    async fn update(
        &self,
        device: &BlockDevice,
    ) -> Result<BlockDevice, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.updates.push(device.clone());
        inner.devices.insert(device.name().to_string(), device.clone());
        Ok(device.clone())
    }

    async fn delete(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.devices.remove(name);
        inner.deletes.push(name.to_string());
        Ok(())
    }

    async fn list_by_labels(
        &self,
        _namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<BlockDevice>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .devices
            .values()
            .filter(|device| {
                labels.iter().all(|(key, value)| {
                    device.metadata.labels.get(key) == Some(value)
                })
            })
            .cloned()
            .collect())
    }

    fn requeue_after(&self, _namespace: &str, name: &str, delay: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.requeues.push((name.to_string(), delay));
    }
}

#[derive(Default)]
struct FakeNodeStore {
    inner: Mutex<FakeNodeStoreInner>,
}

#[derive(Default)]
struct FakeNodeStoreInner {
    node: Option<StorageNode>,
    updates: usize,
}

impl FakeNodeStore {
    fn set_node(&self, node: StorageNode) {
        self.inner.lock().unwrap().node = Some(node);
    }

    fn node(&self) -> Option<StorageNode> {
        self.inner.lock().unwrap().node.clone()
    }

    fn update_count(&self) -> usize {
        self.inner.lock().unwrap().updates
    }
}

impl StorageNodeStore for Arc<FakeNodeStore> {
    async fn get_cached(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<StorageNode, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .node
            .clone()
            .ok_or_else(|| StoreError::not_found("storage node", name))
    }

    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<StorageNode, StoreError> {
        self.get_cached(namespace, name).await
    }

    async fn update(
        &self,
        node: &StorageNode,
    ) -> Result<StorageNode, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.node = Some(node.clone());
        inner.updates += 1;
        Ok(node.clone())
    }
}

#[derive(Default)]
struct FakeBlockInfo {
    inner: Mutex<FakeBlockInfoInner>,
}

#[derive(Default)]
struct FakeBlockInfoInner {
    filesystems: BTreeMap<Utf8PathBuf, FileSystemInfo>,
    disks: BTreeMap<Utf8PathBuf, DiskInfo>,
    partitions: BTreeMap<Utf8PathBuf, PartitionInfo>,
    parents: BTreeMap<Utf8PathBuf, Utf8PathBuf>,
    by_pt_uuid: BTreeMap<String, Utf8PathBuf>,
    queries: usize,
}

impl FakeBlockInfo {
    fn set_disk(&self, disk: DiskInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .filesystems
            .insert(disk.dev_path.clone(), disk.filesystem.clone());
        inner.disks.insert(disk.dev_path.clone(), disk);
    }

    fn query_count(&self) -> usize {
        self.inner.lock().unwrap().queries
    }

    fn mounted(&self, dev_path: &Utf8Path, mount_point: &Utf8Path) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(fs) = inner.filesystems.get_mut(dev_path) {
            fs.mount_point = mount_point.to_string();
        }
        if let Some(disk) = inner.disks.get_mut(dev_path) {
            disk.filesystem.mount_point = mount_point.to_string();
        }
    }

    fn unmounted(&self, mount_point: &Utf8Path) {
        let mut inner = self.inner.lock().unwrap();
        for fs in inner.filesystems.values_mut() {
            if fs.mount_point == mount_point.as_str() {
                fs.mount_point = String::new();
            }
        }
        for disk in inner.disks.values_mut() {
            if disk.filesystem.mount_point == mount_point.as_str() {
                disk.filesystem.mount_point = String::new();
            }
        }
    }

    fn formatted(&self, dev_path: &Utf8Path) {
        let mut inner = self.inner.lock().unwrap();
        let fresh = FileSystemInfo {
            mount_point: String::new(),
            fs_type: "ext4".to_string(),
            is_read_only: false,
        };
        inner.filesystems.insert(dev_path.to_owned(), fresh.clone());
        if let Some(disk) = inner.disks.get_mut(dev_path) {
            disk.filesystem = fresh;
            disk.partitioned = false;
        }
    }
}

impl BlockInfo for Arc<FakeBlockInfo> {
    async fn filesystem_info(
        &self,
        dev_path: &Utf8Path,
    ) -> Result<Option<FileSystemInfo>, blockinfo::Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.queries += 1;
        Ok(inner.filesystems.get(dev_path).cloned())
    }

    async fn disk_by_dev_path(
        &self,
        dev_path: &Utf8Path,
    ) -> Result<DiskInfo, blockinfo::Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.queries += 1;
        inner
            .disks
            .get(dev_path)
            .cloned()
            .ok_or_else(|| blockinfo::Error::NoDevice(dev_path.to_owned()))
    }

    async fn partition_by_dev_path(
        &self,
        _parent_dev_path: &Utf8Path,
        dev_path: &Utf8Path,
    ) -> Result<PartitionInfo, blockinfo::Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.queries += 1;
        inner
            .partitions
            .get(dev_path)
            .cloned()
            .ok_or_else(|| blockinfo::Error::NoDevice(dev_path.to_owned()))
    }

    async fn dev_path_by_pt_uuid(
        &self,
        pt_uuid: &str,
    ) -> Result<Option<Utf8PathBuf>, blockinfo::Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.queries += 1;
        Ok(inner.by_pt_uuid.get(pt_uuid).cloned())
    }

    async fn parent_dev_path(
        &self,
        dev_path: &Utf8Path,
    ) -> Result<Utf8PathBuf, blockinfo::Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.queries += 1;
        inner
            .parents
            .get(dev_path)
            .cloned()
            .ok_or_else(|| blockinfo::Error::NoParent(dev_path.to_owned()))
    }
}

/// Filesystem operations that also mutate the fake block layer, so
/// observations after a mount/umount/format behave like the real OS.
struct FakeFsOps {
    block_info: Arc<FakeBlockInfo>,
    inner: Mutex<FakeFsOpsInner>,
}

#[derive(Default)]
struct FakeFsOpsInner {
    mounts: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    umounts: Vec<Utf8PathBuf>,
    formats: Vec<(Utf8PathBuf, Option<String>)>,
    fail_mount_with_corruption: bool,
}

impl FakeFsOps {
    fn new(block_info: Arc<FakeBlockInfo>) -> Self {
        FakeFsOps { block_info, inner: Mutex::new(Default::default()) }
    }

    fn formats(&self) -> Vec<(Utf8PathBuf, Option<String>)> {
        self.inner.lock().unwrap().formats.clone()
    }

    fn umounts(&self) -> Vec<Utf8PathBuf> {
        self.inner.lock().unwrap().umounts.clone()
    }

    fn fail_next_mount_with_corruption(&self) {
        self.inner.lock().unwrap().fail_mount_with_corruption = true;
    }
}

fn corrupted_mount_error() -> blockdev_utils::mount::Error {
    blockdev_utils::mount::Error::Execution(ExecutionError::CommandFailure(
        Box::new(CommandFailureInfo {
            command: "/usr/bin/mount /dev/sdb /mnt".to_string(),
            status: std::process::ExitStatus::from_raw(32 << 8),
            stdout: String::new(),
            stderr: "mount: wrong fs type, bad option, bad superblock"
                .to_string(),
        }),
    ))
}

impl FsOps for Arc<FakeFsOps> {
    async fn mount(
        &self,
        dev_path: &Utf8Path,
        mount_point: &Utf8Path,
    ) -> Result<(), fs_mount::Error> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_mount_with_corruption {
                inner.fail_mount_with_corruption = false;
                return Err(corrupted_mount_error());
            }
            inner
                .mounts
                .push((dev_path.to_owned(), mount_point.to_owned()));
        }
        self.block_info.mounted(dev_path, mount_point);
        Ok(())
    }

    async fn umount(
        &self,
        mount_point: &Utf8Path,
    ) -> Result<(), fs_mount::Error> {
        self.inner.lock().unwrap().umounts.push(mount_point.to_owned());
        self.block_info.unmounted(mount_point);
        Ok(())
    }

    async fn format_ext4(
        &self,
        dev_path: &Utf8Path,
        uuid: Option<&str>,
    ) -> Result<(), ext4::Error> {
        self.inner
            .lock()
            .unwrap()
            .formats
            .push((dev_path.to_owned(), uuid.map(str::to_string)));
        self.block_info.formatted(dev_path);
        Ok(())
    }
}

#[derive(Default)]
struct FakeScanner {
    auto_provision: Mutex<bool>,
}

impl AutoProvisioner for Arc<FakeScanner> {
    fn matches_filters(&self, _disk: &DiskInfo) -> bool {
        *self.auto_provision.lock().unwrap()
    }

    fn needs_auto_provision(
        &self,
        device: &BlockDevice,
        matched: bool,
    ) -> bool {
        matched
            && device
                .status
                .device_status
                .file_system
                .last_formatted_at
                .is_none()
    }
}

// --- harness -------------------------------------------------------------

type TestController = Controller<
    Arc<FakeDeviceStore>,
    Arc<FakeNodeStore>,
    Arc<FakeBlockInfo>,
    Arc<FakeFsOps>,
    Arc<FakeScanner>,
>;

struct Harness {
    devices: Arc<FakeDeviceStore>,
    nodes: Arc<FakeNodeStore>,
    block_info: Arc<FakeBlockInfo>,
    fs_ops: Arc<FakeFsOps>,
    scanner: Arc<FakeScanner>,
    tag_cache: Arc<DiskTagCache>,
    controller: TestController,
    link_dir: Utf8TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_max_concurrent_ops(5)
    }

    fn with_max_concurrent_ops(max_concurrent_ops: usize) -> Self {
        let config = Config {
            namespace: NAMESPACE.to_string(),
            node_name: NODE.to_string(),
            max_concurrent_ops,
            auto_provision_filters: Vec::new(),
        };
        let devices = Arc::new(FakeDeviceStore::default());
        let nodes = Arc::new(FakeNodeStore::default());
        let block_info = Arc::new(FakeBlockInfo::default());
        let fs_ops = Arc::new(FakeFsOps::new(Arc::clone(&block_info)));
        let scanner = Arc::new(FakeScanner::default());
        let tag_cache = Arc::new(DiskTagCache::new());
        tag_cache.mark_initialized();

        let link_dir = Utf8TempDir::new().unwrap();
        let devlinks = DevLinks::with_root(link_dir.path().to_owned());

        let controller = Controller::new(
            &config,
            Arc::clone(&devices),
            Arc::clone(&nodes),
            Arc::clone(&block_info),
            Arc::clone(&fs_ops),
            Arc::clone(&scanner),
            Arc::clone(&tag_cache),
            devlinks,
            &test_logger(),
        );

        Harness {
            devices,
            nodes,
            block_info,
            fs_ops,
            scanner,
            tag_cache,
            controller,
            link_dir,
        }
    }

    /// Creates a by-id symlink for `wwn` and returns the canonical device
    /// path it resolves to.
    async fn add_wwn_link(&self, wwn: &str) -> Utf8PathBuf {
        self.add_link("by-id", &format!("wwn-{wwn}")).await
    }

    async fn add_link(&self, subdir: &str, name: &str) -> Utf8PathBuf {
        let target = self.link_dir.path().join(format!("backing-{name}"));
        tokio::fs::write(&target, b"").await.unwrap();
        let linkdir = self.link_dir.path().join(subdir);
        tokio::fs::create_dir_all(&linkdir).await.unwrap();
        tokio::fs::symlink(&target, linkdir.join(name)).await.unwrap();
        Utf8PathBuf::from_path_buf(target.canonicalize().unwrap()).unwrap()
    }

    fn seed_node(&self) {
        let mut node = StorageNode::default();
        node.metadata.name = NODE.to_string();
        self.nodes.set_node(node);
    }

    /// Runs one reconcile tick against the currently stored resource.
    async fn tick(
        &self,
        name: &str,
    ) -> Result<Option<BlockDevice>, ControllerError> {
        let device = self.devices.stored(name);
        self.controller.on_change(device.as_ref()).await
    }
}

fn disk_device(name: &str, wwn: &str) -> BlockDevice {
    let mut device = BlockDevice {
        metadata: Metadata { name: name.to_string(), ..Default::default() },
        spec: BlockDeviceSpec {
            node_name: NODE.to_string(),
            ..Default::default()
        },
        status: BlockDeviceStatus::default(),
    };
    device.status.device_status.details.device_type = DeviceType::Disk;
    device.status.device_status.details.wwn = wwn.to_string();
    device
}

fn disk_info(dev_path: &Utf8Path, wwn: &str) -> DiskInfo {
    DiskInfo {
        name: "sdb".to_string(),
        dev_path: dev_path.to_owned(),
        wwn: wwn.to_string(),
        fs_uuid: String::new(),
        pt_uuid: String::new(),
        storage_controller: StorageController::Unknown,
        filesystem: FileSystemInfo::default(),
        partitioned: false,
        removable: false,
        size_bytes: 4u64 << 40,
    }
}

fn expected_mount(name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("/var/lib/harvester/extra-disks/{name}"))
}

// --- guard tests ---------------------------------------------------------

#[tokio::test]
async fn ignores_resources_for_other_nodes() {
    let h = Harness::new();
    let mut device = disk_device("d1", "0x5000c5");
    device.spec.node_name = "someone-else".to_string();

    let result = h.controller.on_change(Some(&device)).await.unwrap();
    assert!(result.is_none());
    assert_eq!(h.devices.update_count(), 0);
    assert_eq!(h.block_info.query_count(), 0);
}

#[tokio::test]
async fn ignores_deleting_and_inactive_resources() {
    let h = Harness::new();

    let mut deleting = disk_device("d1", "0x5000c5");
    deleting.metadata.deletion_timestamp = Some(Utc::now());
    assert!(
        h.controller.on_change(Some(&deleting)).await.unwrap().is_none()
    );

    let mut inactive = disk_device("d2", "0x5000c6");
    inactive.status.state = DeviceState::Inactive;
    assert!(
        h.controller.on_change(Some(&inactive)).await.unwrap().is_none()
    );

    assert!(h.controller.on_change(None).await.unwrap().is_none());
    assert_eq!(h.block_info.query_count(), 0);
}

#[tokio::test]
async fn corrupted_device_is_left_alone_without_user_intent() {
    let h = Harness::new();
    let mut device = disk_device("d1", "0x5000c5");
    device.status.device_status.file_system.corrupted = true;

    let result = h.controller.on_change(Some(&device)).await.unwrap();
    assert!(result.is_none());
    assert_eq!(h.block_info.query_count(), 0);
}

#[tokio::test]
async fn uninitialized_tag_cache_rejects_events() {
    let h = Harness::new();
    let fresh_cache = DiskTagCache::new();
    assert!(!fresh_cache.is_initialized());

    // Rebuild the controller around an uninitialized cache.
    let config = Config {
        namespace: NAMESPACE.to_string(),
        node_name: NODE.to_string(),
        max_concurrent_ops: 5,
        auto_provision_filters: Vec::new(),
    };
    let controller = Controller::new(
        &config,
        Arc::clone(&h.devices),
        Arc::clone(&h.nodes),
        Arc::clone(&h.block_info),
        Arc::clone(&h.fs_ops),
        Arc::clone(&h.scanner),
        Arc::new(fresh_cache),
        DevLinks::with_root(h.link_dir.path().to_owned()),
        &test_logger(),
    );

    let device = disk_device("d1", "0x5000c5");
    assert_matches!(
        controller.on_change(Some(&device)).await,
        Err(ControllerError::CacheNotInitialized)
    );
    assert_matches!(
        controller.on_remove(&device).await,
        Err(ControllerError::CacheNotInitialized)
    );
}

// --- scenario 1: auto-provision of a fresh disk --------------------------

#[tokio::test]
async fn auto_provisions_a_fresh_disk_end_to_end() {
    let h = Harness::new();
    h.seed_node();
    *h.scanner.auto_provision.lock().unwrap() = true;

    let wwn = "0x5000c500a1b2c3d4";
    let dev_path = h.add_wwn_link(wwn).await;
    h.block_info.set_disk(disk_info(&dev_path, wwn));
    h.devices.insert(disk_device("d1", wwn));

    // Tick 1: the status refresh flags the disk for auto-provisioning.
    let written = h.tick("d1").await.unwrap().expect("tick 1 writes back");
    assert!(written.spec.file_system.force_formatted);
    assert!(written.spec.file_system.provisioned);
    assert!(h.fs_ops.formats().is_empty());

    // Tick 2: format runs; a WWN disk lets mkfs pick the UUID.
    let written = h.tick("d1").await.unwrap().expect("tick 2 writes back");
    assert_eq!(h.fs_ops.formats(), vec![(dev_path.clone(), None)]);
    assert!(
        written
            .status
            .device_status
            .file_system
            .last_formatted_at
            .is_some()
    );
    assert!(!written.status.device_status.file_system.corrupted);

    // Tick 3: the device gets mounted at the fixed layout path.
    let written = h.tick("d1").await.unwrap().expect("tick 3 writes back");
    assert_eq!(
        written.status.device_status.file_system.mount_point,
        expected_mount("d1").as_str()
    );
    assert!(written.condition_is_true(ConditionType::DeviceMounted));

    // Tick 4: the disk is registered on the storage node.
    let written = h.tick("d1").await.unwrap().expect("tick 4 writes back");
    assert_eq!(
        written.status.provision_phase,
        ProvisionPhase::Provisioned
    );
    assert!(written.condition_is_true(ConditionType::DiskAddedToNode));
    let node = h.nodes.node().unwrap();
    assert_eq!(
        node.spec.disks.get("d1").unwrap().path,
        expected_mount("d1").as_str()
    );
    assert!(node.spec.disks.get("d1").unwrap().allow_scheduling);
    assert_eq!(h.tag_cache.get("d1"), Vec::<String>::new());

    // Tick 5: steady state; nothing is written anywhere.
    let device_updates = h.devices.update_count();
    let node_updates = h.nodes.update_count();
    assert!(h.tick("d1").await.unwrap().is_none());
    assert_eq!(h.devices.update_count(), device_updates);
    assert_eq!(h.nodes.update_count(), node_updates);
}

// --- scenario 2: user toggles provisioned off ----------------------------

fn provisioned_device(
    name: &str,
    wwn: &str,
    dev_path: &Utf8Path,
) -> BlockDevice {
    let mut device = disk_device(name, wwn);
    device.spec.file_system.provisioned = true;
    device.status.provision_phase = ProvisionPhase::Provisioned;
    device.status.device_status.file_system.fs_type = "ext4".to_string();
    device.status.device_status.file_system.mount_point =
        expected_mount(name).to_string();
    device.status.device_status.file_system.last_formatted_at =
        Some(Utc::now());
    device.status.device_status.dev_path = dev_path.to_string();
    device.set_condition(
        ConditionType::DiskAddedToNode,
        disk_agent_types::condition::ConditionUpdate::ok(true, "added"),
    );
    device.set_condition(
        ConditionType::DeviceMounted,
        disk_agent_types::condition::ConditionUpdate::ok(true, "mounted"),
    );
    device
}

fn mounted_disk_info(
    dev_path: &Utf8Path,
    wwn: &str,
    mount_point: &Utf8Path,
) -> DiskInfo {
    let mut disk = disk_info(dev_path, wwn);
    disk.filesystem = FileSystemInfo {
        mount_point: mount_point.to_string(),
        fs_type: "ext4".to_string(),
        is_read_only: false,
    };
    disk
}

#[tokio::test]
async fn unprovisions_in_two_phases() {
    let h = Harness::new();
    let wwn = "0x5000c500deadbeef";
    let dev_path = h.add_wwn_link(wwn).await;
    h.block_info
        .set_disk(mounted_disk_info(&dev_path, wwn, &expected_mount("d1")));

    let mut device = provisioned_device("d1", wwn, &dev_path);
    // The user just flipped provisioned off.
    device.spec.file_system.provisioned = false;
    h.devices.insert(device);

    let mut node = StorageNode::default();
    node.metadata.name = NODE.to_string();
    node.spec.disks.insert(
        "d1".to_string(),
        DiskEntry {
            path: expected_mount("d1").to_string(),
            allow_scheduling: true,
            eviction_requested: false,
            storage_reserved: 0,
            tags: vec!["ssd".to_string()],
        },
    );
    node.status.disk_status.insert(
        "d1".to_string(),
        DiskStatus {
            scheduled_replica: [("r1".to_string(), 1)].into_iter().collect(),
        },
    );
    h.nodes.set_node(node);

    // Tick 1: unmount.
    let written = h.tick("d1").await.unwrap().expect("tick 1 writes back");
    assert_eq!(h.fs_ops.umounts(), vec![expected_mount("d1")]);
    assert!(
        written.status.device_status.file_system.mount_point.is_empty()
    );

    // Tick 2: eviction starts; the entry is tagged for removal.
    let written = h.tick("d1").await.unwrap().expect("tick 2 writes back");
    assert_eq!(
        written.status.provision_phase,
        ProvisionPhase::Unprovisioning
    );
    let entry =
        h.nodes.node().unwrap().spec.disks.get("d1").cloned().unwrap();
    assert!(!entry.allow_scheduling);
    assert!(entry.eviction_requested);
    assert!(entry.tags.iter().any(|t| t == DISK_REMOVE_TAG));

    // Tick 3: replicas still scheduled; the device is requeued.
    assert!(h.tick("d1").await.unwrap().is_none());
    let requeues = h.devices.requeues();
    assert_eq!(requeues.len(), 1);
    assert_eq!(requeues[0].0, "d1");
    assert!(requeues[0].1 >= Duration::from_secs(3));
    assert!(requeues[0].1 < Duration::from_secs(7));

    // The orchestrator finishes draining.
    let mut node = h.nodes.node().unwrap();
    node.status.disk_status.get_mut("d1").unwrap().scheduled_replica =
        BTreeMap::new();
    h.nodes.set_node(node);

    // Tick 4: the entry is removed and the device is unprovisioned.
    let written = h.tick("d1").await.unwrap().expect("tick 4 writes back");
    assert_eq!(
        written.status.provision_phase,
        ProvisionPhase::Unprovisioned
    );
    assert!(!h.nodes.node().unwrap().spec.disks.contains_key("d1"));
}

// --- scenario 3: tag drift -----------------------------------------------

#[tokio::test]
async fn syncs_drifted_tags_preserving_orchestrator_tags() {
    let h = Harness::new();
    let wwn = "0x5000c500feedface";
    let dev_path = h.add_wwn_link(wwn).await;
    h.block_info
        .set_disk(mounted_disk_info(&dev_path, wwn, &expected_mount("d1")));

    let mut device = provisioned_device("d1", wwn, &dev_path);
    device.spec.tags = vec!["ssd".to_string(), "fast".to_string()];
    h.devices.insert(device);
    h.tag_cache.set("d1", vec!["ssd".to_string()]);

    let mut node = StorageNode::default();
    node.metadata.name = NODE.to_string();
    node.spec.disks.insert(
        "d1".to_string(),
        DiskEntry {
            path: expected_mount("d1").to_string(),
            allow_scheduling: true,
            eviction_requested: false,
            storage_reserved: 0,
            tags: vec!["ssd".to_string(), "zone-a".to_string()],
        },
    );
    h.nodes.set_node(node);

    h.tick("d1").await.unwrap();

    let entry =
        h.nodes.node().unwrap().spec.disks.get("d1").cloned().unwrap();
    assert_eq!(entry.tags, vec!["zone-a", "ssd", "fast"]);
    assert_eq!(h.tag_cache.get("d1"), vec!["ssd", "fast"]);
}

#[tokio::test]
async fn tag_synced_device_is_idempotent() {
    let h = Harness::new();
    let wwn = "0x5000c500aaaa0001";
    let dev_path = h.add_wwn_link(wwn).await;
    h.block_info
        .set_disk(mounted_disk_info(&dev_path, wwn, &expected_mount("d1")));

    let mut device = provisioned_device("d1", wwn, &dev_path);
    device.spec.tags = vec!["ssd".to_string()];
    // Keep the stored status consistent with the fake OS so the refresh
    // has nothing to change.
    device.status.device_status.details.storage_controller =
        StorageController::Unknown;
    h.devices.insert(device);
    h.tag_cache.set("d1", vec!["ssd".to_string()]);

    let mut node = StorageNode::default();
    node.metadata.name = NODE.to_string();
    node.spec.disks.insert(
        "d1".to_string(),
        DiskEntry {
            path: expected_mount("d1").to_string(),
            allow_scheduling: true,
            eviction_requested: false,
            storage_reserved: 0,
            tags: vec!["ssd".to_string()],
        },
    );
    h.nodes.set_node(node);

    assert!(h.tick("d1").await.unwrap().is_none());
    assert!(h.tick("d1").await.unwrap().is_none());
    assert_eq!(h.nodes.update_count(), 0);
    assert_eq!(h.devices.update_count(), 0);
}

// --- scenario 4: corruption on mount -------------------------------------

#[tokio::test]
async fn corrupted_mount_requires_user_intervention() {
    let h = Harness::new();
    let wwn = "0x5000c500bad0bad0";
    let dev_path = h.add_wwn_link(wwn).await;
    let mut disk = disk_info(&dev_path, wwn);
    disk.filesystem.fs_type = "ext4".to_string();
    h.block_info.set_disk(disk);

    let mut device = disk_device("d1", wwn);
    device.spec.file_system.provisioned = true;
    device.status.device_status.file_system.last_formatted_at =
        Some(Utc::now());
    h.devices.insert(device);

    h.fs_ops.fail_next_mount_with_corruption();
    let err = h.tick("d1").await.unwrap_err();
    assert_matches!(err, ControllerError::Mount(_));

    // The failure state was committed before the error surfaced.
    let stored = h.devices.stored("d1").unwrap();
    assert!(stored.status.device_status.file_system.corrupted);
    assert!(!stored.spec.file_system.repaired);
    let condition = stored
        .status
        .conditions
        .iter()
        .find(|c| c.condition_type == ConditionType::DeviceMounted)
        .unwrap();
    assert!(!condition.status);
    assert!(!condition.error.is_empty());

    // Without user intent, the next tick does nothing at all.
    let queries = h.block_info.query_count();
    assert!(h.tick("d1").await.unwrap().is_none());
    assert_eq!(h.block_info.query_count(), queries);
}

// --- scenario 5: delete cascade ------------------------------------------

#[tokio::test]
async fn delete_cascades_to_partition_children() {
    let h = Harness::new();

    let parent = disk_device("d1", "0x5000c500cafe0000");

    let mut make_child = |name: &str, mounted: &str| {
        let mut child = disk_device(name, "");
        child.status.device_status.details.device_type =
            DeviceType::Partition;
        child
            .metadata
            .labels
            .insert(HOSTNAME_LABEL.to_string(), NODE.to_string());
        child
            .metadata
            .labels
            .insert(PARENT_DEVICE_LABEL.to_string(), "d1".to_string());
        child.status.device_status.file_system.mount_point =
            mounted.to_string();
        h.devices.insert(child);
    };
    make_child("d1-part1", "/var/lib/harvester/extra-disks/d1-part1");
    make_child("d1-part2", "");

    let mut node = StorageNode::default();
    node.metadata.name = NODE.to_string();
    for name in ["d1-part1", "d1-part2"] {
        node.spec.disks.insert(
            name.to_string(),
            DiskEntry {
                path: format!("/var/lib/harvester/extra-disks/{name}"),
                allow_scheduling: true,
                eviction_requested: false,
                storage_reserved: 0,
                tags: Vec::new(),
            },
        );
    }
    h.nodes.set_node(node);
    h.tag_cache.set("d1", vec!["ssd".to_string()]);

    h.controller.on_remove(&parent).await.unwrap();

    let deletes = h.devices.inner.lock().unwrap().deletes.clone();
    assert_eq!(deletes.len(), 2);
    assert!(deletes.contains(&"d1-part1".to_string()));
    assert!(deletes.contains(&"d1-part2".to_string()));

    let node = h.nodes.node().unwrap();
    assert!(node.spec.disks.is_empty());

    // The mounted child was unmounted on the way out.
    assert_eq!(
        h.fs_ops.umounts(),
        vec![Utf8PathBuf::from("/var/lib/harvester/extra-disks/d1-part1")]
    );

    assert!(!h.tag_cache.has("d1"));
}

#[tokio::test]
async fn delete_with_no_children_is_a_noop() {
    let h = Harness::new();
    h.seed_node();
    let parent = disk_device("d1", "0x5000c500cafe0001");

    h.controller.on_remove(&parent).await.unwrap();
    assert_eq!(h.nodes.update_count(), 0);
    assert!(h.devices.inner.lock().unwrap().deletes.is_empty());
}

// --- scenario 6: format gate saturation ----------------------------------

#[tokio::test]
async fn saturated_format_gate_requeues_without_error() {
    let h = Harness::with_max_concurrent_ops(1);
    h.seed_node();

    let wwn = "0x5000c500aaaa0002";
    let dev_path = h.add_wwn_link(wwn).await;
    let mut disk = disk_info(&dev_path, wwn);
    disk.filesystem.fs_type = "ext4".to_string();
    h.block_info.set_disk(disk);

    let mut device = disk_device("d1", wwn);
    device.spec.file_system.force_formatted = true;
    device.spec.file_system.provisioned = true;
    h.devices.insert(device);

    // Another device holds the only format slot.
    let permit = h.controller.format_gate.try_acquire().unwrap();

    assert!(h.tick("d1").await.unwrap().is_none());
    assert!(h.fs_ops.formats().is_empty());
    let requeues = h.devices.requeues();
    assert_eq!(requeues.len(), 1);
    assert!(requeues[0].1 >= Duration::from_secs(3));
    assert!(requeues[0].1 < Duration::from_secs(7));

    // Slot freed; the retried tick formats.
    drop(permit);
    h.tick("d1").await.unwrap().expect("format tick writes back");
    assert_eq!(h.fs_ops.formats().len(), 1);
}

// --- format details ------------------------------------------------------

#[tokio::test]
async fn format_reuses_pt_uuid_for_disks_without_wwn() {
    let h = Harness::new();
    h.seed_node();

    let pt_uuid = "8e1f2c3d-0000-4d4e-9d9e-abcdefabcdef";
    let dev_path = Utf8PathBuf::from("/dev/sdb");
    {
        let mut inner = h.block_info.inner.lock().unwrap();
        inner.by_pt_uuid.insert(pt_uuid.to_string(), dev_path.clone());
    }
    let mut disk = disk_info(&dev_path, "");
    disk.pt_uuid = pt_uuid.to_string();
    h.block_info.set_disk(disk);

    let mut device = disk_device("d1", "");
    device.status.device_status.details.pt_uuid = pt_uuid.to_string();
    device.spec.file_system.force_formatted = true;
    h.devices.insert(device);

    let written = h.tick("d1").await.unwrap().expect("writes back");

    // The PT-UUID was passed to mkfs and recorded as the filesystem UUID
    // so the next resolution can find the device.
    assert_eq!(
        h.fs_ops.formats(),
        vec![(dev_path, Some(pt_uuid.to_string()))]
    );
    assert_eq!(written.status.device_status.details.uuid, pt_uuid);
}

#[tokio::test]
async fn format_unmounts_a_mounted_device_first() {
    let h = Harness::new();
    h.seed_node();

    let wwn = "0x5000c500aaaa0003";
    let dev_path = h.add_wwn_link(wwn).await;
    h.block_info.set_disk(mounted_disk_info(
        &dev_path,
        wwn,
        Utf8Path::new("/mnt/old-home"),
    ));

    let mut device = disk_device("d1", wwn);
    device.spec.file_system.force_formatted = true;
    h.devices.insert(device);

    h.tick("d1").await.unwrap().expect("writes back");
    assert_eq!(h.fs_ops.umounts(), vec![Utf8PathBuf::from("/mnt/old-home")]);
    assert_eq!(h.fs_ops.formats().len(), 1);
}

// --- mount details -------------------------------------------------------

#[tokio::test]
async fn partitioned_devices_are_never_mounted() {
    let h = Harness::new();
    let wwn = "0x5000c500aaaa0004";
    let dev_path = h.add_wwn_link(wwn).await;
    let mut disk = disk_info(&dev_path, wwn);
    disk.partitioned = true;
    disk.filesystem.fs_type = "ext4".to_string();
    h.block_info.set_disk(disk);

    let mut device = disk_device("d1", wwn);
    device.spec.file_system.provisioned = true;
    device.status.device_status.partitioned = true;
    device.status.device_status.file_system.last_formatted_at =
        Some(Utc::now());
    h.devices.insert(device);

    let err = h.tick("d1").await.unwrap_err();
    assert_matches!(err, ControllerError::PartitionedDevice);
    assert!(h.fs_ops.inner.lock().unwrap().mounts.is_empty());
}

#[tokio::test]
async fn foreign_filesystems_are_rejected_after_mount() {
    let h = Harness::new();
    let wwn = "0x5000c500aaaa0005";
    let dev_path = h.add_wwn_link(wwn).await;
    let mut disk = disk_info(&dev_path, wwn);
    disk.filesystem.fs_type = "xfs".to_string();
    h.block_info.set_disk(disk);

    let mut device = disk_device("d1", wwn);
    device.spec.file_system.provisioned = true;
    device.status.device_status.file_system.last_formatted_at =
        Some(Utc::now());
    h.devices.insert(device);

    let err = h.tick("d1").await.unwrap_err();
    assert_matches!(
        err,
        ControllerError::UnsupportedFilesystem { fs_type } => {
            assert_eq!(fs_type, "xfs");
        }
    );
}

// --- status refresh details ----------------------------------------------

#[tokio::test]
async fn status_refresh_preserves_format_history() {
    let h = Harness::new();
    let wwn = "0x5000c500aaaa0006";
    let dev_path = h.add_wwn_link(wwn).await;
    h.block_info
        .set_disk(mounted_disk_info(&dev_path, wwn, &expected_mount("d1")));

    let formatted_at = Utc::now();
    let mut device = provisioned_device("d1", wwn, &dev_path);
    device.status.device_status.file_system.last_formatted_at =
        Some(formatted_at);
    // Stale detail forces the refresh to rebuild the status.
    device.status.device_status.details.storage_controller =
        StorageController::Scsi;
    h.devices.insert(device);
    h.tag_cache.set("d1", Vec::new());

    let mut node = StorageNode::default();
    node.metadata.name = NODE.to_string();
    node.spec.disks.insert(
        "d1".to_string(),
        DiskEntry {
            path: expected_mount("d1").to_string(),
            allow_scheduling: true,
            eviction_requested: false,
            storage_reserved: 0,
            tags: Vec::new(),
        },
    );
    h.nodes.set_node(node);

    let written = h.tick("d1").await.unwrap().expect("refresh writes back");
    assert_eq!(
        written.status.device_status.details.storage_controller,
        StorageController::Unknown
    );
    // The fresh OS view carries no timestamp; the old one survives.
    assert_eq!(
        written.status.device_status.file_system.last_formatted_at,
        Some(formatted_at)
    );
    assert_eq!(
        written.status.device_status.dev_path,
        dev_path.as_str()
    );
}
