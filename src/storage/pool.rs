//! Pool lifecycle: creation over a loop file, block device or existing
//! dataset, health checks with import recovery, and deletion.

use std::fs;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;

use tracing::info;

use super::paths;
use super::revert::Revert;
use super::zfs;
use super::{Driver, Error};

/// Dataset roots every pool carries, all with their mountpoints disabled.
const SCHEMA_ROOTS: [&str; 4] = ["containers", "images", "custom", "deleted"];

/// Pool config keys that cannot change after creation.
const POOL_IMMUTABLE_KEYS: [&str; 9] = [
    "size",
    "source",
    "volume.size",
    "volume.block.mount_options",
    "volume.block.filesystem",
    "volume.lvm.thinpool_name",
    "volume.zfs.use_refquota",
    "volume.zfs.remove_snapshots",
    "zfs.pool_name",
];

/// Volume config keys that cannot change after creation.
const VOLUME_IMMUTABLE_KEYS: [&str; 5] = [
    "block.mount_options",
    "block.filesystem",
    "size",
    "zfs.use_refquota",
    "zfs.remove_snapshots",
];

fn is_block_device(path: &str) -> bool {
    fs::metadata(path)
        .map(|meta| meta.file_type().is_block_device())
        .unwrap_or(false)
}

impl Driver {
    /// Verify the pool is present and healthy, importing it from its source
    /// if the system lost it (e.g. after a reboot without a cache file).
    pub fn pool_check(&self) -> Result<(), Error> {
        if let Err(err) = self.zfs.pool_check(self.zfs.prefix()) {
            let source = self.pool.source.clone();
            if Path::new(&source).is_absolute() && Path::new(&source).exists() {
                let _ = zfs::load_module("zfs");
                self.zfs.pool_import(&source, &self.pool.name)?;
            } else {
                return Err(err);
            }
        }

        // An operator-set mountpoint is left alone; anything else is forced
        // off so the pool root never surfaces in the filesystem.
        let source = self.zfs.property_source("", "mountpoint")?;
        if source.trim() != "local" {
            self.zfs.set("", "mountpoint", "none")?;
        }

        Ok(())
    }

    /// Create the backing pool and the dataset schema underneath it.
    pub fn pool_create(&mut self) -> Result<(), Error> {
        self.zpool_create()?;

        let this: &Driver = self;
        let mut revert = Revert::new();
        revert.push(move || {
            let _ = this.pool_delete();
        });

        // Create the schema roots up front to avoid create races later.
        for root in SCHEMA_ROOTS {
            this.zfs.create(root)?;
            this.zfs.set(root, "mountpoint", "none")?;
        }

        let mount_point = paths::storage_pool_mount_point(&this.var_dir, &this.pool.name);
        fs::create_dir_all(&mount_point)?;

        revert.commit();
        Ok(())
    }

    fn zpool_create(&mut self) -> Result<(), Error> {
        let mut vdev = self.pool.source.clone();
        if vdev.is_empty() {
            vdev = paths::disks_path(&self.var_dir, &self.pool.name)
                .display()
                .to_string();
        }

        if !Path::new(&vdev).is_absolute() {
            // An existing zpool or dataset: require it to be empty and use
            // it as-is.
            self.zfs.pool_check(&vdev)?;
            if !self.zfs.list_subvolumes("")?.is_empty() {
                return Err(Error::conflict("Provided ZFS pool (or dataset) isn't empty"));
            }
            return Ok(());
        }

        if is_block_device(&vdev) {
            // Device paths and UUIDs can change across reboots (and a
            // multi-device pool has no single identity anyway), so record
            // the pool name instead.
            self.pool.source = self.pool.name.clone();
        } else {
            vdev.push_str(".img");
            self.pool.source = vdev.clone();

            let size: u64 = self
                .pool
                .size
                .parse()
                .map_err(|_| Error::invalid_prop("size", &self.pool.size))?;
            if let Some(parent) = Path::new(&vdev).parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::File::create(&vdev)?;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
            file.set_len(size)?;
            info!(path = %vdev, size, "created sparse backing file");
        }

        let zpool_name = if self.pool.zfs_pool_name.is_empty() {
            self.pool.name.clone()
        } else {
            self.pool.zfs_pool_name.clone()
        };
        self.zfs.pool_create(&zpool_name, &vdev)
    }

    /// Destroy the pool. A user-supplied dataset inside a foreign pool is
    /// not ours to destroy; only its mountpoint directory is removed.
    pub fn pool_delete(&self) -> Result<(), Error> {
        let owns_pool = match self.pool.dataset() {
            Some(dataset) => !dataset.contains('/'),
            None => true,
        };
        if owns_pool {
            self.zfs.pool_destroy(&self.pool.name)?;

            let source = &self.pool.source;
            if Path::new(source).is_absolute() && !is_block_device(source) {
                // Loop backing file.
                let _ = fs::remove_file(source);
            }
        }

        let mount_point = paths::storage_pool_mount_point(&self.var_dir, &self.pool.name);
        if mount_point.exists() {
            fs::remove_dir_all(&mount_point)?;
        }

        Ok(())
    }

    /// Reject changes to pool config keys that are fixed at creation time.
    pub fn pool_update(&self, changed: &[&str]) -> Result<(), Error> {
        for key in changed {
            if POOL_IMMUTABLE_KEYS.contains(key) {
                return Err(Error::conflict(format!(
                    "The \"{key}\" property cannot be changed"
                )));
            }
        }
        Ok(())
    }

    /// Reject changes to volume config keys that are fixed at creation time.
    pub fn volume_update(&self, changed: &[&str]) -> Result<(), Error> {
        for key in changed {
            if VOLUME_IMMUTABLE_KEYS.contains(key) {
                return Err(Error::conflict(format!(
                    "The \"{key}\" property cannot be changed"
                )));
            }
        }
        Ok(())
    }

    /// Datasets under the schema roots that belong to driver entities.
    pub fn pool_users(&self) -> Result<Vec<String>, Error> {
        let roots = [
            "containers",
            "images",
            "snapshots",
            "deleted",
            "deleted/containers",
            "deleted/images",
        ];

        let mut users = vec![];
        for subvol in self.zfs.list_subvolumes("")? {
            let top = subvol.split('/').next().unwrap_or("");
            if !roots.contains(&top) {
                continue;
            }
            if roots.contains(&subvol.as_str()) {
                continue;
            }
            users.push(subvol);
        }
        Ok(users)
    }
}
