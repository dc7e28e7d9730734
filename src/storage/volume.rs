//! Container and custom volume lifecycle.

use std::fs;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use super::coordinator::{self, OpKind};
use super::paths;
use super::revert::Revert;
use super::validation::validate_entity_name;
use super::{Driver, Error, Instance, SNAPSHOT_DELIMITER};

impl Driver {
    /// Mount a container volume.
    ///
    /// Concurrent callers for the same container collapse into one mount:
    /// the return value is true only for the caller whose invocation
    /// performed the ZFS operation, so only that caller owns a matching
    /// unmount.
    pub fn container_mount(&self, name: &str) -> Result<bool, Error> {
        let fs_path = format!("containers/{name}");
        let mount_point = paths::container_mount_point(&self.var_dir, &self.pool.name, name);

        let mut our_mount = false;
        let key = coordinator::operation_key(&self.pool.name, name, OpKind::Mount);
        let (_, result) = coordinator::single_flight(key, || {
            if !self.zfs.is_mount_point(&mount_point) {
                our_mount = true;
                return self.zfs.mount(&fs_path);
            }
            Ok(())
        });
        result?;
        Ok(our_mount)
    }

    /// Unmount a container volume; same single-flight contract as
    /// [`Driver::container_mount`].
    pub fn container_umount(&self, name: &str) -> Result<bool, Error> {
        let fs_path = format!("containers/{name}");
        let mount_point = paths::container_mount_point(&self.var_dir, &self.pool.name, name);

        let mut our_umount = false;
        let key = coordinator::operation_key(&self.pool.name, name, OpKind::Unmount);
        let (_, result) = coordinator::single_flight(key, || {
            if self.zfs.is_mount_point(&mount_point) {
                our_umount = true;
                return self.zfs.unmount(&fs_path);
            }
            Ok(())
        });
        result?;
        Ok(our_umount)
    }

    /// Create an empty container volume.
    pub fn container_create(&self, inst: &dyn Instance) -> Result<(), Error> {
        let name = inst.name();
        validate_entity_name(&name)?;
        let fs_path = format!("containers/{name}");
        let mount_point = paths::container_mount_point(&self.var_dir, &self.pool.name, &name);

        self.zfs.create(&fs_path)?;
        let mut revert = Revert::new();
        revert.push(|| {
            let _ = self.container_delete(inst);
        });

        self.zfs
            .set(&fs_path, "mountpoint", &mount_point.display().to_string())?;
        paths::create_container_mountpoint(&mount_point, &inst.path(), inst.is_privileged())?;
        inst.template_apply("create")?;

        revert.commit();
        Ok(())
    }

    /// Create a container volume as a clone of an image snapshot,
    /// materializing the image volume first if this is its first use on the
    /// pool. Concurrent first uses of the same image collapse into a single
    /// materialization.
    pub fn container_create_from_image(
        &self,
        inst: &dyn Instance,
        fingerprint: &str,
    ) -> Result<(), Error> {
        let name = inst.name();
        validate_entity_name(&name)?;
        let fs_path = format!("containers/{name}");
        let mount_point = paths::container_mount_point(&self.var_dir, &self.pool.name, &name);
        let fs_image = format!("images/{fingerprint}");

        let key = coordinator::operation_key(&self.pool.name, fingerprint, OpKind::ImageCreate);
        let (_, result) = coordinator::single_flight(key, || {
            if !self.zfs.exists(&fs_image) {
                return self.image_create(fingerprint);
            }
            Ok(())
        });
        result?;

        self.clone_with_children(&fs_image, "readonly", &fs_path, &mount_point)?;
        let mut revert = Revert::new();
        revert.push(|| {
            let _ = self.container_delete(inst);
        });

        let privileged = inst.is_privileged();
        paths::create_container_mountpoint(&mount_point, &inst.path(), privileged)?;
        if !privileged {
            self.services.shifter.shift(&inst.path())?;
        }
        inst.template_apply("create")?;

        revert.commit();
        Ok(())
    }

    /// Clone `source@snap` to `dest`, along with every sub-dataset of the
    /// source that carries the same snapshot, preserving relative subpaths.
    pub(crate) fn clone_with_children(
        &self,
        source: &str,
        snap: &str,
        dest: &str,
        mountpoint: &std::path::Path,
    ) -> Result<(), Error> {
        self.zfs.clone_dataset(source, snap, dest, mountpoint)?;

        for sub in self.zfs.list_subvolumes(source)? {
            if !self.zfs.list_snapshots(&sub)?.iter().any(|s| s == snap) {
                continue;
            }

            let suffix = sub.strip_prefix(source).unwrap_or(&sub);
            let dest_sub = format!("{dest}{suffix}");
            let sub_mount = paths::snapshot_mount_point(&self.var_dir, &self.pool.name, &dest_sub);
            self.zfs.clone_dataset(&sub, snap, &dest_sub, &sub_mount)?;
        }
        Ok(())
    }

    /// Delete a container volume.
    ///
    /// If any snapshot still has dependent clones the dataset cannot go
    /// away; it is parked in the graveyard instead and collected later once
    /// the last clone disappears.
    pub fn container_delete(&self, inst: &dyn Instance) -> Result<(), Error> {
        let name = inst.name();
        let fs_path = format!("containers/{name}");
        let mount_point = paths::container_mount_point(&self.var_dir, &self.pool.name, &name);

        if self.zfs.exists(&fs_path) {
            let mut removable = true;
            for snap in self.zfs.list_snapshots(&fs_path)? {
                removable = self.snapshot_removable(&fs_path, Some(&snap))?;
                if !removable {
                    break;
                }
            }

            if removable {
                let origin = self.zfs.get(&fs_path, "origin")?;
                let origin = self.zfs.relative_name(&origin).to_string();

                self.zfs.destroy(&fs_path)?;

                // The origin may have been waiting in the graveyard for its
                // last clone to go away.
                self.cleanup(&origin)?;
            } else {
                info!(container = %name, "parking container in the graveyard");
                self.zfs.set(&fs_path, "mountpoint", "none")?;
                self.zfs
                    .rename(&fs_path, &format!("deleted/containers/{}", Uuid::new_v4()))?;
            }
        }

        paths::delete_container_mountpoint(&mount_point, &inst.path())?;

        // The parallel snapshot skeleton, if any.
        let _ = self.zfs.destroy(&format!("snapshots/{name}"));

        let snapshot_mount = paths::snapshot_mount_point(&self.var_dir, &self.pool.name, &name);
        if snapshot_mount.exists() {
            fs::remove_dir_all(&snapshot_mount)?;
        }
        let snapshot_link = paths::snapshot_symlink(&self.var_dir, &name);
        if snapshot_link.symlink_metadata().is_ok() {
            fs::remove_file(&snapshot_link)?;
        }

        Ok(())
    }

    /// Copy a container from another container or snapshot.
    ///
    /// A live source gets a transient `copy-<uuid>` snapshot to clone from;
    /// a snapshot source is cloned directly. A source that is not on this
    /// driver falls back to an empty volume plus a file-level copy.
    pub fn container_copy(&self, inst: &dyn Instance, source: &dyn Instance) -> Result<(), Error> {
        let target_name = inst.name();
        validate_entity_name(&target_name)?;
        let target_fs = format!("containers/{target_name}");
        let target_mount =
            paths::container_mount_point(&self.var_dir, &self.pool.name, &target_name);

        let source_full = source.name();
        let (source_name, source_label) = match source_full.split_once(SNAPSHOT_DELIMITER) {
            Some((container, label)) => (container.to_string(), Some(label.to_string())),
            None => (source_full.clone(), None),
        };

        let mut revert = Revert::new();
        let mut source_dataset = String::new();
        let mut source_snap = String::new();

        match source_label {
            None => {
                if self.zfs.exists(&format!("containers/{source_name}")) {
                    source_dataset = format!("containers/{source_name}");
                    source_snap = format!("copy-{}", Uuid::new_v4());
                    self.zfs.snapshot_create(&source_dataset, &source_snap)?;

                    let zfs = Arc::clone(&self.zfs);
                    let dataset = source_dataset.clone();
                    let snap = source_snap.clone();
                    revert.push(move || {
                        let _ = zfs.snapshot_destroy(&dataset, &snap);
                    });
                }
            }
            Some(label) => {
                if self
                    .zfs
                    .exists(&format!("containers/{source_name}@snapshot-{label}"))
                {
                    source_dataset = format!("containers/{source_name}");
                    source_snap = format!("snapshot-{label}");
                }
            }
        }

        let mut our_mount = false;
        if !source_dataset.is_empty() {
            self.clone_with_children(&source_dataset, &source_snap, &target_fs, &target_mount)?;
            {
                let zfs = Arc::clone(&self.zfs);
                let target = target_fs.clone();
                revert.push(move || {
                    let _ = zfs.destroy(&target);
                });
            }

            our_mount = self.container_mount(&target_name)?;

            paths::create_container_mountpoint(&target_mount, &inst.path(), inst.is_privileged())?;
            {
                let mount = target_mount.clone();
                let link = inst.path();
                revert.push(move || {
                    let _ = paths::delete_container_mountpoint(&mount, &link);
                });
            }
        } else {
            // Source is not on this driver; fall back to a file-level copy.
            self.container_create(inst)?;
            revert.push(|| {
                let _ = self.container_delete(inst);
            });
            self.services.copier.copy(&source.path(), &inst.path())?;
        }

        inst.template_apply("copy")?;

        revert.commit();
        if our_mount {
            let _ = self.container_umount(&target_name);
        }
        Ok(())
    }

    /// Rename a container volume, its mountpoint, its snapshot tree and the
    /// manager-side symlinks.
    pub fn container_rename(&self, inst: &dyn Instance, new_name: &str) -> Result<(), Error> {
        let old_name = inst.name();
        validate_entity_name(new_name)?;
        let old_fs = format!("containers/{old_name}");
        let new_fs = format!("containers/{new_name}");

        self.container_umount(&old_name)?;

        self.zfs.rename(&old_fs, &new_fs)?;
        let mut revert = Revert::new();
        {
            let zfs = Arc::clone(&self.zfs);
            let old = old_fs.clone();
            let new = new_fs.clone();
            revert.push(move || {
                let _ = zfs.rename(&new, &old);
            });
        }

        let new_mount = paths::container_mount_point(&self.var_dir, &self.pool.name, new_name);
        self.zfs
            .set(&new_fs, "mountpoint", &new_mount.display().to_string())?;

        // Setting the mountpoint remounts the dataset; leave it unmounted
        // the way we found it.
        self.container_umount(new_name)?;

        let old_mount = paths::container_mount_point(&self.var_dir, &self.pool.name, &old_name);
        let old_link = inst.path();
        let new_link = paths::container_symlink(&self.var_dir, new_name);
        paths::rename_container_mountpoint(&old_mount, &old_link, &new_mount, &new_link)?;
        {
            let (old_mount, old_link) = (old_mount.clone(), old_link.clone());
            let (new_mount, new_link) = (new_mount.clone(), new_link.clone());
            revert.push(move || {
                let _ =
                    paths::rename_container_mountpoint(&new_mount, &new_link, &old_mount, &old_link);
            });
        }

        // Move the snapshot tree along with the container.
        let old_snapshot_mount =
            paths::snapshot_mount_point(&self.var_dir, &self.pool.name, &old_name);
        let new_snapshot_mount =
            paths::snapshot_mount_point(&self.var_dir, &self.pool.name, new_name);
        if old_snapshot_mount.exists() {
            fs::rename(&old_snapshot_mount, &new_snapshot_mount)?;
            {
                let (old_mount, new_mount) =
                    (old_snapshot_mount.clone(), new_snapshot_mount.clone());
                revert.push(move || {
                    let _ = fs::rename(&new_mount, &old_mount);
                });
            }
        }

        let old_snapshot_link = paths::snapshot_symlink(&self.var_dir, &old_name);
        if old_snapshot_link.symlink_metadata().is_ok() {
            fs::remove_file(&old_snapshot_link)?;
        }
        if new_snapshot_mount.exists() {
            let new_snapshot_link = paths::snapshot_symlink(&self.var_dir, new_name);
            if let Some(parent) = new_snapshot_link.parent() {
                fs::create_dir_all(parent)?;
            }
            if new_snapshot_link.symlink_metadata().is_ok() {
                fs::remove_file(&new_snapshot_link)?;
            }
            std::os::unix::fs::symlink(&new_snapshot_mount, &new_snapshot_link)?;
        }

        revert.commit();
        Ok(())
    }

    /// Apply a disk quota to a container volume; zero lifts the quota.
    pub fn container_set_quota(&self, inst: &dyn Instance, size: i64) -> Result<(), Error> {
        let fs_path = format!("containers/{}", inst.name());

        let property = if self.volume.use_refquota {
            "refquota"
        } else {
            "quota"
        };

        if size > 0 {
            self.zfs.set(&fs_path, property, &size.to_string())
        } else {
            self.zfs.set(&fs_path, property, "none")
        }
    }

    /// Bytes used by a container volume, honoring the refquota flag.
    pub fn container_get_usage(&self, inst: &dyn Instance) -> Result<i64, Error> {
        let fs_path = format!("containers/{}", inst.name());

        let property = if self.volume.use_refquota {
            "usedbydataset"
        } else {
            "used"
        };

        let value = self.zfs.get(&fs_path, property)?;
        value
            .parse()
            .map_err(|_| Error::invalid_prop(property, &value))
    }

    /// Create the bound custom volume.
    pub fn custom_volume_create(&self) -> Result<(), Error> {
        let name = self.volume.name.clone();
        validate_entity_name(&name)?;
        let fs_path = format!("custom/{name}");
        let mount_point = paths::custom_volume_mount_point(&self.var_dir, &self.pool.name, &name);

        self.zfs.create(&fs_path)?;
        let mut revert = Revert::new();
        revert.push(|| {
            let _ = self.custom_volume_delete();
        });

        self.zfs
            .set(&fs_path, "mountpoint", &mount_point.display().to_string())?;
        if !self.zfs.is_mount_point(&mount_point) {
            let _ = self.zfs.mount(&fs_path);
        }

        revert.commit();
        Ok(())
    }

    /// Delete the bound custom volume.
    pub fn custom_volume_delete(&self) -> Result<(), Error> {
        let fs_path = format!("custom/{}", self.volume.name);
        let mount_point =
            paths::custom_volume_mount_point(&self.var_dir, &self.pool.name, &self.volume.name);

        self.zfs.destroy(&fs_path)?;

        if mount_point.exists() {
            fs::remove_dir_all(&mount_point)?;
        }
        Ok(())
    }

    /// Mount the bound custom volume; returns whether this call mounted it.
    pub fn custom_volume_mount(&self) -> Result<bool, Error> {
        let fs_path = format!("custom/{}", self.volume.name);
        let mount_point =
            paths::custom_volume_mount_point(&self.var_dir, &self.pool.name, &self.volume.name);

        if self.zfs.is_mount_point(&mount_point) {
            return Ok(false);
        }
        self.zfs.mount(&fs_path)?;
        Ok(true)
    }

    /// Unmount the bound custom volume; returns whether this call unmounted
    /// it.
    pub fn custom_volume_umount(&self) -> Result<bool, Error> {
        let fs_path = format!("custom/{}", self.volume.name);
        let mount_point =
            paths::custom_volume_mount_point(&self.var_dir, &self.pool.name, &self.volume.name);

        if !self.zfs.is_mount_point(&mount_point) {
            return Ok(false);
        }
        self.zfs.unmount(&fs_path)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testutil::{emulated_driver, TestInstance};
    use crate::storage::zfs::Zfs;
    use crate::storage::VolumeConfig;
    use std::fs;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_container_create_and_delete() {
        let tmp = TempDir::new().unwrap();
        let (driver, zfs) = emulated_driver("p", tmp.path());
        let inst = TestInstance::new("c1", tmp.path());

        driver.container_create(&inst).unwrap();
        assert!(zfs.exists("containers/c1"));
        let mount = tmp.path().join("storage-pools/p/containers/c1");
        assert_eq!(
            zfs.get("containers/c1", "mountpoint").unwrap(),
            mount.display().to_string()
        );
        assert!(mount.is_dir());
        assert_eq!(fs::read_link(&inst.path).unwrap(), mount);
        assert_eq!(*inst.applied.lock().unwrap(), vec!["create"]);

        driver.container_delete(&inst).unwrap();
        assert!(!zfs.exists("containers/c1"));
        assert!(!mount.exists());
        assert!(inst.path.symlink_metadata().is_err());
    }

    #[test]
    fn test_container_mount_is_single_flight() {
        let tmp = TempDir::new().unwrap();
        let (driver, zfs) = emulated_driver("pmnt", tmp.path());
        let inst = TestInstance::new("c1", tmp.path());
        driver.container_create(&inst).unwrap();

        // Creation leaves the dataset mounted.
        assert!(!driver.container_mount("c1").unwrap());
        assert!(driver.container_umount("c1").unwrap());
        assert!(!driver.container_umount("c1").unwrap());

        let mounts_before = zfs.call_count("zfs mount");
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = vec![];
        for _ in 0..4 {
            let driver = driver.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                driver.container_mount("c1").unwrap()
            }));
        }
        let owners: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Exactly one caller performed the mount; the rest were told it was
        // not theirs to undo.
        assert_eq!(owners.iter().filter(|owned| **owned).count(), 1);
        assert_eq!(zfs.call_count("zfs mount") - mounts_before, 1);
        assert!(zfs.mounted("containers/c1"));
    }

    #[test]
    fn test_delete_with_dependents_goes_to_graveyard() {
        let tmp = TempDir::new().unwrap();
        let (driver, zfs) = emulated_driver("pdel", tmp.path());
        let c1 = TestInstance::new("c1", tmp.path());
        let c2 = TestInstance::new("c2", tmp.path());

        driver.container_create(&c1).unwrap();
        driver.container_snapshot_create("c1/s1").unwrap();

        let snap_source = TestInstance::new("c1/s1", tmp.path());
        driver.container_copy(&c2, &snap_source).unwrap();
        assert!(zfs.exists("containers/c2"));

        // c2 still clones c1@snapshot-s1, so c1 is parked, not destroyed.
        driver.container_delete(&c1).unwrap();
        assert!(!zfs.exists("containers/c1"));
        let graveyard: Vec<String> = zfs
            .dataset_names()
            .into_iter()
            .filter(|name| name.starts_with("deleted/containers/"))
            .collect();
        assert_eq!(graveyard.len(), 1);
        assert_eq!(zfs.get(&graveyard[0], "mountpoint").unwrap(), "none");
        assert!(zfs.exists("containers/c2"));

        // Destroying the last clone reclaims the graveyard entry.
        driver.container_delete(&c2).unwrap();
        assert!(zfs
            .dataset_names()
            .iter()
            .all(|name| !name.starts_with("deleted/containers/")));
    }

    #[test]
    fn test_container_copy_from_running_container() {
        let tmp = TempDir::new().unwrap();
        let (driver, zfs) = emulated_driver("pcopy", tmp.path());
        let c1 = TestInstance::new("c1", tmp.path());
        let c2 = TestInstance::new("c2", tmp.path());

        driver.container_create(&c1).unwrap();
        driver.container_copy(&c2, &c1).unwrap();

        assert!(zfs.exists("containers/c2"));
        // The transient copy- snapshot stays behind on the source until the
        // next cleanup pass; the clone's origin points at it.
        let origin = zfs.get("containers/c2", "origin").unwrap();
        assert!(origin.starts_with("pcopy/containers/c1@copy-"));
        assert_eq!(*c2.applied.lock().unwrap(), vec!["copy"]);
    }

    #[test]
    fn test_container_rename_moves_everything() {
        let tmp = TempDir::new().unwrap();
        let (driver, zfs) = emulated_driver("pren", tmp.path());
        let inst = TestInstance::new("old", tmp.path());

        driver.container_create(&inst).unwrap();
        driver.container_snapshot_create("old/s1").unwrap();

        driver.container_rename(&inst, "new").unwrap();

        assert!(!zfs.exists("containers/old"));
        assert!(zfs.exists("containers/new"));
        assert!(zfs.exists("containers/new@snapshot-s1"));

        let new_mount = tmp.path().join("storage-pools/pren/containers/new");
        assert_eq!(
            zfs.get("containers/new", "mountpoint").unwrap(),
            new_mount.display().to_string()
        );
        assert!(new_mount.is_dir());
        assert!(!tmp.path().join("storage-pools/pren/containers/old").exists());
        assert_eq!(
            fs::read_link(tmp.path().join("containers/new")).unwrap(),
            new_mount
        );

        let new_snapshot_mount = tmp.path().join("storage-pools/pren/snapshots/new");
        assert!(new_snapshot_mount.join("s1").is_dir());
        assert!(!tmp.path().join("storage-pools/pren/snapshots/old").exists());
        assert_eq!(
            fs::read_link(tmp.path().join("snapshots/new")).unwrap(),
            new_snapshot_mount
        );
    }

    #[test]
    fn test_quota_property_switch() {
        let tmp = TempDir::new().unwrap();
        let (driver, zfs) = emulated_driver("p", tmp.path());
        let inst = TestInstance::new("c1", tmp.path());
        driver.container_create(&inst).unwrap();

        driver.container_set_quota(&inst, 1 << 30).unwrap();
        assert_eq!(zfs.prop("containers/c1", "quota").unwrap(), "1073741824");

        let mut refquota_driver = driver.clone();
        refquota_driver.volume = VolumeConfig {
            use_refquota: true,
            ..driver.volume.clone()
        };
        refquota_driver.container_set_quota(&inst, 0).unwrap();
        assert_eq!(zfs.prop("containers/c1", "refquota").unwrap(), "none");

        // Usage reads through the same flag.
        zfs.set("containers/c1", "used", "4096").unwrap();
        zfs.set("containers/c1", "usedbydataset", "2048").unwrap();
        assert_eq!(driver.container_get_usage(&inst).unwrap(), 4096);
        assert_eq!(refquota_driver.container_get_usage(&inst).unwrap(), 2048);
    }

    #[test]
    fn test_custom_volume_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let (mut driver, zfs) = emulated_driver("p", tmp.path());
        driver.volume = VolumeConfig {
            name: "vol1".to_string(),
            ..Default::default()
        };

        driver.custom_volume_create().unwrap();
        assert!(zfs.exists("custom/vol1"));
        let mount = tmp.path().join("storage-pools/p/custom/vol1");
        assert_eq!(
            zfs.get("custom/vol1", "mountpoint").unwrap(),
            mount.display().to_string()
        );

        assert!(!driver.custom_volume_mount().unwrap());
        assert!(driver.custom_volume_umount().unwrap());
        assert!(!driver.custom_volume_umount().unwrap());
        assert!(driver.custom_volume_mount().unwrap());

        driver.custom_volume_delete().unwrap();
        assert!(!zfs.exists("custom/vol1"));
        assert!(!mount.exists());
    }
}
