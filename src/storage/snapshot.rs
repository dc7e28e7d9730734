//! Snapshot engine: create, delete, rename, mounted read-only access, and
//! restore.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use uuid::Uuid;

use super::paths;
use super::revert::Revert;
use super::validation::parse_snapshot_label;
use super::{Driver, Error, Instance};

impl Driver {
    /// Whether a snapshot (or a graveyard filesystem) has no dependent
    /// clones left.
    pub(crate) fn snapshot_removable(&self, path: &str, name: Option<&str>) -> Result<bool, Error> {
        let target = match name {
            Some(name) => format!("{path}@{name}"),
            None => path.to_string(),
        };

        let clones = self.zfs.get(&target, "clones")?;
        Ok(clones == "-" || clones.is_empty())
    }

    /// Create a container snapshot from a `container/snapshot` label.
    pub fn container_snapshot_create(&self, snapshot: &str) -> Result<(), Error> {
        let (container, name) = parse_snapshot_label(snapshot)?;
        let snap = format!("snapshot-{name}");
        let source_fs = format!("containers/{container}");

        self.zfs.snapshot_create(&source_fs, &snap)?;
        let mut revert = Revert::new();
        revert.push(|| {
            let _ = self.container_snapshot_delete(snapshot);
        });

        let mount = paths::snapshot_mount_point(&self.var_dir, &self.pool.name, snapshot);
        if !mount.exists() {
            fs::create_dir_all(&mount)?;
            fs::set_permissions(&mount, fs::Permissions::from_mode(0o700))?;
        }

        let link = paths::snapshot_symlink(&self.var_dir, container);
        if link.symlink_metadata().is_err() {
            let target = paths::snapshot_mount_point(&self.var_dir, &self.pool.name, container);
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent)?;
            }
            std::os::unix::fs::symlink(&target, &link)?;
        }

        revert.commit();
        Ok(())
    }

    /// Delete a container snapshot.
    ///
    /// A snapshot with dependent clones cannot be destroyed; it is renamed
    /// to a transient `copy-<uuid>` name instead and collected once its last
    /// clone goes away.
    pub fn container_snapshot_delete(&self, snapshot: &str) -> Result<(), Error> {
        let (container, name) = parse_snapshot_label(snapshot)?;
        let snap = format!("snapshot-{name}");
        let container_fs = format!("containers/{container}");

        if self.zfs.exists(&format!("{container_fs}@{snap}")) {
            if self.snapshot_removable(&container_fs, Some(&snap))? {
                self.zfs.snapshot_destroy(&container_fs, &snap)?;
            } else {
                self.zfs
                    .snapshot_rename(&container_fs, &snap, &format!("copy-{}", Uuid::new_v4()))?;
            }
        }

        let mount = paths::snapshot_mount_point(&self.var_dir, &self.pool.name, snapshot);
        if mount.exists() {
            fs::remove_dir_all(&mount)?;
        }

        // Drop the per-container directory and symlink with the last
        // snapshot.
        let container_dir = paths::snapshot_mount_point(&self.var_dir, &self.pool.name, container);
        if paths::path_is_empty(&container_dir) {
            fs::remove_dir(&container_dir)?;

            let link = paths::snapshot_symlink(&self.var_dir, container);
            if link.symlink_metadata().is_ok() {
                fs::remove_file(&link)?;
            }
        }

        // Legacy layouts kept loose <snapshot>.zfs files around.
        let legacy = self
            .var_dir
            .join("snapshots")
            .join(container)
            .join(format!("{name}.zfs"));
        if legacy.exists() {
            fs::remove_file(&legacy)?;
        }
        let legacy_parent = self.var_dir.join("snapshots").join(container);
        if paths::path_is_empty(&legacy_parent) {
            fs::remove_dir(&legacy_parent)?;
        }

        Ok(())
    }

    /// Rename a container snapshot. The container component of the label
    /// cannot change.
    pub fn container_snapshot_rename(&self, old: &str, new: &str) -> Result<(), Error> {
        let (container, old_name) = parse_snapshot_label(old)?;
        let (new_container, new_name) = parse_snapshot_label(new)?;
        if container != new_container {
            return Err(Error::invalid_name(
                new,
                "snapshot rename cannot move between containers",
            ));
        }

        let old_snap = format!("snapshot-{old_name}");
        let new_snap = format!("snapshot-{new_name}");
        let container_fs = format!("containers/{container}");

        let mut revert = Revert::new();
        if old_snap != new_snap {
            self.zfs
                .snapshot_rename(&container_fs, &old_snap, &new_snap)?;
            {
                let zfs = std::sync::Arc::clone(&self.zfs);
                let fs_path = container_fs.clone();
                let (old_snap, new_snap) = (old_snap.clone(), new_snap.clone());
                revert.push(move || {
                    let _ = zfs.snapshot_rename(&fs_path, &new_snap, &old_snap);
                });
            }
        }

        // Legacy loose file for the old name.
        let legacy = self
            .var_dir
            .join("snapshots")
            .join(container)
            .join(format!("{old_name}.zfs"));
        if legacy.exists() {
            fs::remove_file(&legacy)?;
        }

        let old_mount = paths::snapshot_mount_point(&self.var_dir, &self.pool.name, old);
        if old_mount.exists() {
            fs::remove_dir(&old_mount)?;
        }
        let new_mount = paths::snapshot_mount_point(&self.var_dir, &self.pool.name, new);
        if !new_mount.exists() {
            fs::create_dir_all(&new_mount)?;
            fs::set_permissions(&new_mount, fs::Permissions::from_mode(0o700))?;
        }

        let link = paths::snapshot_symlink(&self.var_dir, container);
        if link.symlink_metadata().is_err() {
            let target = paths::snapshot_mount_point(&self.var_dir, &self.pool.name, container);
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent)?;
            }
            std::os::unix::fs::symlink(&target, &link)?;
        }

        revert.commit();
        Ok(())
    }

    /// Clone a snapshot into `snapshots/<container>/<name>` for mounted
    /// read-only access.
    pub fn container_snapshot_start(&self, inst: &dyn Instance) -> Result<(), Error> {
        let label = inst.name();
        let (container, name) = parse_snapshot_label(&label)?;
        let source_fs = format!("containers/{container}");
        let source_snap = format!("snapshot-{name}");
        let dest_fs = format!("snapshots/{container}/{name}");

        let mount = paths::snapshot_mount_point(&self.var_dir, &self.pool.name, &label);
        self.clone_with_children(&source_fs, &source_snap, &dest_fs, &mount)
    }

    /// Tear down the clone created by [`Driver::container_snapshot_start`].
    pub fn container_snapshot_stop(&self, inst: &dyn Instance) -> Result<(), Error> {
        let label = inst.name();
        let (container, name) = parse_snapshot_label(&label)?;

        self.zfs
            .destroy(&format!("snapshots/{container}/{name}"))?;

        // The clone recreates this directory on start; clear it on stop.
        let path = inst.path();
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    /// Migration creates the filesystem itself; the skeleton record needs no
    /// dataset.
    pub fn container_snapshot_create_empty(&self, _inst: &dyn Instance) -> Result<(), Error> {
        Ok(())
    }

    /// Whether `inst` can be rolled back to `source`.
    ///
    /// Snapshots come back creation-ordered, so only the last entry can be
    /// restored without discarding newer ones; `zfs.remove_snapshots` lets
    /// the caller arrange that discard.
    pub fn container_can_restore(
        &self,
        inst: &dyn Instance,
        source: &dyn Instance,
    ) -> Result<(), Error> {
        let snapshots = inst.snapshots()?;
        match snapshots.last() {
            Some(last) if *last == source.name() => Ok(()),
            _ if self.volume.remove_snapshots => Ok(()),
            _ => Err(Error::conflict(
                "ZFS can only restore from the latest snapshot. Delete newer \
                 snapshots or copy the snapshot into a new container instead",
            )),
        }
    }

    /// ZFS snapshot names on a container with their creation timestamps,
    /// oldest first.
    pub fn container_snapshot_list(&self, name: &str) -> Result<Vec<(String, i64)>, Error> {
        let fs_path = format!("containers/{name}");

        let mut snapshots = vec![];
        for snap in self.zfs.list_snapshots(&fs_path)? {
            let creation = self.zfs.get(&format!("{fs_path}@{snap}"), "creation")?;
            snapshots.push((snap, creation.parse().unwrap_or(0)));
        }
        Ok(snapshots)
    }

    /// Roll a container back to one of its snapshots, discarding every
    /// newer snapshot first.
    pub fn container_restore(&self, inst: &dyn Instance, source_name: &str) -> Result<(), Error> {
        let snapshots = inst.snapshots()?;
        for i in (1..snapshots.len()).rev() {
            if snapshots[i] == source_name {
                break;
            }
            self.container_snapshot_delete(&snapshots[i])?;
        }

        let (container, name) = parse_snapshot_label(source_name)?;
        let snap = format!("snapshot-{name}");
        let container_fs = format!("containers/{container}");

        self.zfs.rollback(&container_fs, &snap)?;
        for sub in self.zfs.list_subvolumes(&container_fs)? {
            if !self.zfs.list_snapshots(&sub)?.iter().any(|s| *s == snap) {
                continue;
            }
            self.zfs.rollback(&sub, &snap)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testutil::{emulated_driver, TestInstance};
    use crate::storage::zfs::Zfs;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_create_then_delete_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let (driver, zfs) = emulated_driver("p", tmp.path());
        let inst = TestInstance::new("c1", tmp.path());
        driver.container_create(&inst).unwrap();

        let before = zfs.list_snapshots("containers/c1").unwrap();
        driver.container_snapshot_create("c1/s1").unwrap();

        assert!(tmp
            .path()
            .join("storage-pools/p/snapshots/c1/s1")
            .is_dir());
        assert!(tmp.path().join("snapshots/c1").symlink_metadata().is_ok());
        assert_eq!(
            zfs.list_snapshots("containers/c1").unwrap(),
            vec!["snapshot-s1"]
        );

        driver.container_snapshot_delete("c1/s1").unwrap();
        assert_eq!(zfs.list_snapshots("containers/c1").unwrap(), before);
        assert!(!tmp.path().join("storage-pools/p/snapshots/c1").exists());
        assert!(tmp.path().join("snapshots/c1").symlink_metadata().is_err());
    }

    #[test]
    fn test_snapshot_delete_with_clone_renames_to_copy() {
        let tmp = TempDir::new().unwrap();
        let (driver, zfs) = emulated_driver("psnapdel", tmp.path());
        let c1 = TestInstance::new("c1", tmp.path());
        let c2 = TestInstance::new("c2", tmp.path());

        driver.container_create(&c1).unwrap();
        driver.container_snapshot_create("c1/s1").unwrap();
        let source = TestInstance::new("c1/s1", tmp.path());
        driver.container_copy(&c2, &source).unwrap();

        driver.container_snapshot_delete("c1/s1").unwrap();

        let snaps = zfs.list_snapshots("containers/c1").unwrap();
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].starts_with("copy-"));
        assert!(zfs.exists("containers/c2"));
    }

    #[test]
    fn test_snapshot_rename() {
        let tmp = TempDir::new().unwrap();
        let (driver, zfs) = emulated_driver("p", tmp.path());
        let inst = TestInstance::new("c1", tmp.path());
        driver.container_create(&inst).unwrap();
        driver.container_snapshot_create("c1/s1").unwrap();

        driver.container_snapshot_rename("c1/s1", "c1/s2").unwrap();

        assert_eq!(
            zfs.list_snapshots("containers/c1").unwrap(),
            vec!["snapshot-s2"]
        );
        assert!(!tmp.path().join("storage-pools/p/snapshots/c1/s1").exists());
        assert!(tmp.path().join("storage-pools/p/snapshots/c1/s2").is_dir());

        assert!(driver
            .container_snapshot_rename("c1/s2", "c9/s2")
            .is_err());
    }

    #[test]
    fn test_snapshot_start_stop() {
        let tmp = TempDir::new().unwrap();
        let (driver, zfs) = emulated_driver("p", tmp.path());
        let inst = TestInstance::new("c1", tmp.path());
        driver.container_create(&inst).unwrap();
        driver.container_snapshot_create("c1/s1").unwrap();

        let snap_inst = TestInstance::new("c1/s1", tmp.path());
        driver.container_snapshot_start(&snap_inst).unwrap();
        assert!(zfs.exists("snapshots/c1/s1"));
        assert_eq!(
            zfs.get("snapshots/c1/s1", "origin").unwrap(),
            "p/containers/c1@snapshot-s1"
        );

        driver.container_snapshot_stop(&snap_inst).unwrap();
        assert!(!zfs.exists("snapshots/c1/s1"));
    }

    #[test]
    fn test_restore_discards_newer_snapshots() {
        let tmp = TempDir::new().unwrap();
        let (driver, zfs) = emulated_driver("p", tmp.path());
        let mut inst = TestInstance::new("c1", tmp.path());
        driver.container_create(&inst).unwrap();

        zfs.set_contents("containers/c1", "v1");
        driver.container_snapshot_create("c1/s1").unwrap();
        zfs.set_contents("containers/c1", "v2");
        driver.container_snapshot_create("c1/s2").unwrap();
        zfs.set_contents("containers/c1", "v3");
        driver.container_snapshot_create("c1/s3").unwrap();
        inst.snapshots = vec!["c1/s1".into(), "c1/s2".into(), "c1/s3".into()];

        let source = TestInstance::new("c1/s1", tmp.path());
        assert!(driver.container_can_restore(&inst, &source).is_err());

        driver.container_restore(&inst, "c1/s1").unwrap();

        assert_eq!(
            zfs.list_snapshots("containers/c1").unwrap(),
            vec!["snapshot-s1"]
        );
        assert_eq!(zfs.contents("containers/c1").unwrap(), "v1");

        // The newest snapshot restores without preconditions.
        inst.snapshots = vec!["c1/s1".into()];
        driver.container_can_restore(&inst, &source).unwrap();
    }
}
