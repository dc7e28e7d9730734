//! Image volume lifecycle.
//!
//! An image volume is unpacked once per pool, sealed read-only, and given a
//! single `@readonly` snapshot that every container created from the image
//! clones. Deleting a still-cloned image parks it in the graveyard; a later
//! create resurrects it from there instead of unpacking again.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use tracing::info;

use super::paths;
use super::revert::Revert;
use super::{Driver, Error};

impl Driver {
    /// Materialize `images/<fingerprint>` on the pool.
    pub fn image_create(&self, fingerprint: &str) -> Result<(), Error> {
        let fs_path = format!("images/{fingerprint}");
        let image_mount = paths::image_mount_point(&self.var_dir, &self.pool.name, fingerprint);

        self.services
            .catalog
            .register_image_volume(fingerprint, &self.pool.name)?;
        let mut subrevert = Revert::new();
        subrevert.push(|| {
            let _ = self
                .services
                .catalog
                .unregister_image_volume(fingerprint, &self.pool.name);
        });

        // A previous delete may have parked the dataset in the graveyard;
        // resurrect it instead of unpacking from scratch.
        if self.zfs.exists(&format!("deleted/{fs_path}")) {
            self.zfs.rename(&format!("deleted/{fs_path}"), &fs_path)?;
            let mut revert = Revert::new();
            revert.push(|| {
                let _ = self.image_delete(fingerprint);
            });

            self.zfs
                .set(&fs_path, "mountpoint", &image_mount.display().to_string())?;

            info!(fingerprint, "image volume resurrected from the graveyard");
            revert.commit();
            subrevert.commit();
            return Ok(());
        }

        if !image_mount.exists() {
            fs::create_dir_all(&image_mount)?;
            fs::set_permissions(&image_mount, fs::Permissions::from_mode(0o700))?;
            subrevert.push(|| {
                let _ = fs::remove_dir_all(&image_mount);
            });
        }

        // Unpack through a temporary mountpoint, then seal the volume.
        let images_root = paths::image_mount_point(&self.var_dir, &self.pool.name, "");
        fs::create_dir_all(&images_root)?;
        let unpack_dir = tempfile::Builder::new()
            .prefix("image-")
            .tempdir_in(&images_root)?;
        let image_archive = self.var_dir.join("images").join(fingerprint);

        self.zfs.create(&fs_path)?;
        subrevert.commit();
        let mut revert = Revert::new();
        revert.push(|| {
            // The volume is not sealed yet, so delete cannot judge it by its
            // snapshot; drop the dataset first, then the catalog entry and
            // directories.
            let _ = self.zfs.destroy(&fs_path);
            let _ = self.image_delete(fingerprint);
        });

        self.zfs.set(
            &fs_path,
            "mountpoint",
            &unpack_dir.path().display().to_string(),
        )?;
        if !self.zfs.is_mount_point(unpack_dir.path()) {
            let _ = self.zfs.mount(&fs_path);
        }

        self.services
            .unpacker
            .unpack(&image_archive, unpack_dir.path())?;

        self.zfs.set(&fs_path, "readonly", "on")?;
        self.zfs.set(&fs_path, "mountpoint", "none")?;
        if self.zfs.is_mount_point(unpack_dir.path()) {
            let _ = self.zfs.unmount(&fs_path);
        }

        // The snapshot every container from this image clones.
        self.zfs.snapshot_create(&fs_path, "readonly")?;

        info!(fingerprint, pool = %self.pool.name, "image volume created");
        revert.commit();
        Ok(())
    }

    /// Delete `images/<fingerprint>`, or park it in the graveyard while
    /// containers still clone it.
    pub fn image_delete(&self, fingerprint: &str) -> Result<(), Error> {
        let fs_path = format!("images/{fingerprint}");

        if self.zfs.exists(&fs_path) {
            if self.snapshot_removable(&fs_path, Some("readonly"))? {
                self.zfs.destroy(&fs_path)?;
            } else {
                self.zfs.set(&fs_path, "mountpoint", "none")?;
                self.zfs.rename(&fs_path, &format!("deleted/{fs_path}"))?;
            }
        }

        self.services
            .catalog
            .unregister_image_volume(fingerprint, &self.pool.name)?;

        let image_mount = paths::image_mount_point(&self.var_dir, &self.pool.name, fingerprint);
        if image_mount.exists() {
            fs::remove_dir_all(&image_mount)?;
        }

        // Legacy layouts kept a loose <fs>.zfs tree in the var directory.
        let legacy = self.var_dir.join(format!("{fs_path}.zfs"));
        if legacy.is_dir() {
            fs::remove_dir_all(&legacy)?;
        } else if legacy.exists() {
            fs::remove_file(&legacy)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testutil::{emulated_driver, recording_services, TestInstance};
    use crate::storage::zfs::Zfs;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_image_create_seals_volume() {
        let tmp = TempDir::new().unwrap();
        let (mut driver, zfs) = emulated_driver("pseal", tmp.path());
        let (services, catalog) = recording_services();
        driver.services = services;

        driver.image_create("abc").unwrap();

        assert!(zfs.exists("images/abc"));
        assert_eq!(zfs.prop("images/abc", "readonly").unwrap(), "on");
        assert_eq!(zfs.get("images/abc", "mountpoint").unwrap(), "none");
        assert_eq!(zfs.list_snapshots("images/abc").unwrap(), vec!["readonly"]);
        assert!(catalog
            .events()
            .contains(&"register:abc@pseal".to_string()));

        // The temporary unpack directory is gone.
        let images_root = tmp.path().join("storage-pools/pseal/images");
        let leftovers: Vec<_> = fs::read_dir(&images_root)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("image-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_image_delete_and_resurrect() {
        let tmp = TempDir::new().unwrap();
        let (mut driver, zfs) = emulated_driver("pres", tmp.path());
        let (services, _catalog) = recording_services();
        driver.services = services;

        driver.image_create("abc").unwrap();
        let c1 = TestInstance::new("c1", tmp.path());
        driver.container_create_from_image(&c1, "abc").unwrap();

        // The clone pins the image, so delete parks it.
        driver.image_delete("abc").unwrap();
        assert!(!zfs.exists("images/abc"));
        assert!(zfs.exists("deleted/images/abc"));
        assert_eq!(zfs.get("deleted/images/abc", "mountpoint").unwrap(), "none");

        // The next create renames it back instead of unpacking.
        let unpacks_before = zfs.call_count("zfs create");
        driver.image_create("abc").unwrap();
        assert!(zfs.exists("images/abc"));
        assert!(!zfs.exists("deleted/images/abc"));
        assert_eq!(zfs.call_count("zfs create"), unpacks_before);

        // Without clones the image is destroyed outright.
        driver.container_delete(&c1).unwrap();
        driver.image_delete("abc").unwrap();
        assert!(!zfs.exists("images/abc"));
        assert!(!zfs.exists("deleted/images/abc"));
    }

    #[test]
    fn test_concurrent_creates_materialize_image_once() {
        let tmp = TempDir::new().unwrap();
        let (mut driver, zfs) = emulated_driver("pimg", tmp.path());
        let (services, _catalog) = recording_services();
        driver.services = services;

        let creates_before = zfs.call_count("zfs create");
        let barrier = Arc::new(Barrier::new(2));
        let tmp_path = tmp.path().to_path_buf();
        let mut handles = vec![];
        for name in ["c1", "c2"] {
            let driver = driver.clone();
            let barrier = barrier.clone();
            let tmp_path = tmp_path.clone();
            handles.push(thread::spawn(move || {
                let inst = TestInstance::new(name, &tmp_path);
                barrier.wait();
                driver.container_create_from_image(&inst, "abc").unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // One materialization, two clones.
        assert_eq!(zfs.call_count("zfs create") - creates_before, 1);
        assert_eq!(zfs.call_count("zfs clone"), 2);
        assert_eq!(
            zfs.get("containers/c1", "origin").unwrap(),
            "pimg/images/abc@readonly"
        );
        assert_eq!(
            zfs.get("containers/c2", "origin").unwrap(),
            "pimg/images/abc@readonly"
        );
    }
}
