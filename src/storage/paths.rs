//! Canonical on-disk locations for driver entities.
//!
//! Every mountpoint and symlink the driver manages is derived from the
//! manager's var directory and the `(pool, name)` pair, so the layout is a
//! stable contract between driver versions.

use std::fs;
use std::io;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

/// `<var>/storage-pools/<pool>`
pub fn storage_pool_mount_point(var_dir: &Path, pool: &str) -> PathBuf {
    var_dir.join("storage-pools").join(pool)
}

/// `<var>/storage-pools/<pool>/containers/<name>`
pub fn container_mount_point(var_dir: &Path, pool: &str, name: &str) -> PathBuf {
    storage_pool_mount_point(var_dir, pool)
        .join("containers")
        .join(name)
}

/// `<var>/storage-pools/<pool>/custom/<name>`
pub fn custom_volume_mount_point(var_dir: &Path, pool: &str, name: &str) -> PathBuf {
    storage_pool_mount_point(var_dir, pool)
        .join("custom")
        .join(name)
}

/// `<var>/storage-pools/<pool>/images/<fingerprint>`
pub fn image_mount_point(var_dir: &Path, pool: &str, fingerprint: &str) -> PathBuf {
    let images = storage_pool_mount_point(var_dir, pool).join("images");
    if fingerprint.is_empty() {
        return images;
    }
    images.join(fingerprint)
}

/// `<var>/storage-pools/<pool>/snapshots/<label>` where the label is either
/// a container name or a `container/snapshot` pair.
pub fn snapshot_mount_point(var_dir: &Path, pool: &str, label: &str) -> PathBuf {
    storage_pool_mount_point(var_dir, pool)
        .join("snapshots")
        .join(label)
}

/// `<var>/containers/<name>`, the manager-side rootfs symlink.
pub fn container_symlink(var_dir: &Path, name: &str) -> PathBuf {
    var_dir.join("containers").join(name)
}

/// `<var>/snapshots/<name>`, the manager-side snapshot tree symlink.
pub fn snapshot_symlink(var_dir: &Path, name: &str) -> PathBuf {
    var_dir.join("snapshots").join(name)
}

/// `<var>/disks/<pool>`, the stem for loop-file backing (an `.img` suffix is
/// appended when the file is created).
pub fn disks_path(var_dir: &Path, pool: &str) -> PathBuf {
    var_dir.join("disks").join(pool)
}

/// Create a container mountpoint directory and the var-path symlink into it.
pub fn create_container_mountpoint(
    mount_point: &Path,
    link: &Path,
    privileged: bool,
) -> io::Result<()> {
    fs::create_dir_all(mount_point)?;
    let mode = if privileged { 0o700 } else { 0o711 };
    fs::set_permissions(mount_point, fs::Permissions::from_mode(mode))?;

    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    if link.symlink_metadata().is_ok() {
        fs::remove_file(link)?;
    }
    symlink(mount_point, link)
}

/// Remove a container mountpoint directory and its var-path symlink.
pub fn delete_container_mountpoint(mount_point: &Path, link: &Path) -> io::Result<()> {
    if link.symlink_metadata().is_ok() {
        fs::remove_file(link)?;
    }
    if mount_point.exists() {
        fs::remove_dir_all(mount_point)?;
    }
    Ok(())
}

/// Move a container mountpoint directory and rewrite its var-path symlink.
pub fn rename_container_mountpoint(
    old_mount_point: &Path,
    old_link: &Path,
    new_mount_point: &Path,
    new_link: &Path,
) -> io::Result<()> {
    if old_mount_point.exists() {
        fs::rename(old_mount_point, new_mount_point)?;
    }
    if old_link.symlink_metadata().is_ok() {
        fs::remove_file(old_link)?;
    }
    if let Some(parent) = new_link.parent() {
        fs::create_dir_all(parent)?;
    }
    symlink(new_mount_point, new_link)
}

/// Whether a directory exists and has no entries.
pub fn path_is_empty(path: &Path) -> bool {
    match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_derivation() {
        let var = Path::new("/var/lib/zstor");
        assert_eq!(
            container_mount_point(var, "p", "c1"),
            PathBuf::from("/var/lib/zstor/storage-pools/p/containers/c1")
        );
        assert_eq!(
            snapshot_mount_point(var, "p", "c1/s1"),
            PathBuf::from("/var/lib/zstor/storage-pools/p/snapshots/c1/s1")
        );
        assert_eq!(
            image_mount_point(var, "p", ""),
            PathBuf::from("/var/lib/zstor/storage-pools/p/images")
        );
        assert_eq!(
            container_symlink(var, "c1"),
            PathBuf::from("/var/lib/zstor/containers/c1")
        );
    }

    #[test]
    fn test_container_mountpoint_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mnt = tmp.path().join("storage-pools/p/containers/c1");
        let link = tmp.path().join("containers/c1");

        create_container_mountpoint(&mnt, &link, true).unwrap();
        assert!(mnt.is_dir());
        assert_eq!(fs::read_link(&link).unwrap(), mnt);

        let new_mnt = tmp.path().join("storage-pools/p/containers/c2");
        let new_link = tmp.path().join("containers/c2");
        rename_container_mountpoint(&mnt, &link, &new_mnt, &new_link).unwrap();
        assert!(!mnt.exists());
        assert!(new_mnt.is_dir());
        assert_eq!(fs::read_link(&new_link).unwrap(), new_mnt);

        delete_container_mountpoint(&new_mnt, &new_link).unwrap();
        assert!(!new_mnt.exists());
        assert!(new_link.symlink_metadata().is_err());
    }

    #[test]
    fn test_path_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(path_is_empty(tmp.path()));
        fs::write(tmp.path().join("x"), b"x").unwrap();
        assert!(!path_is_empty(tmp.path()));
        assert!(!path_is_empty(&tmp.path().join("missing")));
    }
}
