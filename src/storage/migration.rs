//! Incremental send/receive migration.
//!
//! The source streams the container's snapshot chain in creation order,
//! then the running filesystem anchored on a transient `migration-send`
//! snapshot, and (for live migration) one more increment taken after the
//! checkpoint. The sink replays the same sequence with forced receives.
//! The transport is any byte-faithful `Read`/`Write` pair; the stream
//! contents are opaque.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;

use tracing::warn;
use uuid::Uuid;

use super::paths;
use super::validation::parse_snapshot_label;
use super::{Driver, Error, Instance, NullProgress, Progress, SNAPSHOT_DELIMITER};

/// How a migration stream is produced.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MigrationKind {
    /// File-level transfer; the generic fallback.
    Rsync,
    /// Native ZFS send/receive streams.
    Zfs,
}

impl Driver {
    pub fn migration_kind(&self) -> MigrationKind {
        MigrationKind::Zfs
    }

    /// Native streams carry inode numbers with them, so the manager can skip
    /// the post-transfer fixup pass.
    pub fn preserves_inodes(&self) -> bool {
        true
    }
}

/// Source half of a migration, bound to one container.
pub struct MigrationSource {
    driver: Driver,
    container_name: String,
    is_snapshot: bool,
    snapshot_labels: Vec<String>,
    zfs_snapshot_names: Vec<String>,
    running_snap_name: Option<String>,
    stopped_snap_name: Option<String>,
}

impl MigrationSource {
    /// Prepare a source for `inst`. For a snapshot instance only that
    /// snapshot is sent; otherwise the container's whole `snapshot-` chain
    /// is collected in creation order.
    pub fn new(driver: &Driver, inst: &dyn Instance) -> Result<Self, Error> {
        let container_name = inst.name();

        let mut snapshot_labels = vec![];
        let mut zfs_snapshot_names = vec![];
        if !inst.is_snapshot() {
            for snap in driver
                .zfs
                .list_snapshots(&format!("containers/{container_name}"))?
            {
                // Leftover migration-send or copy- anchors from concurrent
                // transfers are not part of the chain.
                let user_name = match snap.strip_prefix("snapshot-") {
                    Some(user_name) => user_name.to_string(),
                    None => continue,
                };
                snapshot_labels.push(format!(
                    "{container_name}{SNAPSHOT_DELIMITER}{user_name}"
                ));
                zfs_snapshot_names.push(snap);
            }
        }

        Ok(Self {
            driver: driver.clone(),
            container_name,
            is_snapshot: inst.is_snapshot(),
            snapshot_labels,
            zfs_snapshot_names,
            running_snap_name: None,
            stopped_snap_name: None,
        })
    }

    /// Manager-level labels of the snapshots this source will send.
    pub fn snapshots(&self) -> &[String] {
        &self.snapshot_labels
    }

    fn send(
        &self,
        conn: &mut dyn Write,
        snap: &str,
        parent: Option<&str>,
        entity: &str,
        progress: &dyn Progress,
    ) -> Result<(), Error> {
        let container = self
            .container_name
            .split(SNAPSHOT_DELIMITER)
            .next()
            .unwrap_or(&self.container_name);
        let path = format!("containers/{container}");

        let mut report = |transferred: u64| progress.report(entity, transferred);
        self.driver.zfs.send(&path, snap, parent, conn, &mut report)
    }

    /// Stream the snapshot chain and the running filesystem.
    pub fn send_while_running(
        &mut self,
        conn: &mut dyn Write,
        progress: &dyn Progress,
    ) -> Result<(), Error> {
        if self.is_snapshot {
            let (_, name) = parse_snapshot_label(&self.container_name)?;
            let snap = format!("snapshot-{name}");
            let entity = self.container_name.clone();
            return self.send(conn, &snap, None, &entity, progress);
        }

        // Oldest to newest, each incremental on its predecessor.
        let names = self.zfs_snapshot_names.clone();
        let mut last: Option<&str> = None;
        for (i, snap) in names.iter().enumerate() {
            let parent = if i > 0 { Some(names[i - 1].as_str()) } else { None };
            self.send(conn, snap, parent, snap, progress)?;
            last = Some(snap);
        }

        // Anchor the running filesystem on a transient snapshot.
        let running = format!("migration-send-{}", Uuid::new_v4());
        self.driver
            .zfs
            .snapshot_create(&format!("containers/{}", self.container_name), &running)?;
        self.running_snap_name = Some(running.clone());

        let entity = self.container_name.clone();
        self.send(conn, &running, last, &entity, progress)
    }

    /// Live migration only: stream the delta between the running anchor and
    /// the post-checkpoint state.
    pub fn send_after_checkpoint(&mut self, conn: &mut dyn Write) -> Result<(), Error> {
        let stopped = format!("migration-send-{}", Uuid::new_v4());
        self.driver
            .zfs
            .snapshot_create(&format!("containers/{}", self.container_name), &stopped)?;
        self.stopped_snap_name = Some(stopped.clone());

        let running = self.running_snap_name.clone();
        let entity = self.container_name.clone();
        self.send(conn, &stopped, running.as_deref(), &entity, &NullProgress)
    }

    /// Destroy the transient snapshots this source created.
    pub fn cleanup(&mut self) {
        let fs_path = format!("containers/{}", self.container_name);
        if let Some(stopped) = self.stopped_snap_name.take() {
            let _ = self.driver.zfs.snapshot_destroy(&fs_path, &stopped);
        }
        if let Some(running) = self.running_snap_name.take() {
            let _ = self.driver.zfs.snapshot_destroy(&fs_path, &running);
        }
    }
}

/// Receive a migration stream into `containers/<name>`.
///
/// Expects, in order: one stream per entry of `snapshots` (short snapshot
/// names), the base filesystem, and one more increment when `live`.
/// Transfer anchors received along the way are purged before returning;
/// with no expected snapshot list, no received snapshot survives.
pub fn migration_sink(
    driver: &Driver,
    live: bool,
    inst: &dyn Instance,
    snapshots: &[String],
    conn: &mut dyn Read,
    progress: &dyn Progress,
) -> Result<(), Error> {
    let name = inst.name();
    let fs_path = format!("containers/{name}");

    // Some ZFS versions refuse `recv -F` into a mounted filesystem, and
    // receiving a snapshot needs the snapshotted filesystem unmounted too.
    driver.zfs.unmount(&fs_path)?;

    if !snapshots.is_empty() {
        let link = paths::snapshot_symlink(&driver.var_dir, &name);
        if link.symlink_metadata().is_err() {
            let target = paths::snapshot_mount_point(&driver.var_dir, &driver.pool.name, &name);
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent)?;
            }
            std::os::unix::fs::symlink(&target, &link)?;
        }
    }

    for snap in snapshots {
        // Skeleton record first, so the manager knows the snapshot even if
        // the transfer dies mid-way.
        driver.services.catalog.create_snapshot_record(&name, snap)?;

        let mut report = |transferred: u64| progress.report(snap, transferred);
        driver.zfs.recv(
            &format!("containers/{name}@snapshot-{snap}"),
            conn,
            &mut report,
        )?;

        let mount = paths::snapshot_mount_point(
            &driver.var_dir,
            &driver.pool.name,
            &format!("{name}{SNAPSHOT_DELIMITER}{snap}"),
        );
        if !mount.exists() {
            fs::create_dir_all(&mount)?;
            fs::set_permissions(&mount, fs::Permissions::from_mode(0o700))?;
        }
    }

    let result: Result<(), Error> = (|| {
        let mut report = |transferred: u64| progress.report(&name, transferred);
        driver.zfs.recv(&fs_path, conn, &mut report)?;

        if live {
            // The post-checkpoint increment lands on the same dataset name;
            // the forced receive rewinds to the common ancestor first.
            let mut report = |transferred: u64| progress.report(&name, transferred);
            driver.zfs.recv(&fs_path, conn, &mut report)?;
        }

        // `-u` is not honored by every ZFS version; mount best-effort.
        let _ = driver.zfs.mount(&fs_path);
        Ok(())
    })();

    match driver.zfs.list_snapshots(&fs_path) {
        Ok(received) => {
            for snap in received {
                if !snapshots.is_empty() && !snap.starts_with("migration-send") {
                    continue;
                }
                let _ = driver.zfs.snapshot_destroy(&fs_path, &snap);
            }
        }
        Err(err) => warn!(%err, "failed listing snapshots after migration"),
    }

    result
}
