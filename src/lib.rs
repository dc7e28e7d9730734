//! ZFS-backed storage driver for a container manager.
//!
//! The driver owns the mapping from the manager's logical entities (pools,
//! custom volumes, container rootfs, images, snapshots) onto a fixed ZFS
//! dataset hierarchy, and coordinates every ZFS operation in their
//! lifecycle: creation, cloning from images, mount and unmount with
//! concurrent-caller deduplication, snapshotting and rollback, rename,
//! delayed-reclaim deletion, quota enforcement, and incremental
//! send/receive migration over a streaming transport.

pub mod storage;
