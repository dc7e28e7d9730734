use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error as ThisError;

use tracing::info;

pub mod cleanup;
pub mod coordinator;
pub mod image;
pub mod migration;
pub mod mock;
pub mod paths;
pub mod pool;
pub mod revert;
pub mod snapshot;
pub mod validation;
pub mod volume;
pub mod zfs;

use self::zfs::{Zfs, ZfsCli};

/// Separator between a container name and a snapshot name in manager-level
/// labels (e.g. `web1/backup0`).
pub const SNAPSHOT_DELIMITER: char = '/';

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("Dataset '{name}' not found")]
    NotFound { name: String },

    #[error("{reason}")]
    Conflict { reason: String },

    #[error("Dataset '{name}' is still busy: {message}")]
    Busy { name: String, message: String },

    #[error("ZFS operation failed: {message}")]
    Zfs { message: String },

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Invalid property '{name}={value}'")]
    InvalidProp { name: String, value: String },

    #[error("Unsupported pool type '{kind}'")]
    UnsupportedPoolType { kind: String },

    #[error("Migration stream failure: {message}")]
    Transport { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(name: &str) -> Self {
        Error::NotFound {
            name: name.to_string(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Error::Conflict {
            reason: reason.into(),
        }
    }

    pub fn zfs(message: impl Into<String>) -> Self {
        Error::Zfs {
            message: message.into(),
        }
    }

    pub fn invalid_name(name: &str, reason: impl Into<String>) -> Self {
        Error::InvalidName {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_prop(name: &str, value: &str) -> Self {
        Error::InvalidProp {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }
}

/// Configuration for a storage pool, as handed down by the manager.
///
/// `source` selects the backing: empty for a managed loop file, an absolute
/// path for a block device or loop file, or a relative path naming an
/// existing ZFS dataset the driver does not own.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    pub name: String,
    pub source: String,
    /// Size in bytes (as a string) for loop-file backed pools.
    pub size: String,
    /// Overrides the zpool name at creation time (`zfs.pool_name`).
    pub zfs_pool_name: String,
}

impl PoolConfig {
    /// The dataset all driver entities live under. This is the user-supplied
    /// dataset when `source` is a relative path, the pool name otherwise.
    pub fn prefix(&self) -> &str {
        match self.dataset() {
            Some(dataset) => dataset,
            None => &self.name,
        }
    }

    /// The external dataset backing this pool, if any.
    pub fn dataset(&self) -> Option<&str> {
        if !self.source.is_empty() && !Path::new(&self.source).is_absolute() {
            Some(&self.source)
        } else {
            None
        }
    }
}

/// Per-volume configuration options the driver reads.
#[derive(Debug, Clone, Default)]
pub struct VolumeConfig {
    pub name: String,
    /// `zfs.use_refquota`: enforce quota on the dataset itself rather than
    /// the dataset plus its snapshots.
    pub use_refquota: bool,
    /// `zfs.remove_snapshots`: allow restore to discard newer snapshots.
    pub remove_snapshots: bool,
}

/// The manager-side view of a container or snapshot the driver operates on.
pub trait Instance {
    /// The instance name; snapshots use the `container/snapshot` form.
    fn name(&self) -> String;

    /// The manager's var path for the instance (the rootfs symlink location).
    fn path(&self) -> PathBuf;

    fn is_privileged(&self) -> bool;

    fn is_snapshot(&self) -> bool;

    /// Snapshot labels of this instance, ordered by creation ascending.
    fn snapshots(&self) -> Result<Vec<String>, Error>;

    /// Run the manager's template hook for a lifecycle phase
    /// (`create`, `copy`).
    fn template_apply(&self, phase: &str) -> Result<(), Error>;

    /// The instance's expanded configuration.
    fn expanded_config(&self) -> BTreeMap<String, String>;
}

/// The manager's volume catalog. Image volumes are registered per pool, and
/// the migration sink records skeleton snapshots before receiving them.
pub trait Catalog: Send + Sync {
    fn register_image_volume(&self, fingerprint: &str, pool: &str) -> Result<(), Error>;
    fn unregister_image_volume(&self, fingerprint: &str, pool: &str) -> Result<(), Error>;
    fn create_snapshot_record(&self, container: &str, snapshot: &str) -> Result<(), Error>;
}

/// Unpacks a downloaded image payload into a freshly mounted image volume.
pub trait ImageUnpacker: Send + Sync {
    fn unpack(&self, image: &Path, dest: &Path) -> Result<(), Error>;
}

/// Shifts rootfs ownership into the unprivileged idmap range.
pub trait RootfsShifter: Send + Sync {
    fn shift(&self, rootfs: &Path) -> Result<(), Error>;
}

/// File-level copier used when the source container does not live on this
/// driver and no snapshot can be cloned (rsync in the manager).
pub trait FallbackCopier: Send + Sync {
    fn copy(&self, source: &Path, dest: &Path) -> Result<(), Error>;
}

/// Receives transfer progress for long-running operations.
pub trait Progress: Send + Sync {
    fn report(&self, entity: &str, transferred: u64);
}

/// Progress sink that discards all reports.
pub struct NullProgress;

impl Progress for NullProgress {
    fn report(&self, _entity: &str, _transferred: u64) {}
}

struct NullCatalog;

impl Catalog for NullCatalog {
    fn register_image_volume(&self, _fingerprint: &str, _pool: &str) -> Result<(), Error> {
        Ok(())
    }

    fn unregister_image_volume(&self, _fingerprint: &str, _pool: &str) -> Result<(), Error> {
        Ok(())
    }

    fn create_snapshot_record(&self, _container: &str, _snapshot: &str) -> Result<(), Error> {
        Ok(())
    }
}

struct NullUnpacker;

impl ImageUnpacker for NullUnpacker {
    fn unpack(&self, image: &Path, _dest: &Path) -> Result<(), Error> {
        Err(Error::zfs(format!(
            "No image unpacker configured for {}",
            image.display()
        )))
    }
}

struct NullShifter;

impl RootfsShifter for NullShifter {
    fn shift(&self, _rootfs: &Path) -> Result<(), Error> {
        Ok(())
    }
}

struct NullCopier;

impl FallbackCopier for NullCopier {
    fn copy(&self, source: &Path, _dest: &Path) -> Result<(), Error> {
        Err(Error::zfs(format!(
            "No fallback copier configured for {}",
            source.display()
        )))
    }
}

/// External collaborators the driver calls back into.
#[derive(Clone)]
pub struct Services {
    pub catalog: Arc<dyn Catalog>,
    pub unpacker: Arc<dyn ImageUnpacker>,
    pub shifter: Arc<dyn RootfsShifter>,
    pub copier: Arc<dyn FallbackCopier>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            catalog: Arc::new(NullCatalog),
            unpacker: Arc::new(NullUnpacker),
            shifter: Arc::new(NullShifter),
            copier: Arc::new(NullCopier),
        }
    }
}

/// The ZFS storage driver, bound to one pool and one volume.
#[derive(Clone)]
pub struct Driver {
    pub(crate) pool: PoolConfig,
    pub(crate) volume: VolumeConfig,
    pub(crate) zfs: Arc<dyn Zfs>,
    pub(crate) var_dir: PathBuf,
    pub(crate) services: Services,
}

impl Driver {
    /// Build a driver on top of an explicit adapter. Tests and the emulator
    /// client go through here.
    pub fn new(
        pool: PoolConfig,
        volume: VolumeConfig,
        zfs: Arc<dyn Zfs>,
        var_dir: impl Into<PathBuf>,
        services: Services,
    ) -> Self {
        Self {
            pool,
            volume,
            zfs,
            var_dir: var_dir.into(),
            services,
        }
    }

    /// Build a driver backed by the `zfs`/`zpool` command-line tools.
    pub fn open(
        pool: PoolConfig,
        volume: VolumeConfig,
        var_dir: impl Into<PathBuf>,
        services: Services,
    ) -> Result<Self, Error> {
        if !ZfsCli::available() {
            return Err(Error::zfs("The \"zfs\" tool is not available"));
        }
        if let Ok(version) = zfs::module_version() {
            info!(version = %version, "ZFS kernel module detected");
        }

        let adapter = ZfsCli::new(pool.prefix());
        Ok(Self::new(pool, volume, Arc::new(adapter), var_dir, services))
    }

    /// Rebind the driver to a different volume.
    pub fn with_volume(mut self, volume: VolumeConfig) -> Self {
        self.volume = volume;
        self
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    pub fn volume_name(&self) -> &str {
        &self.volume.name
    }
}
