//! Graveyard reclamation.
//!
//! Datasets that could not be destroyed because clones still depended on
//! them wait under `deleted/`. Whenever a clone disappears the driver gets a
//! chance to collect the chain bottom-up: snapshot first, then its
//! filesystem, then that filesystem's own origin, and so on.

use tracing::debug;

use super::{Driver, Error};

impl Driver {
    /// Opportunistically collect `path` if nothing depends on it anymore.
    ///
    /// Graveyard snapshots are destroyed and their parent considered next;
    /// graveyard filesystems are destroyed and their clone origin considered
    /// next. Transient `copy-` snapshots on live containers are destroyed
    /// unconditionally. Anything else is left alone.
    pub fn cleanup(&self, path: &str) -> Result<(), Error> {
        if path.starts_with("deleted/") {
            if !self.snapshot_removable(path, None)? {
                return Ok(());
            }

            if let Some((parent, _)) = path.split_once('@') {
                debug!(path, "collecting graveyard snapshot");
                self.zfs.destroy(path)?;

                if self.zfs.list_snapshots(parent)?.is_empty() {
                    return self.cleanup(parent);
                }
            } else {
                let origin = self.zfs.get(path, "origin")?;
                let origin = self.zfs.relative_name(&origin).to_string();

                debug!(path, "collecting graveyard filesystem");
                self.zfs.destroy(path)?;

                if origin != "-" {
                    return self.cleanup(&origin);
                }
            }
        } else if path.starts_with("containers") && path.contains("@copy-") {
            self.zfs.destroy(path)?;
        }

        Ok(())
    }
}
