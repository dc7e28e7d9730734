//! In-memory ZFS emulator.
//!
//! Implements the full [`Zfs`] adapter surface against an in-memory dataset
//! tree: properties, mount state, snapshots in creation order, clone origins
//! and the dependent-clone destroy guard. Tests drive the driver through it,
//! and the CLI exposes it as `--client emulator` for dry runs.
//!
//! Send/recv use a small framed stream private to the emulator; the driver
//! treats it as opaque bytes either way, so migration round-trips work over
//! any `Read`/`Write` pair.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::zfs::Zfs;
use super::Error;

#[derive(Clone)]
struct Snapshot {
    name: String,
    contents: String,
    created: u64,
}

#[derive(Clone, Default)]
struct Dataset {
    props: BTreeMap<String, String>,
    mounted: bool,
    origin: Option<String>,
    contents: String,
    snapshots: Vec<Snapshot>,
    created: u64,
}

#[derive(Default)]
struct State {
    pools: BTreeSet<String>,
    datasets: BTreeMap<String, Dataset>,
    calls: BTreeMap<&'static str, usize>,
    serial: u64,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }

    fn count(&mut self, op: &'static str) {
        *self.calls.entry(op).or_insert(0) += 1;
    }

    fn dataset(&self, path: &str, full: &str) -> Result<&Dataset, Error> {
        self.datasets.get(path).ok_or_else(|| Error::not_found(full))
    }

    fn dataset_mut(&mut self, path: &str, full: &str) -> Result<&mut Dataset, Error> {
        self.datasets
            .get_mut(path)
            .ok_or_else(|| Error::not_found(full))
    }

    /// `-p` semantics: materialize every missing ancestor of `path`.
    fn ensure_parents(&mut self, path: &str) {
        let mut parents = vec![];
        let mut current = path;
        while let Some((parent, _)) = current.rsplit_once('/') {
            parents.push(parent.to_string());
            current = parent;
        }
        for parent in parents.into_iter().rev() {
            if !self.datasets.contains_key(&parent) {
                let created = self.tick();
                self.datasets.insert(
                    parent,
                    Dataset {
                        created,
                        ..Default::default()
                    },
                );
            }
        }
    }

    /// Full names of datasets cloned from `path@snap`, excluding doomed ones.
    fn clones_of(&self, origin: &str, doomed: &BTreeSet<String>, prefix: &str) -> Vec<String> {
        self.datasets
            .iter()
            .filter(|(name, dataset)| {
                dataset.origin.as_deref() == Some(origin) && !doomed.contains(*name)
            })
            .map(|(name, _)| format!("{prefix}/{name}"))
            .collect()
    }
}

pub struct EmulatorZfs {
    prefix: String,
    state: Mutex<State>,
}

impl EmulatorZfs {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How many times an operation ran (`"zfs mount"`, `"zfs clone"`, ...).
    pub fn call_count(&self, op: &str) -> usize {
        *self.lock().calls.get(op).unwrap_or(&0)
    }

    /// All dataset names, relative to the pool, excluding the root.
    pub fn dataset_names(&self) -> Vec<String> {
        self.lock()
            .datasets
            .keys()
            .filter(|name| !name.is_empty())
            .cloned()
            .collect()
    }

    /// A raw property value, without the `get` fallbacks.
    pub fn prop(&self, path: &str, key: &str) -> Option<String> {
        self.lock().datasets.get(path)?.props.get(key).cloned()
    }

    pub fn mounted(&self, path: &str) -> bool {
        self.lock()
            .datasets
            .get(path)
            .map(|dataset| dataset.mounted)
            .unwrap_or(false)
    }

    pub fn contents(&self, path: &str) -> Option<String> {
        self.lock()
            .datasets
            .get(path)
            .map(|dataset| dataset.contents.clone())
    }

    /// Overwrite a dataset's payload, standing in for writes into the
    /// mounted filesystem.
    pub fn set_contents(&self, path: &str, contents: &str) {
        if let Some(dataset) = self.lock().datasets.get_mut(path) {
            dataset.contents = contents.to_string();
        }
    }

    fn split_snapshot(path: &str) -> Option<(&str, &str)> {
        path.split_once('@')
    }

    fn children_of(state: &State, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        state
            .datasets
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

impl Zfs for EmulatorZfs {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn pool_check(&self, name: &str) -> Result<(), Error> {
        let state = self.lock();
        if name == self.prefix && state.datasets.contains_key("") {
            return Ok(());
        }
        if state.pools.contains(name) {
            return Ok(());
        }
        Err(Error::not_found(name))
    }

    fn pool_create(&self, name: &str, _vdev: &str) -> Result<(), Error> {
        let mut state = self.lock();
        if state.pools.contains(name) {
            return Err(Error::zfs(format!("pool '{name}' already exists")));
        }
        state.count("zpool create");
        state.pools.insert(name.to_string());
        // `zpool create -m none` leaves the root with a local mountpoint.
        let created = state.tick();
        let mut root = Dataset {
            created,
            ..Default::default()
        };
        root.props.insert("mountpoint".into(), "none".into());
        state.datasets.insert(String::new(), root);
        Ok(())
    }

    fn pool_import(&self, _source: &str, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        state.count("zpool import");
        state.pools.insert(name.to_string());
        if !state.datasets.contains_key("") {
            let created = state.tick();
            let mut root = Dataset {
                created,
                ..Default::default()
            };
            root.props.insert("mountpoint".into(), "none".into());
            state.datasets.insert(String::new(), root);
        }
        Ok(())
    }

    fn pool_destroy(&self, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        if !state.pools.remove(name) {
            return Err(Error::not_found(name));
        }
        state.count("zpool destroy");
        state.datasets.clear();
        Ok(())
    }

    fn create(&self, path: &str) -> Result<(), Error> {
        let full = self.full_name(path);
        let mut state = self.lock();
        if state.datasets.contains_key(path) {
            return Err(Error::zfs(format!(
                "cannot create '{full}': dataset already exists"
            )));
        }
        state.count("zfs create");
        state.ensure_parents(path);

        let created = state.tick();
        let contents = format!("{path}#{created}");
        state.datasets.insert(
            path.to_string(),
            Dataset {
                created,
                contents,
                ..Default::default()
            },
        );
        Ok(())
    }

    fn destroy(&self, path: &str) -> Result<(), Error> {
        let full = self.full_name(path);
        let mut state = self.lock();
        state.count("zfs destroy");

        if let Some((fs, snap)) = Self::split_snapshot(path) {
            // Recursive snapshot destroy: the named snapshot on the dataset
            // and every descendant that carries it.
            let mut targets = Self::children_of(&state, fs);
            targets.insert(0, fs.to_string());
            state.dataset(fs, &full)?;

            let doomed = BTreeSet::new();
            let mut found = false;
            for target in &targets {
                let has = state
                    .datasets
                    .get(target)
                    .map(|dataset| dataset.snapshots.iter().any(|s| s.name == snap))
                    .unwrap_or(false);
                if !has {
                    continue;
                }
                found = true;
                let origin = format!("{target}@{snap}");
                let clones = state.clones_of(&origin, &doomed, &self.prefix);
                if !clones.is_empty() {
                    return Err(Error::zfs(format!(
                        "cannot destroy '{}/{origin}': snapshot has dependent clones",
                        self.prefix
                    )));
                }
            }
            if !found {
                return Err(Error::not_found(&full));
            }
            for target in &targets {
                if let Some(dataset) = state.datasets.get_mut(target) {
                    dataset.snapshots.retain(|s| s.name != snap);
                }
            }
            return Ok(());
        }

        state.dataset(path, &full)?;
        let mut doomed: BTreeSet<String> = Self::children_of(&state, path).into_iter().collect();
        doomed.insert(path.to_string());

        for target in &doomed {
            let snaps: Vec<String> = state.datasets[target]
                .snapshots
                .iter()
                .map(|s| s.name.clone())
                .collect();
            for snap in snaps {
                let origin = format!("{target}@{snap}");
                if !state.clones_of(&origin, &doomed, &self.prefix).is_empty() {
                    return Err(Error::zfs(format!(
                        "cannot destroy '{full}': filesystem has dependent clones"
                    )));
                }
            }
        }
        for target in doomed {
            state.datasets.remove(&target);
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        let state = self.lock();
        match Self::split_snapshot(path) {
            Some((fs, snap)) => state
                .datasets
                .get(fs)
                .map(|dataset| dataset.snapshots.iter().any(|s| s.name == snap))
                .unwrap_or(false),
            None => state.datasets.contains_key(path),
        }
    }

    fn get(&self, path: &str, key: &str) -> Result<String, Error> {
        let full = self.full_name(path);
        let state = self.lock();

        if let Some((fs, snap)) = Self::split_snapshot(path) {
            let dataset = state.dataset(fs, &full)?;
            let snapshot = dataset
                .snapshots
                .iter()
                .find(|s| s.name == snap)
                .ok_or_else(|| Error::not_found(&full))?;
            return Ok(match key {
                "name" => full.clone(),
                "type" => "snapshot".to_string(),
                "creation" => snapshot.created.to_string(),
                "clones" => {
                    let clones = state.clones_of(path, &BTreeSet::new(), &self.prefix);
                    if clones.is_empty() {
                        "-".to_string()
                    } else {
                        clones.join(",")
                    }
                }
                _ => "-".to_string(),
            });
        }

        let dataset = state.dataset(path, &full)?;
        Ok(match key {
            "name" => full.clone(),
            "type" => "filesystem".to_string(),
            "origin" => match &dataset.origin {
                Some(origin) => format!("{}/{origin}", self.prefix),
                None => "-".to_string(),
            },
            // `clones` only carries values on snapshots.
            "clones" => "-".to_string(),
            "creation" => dataset.created.to_string(),
            "mountpoint" => dataset
                .props
                .get("mountpoint")
                .cloned()
                .unwrap_or_else(|| "none".to_string()),
            "used" | "usedbydataset" => dataset
                .props
                .get(key)
                .cloned()
                .unwrap_or_else(|| "8192".to_string()),
            _ => dataset.props.get(key).cloned().unwrap_or_else(|| "-".to_string()),
        })
    }

    fn property_source(&self, path: &str, key: &str) -> Result<String, Error> {
        let full = self.full_name(path);
        let state = self.lock();
        let dataset = state.dataset(path, &full)?;
        if dataset.props.contains_key(key) {
            Ok("local".to_string())
        } else {
            Ok("default".to_string())
        }
    }

    fn set(&self, path: &str, key: &str, value: &str) -> Result<(), Error> {
        let full = self.full_name(path);
        let mut state = self.lock();
        state.count("zfs set");
        let dataset = state.dataset_mut(path, &full)?;
        dataset.props.insert(key.to_string(), value.to_string());
        // Setting a real mountpoint remounts the dataset there; `none`
        // unmounts it.
        if key == "mountpoint" {
            dataset.mounted = value != "none" && value != "legacy";
        }
        Ok(())
    }

    fn rename(&self, source: &str, dest: &str) -> Result<(), Error> {
        let full_source = self.full_name(source);
        let mut state = self.lock();
        state.count("zfs rename");
        if !state.datasets.contains_key(source) {
            return Err(Error::not_found(&full_source));
        }
        if state.datasets.contains_key(dest) {
            return Err(Error::zfs(format!(
                "cannot rename '{full_source}': dataset already exists"
            )));
        }

        state.ensure_parents(dest);

        let mut moves = vec![(source.to_string(), dest.to_string())];
        let child_prefix = format!("{source}/");
        for name in Self::children_of(&state, source) {
            let suffix = name[child_prefix.len() - 1..].to_string();
            moves.push((name, format!("{dest}{suffix}")));
        }

        for (old, new) in &moves {
            if let Some(dataset) = state.datasets.remove(old) {
                state.datasets.insert(new.clone(), dataset);
            }
        }

        // Clone origins track their snapshot across renames.
        for (old, new) in &moves {
            let old_at = format!("{old}@");
            for dataset in state.datasets.values_mut() {
                let rewritten = dataset
                    .origin
                    .as_deref()
                    .and_then(|origin| origin.strip_prefix(&old_at))
                    .map(|snap| format!("{new}@{snap}"));
                if rewritten.is_some() {
                    dataset.origin = rewritten;
                }
            }
        }
        Ok(())
    }

    fn clone_dataset(
        &self,
        source: &str,
        snap: &str,
        dest: &str,
        mountpoint: &Path,
    ) -> Result<(), Error> {
        let full_snap = format!("{}@{}", self.full_name(source), snap);
        let mut state = self.lock();
        state.count("zfs clone");

        let contents = {
            let dataset = state.dataset(source, &full_snap)?;
            match dataset.snapshots.iter().find(|s| s.name == snap) {
                Some(snapshot) => snapshot.contents.clone(),
                None => return Err(Error::not_found(&full_snap)),
            }
        };
        if state.datasets.contains_key(dest) {
            return Err(Error::zfs(format!(
                "cannot create '{}': dataset already exists",
                self.full_name(dest)
            )));
        }
        state.ensure_parents(dest);

        let created = state.tick();
        let mut dataset = Dataset {
            created,
            contents,
            origin: Some(format!("{source}@{snap}")),
            mounted: true,
            ..Default::default()
        };
        dataset
            .props
            .insert("mountpoint".into(), mountpoint.display().to_string());
        state.datasets.insert(dest.to_string(), dataset);
        Ok(())
    }

    fn mount(&self, path: &str) -> Result<(), Error> {
        let full = self.full_name(path);
        let mut state = self.lock();
        state.count("zfs mount");
        let dataset = state.dataset_mut(path, &full)?;
        let mountpoint = dataset
            .props
            .get("mountpoint")
            .cloned()
            .unwrap_or_else(|| "none".to_string());
        if mountpoint == "none" || mountpoint == "legacy" {
            return Err(Error::zfs(format!(
                "cannot mount '{full}': no mountpoint set"
            )));
        }
        if dataset.mounted {
            return Err(Error::zfs(format!(
                "cannot mount '{full}': filesystem already mounted"
            )));
        }
        dataset.mounted = true;
        Ok(())
    }

    fn unmount(&self, path: &str) -> Result<(), Error> {
        let full = self.full_name(path);
        let mut state = self.lock();
        state.count("zfs unmount");
        let dataset = state.dataset_mut(path, &full)?;
        if !dataset.mounted {
            return Err(Error::zfs(format!(
                "cannot unmount '{full}': not currently mounted"
            )));
        }
        dataset.mounted = false;
        Ok(())
    }

    fn snapshot_create(&self, path: &str, name: &str) -> Result<(), Error> {
        let full = self.full_name(path);
        let mut state = self.lock();
        state.count("zfs snapshot");
        state.dataset(path, &full)?;

        let mut targets = Self::children_of(&state, path);
        targets.insert(0, path.to_string());
        for target in &targets {
            let exists = state.datasets[target]
                .snapshots
                .iter()
                .any(|s| s.name == name);
            if exists {
                return Err(Error::zfs(format!(
                    "cannot create snapshot '{full}@{name}': snapshot already exists"
                )));
            }
        }
        for target in targets {
            let created = state.tick();
            let contents = state.datasets[&target].contents.clone();
            if let Some(dataset) = state.datasets.get_mut(&target) {
                dataset.snapshots.push(Snapshot {
                    name: name.to_string(),
                    contents,
                    created,
                });
            }
        }
        Ok(())
    }

    fn snapshot_destroy(&self, path: &str, name: &str) -> Result<(), Error> {
        self.destroy(&format!("{path}@{name}"))
    }

    fn snapshot_rename(&self, path: &str, old: &str, new: &str) -> Result<(), Error> {
        let full = self.full_name(path);
        let mut state = self.lock();
        state.count("zfs rename");
        state.dataset(path, &full)?;

        let mut targets = Self::children_of(&state, path);
        targets.insert(0, path.to_string());
        let mut found = false;
        for target in &targets {
            let target_name = target.clone();
            if let Some(dataset) = state.datasets.get_mut(&target_name) {
                if let Some(snapshot) =
                    dataset.snapshots.iter_mut().find(|s| s.name == old)
                {
                    snapshot.name = new.to_string();
                    found = true;
                }
            }
            // Clone origins follow the snapshot rename.
            let old_origin = format!("{target}@{old}");
            let new_origin = format!("{target}@{new}");
            for dataset in state.datasets.values_mut() {
                if dataset.origin.as_deref() == Some(old_origin.as_str()) {
                    dataset.origin = Some(new_origin.clone());
                }
            }
        }
        if !found {
            return Err(Error::not_found(&format!("{full}@{old}")));
        }
        Ok(())
    }

    fn rollback(&self, path: &str, name: &str) -> Result<(), Error> {
        let full = self.full_name(path);
        let mut state = self.lock();
        state.count("zfs rollback");
        let dataset = state.dataset_mut(path, &full)?;

        match dataset.snapshots.last() {
            Some(last) if last.name == name => {
                dataset.contents = last.contents.clone();
                Ok(())
            }
            Some(_) if dataset.snapshots.iter().any(|s| s.name == name) => {
                Err(Error::zfs(format!(
                    "cannot rollback to '{full}@{name}': more recent snapshots exist"
                )))
            }
            _ => Err(Error::not_found(&format!("{full}@{name}"))),
        }
    }

    fn list_subvolumes(&self, path: &str) -> Result<Vec<String>, Error> {
        let full = self.full_name(path);
        let state = self.lock();
        if path.is_empty() {
            return Ok(state
                .datasets
                .keys()
                .filter(|name| !name.is_empty())
                .cloned()
                .collect());
        }
        state.dataset(path, &full)?;
        Ok(Self::children_of(&state, path))
    }

    fn list_snapshots(&self, path: &str) -> Result<Vec<String>, Error> {
        let full = self.full_name(path);
        let state = self.lock();
        let dataset = state.dataset(path, &full)?;
        Ok(dataset.snapshots.iter().map(|s| s.name.clone()).collect())
    }

    fn is_mount_point(&self, path: &Path) -> bool {
        let state = self.lock();
        state.datasets.values().any(|dataset| {
            dataset.mounted
                && dataset
                    .props
                    .get("mountpoint")
                    .map(|mountpoint| Path::new(mountpoint) == path)
                    .unwrap_or(false)
        })
    }

    fn send(
        &self,
        path: &str,
        snap: &str,
        parent: Option<&str>,
        conn: &mut dyn Write,
        progress: &mut dyn FnMut(u64),
    ) -> Result<(), Error> {
        let full_snap = format!("{}@{}", self.full_name(path), snap);
        let payload = {
            let mut state = self.lock();
            state.count("zfs send");
            let dataset = state.dataset(path, &full_snap)?;
            if let Some(parent) = parent {
                if !dataset.snapshots.iter().any(|s| s.name == parent) {
                    return Err(Error::not_found(&format!(
                        "{}@{}",
                        self.full_name(path),
                        parent
                    )));
                }
            }
            match dataset.snapshots.iter().find(|s| s.name == snap) {
                Some(snapshot) => snapshot.contents.clone(),
                None => return Err(Error::not_found(&full_snap)),
            }
        };

        let header = format!("ZSTREAM {path}@{snap} {}\n", payload.len());
        conn.write_all(header.as_bytes())
            .and_then(|_| conn.write_all(payload.as_bytes()))
            .map_err(|err| Error::transport(format!("writing send stream: {err}")))?;
        progress(payload.len() as u64);
        Ok(())
    }

    fn recv(
        &self,
        target: &str,
        conn: &mut dyn Read,
        progress: &mut dyn FnMut(u64),
    ) -> Result<(), Error> {
        // One frame per stream: a header line, then exactly `len` bytes.
        let mut header = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = conn
                .read(&mut byte)
                .map_err(|err| Error::transport(format!("reading recv stream: {err}")))?;
            if n == 0 {
                return Err(Error::transport("stream closed before header"));
            }
            if byte[0] == b'\n' {
                break;
            }
            header.push(byte[0]);
        }
        let header = String::from_utf8_lossy(&header).into_owned();
        let mut fields = header.split_whitespace();
        let (stream_name, len) = match (fields.next(), fields.next(), fields.next()) {
            (Some("ZSTREAM"), Some(name), Some(len)) => {
                let len: usize = len
                    .parse()
                    .map_err(|_| Error::transport(format!("malformed stream header: {header}")))?;
                (name.to_string(), len)
            }
            _ => return Err(Error::transport(format!("malformed stream header: {header}"))),
        };
        let mut payload = vec![0u8; len];
        conn.read_exact(&mut payload)
            .map_err(|err| Error::transport(format!("reading recv stream: {err}")))?;
        let payload = String::from_utf8_lossy(&payload).into_owned();

        let (fs, explicit_snap) = match Self::split_snapshot(target) {
            Some((fs, snap)) => (fs, Some(snap)),
            None => (target, None),
        };
        let snap_name = match explicit_snap {
            Some(snap) => snap.to_string(),
            None => stream_name
                .split_once('@')
                .map(|(_, snap)| snap.to_string())
                .unwrap_or(stream_name),
        };

        let mut state = self.lock();
        state.count("zfs receive");
        if let Some(dataset) = state.datasets.get(fs) {
            if dataset.mounted {
                return Err(Error::zfs(format!(
                    "cannot receive into '{}': destination is busy",
                    self.full_name(fs)
                )));
            }
        } else {
            let created = state.tick();
            state.datasets.insert(
                fs.to_string(),
                Dataset {
                    created,
                    ..Default::default()
                },
            );
        }

        let created = state.tick();
        let dataset = state.datasets.get_mut(fs).unwrap();
        dataset.contents = payload.clone();
        dataset.snapshots.retain(|s| s.name != snap_name);
        dataset.snapshots.push(Snapshot {
            name: snap_name,
            contents: payload,
            created,
        });
        progress(len as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emulator() -> EmulatorZfs {
        let emulator = EmulatorZfs::new("p");
        emulator.pool_create("p", "/dev/sdz").unwrap();
        emulator
    }

    #[test]
    fn test_emulated_create_and_destroy() {
        let zfs = emulator();
        zfs.create("containers/c1").unwrap();
        assert!(zfs.exists("containers/c1"));
        // `-p` materialized the parent.
        assert!(zfs.exists("containers"));

        let result = zfs.create("containers/c1");
        assert!(matches!(result, Err(Error::Zfs { .. })));

        zfs.destroy("containers/c1").unwrap();
        assert!(!zfs.exists("containers/c1"));
        assert!(matches!(
            zfs.destroy("containers/c1"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_emulated_mount_state() {
        let zfs = emulator();
        zfs.create("custom/v1").unwrap();

        // No mountpoint yet.
        assert!(zfs.mount("custom/v1").is_err());

        zfs.set("custom/v1", "mountpoint", "/mnt/v1").unwrap();
        assert!(zfs.mounted("custom/v1"));
        assert!(zfs.is_mount_point(Path::new("/mnt/v1")));

        zfs.unmount("custom/v1").unwrap();
        assert!(!zfs.is_mount_point(Path::new("/mnt/v1")));
        assert!(zfs.unmount("custom/v1").is_err());

        zfs.mount("custom/v1").unwrap();
        assert!(zfs.mounted("custom/v1"));
    }

    #[test]
    fn test_emulated_clone_tracks_origin() {
        let zfs = emulator();
        zfs.create("images/abc").unwrap();
        zfs.snapshot_create("images/abc", "readonly").unwrap();
        zfs.clone_dataset(
            "images/abc",
            "readonly",
            "containers/c1",
            Path::new("/mnt/c1"),
        )
        .unwrap();

        assert_eq!(
            zfs.get("containers/c1", "origin").unwrap(),
            "p/images/abc@readonly"
        );
        assert_eq!(
            zfs.get("images/abc@readonly", "clones").unwrap(),
            "p/containers/c1"
        );

        // The origin snapshot is pinned by its clone.
        assert!(zfs.snapshot_destroy("images/abc", "readonly").is_err());
        assert!(zfs.destroy("images/abc").is_err());

        zfs.destroy("containers/c1").unwrap();
        assert_eq!(zfs.get("images/abc@readonly", "clones").unwrap(), "-");
        zfs.destroy("images/abc").unwrap();
    }

    #[test]
    fn test_emulated_rename_moves_children_and_origins() {
        let zfs = emulator();
        zfs.create("containers/c1").unwrap();
        zfs.create("containers/c1/sub").unwrap();
        zfs.snapshot_create("containers/c1", "snapshot-s1").unwrap();
        zfs.clone_dataset(
            "containers/c1",
            "snapshot-s1",
            "containers/c2",
            Path::new("/mnt/c2"),
        )
        .unwrap();

        zfs.rename("containers/c1", "deleted/containers/g1").unwrap();
        assert!(!zfs.exists("containers/c1"));
        assert!(zfs.exists("deleted/containers/g1"));
        assert!(zfs.exists("deleted/containers/g1/sub"));
        assert_eq!(
            zfs.get("containers/c2", "origin").unwrap(),
            "p/deleted/containers/g1@snapshot-s1"
        );
    }

    #[test]
    fn test_emulated_snapshot_ordering_and_rollback() {
        let zfs = emulator();
        zfs.create("containers/c1").unwrap();
        zfs.set_contents("containers/c1", "v1");
        zfs.snapshot_create("containers/c1", "snapshot-s1").unwrap();
        zfs.set_contents("containers/c1", "v2");
        zfs.snapshot_create("containers/c1", "snapshot-s2").unwrap();
        zfs.set_contents("containers/c1", "v3");

        assert_eq!(
            zfs.list_snapshots("containers/c1").unwrap(),
            vec!["snapshot-s1", "snapshot-s2"]
        );

        // Only the most recent snapshot can be rolled back to.
        assert!(zfs.rollback("containers/c1", "snapshot-s1").is_err());
        zfs.rollback("containers/c1", "snapshot-s2").unwrap();
        assert_eq!(zfs.contents("containers/c1").unwrap(), "v2");
    }

    #[test]
    fn test_emulated_send_recv_roundtrip() {
        let source = emulator();
        source.create("containers/c1").unwrap();
        source.set_contents("containers/c1", "payload-1");
        source.snapshot_create("containers/c1", "snapshot-s1").unwrap();

        let mut buf = Vec::new();
        source
            .send("containers/c1", "snapshot-s1", None, &mut buf, &mut |_| {})
            .unwrap();

        let sink = EmulatorZfs::new("q");
        sink.pool_create("q", "/dev/sdy").unwrap();
        let mut reader = &buf[..];
        sink.recv("containers/c1@snapshot-s1", &mut reader, &mut |_| {})
            .unwrap();

        assert_eq!(sink.contents("containers/c1").unwrap(), "payload-1");
        assert_eq!(
            sink.list_snapshots("containers/c1").unwrap(),
            vec!["snapshot-s1"]
        );
    }
}
