//! ZFS command-line adapter.
//!
//! All ZFS effects in the driver funnel through the [`Zfs`] trait. The
//! production implementation shells out to `zfs`/`zpool`; tests and the
//! emulator client substitute the in-memory backend from `mock`.
//!
//! Dataset arguments are relative to the pool (or to the user-supplied
//! dataset when the pool was initialized from one); this adapter is the only
//! place that knows about the prefixing rule.

use std::ffi::CString;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, error};

use super::Error;

/// Retry budget for operations the kernel can briefly refuse while it still
/// holds references (open fds, lingering mounts): roughly ten seconds.
const BUSY_RETRIES: u32 = 20;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Chunk size used when forwarding `zfs send`/`recv` payloads.
const STREAM_CHUNK: usize = 4 * 1024 * 1024;

pub trait Zfs: Send + Sync {
    /// The pool or dataset name all relative paths are resolved under.
    fn prefix(&self) -> &str;

    /// Confirm that `name` is a ZFS filesystem.
    fn pool_check(&self, name: &str) -> Result<(), Error>;

    /// `zpool create` over the given vdev, with the mountpoint disabled and
    /// compression on.
    fn pool_create(&self, name: &str, vdev: &str) -> Result<(), Error>;

    /// `zpool import` of a previously created pool from its source path.
    fn pool_import(&self, source: &str, name: &str) -> Result<(), Error>;

    fn pool_destroy(&self, name: &str) -> Result<(), Error>;

    fn create(&self, path: &str) -> Result<(), Error>;

    /// Recursively destroy a dataset, detaching a live mountpoint first.
    /// Retried while the kernel holds references.
    fn destroy(&self, path: &str) -> Result<(), Error>;

    fn exists(&self, path: &str) -> bool;

    fn get(&self, path: &str, key: &str) -> Result<String, Error>;

    /// Where a property value comes from (`local`, `default`, `inherited`).
    fn property_source(&self, path: &str, key: &str) -> Result<String, Error>;

    fn set(&self, path: &str, key: &str, value: &str) -> Result<(), Error>;

    /// Rename a dataset. ZFS can recurse successfully yet still report a
    /// descendant error, so a failed invocation that nevertheless moved the
    /// dataset counts as success.
    fn rename(&self, source: &str, dest: &str) -> Result<(), Error>;

    fn clone_dataset(
        &self,
        source: &str,
        snap: &str,
        dest: &str,
        mountpoint: &Path,
    ) -> Result<(), Error>;

    fn mount(&self, path: &str) -> Result<(), Error>;

    fn unmount(&self, path: &str) -> Result<(), Error>;

    fn snapshot_create(&self, path: &str, name: &str) -> Result<(), Error>;

    fn snapshot_destroy(&self, path: &str, name: &str) -> Result<(), Error>;

    fn snapshot_rename(&self, path: &str, old: &str, new: &str) -> Result<(), Error>;

    fn rollback(&self, path: &str, name: &str) -> Result<(), Error>;

    /// All filesystems below `path`, excluding `path` itself, as relative
    /// names.
    fn list_subvolumes(&self, path: &str) -> Result<Vec<String>, Error>;

    /// Snapshot names (the part after `@`) directly on `path`, in creation
    /// order.
    fn list_snapshots(&self, path: &str) -> Result<Vec<String>, Error>;

    fn is_mount_point(&self, path: &Path) -> bool;

    /// Stream `path@snap` into `conn`, incrementally from `parent` when
    /// given. The payload is opaque and forwarded with byte fidelity.
    fn send(
        &self,
        path: &str,
        snap: &str,
        parent: Option<&str>,
        conn: &mut dyn Write,
        progress: &mut dyn FnMut(u64),
    ) -> Result<(), Error>;

    /// Receive one stream from `conn` into `target` (`-F -u`): the target is
    /// forced back to the stream's ancestry and left unmounted.
    fn recv(
        &self,
        target: &str,
        conn: &mut dyn Read,
        progress: &mut dyn FnMut(u64),
    ) -> Result<(), Error>;

    /// The full dataset name for a relative path.
    fn full_name(&self, path: &str) -> String {
        if path.is_empty() {
            return self.prefix().to_string();
        }
        format!("{}/{}", self.prefix(), path)
    }

    /// Strip the pool prefix from a full dataset name.
    fn relative_name<'a>(&self, name: &'a str) -> &'a str {
        match name.strip_prefix(self.prefix()) {
            Some(rest) => rest.strip_prefix('/').unwrap_or(rest),
            None => name,
        }
    }
}

/// Adapter backed by the `zfs` and `zpool` command-line tools.
pub struct ZfsCli {
    prefix: String,
}

impl ZfsCli {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Whether the `zfs` tool can be executed at all.
    pub fn available() -> bool {
        Command::new("zfs")
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }
}

/// The loaded ZFS kernel module version.
pub fn module_version() -> Result<String, Error> {
    let version = fs::read_to_string("/sys/module/zfs/version")
        .map_err(|_| Error::zfs("Could not determine ZFS module version"))?;
    Ok(version.trim().to_string())
}

/// Best-effort `modprobe`; pool import may need the module loaded first.
pub fn load_module(name: &str) -> Result<(), Error> {
    run("modprobe", &[name.to_string()], "Failed to load kernel module")?;
    Ok(())
}

/// Run a command once; the inner `Err` carries the first diagnostic line of
/// a nonzero exit.
fn run_raw(program: &str, args: &[String]) -> Result<Result<String, String>, std::io::Error> {
    debug!(program, ?args, "running");
    let output = Command::new(program).args(args).output()?;
    if output.status.success() {
        return Ok(Ok(String::from_utf8_lossy(&output.stdout).into_owned()));
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stderr
        .lines()
        .chain(stdout.lines())
        .find(|line| !line.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("exit status {:?}", output.status.code()));
    Ok(Err(line))
}

fn map_failure(context: &str, line: &str) -> Error {
    if line.contains("does not exist") {
        let name = line.split('\'').nth(1).unwrap_or(line);
        return Error::not_found(name);
    }
    Error::zfs(format!("{context}: {line}"))
}

fn run(program: &str, args: &[String], context: &str) -> Result<String, Error> {
    match run_raw(program, args)? {
        Ok(output) => Ok(output),
        Err(line) => {
            debug!(program, %line, "command failed");
            Err(map_failure(context, &line))
        }
    }
}

/// Retry wrapper for destroy/rollback/mount/unmount, which can fail while
/// the kernel still holds transient references.
fn try_run(program: &str, args: &[String], name: &str) -> Result<String, Error> {
    let mut last = String::new();
    for _ in 0..BUSY_RETRIES {
        match run_raw(program, args)? {
            Ok(output) => return Ok(output),
            Err(line) => {
                // A missing dataset is not going to appear by waiting.
                if line.contains("does not exist") {
                    let quoted = line.split('\'').nth(1).unwrap_or(&line);
                    return Err(Error::not_found(quoted));
                }
                last = line;
            }
        }
        thread::sleep(BUSY_RETRY_DELAY);
    }

    error!(program, stderr = %last, "command still failing after retries");
    Err(Error::Busy {
        name: name.to_string(),
        message: last,
    })
}

/// Lazy-detach a mountpoint so a dataset with lingering users can still be
/// destroyed.
fn detach_unmount(mountpoint: &str) -> Result<(), Error> {
    let path = CString::new(mountpoint)
        .map_err(|_| Error::invalid_name(mountpoint, "embedded NUL in mountpoint"))?;
    let rc = unsafe { libc::umount2(path.as_ptr(), libc::MNT_DETACH) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        error!(mountpoint, %err, "detaching unmount failed");
        return Err(Error::Io(err));
    }
    Ok(())
}

/// Parse one mount-table line into its mountpoint field, undoing the octal
/// escapes `/proc` applies to spaces and the like.
fn mount_table_entry(line: &str) -> Option<String> {
    let field = line.split_whitespace().nth(1)?;
    let mut chars = field.chars().peekable();
    let mut out = String::with_capacity(field.len());
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let mut oct = String::new();
        for _ in 0..3 {
            match chars.peek() {
                Some(d) if d.is_digit(8) => oct.push(chars.next().unwrap()),
                _ => break,
            }
        }
        match u8::from_str_radix(&oct, 8) {
            Ok(value) if oct.len() == 3 => out.push(value as char),
            _ => {
                out.push('\\');
                out.push_str(&oct);
            }
        }
    }
    Some(out)
}

fn proc_mounts_contains(mounts: &str, path: &Path) -> bool {
    mounts
        .lines()
        .filter_map(mount_table_entry)
        .any(|mountpoint| Path::new(&mountpoint) == path)
}

fn drain_stderr(child: &mut Child) -> String {
    let mut buf = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut buf);
    }
    buf.lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .to_string()
}

impl Zfs for ZfsCli {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn pool_check(&self, name: &str) -> Result<(), Error> {
        let output = run(
            "zfs",
            &[
                "get".into(),
                "type".into(),
                "-H".into(),
                "-o".into(),
                "value".into(),
                name.into(),
            ],
            "Failed to query the ZFS pool",
        )?;
        let kind = output.lines().next().unwrap_or("").to_string();
        if kind != "filesystem" {
            return Err(Error::UnsupportedPoolType { kind });
        }
        Ok(())
    }

    fn pool_create(&self, name: &str, vdev: &str) -> Result<(), Error> {
        run(
            "zpool",
            &[
                "create".into(),
                name.into(),
                vdev.into(),
                "-f".into(),
                "-m".into(),
                "none".into(),
                "-O".into(),
                "compression=on".into(),
            ],
            "Failed to create the ZFS pool",
        )?;
        Ok(())
    }

    fn pool_import(&self, source: &str, name: &str) -> Result<(), Error> {
        run(
            "zpool",
            &["import".into(), source.into(), name.into()],
            "Unable to import the ZFS pool",
        )?;
        Ok(())
    }

    fn pool_destroy(&self, name: &str) -> Result<(), Error> {
        run(
            "zpool",
            &["destroy".into(), "-f".into(), name.into()],
            "Failed to delete the ZFS pool",
        )?;
        Ok(())
    }

    fn create(&self, path: &str) -> Result<(), Error> {
        let full = self.full_name(path);
        run(
            "zfs",
            &["create".into(), "-p".into(), full],
            "Failed to create ZFS filesystem",
        )?;
        Ok(())
    }

    fn destroy(&self, path: &str) -> Result<(), Error> {
        let mountpoint = self.get(path, "mountpoint")?;
        if mountpoint != "none" && self.is_mount_point(Path::new(&mountpoint)) {
            detach_unmount(&mountpoint)?;
        }

        let full = self.full_name(path);
        try_run("zfs", &["destroy".into(), "-r".into(), full.clone()], &full)?;
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        match self.get(path, "name") {
            Ok(name) => name == self.full_name(path),
            Err(_) => false,
        }
    }

    fn get(&self, path: &str, key: &str) -> Result<String, Error> {
        let output = run(
            "zfs",
            &[
                "get".into(),
                "-H".into(),
                "-p".into(),
                "-o".into(),
                "value".into(),
                key.into(),
                self.full_name(path),
            ],
            "Failed to get ZFS config",
        )?;
        Ok(output.trim_end_matches('\n').to_string())
    }

    fn property_source(&self, path: &str, key: &str) -> Result<String, Error> {
        let output = run(
            "zfs",
            &[
                "get".into(),
                key.into(),
                "-H".into(),
                "-o".into(),
                "source".into(),
                self.full_name(path),
            ],
            "Failed to get ZFS config source",
        )?;
        Ok(output.trim().to_string())
    }

    fn set(&self, path: &str, key: &str, value: &str) -> Result<(), Error> {
        run(
            "zfs",
            &[
                "set".into(),
                format!("{key}={value}"),
                self.full_name(path),
            ],
            "Failed to set ZFS config",
        )?;
        Ok(())
    }

    fn rename(&self, source: &str, dest: &str) -> Result<(), Error> {
        let full_source = self.full_name(source);
        let full_dest = self.full_name(dest);

        let mut last = String::new();
        for _ in 0..BUSY_RETRIES {
            match run_raw(
                "zfs",
                &[
                    "rename".into(),
                    "-p".into(),
                    full_source.clone(),
                    full_dest.clone(),
                ],
            )? {
                Ok(_) => return Ok(()),
                Err(line) => last = line,
            }

            // The recursion may have done the rename despite the error.
            if !self.exists(source) && self.exists(dest) {
                return Ok(());
            }

            thread::sleep(BUSY_RETRY_DELAY);
        }

        error!(source = %full_source, stderr = %last, "zfs rename failed");
        Err(Error::Busy {
            name: full_source,
            message: last,
        })
    }

    fn clone_dataset(
        &self,
        source: &str,
        snap: &str,
        dest: &str,
        mountpoint: &Path,
    ) -> Result<(), Error> {
        run(
            "zfs",
            &[
                "clone".into(),
                "-p".into(),
                "-o".into(),
                format!("mountpoint={}", mountpoint.display()),
                format!("{}@{}", self.full_name(source), snap),
                self.full_name(dest),
            ],
            "Failed to clone the filesystem",
        )?;
        Ok(())
    }

    fn mount(&self, path: &str) -> Result<(), Error> {
        let full = self.full_name(path);
        try_run("zfs", &["mount".into(), full.clone()], &full)?;
        Ok(())
    }

    fn unmount(&self, path: &str) -> Result<(), Error> {
        let full = self.full_name(path);
        try_run("zfs", &["unmount".into(), full.clone()], &full)?;
        Ok(())
    }

    fn snapshot_create(&self, path: &str, name: &str) -> Result<(), Error> {
        run(
            "zfs",
            &[
                "snapshot".into(),
                "-r".into(),
                format!("{}@{}", self.full_name(path), name),
            ],
            "Failed to create ZFS snapshot",
        )?;
        Ok(())
    }

    fn snapshot_destroy(&self, path: &str, name: &str) -> Result<(), Error> {
        run(
            "zfs",
            &[
                "destroy".into(),
                "-r".into(),
                format!("{}@{}", self.full_name(path), name),
            ],
            "Failed to destroy ZFS snapshot",
        )?;
        Ok(())
    }

    fn snapshot_rename(&self, path: &str, old: &str, new: &str) -> Result<(), Error> {
        let full = self.full_name(path);
        run(
            "zfs",
            &[
                "rename".into(),
                "-r".into(),
                format!("{full}@{old}"),
                format!("{full}@{new}"),
            ],
            "Failed to rename ZFS snapshot",
        )?;
        Ok(())
    }

    fn rollback(&self, path: &str, name: &str) -> Result<(), Error> {
        let target = format!("{}@{}", self.full_name(path), name);
        try_run("zfs", &["rollback".into(), target.clone()], &target)?;
        Ok(())
    }

    fn list_subvolumes(&self, path: &str) -> Result<Vec<String>, Error> {
        let full = self.full_name(path);
        let output = run(
            "zfs",
            &[
                "list".into(),
                "-t".into(),
                "filesystem".into(),
                "-o".into(),
                "name".into(),
                "-H".into(),
                "-r".into(),
                full.clone(),
            ],
            "Failed to list ZFS filesystems",
        )?;

        Ok(output
            .lines()
            .filter(|entry| !entry.is_empty() && *entry != full)
            .map(|entry| self.relative_name(entry).to_string())
            .collect())
    }

    fn list_snapshots(&self, path: &str) -> Result<Vec<String>, Error> {
        let full = self.full_name(path.trim_end_matches('/'));
        let output = run(
            "zfs",
            &[
                "list".into(),
                "-t".into(),
                "snapshot".into(),
                "-o".into(),
                "name".into(),
                "-H".into(),
                "-d".into(),
                "1".into(),
                "-s".into(),
                "creation".into(),
                "-r".into(),
                full.clone(),
            ],
            "Failed to list ZFS snapshots",
        )?;

        Ok(output
            .lines()
            .filter(|entry| !entry.is_empty() && *entry != full)
            .filter_map(|entry| entry.split_once('@').map(|(_, snap)| snap.to_string()))
            .collect())
    }

    fn is_mount_point(&self, path: &Path) -> bool {
        match fs::read_to_string("/proc/self/mounts") {
            Ok(mounts) => proc_mounts_contains(&mounts, path),
            Err(_) => false,
        }
    }

    fn send(
        &self,
        path: &str,
        snap: &str,
        parent: Option<&str>,
        conn: &mut dyn Write,
        progress: &mut dyn FnMut(u64),
    ) -> Result<(), Error> {
        let full = self.full_name(path);
        let mut args = vec!["send".to_string(), format!("{full}@{snap}")];
        if let Some(parent) = parent {
            args.push("-i".to_string());
            args.push(format!("{full}@{parent}"));
        }

        debug!(?args, "zfs send");
        let mut child = Command::new("zfs")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::zfs("Failed to capture zfs send output"))?;

        let mut copied = Ok(());
        let mut total: u64 = 0;
        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            let n = match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    copied = Err(Error::Io(err));
                    break;
                }
            };
            if let Err(err) = conn.write_all(&buf[..n]) {
                copied = Err(Error::transport(format!("writing send stream: {err}")));
                break;
            }
            total += n as u64;
            progress(total);
        }

        let stderr = drain_stderr(&mut child);
        let status = child.wait()?;
        copied?;
        if !status.success() {
            error!(%stderr, "zfs send failed");
            return Err(Error::zfs(format!("Failed to send ZFS stream: {stderr}")));
        }
        Ok(())
    }

    fn recv(
        &self,
        target: &str,
        conn: &mut dyn Read,
        progress: &mut dyn FnMut(u64),
    ) -> Result<(), Error> {
        let full = self.full_name(target);
        debug!(target = %full, "zfs receive");
        let mut child = Command::new("zfs")
            .args(["receive", "-F", "-u", &full])
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::zfs("Failed to capture zfs receive input"))?;

        let mut copied = Ok(());
        let mut total: u64 = 0;
        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            let n = match conn.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    copied = Err(Error::transport(format!("reading recv stream: {err}")));
                    break;
                }
            };
            match stdin.write_all(&buf[..n]) {
                Ok(()) => {}
                // The ZFS stream is self-delimiting; recv exits once its
                // stream is complete and the pipe simply closes under us.
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => break,
                Err(err) => {
                    copied = Err(Error::Io(err));
                    break;
                }
            }
            total += n as u64;
            progress(total);
        }
        drop(stdin);

        let stderr = drain_stderr(&mut child);
        let status = child.wait()?;
        copied?;
        if !status.success() {
            error!(%stderr, "zfs recv failed");
            return Err(Error::zfs(format!(
                "Failed to receive ZFS stream: {stderr}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_and_relative_names() {
        let cli = ZfsCli::new("tank/sub");
        assert_eq!(cli.full_name("containers/c1"), "tank/sub/containers/c1");
        assert_eq!(cli.full_name(""), "tank/sub");
        assert_eq!(
            cli.relative_name("tank/sub/containers/c1"),
            "containers/c1"
        );
        assert_eq!(cli.relative_name("tank/sub"), "");
        assert_eq!(cli.relative_name("-"), "-");
        assert_eq!(cli.relative_name("other/x"), "other/x");
    }

    #[test]
    fn test_mount_table_parsing() {
        let mounts = "p/containers/c1 /var/lib/zstor/storage-pools/p/containers/c1 zfs rw 0 0\n\
                      tmpfs /run tmpfs rw 0 0\n\
                      p/custom/v /mnt/with\\040space zfs rw 0 0\n";
        assert!(proc_mounts_contains(
            mounts,
            Path::new("/var/lib/zstor/storage-pools/p/containers/c1")
        ));
        assert!(proc_mounts_contains(mounts, Path::new("/mnt/with space")));
        assert!(!proc_mounts_contains(mounts, Path::new("/mnt/other")));
    }

    #[test]
    fn test_failure_mapping() {
        let err = map_failure(
            "Failed to get ZFS config",
            "cannot open 'p/containers/x': dataset does not exist",
        );
        assert!(matches!(err, Error::NotFound { name } if name == "p/containers/x"));

        let err = map_failure("Failed to create ZFS filesystem", "permission denied");
        assert!(matches!(err, Error::Zfs { message }
            if message == "Failed to create ZFS filesystem: permission denied"));
    }
}
