//! Channel naming, listing and administrative purge/delete. Grounded on the
//! teacher's two-phase readiness handshake (`control::ControlFile`'s
//! `init_state` 0/1/2 spin) lifted up one level: here the handshake is "does
//! `control.meta` exist yet", with the finer-grained spin happening inside
//! `ControlFile::open` once it does.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use super::control::ControlFile;
use super::publisher::lock_path;
use crate::{Error, Result};

pub const CHANNEL_PREFIX: &str = "vt-";

pub fn channel_dir(root: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(Error::Config(format!("invalid channel name {name:?}")));
    }
    Ok(root.join(format!("{CHANNEL_PREFIX}{name}")))
}

pub fn mark_ready(dir: &Path) -> Result<()> {
    std::fs::write(dir.join("ready"), b"")?;
    Ok(())
}

pub fn is_ready(dir: &Path) -> bool {
    dir.join("control.meta").exists()
}

/// Polls for up to a second for a channel to come into existence. A fresh
/// publisher's `control.meta` appears via `rename`, so once it's visible it
/// is always a complete, valid segment.
pub fn wait_ready(dir: &Path) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(1);
    loop {
        if is_ready(dir) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "channel not found")));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Lists channel names under `root` (stripped of the `vt-` prefix) so a
/// separate listing utility (or the HTTP server's `/__` wildcard endpoint)
/// can enumerate them.
pub fn list(root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(stem) = entry.file_name().to_str().and_then(|s| s.strip_prefix(CHANNEL_PREFIX)) {
            if is_ready(&entry.path()) {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Clears subscriber slots whose recorded pid no longer exists.
pub fn purge_dead_subscribers(control: &ControlFile) -> Result<usize> {
    let mut purged = 0;
    for index in 0..control.slot_count() {
        let rec = control.slot_record(index)?;
        let pid = rec.pid.load(Ordering::Acquire);
        if pid == 0 {
            continue;
        }
        let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
        if !alive {
            rec.active.store(0, Ordering::Release);
            rec.pid.store(0, Ordering::Release);
            purged += 1;
        }
    }
    Ok(purged)
}

/// Removes a channel's directory. Safe only when no publisher currently
/// holds its lock file.
pub fn delete(root: &Path, name: &str) -> Result<()> {
    let dir = channel_dir(root, name)?;
    let lock = lock_path(&dir);
    if lock.exists() {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(&lock)?;
        let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if res != 0 {
            return Err(Error::PublisherAlreadyActive(dir));
        }
    }
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_names_with_path_separators() {
        let root = Path::new("/tmp");
        assert!(channel_dir(root, "a/b").is_err());
    }

    #[test]
    fn lists_only_ready_channels() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("vt-front")).unwrap();
        std::fs::write(tmp.path().join("vt-front").join("control.meta"), b"x").unwrap();
        std::fs::create_dir_all(tmp.path().join("vt-pending")).unwrap();
        let names = list(tmp.path()).unwrap();
        assert_eq!(names, vec!["front".to_string()]);
    }
}
