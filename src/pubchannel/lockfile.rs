//! Advisory exclusivity lock for the publisher role, ported from the
//! teacher's `writer_lock.rs`: an `flock(LOCK_EX | LOCK_NB)` held on a
//! sidecar file for as long as the process lives. We only need the
//! single-attempt form here — `ControlBlock::publisher_pid` plus
//! `kill(pid, 0)` (see `control::ControlFile::publisher_is_gone`) already
//! covers "is the recorded owner still alive", so we don't carry over the
//! teacher's `/proc/<pid>/stat` start-time comparison.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::{Error, Result};

pub struct PublisherLock {
    _file: File,
}

impl PublisherLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
        let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if res != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(Error::PublisherAlreadyActive(path.to_path_buf()));
            }
            return Err(Error::Io(err));
        }
        Ok(Self { _file: file })
    }
}
