//! Publisher side of a channel: `Channel::create` plus the hot-path
//! `publish()`. Grounded on the teacher's `writer.rs` (`Queue`/`QueueWriter`
//! split between shared state and a handle held by the single writer) but
//! generalised from an append-only log to the spec's double-buffer
//! drop-to-latest handoff.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::control::{ControlFile, CTRL_VERSION};
use super::discovery;
use super::header::{FrameHeader, FRAME_HEADER_SIZE};
use super::lockfile::PublisherLock;
use super::notifier::WriterNotifier;
use crate::{Error, Result};

pub struct SlotInfo {
    pub index: u32,
    pub pid: u32,
    pub active: bool,
    pub last_seen_seq: u64,
}

pub struct ChannelInfo {
    pub name: String,
    pub publisher_pid: u32,
    pub version: u32,
    pub max_payload: u64,
    pub metadata: Vec<u8>,
    pub slots: Vec<SlotInfo>,
}

pub struct Channel {
    name: String,
    control: Mutex<ControlFile>,
    notifier: WriterNotifier,
    next_seq: AtomicU64,
    _lock: PublisherLock,
}

pub struct ChannelPublisher {
    channel: Arc<Channel>,
}

impl Channel {
    /// Fails with [`Error::PublisherAlreadyActive`] if another process
    /// already holds `name`'s publisher lock.
    pub fn create(root: &Path, name: &str, max_payload_bytes: u64, slot_count: u32, metadata: &[u8]) -> Result<Arc<Self>> {
        let dir = discovery::channel_dir(root, name)?;
        std::fs::create_dir_all(&dir)?;
        let lock = PublisherLock::acquire(&dir.join("publisher.lock"))?;
        let control = ControlFile::create(&dir.join("control.meta"), slot_count, max_payload_bytes, metadata)?;
        let notifier = WriterNotifier::new(&dir.join("readers"))?;
        discovery::mark_ready(&dir)?;
        Ok(Arc::new(Self {
            name: name.to_string(),
            control: Mutex::new(control),
            notifier,
            next_seq: AtomicU64::new(1),
            _lock: lock,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publisher(self: &Arc<Self>) -> ChannelPublisher {
        ChannelPublisher { channel: Arc::clone(self) }
    }

    pub fn info(&self) -> Result<ChannelInfo> {
        let control = self.control.lock().map_err(|_| Error::Corrupt("channel control lock poisoned"))?;
        let mut slots = Vec::new();
        for index in 0..control.slot_count() {
            let rec = control.slot_record(index)?;
            slots.push(SlotInfo {
                index,
                pid: rec.pid.load(Ordering::Acquire),
                active: rec.active.load(Ordering::Acquire) != 0,
                last_seen_seq: rec.last_seen_seq.load(Ordering::Acquire),
            });
        }
        Ok(ChannelInfo {
            name: self.name.clone(),
            publisher_pid: control.publisher_pid(),
            version: CTRL_VERSION,
            max_payload: control.max_payload(),
            metadata: control.metadata()?.to_vec(),
            slots,
        })
    }
}

impl ChannelPublisher {
    /// Writes `payload` into the next generation of the double buffer, then
    /// makes it visible with one release store and wakes every live
    /// subscriber. Never blocks on a subscriber: `notify_all` swallows
    /// per-fd write errors.
    pub fn publish(&self, payload: &[u8], type_str: &str, epoch_s: u64, epoch_us: u32) -> Result<()> {
        let mut control = self.channel.control.lock().map_err(|_| Error::Corrupt("channel control lock poisoned"))?;
        let max_payload = control.max_payload();
        if payload.len() as u64 > max_payload {
            return Err(Error::PayloadTooLarge { len: payload.len(), max: max_payload as usize });
        }

        let seq = self.channel.next_seq.fetch_add(1, Ordering::Relaxed);
        let buffer_index = (seq % 2) as usize;
        let offset = control.layout().buffer_offset[buffer_index];
        let checksum = FrameHeader::crc32(payload);
        let header = FrameHeader::new(seq, epoch_s, epoch_us, payload.len() as u32, checksum, type_str)?;

        let mmap = control.mmap_mut();
        mmap.range_mut(offset, FRAME_HEADER_SIZE)?.copy_from_slice(&header.to_bytes());
        mmap.range_mut(offset + FRAME_HEADER_SIZE, payload.len())?.copy_from_slice(payload);

        std::sync::atomic::fence(Ordering::Release);
        control.block().published_seq.store(seq, Ordering::Release);
        drop(control);

        self.channel.notifier.notify_all()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}

pub(crate) fn lock_path(dir: &Path) -> PathBuf {
    dir.join("publisher.lock")
}
