//! Subscriber side: `Subscription::open` claims a free slot, `peek`/`receive`
//! read the double buffer with the seqlock retry described in the channel's
//! concurrency protocol. Grounded on the teacher's `reader.rs` (`QueueReader`
//! reading a self-describing record under a lock and persisting its own
//! read-position sidecar) generalised to drop-to-latest: there is no
//! persisted read offset here, only the in-memory `last_seen_seq`, since a
//! subscriber that restarts rejoins at the current frame, not where it left
//! off.

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use super::control::{ControlFile, SubscriberSlotRecord};
use super::discovery;
use super::notifier::ReaderNotifier;
use crate::{Error, Result};

pub struct Subscription {
    control: ControlFile,
    notifier: ReaderNotifier,
    slot_index: u32,
    last_seen_seq: u64,
    channel_dir: PathBuf,
}

impl Subscription {
    pub fn open(root: &std::path::Path, name: &str) -> Result<Self> {
        let dir = discovery::channel_dir(root, name)?;
        discovery::wait_ready(&dir)?;
        let control = ControlFile::open(&dir.join("control.meta"))?;
        let slot_index = claim_slot(&control)?;
        let notifier = ReaderNotifier::new(&dir.join("readers"), slot_index)?;

        let rec = control.slot_record(slot_index)?;
        let last_seen_seq = control.published_seq();
        rec.pid.store(std::process::id(), Ordering::Release);
        rec.last_seen_seq.store(last_seen_seq, Ordering::Release);

        Ok(Self { control, notifier, slot_index, last_seen_seq, channel_dir: dir })
    }

    /// Usable with the reactor's read set; becomes readable whenever the
    /// publisher advances the sequence.
    pub fn fd(&self) -> RawFd {
        self.notifier.fd()
    }

    pub fn name_dir(&self) -> &PathBuf {
        &self.channel_dir
    }

    /// Clears any pending wakeup without blocking; for reactor-driven callers
    /// that already know the fd is readable and have just consumed the
    /// latest frame via [`Self::peek`] or [`Self::receive`].
    pub fn drain(&self) -> Result<()> {
        self.notifier.drain()
    }

    /// Non-destructive read of the current slot. `None` until the first
    /// frame is published.
    pub fn peek(&self) -> Result<Option<(Vec<u8>, String, u64, u32)>> {
        let seq = self.control.published_seq();
        if seq == 0 {
            return Ok(None);
        }
        self.read_seqlocked(seq)
    }

    /// Blocks until a frame newer than `last_seen_seq` is visible, then
    /// returns it. If the publisher produced several frames meanwhile, only
    /// the most recent is returned (drop-to-latest).
    pub fn receive(&mut self) -> Result<(Vec<u8>, String, u64, u32)> {
        loop {
            let seq = self.control.published_seq();
            if seq > self.last_seen_seq {
                if let Some(frame) = self.read_seqlocked(seq)? {
                    self.last_seen_seq = seq;
                    self.slot_record()?.last_seen_seq.store(seq, Ordering::Release);
                    return Ok(frame);
                }
                continue;
            }
            if self.control.publisher_is_gone() {
                return Err(Error::PublisherGone);
            }
            self.notifier.wait()?;
        }
    }

    fn slot_record(&self) -> Result<&SubscriberSlotRecord> {
        self.control.slot_record(self.slot_index)
    }

    /// Reads `(FrameHeader, payload)` for generation `seq`, then re-checks
    /// `published_seq`: if it changed mid-read, the publisher overwrote the
    /// buffer we just read and we retry against the new generation.
    fn read_seqlocked(&self, seq: u64) -> Result<Option<(Vec<u8>, String, u64, u32)>> {
        let buffer_index = (seq % 2) as usize;
        let header = self.control.frame_header(buffer_index)?;
        let payload = self.control.frame_payload(buffer_index, header.length as usize)?.to_vec();
        std::sync::atomic::fence(Ordering::Acquire);

        let after = self.control.published_seq();
        if after == seq {
            header.validate_crc(&payload)?;
            return Ok(Some((payload, header.type_str().to_string(), header.epoch_s, header.epoch_us)));
        }
        if after < seq {
            return Ok(None);
        }
        self.read_seqlocked(after)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(rec) = self.control.slot_record(self.slot_index) {
            rec.active.store(0, Ordering::Release);
            rec.pid.store(0, Ordering::Release);
        }
    }
}

fn claim_slot(control: &ControlFile) -> Result<u32> {
    for index in 0..control.slot_count() {
        let rec = control.slot_record(index)?;
        if rec.active.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            return Ok(index);
        }
    }
    Err(Error::NoFreeSlot)
}
