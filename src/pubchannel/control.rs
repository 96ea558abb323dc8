//! Shared-memory layout for a channel segment: a cache-line-partitioned
//! control block, a fixed-size subscriber slot table, and a double buffer of
//! `(FrameHeader, payload)` slots. Grounded on the teacher's `control.rs`
//! (`ControlBlock`'s cold/reader-hot/writer-hot partitioning and two-phase
//! `init_state` handshake) generalised from "one segment, one writer offset"
//! to "one segment, two ping-ponged frame slots plus a subscriber table".

use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::header::{FrameHeader, FRAME_HEADER_SIZE};
use super::mmap::MmapFile;
use crate::{Error, Result};

pub const CTRL_MAGIC: u32 = 0x5654_4348; // "VTCH"
pub const CTRL_VERSION: u32 = 1;
pub const MAX_SUBSCRIBERS: u32 = 64;

/// Cold / rarely-written fields, then reader-hot, then writer-hot — each
/// section padded out to its own 128-byte cache line so readers polling
/// `published_seq` never bounce a line the writer also touches for pid/magic
/// bookkeeping.
#[repr(C, align(128))]
pub struct ControlBlock {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub init_state: AtomicU32,
    pub slot_count: AtomicU32,
    pub max_payload: AtomicU64,
    pub metadata_len: AtomicU32,
    pub publisher_pid: AtomicU32,
    pub _pad1: [u8; 96],

    pub published_seq: AtomicU64,
    pub _pad2: [u8; 120],

    pub next_free_slot_hint: AtomicU32,
    pub _pad3: [u8; 124],
}

#[repr(C, align(8))]
pub struct SubscriberSlotRecord {
    pub pid: AtomicU32,
    pub active: AtomicU32,
    pub last_seen_seq: AtomicU64,
}

/// Computed byte offsets into the segment. The metadata blob follows the
/// control block; the slot table follows that; the two payload buffers
/// (each `FRAME_HEADER_SIZE + max_payload`) follow the slot table.
pub struct Layout {
    pub metadata_offset: usize,
    pub slot_table_offset: usize,
    pub buffer_offset: [usize; 2],
    pub buffer_stride: usize,
    pub total_len: usize,
}

impl Layout {
    pub fn compute(slot_count: u32, max_payload: u64, metadata_len: u32) -> Result<Self> {
        if slot_count == 0 || slot_count > MAX_SUBSCRIBERS {
            return Err(Error::Config(format!("slot_count must be in 1..={MAX_SUBSCRIBERS}")));
        }
        let metadata_offset = size_of::<ControlBlock>();
        let slot_table_offset = metadata_offset + metadata_len as usize;
        let buffer_stride = FRAME_HEADER_SIZE + max_payload as usize;
        let buffer0 = slot_table_offset + slot_count as usize * size_of::<SubscriberSlotRecord>();
        let buffer1 = buffer0 + buffer_stride;
        let total_len = buffer1 + buffer_stride;
        Ok(Self {
            metadata_offset,
            slot_table_offset,
            buffer_offset: [buffer0, buffer1],
            buffer_stride,
            total_len,
        })
    }
}

pub struct ControlFile {
    mmap: MmapFile,
    ptr: *mut ControlBlock,
    layout: Layout,
}

// SAFETY: the underlying mmap is shared, cross-process, lock-free state by
// design; every field access goes through an atomic or a checked byte range.
unsafe impl Send for ControlFile {}
unsafe impl Sync for ControlFile {}

impl ControlFile {
    pub fn create(path: &Path, slot_count: u32, max_payload: u64, metadata: &[u8]) -> Result<Self> {
        let layout = Layout::compute(slot_count, max_payload, metadata.len() as u32)?;
        let tmp_path = path.with_extension("tmp");
        let mut mmap = MmapFile::create(&tmp_path, layout.total_len)?;
        mmap.as_mut_slice().fill(0);
        mmap.range_mut(layout.metadata_offset, metadata.len())?.copy_from_slice(metadata);

        let ptr = mmap.as_mut_slice().as_mut_ptr() as *mut ControlBlock;
        let block = unsafe { &*ptr };
        block.init_state.store(1, Ordering::Relaxed);
        block.version.store(CTRL_VERSION, Ordering::Relaxed);
        block.slot_count.store(slot_count, Ordering::Relaxed);
        block.max_payload.store(max_payload, Ordering::Relaxed);
        block.metadata_len.store(metadata.len() as u32, Ordering::Relaxed);
        block.publisher_pid.store(std::process::id(), Ordering::Relaxed);
        block.published_seq.store(0, Ordering::Relaxed);
        block.next_free_slot_hint.store(0, Ordering::Relaxed);
        block.magic.store(CTRL_MAGIC, Ordering::Release);
        block.init_state.store(2, Ordering::Release);

        mmap.sync()?;
        std::fs::rename(&tmp_path, path)?;
        Ok(Self { mmap, ptr, layout })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mmap = MmapFile::open(path)?;
        if mmap.len() < size_of::<ControlBlock>() {
            return Err(Error::Corrupt("channel segment too small for control block"));
        }
        let ptr = mmap.as_slice().as_ptr() as *mut ControlBlock;
        let block = unsafe { &*ptr };
        loop {
            match block.init_state.load(Ordering::Acquire) {
                2 => break,
                0 | 1 => std::thread::yield_now(),
                _ => return Err(Error::Corrupt("invalid control block init_state")),
            }
        }
        if block.magic.load(Ordering::Acquire) != CTRL_MAGIC {
            return Err(Error::Corrupt("channel segment magic mismatch"));
        }
        let version = block.version.load(Ordering::Acquire);
        if version != CTRL_VERSION {
            return Err(Error::Unsupported("channel segment version mismatch"));
        }
        let slot_count = block.slot_count.load(Ordering::Acquire);
        let max_payload = block.max_payload.load(Ordering::Acquire);
        let metadata_len = block.metadata_len.load(Ordering::Acquire);
        let layout = Layout::compute(slot_count, max_payload, metadata_len)?;
        if mmap.len() < layout.total_len {
            return Err(Error::Corrupt("channel segment shorter than its declared layout"));
        }
        Ok(Self { mmap, ptr, layout })
    }

    pub fn block(&self) -> &ControlBlock {
        unsafe { &*self.ptr }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn mmap(&self) -> &MmapFile {
        &self.mmap
    }

    pub fn mmap_mut(&mut self) -> &mut MmapFile {
        &mut self.mmap
    }

    pub fn metadata(&self) -> Result<&[u8]> {
        let len = self.block().metadata_len.load(Ordering::Acquire) as usize;
        self.mmap.range(self.layout.metadata_offset, len)
    }

    pub fn slot_record(&self, index: u32) -> Result<&SubscriberSlotRecord> {
        let slot_count = self.block().slot_count.load(Ordering::Acquire);
        if index >= slot_count {
            return Err(Error::Corrupt("subscriber slot index out of range"));
        }
        let offset = self.layout.slot_table_offset + index as usize * size_of::<SubscriberSlotRecord>();
        let bytes = self.mmap.range(offset, size_of::<SubscriberSlotRecord>())?;
        Ok(unsafe { &*(bytes.as_ptr() as *const SubscriberSlotRecord) })
    }

    pub fn slot_count(&self) -> u32 {
        self.block().slot_count.load(Ordering::Acquire)
    }

    pub fn max_payload(&self) -> u64 {
        self.block().max_payload.load(Ordering::Acquire)
    }

    pub fn publisher_pid(&self) -> u32 {
        self.block().publisher_pid.load(Ordering::Acquire)
    }

    pub fn published_seq(&self) -> u64 {
        self.block().published_seq.load(Ordering::Acquire)
    }

    /// `true` if the process named in `publisher_pid` no longer exists.
    pub fn publisher_is_gone(&self) -> bool {
        let pid = self.publisher_pid();
        if pid == 0 {
            return true;
        }
        let res = unsafe { libc::kill(pid as libc::pid_t, 0) };
        res != 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
    }

    pub fn frame_header(&self, buffer_index: usize) -> Result<FrameHeader> {
        let offset = self.layout.buffer_offset[buffer_index];
        let bytes = self.mmap.range(offset, FRAME_HEADER_SIZE)?;
        let mut fixed = [0u8; FRAME_HEADER_SIZE];
        fixed.copy_from_slice(bytes);
        Ok(FrameHeader::from_bytes(&fixed))
    }

    pub fn frame_payload(&self, buffer_index: usize, len: usize) -> Result<&[u8]> {
        let offset = self.layout.buffer_offset[buffer_index] + FRAME_HEADER_SIZE;
        self.mmap.range(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::align_of;

    #[test]
    fn control_block_alignment() {
        assert_eq!(align_of::<ControlBlock>(), 128);
    }

    #[test]
    fn layout_buffers_do_not_overlap() {
        let layout = Layout::compute(4, 1024, 0).unwrap();
        assert!(layout.buffer_offset[1] >= layout.buffer_offset[0] + layout.buffer_stride);
        assert!(layout.total_len >= layout.buffer_offset[1] + layout.buffer_stride);
    }
}
