//! Frame buffer pool shared with the kernel.
//!
//! Buffers are allocated once per negotiated format and cycle between user
//! space and the kernel: `Free` (ours, empty), `Filled` (ours, carrying a
//! frame), `Queued` (owned by the kernel until dequeued or the stream
//! stops). The pool is the single authority on buffer state; a queued
//! buffer's memory must not be touched from user space.

use anyhow::{ensure, Context, Result};
use mmap::{MapOption, MemoryMap};
use std::os::fd::RawFd;
use std::slice;

/// Byte storage backing one video buffer.
pub trait BufferMemory {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_slice(&self) -> &[u8];

    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// Kernel buffer mapped into the process, as handed out by QUERYBUF.
pub struct MappedMemory {
    map: MemoryMap,
    len: usize,
}

impl MappedMemory {
    pub fn new(fd: RawFd, len: usize, offset: usize) -> Result<Self> {
        ensure!(len > 0, "mapped buffer length must be positive");
        let map = MemoryMap::new(
            len,
            &[
                MapOption::MapReadable,
                MapOption::MapWritable,
                MapOption::MapFd(fd),
                MapOption::MapOffset(offset),
                MapOption::MapNonStandardFlags(libc::MAP_SHARED),
            ],
        )
        .map_err(|err| anyhow::anyhow!("map video buffer: {err}"))?;
        Ok(Self { map, len })
    }
}

impl BufferMemory for MappedMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.map.data(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.map.data(), self.len) }
    }
}

/// Plain heap storage, for sinks that do not hand out mappable memory.
pub struct HeapMemory {
    data: Vec<u8>,
}

impl HeapMemory {
    pub fn new(len: usize) -> Self {
        Self { data: vec![0; len] }
    }
}

impl BufferMemory for HeapMemory {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    Free,
    Queued,
    Filled,
}

/// One pool slot: a kernel buffer index plus its mapped memory.
pub struct VideoBuffer {
    index: u32,
    memory: Box<dyn BufferMemory>,
    bytesused: u32,
    state: BufferState,
}

impl VideoBuffer {
    pub fn new(index: u32, memory: Box<dyn BufferMemory>) -> Self {
        Self {
            index,
            memory,
            bytesused: 0,
            state: BufferState::Free,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn bytesused(&self) -> u32 {
        self.bytesused
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }
}

/// Fixed-size pool of video buffers, indexed by kernel buffer index.
pub struct BufferPool {
    buffers: Vec<VideoBuffer>,
}

impl BufferPool {
    pub fn new(buffers: Vec<VideoBuffer>) -> Self {
        Self { buffers }
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    /// Lowest-index `Free` buffer, if any. `None` means the frame is
    /// dropped for this cycle rather than queued in user space.
    pub fn acquire_free(&self) -> Option<u32> {
        self.buffers
            .iter()
            .find(|buf| buf.state == BufferState::Free)
            .map(|buf| buf.index)
    }

    /// Hand a buffer to the kernel. Valid from `Free` (priming an empty
    /// buffer) and `Filled`.
    pub fn mark_queued(&mut self, index: u32) -> Result<()> {
        let buf = self.slot_mut(index)?;
        ensure!(
            buf.state != BufferState::Queued,
            "buffer {index} already queued to the kernel"
        );
        buf.state = BufferState::Queued;
        Ok(())
    }

    /// The kernel handed the buffer back; it is ours again and empty.
    pub fn mark_dequeued(&mut self, index: u32) -> Result<()> {
        let buf = self.slot_mut(index)?;
        ensure!(
            buf.state == BufferState::Queued,
            "buffer {index} dequeued but not kernel-owned"
        );
        buf.state = BufferState::Free;
        buf.bytesused = 0;
        Ok(())
    }

    /// Record a produced frame of `bytesused` bytes.
    pub fn mark_filled(&mut self, index: u32, bytesused: u32) -> Result<()> {
        let buf = self.slot_mut(index)?;
        ensure!(
            buf.state == BufferState::Free,
            "buffer {index} filled while {:?}",
            buf.state
        );
        ensure!(
            bytesused as usize <= buf.capacity(),
            "frame of {bytesused} bytes exceeds buffer capacity {}",
            buf.capacity()
        );
        buf.state = BufferState::Filled;
        buf.bytesused = bytesused;
        Ok(())
    }

    /// Reconcile kernel-owned buffers after STREAMOFF, which implicitly
    /// releases every queued buffer.
    pub fn reclaim_queued(&mut self) -> usize {
        let mut reclaimed = 0;
        for buf in &mut self.buffers {
            if buf.state == BufferState::Queued {
                buf.state = BufferState::Free;
                buf.bytesused = 0;
                reclaimed += 1;
            }
        }
        reclaimed
    }

    pub fn memory_mut(&mut self, index: u32) -> Result<&mut [u8]> {
        let buf = self.slot_mut(index)?;
        ensure!(
            buf.state != BufferState::Queued,
            "buffer {index} is kernel-owned"
        );
        Ok(buf.memory.as_mut_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = &VideoBuffer> {
        self.buffers.iter()
    }

    /// (free, queued, filled) occupancy snapshot.
    pub fn state_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for buf in &self.buffers {
            match buf.state {
                BufferState::Free => counts.0 += 1,
                BufferState::Queued => counts.1 += 1,
                BufferState::Filled => counts.2 += 1,
            }
        }
        counts
    }

    fn slot_mut(&mut self, index: u32) -> Result<&mut VideoBuffer> {
        let capacity = self.buffers.len();
        self.buffers
            .iter_mut()
            .find(|buf| buf.index == index)
            .with_context(|| format!("buffer index {index} out of range (pool of {capacity})"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_pool(capacity: u32, len: usize) -> BufferPool {
        BufferPool::new(
            (0..capacity)
                .map(|index| VideoBuffer::new(index, Box::new(HeapMemory::new(len))))
                .collect(),
        )
    }

    fn assert_invariant(pool: &BufferPool) {
        let (free, queued, filled) = pool.state_counts();
        assert_eq!(free + queued + filled, pool.capacity());
    }

    #[test]
    fn lifecycle_keeps_state_counts_balanced() {
        let mut pool = heap_pool(4, 16);
        assert_invariant(&pool);

        while let Some(index) = pool.acquire_free() {
            pool.mark_queued(index).unwrap();
            assert_invariant(&pool);
        }
        assert_eq!(pool.state_counts(), (0, 4, 0));

        pool.mark_dequeued(2).unwrap();
        assert_invariant(&pool);
        pool.mark_filled(2, 16).unwrap();
        assert_invariant(&pool);
        pool.mark_queued(2).unwrap();
        assert_eq!(pool.state_counts(), (0, 4, 0));
    }

    #[test]
    fn double_queue_is_rejected() {
        let mut pool = heap_pool(2, 8);
        pool.mark_queued(0).unwrap();
        assert!(pool.mark_queued(0).is_err());
    }

    #[test]
    fn dequeue_requires_kernel_ownership() {
        let mut pool = heap_pool(2, 8);
        assert!(pool.mark_dequeued(1).is_err());
    }

    #[test]
    fn fill_is_bounded_by_capacity() {
        let mut pool = heap_pool(1, 8);
        assert!(pool.mark_filled(0, 9).is_err());
        pool.mark_filled(0, 8).unwrap();
        assert_eq!(pool.iter().next().unwrap().bytesused(), 8);
    }

    #[test]
    fn queued_memory_is_off_limits() {
        let mut pool = heap_pool(1, 8);
        pool.mark_queued(0).unwrap();
        assert!(pool.memory_mut(0).is_err());
    }

    #[test]
    fn reclaim_releases_kernel_buffers() {
        let mut pool = heap_pool(3, 8);
        pool.mark_queued(0).unwrap();
        pool.mark_queued(1).unwrap();
        assert_eq!(pool.reclaim_queued(), 2);
        assert_eq!(pool.state_counts(), (3, 0, 0));
    }

    #[test]
    fn unknown_index_is_an_error() {
        let mut pool = heap_pool(2, 8);
        assert!(pool.mark_queued(5).is_err());
    }
}
