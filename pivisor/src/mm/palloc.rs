//! Bitmap page frame allocator over an owned arena.
//!
//! The allocator hands out page-sized frames from a contiguous window of
//! guest-visible physical memory. All frame contents are reached through
//! the allocator rather than by dereferencing the [`Pa`] itself, which
//! keeps stage-2 tables and guest RAM accessible wherever the engine runs.

use alloc::boxed::Box;
use alloc::vec;
use basalt::{Pa, PAGE_SIZE, PTRS_PER_TABLE};

/// One page frame, aligned so a frame can double as a translation table.
#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE]);

/// Errors of the frame allocator.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AllocError {
    /// No free frame left in the arena.
    OutOfMemory,
    /// Address is not frame aligned.
    Unaligned,
    /// Address falls outside the arena window.
    OutOfRange,
    /// Frame is not currently allocated.
    NotAllocated,
}

/// Page frame allocator backed by a boxed arena.
pub struct PageAllocator {
    frames: Box<[Frame]>,
    bitmap: Box<[u64]>,
    base: Pa,
    used: usize,
}

impl PageAllocator {
    /// Build an arena of `nr_frames` frames presented at physical `base`.
    ///
    /// `base` must be page aligned.
    pub fn new(base: Pa, nr_frames: usize) -> Result<Self, AllocError> {
        if !base.is_page_aligned() {
            return Err(AllocError::Unaligned);
        }
        let mut frames = alloc::vec::Vec::with_capacity(nr_frames);
        for _ in 0..nr_frames {
            frames.push(Frame([0; PAGE_SIZE]));
        }
        Ok(Self {
            frames: frames.into_boxed_slice(),
            bitmap: vec![0u64; (nr_frames + 63) / 64].into_boxed_slice(),
            base,
            used: 0,
        })
    }

    /// First physical address of the arena window.
    pub fn base(&self) -> Pa {
        self.base
    }

    /// Total number of frames in the arena.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Number of frames currently handed out.
    pub fn used(&self) -> usize {
        self.used
    }

    /// One past the last physical address of the arena window.
    pub fn end(&self) -> Pa {
        self.base + (self.frames.len() * PAGE_SIZE) as u64
    }

    fn index_of(&self, pa: Pa) -> Result<usize, AllocError> {
        if !pa.is_page_aligned() {
            return Err(AllocError::Unaligned);
        }
        if pa < self.base || pa >= self.end() {
            return Err(AllocError::OutOfRange);
        }
        Ok(((pa - self.base) as usize) >> basalt::PAGE_SHIFT)
    }

    fn is_set(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// Allocate one zero-filled frame.
    pub fn alloc(&mut self) -> Result<Pa, AllocError> {
        for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let idx = word_idx * 64 + bit;
            if idx >= self.frames.len() {
                break;
            }
            *word |= 1 << bit;
            self.used += 1;
            self.frames[idx].0.fill(0);
            return Ok(self.base + (idx * PAGE_SIZE) as u64);
        }
        Err(AllocError::OutOfMemory)
    }

    /// Return a frame to the arena.
    pub fn free(&mut self, pa: Pa) -> Result<(), AllocError> {
        let idx = self.index_of(pa)?;
        if !self.is_set(idx) {
            return Err(AllocError::NotAllocated);
        }
        self.bitmap[idx / 64] &= !(1 << (idx % 64));
        self.used -= 1;
        Ok(())
    }

    /// Bytes of an allocated frame.
    pub fn page(&self, pa: Pa) -> Result<&[u8; PAGE_SIZE], AllocError> {
        let idx = self.index_of(pa)?;
        if !self.is_set(idx) {
            return Err(AllocError::NotAllocated);
        }
        Ok(&self.frames[idx].0)
    }

    /// Mutable bytes of an allocated frame.
    pub fn page_mut(&mut self, pa: Pa) -> Result<&mut [u8; PAGE_SIZE], AllocError> {
        let idx = self.index_of(pa)?;
        if !self.is_set(idx) {
            return Err(AllocError::NotAllocated);
        }
        Ok(&mut self.frames[idx].0)
    }

    /// View an allocated frame as a translation table.
    pub fn table(&self, pa: Pa) -> Result<&[u64; PTRS_PER_TABLE], AllocError> {
        let bytes = self.page(pa)?;
        // Frames are 4KB aligned, so the cast to 512 u64 entries is sound.
        Ok(unsafe { &*(bytes.as_ptr() as *const [u64; PTRS_PER_TABLE]) })
    }

    /// Mutable translation-table view of an allocated frame.
    pub fn table_mut(&mut self, pa: Pa) -> Result<&mut [u64; PTRS_PER_TABLE], AllocError> {
        let bytes = self.page_mut(pa)?;
        Ok(unsafe { &mut *(bytes.as_mut_ptr() as *mut [u64; PTRS_PER_TABLE]) })
    }
}
