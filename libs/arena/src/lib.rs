// Copyright 2026 Loam Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-fiber bump arena.
//!
//! Each fiber exclusively owns one [`Arena`] for transient allocations; the
//! tuple update engine writes its output records here. The arena is capped at
//! a configurable capacity (the fiber's "stack size") and carries a watermark:
//! when a fiber is recycled through the dead pool, an arena whose high-water
//! mark stayed under the watermark keeps its memory chunk for the next
//! occupant, while one that grew past it is rebuilt so the memory goes back
//! to the allocator instead of pinning RSS from the pool.

use bumpalo::Bump;
use loam_error::{Error, Result};

/// Default arena capacity for fibers spawned without explicit attributes.
pub const CAPACITY_DEFAULT: usize = 512 * 1024;

/// Floor for caller-supplied capacities.
pub const CAPACITY_MIN: usize = 16 * 1024;

/// High-water distance deciding whether a recycled arena keeps its chunk.
pub const WATERMARK: usize = 64 * 1024;

#[derive(Debug)]
pub struct Arena {
    bump: Bump,
    capacity: usize,
}

// === impl Arena ===

impl Arena {
    pub fn new() -> Self {
        Self::with_capacity(CAPACITY_DEFAULT)
    }

    /// Create an arena with a custom capacity, clamped to [`CAPACITY_MIN`].
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bump: Bump::new(),
            capacity: capacity.max(CAPACITY_MIN),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes handed out since the last reset.
    pub fn used(&self) -> usize {
        self.bump.allocated_bytes()
    }

    fn admit(&self, additional: usize) -> Result<()> {
        if self.used().saturating_add(additional) > self.capacity {
            return Err(Error::OutOfMemory);
        }
        Ok(())
    }

    /// Allocate a zero-filled byte slice.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::OutOfMemory`] when the allocation would push the
    /// arena past its capacity.
    pub fn alloc_zeroed(&self, len: usize) -> Result<&mut [u8]> {
        self.admit(len)?;
        Ok(self.bump.alloc_slice_fill_copy(len, 0u8))
    }

    /// Copy `src` into the arena.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::OutOfMemory`] when the allocation would push the
    /// arena past its capacity.
    pub fn alloc_copy(&self, src: &[u8]) -> Result<&[u8]> {
        self.admit(src.len())?;
        Ok(self.bump.alloc_slice_copy(src))
    }

    /// Drop all allocations but keep the arena usable.
    pub fn reset(&mut self) {
        self.bump.reset();
    }

    /// Reset for the next pool occupant. Returns `true` when the memory chunk
    /// was kept (high-water mark stayed under [`WATERMARK`]).
    pub fn recycle(&mut self) -> bool {
        if self.used() > WATERMARK {
            self.bump = Bump::new();
            false
        } else {
            self.bump.reset();
            true
        }
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_enforced() {
        let arena = Arena::with_capacity(CAPACITY_MIN);
        assert!(arena.alloc_zeroed(1024).is_ok());
        assert_eq!(arena.alloc_zeroed(CAPACITY_MIN), Err(Error::OutOfMemory));
    }

    #[test]
    fn capacity_floor() {
        let arena = Arena::with_capacity(1);
        assert_eq!(arena.capacity(), CAPACITY_MIN);
    }

    #[test]
    fn recycle_keeps_chunk_under_watermark() {
        let mut arena = Arena::new();
        arena.alloc_zeroed(WATERMARK / 2).unwrap();
        assert!(arena.recycle());
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn recycle_rebuilds_past_watermark() {
        let mut arena = Arena::new();
        arena.alloc_zeroed(WATERMARK + 1).unwrap();
        assert!(!arena.recycle());
        assert_eq!(arena.used(), 0);
        assert!(arena.alloc_zeroed(16).is_ok());
    }

    #[test]
    fn copies_round_trip() {
        let arena = Arena::new();
        let out = arena.alloc_copy(b"loam").unwrap();
        assert_eq!(out, b"loam");
    }
}
