//! The uncounted arena collaborator: allocation outside the request heap.
//!
//! Shared composites live in blocks obtained here, so they survive request
//! teardown and can be freed from any thread at any time. `GlobalArena` backs
//! the trait with the global allocator; `CountingArena` layers the usage
//! accounting hooks on top of any arena and doubles as the test double for
//! leak and double-free checks.

use std::{
    alloc::{self, Layout, handle_alloc_error},
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Allocator/deallocator pair for blocks living outside the request heap.
///
/// Implementations must be thread-safe: releases of shared values happen on
/// arbitrary threads, interleaved with allocations on others.
pub trait UncountedArena: Send + Sync {
    /// Allocates a block for the given layout.
    ///
    /// Allocation failure is a fatal resource-exhaustion condition, not an
    /// error to recover from locally; implementations abort via
    /// [`handle_alloc_error`] rather than returning null.
    fn allocate(&self, layout: Layout) -> NonNull<u8>;

    /// Frees a block previously returned by [`UncountedArena::allocate`].
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate` on this same arena with
    /// this same `layout`, and must not be freed twice.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Arena backed by the global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalArena;

impl UncountedArena for GlobalArena {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        debug_assert!(layout.size() > 0, "GlobalArena::allocate: zero-sized layout");
        // SAFETY: layout is non-zero-sized; every block type allocated here
        // carries at least a count header.
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).unwrap_or_else(|| handle_alloc_error(layout))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract - ptr came from alloc with this
        // layout and is freed exactly once.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Atomic usage counters for arena traffic.
///
/// Counters only ever grow; live usage is the difference between the
/// allocated and freed sides, read via [`ArenaStats::snapshot`].
#[derive(Debug, Default)]
pub struct ArenaStats {
    blocks_allocated: AtomicUsize,
    blocks_freed: AtomicUsize,
    bytes_allocated: AtomicUsize,
    bytes_freed: AtomicUsize,
}

impl ArenaStats {
    fn on_allocate(&self, bytes: usize) {
        self.blocks_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    fn on_free(&self, bytes: usize) {
        self.blocks_freed.fetch_add(1, Ordering::Relaxed);
        self.bytes_freed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Captures a consistent-enough point-in-time copy of the counters.
    ///
    /// Individual loads are relaxed; a snapshot taken while other threads
    /// allocate may be transiently skewed, which is fine for monitoring.
    #[must_use]
    pub fn snapshot(&self) -> ArenaSnapshot {
        ArenaSnapshot {
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            blocks_freed: self.blocks_freed.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ArenaStats`] counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ArenaSnapshot {
    pub blocks_allocated: usize,
    pub blocks_freed: usize,
    pub bytes_allocated: usize,
    pub bytes_freed: usize,
}

impl ArenaSnapshot {
    /// Blocks currently live (allocated and not yet freed).
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.blocks_allocated - self.blocks_freed
    }

    /// Bytes currently live.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.bytes_allocated - self.bytes_freed
    }
}

impl fmt::Display for ArenaSnapshot {
    /// Example output:
    ///
    /// ```text
    /// arena: 3 live blocks (120 bytes), 7 allocated / 4 freed
    /// ```
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "arena: {live} live blocks ({bytes} bytes), {alloc} allocated / {freed} freed",
            live = self.live_blocks(),
            bytes = self.live_bytes(),
            alloc = self.blocks_allocated,
            freed = self.blocks_freed,
        )
    }
}

/// An arena paired with usage accounting, invoked once per allocate/free.
#[derive(Debug, Default)]
pub struct CountingArena<A: UncountedArena = GlobalArena> {
    inner: A,
    stats: ArenaStats,
}

impl<A: UncountedArena> CountingArena<A> {
    #[must_use]
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            stats: ArenaStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &ArenaStats {
        &self.stats
    }

    /// Shorthand for `stats().snapshot()`.
    #[must_use]
    pub fn snapshot(&self) -> ArenaSnapshot {
        self.stats.snapshot()
    }
}

impl<A: UncountedArena> UncountedArena for CountingArena<A> {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        self.stats.on_allocate(layout.size());
        self.inner.allocate(layout)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        self.stats.on_free(layout.size());
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.free(ptr, layout) }
    }
}
