//! Fixed-capacity bump arena shared by every producer of a queue.
//!
//! Allocation bumps a single atomic cursor with a CAS loop, so any number of
//! threads may allocate concurrently without a lock. Space is reclaimed only
//! when the most recent block is freed (strict LIFO); any other free inside
//! the arena is a leak until [`MemoryPool::reset`]. When the arena runs dry
//! allocation silently degrades to the global allocator.

use super::model::ArenaMetrics;
use std::{
    alloc::{self, Layout},
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};


/// Alignment every arena block is rounded to unless stated otherwise.
pub const DEFAULT_ALIGN: usize = 16;

struct AssertParams<const N: usize, const A: usize>;

impl<const N: usize, const A: usize> AssertParams<N, A> {
    const OK: () = {
        assert!(A.is_power_of_two(), "arena alignment must be a power of two");
        assert!(N > 0, "arena size must be non-zero");
        assert!(N % A == 0, "arena size must be a multiple of its alignment");
    };
}

#[cold]
#[inline(never)]
fn capacity_overflow() -> ! {
    panic!("capacity overflow")
}

struct AssertAlign<const REQ: usize, const A: usize>;

impl<const REQ: usize, const A: usize> AssertAlign<REQ, A> {
    const OK: () = assert!(REQ <= A, "alignment is too large for this memory pool");
}

/// Bump arena of `N` bytes handed out in `A`-aligned blocks.
///
/// The pool is shared by reference (usually through an `Arc`), so its
/// buffer is never copied implicitly. [`duplicate`](Self::duplicate) is the
/// only way to get a second pool with the same contents and cursor.
pub struct MemoryPool<const N: usize, const A: usize = DEFAULT_ALIGN> {
    buf: NonNull<u8>,
    top: AtomicUsize,
    fallbacks: AtomicUsize,
}

// The buffer is only ever handed out in disjoint ranges guarded by `top`.
unsafe impl<const N: usize, const A: usize> Send for MemoryPool<N, A> {}
unsafe impl<const N: usize, const A: usize> Sync for MemoryPool<N, A> {}

impl<const N: usize, const A: usize> MemoryPool<N, A> {
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = AssertParams::<N, A>::OK;

        let layout = Self::buffer_layout();
        // SAFETY: `N > 0` is checked at compile time.
        let raw = unsafe { alloc::alloc(layout) };
        let buf = match NonNull::new(raw) {
            Some(buf) => buf,
            None => alloc::handle_alloc_error(layout),
        };

        Self {
            buf,
            top: AtomicUsize::new(0),
            fallbacks: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    fn buffer_layout() -> Layout {
        match Layout::from_size_align(N, A) {
            Ok(layout) => layout,
            Err(_) => unreachable!("arena parameters are validated at compile time"),
        }
    }

    #[inline(always)]
    fn align_up(n: usize) -> usize {
        match n.checked_add(A - 1) {
            Some(padded) => padded & !(A - 1),
            None => capacity_overflow(),
        }
    }

    #[inline(always)]
    fn fallback_layout(n: usize) -> Layout {
        match Layout::from_size_align(Self::align_up(n), A) {
            Ok(layout) => layout,
            Err(_) => panic!("allocation of {n} bytes overflows the address space"),
        }
    }

    /// Allocates `n` bytes aligned to `REQ`, which may not exceed the arena
    /// alignment. Never fails: on exhaustion the global allocator is used.
    #[inline]
    pub fn allocate<const REQ: usize>(&self, n: usize) -> NonNull<u8> {
        #[allow(clippy::let_unit_value)]
        let () = AssertAlign::<REQ, A>::OK;
        self.allocate_bytes(n)
    }

    /// Same as [`allocate`](Self::allocate) for callers that checked the
    /// alignment themselves.
    pub(crate) fn allocate_bytes(&self, n: usize) -> NonNull<u8> {
        let aligned = Self::align_up(n);
        if aligned == 0 {
            return self.dangling();
        }

        let mut old = self.top.load(Ordering::Relaxed);
        loop {
            debug_assert!(old <= N, "arena cursor escaped its buffer");
            if N - old < aligned {
                break;
            }
            match self.top.compare_exchange_weak(
                old,
                old + aligned,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                // SAFETY: `old + aligned <= N`, so the block stays inside the buffer.
                Ok(_) => return unsafe { NonNull::new_unchecked(self.buf.as_ptr().add(old)) },
                Err(current) => old = current,
            }
        }

        self.fallback(n)
    }

    #[cold]
    fn fallback(&self, n: usize) -> NonNull<u8> {
        let total = self.fallbacks.fetch_add(1, Ordering::Relaxed) + 1;
        #[cfg(debug_assertions)]
        tracing::warn!(
            requested = n,
            arena_size = N,
            fallbacks = total,
            "memory pool exhausted, falling back to the global allocator"
        );
        #[cfg(not(debug_assertions))]
        let _ = total;

        let layout = Self::fallback_layout(n);
        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        }
    }

    /// Returns a block obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `p` must come from this pool with the same `n`, and must not be used
    /// after this call.
    pub unsafe fn deallocate(&self, p: NonNull<u8>, n: usize) {
        let aligned = Self::align_up(n);
        if aligned == 0 {
            return;
        }

        if !self.owns(p.as_ptr()) {
            alloc::dealloc(p.as_ptr(), Self::fallback_layout(n));
            return;
        }

        let offset = p.as_ptr() as usize - self.buf.as_ptr() as usize;
        let mut old = self.top.load(Ordering::Relaxed);
        // Only the block that ends exactly at the cursor can be reclaimed.
        while offset + aligned == old {
            match self.top.compare_exchange_weak(
                old,
                offset,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => old = current,
            }
        }
    }

    /// Whether `p` points into the arena buffer.
    #[inline]
    pub fn owns(&self, p: *const u8) -> bool {
        let start = self.buf.as_ptr() as usize;
        let addr = p as usize;
        addr >= start && addr < start + N
    }

    #[inline]
    fn dangling(&self) -> NonNull<u8> {
        // Any non-null address with the arena alignment works for zero-sized blocks.
        // SAFETY: `A` is a non-zero power of two.
        unsafe { NonNull::new_unchecked(A as *mut u8) }
    }

    #[inline]
    pub const fn size() -> usize {
        N
    }

    #[inline]
    pub const fn alignment() -> usize {
        A
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        N - self.used()
    }

    /// Number of allocations served by the global allocator so far.
    #[inline]
    pub fn fallback_allocations(&self) -> usize {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Rewinds the cursor to the start of the buffer. Exclusive access
    /// guarantees that no allocator (and therefore no live task) refers to it.
    pub fn reset(&mut self) {
        *self.top.get_mut() = 0;
    }

    /// Copies the buffer and the cursor into a fresh pool. Fallback
    /// allocations belong to the global allocator and are not carried over.
    pub fn duplicate(&mut self) -> Self {
        let copy = Self::new();
        let used = *self.top.get_mut();
        // SAFETY: both buffers hold `N >= used` bytes and never overlap.
        unsafe { std::ptr::copy_nonoverlapping(self.buf.as_ptr(), copy.buf.as_ptr(), used) };
        copy.top.store(used, Ordering::Relaxed);
        copy
    }

    pub fn metrics(&self) -> ArenaMetrics {
        ArenaMetrics {
            size: N,
            used: self.used(),
            fallback_allocations: self.fallback_allocations(),
        }
    }
}

impl<const N: usize, const A: usize> Default for MemoryPool<N, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, const A: usize> Drop for MemoryPool<N, A> {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.buf.as_ptr(), Self::buffer_layout()) }
    }
}

impl<const N: usize, const A: usize> fmt::Debug for MemoryPool<N, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("size", &N)
            .field("alignment", &A)
            .field("used", &self.used())
            .field("fallbacks", &self.fallback_allocations())
            .finish()
    }
}
