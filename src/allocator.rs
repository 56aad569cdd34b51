//! Typed allocator handle over a shared [`MemoryPool`].

use super::arena::{MemoryPool, DEFAULT_ALIGN};
use std::{
    fmt,
    marker::PhantomData,
    mem,
    ptr::NonNull,
    sync::Arc,
};


struct AssertFits<T, const A: usize>(PhantomData<T>);

impl<T, const A: usize> AssertFits<T, A> {
    const OK: () = assert!(
        mem::align_of::<T>() <= A,
        "alignment is too large for this memory pool"
    );
}

/// Allocates arrays of `T` out of a shared arena.
///
/// Cloning is a reference copy. Two allocators are equal when they share the
/// same pool instance and the same size/alignment parameters, whatever their
/// element types.
pub struct Allocator<T, const N: usize, const A: usize = DEFAULT_ALIGN> {
    pool: Arc<MemoryPool<N, A>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, const N: usize, const A: usize> Allocator<T, N, A> {
    pub fn new(pool: Arc<MemoryPool<N, A>>) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn pool(&self) -> &Arc<MemoryPool<N, A>> {
        &self.pool
    }

    /// Same pool, different element type.
    #[inline]
    pub fn rebind<U>(&self) -> Allocator<U, N, A> {
        Allocator::new(self.pool.clone())
    }

    #[inline]
    fn bytes_for(n: usize) -> usize {
        match n.checked_mul(mem::size_of::<T>()) {
            Some(bytes) => bytes,
            None => panic!("capacity overflow"),
        }
    }

    /// Room for `n` values of `T`; uninitialised.
    #[inline]
    pub fn allocate(&self, n: usize) -> NonNull<T> {
        #[allow(clippy::let_unit_value)]
        let () = AssertFits::<T, A>::OK;

        let bytes = Self::bytes_for(n);
        if bytes == 0 {
            return NonNull::dangling();
        }
        self.pool.allocate_bytes(bytes).cast()
    }

    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on an equal
    /// allocator with the same `n`, and its values must already be dropped.
    #[inline]
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) {
        let bytes = Self::bytes_for(n);
        if bytes == 0 {
            return;
        }
        self.pool.deallocate(ptr.cast(), bytes);
    }
}

impl<T, const N: usize, const A: usize> Clone for Allocator<T, N, A> {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone())
    }
}

impl<T, U, const N: usize, const A: usize, const M: usize, const B: usize>
    PartialEq<Allocator<U, M, B>> for Allocator<T, N, A>
{
    fn eq(&self, other: &Allocator<U, M, B>) -> bool {
        N == M
            && A == B
            && Arc::as_ptr(&self.pool) as *const () == Arc::as_ptr(&other.pool) as *const ()
    }
}

impl<T, const N: usize, const A: usize> Eq for Allocator<T, N, A> {}

impl<T, const N: usize, const A: usize> fmt::Debug for Allocator<T, N, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("element", &std::any::type_name::<T>())
            .field("pool", &Arc::as_ptr(&self.pool))
            .finish()
    }
}
