//! Bounded lock-free MPMC task queue.
//!
//! Each side owns a pair of monotonically increasing counters:
//!
//! - `reserve` is advanced by CAS to claim a ticket (a slot index once masked);
//! - `visible` is advanced after the claimed slot has been filled (write side)
//!   or emptied (read side), strictly in ticket order.
//!
//! Producers check fullness against `read.visible` and consumers check
//! emptiness against `write.visible`, so neither side ever touches a slot the
//! other one still works on. `read.reserve <= read.visible <= write.visible
//! <= write.reserve` and `write.reserve - read.visible <= C - 1` hold at all
//! times.
//!
//! Publishing in ticket order means a thread preempted between its
//! reservation and its publish holds back the counterparts that reserved
//! after it. Nothing bounds that delay.

use super::{
    allocator::Allocator,
    arena::MemoryPool,
    handle::{self, Task, TaskHandle},
    model::QueueMetrics,
};
use crossbeam::utils::{Backoff, CachePadded};
use std::{
    cell::UnsafeCell,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};


/// Something a worker can drain one task at a time.
pub trait TaskSource: Send + Sync {
    /// Runs at most one pending task on the calling thread. Returns `false`
    /// when nothing was available.
    fn try_run_next(&self) -> bool;
}

struct AssertCapacity<const C: usize>;

impl<const C: usize> AssertCapacity<C> {
    const OK: () = assert!(
        C >= 2 && C.is_power_of_two(),
        "queue capacity must be a power of two (at least 2)"
    );
}

#[derive(Default)]
struct Cursor {
    reserve: AtomicU64,
    visible: AtomicU64,
}

impl Cursor {
    /// Advances `visible` past `ticket` once every earlier ticket has been
    /// published.
    #[inline]
    fn publish(&self, ticket: u64) {
        let backoff = Backoff::new();
        while self.visible.load(Ordering::Acquire) != ticket {
            backoff.snooze();
        }
        self.visible.store(ticket + 1, Ordering::Release);
    }
}

/// Fixed-capacity queue of `C` slots (`C - 1` usable) whose tasks live in a
/// shared [`MemoryPool`] of `N` bytes. Every task yields an `R`.
pub struct BoundedQueue<R, const C: usize, const N: usize> {
    read: CachePadded<Cursor>,
    write: CachePadded<Cursor>,
    allocator: Allocator<(), N>,
    slots: Box<[UnsafeCell<Option<Task<R>>>]>,
}

// Slot access is serialised by the ticket protocol.
unsafe impl<R: Send, const C: usize, const N: usize> Send for BoundedQueue<R, C, N> {}
unsafe impl<R: Send, const C: usize, const N: usize> Sync for BoundedQueue<R, C, N> {}

impl<R, const C: usize, const N: usize> BoundedQueue<R, C, N>
where
    R: Send + 'static,
{
    const MASK: u64 = C as u64 - 1;

    pub fn new(pool: Arc<MemoryPool<N>>) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = AssertCapacity::<C>::OK;

        let slots = (0..C).map(|_| UnsafeCell::new(None)).collect();
        Self {
            read: CachePadded::new(Cursor::default()),
            write: CachePadded::new(Cursor::default()),
            allocator: Allocator::new(pool),
            slots,
        }
    }

    /// Queue with a private arena.
    pub fn with_own_pool() -> Self {
        Self::new(Arc::new(MemoryPool::new()))
    }

    #[inline(always)]
    fn slot(&self, ticket: u64) -> &UnsafeCell<Option<Task<R>>> {
        &self.slots[(ticket & Self::MASK) as usize]
    }

    /// Submits `f` without blocking. Returns an invalid handle when the
    /// queue is full; the callable is dropped in that case.
    pub fn try_push<F>(&self, f: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
    {
        let (task, handle) = handle::new_task(&self.allocator, f);

        let ticket = match self.reserve_write() {
            Some(ticket) => ticket,
            None => {
                drop(handle);
                drop(task);
                return TaskHandle::invalid();
            }
        };

        // SAFETY: the ticket is ours alone and `reserve_write` proved that
        // the previous occupant of this slot has been taken out.
        unsafe {
            let slot = &mut *self.slot(ticket).get();
            debug_assert!(slot.is_none(), "overwriting an unconsumed slot");
            *slot = Some(task);
        }
        self.write.publish(ticket);
        handle
    }

    /// Binds `args` to `f` and submits the result.
    #[inline]
    pub fn try_push_with<F, A>(&self, f: F, args: A) -> TaskHandle<R>
    where
        F: FnOnce(A) -> R + Send + 'static,
        A: Send + 'static,
    {
        self.try_push(move || f(args))
    }

    fn reserve_write(&self) -> Option<u64> {
        let limit = C as u64 - 1;
        let mut ticket = self.write.reserve.load(Ordering::Relaxed);
        loop {
            let consumed = self.read.visible.load(Ordering::Acquire);
            // A stale `ticket` may lag behind `consumed`; the CAS then fails.
            if ticket.saturating_sub(consumed) >= limit {
                return None;
            }
            match self.write.reserve.compare_exchange_weak(
                ticket,
                ticket + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(ticket),
                Err(current) => ticket = current,
            }
        }
    }

    fn reserve_read(&self) -> Option<u64> {
        let mut ticket = self.read.reserve.load(Ordering::Relaxed);
        loop {
            let published = self.write.visible.load(Ordering::Acquire);
            if ticket >= published {
                return None;
            }
            match self.read.reserve.compare_exchange_weak(
                ticket,
                ticket + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(ticket),
                Err(current) => ticket = current,
            }
        }
    }

    /// Claims the oldest published task and runs it on the calling thread.
    /// Returns `false` without side effects when the queue is empty.
    pub fn try_run_next(&self) -> bool {
        let ticket = match self.reserve_read() {
            Some(ticket) => ticket,
            None => return false,
        };

        // SAFETY: the ticket is below `write.visible`, so the slot is filled,
        // and no other consumer holds the same ticket.
        let task = unsafe { (*self.slot(ticket).get()).take() };
        self.read.publish(ticket);

        match task {
            Some(task) => task.run(),
            None => debug_assert!(false, "published slot {ticket} was empty"),
        }
        true
    }

    /// Usable capacity, one less than the slot count.
    ///
    /// A slot is released as soon as its task is taken out, before the task
    /// runs. Up to `C - 1` tasks can therefore be queued while any number of
    /// already claimed tasks are still executing on consumer threads.
    #[inline]
    pub const fn capacity(&self) -> usize {
        C - 1
    }

    /// Published tasks not yet claimed by a consumer.
    #[inline]
    pub fn len(&self) -> usize {
        let published = self.write.visible.load(Ordering::Acquire);
        let claimed = self.read.reserve.load(Ordering::Acquire);
        published.saturating_sub(claimed) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn pool(&self) -> &Arc<MemoryPool<N>> {
        self.allocator.pool()
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            capacity: self.capacity(),
            read_reserved: self.read.reserve.load(Ordering::Acquire),
            read_visible: self.read.visible.load(Ordering::Acquire),
            write_visible: self.write.visible.load(Ordering::Acquire),
            write_reserved: self.write.reserve.load(Ordering::Acquire),
        }
    }
}

impl<R, const C: usize, const N: usize> TaskSource for BoundedQueue<R, C, N>
where
    R: Send + 'static,
{
    #[inline]
    fn try_run_next(&self) -> bool {
        BoundedQueue::try_run_next(self)
    }
}

impl<R, const C: usize, const N: usize> Default for BoundedQueue<R, C, N>
where
    R: Send + 'static,
{
    fn default() -> Self {
        Self::with_own_pool()
    }
}

impl<R, const C: usize, const N: usize> fmt::Debug for BoundedQueue<R, C, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("slots", &C)
            .field("write_reserve", &self.write.reserve.load(Ordering::Relaxed))
            .field("write_visible", &self.write.visible.load(Ordering::Relaxed))
            .field("read_reserve", &self.read.reserve.load(Ordering::Relaxed))
            .field("read_visible", &self.read.visible.load(Ordering::Relaxed))
            .finish()
    }
}
