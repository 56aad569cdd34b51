use super::{
    allocator::Allocator,
    errors::SpawnError,
    result::SpawnResult,
};
use futures::task::{ArcWake, AtomicWaker};
use std::{
    any::Any,
    cell::UnsafeCell,
    fmt,
    future::Future,
    mem::ManuallyDrop,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    ptr::{self, NonNull},
    sync::{
        atomic::{self, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    thread::{self, Thread},
    time::{Duration, Instant},
};


const PENDING: u8 = 0;
const COMPLETE: u8 = 1;
const CLOSED: u8 = 2;

/// Type-erased operations of one concrete task cell.
struct TaskVTable<R> {
    run: unsafe fn(NonNull<Header<R>>),
    drop_callable: unsafe fn(NonNull<Header<R>>),
    dealloc: unsafe fn(NonNull<Header<R>>),
}

/// Part of a task cell shared by the queue side and the handle side.
/// Must stay the first field of [`TaskCell`].
#[repr(C)]
struct Header<R> {
    state: AtomicU8,
    refs: AtomicUsize,
    waker: AtomicWaker,
    output: UnsafeCell<Option<SpawnResult<R>>>,
    vtable: TaskVTable<R>,
}

#[repr(C)]
struct TaskCell<F, R, const N: usize> {
    header: Header<R>,
    alloc: ManuallyDrop<Allocator<TaskCell<F, R, N>, N>>,
    callable: UnsafeCell<ManuallyDrop<F>>,
}

impl<F, R, const N: usize> TaskCell<F, R, N>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    const VTABLE: TaskVTable<R> = TaskVTable {
        run: Self::run,
        drop_callable: Self::drop_callable,
        dealloc: Self::dealloc,
    };

    unsafe fn run(header: NonNull<Header<R>>) {
        let cell = header.cast::<Self>();
        let callable = ManuallyDrop::take(&mut *(*cell.as_ptr()).callable.get());

        let output = panic::catch_unwind(AssertUnwindSafe(callable))
            .map_err(|payload| SpawnError::Panic(panic_message(payload.as_ref())));

        let header = header.as_ref();
        *header.output.get() = Some(output);
        header.state.store(COMPLETE, Ordering::Release);
        header.waker.wake();
    }

    unsafe fn drop_callable(header: NonNull<Header<R>>) {
        let cell = header.cast::<Self>();
        ManuallyDrop::drop(&mut *(*cell.as_ptr()).callable.get());

        let header = header.as_ref();
        header.state.store(CLOSED, Ordering::Release);
        header.waker.wake();
    }

    unsafe fn dealloc(header: NonNull<Header<R>>) {
        let cell = header.cast::<Self>();
        let alloc = ManuallyDrop::take(&mut (*cell.as_ptr()).alloc);
        // The callable was consumed by `run` or dropped by `drop_callable`.
        ptr::drop_in_place(ptr::addr_of_mut!((*cell.as_ptr()).header));
        alloc.deallocate(cell, 1);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Drops one reference to the cell, freeing it when this was the last.
unsafe fn release<R>(header: NonNull<Header<R>>) {
    if header.as_ref().refs.fetch_sub(1, Ordering::Release) != 1 {
        return;
    }
    atomic::fence(Ordering::Acquire);
    (header.as_ref().vtable.dealloc)(header);
}

/// Places `f` into an arena-backed cell and returns the queue-side task
/// together with the caller-side handle.
pub(crate) fn new_task<F, R, T, const N: usize>(
    alloc: &Allocator<T, N>,
    f: F,
) -> (Task<R>, TaskHandle<R>)
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let alloc = alloc.rebind::<TaskCell<F, R, N>>();
    let cell = alloc.allocate(1);
    let value = TaskCell {
        header: Header {
            state: AtomicU8::new(PENDING),
            refs: AtomicUsize::new(2),
            waker: AtomicWaker::new(),
            output: UnsafeCell::new(None),
            vtable: TaskCell::<F, R, N>::VTABLE,
        },
        alloc: ManuallyDrop::new(alloc),
        callable: UnsafeCell::new(ManuallyDrop::new(f)),
    };
    // SAFETY: freshly allocated, correctly sized and aligned for the cell.
    unsafe { cell.as_ptr().write(value) };

    let header = cell.cast::<Header<R>>();
    (Task { header }, TaskHandle { header: Some(header) })
}


/// Queue-side half of a task: runs the callable at most once.
pub(crate) struct Task<R> {
    header: NonNull<Header<R>>,
}

// The callable and result are `Send`, enforced by `new_task`.
unsafe impl<R: Send> Send for Task<R> {}

impl<R> Task<R> {
    /// Executes the callable on the current thread and publishes its result.
    /// Panics are captured into the handle.
    pub(crate) fn run(self) {
        let this = ManuallyDrop::new(self);
        unsafe {
            (this.header.as_ref().vtable.run)(this.header);
            release(this.header);
        }
    }
}

impl<R> Drop for Task<R> {
    fn drop(&mut self) {
        unsafe {
            (self.header.as_ref().vtable.drop_callable)(self.header);
            release(self.header);
        }
    }
}


struct ThreadWaker(Thread);

impl ArcWake for ThreadWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.unpark();
    }
}

/// Caller-side half of a task: blocking, timed and async waiting.
///
/// An invalid handle (rejected push) never resolves to a value.
pub struct TaskHandle<R> {
    header: Option<NonNull<Header<R>>>,
}

unsafe impl<R: Send> Send for TaskHandle<R> {}
unsafe impl<R: Send> Sync for TaskHandle<R> {}

impl<R> TaskHandle<R> {
    pub(crate) fn invalid() -> Self {
        Self { header: None }
    }

    /// `false` for a rejected push or once the result has been taken.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.header.is_some()
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        match self.header {
            Some(header) => unsafe { header.as_ref() }.state.load(Ordering::Acquire) != PENDING,
            None => false,
        }
    }

    /// Takes the result if the task has finished; the handle becomes invalid.
    pub fn try_take(&mut self) -> Option<SpawnResult<R>> {
        let header = self.header?;
        let output = match unsafe { header.as_ref() }.state.load(Ordering::Acquire) {
            PENDING => return None,
            // SAFETY: the task side wrote `output` before the Release store of COMPLETE.
            COMPLETE => unsafe { (*header.as_ref().output.get()).take() }
                .unwrap_or(Err(SpawnError::Invalid)),
            _ => Err(SpawnError::ChannelClosed),
        };
        self.header = None;
        unsafe { release(header) };
        Some(output)
    }

    /// Blocks the current thread until the task finishes.
    pub fn wait(self) -> SpawnResult<R> {
        futures::executor::block_on(self)
    }

    /// Blocks for at most `timeout`. On `Err(Timeout)` the handle stays valid
    /// and can be waited on again.
    pub fn wait_timeout(&mut self, timeout: Duration) -> SpawnResult<R> {
        if !self.is_valid() {
            return Err(SpawnError::Invalid);
        }

        // A timeout past the end of `Instant` means no deadline at all.
        let deadline = Instant::now().checked_add(timeout);
        let waker = futures::task::waker(Arc::new(ThreadWaker(thread::current())));
        let mut cx = Context::from_waker(&waker);

        loop {
            if let Poll::Ready(output) = Pin::new(&mut *self).poll(&mut cx) {
                return output;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SpawnError::Timeout);
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }
    }

    /// Async counterpart of [`wait_timeout`](Self::wait_timeout); needs a
    /// tokio runtime with the time driver enabled.
    pub async fn await_timeout(self, timeout: Duration) -> SpawnResult<R> {
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => result,
            Err(_) => Err(SpawnError::Timeout),
        }
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = SpawnResult<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let header = match this.header {
            Some(header) => header,
            None => return Poll::Ready(Err(SpawnError::Invalid)),
        };

        // Register first so a completion racing with this poll is not missed.
        unsafe { header.as_ref() }.waker.register(cx.waker());
        match this.try_take() {
            Some(output) => Poll::Ready(output),
            None => Poll::Pending,
        }
    }
}

impl<R> Drop for TaskHandle<R> {
    fn drop(&mut self) {
        if let Some(header) = self.header.take() {
            unsafe { release(header) };
        }
    }
}

impl<R> fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("valid", &self.is_valid())
            .field("ready", &self.is_ready())
            .finish()
    }
}
