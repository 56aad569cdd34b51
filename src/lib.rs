//! Lock-free bounded task queue with an arena-backed task store
//!
//! # Features
//! - Bounded MPMC ring of `C` slots driven by reservation/visibility counters
//! - Task cells carved out of a shared bump arena, heap only on exhaustion
//! - Per-task result handles: blocking, timed and async waiting
//! - Panics captured into the task's own handle
//! - Busy-poll worker pool with injectable per-thread platform hooks

pub mod allocator;
pub mod arena;
pub mod errors;
pub mod handle;
pub mod model;
pub mod platform;
pub mod pool;
pub mod queue;
pub mod result;

pub use allocator::Allocator;
pub use arena::{MemoryPool, DEFAULT_ALIGN};
pub use errors::{PoolError, SpawnError};
pub use handle::TaskHandle;
pub use platform::{NativeHooks, NoopHooks, PlatformHooks};
pub use pool::{Config, WorkerPool};
pub use queue::{BoundedQueue, TaskSource};
pub use result::{PoolResult, SpawnResult};
