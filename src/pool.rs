use super::{
    errors::PoolError,
    model::PoolMetrics,
    platform::{NativeHooks, NoopHooks, PlatformHooks},
    queue::TaskSource,
    result::PoolResult,
};
use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};


/// Worker pool configuration.
#[derive(Clone)]
pub struct Config {
    /// Requested worker count; `0` means every hardware thread. Larger
    /// values are clamped to the hardware thread count.
    pub num_threads: usize,
    pub elevated_priority: bool,
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
    pub hooks: Arc<dyn PlatformHooks>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_threads: 0,
            elevated_priority: false,
            thread_name_prefix: "ringpool-worker".to_string(),
            stack_size: None,
            hooks: Arc::new(NoopHooks),
        }
    }
}

impl Config {
    /// Every hardware thread, elevated priority, denormals flushed.
    pub fn realtime() -> Self {
        Self {
            elevated_priority: true,
            hooks: Arc::new(NativeHooks),
            ..Default::default()
        }
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_elevated_priority(mut self, enabled: bool) -> Self {
        self.elevated_priority = enabled;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn PlatformHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Number of workers actually started on this machine.
    pub fn worker_threads(&self) -> usize {
        resolve_thread_count(self.num_threads, num_cpus::get())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("num_threads", &self.num_threads)
            .field("elevated_priority", &self.elevated_priority)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("stack_size", &self.stack_size)
            .field("hooks", &self.hooks)
            .finish()
    }
}

#[inline]
fn resolve_thread_count(requested: usize, hardware: usize) -> usize {
    let hardware = hardware.max(1);
    if requested == 0 {
        hardware
    } else {
        requested.min(hardware)
    }
}


/// Body of one worker thread.
pub(crate) struct Worker<Q: ?Sized> {
    index: usize,
    queue: Arc<Q>,
    stop: Arc<AtomicBool>,
    executed: Arc<AtomicU64>,
    elevated_priority: bool,
    hooks: Arc<dyn PlatformHooks>,
}

impl<Q: TaskSource + ?Sized> Worker<Q> {
    fn run(self) {
        tracing::debug!(worker = self.index, "worker started");
        self.hooks.flush_denormals();
        if self.elevated_priority {
            self.hooks.elevate_priority();
        }

        while !self.stop.load(Ordering::Acquire) {
            let mut burst = 0u64;
            while self.queue.try_run_next() {
                burst += 1;
            }
            if burst > 0 {
                self.executed.fetch_add(burst, Ordering::Relaxed);
            }
            thread::yield_now();
        }
        tracing::debug!(worker = self.index, "worker stopped");
    }
}

/// Fixed set of busy-polling threads draining one queue.
///
/// Dropping the pool stops and joins every worker. Tasks still queued at
/// that point are left in the queue and never run by this pool.
pub struct WorkerPool {
    stop: Arc<AtomicBool>,
    executed: Arc<AtomicU64>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// `num_threads` workers with the default configuration.
    pub fn new<Q>(queue: Arc<Q>, num_threads: usize) -> PoolResult<Self>
    where
        Q: TaskSource + ?Sized + 'static,
    {
        Self::with_config(queue, Config::default().with_threads(num_threads))
    }

    pub fn with_config<Q>(queue: Arc<Q>, config: Config) -> PoolResult<Self>
    where
        Q: TaskSource + ?Sized + 'static,
    {
        Self::start(queue, config, |builder, worker| builder.spawn(move || worker.run()))
    }

    fn start<Q, S>(queue: Arc<Q>, config: Config, mut spawn: S) -> PoolResult<Self>
    where
        Q: TaskSource + ?Sized + 'static,
        S: FnMut(thread::Builder, Worker<Q>) -> io::Result<JoinHandle<()>>,
    {
        let num_threads = config.worker_threads();
        let mut pool = WorkerPool {
            stop: Arc::new(AtomicBool::new(false)),
            executed: Arc::new(AtomicU64::new(0)),
            threads: Vec::with_capacity(num_threads),
        };

        for index in 0..num_threads {
            let mut builder =
                thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, index));
            if let Some(size) = config.stack_size {
                builder = builder.stack_size(size);
            }

            let worker = Worker {
                index,
                queue: queue.clone(),
                stop: pool.stop.clone(),
                executed: pool.executed.clone(),
                elevated_priority: config.elevated_priority,
                hooks: config.hooks.clone(),
            };

            match spawn(builder, worker) {
                Ok(handle) => pool.threads.push(handle),
                Err(source) => {
                    tracing::error!(
                        worker = index,
                        started = pool.threads.len(),
                        error = %source,
                        "failed to spawn worker thread"
                    );
                    // Dropping `pool` raises the stop flag and joins the
                    // workers that did start.
                    return Err(PoolError::Spawn { index, source });
                }
            }
        }

        tracing::info!(
            threads = num_threads,
            elevated_priority = config.elevated_priority,
            "worker pool started"
        );
        Ok(pool)
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            threads: self.threads.len(),
            executed_tasks: self.executed.load(Ordering::Relaxed),
        }
    }

    /// Raises the stop flag without waiting. Each worker exits once its
    /// current burst ends; joining still happens on drop or [`shutdown`](Self::shutdown).
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Stops and joins every worker. Same as dropping the pool.
    pub fn shutdown(self) {
        drop(self);
    }

    fn stop_and_join(&mut self) {
        self.request_stop();
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                tracing::error!(thread = ?name, "worker thread terminated abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let threads = self.threads.len();
        self.stop_and_join();
        tracing::info!(
            threads,
            executed = self.executed.load(Ordering::Relaxed),
            "worker pool stopped"
        );
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads.len())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::atomic::AtomicUsize, time::Duration};

    #[derive(Default)]
    struct CountingSource {
        polls: AtomicUsize,
    }

    impl TaskSource for CountingSource {
        fn try_run_next(&self) -> bool {
            self.polls.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    #[derive(Debug, Default)]
    struct RecordingHooks {
        elevated: AtomicUsize,
        flushed: AtomicUsize,
    }

    impl PlatformHooks for RecordingHooks {
        fn elevate_priority(&self) {
            self.elevated.fetch_add(1, Ordering::SeqCst);
        }

        fn flush_denormals(&self) {
            self.flushed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn thread_count_resolution() {
        assert_eq!(resolve_thread_count(0, 8), 8);
        assert_eq!(resolve_thread_count(3, 8), 3);
        assert_eq!(resolve_thread_count(64, 8), 8);
        assert_eq!(resolve_thread_count(0, 0), 1);
    }

    #[test]
    fn hooks_run_once_per_worker() {
        let hooks = Arc::new(RecordingHooks::default());
        let queue = Arc::new(CountingSource::default());
        let config = Config::default()
            .with_threads(usize::MAX)
            .with_elevated_priority(true)
            .with_hooks(hooks.clone());

        let pool = WorkerPool::with_config(queue, config).unwrap();
        let threads = pool.thread_count();
        pool.shutdown();

        assert_eq!(threads, num_cpus::get());
        assert_eq!(hooks.flushed.load(Ordering::SeqCst), threads);
        assert_eq!(hooks.elevated.load(Ordering::SeqCst), threads);
    }

    #[test]
    fn priority_hook_skipped_unless_requested() {
        let hooks = Arc::new(RecordingHooks::default());
        let config = Config::default().with_threads(1).with_hooks(hooks.clone());
        WorkerPool::with_config(Arc::new(CountingSource::default()), config)
            .unwrap()
            .shutdown();

        assert_eq!(hooks.flushed.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.elevated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn workers_poll_until_stopped() {
        let queue = Arc::new(CountingSource::default());
        let pool = WorkerPool::new(queue.clone(), 1).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        pool.shutdown();

        let polls = queue.polls.load(Ordering::Relaxed);
        assert!(polls > 0);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(queue.polls.load(Ordering::Relaxed), polls, "no polling after shutdown");
        assert_eq!(Arc::strong_count(&queue), 1);
    }

    #[test]
    fn requested_stop_ends_polling_before_join() {
        let queue = Arc::new(CountingSource::default());
        let pool = WorkerPool::new(queue.clone(), 1).unwrap();
        assert!(!pool.is_stopping());

        pool.request_stop();
        assert!(pool.is_stopping());
        // The worker drops its queue reference once it leaves the loop.
        while Arc::strong_count(&queue) > 1 {
            std::thread::yield_now();
        }
        let polls = queue.polls.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(queue.polls.load(Ordering::Relaxed), polls);
        pool.shutdown();
    }

    #[test]
    fn spawn_failure_stops_started_workers() {
        if num_cpus::get() < 2 {
            return;
        }
        let queue = Arc::new(CountingSource::default());
        let config = Config::default().with_threads(2);

        let result = WorkerPool::start(queue.clone(), config, |builder, worker| {
            if worker.index == 1 {
                return Err(io::Error::new(io::ErrorKind::Other, "no more threads"));
            }
            builder.spawn(move || worker.run())
        });

        match result {
            Err(PoolError::Spawn { index, .. }) => assert_eq!(index, 1),
            Ok(_) => panic!("pool construction should have failed"),
        }
        // Every worker (and the rejected one) released its queue reference.
        assert_eq!(Arc::strong_count(&queue), 1);
    }
}
