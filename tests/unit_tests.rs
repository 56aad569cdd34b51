#[cfg(test)]
mod tests {
    use ringpool::{
        errors::SpawnError,
        pool::{Config, WorkerPool},
        queue::{BoundedQueue, TaskSource},
        MemoryPool,
    };
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc, Arc,
        },
        thread,
        time::Duration,
    };

    type TaskQueue<R> = BoundedQueue<R, 512, { 64 * 1024 }>;

    #[test]
    fn test_single_thread_push_and_drain() {
        println!("\n=== TEST: 256 tasks, synchronous drain ===");
        let queue = TaskQueue::<usize>::with_own_pool();

        let handles: Vec<_> = (0..256usize)
            .map(|i| queue.try_push_with(|i| i + i * 2, i))
            .collect();
        assert!(handles.iter().all(|h| h.is_valid()));
        assert_eq!(queue.len(), 256);

        let mut executed = 0;
        while queue.try_run_next() {
            executed += 1;
        }
        assert_eq!(executed, 256);

        let sum: usize = handles.into_iter().map(|h| h.wait().unwrap()).sum();
        let expected: usize = (0..256).map(|i| 3 * i).sum();
        assert_eq!(sum, expected);
        println!("  ✓ sum = {}", sum);
    }

    #[test]
    fn test_full_queue_rejects_push() {
        println!("\n=== TEST: push on a full queue ===");
        let queue = BoundedQueue::<u32, 8, 4096>::with_own_pool();

        let accepted: Vec<_> = (0..7u32).map(|i| queue.try_push(move || i)).collect();
        assert!(accepted.iter().all(|h| h.is_valid()));
        assert_eq!(queue.capacity(), 7);

        for _ in 0..3 {
            let rejected = queue.try_push(|| u32::MAX);
            assert!(!rejected.is_valid());
            assert_eq!(rejected.wait(), Err(SpawnError::Invalid));
        }

        assert_eq!(queue.len(), 7);
        while queue.try_run_next() {}
        let values: Vec<_> = accepted.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(values, (0..7).collect::<Vec<_>>());
        println!("  ✓ unread slots survived rejected pushes");
    }

    #[test]
    fn test_empty_queue_is_inert() {
        println!("\n=== TEST: run on an empty queue ===");
        let queue = TaskQueue::<()>::with_own_pool();
        let before = queue.metrics();
        for _ in 0..10_000 {
            assert!(!queue.try_run_next());
        }
        assert_eq!(queue.metrics(), before);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_shared_pool_between_queues() {
        println!("\n=== TEST: one arena, two queues ===");
        let pool = Arc::new(MemoryPool::<{ 16 * 1024 }>::new());
        let ints = BoundedQueue::<i64, 16, { 16 * 1024 }>::new(pool.clone());
        let strings = BoundedQueue::<String, 16, { 16 * 1024 }>::new(pool.clone());

        let a = ints.try_push(|| -5);
        let b = strings.try_push(|| "shared".to_string());
        assert!(pool.used() > 0);

        assert!(ints.try_run_next());
        assert!(strings.try_run_next());
        assert_eq!(a.wait(), Ok(-5));
        assert_eq!(b.wait(), Ok("shared".to_string()));
        assert!(Arc::ptr_eq(ints.pool(), strings.pool()));
    }

    #[test]
    fn test_thread_count_is_clamped_to_hardware() {
        println!("\n=== TEST: worker count clamping ===");
        let queue = Arc::new(TaskQueue::<()>::with_own_pool());
        let hardware = num_cpus::get();

        let pool = WorkerPool::new(queue.clone(), hardware + 4).unwrap();
        assert_eq!(pool.thread_count(), hardware);
        pool.shutdown();

        let pool = WorkerPool::with_config(queue.clone(), Config::default()).unwrap();
        assert_eq!(pool.thread_count(), hardware);
        assert_eq!(pool.metrics().threads, hardware);
        println!("  ✓ {} hardware threads", hardware);
    }

    #[test]
    fn test_panic_does_not_kill_worker() {
        println!("\n=== TEST: task panic stays in its handle ===");
        let queue = Arc::new(TaskQueue::<i32>::with_own_pool());
        let pool = WorkerPool::new(queue.clone(), 1).unwrap();

        let bad = queue.try_push(|| panic!("broken task"));
        let good = queue.try_push(|| 17);

        assert_eq!(bad.wait(), Err(SpawnError::Panic("broken task".into())));
        assert_eq!(good.wait(), Ok(17));
        pool.shutdown();
    }

    #[test]
    fn test_timed_wait() {
        println!("\n=== TEST: timed wait ===");
        let queue = TaskQueue::<u64>::with_own_pool();
        let mut handle = queue.try_push(|| 99);

        let result = handle.wait_timeout(Duration::from_millis(20));
        match result {
            Err(SpawnError::Timeout) => println!("  ✓ timed out while nobody drains"),
            other => panic!("expected a timeout, got {:?}", other),
        }

        assert!(queue.try_run_next());
        assert_eq!(handle.wait_timeout(Duration::from_secs(1)), Ok(99));
    }

    /// Ends every worker burst after a single task, so the stop flag is
    /// checked between any two tasks.
    struct OneTaskPerBurst {
        queue: Arc<TaskQueue<()>>,
        burst_done: AtomicBool,
    }

    impl TaskSource for OneTaskPerBurst {
        fn try_run_next(&self) -> bool {
            if self.burst_done.swap(false, Ordering::AcqRel) {
                return false;
            }
            let ran = self.queue.try_run_next();
            self.burst_done.store(ran, Ordering::Release);
            ran
        }
    }

    #[test]
    fn test_shutdown_with_unclaimed_tasks() {
        println!("\n=== TEST: shutdown with queued work ===");
        const QUEUED: usize = 200;
        let queue = Arc::new(TaskQueue::<()>::with_own_pool());
        let executed = Arc::new(AtomicUsize::new(0));

        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let blocker = queue.try_push(move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
        });
        let handles: Vec<_> = (0..QUEUED)
            .map(|_| {
                let executed = executed.clone();
                queue.try_push(move || {
                    executed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        assert!(handles.iter().all(|h| h.is_valid()));

        let source = Arc::new(OneTaskPerBurst {
            queue: queue.clone(),
            burst_done: AtomicBool::new(false),
        });
        let pool = WorkerPool::new(source.clone(), 1).unwrap();
        started_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("worker never picked up the first task");

        // The only worker is inside the first task while the flag goes up.
        pool.request_stop();
        gate_tx.send(()).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            pool.shutdown();
            let _ = done_tx.send(());
        });
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("pool shutdown deadlocked");

        assert_eq!(blocker.wait(), Ok(()));
        assert_eq!(executed.load(Ordering::SeqCst), 0, "an abandoned task ran");
        assert_eq!(queue.len(), QUEUED);
        println!("  ✓ 1 ran, {} abandoned", queue.len());

        drop(source);
        let queue = Arc::try_unwrap(queue).expect("workers released the queue");
        drop(queue);
        let closed = handles
            .into_iter()
            .map(|h| h.wait())
            .filter(|r| matches!(r, Err(SpawnError::ChannelClosed)))
            .count();
        assert_eq!(closed, QUEUED);
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_async_handle() {
        println!("\n=== TEST: awaiting a handle ===");
        let queue = Arc::new(TaskQueue::<String>::with_own_pool());
        let pool = WorkerPool::new(queue.clone(), 2).unwrap();

        let handle = queue.try_push_with(|(a, b): (&str, u8)| format!("{a}-{b}"), ("task", 7));
        let value = handle.await_timeout(Duration::from_secs(5)).await;
        assert_eq!(value, Ok("task-7".to_string()));

        let handle = queue.try_push(|| "direct".to_string());
        assert_eq!(handle.await, Ok("direct".to_string()));
        pool.shutdown();
    }
}
