use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;

use crate::builder::HandlerExecutorBuilder;
use crate::multiplexing::TaskMultiplexer;
use crate::thread::{Thread, ThreadSpawn};

/// An error returned when a task cannot be handed to a [`HandlerExecutor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// The executor has been shut down and no longer accepts tasks.
    #[error("handler executor has been shut down")]
    Shutdown,
}

/// A thread-based pool for executing asynchronous handler invocations.
///
/// [`HandlerExecutor`] schedules tasks across a set of dedicated threads. Each thread drives its
/// tasks on a Tokio runtime handle and runs up to a configurable number of them concurrently.
/// The executor is safe to share between threads; every method takes `&self`.
///
/// The executor must be stopped explicitly with [`shutdown`](Self::shutdown). Tasks that were
/// accepted before shutdown still run to completion, after which the threads exit.
pub struct HandlerExecutor<F> {
    tx: Mutex<Option<flume::Sender<F>>>,
    queue: flume::Receiver<F>,
    active: Arc<AtomicUsize>,
    num_threads: usize,
}

impl<F> HandlerExecutor<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    /// Constructs a new [`HandlerExecutor`] using the configuration of a [`HandlerExecutorBuilder`].
    pub fn new<S>(mut builder: HandlerExecutorBuilder<S>) -> io::Result<Self>
    where
        S: ThreadSpawn,
    {
        let capacity = builder
            .queue_capacity
            .unwrap_or(builder.num_threads * 2)
            .max(1);
        let (tx, rx) = flume::bounded(capacity);
        let active = Arc::new(AtomicUsize::new(0));

        for index in 0..builder.num_threads {
            let runtime = builder.runtime.clone();
            let tasks = TaskMultiplexer::new(
                builder.max_concurrency,
                rx.clone().into_stream(),
                builder.task_panic_handler.clone(),
                active.clone(),
            )
            .boxed();

            let thread = Thread::new(index, move || runtime.block_on(tasks))
                .with_name(builder.thread_name.as_mut().map(|f| f(index)))
                .with_panic_handler(builder.thread_panic_handler.clone());

            builder.spawn_handler.spawn(thread)?;
        }

        postbus_log::debug!(
            threads = builder.num_threads,
            capacity,
            "handler executor started"
        );

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            queue: rx,
            active,
            num_threads: builder.num_threads,
        })
    }
}

impl<F> HandlerExecutor<F> {
    /// Schedules a task for execution within the pool.
    ///
    /// Blocks while the submission queue is full. Returns [`ExecutorError::Shutdown`] if the
    /// executor has been shut down. Must not be called from within a task of this executor, since
    /// a full queue would then block the thread that is supposed to drain it.
    pub fn spawn(&self, future: F) -> Result<(), ExecutorError> {
        let tx = self.sender()?;
        tx.send(future).map_err(|_| ExecutorError::Shutdown)
    }

    /// Schedules a task for execution, awaiting until it is enqueued.
    pub async fn spawn_async(&self, future: F) -> Result<(), ExecutorError> {
        let tx = self.sender()?;
        tx.send_async(future)
            .await
            .map_err(|_| ExecutorError::Shutdown)
    }

    /// Stops accepting tasks.
    ///
    /// Tasks that have already been accepted still run. Threads exit once the queue is drained
    /// and all of their tasks have completed. Returns `true` only for the call that actually
    /// performed the shutdown, subsequent calls have no effect.
    pub fn shutdown(&self) -> bool {
        let was_running = self.tx.lock().take().is_some();
        if was_running {
            postbus_log::debug!(queued = self.queue.len(), "handler executor shutting down");
        }
        was_running
    }

    /// Returns `true` if [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Returns the number of dedicated threads of this executor.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Returns the number of tasks waiting to be picked up by a thread.
    pub fn queued_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Returns the number of tasks currently being driven across all threads.
    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    fn sender(&self) -> Result<flume::Sender<F>, ExecutorError> {
        // Clone the sender so that a blocking send does not hold the lock.
        self.tx.lock().clone().ok_or(ExecutorError::Shutdown)
    }
}

impl<F> fmt::Debug for HandlerExecutor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerExecutor")
            .field("num_threads", &self.num_threads)
            .field("queued_tasks", &self.queued_tasks())
            .field("active_tasks", &self.active_tasks())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    use futures::future::BoxFuture;
    use tokio::runtime::{Handle, Runtime};
    use tokio::sync::Semaphore;
    use tokio::time::sleep;

    use super::*;

    type Task = BoxFuture<'static, ()>;

    struct TestBarrier {
        semaphore: Arc<Semaphore>,
        count: u32,
    }

    impl TestBarrier {
        fn new(count: u32) -> Self {
            Self {
                semaphore: Arc::new(Semaphore::new(count as usize)),
                count,
            }
        }

        async fn spawn<Fut>(&self, executor: &HandlerExecutor<Task>, f: Fut)
        where
            Fut: Future<Output = ()> + Send + 'static,
        {
            let permit = self.semaphore.clone().acquire_owned().await.unwrap();
            executor
                .spawn_async(
                    async move {
                        f.await;
                        drop(permit);
                    }
                    .boxed(),
                )
                .await
                .unwrap();
        }

        async fn wait(&self) {
            let _permits = self.semaphore.acquire_many(self.count).await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_executor_runs_all_tasks() {
        let executor = HandlerExecutorBuilder::new(Handle::current())
            .num_threads(1)
            .max_concurrency(2)
            .build()
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let barrier = TestBarrier::new(20);

        for _ in 0..20 {
            let counter = counter.clone();
            barrier
                .spawn(&executor, async move {
                    sleep(Duration::from_millis(10)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        barrier.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        executor.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_executor_runs_tasks_concurrently_across_threads() {
        let executor = HandlerExecutorBuilder::new(Handle::current())
            .num_threads(2)
            .max_concurrency(1)
            .build()
            .unwrap();

        let start = Instant::now();
        let barrier = TestBarrier::new(2);

        for _ in 0..2 {
            barrier
                .spawn(&executor, async {
                    sleep(Duration::from_millis(200)).await;
                })
                .await;
        }

        barrier.wait().await;

        // Sequential execution would take at least 400ms.
        let elapsed = start.elapsed();
        assert!(
            elapsed < Duration::from_millis(350),
            "Elapsed time was too high: {elapsed:?}"
        );
        executor.shutdown();
    }

    #[test]
    fn test_spawn_after_shutdown_fails() {
        let runtime = Runtime::new().unwrap();
        let executor: HandlerExecutor<Task> = HandlerExecutorBuilder::new(runtime.handle().clone())
            .build()
            .unwrap();

        assert!(executor.shutdown());
        assert!(executor.is_shutdown());
        assert_eq!(
            executor.spawn(async {}.boxed()),
            Err(ExecutorError::Shutdown)
        );
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let runtime = Runtime::new().unwrap();
        let executor: HandlerExecutor<Task> = HandlerExecutorBuilder::new(runtime.handle().clone())
            .num_threads(2)
            .build()
            .unwrap();

        assert!(executor.shutdown());
        assert!(!executor.shutdown());
        assert!(!executor.shutdown());
        assert!(executor.is_shutdown());
    }

    #[test]
    fn test_threads_exit_after_shutdown_and_finish_accepted_tasks() {
        let runtime = Runtime::new().unwrap();
        let (exit_tx, exit_rx) = flume::unbounded();
        let ran = Arc::new(AtomicBool::new(false));

        let executor: HandlerExecutor<Task> = HandlerExecutorBuilder::new(runtime.handle().clone())
            .num_threads(2)
            .spawn_handler(move |thread: Thread| {
                let exit_tx = exit_tx.clone();
                std::thread::spawn(move || {
                    thread.run();
                    exit_tx.send(()).ok();
                });
                Ok(())
            })
            .build()
            .unwrap();

        let ran_clone = ran.clone();
        executor
            .spawn(
                async move {
                    ran_clone.store(true, Ordering::SeqCst);
                }
                .boxed(),
            )
            .unwrap();
        executor.shutdown();

        for _ in 0..2 {
            exit_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_task_panic_handler_keeps_thread_alive() {
        let runtime = Runtime::new().unwrap();
        let (panic_tx, panic_rx) = flume::unbounded();
        let (done_tx, done_rx) = flume::unbounded();

        let executor: HandlerExecutor<Task> = HandlerExecutorBuilder::new(runtime.handle().clone())
            .num_threads(1)
            .task_panic_handler(move |payload| {
                panic_tx
                    .send(crate::panic_message(payload.as_ref()))
                    .ok();
            })
            .build()
            .unwrap();

        executor
            .spawn(
                async {
                    panic!("handler exploded");
                }
                .boxed(),
            )
            .unwrap();
        executor
            .spawn(
                async move {
                    done_tx.send(()).ok();
                }
                .boxed(),
            )
            .unwrap();

        let message = panic_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(message, "handler exploded");
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        executor.shutdown();
    }

    #[test]
    fn test_custom_spawn_receives_named_threads() {
        let runtime = Runtime::new().unwrap();
        let names = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let names_clone = names.clone();

        let executor: HandlerExecutor<Task> = HandlerExecutorBuilder::new(runtime.handle().clone())
            .num_threads(3)
            .thread_name(|index| format!("handler-executor-{index}"))
            .spawn_handler(move |thread: Thread| {
                names_clone.lock().push(thread.name().map(str::to_owned));
                std::thread::spawn(move || thread.run());
                Ok(())
            })
            .build()
            .unwrap();

        assert_eq!(executor.num_threads(), 3);
        assert_eq!(
            *names.lock(),
            vec![
                Some("handler-executor-0".to_owned()),
                Some("handler-executor-1".to_owned()),
                Some("handler-executor-2".to_owned()),
            ]
        );
        executor.shutdown();
    }
}
