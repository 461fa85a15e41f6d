use std::any::Any;
use std::future::Future;
use std::io;
use std::sync::Arc;

use crate::executor::HandlerExecutor;
use crate::thread::{CustomSpawn, DefaultSpawn, PanicHandler, Thread, ThreadSpawn};

/// Configures a [`HandlerExecutor`] before its threads are started.
///
/// Every executor thread blocks on the given Tokio runtime handle while it multiplexes its
/// tasks. Threads and tasks share one bounded submission queue. Without a task panic handler a
/// panicking task unwinds its thread, which then stops taking tasks for good.
pub struct HandlerExecutorBuilder<S = DefaultSpawn> {
    pub(crate) runtime: tokio::runtime::Handle,
    pub(crate) thread_name: Option<Box<dyn FnMut(usize) -> String>>,
    pub(crate) thread_panic_handler: Option<Arc<PanicHandler>>,
    pub(crate) task_panic_handler: Option<Arc<PanicHandler>>,
    pub(crate) spawn_handler: S,
    pub(crate) num_threads: usize,
    pub(crate) max_concurrency: usize,
    pub(crate) queue_capacity: Option<usize>,
}

impl HandlerExecutorBuilder<DefaultSpawn> {
    /// Starts with a single thread running one task at a time.
    ///
    /// The handle only drives the tasks. Spawning tasks onto the executor does not require a
    /// runtime context.
    pub fn new(runtime: tokio::runtime::Handle) -> HandlerExecutorBuilder<DefaultSpawn> {
        HandlerExecutorBuilder {
            runtime,
            thread_name: None,
            thread_panic_handler: None,
            task_panic_handler: None,
            spawn_handler: DefaultSpawn,
            num_threads: 1,
            max_concurrency: 1,
            queue_capacity: None,
        }
    }
}

impl<S> HandlerExecutorBuilder<S>
where
    S: ThreadSpawn,
{
    /// Names executor threads by their index, starting at `0`.
    pub fn thread_name<F>(mut self, thread_name: F) -> Self
    where
        F: FnMut(usize) -> String + 'static,
    {
        self.thread_name = Some(Box::new(thread_name));
        self
    }

    /// Called with the payload when an executor thread unwinds.
    ///
    /// With a [`task_panic_handler`](Self::task_panic_handler) in place, task panics never get
    /// here. The thread is gone either way.
    pub fn thread_panic_handler<F>(mut self, panic_handler: F) -> Self
    where
        F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        self.thread_panic_handler = Some(Arc::new(panic_handler));
        self
    }

    /// Called with the payload when a single task panics.
    ///
    /// The panicking task is dropped and the thread keeps driving its other tasks. This is what
    /// keeps an executor at full size when tasks may panic.
    pub fn task_panic_handler<F>(mut self, panic_handler: F) -> Self
    where
        F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        self.task_panic_handler = Some(Arc::new(panic_handler));
        self
    }

    /// Hands every [`Thread`] to `spawn_handler` instead of `std::thread::spawn`.
    ///
    /// The handler must eventually call [`Thread::run`]. An error aborts [`build`](Self::build).
    pub fn spawn_handler<F>(self, spawn_handler: F) -> HandlerExecutorBuilder<CustomSpawn<F>>
    where
        F: FnMut(Thread) -> io::Result<()>,
    {
        HandlerExecutorBuilder {
            runtime: self.runtime,
            thread_name: self.thread_name,
            thread_panic_handler: self.thread_panic_handler,
            task_panic_handler: self.task_panic_handler,
            spawn_handler: CustomSpawn::new(spawn_handler),
            num_threads: self.num_threads,
            max_concurrency: self.max_concurrency,
            queue_capacity: self.queue_capacity,
        }
    }

    /// Sets the number of executor threads.
    ///
    /// Together with [`max_concurrency`](Self::max_concurrency) this bounds how many handler
    /// invocations run at once.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Sets how many tasks a single thread polls concurrently.
    ///
    /// Handlers that block their thread gain nothing from values above `1`.
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets how many submitted tasks may wait for a free slot.
    ///
    /// [`HandlerExecutor::spawn`] blocks once the queue is full. Defaults to twice the number of
    /// threads, and `0` is raised to `1`.
    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = Some(queue_capacity);
        self
    }

    /// Spawns all threads and returns the running executor.
    pub fn build<F>(self) -> io::Result<HandlerExecutor<F>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        HandlerExecutor::new(self)
    }
}
