use std::fmt;
use std::io;
use std::sync::Arc;

use postbus_config::{Config, DispatchConfig, InvocationConfig};
use postbus_threading::{
    CustomSpawn, DefaultSpawn, HandlerExecutorBuilder, Thread, ThreadSpawn, panic_message,
};

use crate::bus::AsyncBus;
use crate::dispatcher::DispatcherPool;
use crate::error::{
    ASYNC_INVOCATION_FAILED, BusError, ErrorHandler, ErrorHandlers, FailureCause,
    PublicationError,
};
use crate::invocation::{Executor, InvocationContext};
use crate::queue::PendingQueue;
use crate::runtime::{BusRuntime, properties};

/// Where the handler executor of a bus comes from.
enum ExecutorSource {
    /// Asynchronous handlers run on the dispatcher threads.
    None,
    /// An executor created and owned by the caller.
    Provided(Arc<Executor>),
    /// An executor created by the bus from configuration.
    Configured {
        config: InvocationConfig,
        handle: tokio::runtime::Handle,
    },
}

/// [`AsyncBusBuilder`] configures and starts an [`AsyncBus`].
///
/// By default, the bus uses an unbounded queue, the dispatcher count of [`DispatchConfig`] and no
/// handler executor.
pub struct AsyncBusBuilder<S = DefaultSpawn> {
    num_dispatchers: usize,
    queue: Option<PendingQueue>,
    thread_name: Option<Box<dyn FnMut(usize) -> String>>,
    spawn_handler: S,
    executor: ExecutorSource,
    error_handlers: Vec<Arc<dyn ErrorHandler>>,
    runtime: Option<BusRuntime>,
}

impl AsyncBusBuilder<DefaultSpawn> {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self {
            num_dispatchers: DispatchConfig::default().dispatchers,
            queue: None,
            thread_name: None,
            spawn_handler: DefaultSpawn,
            executor: ExecutorSource::None,
            error_handlers: Vec::new(),
            runtime: None,
        }
    }

    /// Creates a builder from the dispatch and invocation sections of a configuration.
    ///
    /// Returns [`BusError::MissingRuntime`] if asynchronous invocation is enabled but no runtime
    /// handle is given.
    pub fn from_config(
        config: &Config,
        handle: Option<tokio::runtime::Handle>,
    ) -> Result<Self, BusError> {
        let prefix = config.dispatch.thread_name.clone();
        let mut builder = Self::new()
            .num_dispatchers(config.dispatch.dispatchers)
            .queue(PendingQueue::with_capacity(config.dispatch.queue_capacity))
            .thread_name(move |index| format!("{prefix}-{index}"));

        if config.invocation.enabled {
            let handle = handle.ok_or(BusError::MissingRuntime)?;
            builder = builder.invocation(config.invocation.clone(), handle);
        }

        Ok(builder)
    }
}

impl Default for AsyncBusBuilder<DefaultSpawn> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> AsyncBusBuilder<S>
where
    S: ThreadSpawn,
{
    /// Sets the number of dispatcher threads.
    ///
    /// With `0` dispatchers, scheduled publications are never executed.
    pub fn num_dispatchers(mut self, num_dispatchers: usize) -> Self {
        self.num_dispatchers = num_dispatchers;
        self
    }

    /// Uses the given pending queue.
    ///
    /// The queue may be shared with other components, for instance to observe its size.
    pub fn queue(mut self, queue: PendingQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Specifies a naming convention for dispatcher threads.
    ///
    /// The closure receives the thread's index and returns a name.
    pub fn thread_name<F>(mut self, thread_name: F) -> Self
    where
        F: FnMut(usize) -> String + 'static,
    {
        self.thread_name = Some(Box::new(thread_name));
        self
    }

    /// Configures a custom procedure to spawn dispatcher threads.
    pub fn spawn_handler<F>(self, spawn_handler: F) -> AsyncBusBuilder<CustomSpawn<F>>
    where
        F: FnMut(Thread) -> io::Result<()>,
    {
        AsyncBusBuilder {
            num_dispatchers: self.num_dispatchers,
            queue: self.queue,
            thread_name: self.thread_name,
            spawn_handler: CustomSpawn::new(spawn_handler),
            executor: self.executor,
            error_handlers: self.error_handlers,
            runtime: self.runtime,
        }
    }

    /// Runs asynchronous handlers on an existing executor.
    ///
    /// The executor needs no task panic handler, since invocation tasks never panic. The bus
    /// shuts the executor down when the bus shuts down.
    pub fn executor(mut self, executor: Arc<Executor>) -> Self {
        self.executor = ExecutorSource::Provided(executor);
        self
    }

    /// Creates a handler executor from configuration when the bus is built.
    ///
    /// Handler panics are caught and reported within each invocation task. The executor's task
    /// panic handler only reports panics that escape a task otherwise.
    pub fn invocation(mut self, config: InvocationConfig, handle: tokio::runtime::Handle) -> Self {
        self.executor = ExecutorSource::Configured { config, handle };
        self
    }

    /// Adds an error handler.
    ///
    /// Handlers are called in the order they are added. Without any handler, errors are logged.
    pub fn error_handler<H>(mut self, handler: H) -> Self
    where
        H: ErrorHandler + 'static,
    {
        self.error_handlers.push(Arc::new(handler));
        self
    }

    /// Registers the bus in an existing property store instead of a new one.
    pub fn runtime(mut self, runtime: BusRuntime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Starts the dispatcher threads, and the handler executor if configured.
    pub fn build(mut self) -> Result<AsyncBus, BusError> {
        let errors = ErrorHandlers::new(self.error_handlers);

        let (executor, owned) = match self.executor {
            ExecutorSource::None => (None, false),
            ExecutorSource::Provided(executor) => (Some(executor), false),
            ExecutorSource::Configured { config, handle } => {
                let executor = build_executor(&config, handle, &errors)?;
                (Some(Arc::new(executor)), true)
            }
        };

        let queue = self.queue.unwrap_or_else(PendingQueue::unbounded);
        let context = InvocationContext::new(executor.clone(), errors.clone());
        let thread_name = self.thread_name.unwrap_or_else(|| {
            let prefix = DispatchConfig::default().thread_name;
            Box::new(move |index: usize| format!("{prefix}-{index}"))
        });

        let dispatchers = match DispatcherPool::start(
            self.num_dispatchers,
            &queue,
            &context,
            &mut self.spawn_handler,
            thread_name,
        ) {
            Ok(dispatchers) => dispatchers,
            Err(error) => {
                if let Some(executor) = executor.as_ref().filter(|_| owned) {
                    executor.shutdown();
                }
                return Err(error.into());
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let runtime = self.runtime.unwrap_or_default();
        runtime.add(properties::BUS_ID, id.clone());
        if let Some(executor) = &executor {
            runtime.add_arc(properties::ASYNC_HANDLER_EXECUTOR, executor.clone());
        }

        postbus_log::info!(
            bus = %id,
            dispatchers = dispatchers.size(),
            queue_capacity = queue.capacity(),
            async_handlers = executor.is_some(),
            "message bus started"
        );

        Ok(AsyncBus::new(id, queue, dispatchers, executor, errors, runtime))
    }
}

impl<S> fmt::Debug for AsyncBusBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncBusBuilder")
            .field("num_dispatchers", &self.num_dispatchers)
            .field("queue", &self.queue)
            .field("error_handlers", &self.error_handlers.len())
            .finish_non_exhaustive()
    }
}

fn build_executor(
    config: &InvocationConfig,
    handle: tokio::runtime::Handle,
    errors: &ErrorHandlers,
) -> io::Result<Executor> {
    let prefix = config.thread_name.clone();
    let errors = errors.clone();

    HandlerExecutorBuilder::new(handle)
        .num_threads(config.threads.max(1))
        .max_concurrency(config.max_concurrency)
        .thread_name(move |index| format!("{prefix}-{index}"))
        .task_panic_handler(move |payload| {
            errors.report(PublicationError::new(
                FailureCause::Panic(panic_message(payload.as_ref())),
                ASYNC_INVOCATION_FAILED,
            ));
        })
        .build()
}
