use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use postbus_config::Config;

use crate::builder::AsyncBusBuilder;
use crate::dispatcher::DispatcherPool;
use crate::error::{
    BusError, ENQUEUE_INTERRUPTED, ErrorHandlers, FailureCause, PublicationError,
};
use crate::invocation::Executor;
use crate::publication::MessagePublication;
use crate::queue::{Interrupted, PendingQueue};
use crate::runtime::BusRuntime;
use crate::shutdown::ShutdownSignal;

/// The asynchronous dispatch engine of a message bus.
///
/// Publications are scheduled into a [`PendingQueue`] and executed by a pool of dispatcher
/// threads. Handlers that request asynchronous delivery are additionally run on a handler
/// executor, if one is configured.
///
/// The bus must be stopped explicitly with [`shutdown`](Self::shutdown). There is no shutdown on
/// drop: dropping the bus lets idle dispatchers exit once they notice it is gone, but abandoned
/// publications are not logged and a shared executor keeps running. [`scoped`](Self::scoped)
/// runs a closure and shuts down afterwards.
///
/// ```
/// use postbus_dispatch::{AsyncBus, HandlerInvocation, MessagePublication, handler_fn};
///
/// let bus = AsyncBus::builder().num_dispatchers(1).build().unwrap();
///
/// let publication = MessagePublication::new(
///     "hello",
///     vec![HandlerInvocation::synchronous(handler_fn(|_| Ok(())))],
/// );
/// let publication = bus.schedule_async(publication);
/// assert!(publication.is_scheduled());
///
/// bus.shutdown();
/// ```
pub struct AsyncBus {
    id: String,
    queue: PendingQueue,
    dispatchers: DispatcherPool,
    signal: ShutdownSignal,
    executor: Option<Arc<Executor>>,
    errors: ErrorHandlers,
    runtime: BusRuntime,
}

impl AsyncBus {
    /// Returns a builder with default settings.
    pub fn builder() -> AsyncBusBuilder {
        AsyncBusBuilder::new()
    }

    /// Builds a bus from its configuration.
    ///
    /// `handle` drives asynchronous handler invocations and is required when
    /// `invocation.enabled` is set.
    pub fn from_config(
        config: &Config,
        handle: Option<tokio::runtime::Handle>,
    ) -> Result<Self, BusError> {
        AsyncBusBuilder::from_config(config, handle)?.build()
    }

    pub(crate) fn new(
        id: String,
        queue: PendingQueue,
        dispatchers: DispatcherPool,
        executor: Option<Arc<Executor>>,
        errors: ErrorHandlers,
        runtime: BusRuntime,
    ) -> Self {
        Self {
            id,
            queue,
            signal: dispatchers.signal(),
            dispatchers,
            executor,
            errors,
            runtime,
        }
    }

    /// Schedules a publication for asynchronous execution.
    ///
    /// Blocks while a bounded queue is full. If the bus shuts down while waiting, the
    /// interruption is reported to the error handlers and the publication is returned without
    /// being scheduled. The same applies to publications scheduled after shutdown.
    pub fn schedule_async(&self, publication: MessagePublication) -> MessagePublication {
        match self.queue.put(publication.clone(), &self.signal) {
            Ok(()) => publication.mark_scheduled(),
            Err(Interrupted) => self.report_interrupted(&publication),
        }

        publication
    }

    /// Schedules a publication, waiting at most `timeout` for space in the queue.
    ///
    /// If the queue stays full, the publication is returned unchanged and not scheduled. This is
    /// not reported as an error, check [`MessagePublication::is_scheduled`] instead.
    pub fn schedule_async_timeout(
        &self,
        publication: MessagePublication,
        timeout: Duration,
    ) -> MessagePublication {
        match self.queue.offer(publication.clone(), timeout, &self.signal) {
            Ok(true) => publication.mark_scheduled(),
            Ok(false) => {
                postbus_log::debug!(
                    publication = publication.id(),
                    timeout_ms = timeout.as_millis() as u64,
                    "pending queue full, publication not scheduled"
                );
            }
            Err(Interrupted) => self.report_interrupted(&publication),
        }

        publication
    }

    /// Stops the dispatchers and the handler executor.
    ///
    /// Publications still waiting in the queue are abandoned. Handler invocations already
    /// accepted by the executor still run. Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        if self.dispatchers.shutdown() {
            let abandoned = self.queue.size();
            if abandoned > 0 {
                postbus_log::warn!(
                    bus = %self.id,
                    abandoned,
                    "shutting down with pending publications"
                );
            }
            postbus_log::info!(bus = %self.id, "message bus shut down");
        }

        if let Some(executor) = &self.executor {
            executor.shutdown();
        }
    }

    /// Runs `f` with this bus and shuts it down afterwards, also if `f` panics.
    pub fn scoped<F, R>(self, f: F) -> R
    where
        F: FnOnce(&Self) -> R,
    {
        struct ShutdownGuard<'a>(&'a AsyncBus);

        impl Drop for ShutdownGuard<'_> {
            fn drop(&mut self) {
                self.0.shutdown();
            }
        }

        let guard = ShutdownGuard(&self);
        f(guard.0)
    }

    /// Returns `true` if [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.dispatchers.is_shutdown()
    }

    /// Returns `true` if publications are waiting in the pending queue.
    ///
    /// Publications that a dispatcher has already taken do not count.
    pub fn has_pending_messages(&self) -> bool {
        !self.queue.is_empty()
    }

    /// The number of publications waiting in the pending queue.
    pub fn pending_messages(&self) -> usize {
        self.queue.size()
    }

    /// The handler executor, if asynchronous invocation is enabled.
    pub fn executor(&self) -> Option<&Arc<Executor>> {
        self.executor.as_ref()
    }

    /// The runtime property store this bus registered itself in.
    pub fn runtime(&self) -> &BusRuntime {
        &self.runtime
    }

    /// The unique identifier of this bus.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The number of dispatcher threads.
    pub fn num_dispatchers(&self) -> usize {
        self.dispatchers.size()
    }

    /// The error handlers of this bus.
    pub fn error_handlers(&self) -> &ErrorHandlers {
        &self.errors
    }

    fn report_interrupted(&self, publication: &MessagePublication) {
        self.errors.report(
            PublicationError::new(FailureCause::Interrupted, ENQUEUE_INTERRUPTED)
                .with_publication(publication.clone()),
        );
    }
}

impl fmt::Debug for AsyncBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncBus")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("dispatchers", &self.dispatchers)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}
