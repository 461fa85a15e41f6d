use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use postbus_threading::{HandlerExecutor, panic_message};

use crate::error::{
    ASYNC_DISPATCH_FAILED, ASYNC_INVOCATION_FAILED, ASYNC_SUBMISSION_FAILED, ErrorHandlers,
    FailureCause, HANDLER_INVOCATION_FAILED, HandlerError, PublicationError,
};
use crate::publication::{Message, MessagePublication};

/// A unit of work submitted to the handler executor.
pub type Task = BoxFuture<'static, ()>;

/// The executor running handlers that request asynchronous delivery.
pub type Executor = HandlerExecutor<Task>;

/// Processes messages delivered by a publication.
pub trait Handler: Send + Sync + 'static {
    /// Handles a single message.
    fn handle(&self, message: &Message) -> Result<(), HandlerError>;

    /// A name identifying this handler in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A [`Handler`] backed by a closure, created with [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F> Handler for HandlerFn<F>
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (self.f)(message)
    }

    fn name(&self) -> &str {
        std::any::type_name::<F>()
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn")
            .field("f", &std::any::type_name::<F>())
            .finish()
    }
}

/// Creates a [`Handler`] from a closure.
///
/// ```
/// use postbus_dispatch::{Handler, handler_fn};
///
/// let handler = handler_fn(|message| {
///     assert!(message.is::<u32>());
///     Ok(())
/// });
/// ```
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    HandlerFn { f }
}

/// How a handler receives its messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// The handler runs on the thread executing the publication.
    #[default]
    Synchronous,
    /// The handler is submitted to the handler executor.
    ///
    /// Without an executor the handler runs synchronously.
    Asynchronous,
}

/// A handler bound to a publication together with its delivery mode.
#[derive(Clone)]
pub struct HandlerInvocation {
    handler: Arc<dyn Handler>,
    delivery: Delivery,
}

impl HandlerInvocation {
    /// Creates an invocation of a shared handler.
    pub fn new(handler: Arc<dyn Handler>, delivery: Delivery) -> Self {
        Self { handler, delivery }
    }

    /// Creates an invocation running on the dispatching thread.
    pub fn synchronous<H: Handler>(handler: H) -> Self {
        Self::new(Arc::new(handler), Delivery::Synchronous)
    }

    /// Creates an invocation running on the handler executor.
    pub fn asynchronous<H: Handler>(handler: H) -> Self {
        Self::new(Arc::new(handler), Delivery::Asynchronous)
    }

    /// The delivery mode of this invocation.
    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    /// The invoked handler.
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Delivers the publication's message to the handler.
    ///
    /// Failures are reported to the context's error handlers and never reach the caller. A
    /// handler that panics is reported like a failing one, so the publication's remaining
    /// handlers still run.
    pub(crate) fn invoke(&self, publication: &MessagePublication, context: &InvocationContext) {
        match (self.delivery, context.executor()) {
            (Delivery::Asynchronous, Some(executor)) => {
                let task = invocation_task(
                    self.handler.clone(),
                    publication.clone(),
                    context.errors().clone(),
                );

                if let Err(error) = executor.spawn(task) {
                    context.errors().report(
                        PublicationError::new(error, ASYNC_SUBMISSION_FAILED)
                            .with_publication(publication.clone()),
                    );
                }
            }
            _ => {
                postbus_log::trace!(
                    handler = self.handler.name(),
                    publication = publication.id(),
                    "invoking handler"
                );

                if let Err(cause) = call_handler(self.handler.as_ref(), publication.message()) {
                    let message = match cause {
                        FailureCause::Panic(_) => ASYNC_DISPATCH_FAILED,
                        _ => HANDLER_INVOCATION_FAILED,
                    };
                    context.errors().report(
                        PublicationError::new(cause, message).with_publication(publication.clone()),
                    );
                }
            }
        }
    }
}

/// Runs a handler and converts a panic into a failure.
fn call_handler(handler: &dyn Handler, message: &Message) -> Result<(), FailureCause> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
        Ok(result) => result.map_err(FailureCause::from),
        Err(payload) => Err(FailureCause::Panic(panic_message(payload.as_ref()))),
    }
}

/// Wraps an asynchronous invocation into an executor task.
///
/// The task never panics, so an executor without a task panic handler keeps its threads.
fn invocation_task(
    handler: Arc<dyn Handler>,
    publication: MessagePublication,
    errors: ErrorHandlers,
) -> Task {
    async move {
        if let Err(cause) = call_handler(handler.as_ref(), publication.message()) {
            errors.report(
                PublicationError::new(cause, ASYNC_INVOCATION_FAILED).with_publication(publication),
            );
        }
    }
    .boxed()
}

impl fmt::Debug for HandlerInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerInvocation")
            .field("handler", &self.handler.name())
            .field("delivery", &self.delivery)
            .finish()
    }
}

/// Everything a publication needs while it executes.
#[derive(Clone, Debug, Default)]
pub struct InvocationContext {
    executor: Option<Arc<Executor>>,
    errors: ErrorHandlers,
}

impl InvocationContext {
    /// Creates a context from an optional handler executor and the bus's error handlers.
    pub fn new(executor: Option<Arc<Executor>>, errors: ErrorHandlers) -> Self {
        Self { executor, errors }
    }

    /// The handler executor, if asynchronous invocation is enabled.
    pub fn executor(&self) -> Option<&Arc<Executor>> {
        self.executor.as_ref()
    }

    /// The error handlers receiving failures of this publication.
    pub fn errors(&self) -> &ErrorHandlers {
        &self.errors
    }
}
