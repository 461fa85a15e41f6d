use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use postbus_threading::{ExecutorError, panic_message};

use crate::publication::MessagePublication;

/// Reported when a dispatcher fails while executing a dequeued publication.
pub const ASYNC_DISPATCH_FAILED: &str = "error in asynchronous dispatch";

/// Reported when scheduling a publication was interrupted by a shutdown.
pub const ENQUEUE_INTERRUPTED: &str = "error while adding an asynchronous publication";

/// Reported when a synchronously invoked handler fails.
pub const HANDLER_INVOCATION_FAILED: &str = "error during invocation of message handler";

/// Reported when a handler running on the handler executor fails or panics.
pub const ASYNC_INVOCATION_FAILED: &str = "error in asynchronous handler invocation";

/// Reported when the handler executor refuses an asynchronous invocation.
pub const ASYNC_SUBMISSION_FAILED: &str = "error while submitting asynchronous handler invocation";

/// An error returned by a message handler.
///
/// Wraps any error type. Strings convert as well, which is convenient for ad-hoc failures:
///
/// ```
/// use postbus_dispatch::HandlerError;
///
/// let error = HandlerError::new("unexpected message");
/// assert_eq!(error.to_string(), "unexpected message");
/// ```
#[derive(Debug)]
pub struct HandlerError {
    inner: Box<dyn Error + Send + Sync + 'static>,
}

impl HandlerError {
    /// Wraps an error raised by a handler.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync + 'static>>,
    {
        Self {
            inner: error.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl Error for HandlerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source()
    }
}

/// The underlying failure of a [`PublicationError`].
#[derive(Debug, thiserror::Error)]
pub enum FailureCause {
    /// A handler returned an error.
    #[error("message handler failed")]
    Handler(#[from] HandlerError),
    /// Code run on behalf of a publication panicked.
    #[error("panicked: {0}")]
    Panic(String),
    /// A blocking operation was cancelled because the bus shut down.
    #[error("interrupted by shutdown")]
    Interrupted,
    /// The handler executor did not accept an invocation.
    #[error("handler executor rejected the invocation")]
    Executor(#[from] ExecutorError),
}

/// An error that occurred while scheduling or executing a publication.
///
/// These errors never reach the caller of the bus. They are passed to every registered
/// [`ErrorHandler`] instead.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct PublicationError {
    #[source]
    cause: FailureCause,
    message: Cow<'static, str>,
    publication: Option<MessagePublication>,
}

impl PublicationError {
    /// Creates an error with a context message and its underlying cause.
    pub fn new(cause: impl Into<FailureCause>, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            cause: cause.into(),
            message: message.into(),
            publication: None,
        }
    }

    /// Attaches the publication that was being processed.
    pub fn with_publication(mut self, publication: MessagePublication) -> Self {
        self.publication = Some(publication);
        self
    }

    /// The underlying failure.
    pub fn cause(&self) -> &FailureCause {
        &self.cause
    }

    /// Describes where the failure occurred.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The publication being processed, if known.
    pub fn publication(&self) -> Option<&MessagePublication> {
        self.publication.as_ref()
    }
}

/// Receives errors that occur during asynchronous processing.
///
/// Error handlers are called from dispatcher and executor threads and must be thread safe. They
/// are also implemented for closures:
///
/// ```
/// use postbus_dispatch::{ErrorHandler, PublicationError};
///
/// fn assert_handler<H: ErrorHandler>(_: H) {}
/// assert_handler(|error: &PublicationError| eprintln!("{error}"));
/// ```
pub trait ErrorHandler: Send + Sync {
    /// Handles a single error.
    fn handle_error(&self, error: &PublicationError);
}

impl<F> ErrorHandler for F
where
    F: Fn(&PublicationError) + Send + Sync,
{
    fn handle_error(&self, error: &PublicationError) {
        self(error)
    }
}

/// An [`ErrorHandler`] that logs every error.
///
/// Used when a bus is built without any error handler.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle_error(&self, error: &PublicationError) {
        postbus_log::error!(
            error = error as &dyn Error,
            publication = error.publication().map(MessagePublication::id),
            "publication failed"
        );
    }
}

/// The set of error handlers of a bus.
///
/// Cloning is cheap, all clones share the same handlers.
#[derive(Clone)]
pub struct ErrorHandlers {
    handlers: Arc<[Arc<dyn ErrorHandler>]>,
}

impl ErrorHandlers {
    /// Creates the set from a list of handlers.
    ///
    /// An empty list falls back to [`LoggingErrorHandler`], so errors are never dropped silently.
    pub fn new(handlers: Vec<Arc<dyn ErrorHandler>>) -> Self {
        let handlers = if handlers.is_empty() {
            postbus_log::debug!("no error handler configured, logging publication errors");
            vec![Arc::new(LoggingErrorHandler) as Arc<dyn ErrorHandler>]
        } else {
            handlers
        };

        Self {
            handlers: handlers.into(),
        }
    }

    /// Passes an error to every handler in registration order.
    ///
    /// A panicking handler is logged and does not prevent the remaining handlers from running.
    pub fn report(&self, error: PublicationError) {
        for handler in self.handlers.iter() {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle_error(&error)));
            if let Err(payload) = result {
                postbus_log::error!(
                    panic = %panic_message(payload.as_ref()),
                    "error handler panicked"
                );
            }
        }
    }

    /// Returns the number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handler is registered.
    ///
    /// Always `false` for sets created through [`ErrorHandlers::new`].
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for ErrorHandlers {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl fmt::Debug for ErrorHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandlers")
            .field("len", &self.len())
            .finish()
    }
}

/// An error returned when building a bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Dispatcher or executor threads could not be started.
    #[error("failed to start bus threads")]
    Spawn(#[from] io::Error),
    /// Asynchronous invocation is enabled but no Tokio runtime was provided.
    #[error("asynchronous handler invocation requires a tokio runtime")]
    MissingRuntime,
}
