//! # Postbus Dispatch
//!
//! The asynchronous dispatch engine of the postbus message bus.
//!
//! A [`MessagePublication`] bundles a message with the handlers it is delivered to. Publishing a
//! message asynchronously means handing its publication to an [`AsyncBus`], which places it into
//! a [`PendingQueue`] and returns immediately. A fixed pool of dispatcher threads takes
//! publications from the queue and executes them, calling every handler in order.
//!
//! ## Handler Delivery
//!
//! Each [`HandlerInvocation`] declares a [`Delivery`] mode. Synchronous handlers run on the
//! dispatcher thread. Asynchronous handlers are submitted to a handler executor, a second thread
//! pool backed by a Tokio runtime, so a slow handler does not hold up a dispatcher. Without an
//! executor, asynchronous handlers run synchronously.
//!
//! ## Failures
//!
//! Errors never reach the publisher. Failing handlers, panics and interrupted scheduling are
//! wrapped in a [`PublicationError`] and passed to the bus's [`ErrorHandler`]s. Dispatcher threads
//! survive every failure of the publications they execute.
//!
//! ## Shutdown
//!
//! [`AsyncBus::shutdown`] wakes every blocked dispatcher and producer and stops the handler
//! executor. Publications still queued at that point are abandoned. Shutdown is a caller
//! obligation, use [`AsyncBus::scoped`] to tie it to a scope.
//!
//! ## Usage Example
//!
//! ```
//! use std::time::Duration;
//!
//! use postbus_dispatch::{AsyncBus, HandlerInvocation, MessagePublication, handler_fn};
//!
//! let (tx, rx) = flume::unbounded();
//!
//! AsyncBus::builder().num_dispatchers(2).build().unwrap().scoped(|bus| {
//!     let handler = handler_fn(move |message| {
//!         tx.send(message.downcast_ref::<u32>().copied()).ok();
//!         Ok(())
//!     });
//!
//!     bus.schedule_async(MessagePublication::new(42u32, vec![HandlerInvocation::synchronous(handler)]));
//!     assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(42));
//! });
//! ```

#![warn(missing_docs)]

mod builder;
mod bus;
mod dispatcher;
mod error;
mod invocation;
mod publication;
mod queue;
mod runtime;
pub mod shutdown;

pub use self::builder::*;
pub use self::bus::*;
pub use self::dispatcher::*;
pub use self::error::*;
pub use self::invocation::*;
pub use self::publication::*;
pub use self::queue::*;
pub use self::runtime::*;
pub use self::shutdown::{ShutdownHandle, ShutdownSignal};

pub use postbus_threading::{
    CustomSpawn, DefaultSpawn, ExecutorError, HandlerExecutor, HandlerExecutorBuilder, Thread,
    ThreadSpawn,
};
