//! # Postbus Threading
//!
//! Threading primitives shared by the two concurrency layers of the message bus.
//!
//! - **Thread factory**: [`ThreadSpawn`] turns a [`Thread`] description (index, name, panic
//!   handler and body) into a running OS thread. [`DefaultSpawn`] uses the standard library
//!   defaults, while [`CustomSpawn`] lets callers control naming, stack sizes or priorities. The
//!   dispatcher pool and the handler executor are both started through this trait.
//! - **Handler executor**: [`HandlerExecutor`] runs asynchronous handler invocations on a set of
//!   dedicated threads. Each thread drives up to a configurable number of tasks concurrently on a
//!   Tokio runtime handle.
//!
//! ## Concurrency Model
//!
//! The executor keeps a bounded submission queue with a capacity of twice the number of threads
//! unless configured otherwise. When every thread is saturated, [`HandlerExecutor::spawn`] blocks
//! until capacity becomes available, which propagates backpressure to the dispatching thread.
//!
//! ## Usage Example
//!
//! ```no_run
//! use futures::future::BoxFuture;
//! use postbus_threading::{HandlerExecutor, HandlerExecutorBuilder};
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//!
//! let executor: HandlerExecutor<BoxFuture<'static, ()>> =
//!     HandlerExecutorBuilder::new(runtime.handle().clone())
//!         .num_threads(4)
//!         .max_concurrency(100)
//!         .build()
//!         .expect("failed to build handler executor");
//!
//! executor
//!     .spawn(Box::pin(async {
//!         // Place the handler logic here.
//!     }))
//!     .ok();
//!
//! executor.shutdown();
//! ```
//!
//! ## Error Handling
//!
//! Both the threads and the individual tasks accept panic handlers, so that a panicking handler
//! is reported instead of tearing down the thread that runs it.

#![warn(missing_docs)]

mod builder;
mod executor;
mod multiplexing;
mod thread;

pub use self::builder::*;
pub use self::executor::*;
pub use self::thread::*;
