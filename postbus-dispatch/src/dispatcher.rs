use std::fmt;
use std::io;
use std::panic::AssertUnwindSafe;

use postbus_threading::{Thread, ThreadSpawn, panic_message};

use crate::error::{ASYNC_DISPATCH_FAILED, FailureCause, PublicationError};
use crate::invocation::InvocationContext;
use crate::publication::MessagePublication;
use crate::queue::{Interrupted, PendingQueue};
use crate::shutdown::{self, ShutdownHandle, ShutdownSignal};

/// A fixed set of threads that take publications from a [`PendingQueue`] and execute them.
///
/// Dispatchers run until [`shutdown`](Self::shutdown) is called. A dispatcher blocked on an empty
/// queue wakes up immediately, a dispatcher executing a publication stops once it is done.
/// Publications still in the queue are not executed anymore.
pub struct DispatcherPool {
    shutdown: ShutdownHandle,
    size: usize,
}

impl DispatcherPool {
    /// Starts `size` dispatcher threads consuming from `queue`.
    ///
    /// Threads are created through `spawn`, `thread_name` provides the name for each thread
    /// index. If a thread fails to start, the already running dispatchers are stopped again.
    pub fn start<S, N>(
        size: usize,
        queue: &PendingQueue,
        context: &InvocationContext,
        spawn: &mut S,
        mut thread_name: N,
    ) -> io::Result<Self>
    where
        S: ThreadSpawn,
        N: FnMut(usize) -> String,
    {
        let (handle, signal) = shutdown::channel();

        for index in 0..size {
            let queue = queue.clone();
            let signal = signal.clone();
            let context = context.clone();

            let thread = Thread::new(index, move || dispatch_loop(index, queue, signal, context))
                .with_name(Some(thread_name(index)));

            if let Err(error) = spawn.spawn(thread) {
                handle.shutdown();
                return Err(error);
            }
        }

        postbus_log::debug!(dispatchers = size, "dispatchers started");

        Ok(Self {
            shutdown: handle,
            size,
        })
    }

    /// Stops all dispatchers.
    ///
    /// Returns `true` only for the call that performed the shutdown.
    pub fn shutdown(&self) -> bool {
        let performed = self.shutdown.shutdown();
        if performed {
            postbus_log::debug!(dispatchers = self.size, "dispatchers shutting down");
        }
        performed
    }

    /// Returns `true` if [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// The number of dispatcher threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// A signal that fires when the dispatchers are shut down.
    pub fn signal(&self) -> ShutdownSignal {
        self.shutdown.signal()
    }
}

impl fmt::Debug for DispatcherPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherPool")
            .field("size", &self.size)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// The body of a dispatcher thread.
fn dispatch_loop(
    index: usize,
    queue: PendingQueue,
    signal: ShutdownSignal,
    context: InvocationContext,
) {
    postbus_log::debug!(dispatcher = index, "dispatcher started");

    loop {
        let publication = match queue.take(&signal) {
            Ok(publication) => publication,
            Err(Interrupted) => break,
        };

        if let Err(cause) = dispatch(&publication, &context) {
            context.errors().report(
                PublicationError::new(cause, ASYNC_DISPATCH_FAILED).with_publication(publication),
            );
        }
    }

    postbus_log::debug!(dispatcher = index, "dispatcher stopped");
}

/// Executes a single publication and converts a panic into a failure.
fn dispatch(
    publication: &MessagePublication,
    context: &InvocationContext,
) -> Result<(), FailureCause> {
    std::panic::catch_unwind(AssertUnwindSafe(|| publication.execute(context)))
        .map(|_| ())
        .map_err(|payload| FailureCause::Panic(panic_message(payload.as_ref())))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use postbus_threading::{CustomSpawn, DefaultSpawn};

    use super::*;
    use crate::error::ErrorHandlers;
    use crate::invocation::{HandlerInvocation, handler_fn};
    use crate::publication::PublicationState;

    fn counting(tx: flume::Sender<u32>) -> HandlerInvocation {
        HandlerInvocation::synchronous(handler_fn(move |message| {
            tx.send(*message.downcast_ref::<u32>().unwrap()).ok();
            Ok(())
        }))
    }

    #[test]
    fn test_dispatchers_execute_queued_publications() {
        let queue = PendingQueue::unbounded();
        let pool = DispatcherPool::start(
            2,
            &queue,
            &InvocationContext::default(),
            &mut DefaultSpawn,
            |index| format!("dispatcher-{index}"),
        )
        .unwrap();
        let (tx, rx) = flume::unbounded();

        let publications: Vec<_> = (0..10u32)
            .map(|i| MessagePublication::new(i, vec![counting(tx.clone())]))
            .collect();
        for publication in &publications {
            queue.put(publication.clone(), &pool.signal()).unwrap();
        }

        let mut seen: Vec<u32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        assert!(pool.shutdown());
        assert!(!pool.shutdown());
        assert!(pool.is_shutdown());
    }

    #[test]
    fn test_panicking_publication_is_reported_and_dispatcher_survives() {
        let queue = PendingQueue::unbounded();
        let reported = Arc::new(Mutex::new(Vec::new()));
        let reported_clone = reported.clone();
        let errors = ErrorHandlers::new(vec![Arc::new(move |error: &PublicationError| {
            let panicked = matches!(error.cause(), FailureCause::Panic(m) if m == "exploded");
            reported_clone
                .lock()
                .unwrap()
                .push((error.message().to_owned(), panicked));
        })]);

        let pool = DispatcherPool::start(
            1,
            &queue,
            &InvocationContext::new(None, errors),
            &mut DefaultSpawn,
            |_| "dispatcher".to_owned(),
        )
        .unwrap();

        let failing = MessagePublication::new(
            0u32,
            vec![HandlerInvocation::synchronous(handler_fn(|_| {
                panic!("exploded");
            }))],
        );
        let (tx, rx) = flume::unbounded();
        let next = MessagePublication::new(1u32, vec![counting(tx)]);

        let signal = pool.signal();
        queue.put(failing.clone(), &signal).unwrap();
        queue.put(next, &signal).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(failing.state(), PublicationState::Completed);
        assert_eq!(
            *reported.lock().unwrap(),
            vec![(ASYNC_DISPATCH_FAILED.to_owned(), true)]
        );
        pool.shutdown();
    }

    #[test]
    fn test_dispatchers_exit_on_shutdown() {
        let queue = PendingQueue::unbounded();
        let (exit_tx, exit_rx) = flume::unbounded();
        let mut spawn = CustomSpawn::new(move |thread: Thread| {
            let exit_tx = exit_tx.clone();
            std::thread::spawn(move || {
                thread.run();
                exit_tx.send(()).ok();
            });
            Ok(())
        });

        let pool = DispatcherPool::start(
            3,
            &queue,
            &InvocationContext::default(),
            &mut spawn,
            |index| format!("dispatcher-{index}"),
        )
        .unwrap();
        assert_eq!(pool.size(), 3);

        pool.shutdown();
        for _ in 0..3 {
            exit_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn test_failed_spawn_stops_started_dispatchers() {
        let queue = PendingQueue::unbounded();
        let (exit_tx, exit_rx) = flume::unbounded();
        let mut spawn = CustomSpawn::new(move |thread: Thread| {
            if thread.index() == 1 {
                return Err(io::Error::other("no more threads"));
            }
            let exit_tx = exit_tx.clone();
            std::thread::spawn(move || {
                thread.run();
                exit_tx.send(()).ok();
            });
            Ok(())
        });

        let result = DispatcherPool::start(
            2,
            &queue,
            &InvocationContext::default(),
            &mut spawn,
            |index| format!("dispatcher-{index}"),
        );

        assert!(result.is_err());
        exit_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
