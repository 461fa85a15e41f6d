use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::CatchUnwind;
use futures::stream::{FusedStream, FuturesUnordered, Stream};
use pin_project_lite::pin_project;
use tokio::task::Unconstrained;

use crate::thread::PanicHandler;

pin_project! {
    /// The set of handler tasks currently driven by one executor thread.
    struct RunningTasks<F> {
        #[pin]
        futures: FuturesUnordered<Unconstrained<CatchUnwind<AssertUnwindSafe<F>>>>,
        panic_handler: Option<Arc<PanicHandler>>,
        active: Arc<AtomicUsize>,
    }
}

impl<F> RunningTasks<F> {
    fn new(panic_handler: Option<Arc<PanicHandler>>, active: Arc<AtomicUsize>) -> Self {
        Self {
            futures: FuturesUnordered::new(),
            panic_handler,
            active,
        }
    }

    fn len(&self) -> usize {
        self.futures.len()
    }

    fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }
}

impl<F> RunningTasks<F>
where
    F: Future<Output = ()>,
{
    fn push(&mut self, future: F) {
        let future = AssertUnwindSafe(future).catch_unwind();
        self.futures.push(tokio::task::unconstrained(future));
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Polls running tasks and retires every task that completes, until none is ready.
    ///
    /// Tasks that panicked are passed to the panic handler. Without a panic handler, the panic
    /// resumes on the executor thread.
    fn poll_until_pending(self: Pin<&mut Self>, cx: &mut Context<'_>) {
        let mut this = self.project();

        while !this.futures.is_terminated() {
            let Poll::Ready(Some(result)) = this.futures.as_mut().poll_next(cx) else {
                return;
            };

            this.active.fetch_sub(1, Ordering::Relaxed);

            if let Err(payload) = result {
                match this.panic_handler.as_ref() {
                    Some(panic_handler) => panic_handler(payload),
                    None => std::panic::resume_unwind(payload),
                }
            }
        }
    }
}

pin_project! {
    /// Drives tasks received from a stream, running at most `max_concurrency` of them at once.
    ///
    /// The multiplexer resolves once the stream has ended and every task it yielded has
    /// completed. For the handler executor, the stream ends when the executor is shut down, so
    /// queued and running tasks are finished before the thread exits.
    pub(crate) struct TaskMultiplexer<S, F> {
        max_concurrency: usize,
        #[pin]
        rx: S,
        #[pin]
        running: RunningTasks<F>,
    }
}

impl<S, F> TaskMultiplexer<S, F>
where
    S: Stream<Item = F>,
{
    /// Creates a multiplexer over `rx`.
    ///
    /// `active` is incremented for every task that starts and decremented when it completes,
    /// which allows the owner to observe the load of all its threads.
    pub(crate) fn new(
        max_concurrency: usize,
        rx: S,
        panic_handler: Option<Arc<PanicHandler>>,
        active: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            rx,
            running: RunningTasks::new(panic_handler, active),
        }
    }
}

impl<S, F> Future for TaskMultiplexer<S, F>
where
    S: FusedStream<Item = F>,
    F: Future<Output = ()>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        loop {
            this.running.as_mut().poll_until_pending(cx);

            // Saturated, a completing task wakes us up again.
            if this.running.len() >= *this.max_concurrency {
                return Poll::Pending;
            }

            match this.rx.as_mut().poll_next(cx) {
                Poll::Ready(Some(task)) => this.running.push(task),
                Poll::Ready(None) if this.running.is_empty() => return Poll::Ready(()),
                Poll::Ready(None) | Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;

    use futures::future::BoxFuture;

    use super::*;

    fn task(block: impl FnOnce() + Send + 'static) -> BoxFuture<'static, ()> {
        async {
            // Yield to allow a pending state during polling.
            tokio::task::yield_now().await;
            block();
        }
        .boxed()
    }

    fn run(
        max_concurrency: usize,
        tasks: Vec<BoxFuture<'static, ()>>,
        panic_handler: Option<Arc<PanicHandler>>,
    ) -> Arc<AtomicUsize> {
        let (tx, rx) = flume::unbounded();
        for task in tasks {
            tx.send(task).unwrap();
        }
        drop(tx);

        let active = Arc::new(AtomicUsize::new(0));
        futures::executor::block_on(TaskMultiplexer::new(
            max_concurrency,
            rx.into_stream(),
            panic_handler,
            active.clone(),
        ));
        active
    }

    #[test]
    fn test_empty_stream_completes() {
        let active = run(1, Vec::new(), None);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sequential_tasks_keep_submission_order() {
        let entries = Arc::new(Mutex::new(Vec::new()));
        let tasks = (0..5)
            .map(|i| {
                let entries = entries.clone();
                task(move || entries.lock().unwrap().push(i))
            })
            .collect();

        let active = run(1, tasks, None);

        assert_eq!(*entries.lock().unwrap(), (0..5).collect::<Vec<_>>());
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_tasks_all_complete() {
        let count = Arc::new(AtomicUsize::new(0));
        let tasks = (0..10)
            .map(|_| {
                let count = count.clone();
                task(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        let active = run(4, tasks, None);

        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_concurrency_still_makes_progress() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        run(
            0,
            vec![task(move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })],
            None,
        );

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_task_is_reported_and_others_run() {
        let panicked = Arc::new(AtomicBool::new(false));
        let panicked_clone = panicked.clone();
        let panic_handler = move |_| panicked_clone.store(true, Ordering::SeqCst);

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let tasks = vec![
            task(|| panic!("handler failed")),
            task(move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        ];

        let active = run(1, tasks, Some(Arc::new(panic_handler)));

        assert!(panicked.load(Ordering::SeqCst));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_task_without_handler_propagates() {
        let result = std::panic::catch_unwind(|| {
            run(1, vec![task(|| panic!("handler failed"))], None);
        });

        assert!(result.is_err());
    }
}
