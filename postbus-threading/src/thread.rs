use std::any::Any;
use std::fmt;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Type alias for a thread safe closure that is used for panic handling across the code.
pub type PanicHandler = dyn Fn(Box<dyn Any + Send>) + Send + Sync;

/// Extracts a readable message from a panic payload.
///
/// Panics raised through `panic!` carry either a `&'static str` or a `String`. Any other payload
/// is reported as an opaque panic.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Describes a dedicated thread before it is started by a [`ThreadSpawn`] implementation.
///
/// A [`Thread`] carries everything required to run: its position within the owning pool, an
/// optional name, an optional panic handler and the body to execute. Spawners only decide *how*
/// the OS thread is created and must eventually call [`Thread::run`] on it.
pub struct Thread {
    index: usize,
    name: Option<String>,
    panic_handler: Option<Arc<PanicHandler>>,
    body: Box<dyn FnOnce() + Send>,
}

impl Thread {
    /// Creates a new thread description that will execute `body`.
    pub fn new<F>(index: usize, body: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            index,
            name: None,
            panic_handler: None,
            body: Box::new(body),
        }
    }

    /// Sets the name of the thread.
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    /// Sets a handler invoked if the body of this thread panics.
    ///
    /// Without a handler, the panic is propagated and terminates the thread.
    pub fn with_panic_handler(mut self, panic_handler: Option<Arc<PanicHandler>>) -> Self {
        self.panic_handler = panic_handler;
        self
    }

    /// Returns the index of this thread within its pool.
    ///
    /// The identifier is useful for debugging or tracing task execution across threads.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the name of this thread, if one was provided.
    ///
    /// Thread names can aid in logging and debugging by providing a human-readable identifier.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Runs the body of this thread on the current thread.
    ///
    /// If the body panics, the `panic_handler` will be called.
    pub fn run(self) {
        let result = std::panic::catch_unwind(AssertUnwindSafe(self.body));

        match (self.panic_handler, result) {
            // Panic handler and error, we swallow the panic and invoke the callback.
            (Some(panic_handler), Err(error)) => {
                panic_handler(error);
            }
            // No panic handler and error, we propagate the panic.
            (None, Err(error)) => {
                std::panic::resume_unwind(error);
            }
            (_, Ok(())) => {}
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("panic_handler", &self.panic_handler.is_some())
            .finish_non_exhaustive()
    }
}

/// A trait for customizing the spawning of dedicated threads.
///
/// Implement [`ThreadSpawn`] to modify thread settings, such as the thread name or stack size,
/// prior to creation, allowing the thread to be tailored for the requirements of your
/// application.
pub trait ThreadSpawn {
    /// Spawns a new thread using the provided configuration.
    fn spawn(&mut self, thread: Thread) -> io::Result<()>;
}

/// A default implementation of [`ThreadSpawn`] that uses system defaults.
///
/// [`DefaultSpawn`] applies the thread's name and otherwise relies on the standard behavior of
/// the operating system. Spawned threads are detached.
#[derive(Clone, Debug, Default)]
pub struct DefaultSpawn;

impl ThreadSpawn for DefaultSpawn {
    fn spawn(&mut self, thread: Thread) -> io::Result<()> {
        let mut b = std::thread::Builder::new();
        if let Some(name) = thread.name() {
            b = b.name(name.to_owned());
        }
        b.spawn(|| thread.run())?;

        Ok(())
    }
}

/// A flexible [`ThreadSpawn`] implementation that uses a closure for dynamic thread configuration.
#[derive(Clone)]
pub struct CustomSpawn<B>(B);

impl<B> CustomSpawn<B> {
    /// Creates a new instance of [`CustomSpawn`] with the provided configuration closure.
    pub fn new(spawn_handler: B) -> Self {
        CustomSpawn(spawn_handler)
    }
}

impl<B> ThreadSpawn for CustomSpawn<B>
where
    B: FnMut(Thread) -> io::Result<()>,
{
    fn spawn(&mut self, thread: Thread) -> io::Result<()> {
        self.0(thread)
    }
}

impl<B> fmt::Debug for CustomSpawn<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomSpawn")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_thread_panic_handling() {
        let has_panicked = Arc::new(AtomicBool::new(false));
        let has_panicked_clone = has_panicked.clone();
        let panic_handler = move |_| {
            has_panicked_clone.store(true, Ordering::SeqCst);
        };

        Thread::new(0, || panic!("panicked"))
            .with_name(Some("test-thread".to_owned()))
            .with_panic_handler(Some(Arc::new(panic_handler)))
            .run();

        assert!(has_panicked.load(Ordering::SeqCst));
    }

    #[test]
    fn test_thread_panic_without_handler_propagates() {
        let result = std::panic::catch_unwind(|| Thread::new(0, || panic!("panicked")).run());
        assert!(result.is_err());
    }

    #[test]
    fn test_default_spawn_applies_name() {
        let (tx, rx) = flume::bounded(1);

        DefaultSpawn
            .spawn(
                Thread::new(3, move || {
                    let name = std::thread::current().name().map(str::to_owned);
                    tx.send(name).ok();
                })
                .with_name(Some("worker-3".to_owned())),
            )
            .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("worker-3"));
    }

    #[test]
    fn test_custom_spawn_sees_thread_description() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let mut spawn = CustomSpawn::new(move |thread: Thread| {
            seen_clone
                .lock()
                .unwrap()
                .push((thread.index(), thread.name().map(str::to_owned)));
            thread.run();
            Ok(())
        });

        spawn.spawn(Thread::new(0, || {})).unwrap();
        spawn
            .spawn(Thread::new(1, || {}).with_name(Some("second".to_owned())))
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(0, None), (1, Some("second".to_owned()))]
        );
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| {
            panic!("static message");
        }).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload = std::panic::catch_unwind(|| {
            panic!("formatted {}", 42);
        }).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 42");

        let payload = std::panic::catch_unwind(|| {
            std::panic::panic_any(7u32);
        }).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
