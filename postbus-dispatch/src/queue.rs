//! The queue of publications waiting for a dispatcher.

use std::fmt;
use std::time::Duration;

use crate::publication::MessagePublication;
use crate::shutdown::ShutdownSignal;

/// A blocking operation was cancelled because shutdown was signaled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("operation interrupted by shutdown")]
pub struct Interrupted;

/// A thread-safe FIFO queue of scheduled publications.
///
/// The queue is either bounded, in which case producers block while it is full, or unbounded.
/// Every publication put into the queue is taken by exactly one consumer. All blocking
/// operations take a [`ShutdownSignal`] and return [`Interrupted`] once it fires.
///
/// Clones share the same queue.
#[derive(Clone)]
pub struct PendingQueue {
    tx: flume::Sender<MessagePublication>,
    rx: flume::Receiver<MessagePublication>,
}

impl PendingQueue {
    /// Creates a queue holding at most `capacity` publications.
    ///
    /// A capacity of `0` is raised to `1`, so that a publication always has a place to wait in.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Creates a queue without a capacity limit.
    pub fn unbounded() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// Creates a bounded queue if a capacity is given, otherwise an unbounded queue.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        match capacity {
            Some(capacity) => Self::bounded(capacity),
            None => Self::unbounded(),
        }
    }

    /// Inserts a publication, blocking while the queue is full.
    pub fn put(
        &self,
        publication: MessagePublication,
        signal: &ShutdownSignal,
    ) -> Result<(), Interrupted> {
        let publication = match self.try_put(publication, signal)? {
            None => return Ok(()),
            Some(publication) => publication,
        };

        flume::Selector::new()
            .send(&self.tx, publication, |result| result.map_err(|_| Interrupted))
            .recv(signal.receiver(), |_| Err(Interrupted))
            .wait()
    }

    /// Inserts a publication, waiting at most `timeout` for free capacity.
    ///
    /// Returns `Ok(false)` if the queue stayed full for the whole timeout. A zero timeout never
    /// waits.
    pub fn offer(
        &self,
        publication: MessagePublication,
        timeout: Duration,
        signal: &ShutdownSignal,
    ) -> Result<bool, Interrupted> {
        let publication = match self.try_put(publication, signal)? {
            None => return Ok(true),
            Some(publication) => publication,
        };

        if timeout.is_zero() {
            return Ok(false);
        }

        flume::Selector::new()
            .send(&self.tx, publication, |result| {
                result.map(|()| true).map_err(|_| Interrupted)
            })
            .recv(signal.receiver(), |_| Err(Interrupted))
            .wait_timeout(timeout)
            .unwrap_or(Ok(false))
    }

    /// Removes the oldest publication, blocking until one is available.
    ///
    /// A publication received concurrently with shutdown is dropped and the call returns
    /// [`Interrupted`]. It is abandoned together with everything still queued.
    pub fn take(&self, signal: &ShutdownSignal) -> Result<MessagePublication, Interrupted> {
        if signal.is_shutdown() {
            return Err(Interrupted);
        }

        let publication = flume::Selector::new()
            .recv(&self.rx, |result| result.map_err(|_| Interrupted))
            .recv(signal.receiver(), |_| Err(Interrupted))
            .wait()?;

        if signal.is_shutdown() {
            postbus_log::trace!(
                publication = publication.id(),
                "dropping publication received during shutdown"
            );
            return Err(Interrupted);
        }

        Ok(publication)
    }

    /// The number of publications currently waiting.
    pub fn size(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` if no publication is waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// The maximum number of waiting publications, `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }

    /// Attempts a non-blocking insert and hands the publication back if the queue is full.
    fn try_put(
        &self,
        publication: MessagePublication,
        signal: &ShutdownSignal,
    ) -> Result<Option<MessagePublication>, Interrupted> {
        if signal.is_shutdown() {
            return Err(Interrupted);
        }

        match self.tx.try_send(publication) {
            Ok(()) => Ok(None),
            Err(flume::TrySendError::Full(publication)) => Ok(Some(publication)),
            Err(flume::TrySendError::Disconnected(_)) => Err(Interrupted),
        }
    }
}

impl fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingQueue")
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::shutdown;

    fn publication(value: u32) -> MessagePublication {
        MessagePublication::new(value, Vec::new())
    }

    fn value(publication: &MessagePublication) -> u32 {
        *publication.message_as::<u32>().unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let queue = PendingQueue::unbounded();
        let signal = ShutdownSignal::never();

        for i in 0..5 {
            queue.put(publication(i), &signal).unwrap();
        }
        assert_eq!(queue.size(), 5);
        assert_eq!(queue.capacity(), None);

        let taken: Vec<_> = (0..5)
            .map(|_| value(&queue.take(&signal).unwrap()))
            .collect();
        assert_eq!(taken, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let queue = PendingQueue::bounded(0);
        assert_eq!(queue.capacity(), Some(1));
        assert_eq!(PendingQueue::with_capacity(Some(3)).capacity(), Some(3));
        assert_eq!(PendingQueue::with_capacity(None).capacity(), None);
    }

    #[test]
    fn test_put_blocks_until_space() {
        let queue = PendingQueue::bounded(1);
        let signal = ShutdownSignal::never();
        queue.put(publication(1), &signal).unwrap();

        let producer = {
            let queue = queue.clone();
            let signal = signal.clone();
            std::thread::spawn(move || queue.put(publication(2), &signal))
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        assert_eq!(queue.size(), 1);

        assert_eq!(value(&queue.take(&signal).unwrap()), 1);
        producer.join().unwrap().unwrap();
        assert_eq!(value(&queue.take(&signal).unwrap()), 2);
    }

    #[test]
    fn test_offer_times_out_when_full() {
        let queue = PendingQueue::bounded(1);
        let signal = ShutdownSignal::never();

        assert_eq!(
            queue.offer(publication(1), Duration::ZERO, &signal),
            Ok(true)
        );
        assert_eq!(
            queue.offer(publication(2), Duration::ZERO, &signal),
            Ok(false)
        );

        let start = Instant::now();
        assert_eq!(
            queue.offer(publication(3), Duration::from_millis(50), &signal),
            Ok(false)
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(1050), "blocked for {elapsed:?}");
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_offer_succeeds_when_space_frees_up() {
        let queue = PendingQueue::bounded(1);
        let signal = ShutdownSignal::never();
        queue.put(publication(1), &signal).unwrap();

        let consumer = {
            let queue = queue.clone();
            let signal = signal.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                queue.take(&signal).map(|p| value(&p))
            })
        };

        assert_eq!(
            queue.offer(publication(2), Duration::from_secs(5), &signal),
            Ok(true)
        );
        assert_eq!(consumer.join().unwrap(), Ok(1));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_shutdown_interrupts_blocked_operations() {
        let queue = PendingQueue::bounded(1);
        let (handle, signal) = shutdown::channel();
        queue.put(publication(1), &signal).unwrap();

        let producer = {
            let queue = queue.clone();
            let signal = signal.clone();
            std::thread::spawn(move || queue.put(publication(2), &signal))
        };
        let offering = {
            let queue = queue.clone();
            let signal = signal.clone();
            std::thread::spawn(move || {
                queue.offer(publication(3), Duration::from_secs(30), &signal)
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        handle.shutdown();

        assert_eq!(producer.join().unwrap(), Err(Interrupted));
        assert_eq!(offering.join().unwrap(), Err(Interrupted));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_shutdown_interrupts_take() {
        let queue = PendingQueue::unbounded();
        let (handle, signal) = shutdown::channel();

        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.take(&signal).map(|p| p.id()))
        };

        std::thread::sleep(Duration::from_millis(50));
        handle.shutdown();

        assert_eq!(consumer.join().unwrap(), Err(Interrupted));
    }

    #[test]
    fn test_operations_after_shutdown_are_interrupted() {
        let queue = PendingQueue::unbounded();
        let (handle, signal) = shutdown::channel();
        queue.put(publication(1), &signal).unwrap();
        handle.shutdown();

        assert_eq!(queue.put(publication(2), &signal), Err(Interrupted));
        assert_eq!(
            queue.offer(publication(3), Duration::ZERO, &signal),
            Err(Interrupted)
        );
        assert!(queue.take(&signal).is_err());
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_each_publication_is_taken_once() {
        let queue = PendingQueue::unbounded();
        let (handle, signal) = shutdown::channel();
        let (tx, rx) = flume::unbounded();

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                let signal = signal.clone();
                let tx = tx.clone();
                std::thread::spawn(move || {
                    while let Ok(publication) = queue.take(&signal) {
                        tx.send(value(&publication)).ok();
                    }
                })
            })
            .collect();

        for i in 0..30 {
            queue.put(publication(i), &signal).unwrap();
        }

        let mut seen: Vec<u32> = (0..30)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        handle.shutdown();
        for consumer in consumers {
            consumer.join().unwrap();
        }

        seen.sort_unstable();
        assert_eq!(seen, (0..30).collect::<Vec<_>>());
        assert!(rx.try_recv().is_err());
    }
}
