use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::invocation::{HandlerInvocation, InvocationContext};

/// A message carried by a publication.
pub type Message = Arc<dyn Any + Send + Sync>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// The lifecycle of a [`MessagePublication`].
///
/// States only ever advance in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PublicationState {
    /// Created, not yet accepted by the pending queue.
    Created = 0,
    /// Waiting in the pending queue.
    Scheduled = 1,
    /// A dispatcher is delivering the message to its handlers.
    Executing = 2,
    /// All handlers have been invoked.
    Completed = 3,
}

impl PublicationState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Scheduled,
            2 => Self::Executing,
            _ => Self::Completed,
        }
    }

    /// Returns the name of this state in lowercase.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Scheduled => "scheduled",
            Self::Executing => "executing",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for PublicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    id: u64,
    message: Message,
    invocations: Vec<HandlerInvocation>,
    state: AtomicU8,
}

/// A message together with the handlers it is delivered to.
///
/// A publication is a cheap handle. Clones refer to the same publication and observe the same
/// state, which allows the caller to keep a handle while a dispatcher executes it.
#[derive(Clone)]
pub struct MessagePublication {
    inner: Arc<Inner>,
}

impl MessagePublication {
    /// Creates a publication of `message` for the given handler invocations.
    pub fn new<M>(message: M, invocations: Vec<HandlerInvocation>) -> Self
    where
        M: Any + Send + Sync,
    {
        Self::from_message(Arc::new(message), invocations)
    }

    /// Creates a publication of an already shared message.
    pub fn from_message(message: Message, invocations: Vec<HandlerInvocation>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                message,
                invocations,
                state: AtomicU8::new(PublicationState::Created as u8),
            }),
        }
    }

    /// A process-wide unique identifier of this publication.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The published message.
    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    /// Returns the message if it is of type `T`.
    pub fn message_as<T: Any>(&self) -> Option<&T> {
        (*self.inner.message).downcast_ref::<T>()
    }

    /// The handlers this publication delivers to, in invocation order.
    pub fn invocations(&self) -> &[HandlerInvocation] {
        &self.inner.invocations
    }

    /// The current lifecycle state.
    pub fn state(&self) -> PublicationState {
        PublicationState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Returns `true` once the publication has been accepted by the pending queue.
    pub fn is_scheduled(&self) -> bool {
        self.state() >= PublicationState::Scheduled
    }

    /// Returns `true` if both handles refer to the same publication.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Marks the publication as scheduled.
    ///
    /// Only advances from [`PublicationState::Created`]. A dispatcher may already have started
    /// executing the publication, in which case the state is left untouched.
    pub(crate) fn mark_scheduled(&self) {
        self.inner
            .state
            .compare_exchange(
                PublicationState::Created as u8,
                PublicationState::Scheduled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok();
    }

    /// Delivers the message to all handlers in order.
    ///
    /// A publication executes at most once. Returns `false` if it was already executed, in which
    /// case nothing happens. Handler failures and panics are reported to the context's error
    /// handlers. The publication is marked completed even if execution unwinds.
    pub fn execute(&self, context: &InvocationContext) -> bool {
        let claimed = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state < PublicationState::Executing as u8)
                    .then_some(PublicationState::Executing as u8)
            })
            .is_ok();

        if !claimed {
            postbus_log::trace!(publication = self.id(), "publication already executed");
            return false;
        }

        let _completion = CompleteOnDrop(&self.inner.state);
        for invocation in &self.inner.invocations {
            invocation.invoke(self, context);
        }

        true
    }
}

struct CompleteOnDrop<'a>(&'a AtomicU8);

impl Drop for CompleteOnDrop<'_> {
    fn drop(&mut self) {
        self.0
            .store(PublicationState::Completed as u8, Ordering::Release);
    }
}

impl fmt::Debug for MessagePublication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePublication")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("invocations", &self.inner.invocations)
            .finish_non_exhaustive()
    }
}
