/*!
Error types.

Usage errors are returned straight to instrumentation code, since they point at a bug in how events are started and stopped. Delivery errors are produced by [`crate::Persister`]s and handled inside the pipeline. Errors from instrumented calls themselves are never wrapped; they're returned to the caller unchanged.
*/

use std::{error, fmt};

use crate::event::{Event, EventId};

/**
An event was started or stopped out of order with the other events on its thread.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationError {
    event: EventId,
    current: Option<EventId>,
}

impl CorrelationError {
    pub(crate) fn new(event: EventId, current: Option<EventId>) -> Self {
        CorrelationError { event, current }
    }

    /**
    The event that was out of order.
    */
    pub fn event(&self) -> EventId {
        self.event
    }

    /**
    The event that was current on the thread at the time.
    */
    pub fn current(&self) -> Option<EventId> {
        self.current
    }
}

impl fmt::Display for CorrelationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.current {
            Some(current) => write!(
                f,
                "event {} is out of order; the current event on this thread is {}",
                self.event, current
            ),
            None => write!(
                f,
                "event {} is out of order; there is no current event on this thread",
                self.event
            ),
        }
    }
}

impl error::Error for CorrelationError {}

/**
An event was used incorrectly.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    /**
    The event was already started.
    */
    AlreadyStarted(EventId),
    /**
    The event was stopped without being started.
    */
    NotStarted(EventId),
    /**
    The event is a clone, so it can't be started or stopped.
    */
    Copied(EventId),
    /**
    The event wasn't in the right position on its thread's stack.
    */
    Correlation(CorrelationError),
}

impl From<CorrelationError> for UsageError {
    fn from(err: CorrelationError) -> Self {
        UsageError::Correlation(err)
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageError::AlreadyStarted(id) => write!(f, "event {id} was already started"),
            UsageError::NotStarted(id) => write!(f, "event {id} was stopped without being started"),
            UsageError::Copied(id) => write!(f, "event {id} is a clone and can't be started or stopped"),
            UsageError::Correlation(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl error::Error for UsageError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            UsageError::Correlation(err) => Some(err),
            _ => None,
        }
    }
}

/**
An event couldn't be stopped.

The event is returned untouched so it can be stopped again once the problem is fixed.
*/
pub struct StopError {
    err: UsageError,
    event: Event,
}

impl StopError {
    pub(crate) fn new(err: impl Into<UsageError>, event: Event) -> Self {
        StopError {
            err: err.into(),
            event,
        }
    }

    /**
    The reason the event couldn't be stopped.
    */
    pub fn error(&self) -> &UsageError {
        &self.err
    }

    /**
    Get back the event that couldn't be stopped.
    */
    pub fn into_event(self) -> Event {
        self.event
    }

    /**
    Split the error into its reason and the event.
    */
    pub fn into_parts(self) -> (UsageError, Event) {
        (self.err, self.event)
    }
}

impl fmt::Debug for StopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopError")
            .field("err", &self.err)
            .field("event", &self.event.id())
            .finish()
    }
}

impl fmt::Display for StopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.err, f)
    }
}

impl error::Error for StopError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.err)
    }
}

impl From<StopError> for UsageError {
    fn from(err: StopError) -> Self {
        err.err
    }
}

/**
A [`crate::Persister`] failed to deliver a batch of events.
*/
pub struct DeliveryError(Box<dyn error::Error + Send + Sync>);

impl DeliveryError {
    /**
    Wrap an underlying error.
    */
    pub fn new(err: impl Into<Box<dyn error::Error + Send + Sync>>) -> Self {
        DeliveryError(err.into())
    }

    /**
    Create an error from a message.
    */
    pub fn msg(msg: impl fmt::Display) -> Self {
        DeliveryError(msg.to_string().into())
    }
}

impl fmt::Debug for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl error::Error for DeliveryError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}

impl From<std::io::Error> for DeliveryError {
    fn from(err: std::io::Error) -> Self {
        DeliveryError::new(err)
    }
}

/**
A [`crate::Manager`] couldn't be started.
*/
pub struct SetupError(Box<dyn error::Error + Send + Sync>);

impl SetupError {
    pub(crate) fn new(err: impl Into<Box<dyn error::Error + Send + Sync>>) -> Self {
        SetupError(err.into())
    }
}

impl fmt::Debug for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl error::Error for SetupError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}
