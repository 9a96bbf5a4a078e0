/*!
The [`Persister`] type.

A persister is the durable sink that finished events are delivered to. Persisters are called from the background drain loop with batches of events in the order they were stopped. A persister that fails returns a [`DeliveryError`]; the pipeline logs it and retries the batch according to its [`crate::setup::RetryPolicy`].
*/

use std::sync::Arc;

use crate::{empty::Empty, error::DeliveryError, event::Event, tree::EventTree};

/**
A sink for batches of finished events.
*/
pub trait Persister {
    /**
    Deliver a batch of events, returning the number of events persisted.
    */
    fn persist(&self, batch: &[Event]) -> Result<usize, DeliveryError>;

    /**
    Deliver batches to both this persister and `other`.
    */
    fn and_to<U>(self, other: U) -> And<Self, U>
    where
        Self: Sized,
    {
        And {
            lhs: self,
            rhs: other,
        }
    }
}

impl<'a, T: Persister + ?Sized> Persister for &'a T {
    fn persist(&self, batch: &[Event]) -> Result<usize, DeliveryError> {
        (**self).persist(batch)
    }
}

impl<'a, T: Persister + ?Sized + 'a> Persister for Box<T> {
    fn persist(&self, batch: &[Event]) -> Result<usize, DeliveryError> {
        (**self).persist(batch)
    }
}

impl<'a, T: Persister + ?Sized + 'a> Persister for Arc<T> {
    fn persist(&self, batch: &[Event]) -> Result<usize, DeliveryError> {
        (**self).persist(batch)
    }
}

impl<T: Persister> Persister for Option<T> {
    fn persist(&self, batch: &[Event]) -> Result<usize, DeliveryError> {
        match self {
            Some(persister) => persister.persist(batch),
            None => Empty.persist(batch),
        }
    }
}

impl Persister for Empty {
    fn persist(&self, _: &[Event]) -> Result<usize, DeliveryError> {
        Ok(0)
    }
}

/**
A [`Persister`] that discards events, noting how many it dropped.
*/
#[derive(Default, Debug, Clone, Copy)]
pub struct Null;

impl Persister for Null {
    fn persist(&self, batch: &[Event]) -> Result<usize, DeliveryError> {
        emit::debug!(
            rt: emit::runtime::internal(),
            "discarding {count} events",
            count: batch.len(),
        );

        Ok(batch.len())
    }
}

/**
A [`Persister`] from a function.
*/
pub struct FromFn<F>(F);

impl<F: Fn(&[Event]) -> Result<usize, DeliveryError>> Persister for FromFn<F> {
    fn persist(&self, batch: &[Event]) -> Result<usize, DeliveryError> {
        (self.0)(batch)
    }
}

/**
Create a [`Persister`] from a function.
*/
pub fn from_fn<F: Fn(&[Event]) -> Result<usize, DeliveryError>>(f: F) -> FromFn<F> {
    FromFn(f)
}

/**
A [`Persister`] that delivers each batch to two others.

The left persister is the primary sink. Both sides always receive the batch, but only a failure on the left is returned to the pipeline, where it's retried like any other delivery failure. A failure on the right is logged.
*/
pub struct And<T, U> {
    lhs: T,
    rhs: U,
}

impl<T, U> And<T, U> {
    /**
    The first persister.
    */
    pub fn left(&self) -> &T {
        &self.lhs
    }

    /**
    The second persister.
    */
    pub fn right(&self) -> &U {
        &self.rhs
    }
}

impl<T: Persister, U: Persister> Persister for And<T, U> {
    fn persist(&self, batch: &[Event]) -> Result<usize, DeliveryError> {
        let lhs = self.lhs.persist(batch);

        if let Err(err) = self.rhs.persist(batch) {
            emit::warn!(
                rt: emit::runtime::internal(),
                "failed to persist {count} events: {err}",
                count: batch.len(),
                err,
            );
        }

        lhs
    }
}

/**
A [`Persister`] that writes each batch as an indented tree of events through `emit`'s shared runtime.

Events that carry an error are written at the warning level.
*/
#[derive(Default, Debug, Clone, Copy)]
pub struct Log {
    data: bool,
}

impl Log {
    /**
    Create a new log persister.
    */
    pub const fn new() -> Self {
        Log { data: false }
    }

    /**
    Whether to include each event's data tree in its log line.
    */
    pub const fn with_data(mut self, data: bool) -> Self {
        self.data = data;
        self
    }
}

impl Persister for Log {
    fn persist(&self, batch: &[Event]) -> Result<usize, DeliveryError> {
        let tree = EventTree::new(batch);

        tree.walk(|depth, evt| {
            let indent = "  ".repeat(depth);
            let event_id = evt.id().to_u64();

            let line = match (self.data, evt.data()) {
                (true, Some(data)) => format!("{indent}{evt} data=\"{data}\""),
                _ => format!("{indent}{evt}"),
            };

            if evt.is_error() {
                emit::warn!(
                    rt: emit::runtime::shared(),
                    "{line}",
                    line,
                    event_id,
                    depth,
                );
            } else {
                emit::info!(
                    rt: emit::runtime::shared(),
                    "{line}",
                    line,
                    event_id,
                    depth,
                );
            }
        });

        Ok(batch.len())
    }
}
