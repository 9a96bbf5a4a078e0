/*!
The [`Ctxt`] type.

A context tracks the events that are currently open, so new events can pick up their parent. The default [`ThreadLocalCtxt`] keeps a separate stack for each thread, so an event created on one thread can never become the child of an event open on another.
*/

use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{
    error::CorrelationError,
    event::{EventId, EventRef},
};

/**
A LIFO stack of open events.
*/
pub trait Ctxt {
    /**
    The event on top of the stack, if any.
    */
    fn current(&self) -> Option<EventRef>;

    /**
    Push an event onto the stack.
    */
    fn push(&self, evt: EventRef);

    /**
    Pop the event with the given id off the stack.

    If the event isn't on top of the stack then the stack is left unchanged and an error is returned.
    */
    fn pop(&self, id: EventId) -> Result<EventRef, CorrelationError>;

    /**
    The number of open events on the stack.
    */
    fn depth(&self) -> usize;
}

impl<'a, T: Ctxt + ?Sized> Ctxt for &'a T {
    fn current(&self) -> Option<EventRef> {
        (**self).current()
    }

    fn push(&self, evt: EventRef) {
        (**self).push(evt)
    }

    fn pop(&self, id: EventId) -> Result<EventRef, CorrelationError> {
        (**self).pop(id)
    }

    fn depth(&self) -> usize {
        (**self).depth()
    }
}

impl<'a, T: Ctxt + ?Sized + 'a> Ctxt for Box<T> {
    fn current(&self) -> Option<EventRef> {
        (**self).current()
    }

    fn push(&self, evt: EventRef) {
        (**self).push(evt)
    }

    fn pop(&self, id: EventId) -> Result<EventRef, CorrelationError> {
        (**self).pop(id)
    }

    fn depth(&self) -> usize {
        (**self).depth()
    }
}

impl<'a, T: Ctxt + ?Sized + 'a> Ctxt for Arc<T> {
    fn current(&self) -> Option<EventRef> {
        (**self).current()
    }

    fn push(&self, evt: EventRef) {
        (**self).push(evt)
    }

    fn pop(&self, id: EventId) -> Result<EventRef, CorrelationError> {
        (**self).pop(id)
    }

    fn depth(&self) -> usize {
        (**self).depth()
    }
}

thread_local! {
    static STACKS: RefCell<HashMap<usize, Vec<EventRef>>> = RefCell::new(HashMap::new());
}

static NEXT_CTXT: AtomicUsize = AtomicUsize::new(0);

/**
A [`Ctxt`] that keeps a separate stack for each thread.

Each instance has its own set of stacks, so two managers running on the same thread don't see each other's events.
*/
#[derive(Debug)]
pub struct ThreadLocalCtxt {
    key: usize,
}

impl Default for ThreadLocalCtxt {
    fn default() -> Self {
        ThreadLocalCtxt::new()
    }
}

impl ThreadLocalCtxt {
    /**
    Create a new context with its own, initially empty, stacks.
    */
    pub fn new() -> Self {
        ThreadLocalCtxt {
            key: NEXT_CTXT.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn with_stack<R>(&self, f: impl FnOnce(&mut Vec<EventRef>) -> R) -> R {
        STACKS.with(|stacks| {
            let mut stacks = stacks.borrow_mut();

            let stack = stacks.entry(self.key).or_default();
            let r = f(stack);

            // Don't hold on to stacks for contexts that are no longer in use
            if stack.is_empty() {
                stacks.remove(&self.key);
            }

            r
        })
    }
}

impl Ctxt for ThreadLocalCtxt {
    fn current(&self) -> Option<EventRef> {
        STACKS.with(|stacks| {
            stacks
                .borrow()
                .get(&self.key)
                .and_then(|stack| stack.last().cloned())
        })
    }

    fn push(&self, evt: EventRef) {
        self.with_stack(|stack| stack.push(evt))
    }

    fn pop(&self, id: EventId) -> Result<EventRef, CorrelationError> {
        self.with_stack(|stack| match stack.pop() {
            Some(top) if top.id() == id => Ok(top),
            Some(top) => {
                let current = top.id();
                stack.push(top);

                Err(CorrelationError::new(id, Some(current)))
            }
            None => Err(CorrelationError::new(id, None)),
        })
    }

    fn depth(&self) -> usize {
        STACKS.with(|stacks| stacks.borrow().get(&self.key).map(Vec::len).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::event::Event;

    #[test]
    fn pop_out_of_order_leaves_stack_unchanged() {
        let ctxt = ThreadLocalCtxt::new();

        let a = Event::new("test", "a");
        let b = Event::new("test", "b");

        ctxt.push(a.to_ref());
        ctxt.push(b.to_ref());

        let err = ctxt.pop(a.id()).unwrap_err();

        assert_eq!(a.id(), err.event());
        assert_eq!(Some(b.id()), err.current());
        assert_eq!(2, ctxt.depth());
        assert_eq!(Some(b.id()), ctxt.current().map(|evt| evt.id()));

        ctxt.pop(b.id()).unwrap();
        ctxt.pop(a.id()).unwrap();
        assert_eq!(0, ctxt.depth());
    }

    #[test]
    fn pop_empty_stack() {
        let ctxt = ThreadLocalCtxt::new();
        let a = Event::new("test", "a");

        let err = ctxt.pop(a.id()).unwrap_err();

        assert_eq!(None, err.current());
    }

    #[test]
    fn instances_are_isolated() {
        let a = ThreadLocalCtxt::new();
        let b = ThreadLocalCtxt::new();

        let evt = Event::new("test", "a");
        a.push(evt.to_ref());

        assert_eq!(1, a.depth());
        assert_eq!(0, b.depth());
        assert!(b.current().is_none());
    }

    #[test]
    fn threads_are_isolated() {
        let ctxt = Arc::new(ThreadLocalCtxt::new());

        let evt = Event::new("test", "a");
        ctxt.push(evt.to_ref());

        let other = ctxt.clone();
        let depth = std::thread::spawn(move || other.depth()).join().unwrap();

        assert_eq!(0, depth);
        assert_eq!(1, ctxt.depth());
    }
}
