/*!
The [`SessionContext`] type.

A session context resolves the user and session an event is recorded on behalf of. It's consulted once for each event created by a [`crate::Tracker`].
*/

use std::sync::Arc;

use crate::empty::Empty;

/**
A source of the current user and session.
*/
pub trait SessionContext {
    /**
    The id of the user the current activity belongs to, if known.
    */
    fn user_id(&self) -> Option<String>;

    /**
    The id of the session the current activity belongs to, if known.
    */
    fn session_id(&self) -> Option<String>;

    /**
    Resolve both the user and session at once.
    */
    fn resolve(&self) -> Session {
        Session {
            user_id: self.user_id(),
            session_id: self.session_id(),
        }
    }
}

/**
A resolved user and session.
*/
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /** The id of the user. */
    pub user_id: Option<String>,
    /** The id of the session. */
    pub session_id: Option<String>,
}

impl SessionContext for Session {
    fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    fn resolve(&self) -> Session {
        self.clone()
    }
}

impl<'a, T: SessionContext + ?Sized> SessionContext for &'a T {
    fn user_id(&self) -> Option<String> {
        (**self).user_id()
    }

    fn session_id(&self) -> Option<String> {
        (**self).session_id()
    }

    fn resolve(&self) -> Session {
        (**self).resolve()
    }
}

impl<'a, T: SessionContext + ?Sized + 'a> SessionContext for Box<T> {
    fn user_id(&self) -> Option<String> {
        (**self).user_id()
    }

    fn session_id(&self) -> Option<String> {
        (**self).session_id()
    }

    fn resolve(&self) -> Session {
        (**self).resolve()
    }
}

impl<'a, T: SessionContext + ?Sized + 'a> SessionContext for Arc<T> {
    fn user_id(&self) -> Option<String> {
        (**self).user_id()
    }

    fn session_id(&self) -> Option<String> {
        (**self).session_id()
    }

    fn resolve(&self) -> Session {
        (**self).resolve()
    }
}

impl<T: SessionContext> SessionContext for Option<T> {
    fn user_id(&self) -> Option<String> {
        self.as_ref().and_then(|ctxt| ctxt.user_id())
    }

    fn session_id(&self) -> Option<String> {
        self.as_ref().and_then(|ctxt| ctxt.session_id())
    }

    fn resolve(&self) -> Session {
        self.as_ref().map(|ctxt| ctxt.resolve()).unwrap_or_default()
    }
}

impl SessionContext for Empty {
    fn user_id(&self) -> Option<String> {
        None
    }

    fn session_id(&self) -> Option<String> {
        None
    }
}

/**
A [`SessionContext`] from a function.
*/
pub struct FromFn<F>(F);

impl<F: Fn() -> Session> SessionContext for FromFn<F> {
    fn user_id(&self) -> Option<String> {
        (self.0)().user_id
    }

    fn session_id(&self) -> Option<String> {
        (self.0)().session_id
    }

    fn resolve(&self) -> Session {
        (self.0)()
    }
}

/**
Create a [`SessionContext`] from a function that resolves the current [`Session`].
*/
pub fn from_fn<F: Fn() -> Session>(f: F) -> FromFn<F> {
    FromFn(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_fn_resolves_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = AtomicUsize::new(0);
        let ctxt = from_fn(|| {
            calls.fetch_add(1, Ordering::Relaxed);

            Session {
                user_id: Some("alice".into()),
                session_id: Some("s-1".into()),
            }
        });

        let session = ctxt.resolve();

        assert_eq!(Some("alice"), session.user_id.as_deref());
        assert_eq!(Some("s-1"), session.session_id.as_deref());
        assert_eq!(1, calls.load(Ordering::Relaxed));
    }

    #[test]
    fn empty_resolves_nothing() {
        assert_eq!(Session::default(), Empty.resolve());
        assert_eq!(Session::default(), None::<Session>.resolve());
    }
}
