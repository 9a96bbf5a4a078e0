/*!
The [`Empty`] type.

An [`Empty`] can be used as a default in place of a more meaningful implementation of most traits. For example, for [`crate::session::SessionContext`], it never resolves a user or session, for [`crate::persister::Persister`]s, it discards events, and for [`crate::clock::Clock`]s, it never produces a timestamp.
*/

/**
A type that behaves like a default, empty, null value.
*/
#[derive(Default, Debug, Clone, Copy)]
pub struct Empty;
