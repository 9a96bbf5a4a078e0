/*!
The [`Clock`] type.

A clock reads the current wall-clock time when an event starts. Durations are measured separately with a monotonic [`std::time::Instant`], so a clock that jumps doesn't affect them.
*/

use std::{sync::Arc, time::UNIX_EPOCH};

use crate::{empty::Empty, timestamp::Timestamp};

/**
A source of wall-clock timestamps.
*/
pub trait Clock {
    /**
    Read the current time, or `None` if it's unavailable.
    */
    fn now(&self) -> Option<Timestamp>;
}

impl<'a, T: Clock + ?Sized> Clock for &'a T {
    fn now(&self) -> Option<Timestamp> {
        (**self).now()
    }
}

impl<T: Clock> Clock for Option<T> {
    fn now(&self) -> Option<Timestamp> {
        match self {
            Some(clock) => clock.now(),
            None => Empty.now(),
        }
    }
}

impl<'a, T: Clock + ?Sized + 'a> Clock for Box<T> {
    fn now(&self) -> Option<Timestamp> {
        (**self).now()
    }
}

impl<'a, T: Clock + ?Sized + 'a> Clock for Arc<T> {
    fn now(&self) -> Option<Timestamp> {
        (**self).now()
    }
}

impl Clock for Empty {
    fn now(&self) -> Option<Timestamp> {
        None
    }
}

/**
A [`Clock`] based on the system's wall-clock time.
*/
#[derive(Default, Debug, Clone, Copy)]
pub struct SystemClock {}

impl SystemClock {
    /**
    Create a new system clock.
    */
    pub const fn new() -> Self {
        SystemClock {}
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Option<Timestamp> {
        Timestamp::from_unix(UNIX_EPOCH.elapsed().unwrap_or_default())
    }
}

/**
A [`Clock`] that always returns the same timestamp.
*/
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub Timestamp);

impl Clock for FixedClock {
    fn now(&self) -> Option<Timestamp> {
        Some(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_after_epoch() {
        let now = SystemClock::new().now().unwrap();

        assert!(now > Timestamp::UNIX_EPOCH);
    }

    #[test]
    fn empty_has_no_time() {
        assert!(Empty.now().is_none());
        assert!(None::<SystemClock>.now().is_none());
    }
}
