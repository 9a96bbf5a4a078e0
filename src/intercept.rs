/*!
Run a call inside an event.

This is the shared core of the adapters. The call's result, error, or panic is handed back to the caller
exactly as it was produced.

Misuse of the tracker, like an event left open inside the call, leaves the thread's correlation stack
inconsistent. That's a bug in the instrumented code, so it panics with the [`crate::UsageError`] instead of
being logged and ignored.
*/

use std::{
    any::Any,
    error::Error,
    panic::{self, AssertUnwindSafe},
};

use crate::{event::Event, manager::Tracker};

/**
Start `evt`, run `call`, record its outcome, and stop `evt`.

`on_ok` can attach data from a successful result before the event is stopped.

# Panics

Panics without running `call` if `evt` can't be started. Panics after running `call` if `evt` can't be stopped.
*/
pub(crate) fn intercept<T, R, E>(
    tracker: &T,
    evt: Event,
    call: impl FnOnce() -> Result<R, E>,
    on_ok: impl FnOnce(&mut Event, &R),
) -> Result<R, E>
where
    T: Tracker + ?Sized,
    E: Error,
{
    intercept_with(tracker, evt, call, on_ok, |_| {})
}

/**
Like [`intercept`], but `on_failure` can attach data when `call` returns an error or panics.

The error itself is recorded after `on_failure` runs.
*/
pub(crate) fn intercept_with<T, R, E>(
    tracker: &T,
    mut evt: Event,
    call: impl FnOnce() -> Result<R, E>,
    on_ok: impl FnOnce(&mut Event, &R),
    on_failure: impl FnOnce(&mut Event),
) -> Result<R, E>
where
    T: Tracker + ?Sized,
    E: Error,
{
    if let Err(err) = tracker.start(&mut evt) {
        panic!("failed to start {} event {}: {err}", evt.kind(), evt.name());
    }

    let result = panic::catch_unwind(AssertUnwindSafe(call));

    match &result {
        Ok(Ok(value)) => on_ok(&mut evt, value),
        Ok(Err(err)) => {
            on_failure(&mut evt);
            evt.set_error(err);
        }
        Err(payload) => {
            on_failure(&mut evt);
            evt.set_error_message(format!("panicked: {}", panic_message(&**payload)));
        }
    }

    match result {
        Ok(result) => {
            stop(tracker, evt);

            result
        }
        Err(payload) => {
            // Don't panic while already unwinding; the original panic is resumed instead
            if let Err(err) = tracker.stop(evt) {
                let (err, evt) = err.into_parts();

                emit::error!(
                    rt: emit::runtime::internal(),
                    "failed to stop {kind} event {name}: {err}",
                    kind: evt.kind(),
                    name: evt.name(),
                    err,
                );
            }

            panic::resume_unwind(payload)
        }
    }
}

/**
Stop `evt`.

# Panics

Panics if `evt` can't be stopped.
*/
pub(crate) fn stop<T: Tracker + ?Sized>(tracker: &T, evt: Event) {
    if let Err(err) = tracker.stop(evt) {
        let (err, evt) = err.into_parts();

        panic!("failed to stop {} event {}: {err}", evt.kind(), evt.name());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic payload"
    }
}
