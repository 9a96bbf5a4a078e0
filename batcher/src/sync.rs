/*!
Run channels on a dedicated background thread.
*/

use std::{
    io,
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use crate::{BatchError, Channel, Receiver, Sender};

/**
Spawn a named background thread that runs the [`Receiver`] until its [`Sender`] is dropped.
*/
pub fn spawn<T: Channel + Send + 'static>(
    thread_name: impl Into<String>,
    receiver: Receiver<T>,
    on_batch: impl FnMut(T) -> Result<(), BatchError<T>> + Send + 'static,
) -> io::Result<thread::JoinHandle<()>>
where
    T::Item: Send + 'static,
{
    thread::Builder::new()
        .name(thread_name.into())
        .spawn(move || {
            if let Err(err) = receiver.blocking_exec(on_batch) {
                emit::error!(
                    rt: emit::runtime::internal(),
                    "background worker exited unexpectedly: {err}",
                    #[emit::as_display]
                    err,
                );
            }
        })
}

#[derive(Clone)]
struct Trigger(Arc<(Mutex<bool>, Condvar)>);

impl Trigger {
    fn new() -> Self {
        Trigger(Arc::new((Mutex::new(false), Condvar::new())))
    }

    fn trigger(self) {
        *(self.0)
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        (self.0).1.notify_all();
    }

    fn wait(&self) {
        let mut flushed = (self.0)
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while !*flushed {
            flushed = (self.0)
                .1
                .wait(flushed)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        // A timeout too large to represent is the same as no timeout
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };

        let mut flushed = (self.0)
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while !*flushed {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };

            flushed = match (self.0).1.wait_timeout(flushed, remaining) {
                Ok((next_flushed, _)) => next_flushed,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        true
    }
}

fn on_next_flush<T: Channel>(sender: &Sender<T>) -> Trigger {
    let on_flush = Trigger::new();

    sender.on_next_flush({
        let on_flush = on_flush.clone();

        move || {
            on_flush.trigger();
        }
    });

    on_flush
}

/**
Block until all items sent before this call have been processed.
*/
pub fn flush<T: Channel>(sender: &Sender<T>) {
    on_next_flush(sender).wait();
}

/**
Block until all items sent before this call have been processed, or until `timeout` elapses.

Returns `true` if the flush completed within the timeout.
*/
pub fn blocking_flush<T: Channel>(sender: &Sender<T>, timeout: Duration) -> bool {
    on_next_flush(sender).wait_timeout(timeout)
}
