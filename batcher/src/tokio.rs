/*!
Run channels in a `tokio` runtime.
*/

use std::{
    cmp,
    future::Future,
    io,
    time::{Duration, Instant},
};

use crate::{BatchError, Channel, Receiver, Sender};

/**
Spawn a worker to run the [`Receiver`] on a `tokio` runtime.

If the current thread is a `tokio` thread, then the worker will be spawned onto its runtime. If the current thread is not a `tokio` thread, then a single-threaded `tokio` runtime will be set up in a dedicated thread to run it.
*/
pub fn spawn<
    T: Channel + Send + 'static,
    F: Future<Output = Result<(), BatchError<T>>> + Send + 'static,
>(
    thread_name: impl Into<String>,
    receiver: Receiver<T>,
    on_batch: impl FnMut(T) -> F + Send + 'static,
) -> io::Result<()>
where
    T::Item: Send + 'static,
{
    let receive = async move {
        if let Err(err) = receiver
            .exec(|delay| tokio::time::sleep(delay), on_batch)
            .await
        {
            emit::error!(
                rt: emit::runtime::internal(),
                "background worker exited unexpectedly: {err}",
                #[emit::as_display]
                err,
            );
        }
    };

    match tokio::runtime::Handle::try_current() {
        // If we're on a `tokio` thread then spawn on it
        Ok(handle) => {
            handle.spawn(receive);
        }
        // If we're not on a `tokio` thread then spawn a
        // background thread and run the work there
        Err(_) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;

            std::thread::Builder::new()
                .name(thread_name.into())
                .spawn(move || runtime.block_on(receive))?;
        }
    }

    Ok(())
}

/**
Wait for a channel potentially running on a `tokio` thread to process all items active at the point this call was made.

If the current thread is a `tokio` thread then this call will be executed using [`tokio::task::block_in_place`] to avoid starving other work.
*/
pub fn blocking_flush<T: Channel>(sender: &Sender<T>, timeout: Duration) -> bool {
    let flush = || {
        let (notifier, mut notified) = tokio::sync::oneshot::channel();

        sender.on_next_flush(move || {
            let _ = notifier.send(());
        });

        // If there's nothing to flush then return immediately
        if notified.try_recv().is_ok() {
            return true;
        }

        let now = Instant::now();
        let mut wait = Duration::from_micros(1);
        let max_wait_step = cmp::min(
            cmp::max(timeout / 3, Duration::from_micros(1)),
            Duration::from_millis(100),
        );

        while now.elapsed() < timeout {
            match notified.try_recv() {
                // The notifier was triggered
                Ok(()) => return true,
                // Unexpected hangup; this should mean the channel was closed
                Err(tokio::sync::oneshot::error::TryRecvError::Closed) => return true,
                Err(tokio::sync::oneshot::error::TryRecvError::Empty) => (),
            }

            // Apply some exponential backoff to avoid spinning
            // Chances are if data isn't flushed immediately that
            // it'll be waiting on some IO and could be a while
            std::thread::sleep(wait);
            wait += cmp::min(wait * 2, max_wait_step);
        }

        false
    };

    match tokio::runtime::Handle::try_current() {
        Ok(_) => tokio::task::block_in_place(flush),
        Err(_) => flush(),
    }
}
