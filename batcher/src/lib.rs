/*!
Batch processing infrastructure for `beet`.

A [`bounded`] channel is split into a [`Sender`], used by any number of producer threads, and a [`Receiver`], driven by exactly one background worker. Producers push items under a short lock; the worker periodically swaps the pending items out and hands them to a callback as a single batch. Batches are processed strictly in the order they were sent.

If a batch fails it can be retried with an increasing delay, up to the configured number of attempts, before being dropped. A batch that panics is dropped without affecting the worker.

Callers that need a synchronization point can register a watcher with [`Sender::on_next_flush`]. Watchers fire once every item sent before they were registered has been attempted. The [`sync`] and `tokio` modules build blocking flushes on top of this.
*/

#![deny(missing_docs)]

use crate::internal_metrics::InternalMetrics;
use std::{
    any::Any,
    cmp, error, fmt,
    future::{self, Future},
    mem,
    panic::{self, AssertUnwindSafe, UnwindSafe},
    pin::{pin, Pin},
    sync::{Arc, Mutex, MutexGuard, OnceLock},
    task::{self, Context, Poll},
    thread,
    time::Duration,
};

mod internal_metrics;

pub use internal_metrics::ChannelMetrics;

type Error = Box<dyn error::Error + Send + Sync + 'static>;

/**
A buffer that accumulates items between batches.
*/
pub trait Channel {
    /**
    The type of item pushed onto the channel.
    */
    type Item;

    /**
    Create a new, empty channel.
    */
    fn new() -> Self;

    /**
    Create a new, empty channel with room for at least `capacity` items.
    */
    fn with_capacity(capacity: usize) -> Self
    where
        Self: Sized,
    {
        let _ = capacity;

        Self::new()
    }

    /**
    Push an item onto the end of the channel.
    */
    fn push(&mut self, item: Self::Item);

    /**
    The number of items that haven't been processed yet.
    */
    fn remaining(&self) -> usize;

    /**
    Whether there are no items left to process.
    */
    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /**
    Discard all items.
    */
    fn clear(&mut self);
}

impl<T> Channel for Vec<T> {
    type Item = T;

    fn new() -> Self {
        Vec::new()
    }

    fn with_capacity(capacity: usize) -> Self {
        Vec::with_capacity(capacity)
    }

    fn push(&mut self, item: Self::Item) {
        Vec::push(self, item);
    }

    fn remaining(&self) -> usize {
        self.len()
    }

    fn is_empty(&self) -> bool {
        Vec::is_empty(self)
    }

    fn clear(&mut self) {
        Vec::clear(self)
    }
}

/**
Tuning for the worker side of a channel.
*/
#[derive(Debug, Clone, Copy)]
pub struct Options {
    idle_step: Duration,
    idle_max: Duration,
    max_retries: u32,
    retry_step: Duration,
    retry_max: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options::new()
    }
}

impl Options {
    /**
    Options with the following defaults:

    - Idle polling backs off from 1ms up to 500ms.
    - Failed batches are retried up to 10 times.
    - Retries back off from 50ms up to 1s.
    */
    pub const fn new() -> Self {
        Options {
            idle_step: Duration::from_millis(1),
            idle_max: Duration::from_millis(500),
            max_retries: 10,
            retry_step: Duration::from_millis(50),
            retry_max: Duration::from_secs(1),
        }
    }

    /**
    The longest the worker will sleep between checks for new items while idle.
    */
    pub fn idle_delay(mut self, max: Duration) -> Self {
        self.idle_max = max;
        self.idle_step = cmp::min(self.idle_step, max);
        self
    }

    /**
    The number of times a failed batch is retried before it's dropped.

    A value of `0` means every batch is attempted exactly once.
    */
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /**
    The backoff applied between retries. Each delay is double the previous one plus `step`, capped at `max`.
    */
    pub fn retry_delay(mut self, step: Duration, max: Duration) -> Self {
        self.retry_step = step;
        self.retry_max = max;
        self
    }
}

/**
Create a channel that holds at most `max_capacity` unprocessed items, using the default [`Options`].
*/
pub fn bounded<T: Channel>(max_capacity: usize) -> (Sender<T>, Receiver<T>) {
    bounded_with(max_capacity, Options::new())
}

/**
Create a channel that holds at most `max_capacity` unprocessed items.

If a producer pushes onto a full channel, all pending items are discarded. This keeps memory bounded when the destination is unavailable.
*/
pub fn bounded_with<T: Channel>(max_capacity: usize, options: Options) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        metrics: Default::default(),
        state: Mutex::new(State {
            next_batch: Batch::new(),
            is_open: true,
            is_in_batch: false,
        }),
    });

    (
        Sender {
            max_capacity,
            shared: shared.clone(),
        },
        Receiver {
            idle_delay: Delay::new(options.idle_step, options.idle_max),
            retry: Retry::new(options.max_retries),
            retry_delay: Delay::new(options.retry_step, options.retry_max),
            capacity: Capacity::new(),
            shared,
        },
    )
}

/**
The producer side of a channel.

Dropping the sender closes the channel. The receiver will process any remaining items and then return.
*/
pub struct Sender<T> {
    max_capacity: usize,
    shared: Arc<Shared<T>>,
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.shared.lock().is_open = false;
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("max_capacity", &self.max_capacity)
            .finish_non_exhaustive()
    }
}

impl<T: Channel> Sender<T> {
    /**
    Push an item onto the channel.

    This method never blocks on the receiver; it only takes a short lock on the pending batch.
    */
    pub fn send(&self, msg: T::Item) {
        let mut state = self.shared.lock();

        // If the channel is closed then return without adding the message
        if !state.is_open {
            return;
        }

        // If the channel is full then drop it; this prevents OOMing
        // when the destination is unavailable. We don't notify the batch
        // in this case because the clearing is opaque to outside observers
        let mut dropped = 0;
        if state.next_batch.channel.remaining() >= self.max_capacity {
            dropped = state.next_batch.channel.remaining();

            state.next_batch.channel.clear();
            self.shared.metrics.queue_overflow.increment();
        }

        state.next_batch.channel.push(msg);
        drop(state);

        if dropped > 0 {
            emit::warn!(
                rt: emit::runtime::internal(),
                "queue overflowed; discarded {dropped} pending items",
                dropped,
            );
        }
    }

    /**
    Register a watcher that's called once all items sent before this call have been processed.

    If there's nothing to wait for then the watcher is called immediately on this thread.
    */
    pub fn on_next_flush(&self, watcher: impl FnOnce() + Send + 'static) {
        let watcher = Box::new(watcher);

        let mut state = self.shared.lock();

        // If:
        // - We're not in a batch and
        //   - the next batch is empty (there's no data) or
        //   - the state is closed
        // Then:
        // - Call the watcher without scheduling it; there's nothing to wait for
        if !state.is_open || (!state.is_in_batch && state.next_batch.channel.is_empty()) {
            // Drop the lock before signalling the watcher
            drop(state);

            watcher();
        }
        // If there's active data to flush then schedule the watcher
        else {
            state.next_batch.watchers.push(watcher);
        }
    }

    /**
    Close the channel without dropping the sender.

    Items sent after closing are discarded. The receiver will process anything still pending and then return.
    */
    pub fn close(&self) {
        self.shared.lock().is_open = false;
    }

    /**
    Whether the channel is still accepting items.
    */
    pub fn is_open(&self) -> bool {
        self.shared.lock().is_open
    }

    /**
    The number of items waiting for the next batch.
    */
    pub fn remaining(&self) -> usize {
        self.shared.lock().next_batch.channel.remaining()
    }

    /**
    Take a snapshot of the channel's health counters.
    */
    pub fn metrics(&self) -> ChannelMetrics {
        self.shared.sample_metrics()
    }
}

/**
The consumer side of a channel.

Run it with [`Receiver::exec`], [`Receiver::blocking_exec`], [`sync::spawn`], or `tokio::spawn` (with the `tokio` feature).
*/
pub struct Receiver<T> {
    idle_delay: Delay,
    retry: Retry,
    retry_delay: Delay,
    capacity: Capacity,
    shared: Arc<Shared<T>>,
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let watchers = {
            let mut state = self.shared.lock();
            state.is_open = false;

            mem::take(&mut state.next_batch.watchers)
        };

        // Nobody is left to process pending items, so release anyone waiting on them
        watchers.notify();
    }
}

/**
The result of a failed batch.

A batch error carries the items that may be retried, if any.
*/
pub struct BatchError<T> {
    err: Error,
    retryable: T,
}

impl<T> fmt::Debug for BatchError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchError")
            .field("err", &self.err)
            .finish_non_exhaustive()
    }
}

impl<T: Channel> BatchError<T> {
    /**
    The batch failed, but the items in `retryable` may be attempted again.
    */
    pub fn retry(err: impl Into<Error>, retryable: T) -> Self {
        BatchError {
            err: err.into(),
            retryable,
        }
    }

    /**
    The batch failed and nothing should be retried.
    */
    pub fn no_retry(err: impl Into<Error>) -> Self {
        BatchError {
            err: err.into(),
            retryable: T::new(),
        }
    }

    /**
    The error that caused the batch to fail.
    */
    pub fn error(&self) -> &(dyn error::Error + Send + Sync + 'static) {
        &*self.err
    }

    /**
    Get the items that may be retried.
    */
    pub fn into_retryable(self) -> T {
        self.retryable
    }

    /**
    Map the retryable items into a different channel type.
    */
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> BatchError<U> {
        BatchError {
            err: self.err,
            retryable: f(self.retryable),
        }
    }
}

impl<T: Channel> Receiver<T> {
    /**
    Run the receiver on the current thread until its sender is dropped.

    `on_batch` is called synchronously for each batch. Idle waits and retry delays block the thread.
    */
    pub fn blocking_exec(
        self,
        mut on_batch: impl FnMut(T) -> Result<(), BatchError<T>>,
    ) -> Result<(), Error> {
        static WAKER: OnceLock<Arc<NeverWake>> = OnceLock::new();

        // A waker that does nothing; the tasks it runs are fully
        // synchronous so there's never any notifications to issue
        struct NeverWake;

        impl task::Wake for NeverWake {
            fn wake(self: Arc<Self>) {}
        }

        // The future is polled to completion here, so we can pin
        // it directly on the stack
        let mut fut = pin!(self.exec(
            |delay| future::ready(thread::sleep(delay)),
            move |batch| future::ready(on_batch(batch)),
        ));

        // Get a context for our synchronous task
        let waker = WAKER.get_or_init(|| Arc::new(NeverWake)).clone().into();
        let mut cx = task::Context::from_waker(&waker);

        // Drive the task to completion; it should complete in one go,
        // but may eagerly return as soon as it hits an await point, so
        // just to be sure we continuously poll it
        loop {
            match fut.as_mut().poll(&mut cx) {
                task::Poll::Ready(r) => return r,
                task::Poll::Pending => continue,
            }
        }
    }

    /**
    Run the receiver until its sender is dropped.

    `wait` is used to sleep between polls and retries. `on_batch` processes each batch.
    */
    pub async fn exec<
        FBatch: Future<Output = Result<(), BatchError<T>>>,
        FWait: Future<Output = ()>,
    >(
        mut self,
        mut wait: impl FnMut(Duration) -> FWait,
        mut on_batch: impl FnMut(T) -> FBatch,
    ) -> Result<(), Error> {
        // This variable holds the "next" batch
        // Under the lock all we do is push onto a pre-allocated vec
        // and replace it with another pre-allocated vec
        let mut next_batch = Batch::new();

        loop {
            // Run inside the lock
            let (mut current_batch, is_open) = {
                let mut state = self.shared.lock();

                // NOTE: We don't check the `is_open` value here because we want a chance to process
                // any last batch

                // If there are items then mark that we're in a batch and replace it with an empty one
                // The sender will start filling this new batch
                if state.next_batch.channel.remaining() > 0 {
                    state.is_in_batch = true;

                    (
                        mem::replace(&mut state.next_batch, mem::take(&mut next_batch)),
                        state.is_open,
                    )
                }
                // If there are no items then mark that we're outside of a batch and take its watchers
                else {
                    state.is_in_batch = false;

                    let watchers = mem::take(&mut state.next_batch.watchers);
                    let open = state.is_open;

                    (
                        Batch {
                            channel: T::new(),
                            watchers,
                        },
                        open,
                    )
                }
            };

            // Run outside of the lock
            if current_batch.channel.remaining() > 0 {
                self.retry.reset();
                self.retry_delay.reset();
                self.idle_delay.reset();

                // Re-allocate our next buffer outside of the lock
                next_batch = Batch {
                    channel: T::with_capacity(
                        self.capacity.next(current_batch.channel.remaining()),
                    ),
                    watchers: Watchers::new(),
                };

                // Process the batch, taking care not to panic
                loop {
                    match panic::catch_unwind(AssertUnwindSafe(|| on_batch(current_batch.channel)))
                    {
                        Ok(on_batch) => match CatchUnwind(AssertUnwindSafe(on_batch)).await {
                            Ok(Ok(())) => {
                                self.shared.metrics.queue_batch_processed.increment();
                            }
                            Ok(Err(BatchError { err, retryable })) => {
                                self.shared.metrics.queue_batch_failed.increment();

                                let count = retryable.remaining();

                                if count == 0 {
                                    emit::warn!(
                                        rt: emit::runtime::internal(),
                                        "failed to process batch: {err}",
                                        #[emit::as_display]
                                        err,
                                    );
                                } else if self.retry.next() {
                                    // Delay a bit before trying again; this gives the external service
                                    // a chance to get itself together
                                    let delay = self.retry_delay.next();

                                    emit::debug!(
                                        rt: emit::runtime::internal(),
                                        "retrying {count} items in {delay}: {err}",
                                        count,
                                        #[emit::as_debug]
                                        delay,
                                        #[emit::as_display]
                                        err,
                                    );

                                    wait(delay).await;

                                    current_batch = Batch {
                                        channel: retryable,
                                        watchers: current_batch.watchers,
                                    };

                                    self.shared.metrics.queue_batch_retry.increment();
                                    continue;
                                } else {
                                    let attempts = self.retry.attempts();

                                    emit::warn!(
                                        rt: emit::runtime::internal(),
                                        "dropping {count} items after {attempts} attempts: {err}",
                                        count,
                                        attempts,
                                        #[emit::as_display]
                                        err,
                                    );
                                }
                            }
                            Err(_) => {
                                self.shared.metrics.queue_batch_panicked.increment();

                                emit::warn!(
                                    rt: emit::runtime::internal(),
                                    "batch processing panicked; the batch was dropped",
                                );
                            }
                        },
                        Err(_) => {
                            self.shared.metrics.queue_batch_panicked.increment();

                            emit::warn!(
                                rt: emit::runtime::internal(),
                                "batch processing panicked; the batch was dropped",
                            );
                        }
                    }

                    break;
                }

                // After the batch has been processed, notify any watchers
                current_batch.watchers.notify();
            }
            // If the batch was empty then notify any watchers (there was nothing to flush)
            // and wait before checking again
            else {
                current_batch.watchers.notify();

                // If the channel is closed then exit the loop and return; this will
                // drop the receiver
                if !is_open {
                    return Ok(());
                }

                // If we didn't see any items, then sleep for a bit
                wait(self.idle_delay.next()).await;
            }
        }
    }

    /**
    Take a snapshot of the channel's health counters.
    */
    pub fn metrics(&self) -> ChannelMetrics {
        self.shared.sample_metrics()
    }
}

struct CatchUnwind<F>(F);

impl<F: Future + UnwindSafe> Future for CatchUnwind<F> {
    type Output = Result<F::Output, Box<dyn Any + Send>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `CatchUnwind` uses structural pinning
        let f = unsafe { Pin::map_unchecked_mut(self, |x| &mut x.0) };

        panic::catch_unwind(AssertUnwindSafe(|| f.poll(cx)))?.map(Ok)
    }
}

struct Delay {
    current: Duration,
    step: Duration,
    max: Duration,
}

impl Delay {
    fn new(step: Duration, max: Duration) -> Delay {
        Delay {
            current: Duration::ZERO,
            step,
            max,
        }
    }

    fn reset(&mut self) {
        self.current = Duration::ZERO
    }

    fn next(&mut self) -> Duration {
        self.current = cmp::min(self.current * 2 + self.step, self.max);
        self.current
    }
}

const CAPACITY_WINDOW: usize = 16;

struct Capacity([usize; CAPACITY_WINDOW], usize);

impl Capacity {
    fn new() -> Self {
        Capacity([1; CAPACITY_WINDOW], 0)
    }

    fn next(&mut self, last_len: usize) -> usize {
        self.0[self.1 % CAPACITY_WINDOW] = last_len;
        self.1 = self.1.wrapping_add(1);

        self.0.iter().copied().max().unwrap_or(last_len)
    }
}

struct Retry {
    current: u32,
    max: u32,
}

impl Retry {
    fn new(max: u32) -> Self {
        Retry { current: 0, max }
    }

    fn reset(&mut self) {
        self.current = 0;
    }

    fn next(&mut self) -> bool {
        self.current += 1;
        self.current <= self.max
    }

    fn attempts(&self) -> u32 {
        self.current
    }
}

struct Shared<T> {
    metrics: InternalMetrics,
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // Watchers and batches run outside the lock, so a poisoned
        // lock still guards consistent state
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Channel> Shared<T> {
    fn sample_metrics(&self) -> ChannelMetrics {
        let queue_length = self.lock().next_batch.channel.remaining();

        self.metrics.sample(queue_length)
    }
}

struct State<T> {
    next_batch: Batch<T>,
    is_open: bool,
    is_in_batch: bool,
}

struct Batch<T> {
    channel: T,
    watchers: Watchers,
}

impl<T: Channel> Batch<T> {
    fn new() -> Self {
        Batch {
            channel: T::new(),
            watchers: Watchers::new(),
        }
    }
}

impl<T: Channel> Default for Batch<T> {
    fn default() -> Self {
        Batch::new()
    }
}

struct Watchers(Vec<Watcher>);

type Watcher = Box<dyn FnOnce() + Send>;

impl Default for Watchers {
    fn default() -> Self {
        Watchers::new()
    }
}

impl Watchers {
    fn new() -> Self {
        Watchers(Vec::new())
    }

    fn push(&mut self, watcher: Watcher) {
        self.0.push(watcher);
    }

    fn notify(self) {
        for watcher in self.0 {
            let _ = panic::catch_unwind(AssertUnwindSafe(watcher));
        }
    }
}

pub mod sync;

#[cfg(feature = "tokio")]
pub mod tokio;
