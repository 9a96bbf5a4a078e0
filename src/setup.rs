/*!
The [`Setup`] type.

A setup configures and spawns a [`Manager`]:

```
use std::time::Duration;

let manager = beet::setup()
    .application("orders")
    .persist_to(beet::persister::Log::new())
    .spawn()
    .unwrap();

// ..

manager.shutdown(Duration::from_secs(5));
```
*/

use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use crate::{
    clock::{Clock, SystemClock},
    ctxt::{Ctxt, ThreadLocalCtxt},
    empty::Empty,
    error::SetupError,
    event::Event,
    manager::{Counters, Inner, Manager, Worker},
    persister::{And, Persister},
    session::SessionContext,
};

/**
The default maximum number of events handed to a persister at once.
*/
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/**
The default maximum number of events waiting for delivery.
*/
pub const DEFAULT_MAX_QUEUE_LEN: usize = 10_000;

/**
The default longest time the drain loop sleeps while idle.
*/
pub const DEFAULT_IDLE_DELAY: Duration = Duration::from_millis(100);

/**
How failed deliveries are retried.

The default is not to retry, so every batch is attempted exactly once.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    delay_step: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new()
    }
}

impl RetryPolicy {
    /**
    A policy that never retries, with a backoff of 50ms steps up to 1s if retries are enabled.
    */
    pub const fn new() -> Self {
        RetryPolicy {
            max_retries: 0,
            delay_step: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }

    /**
    The number of times a failed batch is retried before it's dropped.
    */
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /**
    The backoff between retries. Each delay is double the previous one plus `step`, capped at `max`.
    */
    pub const fn delay(mut self, step: Duration, max: Duration) -> Self {
        self.delay_step = step;
        self.max_delay = max;
        self
    }

    /**
    The configured number of retries.
    */
    pub const fn retries(&self) -> u32 {
        self.max_retries
    }
}

/**
Start configuring a [`Manager`].
*/
pub fn setup() -> Setup {
    Setup::new()
}

/**
A configuration for a [`Manager`].
*/
#[must_use = "call `.spawn()` to start the manager"]
pub struct Setup<TPersister = Empty> {
    persister: TPersister,
    application: Option<String>,
    session: Box<dyn SessionContext + Send + Sync>,
    ctxt: Option<Box<dyn Ctxt + Send + Sync>>,
    clock: Arc<dyn Clock + Send + Sync>,
    max_batch_size: usize,
    max_queue_len: usize,
    idle_delay: Duration,
    retry: RetryPolicy,
    flush_timeout: Option<Duration>,
    track_flushes: bool,
    thread_name: String,
}

impl Default for Setup {
    fn default() -> Self {
        Setup::new()
    }
}

impl Setup {
    /**
    Create a default configuration.

    Events are discarded until a persister is configured with [`Setup::persist_to`].
    */
    pub fn new() -> Self {
        Setup {
            persister: Empty,
            application: None,
            session: Box::new(Empty),
            ctxt: None,
            clock: Arc::new(SystemClock::new()),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_queue_len: DEFAULT_MAX_QUEUE_LEN,
            idle_delay: DEFAULT_IDLE_DELAY,
            retry: RetryPolicy::new(),
            flush_timeout: None,
            track_flushes: false,
            thread_name: String::from("beet-worker"),
        }
    }
}

impl<TPersister: Persister> Setup<TPersister> {
    /**
    Deliver events to the given persister.
    */
    pub fn persist_to<UPersister: Persister>(self, persister: UPersister) -> Setup<UPersister> {
        Setup {
            persister,
            application: self.application,
            session: self.session,
            ctxt: self.ctxt,
            clock: self.clock,
            max_batch_size: self.max_batch_size,
            max_queue_len: self.max_queue_len,
            idle_delay: self.idle_delay,
            retry: self.retry,
            flush_timeout: self.flush_timeout,
            track_flushes: self.track_flushes,
            thread_name: self.thread_name,
        }
    }

    /**
    Deliver events to the given persister in addition to any already configured.
    */
    pub fn and_persist_to<UPersister: Persister>(
        self,
        persister: UPersister,
    ) -> Setup<And<TPersister, UPersister>> {
        Setup {
            persister: self.persister.and_to(persister),
            application: self.application,
            session: self.session,
            ctxt: self.ctxt,
            clock: self.clock,
            max_batch_size: self.max_batch_size,
            max_queue_len: self.max_queue_len,
            idle_delay: self.idle_delay,
            retry: self.retry,
            flush_timeout: self.flush_timeout,
            track_flushes: self.track_flushes,
            thread_name: self.thread_name,
        }
    }

    /**
    The application name to stamp on events.
    */
    pub fn application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    /**
    The source of the user and session to stamp on events.
    */
    pub fn session_context(
        mut self,
        session: impl SessionContext + Send + Sync + 'static,
    ) -> Self {
        self.session = Box::new(session);
        self
    }

    /**
    The context used to track open events.

    The default is a new [`ThreadLocalCtxt`] for each manager.
    */
    pub fn ctxt(mut self, ctxt: impl Ctxt + Send + Sync + 'static) -> Self {
        self.ctxt = Some(Box::new(ctxt));
        self
    }

    /**
    The clock used to read the start time of events.
    */
    pub fn clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /**
    The maximum number of events handed to the persister in a single call.

    The default is [`DEFAULT_MAX_BATCH_SIZE`].
    */
    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /**
    The maximum number of events waiting for delivery.

    If the queue fills up then the waiting events are discarded. The default is [`DEFAULT_MAX_QUEUE_LEN`].
    */
    pub fn max_queue_len(mut self, max_queue_len: usize) -> Self {
        self.max_queue_len = max_queue_len;
        self
    }

    /**
    The longest time the drain loop sleeps between checks for new events.

    The default is [`DEFAULT_IDLE_DELAY`].
    */
    pub fn idle_delay(mut self, idle_delay: Duration) -> Self {
        self.idle_delay = idle_delay;
        self
    }

    /**
    How failed deliveries are retried.
    */
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /**
    Bound the time [`crate::Tracker::flush`] waits for.

    By default a flush waits until all pending events have been attempted.
    */
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = Some(timeout);
        self
    }

    /**
    Whether to persist a `behavior-tracking` `flush` event after each delivered batch.

    Flush events carry a `count` attribute with the number of events delivered.
    */
    pub fn track_flushes(mut self, track_flushes: bool) -> Self {
        self.track_flushes = track_flushes;
        self
    }

    /**
    The name of the background thread the drain loop runs on.
    */
    pub fn thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }
}

impl<TPersister: Persister + Send + 'static> Setup<TPersister> {
    /**
    Start the drain loop and return a [`Manager`] for it.
    */
    pub fn spawn(self) -> Result<Manager, SetupError> {
        let options = beet_batcher::Options::new()
            .idle_delay(self.idle_delay)
            .max_retries(self.retry.max_retries)
            .retry_delay(self.retry.delay_step, self.retry.max_delay);

        let (sender, receiver) =
            beet_batcher::bounded_with::<Vec<Event>>(self.max_queue_len, options);

        let counters = Arc::new(Counters::default());

        let worker = Worker {
            persister: self.persister,
            max_batch_size: self.max_batch_size,
            track_flushes: self.track_flushes,
            application: self.application.clone(),
            clock: self.clock.clone(),
            counters: counters.clone(),
        };

        spawn_worker(self.thread_name, receiver, worker)?;

        Ok(Manager::new(Inner {
            application: self.application,
            session: self.session,
            ctxt: self
                .ctxt
                .unwrap_or_else(|| Box::new(ThreadLocalCtxt::new())),
            clock: self.clock,
            sender,
            suspended: AtomicBool::new(false),
            flush_timeout: self.flush_timeout,
            counters,
        }))
    }
}

#[cfg(not(feature = "tokio"))]
fn spawn_worker<P: Persister + Send + 'static>(
    thread_name: String,
    receiver: beet_batcher::Receiver<Vec<Event>>,
    worker: Worker<P>,
) -> Result<(), SetupError> {
    beet_batcher::sync::spawn(thread_name, receiver, move |batch| worker.on_batch(batch))
        .map_err(SetupError::new)?;

    Ok(())
}

#[cfg(feature = "tokio")]
fn spawn_worker<P: Persister + Send + 'static>(
    thread_name: String,
    receiver: beet_batcher::Receiver<Vec<Event>>,
    worker: Worker<P>,
) -> Result<(), SetupError> {
    beet_batcher::tokio::spawn(thread_name, receiver, move |batch| {
        std::future::ready(worker.on_batch(batch))
    })
    .map_err(SetupError::new)?;

    Ok(())
}
