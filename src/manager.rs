/*!
The [`Tracker`] and [`Manager`] types.

A tracker owns the lifecycle of events: it creates them with a parent taken from the current context, starts their timers, and stops them. The [`Manager`] is the tracker that delivers stopped events through a background drain loop to a [`crate::Persister`].

Stopping an event never blocks on I/O; it only takes a short lock to push onto the manager's queue. Call [`Tracker::flush`] when you need to know everything stopped so far has reached the persister.
*/

use std::{
    cmp,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use beet_batcher::BatchError;

use crate::{
    clock::{Clock, SystemClock},
    ctxt::Ctxt,
    error::{CorrelationError, StopError, UsageError},
    event::Event,
    persister::Persister,
    session::SessionContext,
    timestamp::Timestamp,
};

/**
The lifecycle operations for events.
*/
pub trait Tracker {
    /**
    Create a new event.

    The event's parent is the event currently open in this tracker's context, if any. No I/O is performed.
    */
    fn create_event(&self, kind: &str, name: &str) -> Event;

    /**
    Start an event's timer and make it the current event in this tracker's context.

    An event can only be started once, and only from the same position in the context it was created in.
    */
    fn start(&self, evt: &mut Event) -> Result<(), UsageError>;

    /**
    Stop an event's timer and hand it off for persistence.

    The event must be the current event in this tracker's context. If it isn't then it's returned in the error and the context is left unchanged.
    */
    fn stop(&self, evt: Event) -> Result<(), StopError>;

    /**
    Block until every event stopped before this call has been handed to the persister.
    */
    fn flush(&self);

    /**
    Block until every event stopped before this call has been handed to the persister, or until `timeout` elapses.

    Returns `true` if the flush completed within the timeout.
    */
    fn blocking_flush(&self, timeout: Duration) -> bool;
}

impl<'a, T: Tracker + ?Sized> Tracker for &'a T {
    fn create_event(&self, kind: &str, name: &str) -> Event {
        (**self).create_event(kind, name)
    }

    fn start(&self, evt: &mut Event) -> Result<(), UsageError> {
        (**self).start(evt)
    }

    fn stop(&self, evt: Event) -> Result<(), StopError> {
        (**self).stop(evt)
    }

    fn flush(&self) {
        (**self).flush()
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        (**self).blocking_flush(timeout)
    }
}

impl<'a, T: Tracker + ?Sized + 'a> Tracker for Box<T> {
    fn create_event(&self, kind: &str, name: &str) -> Event {
        (**self).create_event(kind, name)
    }

    fn start(&self, evt: &mut Event) -> Result<(), UsageError> {
        (**self).start(evt)
    }

    fn stop(&self, evt: Event) -> Result<(), StopError> {
        (**self).stop(evt)
    }

    fn flush(&self) {
        (**self).flush()
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        (**self).blocking_flush(timeout)
    }
}

impl<'a, T: Tracker + ?Sized + 'a> Tracker for Arc<T> {
    fn create_event(&self, kind: &str, name: &str) -> Event {
        (**self).create_event(kind, name)
    }

    fn start(&self, evt: &mut Event) -> Result<(), UsageError> {
        (**self).start(evt)
    }

    fn stop(&self, evt: Event) -> Result<(), StopError> {
        (**self).stop(evt)
    }

    fn flush(&self) {
        (**self).flush()
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        (**self).blocking_flush(timeout)
    }
}

/**
A [`Tracker`] that times events but never delivers them.
*/
#[derive(Default, Debug, Clone, Copy)]
pub struct Disabled;

impl Tracker for Disabled {
    fn create_event(&self, kind: &str, name: &str) -> Event {
        Event::new(kind, name)
    }

    fn start(&self, evt: &mut Event) -> Result<(), UsageError> {
        if evt.is_copy() {
            return Err(UsageError::Copied(evt.id()));
        }

        if evt.is_started() {
            return Err(UsageError::AlreadyStarted(evt.id()));
        }

        evt.arm(SystemClock::new().now(), Instant::now());

        Ok(())
    }

    fn stop(&self, evt: Event) -> Result<(), StopError> {
        if evt.is_copy() {
            let id = evt.id();
            return Err(StopError::new(UsageError::Copied(id), evt));
        }

        if !evt.is_started() {
            let id = evt.id();
            return Err(StopError::new(UsageError::NotStarted(id), evt));
        }

        Ok(())
    }

    fn flush(&self) {}

    fn blocking_flush(&self, _: Duration) -> bool {
        true
    }
}

/**
A [`Tracker`] that delivers events to a persister in the background.

Managers are created with [`crate::setup()`]. Cloning a manager produces a new handle to the same pipeline. When the last handle is dropped the queue is closed, and the drain loop delivers any remaining events before exiting.
*/
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) application: Option<String>,
    pub(crate) session: Box<dyn SessionContext + Send + Sync>,
    pub(crate) ctxt: Box<dyn Ctxt + Send + Sync>,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) sender: beet_batcher::Sender<Vec<Event>>,
    pub(crate) suspended: AtomicBool,
    pub(crate) flush_timeout: Option<Duration>,
    pub(crate) counters: Arc<Counters>,
}

/**
Counters shared between a manager and its drain loop.
*/
#[derive(Default)]
pub(crate) struct Counters {
    events_persisted: AtomicUsize,
    events_discarded: AtomicUsize,
}

/**
A point-in-time view of a [`Manager`]'s pipeline.
*/
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PipelineMetrics {
    /**
    The number of events waiting to be delivered.
    */
    pub queue_length: usize,
    /**
    The number of times queued events were dropped because the queue was full.
    */
    pub queue_overflow: usize,
    /**
    The number of batches delivered successfully.
    */
    pub batches_processed: usize,
    /**
    The number of failed delivery attempts.
    */
    pub batches_failed: usize,
    /**
    The number of delivery attempts that were retries.
    */
    pub batches_retried: usize,
    /**
    The number of batches dropped because the persister panicked.
    */
    pub batches_panicked: usize,
    /**
    The number of events the persister accepted.
    */
    pub events_persisted: usize,
    /**
    The number of events stopped while tracking was suspended.
    */
    pub events_discarded: usize,
}

impl Manager {
    pub(crate) fn new(inner: Inner) -> Self {
        Manager {
            inner: Arc::new(inner),
        }
    }

    /**
    Stop delivering events.

    Events can still be created, started, and stopped while suspended, but stopped events are discarded instead of being queued.
    */
    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::Relaxed);
    }

    /**
    Resume delivering events after a call to [`Manager::suspend`].
    */
    pub fn resume(&self) {
        self.inner.suspended.store(false, Ordering::Relaxed);
    }

    /**
    Whether delivery is currently suspended.
    */
    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::Relaxed)
    }

    /**
    The number of stopped events waiting to be handed to the persister.
    */
    pub fn events_pending_flush(&self) -> usize {
        self.inner.sender.remaining()
    }

    /**
    The application name stamped on events.
    */
    pub fn application(&self) -> Option<&str> {
        self.inner.application.as_deref()
    }

    /**
    The number of events currently open on this thread.
    */
    pub fn depth(&self) -> usize {
        self.inner.ctxt.depth()
    }

    /**
    Take a snapshot of the pipeline's health counters.
    */
    pub fn metrics(&self) -> PipelineMetrics {
        let channel = self.inner.sender.metrics();

        PipelineMetrics {
            queue_length: channel.queue_length,
            queue_overflow: channel.queue_overflow,
            batches_processed: channel.queue_batch_processed,
            batches_failed: channel.queue_batch_failed,
            batches_retried: channel.queue_batch_retry,
            batches_panicked: channel.queue_batch_panicked,
            events_persisted: self.inner.counters.events_persisted.load(Ordering::Relaxed),
            events_discarded: self.inner.counters.events_discarded.load(Ordering::Relaxed),
        }
    }

    /**
    Flush pending events and close the queue.

    Events stopped after shutting down are discarded. Returns `true` if the flush completed within the timeout.
    */
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let flushed = self.blocking_flush(timeout);
        self.inner.sender.close();

        flushed
    }
}

impl Tracker for Manager {
    fn create_event(&self, kind: &str, name: &str) -> Event {
        let mut evt = Event::with_parent(kind, name, self.inner.ctxt.current());

        let session = self.inner.session.resolve();
        evt.set_context(
            self.inner.application.clone(),
            session.user_id,
            session.session_id,
        );

        evt
    }

    fn start(&self, evt: &mut Event) -> Result<(), UsageError> {
        if evt.is_copy() {
            return Err(UsageError::Copied(evt.id()));
        }

        if evt.is_started() {
            return Err(UsageError::AlreadyStarted(evt.id()));
        }

        let current = self.inner.ctxt.current().map(|current| current.id());
        if current != evt.parent_id() {
            return Err(CorrelationError::new(evt.id(), current).into());
        }

        evt.arm(self.inner.clock.now(), Instant::now());
        self.inner.ctxt.push(evt.to_ref());

        Ok(())
    }

    fn stop(&self, mut evt: Event) -> Result<(), StopError> {
        let now = Instant::now();

        if evt.is_copy() {
            let id = evt.id();
            return Err(StopError::new(UsageError::Copied(id), evt));
        }

        if !evt.is_started() {
            let id = evt.id();
            return Err(StopError::new(UsageError::NotStarted(id), evt));
        }

        if let Err(err) = self.inner.ctxt.pop(evt.id()) {
            return Err(StopError::new(err, evt));
        }

        evt.complete(now);

        if self.is_suspended() {
            self.inner
                .counters
                .events_discarded
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.sender.send(evt);
        }

        Ok(())
    }

    fn flush(&self) {
        match self.inner.flush_timeout {
            Some(timeout) => {
                let _ = self.blocking_flush(timeout);
            }
            None => flush(&self.inner.sender),
        }
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        blocking_flush(&self.inner.sender, timeout)
    }
}

#[cfg(not(feature = "tokio"))]
fn flush(sender: &beet_batcher::Sender<Vec<Event>>) {
    beet_batcher::sync::flush(sender)
}

#[cfg(feature = "tokio")]
fn flush(sender: &beet_batcher::Sender<Vec<Event>>) {
    let _ = beet_batcher::tokio::blocking_flush(sender, Duration::MAX);
}

#[cfg(not(feature = "tokio"))]
fn blocking_flush(sender: &beet_batcher::Sender<Vec<Event>>, timeout: Duration) -> bool {
    beet_batcher::sync::blocking_flush(sender, timeout)
}

#[cfg(feature = "tokio")]
fn blocking_flush(sender: &beet_batcher::Sender<Vec<Event>>, timeout: Duration) -> bool {
    beet_batcher::tokio::blocking_flush(sender, timeout)
}

/**
The drain loop's side of a manager.
*/
pub(crate) struct Worker<P> {
    pub(crate) persister: P,
    pub(crate) max_batch_size: usize,
    pub(crate) track_flushes: bool,
    pub(crate) application: Option<String>,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) counters: Arc<Counters>,
}

impl<P: Persister> Worker<P> {
    /**
    Deliver a batch in chunks of at most `max_batch_size` events.

    Every chunk is attempted, even after an earlier one fails. Only the chunks that failed are returned for retrying.
    */
    pub(crate) fn on_batch(&self, batch: Vec<Event>) -> Result<(), BatchError<Vec<Event>>> {
        let started_at = Instant::now();
        let start = self.clock.now();

        let max_batch_size = cmp::max(1, self.max_batch_size);

        let mut delivered = 0;
        let mut failed = Vec::new();
        let mut last_err = None;

        let mut events = batch.into_iter();
        loop {
            let chunk: Vec<Event> = events.by_ref().take(max_batch_size).collect();
            if chunk.is_empty() {
                break;
            }

            match self.persister.persist(&chunk) {
                Ok(persisted) => {
                    self.counters
                        .events_persisted
                        .fetch_add(persisted, Ordering::Relaxed);

                    delivered += chunk.len();
                }
                Err(err) => {
                    emit::warn!(
                        rt: emit::runtime::internal(),
                        "failed to persist {count} events: {err}",
                        count: chunk.len(),
                        err,
                    );

                    failed.extend(chunk);
                    last_err = Some(err);
                }
            }
        }

        self.track_flush(start, started_at, delivered);

        match last_err {
            Some(err) => Err(BatchError::retry(err, failed)),
            None => Ok(()),
        }
    }

    fn track_flush(&self, start: Option<Timestamp>, started_at: Instant, count: usize) {
        if !self.track_flushes || count == 0 {
            return;
        }

        let mut evt = Event::new("behavior-tracking", "flush");
        evt.set_context(self.application.clone(), None, None);
        evt.arm(start, started_at);
        evt.data_mut().add("count", count);
        evt.complete(Instant::now());

        if let Err(err) = self.persister.persist(&[evt]) {
            emit::warn!(
                rt: emit::runtime::internal(),
                "failed to persist flush event: {err}",
                err,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        sync::Mutex,
        thread,
    };

    use crate::{
        error::DeliveryError,
        persister::from_fn,
        session::{self, Session},
        setup::{setup, RetryPolicy},
    };

    fn collect() -> (
        Arc<Mutex<Vec<Event>>>,
        impl Persister + Send + Sync + 'static,
    ) {
        let events = Arc::new(Mutex::new(Vec::new()));

        let persister = from_fn({
            let events = events.clone();

            move |batch: &[Event]| {
                events.lock().unwrap().extend(batch.iter().cloned());

                Ok(batch.len())
            }
        });

        (events, persister)
    }

    #[test]
    fn nested_events() {
        let (events, persister) = collect();
        let manager = setup().persist_to(persister).spawn().unwrap();

        let mut a = manager.create_event("test", "a");
        manager.start(&mut a).unwrap();

        let mut b = manager.create_event("test", "b");
        assert_eq!(Some(a.id()), b.parent_id());

        manager.start(&mut b).unwrap();
        assert_eq!(2, manager.depth());

        let (a_id, b_id) = (a.id(), b.id());

        manager.stop(b).unwrap();
        manager.stop(a).unwrap();

        manager.flush();

        let events = events.lock().unwrap();
        assert_eq!(2, events.len());

        assert_eq!(b_id, events[0].id());
        assert_eq!(Some(a_id), events[0].parent_id());
        assert_eq!(a_id, events[1].id());
        assert_eq!(None, events[1].parent_id());
    }

    #[test]
    fn durations_cover_elapsed_time() {
        let (events, persister) = collect();
        let manager = setup().persist_to(persister).spawn().unwrap();

        let mut evt = manager.create_event("test", "sleep");

        let before = Instant::now();
        manager.start(&mut evt).unwrap();
        thread::sleep(Duration::from_millis(20));
        manager.stop(evt).unwrap();
        let elapsed = before.elapsed();

        manager.flush();

        let events = events.lock().unwrap();
        let duration = events[0].duration().unwrap();

        assert!(duration >= Duration::from_millis(20));
        assert!(duration <= elapsed);
        assert!(events[0].start().is_some());
    }

    #[test]
    fn stop_out_of_order_is_rejected() {
        let manager = setup().spawn().unwrap();

        let mut a = manager.create_event("test", "a");
        manager.start(&mut a).unwrap();

        let mut b = manager.create_event("test", "b");
        manager.start(&mut b).unwrap();

        let err = manager.stop(a).unwrap_err();

        assert!(matches!(err.error(), UsageError::Correlation(_)));
        assert_eq!(2, manager.depth());

        // The stack is unchanged, so stopping in the right order still works
        let a = err.into_event();
        manager.stop(b).unwrap();
        manager.stop(a).unwrap();

        assert_eq!(0, manager.depth());
    }

    #[test]
    fn start_twice_is_rejected() {
        let manager = setup().spawn().unwrap();

        let mut evt = manager.create_event("test", "a");
        manager.start(&mut evt).unwrap();

        assert_eq!(
            UsageError::AlreadyStarted(evt.id()),
            manager.start(&mut evt).unwrap_err()
        );

        manager.stop(evt).unwrap();
    }

    #[test]
    fn clones_cannot_be_stopped() {
        let (events, persister) = collect();
        let manager = setup().persist_to(persister).spawn().unwrap();

        let mut evt = manager.create_event("test", "a");
        manager.start(&mut evt).unwrap();

        let mut copy = evt.clone();
        assert_eq!(UsageError::Copied(evt.id()), manager.start(&mut copy).unwrap_err());

        let err = manager.stop(copy).unwrap_err();
        assert_eq!(&UsageError::Copied(evt.id()), err.error());
        assert_eq!(1, manager.depth());

        manager.stop(evt).unwrap();
        manager.flush();

        assert_eq!(1, events.lock().unwrap().len());
    }

    #[test]
    fn stop_without_start_is_rejected() {
        let (events, persister) = collect();
        let manager = setup().persist_to(persister).spawn().unwrap();

        let evt = manager.create_event("test", "a");
        let id = evt.id();

        let err = manager.stop(evt).unwrap_err();
        assert_eq!(&UsageError::NotStarted(id), err.error());

        manager.flush();
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn start_from_a_different_position_is_rejected() {
        let manager = setup().spawn().unwrap();

        let mut orphan = manager.create_event("test", "orphan");

        let mut parent = manager.create_event("test", "parent");
        manager.start(&mut parent).unwrap();

        assert!(matches!(
            manager.start(&mut orphan),
            Err(UsageError::Correlation(_))
        ));

        manager.stop(parent).unwrap();
        manager.start(&mut orphan).unwrap();
        manager.stop(orphan).unwrap();
    }

    #[test]
    fn threads_have_independent_stacks() {
        let (events, persister) = collect();
        let manager = setup().persist_to(persister).spawn().unwrap();

        let mut outer = manager.create_event("test", "outer");
        manager.start(&mut outer).unwrap();

        thread::spawn({
            let manager = manager.clone();

            move || {
                let mut evt = manager.create_event("test", "other-thread");
                assert!(evt.parent().is_none());

                manager.start(&mut evt).unwrap();
                manager.stop(evt).unwrap();
            }
        })
        .join()
        .unwrap();

        manager.stop(outer).unwrap();
        manager.flush();

        assert_eq!(2, events.lock().unwrap().len());
    }

    #[test]
    fn context_is_stamped() {
        let (events, persister) = collect();
        let manager = setup()
            .application("orders")
            .session_context(session::from_fn(|| Session {
                user_id: Some("alice".into()),
                session_id: Some("s-1".into()),
            }))
            .persist_to(persister)
            .spawn()
            .unwrap();

        let mut evt = manager.create_event("test", "a");
        manager.start(&mut evt).unwrap();
        manager.stop(evt).unwrap();

        manager.flush();

        let events = events.lock().unwrap();
        assert_eq!(Some("orders"), events[0].application());
        assert_eq!(Some("alice"), events[0].user_id());
        assert_eq!(Some("s-1"), events[0].session_id());
    }

    #[test]
    fn flush_with_nothing_pending() {
        let manager = setup().spawn().unwrap();

        manager.flush();
        assert!(manager.blocking_flush(Duration::from_secs(1)));
        assert_eq!(0, manager.events_pending_flush());
    }

    #[test]
    fn flush_waits_for_every_event() {
        let count = Arc::new(AtomicUsize::new(0));

        let manager = setup()
            .persist_to(from_fn({
                let count = count.clone();

                move |batch: &[Event]| {
                    count.fetch_add(batch.len(), Ordering::SeqCst);
                    Ok(batch.len())
                }
            }))
            .spawn()
            .unwrap();

        for _ in 0..1000 {
            let mut evt = manager.create_event("test", "a");
            manager.start(&mut evt).unwrap();
            manager.stop(evt).unwrap();
        }

        manager.flush();

        assert_eq!(1000, count.load(Ordering::SeqCst));
        assert_eq!(0, manager.events_pending_flush());
        assert_eq!(1000, manager.metrics().events_persisted);
    }

    #[test]
    fn batches_are_chunked() {
        let sizes = Arc::new(Mutex::new(Vec::new()));

        let manager = setup()
            .max_batch_size(10)
            .persist_to(from_fn({
                let sizes = sizes.clone();

                move |batch: &[Event]| {
                    sizes.lock().unwrap().push(batch.len());
                    Ok(batch.len())
                }
            }))
            .spawn()
            .unwrap();

        for _ in 0..95 {
            let mut evt = manager.create_event("test", "a");
            manager.start(&mut evt).unwrap();
            manager.stop(evt).unwrap();
        }

        manager.flush();

        let sizes = sizes.lock().unwrap();
        assert!(sizes.iter().all(|size| *size <= 10));
        assert_eq!(95, sizes.iter().sum::<usize>());
    }

    #[test]
    fn chunks_after_a_failure_are_still_delivered() {
        let sizes = Arc::new(Mutex::new(Vec::new()));

        let manager = setup()
            .max_batch_size(10)
            .persist_to(from_fn({
                let sizes = sizes.clone();

                move |batch: &[Event]| {
                    let mut sizes = sizes.lock().unwrap();
                    sizes.push(batch.len());

                    if sizes.len() == 1 {
                        Err(DeliveryError::msg("unavailable"))
                    } else {
                        Ok(batch.len())
                    }
                }
            }))
            .spawn()
            .unwrap();

        for _ in 0..25 {
            let mut evt = manager.create_event("test", "a");
            manager.start(&mut evt).unwrap();
            manager.stop(evt).unwrap();
        }

        manager.flush();

        let sizes = sizes.lock().unwrap();

        // Every event is attempted once; only the first chunk is dropped
        assert_eq!(25, sizes.iter().sum::<usize>());
        assert_eq!(25 - sizes[0], manager.metrics().events_persisted);
        assert_eq!(1, manager.metrics().batches_failed);
    }

    #[test]
    fn only_failed_chunks_are_retried() {
        let sizes = Arc::new(Mutex::new(Vec::new()));

        let manager = setup()
            .max_batch_size(10)
            .retry(
                RetryPolicy::new()
                    .max_retries(1)
                    .delay(Duration::from_millis(1), Duration::from_millis(5)),
            )
            .persist_to(from_fn({
                let sizes = sizes.clone();

                move |batch: &[Event]| {
                    let mut sizes = sizes.lock().unwrap();
                    sizes.push(batch.len());

                    if sizes.len() == 1 {
                        Err(DeliveryError::msg("unavailable"))
                    } else {
                        Ok(batch.len())
                    }
                }
            }))
            .spawn()
            .unwrap();

        for _ in 0..25 {
            let mut evt = manager.create_event("test", "a");
            manager.start(&mut evt).unwrap();
            manager.stop(evt).unwrap();
        }

        manager.flush();

        let sizes = sizes.lock().unwrap();

        assert_eq!(25 + sizes[0], sizes.iter().sum::<usize>());
        assert_eq!(25, manager.metrics().events_persisted);
        assert_eq!(1, manager.metrics().batches_retried);
    }

    #[test]
    fn failed_batches_are_retried_then_dropped() {
        let attempts = Arc::new(AtomicUsize::new(0));

        let manager = setup()
            .retry(
                RetryPolicy::new()
                    .max_retries(2)
                    .delay(Duration::from_millis(1), Duration::from_millis(5)),
            )
            .persist_to(from_fn({
                let attempts = attempts.clone();

                move |_: &[Event]| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(DeliveryError::msg("unavailable"))
                }
            }))
            .spawn()
            .unwrap();

        let mut evt = manager.create_event("test", "a");
        manager.start(&mut evt).unwrap();
        manager.stop(evt).unwrap();

        // Delivery failures are never surfaced, and flush still returns
        manager.flush();

        assert_eq!(3, attempts.load(Ordering::SeqCst));
        assert_eq!(3, manager.metrics().batches_failed);
        assert_eq!(2, manager.metrics().batches_retried);
    }

    #[test]
    fn chained_failures_are_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (events, secondary) = collect();

        let manager = setup()
            .retry(
                RetryPolicy::new()
                    .max_retries(2)
                    .delay(Duration::from_millis(1), Duration::from_millis(5)),
            )
            .persist_to(from_fn({
                let attempts = attempts.clone();

                move |_: &[Event]| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(DeliveryError::msg("unavailable"))
                }
            }))
            .and_persist_to(secondary)
            .spawn()
            .unwrap();

        let mut evt = manager.create_event("test", "a");
        manager.start(&mut evt).unwrap();
        manager.stop(evt).unwrap();

        manager.flush();

        assert_eq!(3, attempts.load(Ordering::SeqCst));
        assert_eq!(3, manager.metrics().batches_failed);
        assert_eq!(3, events.lock().unwrap().len());
    }

    #[test]
    fn panicking_persisters_are_isolated() {
        let manager = setup()
            .persist_to(from_fn(|_: &[Event]| -> Result<usize, DeliveryError> {
                panic!("explicit panic")
            }))
            .spawn()
            .unwrap();

        let mut evt = manager.create_event("test", "a");
        manager.start(&mut evt).unwrap();
        manager.stop(evt).unwrap();

        manager.flush();

        assert_eq!(1, manager.metrics().batches_panicked);
    }

    #[test]
    fn suspended_events_are_discarded() {
        let (events, persister) = collect();
        let manager = setup().persist_to(persister).spawn().unwrap();

        manager.suspend();
        assert!(manager.is_suspended());

        let mut evt = manager.create_event("test", "suspended");
        manager.start(&mut evt).unwrap();
        manager.stop(evt).unwrap();

        assert_eq!(0, manager.depth());

        manager.resume();

        let mut evt = manager.create_event("test", "resumed");
        manager.start(&mut evt).unwrap();
        manager.stop(evt).unwrap();

        manager.flush();

        let events = events.lock().unwrap();
        assert_eq!(1, events.len());
        assert_eq!("resumed", events[0].name());
        assert_eq!(1, manager.metrics().events_discarded);
    }

    #[test]
    fn flushes_are_tracked() {
        let (events, persister) = collect();
        let manager = setup()
            .track_flushes(true)
            .persist_to(persister)
            .spawn()
            .unwrap();

        for _ in 0..3 {
            let mut evt = manager.create_event("test", "a");
            manager.start(&mut evt).unwrap();
            manager.stop(evt).unwrap();
        }

        manager.flush();

        let events = events.lock().unwrap();
        let flushes: Vec<_> = events
            .iter()
            .filter(|evt| evt.kind() == "behavior-tracking" && evt.name() == "flush")
            .collect();

        assert!(!flushes.is_empty());

        let counted: u64 = flushes
            .iter()
            .filter_map(|evt| evt.data()?.attribute("count")?.to_u64())
            .sum();

        assert_eq!(3, counted);
    }

    #[test]
    fn unbounded_timeouts_are_accepted() {
        let (events, persister) = collect();
        let manager = setup()
            .flush_timeout(Duration::MAX)
            .persist_to(persister)
            .spawn()
            .unwrap();

        let mut evt = manager.create_event("test", "a");
        manager.start(&mut evt).unwrap();
        manager.stop(evt).unwrap();

        manager.flush();
        assert!(manager.blocking_flush(Duration::MAX));
        assert!(manager.shutdown(Duration::MAX));

        assert_eq!(1, events.lock().unwrap().len());
    }

    #[test]
    fn shutdown_closes_the_queue() {
        let (events, persister) = collect();
        let manager = setup().persist_to(persister).spawn().unwrap();

        let mut evt = manager.create_event("test", "before");
        manager.start(&mut evt).unwrap();
        manager.stop(evt).unwrap();

        assert!(manager.shutdown(Duration::from_secs(10)));

        let mut evt = manager.create_event("test", "after");
        manager.start(&mut evt).unwrap();
        manager.stop(evt).unwrap();

        manager.flush();

        let events = events.lock().unwrap();
        assert_eq!(1, events.len());
        assert_eq!("before", events[0].name());
    }

    #[test]
    fn disabled_tracks_nothing() {
        let mut evt = Disabled.create_event("test", "a");

        Disabled.start(&mut evt).unwrap();
        assert!(Disabled.start(&mut evt).is_err());

        Disabled.stop(evt).unwrap();
        assert!(Disabled.stop(Disabled.create_event("test", "b")).is_err());
    }
}
