/*!
Rolling aggregate statistics over finished events.

A [`Statistics`] accumulator keeps a count, min, max, and running mean and variance of event durations using Welford's single-pass method. Accumulators are grouped by event kind and name in a [`StatisticsRegistry`], which is itself a [`Persister`] so it can be wired into a pipeline alongside a durable sink:

```
use beet::{persister::{self, Persister}, stats::StatisticsRegistry};

let stats = StatisticsRegistry::new();

let persister = persister::Null.and_to(stats.clone());
# let _ = persister;
```
*/

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::{error::DeliveryError, event::Event, persister::Persister, timestamp::Timestamp};

/**
The unit durations are converted to when reading statistics.

The unit never affects the stored values.
*/
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeUnit {
    /** Nanoseconds. */
    Nanoseconds,
    /** Microseconds. */
    Microseconds,
    /** Milliseconds. */
    #[default]
    Milliseconds,
    /** Seconds. */
    Seconds,
}

impl TimeUnit {
    fn from_nanos(&self, nanos: f64) -> f64 {
        match self {
            TimeUnit::Nanoseconds => nanos,
            TimeUnit::Microseconds => nanos / 1_000.0,
            TimeUnit::Milliseconds => nanos / 1_000_000.0,
            TimeUnit::Seconds => nanos / 1_000_000_000.0,
        }
    }

    /**
    Convert a duration into this unit.
    */
    pub fn convert(&self, duration: Duration) -> f64 {
        self.from_nanos(duration.as_nanos() as f64)
    }
}

/**
A thread-safe accumulator for event durations.
*/
#[derive(Default)]
pub struct Statistics {
    state: Mutex<Snapshot>,
}

/**
The state of a [`Statistics`] accumulator at a point in time.
*/
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Snapshot {
    count: u64,
    error_count: u64,
    mean: f64,
    sum_squared_deviation: f64,
    min: Option<Duration>,
    max: Option<Duration>,
    last_invocation: Option<Timestamp>,
}

impl Statistics {
    /**
    Create a new, empty accumulator.
    */
    pub fn new() -> Self {
        Statistics::default()
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /**
    Add a sample.
    */
    pub fn add(&self, duration: Duration) {
        self.lock().add(duration);
    }

    /**
    Add a finished event.

    The event's duration is added as a sample, its error is counted, and its start time moves the last invocation forward if it's later. Events that were never stopped are ignored.
    */
    pub fn add_event(&self, evt: &Event) {
        let Some(duration) = evt.duration() else {
            return;
        };

        let mut state = self.lock();

        state.add(duration);

        if evt.is_error() {
            state.error_count += 1;
        }

        if let Some(start) = evt.start() {
            state.last_invocation = Some(match state.last_invocation {
                Some(last) if last > start => last,
                _ => start,
            });
        }
    }

    /**
    Clear all state.
    */
    pub fn reset(&self) {
        *self.lock() = Snapshot::default();
    }

    /**
    Take a consistent copy of the current state.
    */
    pub fn snapshot(&self) -> Snapshot {
        *self.lock()
    }
}

impl fmt::Debug for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.snapshot(), f)
    }
}

impl Snapshot {
    fn add(&mut self, duration: Duration) {
        let x = duration.as_nanos() as f64;

        self.count += 1;

        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.sum_squared_deviation += delta * (x - self.mean);

        self.min = Some(self.min.map_or(duration, |min| min.min(duration)));
        self.max = Some(self.max.map_or(duration, |max| max.max(duration)));
    }

    /**
    The number of samples.
    */
    pub fn count(&self) -> u64 {
        self.count
    }

    /**
    The number of samples that came from events carrying an error.
    */
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /**
    The smallest sample, or `None` if there are no samples.
    */
    pub fn min(&self) -> Option<Duration> {
        self.min
    }

    /**
    The largest sample, or `None` if there are no samples.
    */
    pub fn max(&self) -> Option<Duration> {
        self.max
    }

    /**
    The latest start time of any event added.
    */
    pub fn last_invocation(&self) -> Option<Timestamp> {
        self.last_invocation
    }

    /**
    The mean of the samples in the given unit, or `None` if there are no samples.
    */
    pub fn mean_in(&self, unit: TimeUnit) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(unit.from_nanos(self.mean))
        }
    }

    /**
    The population standard deviation of the samples in the given unit, or `None` if there are no samples.
    */
    pub fn stddev_in(&self, unit: TimeUnit) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(unit.from_nanos((self.sum_squared_deviation / self.count as f64).sqrt()))
        }
    }

    /**
    The smallest sample in the given unit.
    */
    pub fn min_in(&self, unit: TimeUnit) -> Option<f64> {
        self.min.map(|min| unit.convert(min))
    }

    /**
    The largest sample in the given unit.
    */
    pub fn max_in(&self, unit: TimeUnit) -> Option<f64> {
        self.max.map(|max| unit.convert(max))
    }
}

/**
The class of events a [`Statistics`] accumulator covers.
*/
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatsKey {
    /** The kind of event, like `jdbc`. */
    pub kind: String,
    /** The name of the event. */
    pub name: String,
}

impl StatsKey {
    /**
    Create a key for events of the given kind and name.
    */
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        StatsKey {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for StatsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/**
A set of [`Statistics`] accumulators, one for each kind and name of event.

Cloning a registry produces a new handle to the same accumulators.
*/
#[derive(Clone, Default)]
pub struct StatisticsRegistry {
    accumulators: Arc<Mutex<HashMap<StatsKey, Arc<Statistics>>>>,
}

impl StatisticsRegistry {
    /**
    Create a new, empty registry.
    */
    pub fn new() -> Self {
        StatisticsRegistry::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StatsKey, Arc<Statistics>>> {
        self.accumulators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /**
    Get the accumulator for events of the given kind and name, if any have been added.
    */
    pub fn get(&self, kind: &str, name: &str) -> Option<Arc<Statistics>> {
        self.lock().get(&StatsKey::new(kind, name)).cloned()
    }

    /**
    Get the accumulator for events of the given kind and name, creating it if needed.
    */
    pub fn get_or_insert(&self, kind: &str, name: &str) -> Arc<Statistics> {
        self.lock()
            .entry(StatsKey::new(kind, name))
            .or_default()
            .clone()
    }

    /**
    Add a finished event to the accumulator for its kind and name.
    */
    pub fn add_event(&self, evt: &Event) {
        // The accumulator is updated outside the registry lock
        self.get_or_insert(evt.kind(), evt.name()).add_event(evt);
    }

    /**
    Take a snapshot of every accumulator, ordered by key.
    */
    pub fn snapshot_all(&self) -> Vec<(StatsKey, Snapshot)> {
        let accumulators: Vec<_> = self
            .lock()
            .iter()
            .map(|(key, stats)| (key.clone(), stats.clone()))
            .collect();

        let mut snapshots: Vec<_> = accumulators
            .into_iter()
            .map(|(key, stats)| (key, stats.snapshot()))
            .collect();

        snapshots.sort_by(|a, b| a.0.cmp(&b.0));
        snapshots
    }

    /**
    Reset every accumulator.
    */
    pub fn reset_all(&self) {
        for stats in self.lock().values() {
            stats.reset();
        }
    }

    /**
    The number of accumulators in the registry.
    */
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /**
    Whether the registry has no accumulators.
    */
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl fmt::Debug for StatisticsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.snapshot_all()).finish()
    }
}

impl Persister for StatisticsRegistry {
    fn persist(&self, batch: &[Event]) -> Result<usize, DeliveryError> {
        for evt in batch {
            self.add_event(evt);
        }

        Ok(batch.len())
    }
}
