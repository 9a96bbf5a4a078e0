/*!
Track the behavior of programs as hierarchical events.

`beet` wraps method calls, HTTP requests, and SQL statement executions with instrumentation that produces
structured events carrying timing, identity, and contextual data. Events nest: an event started while
another is open on the same thread becomes its child. Finished events are queued and delivered in batches
to a [`Persister`] by a background drain loop, so instrumented code never waits on I/O.

# Getting started

Configure and spawn a [`Manager`] using [`setup()`]:

```
use beet::{Persister, Tracker};

let stats = beet::stats::StatisticsRegistry::new();

let manager = beet::setup()
    .application("orders")
    .persist_to(beet::persister::Log::new().and_to(stats.clone()))
    .spawn()
    .unwrap();

let mut evt = manager.create_event("method", "Orders.place");
manager.start(&mut evt).unwrap();

evt.data_mut().add("items", 3);

manager.stop(evt).unwrap();
manager.flush();

assert_eq!(1, stats.snapshot_all().len());
```

# Adapters

Instrumentation is usually added through an adapter rather than by starting and stopping events by hand:

- [`sql`] wraps database connections and statements.
- [`method`] wraps closures as method calls.
- [`http`] wraps the handling of HTTP requests.

# Diagnostics

The pipeline reports its own problems, such as failed deliveries, through `emit`'s internal runtime.
Call `emit::setup().init_internal()` to see them.
*/

pub mod clock;
pub mod ctxt;
pub mod data;
pub mod empty;
pub mod error;
pub mod event;
pub mod http;
pub mod manager;
pub mod method;
pub mod persister;
pub mod session;
pub mod setup;
pub mod sql;
pub mod stats;
pub mod timestamp;
pub mod tree;
pub mod value;

mod intercept;

pub use self::{
    clock::Clock,
    ctxt::Ctxt,
    data::DataElement,
    empty::Empty,
    error::{CorrelationError, DeliveryError, SetupError, StopError, UsageError},
    event::{Event, EventError, EventId, EventRef},
    manager::{Disabled, Manager, PipelineMetrics, Tracker},
    persister::Persister,
    session::SessionContext,
    setup::{setup, RetryPolicy, Setup},
    timestamp::Timestamp,
    value::Value,
};
