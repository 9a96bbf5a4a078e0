/*!
Track calls to methods.

[`MethodAdvice`] runs a closure inside an event of kind `method` named `Type.method`. The event's data
records the arguments of the call as `parameters/param` elements and, when the call succeeds, its return
value as a `result` element:

```
use beet::method::{Arg, MethodAdvice};

# let manager = beet::setup().spawn().unwrap();
let advice = MethodAdvice::new(manager);

let total = advice
    .call("Orders", "total")
    .arg(Arg::value(3))
    .arg(Arg::seq([1.5, 2.5]))
    .invoke_infallible(|| 4.0 * 3.0);

assert_eq!(12.0, total);
```

Only simple values are rendered. Anything else is recorded as an opaque `{object}` so that arbitrary
`Debug` implementations aren't run on every call.
*/

use std::{convert::Infallible, error::Error, fmt};

use crate::{data::DataElement, event::Event, intercept::intercept, manager::Tracker, value::Value};

/**
The default kind of method events.
*/
pub const DEFAULT_KIND: &str = "method";

/**
The text recorded for opaque values.
*/
pub const OPAQUE: &str = "{object}";

/**
The most elements of a sequence argument that are rendered.
*/
pub const MAX_SEQ_LEN: usize = 100;

/**
An argument to a tracked method.
*/
#[derive(Clone)]
pub struct Arg(ArgKind);

#[derive(Clone)]
enum ArgKind {
    Null,
    Value(Value),
    Seq(Vec<Value>, usize),
    Opaque(Option<&'static str>),
}

impl Arg {
    /**
    An argument with no value.
    */
    pub fn null() -> Self {
        Arg(ArgKind::Null)
    }

    /**
    A simple value, like a number or string.
    */
    pub fn value(value: impl Into<Value>) -> Self {
        Arg(ArgKind::Value(value.into()))
    }

    /**
    An optional simple value.
    */
    pub fn option(value: Option<impl Into<Value>>) -> Self {
        value.map(Arg::value).unwrap_or_else(Arg::null)
    }

    /**
    A sequence of simple values.

    Only the first [`MAX_SEQ_LEN`] elements are kept.
    */
    pub fn seq<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        let mut len = 0;
        let mut kept = Vec::new();

        for value in values {
            if len < MAX_SEQ_LEN {
                kept.push(value.into());
            }

            len += 1;
        }

        Arg(ArgKind::Seq(kept, len))
    }

    /**
    A value that shouldn't be rendered.
    */
    pub fn opaque() -> Self {
        Arg(ArgKind::Opaque(None))
    }

    /**
    A value that shouldn't be rendered, recording its type name in a `type` attribute.
    */
    pub fn opaque_of<T: ?Sized>(_: &T) -> Self {
        Arg(ArgKind::Opaque(Some(std::any::type_name::<T>())))
    }

    fn record(&self, element: &mut DataElement) {
        match &self.0 {
            ArgKind::Null => (),
            ArgKind::Value(value) => {
                element.set_text(value.to_string());
            }
            ArgKind::Seq(values, len) => {
                element.set_text(SeqText(values, *len).to_string());
            }
            ArgKind::Opaque(ty) => {
                if let Some(ty) = ty {
                    element.add("type", *ty);
                }

                element.set_text(OPAQUE);
            }
        }
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ArgKind::Null => f.write_str("null"),
            ArgKind::Value(value) => fmt::Display::fmt(value, f),
            ArgKind::Seq(values, len) => fmt::Display::fmt(&SeqText(values, *len), f),
            ArgKind::Opaque(_) => f.write_str(OPAQUE),
        }
    }
}

struct SeqText<'a>(&'a [Value], usize);

impl<'a> fmt::Display for SeqText<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;

        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }

            fmt::Display::fmt(value, f)?;
        }

        let more = self.1 - self.0.len();
        if more > 0 {
            write!(f, ", ... ({more} more)")?;
        }

        f.write_str("]")
    }
}

/**
Tracks calls to methods.
*/
pub struct MethodAdvice<T> {
    tracker: T,
    kind: String,
}

impl<T: Tracker> MethodAdvice<T> {
    /**
    Track method calls with `tracker`.
    */
    pub fn new(tracker: T) -> Self {
        MethodAdvice {
            tracker,
            kind: String::from(DEFAULT_KIND),
        }
    }

    /**
    Use a different kind for events.
    */
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /**
    Begin a call to `method` on `ty`.

    The event is created immediately, so it's a child of whatever event is current.
    */
    pub fn call(&self, ty: &str, method: &str) -> MethodCall<'_, T> {
        let mut evt = self.tracker.create_event(&self.kind, &format!("{ty}.{method}"));
        evt.data_mut().add_element("parameters");

        MethodCall { advice: self, evt }
    }
}

/**
A call to a method that hasn't been invoked yet.
*/
#[must_use = "call `.invoke()` to run the method"]
pub struct MethodCall<'a, T> {
    advice: &'a MethodAdvice<T>,
    evt: Event,
}

impl<'a, T: Tracker> MethodCall<'a, T> {
    /**
    Record the next argument to the call.
    */
    pub fn arg(mut self, arg: Arg) -> Self {
        if let Some(parameters) = self.evt.data_mut().find_mut("parameters") {
            arg.record(parameters.add_element("param"));
        }

        self
    }

    /**
    Record the remaining arguments to the call.
    */
    pub fn args(self, args: impl IntoIterator<Item = Arg>) -> Self {
        args.into_iter().fold(self, |call, arg| call.arg(arg))
    }

    /**
    Run the method.

    The result is recorded using its `Debug` implementation. Errors are recorded and returned unchanged.
    Panics are recorded and resumed.
    */
    pub fn invoke<R: fmt::Debug, E: Error>(self, call: impl FnOnce() -> Result<R, E>) -> Result<R, E> {
        intercept(&self.advice.tracker, self.evt, call, |evt, result| {
            evt.data_mut().add_element("result").set_text(format!("{result:?}"));
        })
    }

    /**
    Run the method, recording its result as an opaque value.
    */
    pub fn invoke_opaque<R, E: Error>(self, call: impl FnOnce() -> Result<R, E>) -> Result<R, E> {
        intercept(&self.advice.tracker, self.evt, call, |evt, _| {
            evt.data_mut().add_element("result").set_text(OPAQUE);
        })
    }

    /**
    Run a method that can't fail.
    */
    pub fn invoke_infallible<R: fmt::Debug>(self, call: impl FnOnce() -> R) -> R {
        match self.invoke(|| Ok::<R, Infallible>(call())) {
            Ok(result) => result,
            Err(never) => match never {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        io,
        panic::{self, AssertUnwindSafe},
        sync::{Arc, Mutex},
    };

    use crate::{persister, setup::setup, Manager};

    fn manager() -> (Manager, Arc<Mutex<Vec<Event>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));

        let manager = setup()
            .persist_to(persister::from_fn({
                let events = events.clone();

                move |batch: &[Event]| {
                    events.lock().unwrap().extend(batch.iter().cloned());

                    Ok(batch.len())
                }
            }))
            .spawn()
            .unwrap();

        (manager, events)
    }

    fn params(evt: &Event) -> Vec<Option<String>> {
        evt.data()
            .and_then(|data| data.find("parameters"))
            .map(|parameters| {
                parameters
                    .find_all("param")
                    .map(|param| param.text().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn result(evt: &Event) -> Option<&str> {
        evt.data()?.find("result")?.text()
    }

    #[test]
    fn calls_are_recorded() {
        let (manager, events) = manager();
        let advice = MethodAdvice::new(manager.clone());

        struct Opaque;

        let total = advice
            .call("Orders", "place")
            .arg(Arg::value("hello"))
            .arg(Arg::null())
            .arg(Arg::opaque_of(&Opaque))
            .arg(Arg::option(Some(3)))
            .invoke::<_, io::Error>(|| Ok(6));

        assert_eq!(6, total.unwrap());

        manager.flush();

        let events = events.lock().unwrap();

        assert_eq!("method", events[0].kind());
        assert_eq!("Orders.place", events[0].name());
        assert_eq!(
            vec![
                Some(String::from("hello")),
                None,
                Some(String::from(OPAQUE)),
                Some(String::from("3")),
            ],
            params(&events[0])
        );
        assert_eq!(Some("6"), result(&events[0]));

        let opaque = &events[0].data().unwrap().find("parameters").unwrap().children()[2];
        assert!(opaque
            .attribute("type")
            .and_then(|ty| ty.to_str().map(|ty| ty.ends_with("Opaque")))
            .unwrap_or(false));
    }

    #[test]
    fn long_sequences_are_truncated() {
        assert_eq!("[1, 2, 3]", format!("{:?}", Arg::seq([1, 2, 3])));

        let rendered = format!("{:?}", Arg::seq(0..150));

        assert!(rendered.starts_with("[0, 1, 2"));
        assert!(rendered.ends_with("98, 99, ... (50 more)]"));
    }

    #[test]
    fn errors_are_recorded_and_returned() {
        let (manager, events) = manager();
        let advice = MethodAdvice::new(manager.clone()).with_kind("service");

        let err = advice
            .call("Orders", "cancel")
            .arg(Arg::value(1))
            .invoke::<(), _>(|| Err(io::Error::new(io::ErrorKind::Other, "already shipped")))
            .unwrap_err();

        assert_eq!("already shipped", err.to_string());

        manager.flush();

        let events = events.lock().unwrap();

        assert_eq!("service", events[0].kind());
        assert!(events[0].is_error());
        assert_eq!(None, result(&events[0]));
    }

    #[test]
    fn panics_are_resumed() {
        let (manager, events) = manager();
        let advice = MethodAdvice::new(manager.clone());

        let payload = panic::catch_unwind(AssertUnwindSafe(|| {
            advice
                .call("Orders", "explode")
                .invoke_infallible(|| -> u32 { panic!("boom") })
        }))
        .unwrap_err();

        assert_eq!(Some(&"boom"), payload.downcast_ref::<&str>());

        manager.flush();

        assert!(events.lock().unwrap()[0].is_error());
    }

    #[test]
    fn nested_calls_are_children() {
        let (manager, events) = manager();
        let advice = MethodAdvice::new(manager.clone());

        advice.call("Outer", "run").invoke_infallible(|| {
            advice
                .call("Inner", "run")
                .invoke_opaque::<_, io::Error>(|| Ok(Mutex::new(())))
                .is_ok()
        });

        manager.flush();

        let events = events.lock().unwrap();

        assert_eq!("Inner.run", events[0].name());
        assert_eq!(Some(OPAQUE), result(&events[0]));
        assert_eq!(Some(events[1].id()), events[0].parent_id());
    }
}
