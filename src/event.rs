/*!
The [`Event`] type.

An event is a single recorded unit of instrumented activity. It's created by a [`crate::Tracker`], started, has data and errors attached while the work it measures runs, then is stopped and handed off to a [`crate::Persister`] in the background.

Events know their parent through an [`EventRef`], a cheap shared handle on another event's identity. Holding an `EventRef` doesn't keep the parent event itself alive, so children and parents can be persisted independently.
*/

use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{data::DataElement, timestamp::Timestamp};

/**
The name of the root data element on every event.
*/
pub const EVENT_DATA: &str = "event-data";

/**
A process-unique, strictly increasing identifier for an [`Event`].
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl EventId {
    fn next() -> Self {
        EventId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /**
    Get the underlying value of the id.
    */
    pub const fn to_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/**
A shared, read-only handle on the identity of an event.

Equality is based on the event id.
*/
#[derive(Clone)]
pub struct EventRef(Arc<EventRefInner>);

struct EventRefInner {
    id: EventId,
    kind: String,
    name: String,
    parent: Option<EventRef>,
}

impl EventRef {
    /**
    The id of the event.
    */
    pub fn id(&self) -> EventId {
        self.0.id
    }

    /**
    The kind of the event, like `jdbc` or `method`.
    */
    pub fn kind(&self) -> &str {
        &self.0.kind
    }

    /**
    The name of the event.
    */
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /**
    The parent of the event, if it has one.
    */
    pub fn parent(&self) -> Option<&EventRef> {
        self.0.parent.as_ref()
    }

    /**
    Iterate over the ancestors of the event, starting from its parent.
    */
    pub fn ancestors(&self) -> impl Iterator<Item = &EventRef> {
        let mut next = self.parent();

        std::iter::from_fn(move || {
            let current = next?;
            next = current.parent();

            Some(current)
        })
    }

    /**
    The number of ancestors of the event. Root events have a depth of `0`.
    */
    pub fn depth(&self) -> usize {
        self.ancestors().count()
    }
}

impl PartialEq for EventRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for EventRef {}

impl fmt::Debug for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRef")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .field("name", &self.0.name)
            .field("parent", &self.0.parent.as_ref().map(|parent| parent.id()))
            .finish()
    }
}

/**
A failure recorded on an [`Event`].
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventError {
    message: String,
    detail: Option<String>,
}

impl EventError {
    /**
    An error with just a message.
    */
    pub fn new(message: impl Into<String>) -> Self {
        EventError {
            message: message.into(),
            detail: None,
        }
    }

    /**
    An error captured from a value implementing [`std::error::Error`].

    The message is formatted as `"<type name>: <display>"`. The detail lists the error's sources, one per line.
    */
    pub fn from_error<E: Error + ?Sized>(err: &E) -> Self {
        let message = format!("{}: {}", std::any::type_name::<E>(), err);

        let mut detail = String::new();
        let mut source = err.source();
        while let Some(cause) = source {
            if !detail.is_empty() {
                detail.push('\n');
            }
            detail.push_str("caused by: ");
            detail.push_str(&cause.to_string());

            source = cause.source();
        }

        EventError {
            message,
            detail: if detail.is_empty() { None } else { Some(detail) },
        }
    }

    /**
    Attach a longer detail payload to the error.
    */
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /**
    The short, human-readable description of the error.
    */
    pub fn message(&self) -> &str {
        &self.message
    }

    /**
    A longer description of the error, if one was captured.
    */
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/**
A recorded unit of instrumented activity.

Clones of an event share its id, but only the original can be started or stopped by a tracker. Clones are
for keeping a copy of a finished event, like in a persister that collects batches.
*/
pub struct Event {
    this: EventRef,
    copy: bool,
    application: Option<String>,
    user_id: Option<String>,
    session_id: Option<String>,
    start: Option<Timestamp>,
    started_at: Option<Instant>,
    duration: Option<Duration>,
    error: Option<EventError>,
    data: Option<DataElement>,
}

impl Event {
    /**
    Create a root event that isn't associated with any tracker.

    Events created this way have no parent, application, or session. Use [`crate::Tracker::create_event`] to create events that participate in correlation.
    */
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Event::with_parent(kind, name, None)
    }

    pub(crate) fn with_parent(
        kind: impl Into<String>,
        name: impl Into<String>,
        parent: Option<EventRef>,
    ) -> Self {
        Event {
            this: EventRef(Arc::new(EventRefInner {
                id: EventId::next(),
                kind: kind.into(),
                name: name.into(),
                parent,
            })),
            copy: false,
            application: None,
            user_id: None,
            session_id: None,
            start: None,
            started_at: None,
            duration: None,
            error: None,
            data: None,
        }
    }

    pub(crate) fn set_context(
        &mut self,
        application: Option<String>,
        user_id: Option<String>,
        session_id: Option<String>,
    ) {
        self.application = application;
        self.user_id = user_id;
        self.session_id = session_id;
    }

    /**
    Record the start of the event.
    */
    pub(crate) fn arm(&mut self, start: Option<Timestamp>, now: Instant) {
        self.start = start;
        self.started_at = Some(now);
    }

    /**
    Record the end of the event.
    */
    pub(crate) fn complete(&mut self, now: Instant) {
        if let (Some(started_at), None) = (self.started_at, self.duration) {
            self.duration = Some(now.saturating_duration_since(started_at));
        }
    }

    /**
    The unique id of the event.
    */
    pub fn id(&self) -> EventId {
        self.this.id()
    }

    /**
    The kind of the event, like `jdbc` or `method`.
    */
    pub fn kind(&self) -> &str {
        self.this.kind()
    }

    /**
    The name of the event, like a method name, URI, or SQL operation.
    */
    pub fn name(&self) -> &str {
        self.this.name()
    }

    /**
    The application the event was recorded in.
    */
    pub fn application(&self) -> Option<&str> {
        self.application.as_deref()
    }

    /**
    The user the event was recorded on behalf of.
    */
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /**
    The session the event was recorded in.
    */
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /**
    The event that was active on the same thread when this one was created.
    */
    pub fn parent(&self) -> Option<&EventRef> {
        self.this.parent()
    }

    /**
    The id of the parent event.
    */
    pub fn parent_id(&self) -> Option<EventId> {
        self.parent().map(|parent| parent.id())
    }

    /**
    Get a shared handle on the identity of this event.
    */
    pub fn to_ref(&self) -> EventRef {
        self.this.clone()
    }

    /**
    The wall-clock time the event was started.

    This is `None` until the event is started, or if the clock was unavailable.
    */
    pub fn start(&self) -> Option<Timestamp> {
        self.start
    }

    /**
    The time elapsed between starting and stopping the event.

    This is `None` until the event is stopped.
    */
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /**
    Whether the event has been started.
    */
    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    /**
    Whether this event is a clone of another.

    Clones can't be started or stopped.
    */
    pub fn is_copy(&self) -> bool {
        self.copy
    }

    /**
    Whether the event has been stopped.
    */
    pub fn is_stopped(&self) -> bool {
        self.duration.is_some()
    }

    /**
    The failure recorded on the event, if any.
    */
    pub fn error(&self) -> Option<&EventError> {
        self.error.as_ref()
    }

    /**
    Whether a failure has been recorded on the event.
    */
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /**
    Record a failure on the event, replacing any previous one.
    */
    pub fn set_error<E: Error + ?Sized>(&mut self, err: &E) -> &mut Self {
        self.error = Some(EventError::from_error(err));
        self
    }

    /**
    Record a failure on the event from a plain message, replacing any previous one.
    */
    pub fn set_error_message(&mut self, message: impl Into<String>) -> &mut Self {
        self.error = Some(EventError::new(message));
        self
    }

    /**
    Record a prepared failure on the event, replacing any previous one.
    */
    pub fn set_event_error(&mut self, err: EventError) -> &mut Self {
        self.error = Some(err);
        self
    }

    /**
    The root data element of the event, if it has one.
    */
    pub fn data(&self) -> Option<&DataElement> {
        self.data.as_ref()
    }

    /**
    Get the root data element of the event, creating it if needed.

    The same element is returned on every call.
    */
    pub fn data_mut(&mut self) -> &mut DataElement {
        self.data.get_or_insert_with(|| DataElement::new(EVENT_DATA))
    }
}

impl Clone for Event {
    fn clone(&self) -> Self {
        Event {
            this: self.this.clone(),
            copy: true,
            application: self.application.clone(),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            start: self.start,
            started_at: self.started_at,
            duration: self.duration,
            error: self.error.clone(),
            data: self.data.clone(),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id())
            .field("parent_id", &self.parent_id())
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("application", &self.application)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("start", &self.start)
            .field("duration", &self.duration)
            .field("error", &self.error)
            .field("data", &self.data)
            .finish()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Opt<'a, T: ?Sized>(Option<&'a T>);

        impl<'a, T: fmt::Display + ?Sized> fmt::Display for Opt<'a, T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    Some(value) => fmt::Display::fmt(value, f),
                    None => Ok(()),
                }
            }
        }

        let duration_ms = self.duration.map(|duration| duration.as_millis());

        write!(
            f,
            "behavior-event: id=\"{}\" parent-id=\"{}\" kind=\"{}\" name=\"{}\" application=\"{}\" start=\"{}\" duration-ms=\"{}\" user-id=\"{}\" session-id=\"{}\" error=\"{}\"",
            self.id(),
            Opt(self.parent_id().as_ref()),
            self.kind(),
            self.name(),
            Opt(self.application()),
            Opt(self.start.as_ref()),
            Opt(duration_ms.as_ref()),
            Opt(self.user_id()),
            Opt(self.session_id()),
            Opt(self.error.as_ref()),
        )
    }
}

#[cfg(feature = "sval")]
impl sval::Value for EventError {
    fn stream<'sval, S: sval::Stream<'sval> + ?Sized>(&'sval self, stream: &mut S) -> sval::Result {
        stream.record_begin(None, None, None, None)?;

        stream.record_value_begin(None, &sval::Label::new("message"))?;
        stream.value_computed(&*self.message)?;
        stream.record_value_end(None, &sval::Label::new("message"))?;

        if let Some(ref detail) = self.detail {
            stream.record_value_begin(None, &sval::Label::new("detail"))?;
            stream.value_computed(&**detail)?;
            stream.record_value_end(None, &sval::Label::new("detail"))?;
        }

        stream.record_end(None, None, None)
    }
}

#[cfg(feature = "sval")]
impl sval::Value for Event {
    fn stream<'sval, S: sval::Stream<'sval> + ?Sized>(&'sval self, stream: &mut S) -> sval::Result {
        fn field<'sval, S: sval::Stream<'sval> + ?Sized, V: sval::Value + ?Sized>(
            stream: &mut S,
            label: &'static str,
            value: &V,
        ) -> sval::Result {
            stream.record_value_begin(None, &sval::Label::new(label))?;
            stream.value_computed(value)?;
            stream.record_value_end(None, &sval::Label::new(label))
        }

        stream.record_begin(None, None, None, None)?;

        field(stream, "id", &self.id().to_u64())?;

        if let Some(parent_id) = self.parent_id() {
            field(stream, "parent_id", &parent_id.to_u64())?;
        }

        field(stream, "kind", self.kind())?;
        field(stream, "name", self.name())?;

        if let Some(application) = self.application() {
            field(stream, "application", application)?;
        }

        if let Some(user_id) = self.user_id() {
            field(stream, "user_id", user_id)?;
        }

        if let Some(session_id) = self.session_id() {
            field(stream, "session_id", session_id)?;
        }

        if let Some(ref start) = self.start {
            field(stream, "start", start)?;
        }

        if let Some(duration) = self.duration {
            field(stream, "duration_ns", &(duration.as_nanos() as u64))?;
        }

        if let Some(ref error) = self.error {
            field(stream, "error", error)?;
        }

        if let Some(ref data) = self.data {
            field(stream, "data", data)?;
        }

        stream.record_end(None, None, None)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for EventError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(None)?;

        map.serialize_entry("message", &self.message)?;

        if let Some(ref detail) = self.detail {
            map.serialize_entry("detail", detail)?;
        }

        map.end()
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Event {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(None)?;

        map.serialize_entry("id", &self.id().to_u64())?;

        if let Some(parent_id) = self.parent_id() {
            map.serialize_entry("parent_id", &parent_id.to_u64())?;
        }

        map.serialize_entry("kind", self.kind())?;
        map.serialize_entry("name", self.name())?;

        if let Some(application) = self.application() {
            map.serialize_entry("application", application)?;
        }

        if let Some(user_id) = self.user_id() {
            map.serialize_entry("user_id", user_id)?;
        }

        if let Some(session_id) = self.session_id() {
            map.serialize_entry("session_id", session_id)?;
        }

        if let Some(ref start) = self.start {
            map.serialize_entry("start", start)?;
        }

        if let Some(duration) = self.duration {
            map.serialize_entry("duration_ns", &(duration.as_nanos() as u64))?;
        }

        if let Some(ref error) = self.error {
            map.serialize_entry("error", error)?;
        }

        if let Some(ref data) = self.data {
            map.serialize_entry("data", data)?;
        }

        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;

    #[test]
    fn ids_increase() {
        let a = Event::new("test", "a");
        let b = Event::new("test", "b");

        assert!(b.id() > a.id());
    }

    #[test]
    fn data_mut_returns_the_same_element() {
        let mut evt = Event::new("test", "data");

        evt.data_mut().add("a", 1);
        evt.data_mut().add("b", 2);

        let data = evt.data().unwrap();
        assert_eq!(EVENT_DATA, data.name());
        assert_eq!(2, data.attributes().count());
    }

    #[test]
    fn set_error_last_write_wins() {
        #[derive(Debug)]
        struct Outer(io::Error);

        impl fmt::Display for Outer {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("outer failure")
            }
        }

        impl Error for Outer {
            fn source(&self) -> Option<&(dyn Error + 'static)> {
                Some(&self.0)
            }
        }

        let mut evt = Event::new("test", "error");

        evt.set_error_message("first");
        evt.set_error(&Outer(io::Error::new(io::ErrorKind::Other, "disk full")));

        let err = evt.error().unwrap();
        assert!(err.message().ends_with("Outer: outer failure"));
        assert_eq!(Some("caused by: disk full"), err.detail());
    }

    #[test]
    fn duration_is_only_set_once() {
        let mut evt = Event::new("test", "timing");
        assert!(evt.duration().is_none());

        let start = Instant::now();
        evt.arm(None, start);
        evt.complete(start + Duration::from_millis(5));
        evt.complete(start + Duration::from_millis(50));

        assert_eq!(Some(Duration::from_millis(5)), evt.duration());
    }

    #[test]
    fn ancestors() {
        let root = Event::new("test", "root");
        let child = Event::with_parent("test", "child", Some(root.to_ref()));
        let grandchild = Event::with_parent("test", "grandchild", Some(child.to_ref()));

        let ids: Vec<_> = grandchild.to_ref().ancestors().map(|evt| evt.id()).collect();

        assert_eq!(vec![child.id(), root.id()], ids);
        assert_eq!(2, grandchild.to_ref().depth());
    }

    #[test]
    fn clones_are_copies() {
        let evt = Event::new("test", "a");
        assert!(!evt.is_copy());

        let copy = evt.clone();
        assert!(copy.is_copy());
        assert_eq!(evt.id(), copy.id());
    }

    #[test]
    fn display() {
        let mut evt = Event::new("jdbc", "execute");
        evt.set_error_message("boom");

        let rendered = evt.to_string();

        assert!(rendered.starts_with(&format!("behavior-event: id=\"{}\" parent-id=\"\"", evt.id())));
        assert!(rendered.contains("kind=\"jdbc\" name=\"execute\""));
        assert!(rendered.ends_with("error=\"boom\""));
    }

    #[test]
    fn display_context() {
        let mut evt = Event::new("method", "Orders.place");
        evt.set_context(Some("orders".into()), Some("alice".into()), None);

        let rendered = evt.to_string();

        assert!(rendered.contains("application=\"orders\""));
        assert!(rendered.contains("user-id=\"alice\" session-id=\"\""));
    }

    #[test]
    #[cfg(feature = "serde")]
    fn serde_json() {
        let mut evt = Event::new("jdbc", "execute");
        evt.data_mut().add_element("sql").set_text("select 1");

        let json: serde_json::Value = serde_json::to_value(&evt).unwrap();

        assert_eq!("jdbc", json["kind"]);
        assert_eq!("select 1", json["data"]["children"][0]["text"]);
        assert!(json.get("parent_id").is_none());
    }
}
