/*!
Track HTTP requests.

[`RequestAdapter`] is called by whatever server middleware sits in front of request handlers. It's
independent of any particular HTTP library; requests are read through the [`Request`] trait.

Each matching request produces an event of kind `http-request` named by the request path. Its data
carries `uri`, `protocol`, `method`, `remote-address`, and `remote-host` attributes, along with a
`parameters` element holding one `param` per request parameter. Each `param` has a `name` attribute
and one `value` child per value.

When the response is known, its status is recorded in `response-status` and `response-message`
attributes. A status of 400 or above marks the event as failed with `<status>: <message>`. A handler that
returns an error or panics is recorded with a `response-status` of 500.
*/

use std::error::Error;

use regex::Regex;

use crate::{
    event::Event,
    intercept::{self, intercept_with},
    manager::Tracker,
};

/**
The default kind of request events.
*/
pub const DEFAULT_KIND: &str = "http-request";

/**
An incoming HTTP request.
*/
pub trait Request {
    /**
    The path of the request, excluding the scheme, host, and query.
    */
    fn uri(&self) -> &str;

    /**
    The protocol, like `HTTP/1.1`.
    */
    fn protocol(&self) -> Option<&str>;

    /**
    The method, like `GET`.
    */
    fn method(&self) -> &str;

    /**
    The address of the client.
    */
    fn remote_address(&self) -> Option<&str>;

    /**
    The host name of the client.
    */
    fn remote_host(&self) -> Option<&str>;

    /**
    The names of all parameters in the request, in the order they appeared.
    */
    fn parameter_names(&self) -> Vec<&str>;

    /**
    All values for the parameter `name`.

    An empty list means the parameter isn't present.
    */
    fn parameter_values(&self, name: &str) -> Vec<&str>;
}

impl<'a, T: Request + ?Sized> Request for &'a T {
    fn uri(&self) -> &str {
        (**self).uri()
    }

    fn protocol(&self) -> Option<&str> {
        (**self).protocol()
    }

    fn method(&self) -> &str {
        (**self).method()
    }

    fn remote_address(&self) -> Option<&str> {
        (**self).remote_address()
    }

    fn remote_host(&self) -> Option<&str> {
        (**self).remote_host()
    }

    fn parameter_names(&self) -> Vec<&str> {
        (**self).parameter_names()
    }

    fn parameter_values(&self, name: &str) -> Vec<&str> {
        (**self).parameter_values(name)
    }
}

/**
The outcome of handling an HTTP request.
*/
pub trait Response {
    /**
    The status code sent to the client, if one was set.
    */
    fn status(&self) -> Option<u16>;

    /**
    The reason sent along with the status.
    */
    fn status_message(&self) -> Option<&str> {
        None
    }
}

impl<'a, T: Response + ?Sized> Response for &'a T {
    fn status(&self) -> Option<u16> {
        (**self).status()
    }

    fn status_message(&self) -> Option<&str> {
        (**self).status_message()
    }
}

/**
A plain response status.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: u16,
    message: Option<String>,
}

impl Status {
    /**
    A status with no message.
    */
    pub fn new(code: u16) -> Self {
        Status {
            code,
            message: None,
        }
    }

    /**
    Attach a message to the status.
    */
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl Response for Status {
    fn status(&self) -> Option<u16> {
        Some(self.code)
    }

    fn status_message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/**
Tracks HTTP requests.
*/
pub struct RequestAdapter<T> {
    tracker: T,
    kind: String,
    parameters: Option<Vec<String>>,
    uri_patterns: Option<Vec<Regex>>,
}

impl<T: Tracker> RequestAdapter<T> {
    /**
    Track requests with `tracker`.

    All requests are tracked, along with all of their parameters.
    */
    pub fn new(tracker: T) -> Self {
        RequestAdapter {
            tracker,
            kind: String::from(DEFAULT_KIND),
            parameters: None,
            uri_patterns: None,
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
    Only record the named parameters.
    */
    pub fn with_parameters<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.parameters = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /**
    Only track requests whose path matches one of the given regular expressions.

    Patterns must match the whole path.
    */
    pub fn with_uri_patterns<S: AsRef<str>>(
        mut self,
        patterns: impl IntoIterator<Item = S>,
    ) -> Result<Self, regex::Error> {
        let patterns = patterns
            .into_iter()
            .map(|pattern| Regex::new(&format!("^(?:{})$", pattern.as_ref())))
            .collect::<Result<Vec<_>, _>>()?;

        self.uri_patterns = Some(patterns);
        Ok(self)
    }

    /**
    Whether a request would be tracked.
    */
    pub fn matches(&self, req: impl Request) -> bool {
        match &self.uri_patterns {
            Some(patterns) => patterns.iter().any(|pattern| pattern.is_match(req.uri())),
            None => true,
        }
    }

    /**
    Create and start an event for a request.

    Returns `None` if the request doesn't match.

    # Panics

    Panics if the event can't be started from the current position in the tracker's context.
    */
    pub fn start(&self, req: impl Request) -> Option<Event> {
        if !self.matches(&req) {
            return None;
        }

        let mut evt = self.event(&req);

        if let Err(err) = self.tracker.start(&mut evt) {
            panic!("failed to start request event {}: {err}", req.uri());
        }

        Some(evt)
    }

    /**
    Stop an event returned by [`RequestAdapter::start`].

    # Panics

    Panics if the event isn't the current one in the tracker's context.
    */
    pub fn stop(&self, evt: Option<Event>) {
        if let Some(evt) = evt {
            intercept::stop(&self.tracker, evt);
        }
    }

    /**
    Stop an event returned by [`RequestAdapter::start`], recording the response sent for it.

    # Panics

    Panics if the event isn't the current one in the tracker's context.
    */
    pub fn stop_with_response(&self, evt: Option<Event>, res: impl Response) {
        if let Some(mut evt) = evt {
            record_response(&mut evt, res);

            intercept::stop(&self.tracker, evt);
        }
    }

    /**
    Handle a request inside an event.

    Errors from the handler are recorded and returned unchanged. Panics are recorded and resumed.
    */
    pub fn handle<R, E: Error>(
        &self,
        req: impl Request,
        handler: impl FnOnce() -> Result<R, E>,
    ) -> Result<R, E> {
        if !self.matches(&req) {
            return handler();
        }

        let evt = self.event(&req);

        intercept_with(&self.tracker, evt, handler, |_, _| {}, record_server_error)
    }

    /**
    Handle a request inside an event, recording the status of the response it produces.
    */
    pub fn handle_response<R: Response, E: Error>(
        &self,
        req: impl Request,
        handler: impl FnOnce() -> Result<R, E>,
    ) -> Result<R, E> {
        if !self.matches(&req) {
            return handler();
        }

        let evt = self.event(&req);

        intercept_with(
            &self.tracker,
            evt,
            handler,
            |evt, res| record_response(evt, res),
            record_server_error,
        )
    }

    fn event(&self, req: &impl Request) -> Event {
        let uri = req.uri();

        let mut evt = self.tracker.create_event(&self.kind, uri);

        let data = evt.data_mut();

        data.add("uri", uri);
        if let Some(protocol) = req.protocol() {
            data.add("protocol", protocol);
        }
        data.add("method", req.method());
        if let Some(remote_address) = req.remote_address() {
            data.add("remote-address", remote_address);
        }
        if let Some(remote_host) = req.remote_host() {
            data.add("remote-host", remote_host);
        }

        let parameters = data.add_element("parameters");

        let mut add = |name: &str, values: Vec<&str>| {
            if values.is_empty() {
                return;
            }

            let param = parameters.add_element("param");
            param.add("name", name);

            for value in values {
                param.add_element("value").set_text(value);
            }
        };

        match &self.parameters {
            Some(names) => {
                for name in names {
                    add(name.as_str(), req.parameter_values(name));
                }
            }
            None => {
                for name in req.parameter_names() {
                    add(name, req.parameter_values(name));
                }
            }
        }

        evt
    }
}

fn record_response(evt: &mut Event, res: impl Response) {
    let Some(status) = res.status() else {
        return;
    };

    let message = res.status_message();

    let data = evt.data_mut();
    data.add("response-status", status);
    if let Some(message) = message {
        data.add("response-message", message);
    }

    if status >= 400 {
        let error = match message {
            Some(message) => format!("{status}: {message}"),
            None => status.to_string(),
        };

        evt.set_error_message(error);
    }
}

fn record_server_error(evt: &mut Event) {
    evt.data_mut().add("response-status", 500u16);
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use crate::{persister, setup::setup, Manager};

    struct Req {
        uri: &'static str,
        params: Vec<(&'static str, &'static str)>,
    }

    impl Request for Req {
        fn uri(&self) -> &str {
            self.uri
        }

        fn protocol(&self) -> Option<&str> {
            Some("HTTP/1.1")
        }

        fn method(&self) -> &str {
            "GET"
        }

        fn remote_address(&self) -> Option<&str> {
            Some("127.0.0.1")
        }

        fn remote_host(&self) -> Option<&str> {
            None
        }

        fn parameter_names(&self) -> Vec<&str> {
            let mut names: Vec<&str> = Vec::new();

            for (name, _) in &self.params {
                if !names.contains(name) {
                    names.push(*name);
                }
            }

            names
        }

        fn parameter_values(&self, name: &str) -> Vec<&str> {
            self.params
                .iter()
                .filter(|(param, _)| *param == name)
                .map(|(_, value)| *value)
                .collect()
        }
    }

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

    fn params(evt: &Event) -> Vec<(String, Vec<String>)> {
        evt.data()
            .and_then(|data| data.find("parameters"))
            .map(|parameters| {
                parameters
                    .find_all("param")
                    .map(|param| {
                        (
                            param
                                .attribute("name")
                                .map(|name| name.to_string())
                                .unwrap_or_default(),
                            param
                                .find_all("value")
                                .filter_map(|value| value.text().map(String::from))
                                .collect(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn requests_are_recorded() {
        let (manager, events) = manager();
        let adapter = RequestAdapter::new(manager.clone());

        let req = Req {
            uri: "/orders/42",
            params: vec![("expand", "lines"), ("page", "1"), ("expand", "totals")],
        };

        let evt = adapter.start(&req);
        assert!(evt.is_some());
        adapter.stop(evt);

        manager.flush();

        let events = events.lock().unwrap();
        let evt = &events[0];

        assert_eq!("http-request", evt.kind());
        assert_eq!("/orders/42", evt.name());

        let data = evt.data().unwrap();
        assert_eq!(
            Some("/orders/42"),
            data.attribute("uri").and_then(|uri| uri.to_str()).as_deref()
        );
        assert_eq!(
            Some("GET"),
            data.attribute("method").and_then(|method| method.to_str()).as_deref()
        );
        assert!(data.attribute("remote-address").is_some());
        assert!(data.attribute("remote-host").is_none());

        assert_eq!(
            vec![
                (
                    String::from("expand"),
                    vec![String::from("lines"), String::from("totals")]
                ),
                (String::from("page"), vec![String::from("1")]),
            ],
            params(evt)
        );
    }

    #[test]
    fn parameters_can_be_limited() {
        let (manager, events) = manager();
        let adapter = RequestAdapter::new(manager.clone()).with_parameters(["page", "missing"]);

        let req = Req {
            uri: "/orders",
            params: vec![("password", "hunter2"), ("page", "2")],
        };

        adapter.stop(adapter.start(&req));
        manager.flush();

        let events = events.lock().unwrap();

        assert_eq!(
            vec![(String::from("page"), vec![String::from("2")])],
            params(&events[0])
        );
    }

    #[test]
    fn uri_patterns_match_the_whole_path() {
        let (manager, events) = manager();
        let adapter = RequestAdapter::new(manager.clone())
            .with_uri_patterns([r"/orders/\d+", "/health"])
            .unwrap();

        let tracked = Req {
            uri: "/orders/42",
            params: Vec::new(),
        };
        let untracked = Req {
            uri: "/orders/42/lines",
            params: Vec::new(),
        };

        assert!(adapter.matches(&tracked));
        assert!(!adapter.matches(&untracked));

        let evt = adapter.start(&untracked);
        assert!(evt.is_none());
        adapter.stop(evt);

        adapter.stop(adapter.start(&tracked));

        manager.flush();

        assert_eq!(1, events.lock().unwrap().len());
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        let (manager, _) = manager();

        assert!(RequestAdapter::new(manager).with_uri_patterns(["("]).is_err());
    }

    #[test]
    fn handler_errors_are_recorded() {
        let (manager, events) = manager();
        let adapter = RequestAdapter::new(manager.clone());

        let req = Req {
            uri: "/orders",
            params: Vec::new(),
        };

        let err = adapter
            .handle(&req, || -> Result<(), io::Error> {
                Err(io::Error::new(io::ErrorKind::Other, "bad gateway"))
            })
            .unwrap_err();

        assert_eq!("bad gateway", err.to_string());

        manager.flush();

        let events = events.lock().unwrap();

        assert!(events[0].is_error());
        assert_eq!(Some(500), status(&events[0]));
    }

    fn status(evt: &Event) -> Option<u64> {
        evt.data()?.attribute("response-status")?.to_u64()
    }

    #[test]
    fn responses_are_recorded() {
        let (manager, events) = manager();
        let adapter = RequestAdapter::new(manager.clone());

        let req = Req {
            uri: "/orders",
            params: Vec::new(),
        };

        let res = adapter
            .handle_response(&req, || Ok::<_, io::Error>(Status::new(200).with_message("OK")))
            .unwrap();

        assert_eq!(Some(200), res.status());

        adapter.stop_with_response(
            adapter.start(&req),
            Status::new(404).with_message("Not Found"),
        );
        adapter.stop_with_response(adapter.start(&req), Status::new(503));

        manager.flush();

        let events = events.lock().unwrap();

        assert_eq!(Some(200), status(&events[0]));
        assert_eq!(
            Some("OK"),
            events[0]
                .data()
                .and_then(|data| data.attribute("response-message"))
                .and_then(|message| message.to_str())
                .as_deref()
        );
        assert!(!events[0].is_error());

        assert_eq!(Some(404), status(&events[1]));
        assert_eq!("404: Not Found", events[1].error().unwrap().message());

        assert_eq!(Some(503), status(&events[2]));
        assert_eq!("503", events[2].error().unwrap().message());
    }

    #[test]
    fn handler_panics_are_server_errors() {
        let (manager, events) = manager();
        let adapter = RequestAdapter::new(manager.clone());

        let req = Req {
            uri: "/orders",
            params: Vec::new(),
        };

        let payload = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            adapter.handle_response(&req, || -> Result<Status, io::Error> {
                panic!("explicit panic")
            })
        }))
        .unwrap_err();

        assert_eq!(Some(&"explicit panic"), payload.downcast_ref::<&str>());

        manager.flush();

        let events = events.lock().unwrap();

        assert_eq!(Some(500), status(&events[0]));
        assert_eq!("panicked: explicit panic", events[0].error().unwrap().message());
    }

    #[test]
    fn stopping_out_of_order_panics() {
        let (manager, _) = manager();
        let adapter = RequestAdapter::new(manager.clone());

        let req = Req {
            uri: "/orders",
            params: Vec::new(),
        };

        let outer = adapter.start(&req);
        let inner = adapter.start(&req);

        let stopped =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| adapter.stop(outer)));

        assert!(stopped.is_err());
        assert_eq!(2, manager.depth());

        adapter.stop(inner);
    }
}
