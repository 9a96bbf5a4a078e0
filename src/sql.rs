/*!
Track statements executed against a database.

The traits in this module describe the parts of a database driver that statements flow through: a
[`DataSource`] hands out [`Connection`]s, which create dynamic [`Statement`]s and [`PreparedStatement`]s.
[`TrackingDataSource`] wraps a data source so that every connection, statement, and prepared statement
it returns is itself a tracking wrapper implementing the same trait.

Each execution produces an event with the kind `jdbc` (configurable with [`TrackingDataSource::with_kind`])
and the name of the operation (`execute`, `execute_query`, `execute_update`, or `execute_batch`). The
event carries:

- an `sql` element with the statement's SQL.
- a `parameters` element with one `param` child per parameter set since the last execution. Each
  `param` has an `index` attribute and the parameter's value as its text. Null parameters have no text.
  Binary parameters aren't recorded.
- for `execute_batch`, a `batch` element with one child per call to `add_batch`.

Wrappers never change the outcome of a call. Results and errors are returned exactly as the wrapped
driver produced them, and panics are resumed with their original payload.

```
# use beet::sql::*;
# fn exec<D: DataSource>(ds: D, manager: beet::Manager) -> Result<(), <D::Connection as Connection>::Error> {
let ds = TrackingDataSource::new(ds, manager);

let mut conn = ds.connection()?;
let mut stmt = conn.prepare_statement("select * from orders where id = ?")?;

stmt.set_int(1, 42)?;
let rows = stmt.execute_query()?;
# Ok(())
# }
```
*/

use std::{
    error::Error,
    fmt,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    data::DataElement,
    event::Event,
    intercept::intercept,
    manager::Tracker,
};

/**
The default kind of SQL events.
*/
pub const DEFAULT_KIND: &str = "jdbc";

/**
A source of connections.
*/
pub trait DataSource {
    /**
    The type of connection returned.
    */
    type Connection: Connection;

    /**
    Open a connection.
    */
    fn connection(&self) -> Result<Self::Connection, <Self::Connection as Connection>::Error>;
}

/**
A connection to a database.
*/
pub trait Connection {
    /**
    The error returned by operations on the connection and its statements.
    */
    type Error: Error;

    /**
    The type of dynamic statement.
    */
    type Statement: Statement<Error = Self::Error>;

    /**
    The type of prepared statement.
    */
    type PreparedStatement: PreparedStatement<Error = Self::Error>;

    /**
    Create a statement for executing dynamic SQL.
    */
    fn create_statement(&mut self) -> Result<Self::Statement, Self::Error>;

    /**
    Prepare a statement for the given SQL.
    */
    fn prepare_statement(&mut self, sql: &str) -> Result<Self::PreparedStatement, Self::Error>;

    /**
    Prepare a call to a stored procedure.
    */
    fn prepare_call(&mut self, sql: &str) -> Result<Self::PreparedStatement, Self::Error>;

    /**
    Commit the current transaction.
    */
    fn commit(&mut self) -> Result<(), Self::Error>;

    /**
    Roll back the current transaction.
    */
    fn rollback(&mut self) -> Result<(), Self::Error>;

    /**
    Whether each statement is committed as soon as it's executed.
    */
    fn auto_commit(&self) -> Result<bool, Self::Error>;

    /**
    Set whether each statement is committed as soon as it's executed.
    */
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), Self::Error>;
}

/**
A statement that executes SQL supplied with each call.
*/
pub trait Statement {
    /**
    The error returned by the statement.
    */
    type Error: Error;

    /**
    The rows returned by queries.
    */
    type Rows;

    /**
    Execute any kind of SQL, returning whether it produced rows.
    */
    fn execute(&mut self, sql: &str) -> Result<bool, Self::Error>;

    /**
    Execute a query.
    */
    fn execute_query(&mut self, sql: &str) -> Result<Self::Rows, Self::Error>;

    /**
    Execute an update, returning the number of rows affected.
    */
    fn execute_update(&mut self, sql: &str) -> Result<u64, Self::Error>;

    /**
    Add SQL to the pending batch.
    */
    fn add_batch(&mut self, sql: &str) -> Result<(), Self::Error>;

    /**
    Discard the pending batch.
    */
    fn clear_batch(&mut self) -> Result<(), Self::Error>;

    /**
    Execute the pending batch, returning the number of rows affected by each entry.
    */
    fn execute_batch(&mut self) -> Result<Vec<u64>, Self::Error>;
}

/**
A parameter value for a [`PreparedStatement`].
*/
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Param<'a> {
    /**
    SQL `null`.
    */
    Null,
    /**
    A boolean.
    */
    Bool(bool),
    /**
    An integer.
    */
    Int(i64),
    /**
    A floating point number.
    */
    Float(f64),
    /**
    Text.
    */
    Text(&'a str),
    /**
    Binary data.
    */
    Bytes(&'a [u8]),
}

impl<'a> Param<'a> {
    fn record(&self, index: usize, parameters: &mut DataElement) {
        let param = match self {
            Param::Bytes(_) => return,
            _ => parameters.add_element("param"),
        };

        param.add("index", index);

        match *self {
            Param::Null | Param::Bytes(_) => (),
            Param::Bool(value) => {
                param.set_text(value.to_string());
            }
            Param::Int(value) => {
                param.set_text(value.to_string());
            }
            Param::Float(value) => {
                param.set_text(value.to_string());
            }
            Param::Text(value) => {
                param.set_text(value);
            }
        }
    }
}

/**
A statement with SQL fixed when it was prepared, and parameters set before each execution.

Parameter indexes start at 1.
*/
pub trait PreparedStatement {
    /**
    The error returned by the statement.
    */
    type Error: Error;

    /**
    The rows returned by queries.
    */
    type Rows;

    /**
    Set the parameter at `index`.
    */
    fn set_param(&mut self, index: usize, value: Param<'_>) -> Result<(), Self::Error>;

    /**
    Discard all parameters.
    */
    fn clear_parameters(&mut self) -> Result<(), Self::Error>;

    /**
    Execute any kind of SQL, returning whether it produced rows.
    */
    fn execute(&mut self) -> Result<bool, Self::Error>;

    /**
    Execute a query.
    */
    fn execute_query(&mut self) -> Result<Self::Rows, Self::Error>;

    /**
    Execute an update, returning the number of rows affected.
    */
    fn execute_update(&mut self) -> Result<u64, Self::Error>;

    /**
    Add the current parameters to the pending batch.
    */
    fn add_batch(&mut self) -> Result<(), Self::Error>;

    /**
    Discard the pending batch.
    */
    fn clear_batch(&mut self) -> Result<(), Self::Error>;

    /**
    Execute the pending batch, returning the number of rows affected by each entry.
    */
    fn execute_batch(&mut self) -> Result<Vec<u64>, Self::Error>;

    /**
    Set the parameter at `index` to `null`.
    */
    fn set_null(&mut self, index: usize) -> Result<(), Self::Error> {
        self.set_param(index, Param::Null)
    }

    /**
    Set the parameter at `index` to a boolean.
    */
    fn set_bool(&mut self, index: usize, value: bool) -> Result<(), Self::Error> {
        self.set_param(index, Param::Bool(value))
    }

    /**
    Set the parameter at `index` to an integer.
    */
    fn set_int(&mut self, index: usize, value: i64) -> Result<(), Self::Error> {
        self.set_param(index, Param::Int(value))
    }

    /**
    Set the parameter at `index` to a floating point number.
    */
    fn set_float(&mut self, index: usize, value: f64) -> Result<(), Self::Error> {
        self.set_param(index, Param::Float(value))
    }

    /**
    Set the parameter at `index` to text.
    */
    fn set_text(&mut self, index: usize, value: &str) -> Result<(), Self::Error> {
        self.set_param(index, Param::Text(value))
    }

    /**
    Set the parameter at `index` to binary data.
    */
    fn set_bytes(&mut self, index: usize, value: &[u8]) -> Result<(), Self::Error> {
        self.set_param(index, Param::Bytes(value))
    }
}

/**
The identity of a tracking wrapper.

Wrappers compare and hash by their own identity rather than the identity of the value they wrap.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyId(u64);

impl ProxyId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);

        ProxyId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

macro_rules! impl_proxy {
    ($ty:ident) => {
        impl<W, T> $ty<W, T> {
            /**
            The identity of this wrapper.
            */
            pub fn proxy_id(&self) -> ProxyId {
                self.id
            }

            /**
            The wrapped value.
            */
            pub fn target(&self) -> &W {
                &self.target
            }

            /**
            The wrapped value.

            Calls made directly on it aren't tracked.
            */
            pub fn target_mut(&mut self) -> &mut W {
                &mut self.target
            }

            /**
            Stop tracking and return the wrapped value.
            */
            pub fn into_target(self) -> W {
                self.target
            }
        }

        impl<W, T> PartialEq for $ty<W, T> {
            fn eq(&self, other: &Self) -> bool {
                self.id == other.id
            }
        }

        impl<W, T> Eq for $ty<W, T> {}

        impl<W, T> Hash for $ty<W, T> {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.id.hash(state)
            }
        }

        impl<W: fmt::Debug, T> fmt::Debug for $ty<W, T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    .field("id", &self.id)
                    .field("target", &self.target)
                    .finish()
            }
        }
    };
}

#[derive(Clone)]
struct Tracking<T> {
    tracker: T,
    kind: Arc<str>,
    suspended: Arc<AtomicBool>,
}

impl<T: Tracker> Tracking<T> {
    fn is_active(&self) -> bool {
        !self.suspended.load(Ordering::Relaxed)
    }

    fn event(&self, name: &str) -> Event {
        self.tracker.create_event(&self.kind, name)
    }
}

/**
A [`DataSource`] that tracks every connection it opens.
*/
pub struct TrackingDataSource<W, T> {
    id: ProxyId,
    target: W,
    tracker: T,
    kind: Arc<str>,
}

impl_proxy!(TrackingDataSource);

impl<W, T> TrackingDataSource<W, T> {
    /**
    Wrap a data source, tracking its statements with `tracker`.
    */
    pub fn new(target: W, tracker: T) -> Self {
        TrackingDataSource {
            id: ProxyId::next(),
            target,
            tracker,
            kind: Arc::from(DEFAULT_KIND),
        }
    }

    /**
    Use a different kind for events.
    */
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Arc::from(kind.into());
        self
    }

    /**
    The kind of events produced.
    */
    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl<W: DataSource, T: Tracker + Clone> DataSource for TrackingDataSource<W, T> {
    type Connection = TrackedConnection<W::Connection, T>;

    fn connection(&self) -> Result<Self::Connection, <Self::Connection as Connection>::Error> {
        let target = self.target.connection()?;

        Ok(TrackedConnection {
            id: ProxyId::next(),
            target,
            tracking: Tracking {
                tracker: self.tracker.clone(),
                kind: self.kind.clone(),
                suspended: Arc::new(AtomicBool::new(false)),
            },
        })
    }
}

/**
A [`Connection`] whose statements are tracked.

Tracking can be suspended for a connection and all of the statements created from it.
*/
pub struct TrackedConnection<W, T> {
    id: ProxyId,
    target: W,
    tracking: Tracking<T>,
}

impl_proxy!(TrackedConnection);

impl<W, T> TrackedConnection<W, T> {
    /**
    Stop producing events for this connection's statements.

    Calls still go through to the database. Parameters set while suspended aren't recorded.
    */
    pub fn suspend_tracking(&self) {
        self.tracking.suspended.store(true, Ordering::Relaxed);
    }

    /**
    Start producing events for this connection's statements again.
    */
    pub fn resume_tracking(&self) {
        self.tracking.suspended.store(false, Ordering::Relaxed);
    }

    /**
    Whether tracking is suspended.
    */
    pub fn is_tracking_suspended(&self) -> bool {
        self.tracking.suspended.load(Ordering::Relaxed)
    }
}

impl<W: Connection, T: Tracker + Clone> TrackedConnection<W, T> {
    fn prepared(
        &self,
        target: W::PreparedStatement,
        sql: &str,
    ) -> TrackedPreparedStatement<W::PreparedStatement, T> {
        TrackedPreparedStatement {
            id: ProxyId::next(),
            target,
            tracking: self.tracking.clone(),
            sql: sql.into(),
            parameters: DataElement::new("parameters"),
            batch: DataElement::new("batch"),
        }
    }
}

impl<W: Connection, T: Tracker + Clone> Connection for TrackedConnection<W, T> {
    type Error = W::Error;
    type Statement = TrackedStatement<W::Statement, T>;
    type PreparedStatement = TrackedPreparedStatement<W::PreparedStatement, T>;

    fn create_statement(&mut self) -> Result<Self::Statement, Self::Error> {
        let target = self.target.create_statement()?;

        Ok(TrackedStatement {
            id: ProxyId::next(),
            target,
            tracking: self.tracking.clone(),
            batch: DataElement::new("batch"),
        })
    }

    fn prepare_statement(&mut self, sql: &str) -> Result<Self::PreparedStatement, Self::Error> {
        let target = self.target.prepare_statement(sql)?;

        Ok(self.prepared(target, sql))
    }

    fn prepare_call(&mut self, sql: &str) -> Result<Self::PreparedStatement, Self::Error> {
        let target = self.target.prepare_call(sql)?;

        Ok(self.prepared(target, sql))
    }

    fn commit(&mut self) -> Result<(), Self::Error> {
        self.target.commit()
    }

    fn rollback(&mut self) -> Result<(), Self::Error> {
        self.target.rollback()
    }

    fn auto_commit(&self) -> Result<bool, Self::Error> {
        self.target.auto_commit()
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), Self::Error> {
        self.target.set_auto_commit(auto_commit)
    }
}

/**
A [`Statement`] that tracks each execution.
*/
pub struct TrackedStatement<W, T> {
    id: ProxyId,
    target: W,
    tracking: Tracking<T>,
    batch: DataElement,
}

impl_proxy!(TrackedStatement);

impl<W: Statement, T: Tracker> TrackedStatement<W, T> {
    fn track<R>(
        &mut self,
        name: &str,
        sql: &str,
        call: impl FnOnce(&mut W) -> Result<R, W::Error>,
    ) -> Result<R, W::Error> {
        let target = &mut self.target;

        if !self.tracking.is_active() {
            return call(target);
        }

        let mut evt = self.tracking.event(name);
        evt.data_mut().add_element("sql").set_text(sql);

        intercept(&self.tracking.tracker, evt, move || call(target), |_, _| {})
    }
}

impl<W: Statement, T: Tracker> Statement for TrackedStatement<W, T> {
    type Error = W::Error;
    type Rows = W::Rows;

    fn execute(&mut self, sql: &str) -> Result<bool, Self::Error> {
        self.track("execute", sql, |target| target.execute(sql))
    }

    fn execute_query(&mut self, sql: &str) -> Result<Self::Rows, Self::Error> {
        self.track("execute_query", sql, |target| target.execute_query(sql))
    }

    fn execute_update(&mut self, sql: &str) -> Result<u64, Self::Error> {
        self.track("execute_update", sql, |target| target.execute_update(sql))
    }

    fn add_batch(&mut self, sql: &str) -> Result<(), Self::Error> {
        self.target.add_batch(sql)?;

        if self.tracking.is_active() {
            self.batch.add_element("sql").set_text(sql);
        }

        Ok(())
    }

    fn clear_batch(&mut self) -> Result<(), Self::Error> {
        self.target.clear_batch()?;
        self.batch.clear();

        Ok(())
    }

    fn execute_batch(&mut self) -> Result<Vec<u64>, Self::Error> {
        let batch = std::mem::replace(&mut self.batch, DataElement::new("batch"));
        let target = &mut self.target;

        if !self.tracking.is_active() {
            return target.execute_batch();
        }

        let mut evt = self.tracking.event("execute_batch");
        evt.data_mut().push_element(batch);

        intercept(
            &self.tracking.tracker,
            evt,
            move || target.execute_batch(),
            |_, _| {},
        )
    }
}

/**
A [`PreparedStatement`] that tracks each execution along with its parameters.
*/
pub struct TrackedPreparedStatement<W, T> {
    id: ProxyId,
    target: W,
    tracking: Tracking<T>,
    sql: String,
    parameters: DataElement,
    batch: DataElement,
}

impl_proxy!(TrackedPreparedStatement);

impl<W, T> TrackedPreparedStatement<W, T> {
    /**
    The SQL the statement was prepared with.
    */
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /**
    The parameters recorded since the last execution.
    */
    pub fn parameters(&self) -> &DataElement {
        &self.parameters
    }

    /**
    The batch entries recorded since the last batch execution.
    */
    pub fn pending_batch(&self) -> &DataElement {
        &self.batch
    }
}

impl<W: PreparedStatement, T: Tracker> TrackedPreparedStatement<W, T> {
    fn track<R>(
        &mut self,
        name: &str,
        call: impl FnOnce(&mut W) -> Result<R, W::Error>,
    ) -> Result<R, W::Error> {
        let parameters = std::mem::replace(&mut self.parameters, DataElement::new("parameters"));
        let target = &mut self.target;

        if !self.tracking.is_active() {
            return call(target);
        }

        let mut evt = self.tracking.event(name);

        let data = evt.data_mut();
        data.add_element("sql").set_text(&*self.sql);
        if !parameters.is_empty() {
            data.push_element(parameters);
        }

        intercept(&self.tracking.tracker, evt, move || call(target), |_, _| {})
    }
}

impl<W: PreparedStatement, T: Tracker> PreparedStatement for TrackedPreparedStatement<W, T> {
    type Error = W::Error;
    type Rows = W::Rows;

    fn set_param(&mut self, index: usize, value: Param<'_>) -> Result<(), Self::Error> {
        self.target.set_param(index, value)?;

        if self.tracking.is_active() {
            value.record(index, &mut self.parameters);
        }

        Ok(())
    }

    fn clear_parameters(&mut self) -> Result<(), Self::Error> {
        self.target.clear_parameters()?;
        self.parameters.clear();

        Ok(())
    }

    fn execute(&mut self) -> Result<bool, Self::Error> {
        self.track("execute", |target| target.execute())
    }

    fn execute_query(&mut self) -> Result<Self::Rows, Self::Error> {
        self.track("execute_query", |target| target.execute_query())
    }

    fn execute_update(&mut self) -> Result<u64, Self::Error> {
        self.track("execute_update", |target| target.execute_update())
    }

    fn add_batch(&mut self) -> Result<(), Self::Error> {
        self.target.add_batch()?;

        let parameters = std::mem::replace(&mut self.parameters, DataElement::new("parameters"));
        if self.tracking.is_active() {
            self.batch.push_element(parameters);
        }

        Ok(())
    }

    fn clear_batch(&mut self) -> Result<(), Self::Error> {
        self.target.clear_batch()?;
        self.batch.clear();

        Ok(())
    }

    fn execute_batch(&mut self) -> Result<Vec<u64>, Self::Error> {
        let batch = std::mem::replace(&mut self.batch, DataElement::new("batch"));
        let target = &mut self.target;

        if !self.tracking.is_active() {
            return target.execute_batch();
        }

        let mut evt = self.tracking.event("execute_batch");

        let data = evt.data_mut();
        data.add_element("sql").set_text(&*self.sql);
        data.push_element(batch);

        intercept(
            &self.tracking.tracker,
            evt,
            move || target.execute_batch(),
            |_, _| {},
        )
    }
}
