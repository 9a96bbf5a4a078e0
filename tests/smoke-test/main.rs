use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use beet::{
    http::{Request, RequestAdapter, Status},
    method::{Arg, MethodAdvice},
    persister,
    session::{self, Session},
    sql::{Connection, DataSource, Param, PreparedStatement, Statement, TrackingDataSource},
    stats::{StatisticsRegistry, TimeUnit},
    Manager, RetryPolicy, Tracker as _,
};

#[tokio::main]
async fn main() {
    let internal = emit::setup().emit_to(emit_term::stdout()).init_internal();
    let rt = emit::setup().emit_to(emit_term::stdout()).init();

    let stats = StatisticsRegistry::new();

    let manager = beet::setup()
        .application("smoke-test")
        .session_context(session::from_fn(|| Session {
            user_id: Some(String::from("smoke")),
            session_id: Some(format!("{:?}", std::thread::current().id())),
        }))
        .persist_to(
            beet_file::set("./target/events/events.txt")
                .reuse_files(true)
                .roll_by_minute()
                .max_files(6)
                .spawn()
                .unwrap(),
        )
        .and_persist_to(stats.clone())
        .and_persist_to(persister::Log::new().with_data(true))
        .and_persist_to(persister::from_fn(|batch| {
            let json = serde_json::to_string(batch)
                .map_err(beet::DeliveryError::new)?;

            emit::debug!("persisted {bytes} bytes of json", bytes: json.len());

            Ok(batch.len())
        }))
        .max_batch_size(25)
        .retry(RetryPolicy::new().max_retries(3))
        .track_flushes(true)
        .spawn()
        .unwrap();

    let mut requests = Vec::new();

    for i in 0..100 {
        let manager = manager.clone();

        // Events are correlated per thread, so each request runs start to finish on one
        requests.push(tokio::task::spawn_blocking(move || handle(&manager, i)));
    }

    for request in requests {
        let _ = request.await;
    }

    manager.flush();

    for (key, snapshot) in stats.snapshot_all() {
        emit::info!(
            "{kind} {name}: {count} calls, {errors} errors, mean {mean}ms, stddev {stddev}ms",
            kind: key.kind,
            name: key.name,
            count: snapshot.count(),
            errors: snapshot.error_count(),
            mean: snapshot.mean_in(TimeUnit::Milliseconds).unwrap_or_default(),
            stddev: snapshot.stddev_in(TimeUnit::Milliseconds).unwrap_or_default(),
        );
    }

    let metrics = manager.metrics();

    emit::info!(
        "persisted {persisted} events in {batches} batches",
        persisted: metrics.events_persisted,
        batches: metrics.batches_processed,
    );

    manager.shutdown(Duration::from_secs(60));

    rt.blocking_flush(Duration::from_secs(5));
    internal.blocking_flush(Duration::from_secs(5));
}

fn handle(manager: &Manager, i: usize) {
    let req = Req {
        uri: format!("/orders/{i}"),
        page: i % 3,
    };

    let adapter = RequestAdapter::new(manager)
        .with_uri_patterns([r"/orders/\d+"])
        .unwrap();

    let _ = adapter.handle_response(&req, || {
        MethodAdvice::new(manager)
            .call("Orders", "load")
            .arg(Arg::value(i))
            .arg(Arg::seq(0..req.page))
            .invoke(|| load(manager, i))
            .map(|rows| match rows {
                0 => Status::new(404).with_message("Not Found"),
                _ => Status::new(200).with_message("OK"),
            })
    });
}

fn load(manager: &Manager, i: usize) -> Result<usize, DbError> {
    let ds = TrackingDataSource::new(MemoryDb::default(), manager);

    let mut conn = ds.connection()?;

    let mut lookup = conn.prepare_statement("select * from orders where id = ?")?;
    lookup.set_int(1, i as i64)?;
    let rows = lookup.execute_query()?;

    let mut audit = conn.create_statement()?;
    audit.add_batch("insert into audit values ('load')")?;
    audit.add_batch("update counters set loads = loads + 1")?;
    audit.execute_batch()?;

    conn.suspend_tracking();
    audit.execute_update("delete from scratch")?;
    conn.resume_tracking();

    conn.commit()?;

    if i % 10 == 0 {
        return Err(DbError("order is locked"));
    }

    Ok(rows)
}

struct Req {
    uri: String,
    page: usize,
}

impl Request for Req {
    fn uri(&self) -> &str {
        &self.uri
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
        Some("localhost")
    }

    fn parameter_names(&self) -> Vec<&str> {
        vec!["page"]
    }

    fn parameter_values(&self, name: &str) -> Vec<&str> {
        match (name, self.page) {
            ("page", 0) => vec!["0"],
            ("page", 1) => vec!["1"],
            ("page", _) => vec!["2"],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug)]
struct DbError(&'static str);

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Error for DbError {}

static STATEMENTS: AtomicUsize = AtomicUsize::new(0);

#[derive(Default, Clone)]
struct MemoryDb {
    pending: Arc<AtomicUsize>,
}

impl MemoryDb {
    fn run(&self) {
        STATEMENTS.fetch_add(1, Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(1));
    }
}

impl DataSource for MemoryDb {
    type Connection = MemoryDb;

    fn connection(&self) -> Result<MemoryDb, DbError> {
        Ok(self.clone())
    }
}

impl Connection for MemoryDb {
    type Error = DbError;
    type Statement = MemoryDb;
    type PreparedStatement = MemoryDb;

    fn create_statement(&mut self) -> Result<MemoryDb, DbError> {
        Ok(self.clone())
    }

    fn prepare_statement(&mut self, _: &str) -> Result<MemoryDb, DbError> {
        Ok(self.clone())
    }

    fn prepare_call(&mut self, _: &str) -> Result<MemoryDb, DbError> {
        Ok(self.clone())
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.pending.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.pending.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn auto_commit(&self) -> Result<bool, DbError> {
        Ok(false)
    }

    fn set_auto_commit(&mut self, _: bool) -> Result<(), DbError> {
        Ok(())
    }
}

impl Statement for MemoryDb {
    type Error = DbError;
    type Rows = usize;

    fn execute(&mut self, _: &str) -> Result<bool, DbError> {
        self.run();
        Ok(false)
    }

    fn execute_query(&mut self, _: &str) -> Result<usize, DbError> {
        self.run();
        Ok(1)
    }

    fn execute_update(&mut self, _: &str) -> Result<u64, DbError> {
        self.run();
        Ok(1)
    }

    fn add_batch(&mut self, _: &str) -> Result<(), DbError> {
        self.pending.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn clear_batch(&mut self) -> Result<(), DbError> {
        self.pending.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn execute_batch(&mut self) -> Result<Vec<u64>, DbError> {
        self.run();
        let pending = self.pending.swap(0, Ordering::Relaxed);
        Ok(vec![1; pending])
    }
}

impl PreparedStatement for MemoryDb {
    type Error = DbError;
    type Rows = usize;

    fn set_param(&mut self, _: usize, _: Param<'_>) -> Result<(), DbError> {
        Ok(())
    }

    fn clear_parameters(&mut self) -> Result<(), DbError> {
        Ok(())
    }

    fn execute(&mut self) -> Result<bool, DbError> {
        self.run();
        Ok(false)
    }

    fn execute_query(&mut self) -> Result<usize, DbError> {
        self.run();
        Ok(1)
    }

    fn execute_update(&mut self) -> Result<u64, DbError> {
        self.run();
        Ok(1)
    }

    fn add_batch(&mut self) -> Result<(), DbError> {
        self.pending.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn clear_batch(&mut self) -> Result<(), DbError> {
        self.pending.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn execute_batch(&mut self) -> Result<Vec<u64>, DbError> {
        self.run();
        let pending = self.pending.swap(0, Ordering::Relaxed);
        Ok(vec![1; pending])
    }
}
