/*!
Persist behavior events to rolling files.

This library writes newline delimited JSON by default, like:

```text
{"id":12,"parent_id":11,"kind":"jdbc","name":"execute_query","application":"orders","start":"2024-05-29T03:35:13.922768000Z","duration_ns":1203345,"data":{"name":"event-data","children":[{"name":"sql","text":"select * from orders"}]}}
```

# Getting started

Add `beet` and `beet_file` to your `Cargo.toml`, then persist events to a rolling file set:

```
fn main() {
    let manager = beet::setup()
        .persist_to(beet_file::set("./target/events/orders.txt").spawn().unwrap())
        .spawn()
        .unwrap();

    // Your app code goes here

    manager.shutdown(std::time::Duration::from_secs(30));
}
```

The input to [`set`] is a template for file naming. The example earlier used `./target/events/orders.txt`. From this template, files will be written to `./target/events`, each file name will start with `orders`, and use `.txt` as its extension.

# File naming

Files are created using the following naming scheme:

```text
{prefix}.{date}.{counter}.{id}.{ext}
```

where:

- `prefix`: A user-defined name that groups all files related to the same application together.
- `date`: The rollover interval the file was created in. This isn't necessarily related to the timestamps of events within the file.
- `counter`: The number of milliseconds since the start of the current rollover interval when the file was created.
- `id`: A unique identifier for the file in the interval.
- `ext`: A user-defined file extension.

# When files roll

Events are only ever written to a single file at a time. That file changes when:

1. The application restarts and [`FileSetBuilder::reuse_files`] is false.
2. The rollover period changes. This is set by [`FileSetBuilder::roll_by_day`], [`FileSetBuilder::roll_by_hour`], and [`FileSetBuilder::roll_by_minute`].
3. The size of the file exceeds [`FileSetBuilder::max_file_size_bytes`].
4. Writing to the file fails.

# Handling IO failures

Batches are written by the pipeline's drain loop and synced before [`beet::Persister::persist`] returns. If writing a batch fails then the file being written to is abandoned and the error is returned to the pipeline, which retries the batch on a new file according to its [`beet::RetryPolicy`]. Part of a failed batch may already be present in the abandoned file, so events may be duplicated after an IO error.
*/

use std::{
    fmt,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use beet::{
    clock::{Clock, SystemClock},
    timestamp::Parts,
    DeliveryError, Event, Persister, Timestamp,
};

/**
An error attempting to create a [`FileSet`].
*/
pub struct Error(Box<dyn std::error::Error + Send + Sync>);

impl Error {
    fn new(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error(e.into())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

type Writer = Box<dyn Fn(&mut FileBuf, &Event) -> io::Result<()> + Send + Sync>;

/**
Create a builder for a [`FileSet`] using the default newline-delimited JSON format.

The builder will use `file_set` as its template for naming files. See the crate root documentation for details on how this argument is interpreted.

It will use the other following defaults:

- Roll by hour.
- 32 max files.
- 1GiB max file size.

Once configured, call [`FileSetBuilder::spawn`] to complete the builder, passing the resulting [`FileSet`] to [`beet::Setup::persist_to`].
*/
pub fn set(file_set: impl AsRef<Path>) -> FileSetBuilder {
    FileSetBuilder::new(file_set.as_ref())
}

/**
A builder for a [`FileSet`].
*/
pub struct FileSetBuilder {
    file_set: PathBuf,
    roll_by: RollBy,
    max_files: usize,
    max_file_size_bytes: usize,
    reuse_files: bool,
    clock: Box<dyn Clock + Send + Sync>,
    writer: Writer,
    separator: &'static [u8],
}

/**
The period covered by each file.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollBy {
    /**
    A new file each calendar day.
    */
    Day,
    /**
    A new file each hour.
    */
    Hour,
    /**
    A new file each minute.
    */
    Minute,
}

const DEFAULT_ROLL_BY: RollBy = RollBy::Hour;
const DEFAULT_MAX_FILES: usize = 32;
const DEFAULT_MAX_FILE_SIZE_BYTES: usize = 1024 * 1024 * 1024; // 1GiB
const DEFAULT_REUSE_FILES: bool = false;

impl FileSetBuilder {
    /**
    Create a new [`FileSetBuilder`] using the default newline-delimited JSON format.
    */
    pub fn new(file_set: impl Into<PathBuf>) -> Self {
        FileSetBuilder {
            file_set: file_set.into(),
            roll_by: DEFAULT_ROLL_BY,
            max_files: DEFAULT_MAX_FILES,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            reuse_files: DEFAULT_REUSE_FILES,
            clock: Box::new(SystemClock::new()),
            writer: Box::new(default_writer),
            separator: b"\n",
        }
    }

    /**
    Create files based on the calendar day of when they're written to.
    */
    pub fn roll_by_day(self) -> Self {
        self.roll_by(RollBy::Day)
    }

    /**
    Create files based on the calendar day and hour of when they're written to.
    */
    pub fn roll_by_hour(self) -> Self {
        self.roll_by(RollBy::Hour)
    }

    /**
    Create files based on the calendar day, hour, and minute of when they're written to.
    */
    pub fn roll_by_minute(self) -> Self {
        self.roll_by(RollBy::Minute)
    }

    /**
    The period covered by each file.
    */
    pub fn roll_by(mut self, roll_by: RollBy) -> Self {
        self.roll_by = roll_by;
        self
    }

    /**
    The maximum number of files to keep.

    Files are deleted from oldest first whenever a new file is created.
    */
    pub fn max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    /**
    The maximum size of a file before new writes will roll over to a new one.
    */
    pub fn max_file_size_bytes(mut self, max_file_size_bytes: usize) -> Self {
        self.max_file_size_bytes = max_file_size_bytes;
        self
    }

    /**
    Whether to re-use the latest file when first attempting to write.

    Before writing new events to a re-used file, the separator is written to it so any partial write from a previous run doesn't corrupt new events.
    */
    pub fn reuse_files(mut self, reuse_files: bool) -> Self {
        self.reuse_files = reuse_files;
        self
    }

    /**
    The clock used to decide which period a write belongs to.
    */
    pub fn clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /**
    Specify a writer for events.

    The `writer` formats events into their on-disk format. If formatting fails then the event is discarded.

    The `separator` is written between individual events.
    */
    pub fn writer(
        mut self,
        writer: impl Fn(&mut FileBuf, &Event) -> io::Result<()> + Send + Sync + 'static,
        separator: &'static [u8],
    ) -> Self {
        self.writer = Box::new(writer);
        self.separator = separator;
        self
    }

    /**
    Complete the builder, returning a [`FileSet`] to pass to [`beet::Setup::persist_to`].
    */
    pub fn spawn(self) -> Result<FileSet, Error> {
        let (dir, file_prefix, file_ext) = dir_prefix_ext(self.file_set)?;

        Ok(FileSet {
            metrics: InternalMetrics::default(),
            writer: self.writer,
            separator: self.separator,
            clock: self.clock,
            worker: Mutex::new(Worker {
                active_file: None,
                roll_by: self.roll_by,
                max_files: self.max_files,
                max_file_size_bytes: self.max_file_size_bytes,
                reuse_files: self.reuse_files,
                dir,
                file_prefix,
                file_ext,
                separator: self.separator,
            }),
        })
    }
}

/**
A [`Persister`] that writes events to a set of rolling files.

Create a file set through the [`set`] function, calling [`FileSetBuilder::spawn`] to complete configuration.
*/
pub struct FileSet {
    metrics: InternalMetrics,
    writer: Writer,
    separator: &'static [u8],
    clock: Box<dyn Clock + Send + Sync>,
    worker: Mutex<Worker>,
}

impl Persister for FileSet {
    fn persist(&self, batch: &[Event]) -> Result<usize, DeliveryError> {
        let mut bufs = Vec::with_capacity(batch.len());

        for evt in batch {
            let mut buf = FileBuf::new();

            match (self.writer)(&mut buf, evt) {
                Ok(()) => {
                    if !buf.0.ends_with(self.separator) {
                        buf.extend_from_slice(self.separator);
                    }

                    bufs.push(buf.0);
                }
                Err(err) => {
                    self.metrics.event_format_failed.increment();

                    emit::warn!(
                        rt: emit::runtime::internal(),
                        "failed to format event {event_id}: {err}",
                        event_id: evt.id().to_u64(),
                        err,
                    );
                }
            }
        }

        if bufs.is_empty() {
            return Ok(0);
        }

        let now = self
            .clock
            .now()
            .ok_or_else(|| DeliveryError::msg("the clock is unavailable"))?;

        let mut worker = self.worker.lock().unwrap_or_else(|err| err.into_inner());

        worker.write(&self.metrics, now, &bufs)?;

        Ok(bufs.len())
    }
}

impl FileSet {
    /**
    Get a snapshot of the file set's own counters.

    These can be used to monitor the health of the file set.
    */
    pub fn metrics(&self) -> FileSetMetrics {
        self.metrics.sample()
    }
}

/**
Counters for the operations performed by a [`FileSet`].
*/
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct FileSetMetrics {
    /** Files created. */
    pub file_create: usize,
    /** Files that couldn't be created. */
    pub file_create_failed: usize,
    /** Existing files that couldn't be opened for reuse. */
    pub file_open_failed: usize,
    /** Failures reading the directory of files. */
    pub file_set_read_failed: usize,
    /** Failures writing or syncing a batch. */
    pub file_write_failed: usize,
    /** Old files deleted. */
    pub file_delete: usize,
    /** Old files that couldn't be deleted. */
    pub file_delete_failed: usize,
    /** Events the writer couldn't format. */
    pub event_format_failed: usize,
}

#[derive(Default)]
struct Counter(AtomicUsize);

impl Counter {
    fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn sample(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct InternalMetrics {
    file_create: Counter,
    file_create_failed: Counter,
    file_open_failed: Counter,
    file_set_read_failed: Counter,
    file_write_failed: Counter,
    file_delete: Counter,
    file_delete_failed: Counter,
    event_format_failed: Counter,
}

impl InternalMetrics {
    fn sample(&self) -> FileSetMetrics {
        FileSetMetrics {
            file_create: self.file_create.sample(),
            file_create_failed: self.file_create_failed.sample(),
            file_open_failed: self.file_open_failed.sample(),
            file_set_read_failed: self.file_set_read_failed.sample(),
            file_write_failed: self.file_write_failed.sample(),
            file_delete: self.file_delete.sample(),
            file_delete_failed: self.file_delete_failed.sample(),
            event_format_failed: self.event_format_failed.sample(),
        }
    }
}

/**
A buffer to format events into before writing them to a file.
*/
pub struct FileBuf(Vec<u8>);

impl FileBuf {
    fn new() -> Self {
        FileBuf(Vec::new())
    }

    /**
    Push a byte onto the end of the buffer.
    */
    pub fn push(&mut self, byte: u8) {
        self.0.push(byte)
    }

    /**
    Push a slice of bytes onto the end of the buffer.
    */
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes)
    }
}

impl io::Write for FileBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

fn default_writer(buf: &mut FileBuf, evt: &Event) -> io::Result<()> {
    sval_json::stream_to_io_write(buf, evt)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    Ok(())
}

struct Worker {
    active_file: Option<ActiveFile>,
    roll_by: RollBy,
    max_files: usize,
    max_file_size_bytes: usize,
    reuse_files: bool,
    dir: String,
    file_prefix: String,
    file_ext: String,
    separator: &'static [u8],
}

impl Worker {
    fn write(
        &mut self,
        metrics: &InternalMetrics,
        ts: Timestamp,
        bufs: &[Vec<u8>],
    ) -> Result<(), io::Error> {
        let parts = ts.to_parts();
        let file_ts = file_ts(self.roll_by, parts);
        let batch_bytes: usize = bufs.iter().map(|buf| buf.len()).sum();

        let mut file = self.active_file.take();
        let mut file_set = ActiveFileSet::empty(metrics, &self.dir);

        if file.is_none() {
            if let Err(err) = fs::create_dir_all(&self.dir) {
                emit::warn!(
                    rt: emit::runtime::internal(),
                    "failed to create root directory {path}: {err}",
                    #[emit::as_debug]
                    path: &self.dir,
                    err,
                );

                return Err(err);
            }

            file_set.read(&self.file_prefix, &self.file_ext);

            if self.reuse_files {
                if let Some(file_name) = file_set.current_file_name() {
                    let mut path = PathBuf::from(&self.dir);
                    path.push(file_name);

                    file = ActiveFile::try_open_reuse(&path)
                        .map_err(|err| {
                            metrics.file_open_failed.increment();

                            emit::warn!(
                                rt: emit::runtime::internal(),
                                "failed to open {path}: {err}",
                                #[emit::as_debug]
                                path,
                                err,
                            );

                            err
                        })
                        .ok()
                }
            }
        }

        file = file.filter(|file| {
            file.file_size_bytes + batch_bytes <= self.max_file_size_bytes
                && file.file_ts == file_ts
        });

        let mut file = if let Some(file) = file {
            file
        } else {
            if !file_set.is_read() {
                file_set.read(&self.file_prefix, &self.file_ext);
            }

            // Leave room for the file we're about to create
            file_set.apply_retention(self.max_files.saturating_sub(1));

            let mut path = PathBuf::from(&self.dir);

            let file_id = file_id(rolling_millis(self.roll_by, ts, parts), rolling_id());

            path.push(file_name(
                &self.file_prefix,
                &self.file_ext,
                &file_ts,
                &file_id,
            ));

            match ActiveFile::try_open_create(&path) {
                Ok(file) => {
                    metrics.file_create.increment();

                    emit::debug!(
                        rt: emit::runtime::internal(),
                        "created {path}",
                        #[emit::as_debug]
                        path: file.file_path,
                    );

                    file
                }
                Err(err) => {
                    metrics.file_create_failed.increment();

                    emit::warn!(
                        rt: emit::runtime::internal(),
                        "failed to create {path}: {err}",
                        #[emit::as_debug]
                        path,
                        err,
                    );

                    return Err(err);
                }
            }
        };

        let written = bufs
            .iter()
            .try_for_each(|buf| file.write_event(buf, self.separator))
            .and_then(|_| file.file.flush())
            .and_then(|_| file.file.sync_all());

        if let Err(err) = written {
            metrics.file_write_failed.increment();

            emit::warn!(
                rt: emit::runtime::internal(),
                "failed to write {count} events to {path}: {err}",
                count: bufs.len(),
                #[emit::as_debug]
                path: file.file_path,
                err,
            );

            // The file is abandoned, the next attempt will create a new one
            return Err(err);
        }

        emit::debug!(
            rt: emit::runtime::internal(),
            "wrote {batch_bytes} bytes to {path}",
            batch_bytes,
            #[emit::as_debug]
            path: file.file_path,
        );

        self.active_file = Some(file);

        Ok(())
    }
}

struct ActiveFileSet<'a> {
    dir: &'a str,
    metrics: &'a InternalMetrics,
    file_set: Vec<String>,
    read: bool,
}

impl<'a> ActiveFileSet<'a> {
    fn empty(metrics: &'a InternalMetrics, dir: &'a str) -> Self {
        ActiveFileSet {
            metrics,
            dir,
            file_set: Vec::new(),
            read: false,
        }
    }

    fn is_read(&self) -> bool {
        self.read
    }

    fn read(&mut self, file_prefix: &str, file_ext: &str) {
        self.read = true;

        if let Err(err) = self.try_read(file_prefix, file_ext) {
            self.metrics.file_set_read_failed.increment();

            emit::warn!(
                rt: emit::runtime::internal(),
                "failed to read files in {path}: {err}",
                #[emit::as_debug]
                path: self.dir,
                err,
            );
        }
    }

    fn try_read(&mut self, file_prefix: &str, file_ext: &str) -> Result<(), io::Error> {
        self.file_set = Vec::new();

        let read_dir = fs::read_dir(dir_path(self.dir))?;

        let mut file_set = Vec::new();

        for entry in read_dir {
            let Ok(entry) = entry else {
                continue;
            };

            if let Ok(file_type) = entry.file_type() {
                if !file_type.is_file() {
                    continue;
                }
            }

            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };

            if file_name.starts_with(&format!("{file_prefix}."))
                && file_name.ends_with(&format!(".{file_ext}"))
            {
                file_set.push(file_name.to_owned());
            }
        }

        file_set.sort_by(|a, b| a.cmp(b).reverse());

        self.file_set = file_set;

        Ok(())
    }

    fn current_file_name(&self) -> Option<&str> {
        // NOTE: If the clock shifts back then this may return a file from the future
        // In that case a new file is created rather than reusing one
        self.file_set.first().map(|file_name| &**file_name)
    }

    fn apply_retention(&mut self, max_files: usize) {
        while self.file_set.len() > max_files {
            let Some(file_name) = self.file_set.pop() else {
                break;
            };

            let mut path = PathBuf::from(self.dir);
            path.push(file_name);

            if let Err(err) = fs::remove_file(&path) {
                self.metrics.file_delete_failed.increment();

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "failed to delete {path}: {err}",
                    #[emit::as_debug]
                    path,
                    err,
                );
            } else {
                self.metrics.file_delete.increment();

                emit::debug!(
                    rt: emit::runtime::internal(),
                    "deleted {path}",
                    #[emit::as_debug]
                    path,
                );
            }
        }
    }
}

struct ActiveFile {
    file: File,
    file_path: PathBuf,
    file_ts: String,
    file_needs_recovery: bool,
    file_size_bytes: usize,
}

impl ActiveFile {
    fn try_open_reuse(file_path: impl AsRef<Path>) -> Result<ActiveFile, io::Error> {
        let file_path = file_path.as_ref();

        let file_ts = read_file_path_ts(file_path)?.to_owned();

        let file = fs::OpenOptions::new()
            .read(false)
            .append(true)
            .open(file_path)?;

        let file_size_bytes = file.metadata()?.len() as usize;

        Ok(ActiveFile {
            file,
            file_ts,
            file_path: file_path.into(),
            // The file is in an unknown state
            file_needs_recovery: true,
            file_size_bytes,
        })
    }

    fn try_open_create(file_path: impl AsRef<Path>) -> Result<ActiveFile, io::Error> {
        let file_path = file_path.as_ref();

        let file_ts = read_file_path_ts(file_path)?.to_owned();

        let file = fs::OpenOptions::new()
            .create_new(true)
            .read(false)
            .append(true)
            .open(file_path)?;

        Ok(ActiveFile {
            file,
            file_ts,
            file_path: file_path.into(),
            file_needs_recovery: false,
            file_size_bytes: 0,
        })
    }

    fn write_event(&mut self, event_buf: &[u8], separator: &'static [u8]) -> Result<(), io::Error> {
        // Terminate any partially written content before appending
        if self.file_needs_recovery {
            self.file_size_bytes += separator.len();
            self.file.write_all(separator)?;
        }

        self.file_needs_recovery = true;

        self.file_size_bytes += event_buf.len();
        self.file.write_all(event_buf)?;

        self.file_needs_recovery = false;
        Ok(())
    }
}

fn dir_path(dir: &str) -> &str {
    if dir.is_empty() {
        "."
    } else {
        dir
    }
}

fn dir_prefix_ext(file_set: impl AsRef<Path>) -> Result<(String, String, String), Error> {
    let file_set = file_set.as_ref();

    let dir = if let Some(parent) = file_set.parent() {
        parent
            .to_str()
            .ok_or("paths must be valid UTF8")
            .map_err(Error::new)?
            .to_owned()
    } else {
        String::new()
    };

    let prefix = file_set
        .file_stem()
        .ok_or("paths must include a file name")
        .map_err(Error::new)?
        .to_str()
        .ok_or("paths must be valid UTF8")
        .map_err(Error::new)?
        .to_owned();

    let ext = if let Some(ext) = file_set.extension() {
        ext.to_str()
            .ok_or("paths must be valid UTF8")
            .map_err(Error::new)?
            .to_owned()
    } else {
        String::from("log")
    };

    Ok((dir, prefix, ext))
}

fn truncate(roll_by: RollBy, parts: Parts) -> Parts {
    let (hours, minutes) = match roll_by {
        RollBy::Day => (0, 0),
        RollBy::Hour => (parts.hours, 0),
        RollBy::Minute => (parts.hours, parts.minutes),
    };

    Parts {
        years: parts.years,
        months: parts.months,
        days: parts.days,
        hours,
        minutes,
        seconds: 0,
        nanos: 0,
    }
}

fn rolling_millis(roll_by: RollBy, ts: Timestamp, parts: Parts) -> u32 {
    Timestamp::from_parts(truncate(roll_by, parts))
        .and_then(|truncated| ts.duration_since(truncated))
        .unwrap_or(Duration::ZERO)
        .as_millis() as u32
}

fn rolling_id() -> u32 {
    rand::random()
}

fn file_ts(roll_by: RollBy, parts: Parts) -> String {
    match roll_by {
        RollBy::Day => format!(
            "{:>04}-{:>02}-{:>02}",
            parts.years, parts.months, parts.days,
        ),
        RollBy::Hour => format!(
            "{:>04}-{:>02}-{:>02}-{:>02}",
            parts.years, parts.months, parts.days, parts.hours,
        ),
        RollBy::Minute => format!(
            "{:>04}-{:>02}-{:>02}-{:>02}-{:>02}",
            parts.years, parts.months, parts.days, parts.hours, parts.minutes,
        ),
    }
}

fn file_id(rolling_millis: u32, rolling_id: u32) -> String {
    format!("{:0>8}.{:0>8x}", rolling_millis, rolling_id)
}

fn read_file_name_ts(file_name: &str) -> Result<&str, io::Error> {
    file_name.split('.').nth(1).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::Other,
            "could not determine timestamp from filename",
        )
    })
}

fn read_file_path_ts(path: &Path) -> Result<&str, io::Error> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unable to determine filename"))?
        .to_str()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "file names must be valid UTF8"))?;

    read_file_name_ts(file_name)
}

fn file_name(file_prefix: &str, file_ext: &str, ts: &str, id: &str) -> String {
    format!("{}.{}.{}.{}", file_prefix, ts, id, file_ext)
}
