//! Diagnostic log retained in memory, optionally persisted across restarts.
//!
//! [TeeLogger] sends every record that passes the env_logger filter both to
//! env_logger and to a [DiagnosticSink], normally a [RingLog]. The ring keeps
//! the last few KiB of log lines so they can be inspected after a detach or
//! a restart.
use log::{Log, Metadata, Record, SetLoggerError};
use std::{
    collections::VecDeque,
    fs,
    io::{self, ErrorKind},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// Default size of the retained log
pub const RING_CAPACITY: usize = 4096;

const FILE_MAGIC: &str = "usbip-bridge-log boot=";

/// Minimum time between two writes of the log file
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(1);

/// Destination for formatted log lines
pub trait DiagnosticSink: Send + Sync {
    fn append_line(&self, line: &str);

    /// Writes out anything still buffered.
    fn flush(&self) {}
}

struct Ring {
    buf: VecDeque<u8>,
    capacity: usize,
    boot_count: u32,
    file: Option<PathBuf>,
    persist_interval: Duration,
    last_persist: Option<Instant>,
    /// Lines appended since the file was last written
    dirty: bool,
}

impl Ring {
    fn push_line(&mut self, line: &str) {
        self.buf.extend(line.as_bytes());
        if !line.ends_with('\n') {
            self.buf.push_back(b'\n');
        }
        if self.buf.len() <= self.capacity {
            return;
        }
        let excess = self.buf.len() - self.capacity;
        self.buf.drain(..excess);
        // start at a line boundary unless only one line is left
        let newline = self.buf.iter().position(|&b| b == b'\n');
        if let Some(pos) = newline {
            if pos + 1 < self.buf.len() {
                self.buf.drain(..=pos);
            }
        }
    }

    fn contents(&self) -> String {
        let (front, back) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(self.buf.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn persist(&mut self) -> io::Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let mut data = format!("{}{}\n", FILE_MAGIC, self.boot_count);
        data.push_str(&self.contents());
        fs::write(path, data)?;
        self.dirty = false;
        self.last_persist = Some(Instant::now());
        Ok(())
    }

    fn persist_if_due(&mut self) -> io::Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        self.dirty = true;
        let due = self
            .last_persist
            .map_or(true, |at| at.elapsed() >= self.persist_interval);
        if due {
            self.persist()?;
        }
        Ok(())
    }
}

/// Fixed-size log of the most recent lines
pub struct RingLog {
    ring: Mutex<Ring>,
}

impl RingLog {
    /// An in-memory ring, starting at boot 1
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                buf: VecDeque::with_capacity(capacity),
                capacity,
                boot_count: 1,
                file: None,
                persist_interval: PERSIST_INTERVAL,
                last_persist: None,
                dirty: false,
            }),
        }
    }

    /// A ring persisted to `path`.
    ///
    /// Lines left by the previous run are kept and the boot count carried
    /// over and incremented. A missing or unrecognized file starts at boot 1.
    /// New lines reach the file at most once per [PERSIST_INTERVAL] and on
    /// [flush](DiagnosticSink::flush).
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> io::Result<Self> {
        let path = path.into();
        let (boot_count, previous) = match fs::read(&path) {
            Ok(bytes) => parse_file(&String::from_utf8_lossy(&bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => (None, String::new()),
            Err(err) => return Err(err),
        };

        let log = Self::new(capacity);
        {
            let mut ring = log.lock();
            ring.file = Some(path);
            match boot_count {
                Some(count) => {
                    for line in previous.lines() {
                        ring.push_line(line);
                    }
                    ring.boot_count = count.saturating_add(1);
                    let marker = format!("--- reboot, boot {} ---", ring.boot_count);
                    ring.push_line(&marker);
                }
                None => ring.push_line("--- boot 1 ---"),
            }
            ring.persist()?;
        }
        Ok(log)
    }

    pub fn with_persist_interval(self, interval: Duration) -> Self {
        self.lock().persist_interval = interval;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contents(&self) -> String {
        self.lock().contents()
    }

    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn boot_count(&self) -> u32 {
        self.lock().boot_count
    }

    pub fn clear(&self) {
        let mut ring = self.lock();
        ring.buf.clear();
        ring.persist().ok();
    }
}

impl DiagnosticSink for RingLog {
    fn append_line(&self, line: &str) {
        let mut ring = self.lock();
        ring.push_line(line);
        // a failed write cannot be logged from inside the logger
        ring.persist_if_due().ok();
    }

    fn flush(&self) {
        let mut ring = self.lock();
        if ring.dirty {
            ring.persist().ok();
        }
    }
}

impl Drop for RingLog {
    fn drop(&mut self) {
        self.flush();
    }
}

fn parse_file(data: &str) -> (Option<u32>, String) {
    let (first, rest) = data.split_once('\n').unwrap_or((data, ""));
    match first
        .strip_prefix(FILE_MAGIC)
        .and_then(|count| count.trim().parse().ok())
    {
        Some(count) => (Some(count), rest.to_string()),
        None => (None, String::new()),
    }
}

/// env_logger output plus a copy of every line to a [DiagnosticSink]
pub struct TeeLogger {
    inner: env_logger::Logger,
    sink: Arc<dyn DiagnosticSink>,
}

impl TeeLogger {
    pub fn new(inner: env_logger::Logger, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self { inner, sink }
    }
}

impl Log for TeeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.inner.matches(record) {
            return;
        }
        self.inner.log(record);
        self.sink.append_line(&format!(
            "[{} {}] {}",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {
        self.inner.flush();
        self.sink.flush();
    }
}

/// Installs a [TeeLogger] built from `builder` as the global logger.
pub fn install(
    builder: &mut env_logger::Builder,
    sink: Arc<dyn DiagnosticSink>,
) -> Result<(), SetLoggerError> {
    let inner = builder.build();
    let max_level = inner.filter();
    log::set_boxed_logger(Box::new(TeeLogger::new(inner, sink)))?;
    log::set_max_level(max_level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Level, LevelFilter};

    #[test]
    fn ring_drops_oldest_lines() {
        let ring = RingLog::new(16);
        ring.append_line("first");
        ring.append_line("second");
        ring.append_line("third");
        assert!(ring.len() <= 16);
        assert_eq!(ring.contents(), "second\nthird\n");
    }

    #[test]
    fn oversized_line_keeps_its_tail() {
        let ring = RingLog::new(8);
        ring.append_line("0123456789abc");
        assert_eq!(ring.contents(), "6789abc\n");
        assert_eq!(ring.len(), 8);
    }

    #[test]
    fn terminated_lines_are_not_doubled() {
        let ring = RingLog::new(RING_CAPACITY);
        ring.append_line("one\n");
        ring.append_line("two");
        assert_eq!(ring.contents(), "one\ntwo\n");
    }

    #[test]
    fn clear_empties_ring() {
        let ring = RingLog::new(RING_CAPACITY);
        ring.append_line("something");
        assert!(!ring.is_empty());
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.capacity(), RING_CAPACITY);
    }

    #[test]
    fn persisted_log_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");

        let ring = RingLog::open(&path, RING_CAPACITY).unwrap();
        assert_eq!(ring.boot_count(), 1);
        ring.append_line("device detached");
        drop(ring);

        let ring = RingLog::open(&path, RING_CAPACITY).unwrap();
        assert_eq!(ring.boot_count(), 2);
        let contents = ring.contents();
        assert!(contents.contains("device detached"));
        assert!(contents.ends_with("--- reboot, boot 2 ---\n"));

        let on_disk = fs::read_to_string(&path).unwrap();
        assert!(on_disk.starts_with("usbip-bridge-log boot=2\n"));
    }

    #[test]
    fn file_writes_are_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        let ring = RingLog::open(&path, RING_CAPACITY)
            .unwrap()
            .with_persist_interval(Duration::from_secs(3600));

        ring.append_line("urb 1");
        ring.append_line("urb 2");
        assert!(!fs::read_to_string(&path).unwrap().contains("urb"));

        ring.flush();
        let on_disk = fs::read_to_string(&path).unwrap();
        assert!(on_disk.ends_with("urb 1\nurb 2\n"));
    }

    #[test]
    fn zero_interval_writes_every_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        let ring = RingLog::open(&path, RING_CAPACITY)
            .unwrap()
            .with_persist_interval(Duration::ZERO);

        ring.append_line("detached");
        assert!(fs::read_to_string(&path).unwrap().ends_with("detached\n"));
    }

    #[test]
    fn unrecognized_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        fs::write(&path, "garbage\nmore garbage\n").unwrap();

        let ring = RingLog::open(&path, RING_CAPACITY).unwrap();
        assert_eq!(ring.boot_count(), 1);
        assert_eq!(ring.contents(), "--- boot 1 ---\n");
    }

    #[test]
    fn tee_copies_filtered_records() {
        let ring = Arc::new(RingLog::new(RING_CAPACITY));
        let inner = env_logger::Builder::new()
            .filter_level(LevelFilter::Info)
            .is_test(true)
            .build();
        let logger = TeeLogger::new(inner, ring.clone());

        logger.log(
            &Record::builder()
                .args(format_args!("import accepted"))
                .level(Level::Info)
                .target("usbip_bridge::host")
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("noisy detail"))
                .level(Level::Trace)
                .target("usbip_bridge::session")
                .build(),
        );

        assert_eq!(
            ring.contents(),
            "[INFO usbip_bridge::host] import accepted\n"
        );
    }
}
