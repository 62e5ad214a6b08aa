//! Snapshot cache and the periodic reporter

use super::console::{Console, write_text};
use crate::core::types::Status;
use crate::error::{Error, Result};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often the reporter checks its stop flag between reports
const STOP_POLL: Duration = Duration::from_millis(50);

/// Latest result of one poll task
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub text: String,
    pub status: Status,
    pub timestamp: DateTime<Local>,
}

impl SnapshotEntry {
    pub fn new(text: String, status: Status) -> Self {
        Self {
            text,
            status,
            timestamp: Local::now(),
        }
    }
}

/// Snapshot cache keyed by sensor (or `sensor:instance`); iteration is sorted
pub type Snapshots = Arc<Mutex<BTreeMap<String, SnapshotEntry>>>;

/// Render one entry the way the reporter prints it
pub fn render(key: &str, entry: &SnapshotEntry) -> String {
    let mut out = format!(
        "[snapshot] {} ok={} time={}\n",
        key,
        entry.status.ok,
        entry.timestamp.format("%H:%M:%S")
    );
    if !entry.text.is_empty() {
        out.push_str(&entry.text);
        if !entry.text.ends_with('\n') {
            out.push('\n');
        }
    }
    if !entry.status.ok {
        out.push_str(&format!("  {}\n", entry.status.message));
    } else if entry.text.is_empty() {
        out.push_str("  (no output)\n");
    }
    out
}

/// Background printer of the snapshot cache
pub struct Reporter {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Reporter {
    pub fn spawn(period: Duration, snapshots: Snapshots, console: Arc<Console>) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("snapshot-reporter".to_string())
            .spawn(move || Self::report_loop(period, flag, snapshots, console))
            .map_err(|e| Error::Other(format!("Failed to spawn reporter thread: {}", e)))?;

        log::debug!("Snapshot reporter started ({} ms)", period.as_millis());
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    fn report_loop(
        period: Duration,
        shutdown: Arc<AtomicBool>,
        snapshots: Snapshots,
        console: Arc<Console>,
    ) {
        let mut next = Instant::now() + period;
        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now < next {
                thread::sleep(STOP_POLL.min(next - now));
                continue;
            }
            next += period;

            let copy = snapshots.lock().clone();
            if copy.is_empty() {
                continue;
            }
            let mut sink = console.lock();
            for (key, entry) in &copy {
                write_text(&mut **sink, &render(key, entry));
            }
        }
        log::debug!("Snapshot reporter exiting");
    }

    /// Signal the worker and wait for it
    pub fn stop(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| Error::ThreadPanic)?;
        }
        Ok(())
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
