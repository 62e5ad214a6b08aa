//! Output lock shared by interactive dispatch and the background workers

use parking_lot::{Mutex, MutexGuard};
use std::io::{self, Write};
use std::sync::Arc;

type Sink = Box<dyn Write + Send>;

/// Serialized text output
///
/// Holding the guard from [`Console::lock`] keeps every other writer out,
/// which is how a poll's output stays in one piece while the operator types.
pub struct Console {
    sink: Mutex<Sink>,
}

impl Console {
    pub fn new(sink: Sink) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Take the output lock
    pub fn lock(&self) -> MutexGuard<'_, Sink> {
        self.sink.lock()
    }

    /// Print `text` under the lock, adding a trailing newline if missing
    pub fn print(&self, text: &str) {
        let mut sink = self.lock();
        write_text(&mut **sink, text);
    }
}

/// Write through an already held guard
pub fn write_text(sink: &mut dyn Write, text: &str) {
    if text.is_empty() {
        return;
    }
    let result = sink
        .write_all(text.as_bytes())
        .and_then(|_| {
            if text.ends_with('\n') {
                Ok(())
            } else {
                sink.write_all(b"\n")
            }
        })
        .and_then(|_| sink.flush());
    if let Err(e) = result {
        log::warn!("Console write failed: {}", e);
    }
}

/// In-memory sink whose contents can be read back
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
