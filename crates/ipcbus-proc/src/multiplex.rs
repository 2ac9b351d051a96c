//! Fan-out sinks
//!
//! [`Multiplexer`] duplicates every write to a list of sinks and
//! [`Recorder`] keeps the bytes in memory.

use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;

/// Boxed sink accepted by the multiplexer
pub type Sink = Box<dyn Write + Send>;

/// Sink duplicating writes to every underlying sink.
///
/// A failing sink does not stop delivery to the others; the first failure is
/// reported once every sink has been attempted.
#[derive(Default)]
pub struct Multiplexer {
    sinks: Vec<Sink>,
}

impl Multiplexer {
    /// Create an empty multiplexer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sink
    pub fn add(&mut self, sink: Sink) {
        self.sinks.push(sink);
    }

    /// Whether no sink is attached
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Number of attached sinks
    pub fn len(&self) -> usize {
        self.sinks.len()
    }
}

impl Write for Multiplexer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut first_error = None;
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.write_all(buf) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut first_error = None;
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.flush() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// In-memory sink; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Recorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the recorded bytes
    pub fn bytes(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }

    /// Recorded bytes decoded as UTF-8, invalid sequences replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }
}

impl Write for Recorder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
