//! Stream pipe
//!
//! A background worker copying bytes from one source to one sink until the
//! source ends, the pipe is closed or an I/O operation fails.

use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Default copy buffer size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Byte copy worker between a source and a sink
pub struct Pipe {
    name: String,
    worker: Mutex<Option<JoinHandle<()>>>,
    interrupted: Arc<AtomicBool>,
}

impl Pipe {
    /// Start copying `source` into `sink`
    pub fn new<R, W>(name: impl Into<String>, source: R, sink: W) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::with_buffer_size(name, source, sink, DEFAULT_BUFFER_SIZE)
    }

    /// Start copying with a custom buffer size
    pub fn with_buffer_size<R, W>(
        name: impl Into<String>,
        mut source: R,
        mut sink: W,
        buffer_size: usize,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let name = name.into();
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();
        let label = name.clone();
        let worker = thread::Builder::new().name(name.clone()).spawn(move || {
            let mut buffer = vec![0u8; buffer_size.max(1)];
            while !flag.load(Ordering::SeqCst) {
                let len = match source.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(len) => len,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!("{}: read failed: {}", label, e);
                        break;
                    }
                };
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = sink.write_all(&buffer[..len]).and_then(|_| sink.flush()) {
                    tracing::warn!("{}: write failed: {}", label, e);
                    break;
                }
            }
        })?;

        Ok(Self {
            name,
            worker: Mutex::new(Some(worker)),
            interrupted,
        })
    }

    /// Name of the worker thread
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker has stopped
    pub fn is_finished(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(true, |worker| worker.is_finished())
    }

    /// Block until the source is drained, then release the worker
    pub fn wait_for(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::warn!("{}: worker panicked", self.name);
            }
        }
        self.close();
    }

    /// Ask the worker to stop after its current read.
    ///
    /// The source and sink are left open; they are released when the worker
    /// returns.
    pub fn close(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.worker.lock().take();
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplex::Recorder;
    use std::io::Cursor;

    #[test]
    fn test_copies_until_eof() {
        let recorder = Recorder::new();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let pipe = Pipe::with_buffer_size("copy", Cursor::new(data.clone()), recorder.clone(), 64)
            .unwrap();
        pipe.wait_for();
        assert!(pipe.is_finished());
        assert_eq!(recorder.bytes(), data);
    }

    #[cfg(unix)]
    #[test]
    fn test_close_is_cooperative() {
        let (reader, writer) = std::os::unix::net::UnixStream::pair().unwrap();
        let recorder = Recorder::new();
        let pipe = Pipe::new("slow", reader, recorder.clone()).unwrap();

        pipe.close();
        pipe.close();
        // The pending read completes, its bytes are discarded.
        (&writer).write_all(b"late").unwrap();
        drop(writer);
        thread::sleep(std::time::Duration::from_millis(100));
        assert!(recorder.bytes().is_empty());
    }
}
