//! Reloadable log sink.
//!
//! The tracing fmt layer writes through a [`LogSink`], which points either
//! at stderr or at a log file that config reloads can reopen in place.
//! The old file handle is closed before the new one is installed.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::{Arc, RwLock};

use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug)]
struct SinkState {
    file: Option<File>,
    prefix: String,
}

/// Swappable writer target shared between the subscriber and the
/// controller's config reload path.
#[derive(Clone, Debug)]
pub struct LogSink {
    state: Arc<RwLock<SinkState>>,
}

impl LogSink {
    /// Sink writing to stderr until a log file is configured.
    pub fn stderr() -> Self {
        Self {
            state: Arc::new(RwLock::new(SinkState { file: None, prefix: String::new() })),
        }
    }

    /// Reopen the sink against `path` (append, create) and install the
    /// given line prefix. An empty `path` switches back to stderr.
    ///
    /// The previous file handle is closed before the new one is opened;
    /// writes landing in between go to stderr.
    pub fn reopen(&self, path: &str, prefix: &str) -> io::Result<()> {
        let mut state = self.state.write().expect("log sink lock poisoned");

        // close the old file first, then open the new one
        state.file = None;
        state.prefix = prefix.to_string();

        if !path.is_empty() {
            state.file = Some(OpenOptions::new().create(true).append(true).open(path)?);
        }
        Ok(())
    }

    pub fn prefix(&self) -> String {
        self.state.read().expect("log sink lock poisoned").prefix.clone()
    }
}

pub struct SinkWriter {
    state: Arc<RwLock<SinkState>>,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.write().expect("log sink lock poisoned");
        let prefix = state.prefix.clone();
        match state.file.as_mut() {
            Some(f) => {
                if !prefix.is_empty() {
                    f.write_all(prefix.as_bytes())?;
                }
                f.write_all(buf)?;
                Ok(buf.len())
            }
            None => {
                let mut err = io::stderr().lock();
                if !prefix.is_empty() {
                    err.write_all(prefix.as_bytes())?;
                }
                err.write_all(buf)?;
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self.state.write().expect("log sink lock poisoned");
        match state.file.as_mut() {
            Some(f) => f.flush(),
            None => io::stderr().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter { state: Arc::clone(&self.state) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_reopen_writes_with_prefix() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("proxy.log");

        let sink = LogSink::stderr();
        sink.reopen(path.to_str().unwrap(), "blobpool: ").unwrap();

        let mut w = sink.make_writer();
        w.write_all(b"hello\n").unwrap();
        w.flush().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "blobpool: hello\n");
    }

    #[test]
    fn test_reopen_swaps_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = dir.path().join("a.log");
        let second = dir.path().join("b.log");

        let sink = LogSink::stderr();
        sink.reopen(first.to_str().unwrap(), "").unwrap();
        sink.make_writer().write_all(b"one\n").unwrap();

        sink.reopen(second.to_str().unwrap(), "").unwrap();
        sink.make_writer().write_all(b"two\n").unwrap();

        assert_eq!(fs::read_to_string(&first).unwrap(), "one\n");
        assert_eq!(fs::read_to_string(&second).unwrap(), "two\n");
    }

    #[test]
    fn test_empty_path_falls_back_to_stderr() {
        let sink = LogSink::stderr();
        sink.reopen("", "pfx: ").unwrap();
        assert_eq!(sink.prefix(), "pfx: ");
    }
}
