//! Destinations for captured output lines.

use async_trait::async_trait;
use std::sync::Arc;

/// Receives output one line at a time
///
/// Implementations may wait, which slows the producer of the lines down but
/// never drops a line.
#[async_trait]
pub trait LineSink: Send + Sync {
    /// Records one line, without its terminator
    async fn line(&self, line: String);
}

/// A sink shared between concurrent producers
pub type SharedSink = Arc<dyn LineSink>;

/// Turns one raw line into text
///
/// Strips a trailing `\n` and then a trailing `\r`. Every other byte is kept,
/// control characters included; invalid UTF-8 is replaced.
#[must_use]
pub fn split_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Sink keeping every line in memory
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Default)]
pub struct CollectingSink {
    lines: parking_lot::Mutex<Vec<String>>,
}

#[cfg(any(test, feature = "test-support"))]
impl CollectingSink {
    /// Creates an empty sink
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lines received so far
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl LineSink for CollectingSink {
    async fn line(&self, line: String) {
        self.lines.lock().push(line);
    }
}
