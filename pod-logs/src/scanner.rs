use crate::classifier::Classifier;
use crate::level::Level;
use crate::line::LogLine;
use std::io::{self, BufRead};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// A forward-only cursor over a log stream.
pub struct LogScanner<R> {
    reader: R,
    classifier: Classifier,
    buf: Vec<u8>,
    error: Option<io::Error>,
}

impl<R: BufRead> LogScanner<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            classifier: Classifier::new(),
            buf: Vec::new(),
            error: None,
        }
    }

    /// The read error that ended the scan early, if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }
}

impl<R: BufRead> Iterator for LogScanner<R> {
    type Item = LogLine;

    fn next(&mut self) -> Option<LogLine> {
        if self.error.is_some() {
            return None;
        }
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&self.buf);
                    if let Some(entry) = self.classifier.classify(&line) {
                        return Some(entry);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.error = Some(err);
                    return None;
                }
            }
        }
    }
}

/// Async flavour of [`LogScanner`], used for follow-mode streams.
pub struct AsyncLogScanner<R> {
    reader: R,
    classifier: Classifier,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> AsyncLogScanner<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            classifier: Classifier::new(),
            buf: Vec::new(),
        }
    }

    /// `Ok(None)` once the stream is exhausted.
    pub async fn next_entry(&mut self) -> io::Result<Option<LogLine>> {
        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                return Ok(None);
            }
            let line = String::from_utf8_lossy(&self.buf);
            if let Some(entry) = self.classifier.classify(&line) {
                return Ok(Some(entry));
            }
        }
    }
}

/// Message of the last `ERROR` entry in the stream followed by its cause
/// chain, or an empty string.
pub fn last_error<R: BufRead>(reader: R) -> String {
    LogScanner::new(reader)
        .filter(|entry| entry.level == Level::Error)
        .last()
        .map(|entry| entry.full_message())
        .unwrap_or_default()
}
