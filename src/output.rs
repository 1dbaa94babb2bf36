use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::{debug, warn};

/// JSON-lines sink: every record goes to stdout and, optionally, a file.
///
/// Each call writes one complete line under the lock, so concurrent writers
/// never interleave within a record.
pub struct OutputSink {
    stdout: bool,
    file: Mutex<Option<BufWriter<File>>>,
}

impl OutputSink {
    pub fn new(output_path: Option<&Path>) -> Result<Self> {
        let file = match output_path {
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("Failed to create output file: {}", path.display()))?;
                debug!("Writing records to {}", path.display());
                Some(BufWriter::new(file))
            }
            None => None,
        };

        Ok(Self {
            stdout: true,
            file: Mutex::new(file),
        })
    }

    #[cfg(test)]
    fn file_only(path: &Path) -> Result<Self> {
        let mut sink = Self::new(Some(path))?;
        sink.stdout = false;
        Ok(sink)
    }

    /// Serialize and record one value. Failures never reach the caller.
    pub fn write<T: Serialize>(&self, record: &T) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                debug!("Skipping unserializable record: {}", e);
                return;
            }
        };

        let mut file = self.file.lock();

        if self.stdout {
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout, "{}", line);
        }

        if let Some(writer) = file.as_mut() {
            if let Err(e) = writeln!(writer, "{}", line) {
                warn!("Failed to write record to output file: {}", e);
            }
        }
    }

    pub fn finish(&self) {
        if let Some(writer) = self.file.lock().as_mut() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush output file: {}", e);
            }
        }
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{FuzzOutcome, PacketMetadata, Endpoints};
    use std::sync::Arc;

    fn record(port: u16) -> PacketMetadata {
        PacketMetadata::http(
            Endpoints {
                timestamp: "2024-05-01T12:00:00Z".into(),
                src_ip: "10.0.0.1".into(),
                dst_ip: "10.0.0.2".into(),
                src_port: port,
                dst_port: 80,
            },
            None,
        )
    }

    #[test]
    fn test_writes_one_json_document_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");

        let sink = OutputSink::file_only(&path).unwrap();
        sink.write(&record(51000));
        sink.write(&FuzzOutcome::new("http://10.0.0.2/x".into(), "p".into(), 503, 7));
        sink.finish();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["protocol"], "HTTP");
        assert!(first.get("http").is_none());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["response"]["anomaly"], true);
    }

    #[test]
    fn test_concurrent_writes_stay_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let sink = Arc::new(OutputSink::file_only(&path).unwrap());

        let handles: Vec<_> = (0..4u16)
            .map(|t| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..50u16 {
                        sink.write(&record(t * 100 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        sink.finish();

        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed.len(), 200);
    }

    #[test]
    fn test_unwritable_path_is_an_error() {
        let result = OutputSink::new(Some(Path::new("/nonexistent/dir/out.jsonl")));
        assert!(result.is_err());
    }
}
