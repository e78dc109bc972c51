// Optional per-session capture of every message in and out, for debugging.
//
// Capture is never on the hot path: the session hands lines to a channel and
// a background task does the file I/O.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use mapsync_common::types::{ClientId, DocumentId};
use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::lease::InstanceIdentity;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrafficEntry {
    Incoming { from: ClientId, message: Value },
    Reply { to: ClientId, message: Value },
    Broadcast { message: Value },
}

pub trait TrafficSink: Send {
    fn record(&mut self, entry: TrafficEntry);
}

#[derive(Serialize)]
struct LogLine<'a> {
    at: DateTime<Utc>,
    #[serde(flatten)]
    entry: &'a TrafficEntry,
}

/// Traffic log directory for one process run:
/// `{dir}/{host}_{date}_{run_id}/`, one file per session.
#[derive(Debug, Clone)]
pub struct TrafficLog {
    run_dir: PathBuf,
}

impl TrafficLog {
    pub fn new(dir: impl AsRef<Path>, identity: &InstanceIdentity) -> Self {
        let host: String = identity
            .host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '-' })
            .collect();
        let run_dir = dir.as_ref().join(format!(
            "{host}_{}_{}",
            Utc::now().format("%Y-%m-%d"),
            identity.run_id
        ));
        Self { run_dir }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Start a sink for one session. Must be called inside a tokio runtime.
    pub fn open(&self, document_id: DocumentId) -> FileTrafficSink {
        let file_name = format!("{document_id}_{}.log", Utc::now().format("%H%M%S%.3f"));
        FileTrafficSink::spawn(self.run_dir.join(file_name))
    }
}

/// Appends one JSON object per line to a file.
pub struct FileTrafficSink {
    path: PathBuf,
    lines: mpsc::UnboundedSender<String>,
    writer: JoinHandle<io::Result<()>>,
}

impl FileTrafficSink {
    pub fn spawn(path: PathBuf) -> Self {
        let (lines, receiver) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_lines(path.clone(), receiver));
        Self { path, lines, writer }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting entries and wait until everything queued is on disk.
    pub async fn finish(self) -> io::Result<()> {
        let Self { lines, writer, .. } = self;
        drop(lines);
        writer.await.map_err(io::Error::other)?
    }
}

impl TrafficSink for FileTrafficSink {
    fn record(&mut self, entry: TrafficEntry) {
        let line = match serde_json::to_string(&LogLine { at: Utc::now(), entry: &entry }) {
            Ok(line) => line,
            Err(error) => {
                warn!(error = %error, "could not encode traffic entry");
                return;
            }
        };
        // The writer only goes away after an I/O error it has already logged.
        let _ = self.lines.send(line);
    }
}

async fn write_lines(path: PathBuf, mut lines: mpsc::UnboundedReceiver<String>) -> io::Result<()> {
    let result = async {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = BufWriter::new(
            fs::OpenOptions::new().create(true).append(true).open(&path).await?,
        );

        while let Some(line) = lines.recv().await {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            while let Ok(line) = lines.try_recv() {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
            }
            file.flush().await?;
        }
        Ok(())
    }
    .await;

    if let Err(error) = &result {
        warn!(path = %path.display(), error = %error, "traffic log disabled after write failure");
    }
    result
}
