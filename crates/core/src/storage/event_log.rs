use crate::events::{Event, EventLog};
use crate::types::ExecutionId;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const DEFAULT_FLUSH_THRESHOLD: usize = 100;

/// Append-only event log made of gzip-compressed JSONL segments
///
/// Layout: `<base>/<execution_id>/<segment>.jsonl.gz`. Events are buffered per
/// execution and each flush writes a new segment, so existing files are never
/// rewritten.
pub struct JsonlEventLog {
    base_path: PathBuf,
    flush_threshold: usize,
    buffers: Mutex<HashMap<ExecutionId, Vec<Event>>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            buffers: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold.max(1);
        self
    }

    fn execution_dir(&self, execution_id: &ExecutionId) -> PathBuf {
        self.base_path.join(execution_id.to_string())
    }

    /// Write buffered events of one execution as a new segment
    pub async fn flush(&self, execution_id: &ExecutionId) -> Result<()> {
        let events = {
            let mut buffers = self.buffers.lock().await;
            match buffers.remove(execution_id) {
                Some(events) if !events.is_empty() => events,
                _ => return Ok(()),
            }
        };

        let dir = self.execution_dir(execution_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .context("Failed to create execution log directory")?;

        let next_segment = self.segments(&dir).await?.len();
        let path = dir.join(format!("{:06}.jsonl.gz", next_segment));
        write_segment(&path, &events).await
    }

    /// Write every buffered execution to disk
    pub async fn flush_all(&self) -> Result<()> {
        let pending: Vec<ExecutionId> = self.buffers.lock().await.keys().copied().collect();
        for execution_id in pending {
            self.flush(&execution_id).await?;
        }
        Ok(())
    }

    async fn segments(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut segments = Vec::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .context("Failed to read execution log directory")?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("Failed to read log segment entry")?
        {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".jsonl.gz"))
            {
                segments.push(path);
            }
        }
        segments.sort();
        Ok(segments)
    }
}

async fn write_segment(path: &Path, events: &[Event]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }
    let compressed = encoder.finish().context("Failed to finish compression")?;

    tokio::fs::write(path, compressed)
        .await
        .context("Failed to write event log segment")
}

async fn read_segment(path: &Path) -> Result<Vec<Event>> {
    let compressed = tokio::fs::read(path)
        .await
        .context("Failed to open event log segment")?;
    let reader = std::io::BufReader::new(GzDecoder::new(compressed.as_slice()));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line).context("Failed to parse event")?);
    }
    Ok(events)
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let execution_id = event.execution_id;
        let should_flush = {
            let mut buffers = self.buffers.lock().await;
            let buffer = buffers.entry(execution_id).or_default();
            buffer.push(event);
            buffer.len() >= self.flush_threshold
        };

        if should_flush {
            self.flush(&execution_id).await?;
        }
        Ok(())
    }

    async fn get_execution_events(&self, execution_id: ExecutionId) -> Result<Vec<Event>> {
        self.flush(&execution_id).await?;

        let mut events = Vec::new();
        for segment in self.segments(&self.execution_dir(&execution_id)).await? {
            events.extend(read_segment(&segment).await?);
        }
        Ok(events)
    }
}
