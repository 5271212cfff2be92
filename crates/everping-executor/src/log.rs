//! Per-run log files under `{logs_dir}/{YYYYMMDD}/run_{id}.log`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use everping_core::RunId;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

use crate::truncate::{clip_line, MAX_LINE_CHARS};

const DAY_FORMAT: &str = "%Y%m%d";

/// Where the log of run `id`, claimed at `claimed_at`, lives.
pub fn log_path(logs_dir: &Path, id: RunId, claimed_at: DateTime<Utc>) -> PathBuf {
    logs_dir
        .join(claimed_at.format(DAY_FORMAT).to_string())
        .join(format!("run_{id}.log"))
}

#[derive(Debug, Clone, Copy)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn tag(self) -> &'static str {
        match self {
            Stream::Stdout => "out",
            Stream::Stderr => "err",
        }
    }
}

/// Append-only writer for one run's log.
pub struct RunLog {
    path: PathBuf,
    file: fs::File,
}

impl RunLog {
    /// Create the file (and its date directory) and write the header.
    pub async fn create(path: PathBuf, header: &[(&str, String)]) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut file = fs::File::create(&path).await?;
        let mut text = String::new();
        for (key, value) in header {
            text.push_str(&format!("# {key}: {value}\n"));
        }
        file.write_all(text.as_bytes()).await?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one output line, tagged with its stream.
    pub async fn line(&mut self, stream: Stream, line: &str) -> std::io::Result<()> {
        let line = clip_line(line, MAX_LINE_CHARS);
        self.file
            .write_all(format!("[{}] {line}\n", stream.tag()).as_bytes())
            .await
    }

    /// Append a note from everping itself (spawn errors, kill signals).
    pub async fn note(&mut self, text: &str) -> std::io::Result<()> {
        self.file.write_all(format!("# {text}\n").as_bytes()).await
    }

    /// Write the closing status line and flush.
    pub async fn close(mut self, status: &str) -> std::io::Result<()> {
        self.file
            .write_all(format!("# status: {status}\n").as_bytes())
            .await?;
        self.file.flush().await
    }
}

/// Remove date directories older than `retention_days` (0 keeps everything).
///
/// Only directories named `YYYYMMDD` are considered; anything else in the
/// logs directory is left alone. Returns how many directories were removed.
pub async fn prune_dirs(logs_dir: &Path, now: DateTime<Utc>, retention_days: u32) -> std::io::Result<usize> {
    if retention_days == 0 {
        return Ok(0);
    }
    let oldest_kept = now.date_naive() - chrono::Duration::days(i64::from(retention_days) - 1);

    let mut entries = match fs::read_dir(logs_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(day) = name
            .to_str()
            .and_then(|n| NaiveDate::parse_from_str(n, DAY_FORMAT).ok())
        else {
            continue;
        };
        if day >= oldest_kept || !entry.file_type().await?.is_dir() {
            continue;
        }
        match fs::remove_dir_all(entry.path()).await {
            Ok(()) => {
                debug!(dir = %entry.path().display(), "removed expired run logs");
                removed += 1;
            }
            Err(e) => warn!(dir = %entry.path().display(), "cannot remove expired run logs: {e}"),
        }
    }
    Ok(removed)
}
