//! Archival sink: drains a run's live log into durable storage once the
//! run reaches a terminal state, and the `LogArchiver` bridge the
//! reconciliation `Controller` calls during its finalize step.
//!
//! Grounded on `tyger-dataplane::local::LocalStore`'s staging-then-rename
//! write path (write under `staging/`, `tokio::fs::rename` into place once
//! complete) — archival needs the same crash-safety: a partially written
//! `.gz` must never be visible at its final name.

use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::StreamExt;
use tracing::{info, instrument};

use tyger_core::engine::LogArchiver;
use tyger_core::error::{Result as TygerResult, TygerError};
use tyger_core::types::Run;

use crate::error::LogError;
use crate::source::{split_lines, LiveLogSource};

pub struct ArchiveResult {
    pub line_count: u64,
    pub path: PathBuf,
}

/// Writes a run's full log to `{root}/{run_id}-{lineCount}.gz`, gzip
/// compressed, via a staging file renamed into place on completion.
pub struct LocalArchiveSink {
    root: PathBuf,
}

impl LocalArchiveSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn final_path(&self, run_id: i64, line_count: u64) -> PathBuf {
        self.root.join(format!("{run_id}-{line_count}.gz"))
    }

    /// Consumes every line from `source` and writes it, gzip-compressed,
    /// to the run's archive file. Timestamps are always retained in the
    /// archive (filtering to the caller's preference happens at read time
    /// via `LogFilter`) so nothing is lost by archiving once.
    #[instrument(skip(self, source))]
    pub async fn archive(&self, run_id: i64, source: &dyn LiveLogSource) -> Result<ArchiveResult, LogError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let staging_dir = self.root.join("staging");
        tokio::fs::create_dir_all(&staging_dir).await?;
        let staging_path = staging_dir.join(format!("{run_id}.gz.tmp"));

        let bytes = source.open(None).await?;
        let lines = split_lines(bytes);
        tokio::pin!(lines);

        let mut plain = Vec::new();
        let mut line_count: u64 = 0;
        while let Some(line) = lines.next().await {
            let line = line?;
            plain.extend_from_slice(line.as_bytes());
            plain.push(b'\n');
            line_count += 1;
        }

        let staging_path_for_blocking = staging_path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
            use std::io::Write;
            let file = std::fs::File::create(&staging_path_for_blocking)?;
            let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            encoder.write_all(&plain)?;
            encoder.finish()?;
            Ok(())
        })
        .await
        .map_err(|e| LogError::Backend(e.to_string()))??;

        let final_path = self.final_path(run_id, line_count);
        tokio::fs::rename(&staging_path, &final_path).await?;
        info!(run_id, line_count, path = %final_path.display(), "archived run log");

        Ok(ArchiveResult { line_count, path: final_path })
    }

    /// Parses `{runId}-{lineCount}.gz` filenames already present under
    /// `root` to find the one belonging to `run_id`, for read-back.
    pub async fn find(&self, run_id: i64) -> Result<Option<(PathBuf, u64)>, LogError> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let prefix = format!("{run_id}-");
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix(&prefix) {
                if let Some(count) = crate::source::ArchiveSource::line_count_from_filename(rest) {
                    return Ok(Some((entry.path(), count)));
                }
            }
        }
        Ok(None)
    }
}

/// Bridges a backend's live log source and a [`LocalArchiveSink`] into the
/// `Controller`'s `LogArchiver` port, called exactly once per run as part
/// of `finalize_run` (spec.md §4.D step 5).
pub struct EngineLogArchiver<S> {
    source_for: S,
    sink: LocalArchiveSink,
}

impl<S, Fut> EngineLogArchiver<S>
where
    S: Fn(&Run) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = TygerResult<Box<dyn LiveLogSource>>> + Send,
{
    pub fn new(source_for: S, sink: LocalArchiveSink) -> Self {
        Self { source_for, sink }
    }
}

#[async_trait]
impl<S, Fut> LogArchiver for EngineLogArchiver<S>
where
    S: Fn(&Run) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = TygerResult<Box<dyn LiveLogSource>>> + Send,
{
    async fn archive(&self, run: &Run) -> TygerResult<()> {
        let source = (self.source_for)(run).await?;
        self.sink
            .archive(run.id, source.as_ref())
            .await
            .map_err(|e| TygerError::Fatal(anyhow::anyhow!(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;

    struct FixedSource(&'static str);

    #[async_trait]
    impl LiveLogSource for FixedSource {
        async fn open(&self, _since: Option<chrono::DateTime<chrono::Utc>>) -> Result<crate::source::ByteStream, LogError> {
            let body = self.0.as_bytes().to_vec();
            Ok(Box::pin(stream::once(async move { Ok(Bytes::from(body)) })))
        }
    }

    #[tokio::test]
    async fn archive_writes_gzip_file_named_with_line_count() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalArchiveSink::new(dir.path());
        let source = FixedSource("line one\nline two\nline three\n");

        let result = sink.archive(42, &source).await.unwrap();
        assert_eq!(result.line_count, 3);
        assert_eq!(result.path, dir.path().join("42-3.gz"));
        assert!(result.path.exists());

        let staging_dir = dir.path().join("staging");
        let remaining: Vec<_> = std::fs::read_dir(&staging_dir).unwrap().collect();
        assert!(remaining.is_empty(), "staging file should have been renamed away");
    }

    #[tokio::test]
    async fn find_locates_existing_archive_by_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalArchiveSink::new(dir.path());
        let source = FixedSource("only line\n");
        sink.archive(7, &source).await.unwrap();

        let found = sink.find(7).await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().1, 1);
        assert!(sink.find(999).await.unwrap().is_none());
    }
}
