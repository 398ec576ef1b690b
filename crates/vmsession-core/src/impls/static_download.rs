//! StaticDownloadProvider - 開発用のダウンロード
//!
//! Serves payloads registered in memory, plus `file://` URLs read from the
//! local filesystem. Data is delivered in fixed-size chunks so that the
//! progress sink sees intermediate values.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::domain::HvStatus;
use crate::fsm::lock;
use crate::ports::DownloadProvider;
use crate::progress::{ProgressTask, VariableTask};

const DEFAULT_CHUNK: usize = 64 * 1024;

pub struct StaticDownloadProvider {
    payloads: Mutex<HashMap<String, Vec<u8>>>,
    chunk_size: usize,
}

impl StaticDownloadProvider {
    pub fn new() -> Self {
        Self {
            payloads: Mutex::new(HashMap::new()),
            chunk_size: DEFAULT_CHUNK,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Serve `bytes` for `url`.
    pub fn insert(&self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        lock(&self.payloads).insert(url.into(), bytes.into());
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, HvStatus> {
        let cached = lock(&self.payloads).get(url).cloned();
        if let Some(bytes) = cached {
            return Ok(bytes);
        }
        match url.strip_prefix("file://") {
            Some(path) => tokio::fs::read(path).await.map_err(|e| {
                warn!(url, error = %e, "cannot read local payload");
                HvStatus::IoError
            }),
            None => Err(HvStatus::NotFound),
        }
    }

    fn report(sink: &Option<VariableTask>, done: usize) {
        if let Some(sink) = sink {
            sink.update(done as u64);
        }
    }
}

impl Default for StaticDownloadProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DownloadProvider for StaticDownloadProvider {
    async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        sink: Option<VariableTask>,
    ) -> Result<(), HvStatus> {
        let bytes = self.fetch(url).await?;
        if let Some(sink) = &sink {
            sink.set_max(bytes.len() as u64);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|_| HvStatus::IoError)?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|_| HvStatus::IoError)?;

        let mut done = 0;
        for chunk in bytes.chunks(self.chunk_size) {
            file.write_all(chunk).await.map_err(|_| HvStatus::IoError)?;
            done += chunk.len();
            Self::report(&sink, done);
            tokio::task::yield_now().await;
        }
        file.flush().await.map_err(|_| HvStatus::IoError)?;

        if let Some(sink) = &sink {
            sink.complete("Download completed");
        }
        debug!(url, dest = %dest.display(), bytes = done, "download finished");
        Ok(())
    }

    async fn download_text(&self, url: &str, sink: Option<VariableTask>) -> Result<String, HvStatus> {
        let bytes = self.fetch(url).await?;
        if let Some(sink) = &sink {
            sink.set_max(bytes.len() as u64);
        }
        let mut done = 0;
        for chunk in bytes.chunks(self.chunk_size) {
            done += chunk.len();
            Self::report(&sink, done);
        }
        if let Some(sink) = &sink {
            sink.complete("Download completed");
        }
        String::from_utf8(bytes).map_err(|_| HvStatus::NotValidated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn file_download_drives_the_sink() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("cache").join("boot.iso");
        let provider = StaticDownloadProvider::new().with_chunk_size(4);
        provider.insert("https://example.org/boot.iso", b"0123456789".to_vec());

        let sink = VariableTask::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let values = Arc::clone(&seen);
        sink.on_progress(move |value, _| values.lock().unwrap().push(value));

        provider
            .download_file("https://example.org/boot.iso", &dest, Some(sink.clone()))
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"0123456789");
        assert_eq!(sink.max(), 10);
        assert_eq!(sink.current(), 10);
        assert!(sink.is_completed());
        let seen = seen.lock().unwrap();
        assert!((seen[0] - 0.4).abs() < 1e-9);
        assert_eq!(seen.last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn missing_payload_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let provider = StaticDownloadProvider::new();
        let err = provider
            .download_file("https://example.org/none", &dir.path().join("x"), None)
            .await;
        assert_eq!(err, Err(HvStatus::NotFound));
    }

    #[tokio::test]
    async fn file_urls_are_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("notes.txt");
        tokio::fs::write(&src, "hello").await.unwrap();
        let provider = StaticDownloadProvider::new();

        let sink = VariableTask::new(0);
        let text = provider
            .download_text(&format!("file://{}", src.display()), Some(sink.clone()))
            .await
            .unwrap();
        assert_eq!(text, "hello");
        assert!(sink.is_completed());

        let missing = provider
            .download_text(&format!("file://{}", dir.path().join("gone").display()), None)
            .await;
        assert_eq!(missing, Err(HvStatus::IoError));
    }

    #[tokio::test]
    async fn binary_text_is_not_validated() {
        let provider = StaticDownloadProvider::new();
        provider.insert("mem://bin", vec![0xff, 0xfe]);
        assert_eq!(
            provider.download_text("mem://bin", None).await,
            Err(HvStatus::NotValidated)
        );
    }
}
