//! Where new binaries come from.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use futures::future::{BoxFuture, FutureExt};

pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

/// Source of candidate binaries, polled by the supervisor no faster than the configured minimum
/// fetch interval.
///
/// Errors are logged and treated as "no update this cycle".
pub trait Fetcher: Send + 'static {
    /// Runs once before the first fetch. An error disables fetching for this supervisor.
    fn init(&mut self) -> BoxFuture<'_, Result<(), FetchError>> {
        async { Ok(()) }.boxed()
    }

    /// The bytes of a candidate binary, or `None` when there is nothing new.
    fn fetch(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, FetchError>>;
}

/// Watches a file on disk, returning its contents whenever its modification time or size
/// changes.
#[derive(Debug)]
pub struct FileFetcher {
    path: PathBuf,
    last_seen: Option<(SystemTime, u64)>,
}

impl FileFetcher {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            last_seen: None,
        }
    }
}

impl Fetcher for FileFetcher {
    fn init(&mut self) -> BoxFuture<'_, Result<(), FetchError>> {
        async move {
            if self.path.as_os_str().is_empty() {
                return Err("file fetcher needs a path".into());
            }
            Ok(())
        }
        .boxed()
    }

    fn fetch(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, FetchError>> {
        async move {
            let meta = match tokio::fs::metadata(&self.path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let seen = (meta.modified()?, meta.len());
            if self.last_seen == Some(seen) {
                return Ok(None);
            }
            let bytes = tokio::fs::read(&self.path).await?;
            self.last_seen = Some(seen);
            Ok(Some(bytes))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn file_fetcher_reports_changes_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("next");
        let mut fetcher = FileFetcher::new(&path);
        fetcher.init().await.unwrap();

        assert_eq!(fetcher.fetch().await.unwrap(), None);

        std::fs::write(&path, b"v1").unwrap();
        assert_eq!(fetcher.fetch().await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(fetcher.fetch().await.unwrap(), None);

        // coarse mtime clocks need a moment, the size change is what we rely on here
        tokio::time::sleep(Duration::from_millis(10)).await;
        std::fs::write(&path, b"v2-longer").unwrap();
        assert_eq!(fetcher.fetch().await.unwrap(), Some(b"v2-longer".to_vec()));
    }

    #[tokio::test]
    async fn empty_path_fails_init() {
        let mut fetcher = FileFetcher::new("");
        assert!(fetcher.init().await.is_err());
    }
}
