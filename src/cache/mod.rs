use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::keys::ImageKey;

/// Name of the cache directory under the OS temp path. Kept identical to
/// the firmware's documentation so operators can find and wipe it.
pub const CACHE_DIR_NAME: &str = "python_matrix_reloaded_cache";

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Where image bytes land on disk.
pub fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join(CACHE_DIR_NAME)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Png,
    Gif,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Gif => "image/gif",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Gif => "gif",
        }
    }
}

/// A resolved image: the cached file and what it contains.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub path: PathBuf,
    pub content_type: ContentType,
    pub bytes_len: u64,
}

/// All error values are cloneable so one failed fetch can be broadcast to
/// every caller coalesced onto it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The CDN answered 403/404: the key does not exist and never will.
    #[error("image rejected by source (HTTP {0})")]
    Forbidden(u16),
    #[error("source returned HTTP {0}")]
    Status(u16),
    #[error("fetch failed: {0}")]
    Transport(String),
    #[error("cache I/O failed: {0}")]
    Io(String),
}

impl CacheError {
    /// Terminal failures mean the key should be banned, not retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Forbidden(_))
    }
}

/// Raw response from an image source.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Seam for the HTTP layer so tests can serve canned bytes.
#[async_trait]
pub trait FetchBackend: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedImage, CacheError>;
}

pub struct ReqwestFetchBackend {
    client: reqwest::Client,
}

impl ReqwestFetchBackend {
    pub fn new() -> Result<Self, CacheError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|err| CacheError::Transport(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FetchBackend for ReqwestFetchBackend {
    async fn fetch(&self, url: &Url) -> Result<FetchedImage, CacheError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| CacheError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|err| CacheError::Transport(err.to_string()))?;
        Ok(FetchedImage {
            status,
            content_type,
            bytes: bytes.to_vec(),
        })
    }
}

type FetchResult = Result<CacheHit, CacheError>;

enum Slot {
    Ready(CacheHit),
    Fetching(broadcast::Sender<FetchResult>),
}

/// Maps image keys to files on disk, fetching misses from the CDN with
/// at-most-one-fetch-per-key semantics: concurrent resolvers of the same
/// key coalesce onto the first caller's fetch.
pub struct ImageCache {
    dir: PathBuf,
    backend: Arc<dyn FetchBackend>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ImageCache {
    /// Create the cache directory if needed. Failure here is fatal to the
    /// process; the caller escalates.
    pub async fn new(dir: PathBuf, backend: Arc<dyn FetchBackend>) -> Result<Self, CacheError> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| CacheError::Io(format!("creating {}: {err}", dir.display())))?;
        Ok(Self {
            dir,
            backend,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve a key to its cached file, fetching it if necessary.
    pub async fn resolve(&self, key: &ImageKey) -> FetchResult {
        enum Claim {
            Hit(CacheHit),
            Wait(broadcast::Receiver<FetchResult>),
            Fetch,
        }

        let fingerprint = key.fingerprint();
        let claim = {
            let mut slots = self.slots.lock().await;
            match slots.get(&fingerprint) {
                Some(Slot::Ready(hit)) => Claim::Hit(hit.clone()),
                Some(Slot::Fetching(tx)) => Claim::Wait(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(8);
                    slots.insert(fingerprint.clone(), Slot::Fetching(tx));
                    Claim::Fetch
                }
            }
        };

        match claim {
            Claim::Hit(hit) => Ok(hit),
            Claim::Fetch => self.fetch_and_store(key, &fingerprint).await,
            Claim::Wait(mut rx) => match rx.recv().await {
                Ok(result) => result,
                // The fetching caller vanished without publishing; treat it
                // as a transport failure and let the controller decide.
                Err(_) => Err(CacheError::Transport("fetch abandoned".to_string())),
            },
        }
    }

    /// Forget everything and delete the directory. Only sound while no
    /// resolves are running; used for `--purge` at cold startup.
    pub async fn purge(&self) -> Result<(), CacheError> {
        self.slots.lock().await.clear();
        purge_dir(&self.dir).await
    }

    async fn fetch_and_store(&self, key: &ImageKey, fingerprint: &str) -> FetchResult {
        let result = self.fetch_to_disk(key, fingerprint).await;

        let mut slots = self.slots.lock().await;
        let waiters = match slots.remove(fingerprint) {
            Some(Slot::Fetching(tx)) => Some(tx),
            other => {
                // Only this caller writes the slot; anything else is a bug.
                debug_assert!(other.is_none());
                None
            }
        };
        if let Ok(hit) = &result {
            slots.insert(fingerprint.to_string(), Slot::Ready(hit.clone()));
        }
        drop(slots);

        if let Some(tx) = waiters {
            let _ = tx.send(result.clone());
        }
        result
    }

    async fn fetch_to_disk(&self, key: &ImageKey, fingerprint: &str) -> FetchResult {
        // A previous run may have left the file behind.
        for content_type in [ContentType::Png, ContentType::Gif] {
            let path = self.file_path(fingerprint, content_type);
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                if meta.is_file() && meta.len() > 0 {
                    return Ok(CacheHit {
                        path,
                        content_type,
                        bytes_len: meta.len(),
                    });
                }
            }
        }

        let url = key.source_url();
        debug!(url = %url, "fetching image");
        let fetched = self.backend.fetch(&url).await?;
        match fetched.status {
            200 => {}
            403 | 404 => {
                warn!(url = %url, status = fetched.status, "image not available at source");
                return Err(CacheError::Forbidden(fetched.status));
            }
            status => return Err(CacheError::Status(status)),
        }

        let content_type = sniff_content_type(fetched.content_type.as_deref(), &fetched.bytes);
        let path = self.file_path(fingerprint, content_type);
        let staging = self.dir.join(format!("{fingerprint}.tmp"));

        if let Err(err) = write_atomic(&staging, &path, &fetched.bytes).await {
            // Don't leave partial files behind, especially when cancelled.
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err);
        }

        Ok(CacheHit {
            path,
            content_type,
            bytes_len: fetched.bytes.len() as u64,
        })
    }

    fn file_path(&self, fingerprint: &str, content_type: ContentType) -> PathBuf {
        self.dir
            .join(format!("{fingerprint}.{}", content_type.extension()))
    }
}

/// Delete the cache directory recursively. Missing directory is success.
pub async fn purge_dir(dir: &Path) -> Result<(), CacheError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CacheError::Io(format!(
            "purging {}: {err}",
            dir.display()
        ))),
    }
}

async fn write_atomic(staging: &Path, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    tokio::fs::write(staging, bytes)
        .await
        .map_err(|err| CacheError::Io(err.to_string()))?;
    tokio::fs::rename(staging, path)
        .await
        .map_err(|err| CacheError::Io(err.to_string()))?;
    Ok(())
}

fn sniff_content_type(header: Option<&str>, bytes: &[u8]) -> ContentType {
    if let Some(header) = header {
        if header.contains("gif") {
            return ContentType::Gif;
        }
        if header.contains("png") {
            return ContentType::Png;
        }
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        ContentType::Gif
    } else {
        ContentType::Png
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n....";

    struct CountingBackend {
        calls: AtomicUsize,
        response: FetchedImage,
        delay: Duration,
    }

    impl CountingBackend {
        fn png() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: FetchedImage {
                    status: 200,
                    content_type: Some("image/png".to_string()),
                    bytes: PNG_MAGIC.to_vec(),
                },
                delay: Duration::from_millis(20),
            }
        }

        fn status(status: u16) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: FetchedImage {
                    status,
                    content_type: None,
                    bytes: Vec::new(),
                },
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl FetchBackend for CountingBackend {
        async fn fetch(&self, _url: &Url) -> Result<FetchedImage, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.response.clone())
        }
    }

    async fn cache_with(backend: Arc<CountingBackend>) -> (tempfile::TempDir, Arc<ImageCache>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path().join("cache"), backend)
            .await
            .unwrap();
        (dir, Arc::new(cache))
    }

    #[tokio::test]
    async fn resolve_writes_file_and_reports_content_type() {
        let backend = Arc::new(CountingBackend::png());
        let (_dir, cache) = cache_with(backend.clone()).await;

        let hit = cache.resolve(&ImageKey::twitch("25")).await.unwrap();
        assert_eq!(hit.content_type, ContentType::Png);
        assert!(hit.path.ends_with("twitch_25.png"));
        assert_eq!(
            tokio::fs::read(&hit.path).await.unwrap(),
            PNG_MAGIC.to_vec()
        );
        assert_eq!(hit.bytes_len, PNG_MAGIC.len() as u64);
    }

    #[tokio::test]
    async fn second_resolve_hits_memory_not_backend() {
        let backend = Arc::new(CountingBackend::png());
        let (_dir, cache) = cache_with(backend.clone()).await;

        cache.resolve(&ImageKey::twitch("25")).await.unwrap();
        cache.resolve(&ImageKey::twitch("25")).await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_resolves_coalesce_to_one_fetch() {
        let backend = Arc::new(CountingBackend::png());
        let (_dir, cache) = cache_with(backend.clone()).await;

        let key = ImageKey::twitch("25");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { cache.resolve(&key).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_found_is_terminal() {
        let backend = Arc::new(CountingBackend::status(404));
        let (_dir, cache) = cache_with(backend).await;

        let err = cache.resolve(&ImageKey::twitch("nope")).await.unwrap_err();
        assert_eq!(err, CacheError::Forbidden(404));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn server_error_is_not_terminal_and_retries_later() {
        let backend = Arc::new(CountingBackend::status(500));
        let (_dir, cache) = cache_with(backend.clone()).await;

        let err = cache.resolve(&ImageKey::twitch("25")).await.unwrap_err();
        assert_eq!(err, CacheError::Status(500));
        assert!(!err.is_terminal());
        // The failed slot was evicted, so another resolve fetches again.
        let _ = cache.resolve(&ImageKey::twitch("25")).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn existing_file_on_disk_short_circuits_fetch() {
        let backend = Arc::new(CountingBackend::png());
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        tokio::fs::create_dir_all(&cache_dir).await.unwrap();
        tokio::fs::write(cache_dir.join("twitch_25.gif"), b"GIF89a..")
            .await
            .unwrap();

        let cache = ImageCache::new(cache_dir, backend.clone()).await.unwrap();
        let hit = cache.resolve(&ImageKey::twitch("25")).await.unwrap();
        assert_eq!(hit.content_type, ContentType::Gif);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn purge_removes_directory_and_state() {
        let backend = Arc::new(CountingBackend::png());
        let (_dir, cache) = cache_with(backend.clone()).await;

        cache.resolve(&ImageKey::twitch("25")).await.unwrap();
        cache.purge().await.unwrap();
        assert!(!cache.dir().exists());
        // Purging twice is fine.
        cache.purge().await.unwrap();
    }

    #[test]
    fn gif_magic_wins_over_missing_header() {
        assert_eq!(sniff_content_type(None, b"GIF89a"), ContentType::Gif);
        assert_eq!(sniff_content_type(None, PNG_MAGIC), ContentType::Png);
        assert_eq!(
            sniff_content_type(Some("image/gif"), PNG_MAGIC),
            ContentType::Gif
        );
    }
}
