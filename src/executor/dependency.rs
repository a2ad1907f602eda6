//! Artifact dependencies of launched tasks
//!
//! The [`DependencyCache`] remembers the timestamp of every artifact it has
//! fetched and only fetches again when a task asks for a strictly newer
//! version. Fetched code artifacts are appended to the shared search path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};

use super::task::ArtifactSet;

// ─────────────────────────────────────────────────────────────────
// Collaborators
// ─────────────────────────────────────────────────────────────────

/// Retrieves one artifact into a directory
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Fetch `name` at version `timestamp` into `dest_dir` and return the local path
    async fn fetch(
        &self,
        name: &str,
        dest_dir: &Path,
        timestamp: i64,
        use_cache: bool,
    ) -> Result<PathBuf>;
}

/// Additional search path entries supplied by the embedding process
pub trait ExtraClasspathProvider: Send + Sync {
    fn extra_paths(&self) -> Vec<PathBuf>;
}

// ─────────────────────────────────────────────────────────────────
// Search Path
// ─────────────────────────────────────────────────────────────────

/// Ordered code search path shared by all tasks of the executor
#[derive(Debug, Default)]
struct SearchPath {
    /// Configured entries and fetched jars, in insertion order
    user: Vec<PathBuf>,
}

impl SearchPath {
    /// Append unless the location is already present
    fn add(&mut self, location: PathBuf) -> bool {
        if self.user.contains(&location) {
            return false;
        }
        self.user.push(location);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ArtifactKind {
    File,
    Jar,
}

/// What a reconcile pass changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub fetched: Vec<String>,
    pub added_to_search_path: Vec<PathBuf>,
}

// ─────────────────────────────────────────────────────────────────
// Dependency Cache
// ─────────────────────────────────────────────────────────────────

/// Timestamp-versioned cache of fetched artifacts
pub struct DependencyCache {
    fetcher: Arc<dyn ArtifactFetcher>,
    work_dir: PathBuf,
    use_cache: bool,
    user_first: bool,
    extra: Option<Arc<dyn ExtraClasspathProvider>>,
    timestamps: Mutex<HashMap<(ArtifactKind, String), i64>>,
    fetch_locks: Mutex<HashMap<(ArtifactKind, String), Arc<tokio::sync::Mutex<()>>>>,
    search_path: RwLock<SearchPath>,
}

impl DependencyCache {
    pub fn new(fetcher: Arc<dyn ArtifactFetcher>, work_dir: PathBuf) -> Self {
        Self {
            fetcher,
            work_dir,
            use_cache: true,
            user_first: false,
            extra: None,
            timestamps: Mutex::new(HashMap::new()),
            fetch_locks: Mutex::new(HashMap::new()),
            search_path: RwLock::new(SearchPath::default()),
        }
    }

    pub fn use_fetch_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Put user entries ahead of the extra classpath
    pub fn user_classpath_first(mut self, user_first: bool) -> Self {
        self.user_first = user_first;
        self
    }

    /// Entries that are on the search path before anything is fetched
    pub fn with_user_class_path(self, entries: Vec<PathBuf>) -> Self {
        {
            let mut search_path = self.search_path.write();
            for entry in entries {
                search_path.add(entry);
            }
        }
        self
    }

    pub fn with_extra_classpath(mut self, provider: Arc<dyn ExtraClasspathProvider>) -> Self {
        self.extra = Some(provider);
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Bring the cache up to date with the artifacts a task needs.
    ///
    /// Artifacts whose timestamp is not newer than the cached one are
    /// skipped. The first fetch error is returned and leaves that
    /// artifact's cached timestamp untouched.
    pub async fn reconcile(&self, artifacts: &ArtifactSet) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for (name, timestamp) in &artifacts.files {
            self.reconcile_one(ArtifactKind::File, name, *timestamp, &mut report)
                .await?;
        }
        for (name, timestamp) in &artifacts.jars {
            self.reconcile_one(ArtifactKind::Jar, name, *timestamp, &mut report)
                .await?;
        }

        Ok(report)
    }

    async fn reconcile_one(
        &self,
        kind: ArtifactKind,
        name: &str,
        timestamp: i64,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let key = (kind, name.to_string());

        // Check, fetch and update happen under the artifact's own lock
        let lock = self
            .fetch_locks
            .lock()
            .entry(key.clone())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let cached = self.timestamps.lock().get(&key).copied();
        if cached.is_some_and(|cached| timestamp <= cached) {
            debug!(artifact = %name, timestamp, ?cached, "Artifact up to date");
            return Ok(());
        }

        info!(artifact = %name, timestamp, ?kind, "Fetching artifact");
        let path = self
            .fetcher
            .fetch(name, &self.work_dir, timestamp, self.use_cache)
            .await?;
        self.timestamps.lock().insert(key, timestamp);
        report.fetched.push(name.to_string());

        if kind == ArtifactKind::Jar {
            let location = tokio::fs::canonicalize(&path).await.unwrap_or(path);
            if self.search_path.write().add(location.clone()) {
                info!(location = %location.display(), "Added artifact to search path");
                report.added_to_search_path.push(location);
            }
        }

        Ok(())
    }

    pub fn file_timestamp(&self, name: &str) -> Option<i64> {
        self.timestamps
            .lock()
            .get(&(ArtifactKind::File, name.to_string()))
            .copied()
    }

    pub fn jar_timestamp(&self, name: &str) -> Option<i64> {
        self.timestamps
            .lock()
            .get(&(ArtifactKind::Jar, name.to_string()))
            .copied()
    }

    /// Current search path in lookup order
    pub fn search_path(&self) -> Vec<PathBuf> {
        let user = self.search_path.read().user.clone();
        let extra = self
            .extra
            .as_ref()
            .map(|provider| provider.extra_paths())
            .unwrap_or_default();

        if self.user_first {
            user.into_iter().chain(extra).collect()
        } else {
            extra.into_iter().chain(user).collect()
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// URL Fetcher
// ─────────────────────────────────────────────────────────────────

enum Source {
    Remote(Url),
    Local(PathBuf),
}

fn parse_source(name: &str) -> Result<Source> {
    match Url::parse(name) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => Ok(Source::Remote(url)),
        Ok(url) if url.scheme() == "file" => url
            .to_file_path()
            .map(Source::Local)
            .map_err(|_| Error::dependency_fetch(name, "invalid file URL")),
        Ok(url) => Err(Error::dependency_fetch(
            name,
            format!("unsupported scheme '{}'", url.scheme()),
        )),
        Err(_) => Ok(Source::Local(PathBuf::from(name))),
    }
}

/// Local file name an artifact is stored under
pub fn artifact_file_name(name: &str) -> Result<String> {
    let trimmed = name.split(['?', '#']).next().unwrap_or(name);
    trimmed
        .rsplit(['/', '\\'])
        .next()
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(str::to_string)
        .ok_or_else(|| Error::dependency_fetch(name, "cannot derive a file name"))
}

/// Name of the shared cache entry for one version of a remote artifact
pub fn cache_file_name(url: &str, timestamp: i64) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    format!("{}_{}_cache", &digest[..16], timestamp)
}

/// Fetches `http(s)://` artifacts with reqwest and local ones from disk
pub struct UrlFetcher {
    client: reqwest::Client,
    cache_dir: PathBuf,
}

impl UrlFetcher {
    pub fn new(cache_dir: PathBuf, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, cache_dir })
    }

    async fn download(&self, name: &str, url: &Url, dest: &Path) -> Result<()> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::dependency_fetch(name, format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::dependency_fetch(
                name,
                format!("HTTP error: {}", response.status()),
            ));
        }

        let mut partial = dest.as_os_str().to_owned();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        let mut file = tokio::fs::File::create(&partial).await.map_err(|e| Error::IoWrite {
            path: partial.clone(),
            source: e,
        })?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::dependency_fetch(name, format!("failed to read body: {}", e)))?
        {
            file.write_all(&chunk).await.map_err(|e| Error::IoWrite {
                path: partial.clone(),
                source: e,
            })?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, dest).await.map_err(|e| Error::IoWrite {
            path: dest.to_path_buf(),
            source: e,
        })?;

        info!(artifact = %name, path = %dest.display(), size_bytes = written, "Artifact downloaded");
        Ok(())
    }
}

async fn copy_artifact(name: &str, from: &Path, to: &Path) -> Result<()> {
    let same = match (
        tokio::fs::canonicalize(from).await,
        tokio::fs::canonicalize(to).await,
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if same {
        return Ok(());
    }

    tokio::fs::copy(from, to)
        .await
        .map_err(|e| Error::dependency_fetch(name, format!("copy from {}: {}", from.display(), e)))?;
    Ok(())
}

#[async_trait]
impl ArtifactFetcher for UrlFetcher {
    async fn fetch(
        &self,
        name: &str,
        dest_dir: &Path,
        timestamp: i64,
        use_cache: bool,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| Error::IoWrite {
                path: dest_dir.to_path_buf(),
                source: e,
            })?;
        let dest = dest_dir.join(artifact_file_name(name)?);

        match parse_source(name)? {
            Source::Local(path) => copy_artifact(name, &path, &dest).await?,
            Source::Remote(url) if use_cache => {
                tokio::fs::create_dir_all(&self.cache_dir)
                    .await
                    .map_err(|e| Error::IoWrite {
                        path: self.cache_dir.clone(),
                        source: e,
                    })?;
                let cached = self.cache_dir.join(cache_file_name(name, timestamp));
                if tokio::fs::metadata(&cached).await.is_err() {
                    self.download(name, &url, &cached).await?;
                } else {
                    debug!(artifact = %name, cache = %cached.display(), "Using cached artifact");
                }
                copy_artifact(name, &cached, &dest).await?;
            }
            Source::Remote(url) => self.download(name, &url, &dest).await?,
        }

        Ok(dest)
    }
}
