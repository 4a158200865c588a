//! Droplet staging: fetch, verify, cache and unpack application bits.
//!
//! An archive is resolved in order of preference:
//!
//! 1. the local cache under `staged/`,
//! 2. a copy of the control plane's shared file, when visible,
//! 3. an HTTP download verified against the expected SHA-1.
//!
//! All staging on a node is serialized by one lock, so two instances of the
//! same droplet never download the archive twice.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dea_id::InstanceId;
use flate2::read::GzDecoder;
use futures_util::StreamExt;
use reqwest::Client;
use sha1::{Digest, Sha1};
use tar::Archive;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::droplet::DropletInstance;
use crate::runtimes::RuntimeRegistry;

/// Token in a droplet's `startup` script replaced by the runtime executable.
pub const RUNTIME_PLACEHOLDER: &str = "%VCAP_LOCAL_RUNTIME%";

/// Errors from staging.
#[derive(Debug, Error)]
pub enum StagerError {
    #[error("runtime '{0}' is not supported on this node")]
    UnsupportedRuntime(String),

    #[error("'{0}' is not a SHA-1 digest")]
    InvalidDigest(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("download from {uri} failed with status {status}")]
    DownloadStatus { uri: String, status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unpack task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result of a stage attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The instance directory is ready. `cached` is true if the archive
    /// was already in the local cache.
    Staged { cached: bool },
    /// The instance was asked to stop before staging finished.
    Cancelled,
}

/// Stager configuration.
#[derive(Debug, Clone)]
pub struct StagerConfig {
    pub staged_dir: PathBuf,
    pub apps_dir: PathBuf,
    pub db_dir: PathBuf,
    /// Always download, even when the shared file is visible.
    pub force_http_sharing: bool,
    pub disable_dir_cleanup: bool,
}

impl From<&Config> for StagerConfig {
    fn from(config: &Config) -> Self {
        Self {
            staged_dir: config.staged_dir(),
            apps_dir: config.apps_dir(),
            db_dir: config.db_dir(),
            force_http_sharing: config.force_http_sharing,
            disable_dir_cleanup: config.disable_dir_cleanup,
        }
    }
}

pub struct Stager {
    config: StagerConfig,
    runtimes: Arc<RuntimeRegistry>,
    client: Client,
    lock: Mutex<()>,
    downloads: AtomicU64,
    cache_hits: AtomicU64,
}

impl Stager {
    pub fn new(config: StagerConfig, runtimes: Arc<RuntimeRegistry>) -> Result<Self, StagerError> {
        let client = Client::builder()
            .user_agent(concat!("dea/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            config,
            runtimes,
            client,
            lock: Mutex::new(()),
            downloads: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &StagerConfig {
        &self.config
    }

    pub fn runtimes(&self) -> &RuntimeRegistry {
        &self.runtimes
    }

    pub fn runtime_supported(&self, name: &str) -> bool {
        self.runtimes.runtime_supported(name)
    }

    /// Create the `staged`, `apps` and `db` directories.
    pub fn create_directories(&self) -> Result<(), StagerError> {
        for dir in [
            &self.config.staged_dir,
            &self.config.apps_dir,
            &self.config.db_dir,
        ] {
            fs::create_dir_all(dir).map_err(|source| StagerError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// `apps/<name>-<index>-<instance_id>`.
    pub fn instance_dir(&self, name: &str, index: u32, instance_id: InstanceId) -> PathBuf {
        self.config
            .apps_dir
            .join(instance_dir_name(name, index, instance_id))
    }

    /// Cache location of the archive with this digest.
    pub fn tgz_path(&self, sha1: &str) -> PathBuf {
        self.config.staged_dir.join(format!("{sha1}.tgz"))
    }

    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Stage `instance`'s application into its directory.
    ///
    /// The instance's `stop_requested` flag is checked before fetching and
    /// before unpacking. On an integrity or unpack failure the instance
    /// directory is not left behind.
    pub async fn stage_app_directory(
        &self,
        bits_file: Option<&Path>,
        bits_uri: &str,
        sha1: &str,
        tgz_file: &Path,
        instance: &DropletInstance,
    ) -> Result<StageOutcome, StagerError> {
        if !is_sha1_digest(sha1) {
            return Err(StagerError::InvalidDigest(sha1.to_string()));
        }
        let (runtime, dir) = {
            let data = instance.read();
            (data.properties.runtime.clone(), data.properties.dir.clone())
        };
        let runtime_path = match self.runtimes.get(&runtime) {
            Some(r) if r.enabled => r.executable_path(),
            _ => return Err(StagerError::UnsupportedRuntime(runtime)),
        };

        let _guard = self.lock.lock().await;

        if stop_requested(instance) {
            debug!(instance_id = %instance.instance_id(), "Stop requested before fetch");
            return Ok(StageOutcome::Cancelled);
        }

        let cached = self.fetch_archive(bits_file, bits_uri, sha1, tgz_file).await?;

        if stop_requested(instance) {
            debug!(instance_id = %instance.instance_id(), "Stop requested before unpack");
            return Ok(StageOutcome::Cancelled);
        }

        let started = Instant::now();
        fs::create_dir_all(&dir).map_err(|source| StagerError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let intermediate = self
            .config
            .staged_dir
            .join(format!("{}.tar", instance.instance_id()));
        let unpack = {
            let tgz = tgz_file.to_path_buf();
            let dest = dir.clone();
            tokio::task::spawn_blocking(move || unpack_droplet(&tgz, &intermediate, &dest)).await?
        };
        if let Err(e) = unpack.and_then(|()| bind_local_runtime(&dir, &runtime_path)) {
            warn!(
                instance_id = %instance.instance_id(),
                dir = %dir.display(),
                error = %e,
                "Unpack failed, removing instance directory"
            );
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }

        info!(
            instance_id = %instance.instance_id(),
            dir = %dir.display(),
            cached,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Staged application"
        );
        Ok(StageOutcome::Staged { cached })
    }

    /// Make `tgz_file` present. Returns true on a cache hit.
    async fn fetch_archive(
        &self,
        bits_file: Option<&Path>,
        bits_uri: &str,
        sha1: &str,
        tgz_file: &Path,
    ) -> Result<bool, StagerError> {
        if tgz_file.exists() {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(path = %tgz_file.display(), "Found staged bits in local cache");
            return Ok(true);
        }

        let pending = self.config.staged_dir.join(format!("{sha1}.pending"));
        let started = Instant::now();

        match bits_file.filter(|p| !self.config.force_http_sharing && p.is_file()) {
            Some(shared) => {
                debug!(path = %shared.display(), "Copying bits from shared directory");
                if let Err(e) = tokio::fs::copy(shared, &pending).await {
                    let _ = tokio::fs::remove_file(&pending).await;
                    return Err(e.into());
                }
                tokio::fs::rename(&pending, tgz_file).await?;
            }
            None => {
                debug!(uri = %bits_uri, "Downloading bits");
                self.download(bits_uri, sha1, &pending).await?;
                tokio::fs::rename(&pending, tgz_file).await?;
                self.downloads.fetch_add(1, Ordering::Relaxed);
            }
        }

        debug!(
            path = %tgz_file.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched bits"
        );
        Ok(false)
    }

    /// Stream `uri` into `pending`, verifying the SHA-1 on the way.
    ///
    /// `pending` is removed unless the digest matches.
    async fn download(&self, uri: &str, sha1: &str, pending: &Path) -> Result<(), StagerError> {
        let result = self.download_to(uri, pending).await;
        let actual = match result {
            Ok(actual) => actual,
            Err(e) => {
                let _ = tokio::fs::remove_file(pending).await;
                return Err(e);
            }
        };

        if !actual.eq_ignore_ascii_case(sha1) {
            let _ = tokio::fs::remove_file(pending).await;
            warn!(uri = %uri, expected = %sha1, actual = %actual, "Downloaded file is corrupt");
            return Err(StagerError::DigestMismatch {
                expected: sha1.to_string(),
                actual,
            });
        }
        Ok(())
    }

    async fn download_to(&self, uri: &str, pending: &Path) -> Result<String, StagerError> {
        let response = self.client.get(uri).send().await?;
        if !response.status().is_success() {
            return Err(StagerError::DownloadStatus {
                uri: uri.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(pending).await?;
        let mut hasher = Sha1::new();
        let mut size = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.sync_all().await?;

        debug!(uri = %uri, size, "Download complete");
        Ok(hex::encode(hasher.finalize()))
    }

    /// Remove everything in the staged archive cache.
    ///
    /// Returns the number of entries removed. Failures are logged.
    pub async fn clean_cache_directory(&self) -> usize {
        if self.config.disable_dir_cleanup {
            return 0;
        }

        let _guard = self.lock.lock().await;
        let entries = match fs::read_dir(&self.config.staged_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.config.staged_dir.display(), error = %e, "Cannot read cache directory");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to clean cache entry"),
            }
        }
        if removed > 0 {
            debug!(removed, "Cleaned staged cache");
        }
        removed
    }
}

/// `<name>-<index>-<instance_id>`, with anything in `name` other than
/// ASCII alphanumerics, `-`, `_` and `.` replaced by `_`.
///
/// The result is always a single path component.
pub fn instance_dir_name(name: &str, index: u32, instance_id: InstanceId) -> String {
    let name: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    format!("{name}-{index}-{instance_id}")
}

/// Forty hex digits, in either case.
pub fn is_sha1_digest(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn stop_requested(instance: &DropletInstance) -> bool {
    instance.read().properties.stop_requested
}

/// Gunzip `tgz` to `intermediate`, untar it into `dest`, then drop the
/// intermediate file.
fn unpack_droplet(tgz: &Path, intermediate: &Path, dest: &Path) -> Result<(), StagerError> {
    {
        let mut decoder = GzDecoder::new(BufReader::new(File::open(tgz)?));
        let mut out = File::create(intermediate)?;
        if let Err(e) = io::copy(&mut decoder, &mut out) {
            let _ = fs::remove_file(intermediate);
            return Err(e.into());
        }
    }

    let result = extract_tar(intermediate, dest);
    let _ = fs::remove_file(intermediate);
    result
}

fn extract_tar(tar_path: &Path, dest: &Path) -> Result<(), StagerError> {
    let mut archive = Archive::new(BufReader::new(File::open(tar_path)?));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path.components().any(|c| c == Component::ParentDir) {
            warn!(path = %path.display(), "Skipping path with parent directory");
            continue;
        }

        entry.unpack_in(dest)?;
    }
    Ok(())
}

/// Point the droplet's startup script at the resolved runtime.
fn bind_local_runtime(dir: &Path, runtime_path: &Path) -> Result<(), StagerError> {
    let startup = dir.join("startup");
    if !startup.is_file() {
        return Ok(());
    }

    let script = fs::read_to_string(&startup)?;
    if script.contains(RUNTIME_PLACEHOLDER) {
        let bound = script.replace(RUNTIME_PLACEHOLDER, &runtime_path.to_string_lossy());
        fs::write(&startup, bound)?;
    }
    Ok(())
}
