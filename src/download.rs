//! Model downloading
//!
//! Models referenced by URL are fetched once into the user cache directory
//! and reused afterwards. Downloads stream into a partial file that is only
//! renamed into place once complete (and verified, when a hash is given).

use crate::error::{Result, VisionError};
use futures_util::stream::TryStreamExt;
#[cfg(feature = "cli")]
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

/// Environment variable overriding the cache root
pub const CACHE_DIR_ENV: &str = "TRYON_VISION_CACHE_DIR";

/// Progress bar abstraction that works with and without CLI features
#[derive(Debug)]
pub enum ProgressIndicator {
    #[cfg(feature = "cli")]
    Indicatif(ProgressBar),
    NoOp,
}

impl ProgressIndicator {
    fn for_download(show_progress: bool) -> Self {
        #[cfg(feature = "cli")]
        {
            if show_progress {
                let pb = ProgressBar::new(0);
                if let Ok(style) = ProgressStyle::default_bar().template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
                ) {
                    pb.set_style(style.progress_chars("#>-"));
                }
                return Self::Indicatif(pb);
            }
        }
        let _ = show_progress;
        Self::NoOp
    }

    pub fn set_length(&self, len: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_length(len),
            Self::NoOp => {},
        }
    }

    pub fn set_position(&self, pos: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_position(pos),
            Self::NoOp => {},
        }
    }

    pub fn finish_with_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.finish_with_message(msg),
            Self::NoOp => {
                let _ = msg;
            },
        }
    }
}

/// Downloads model files into a local cache
#[derive(Debug, Clone)]
pub struct ModelDownloader {
    client: Client,
    cache_dir: PathBuf,
}

impl ModelDownloader {
    /// Create a downloader using the default cache directory
    ///
    /// # Errors
    /// - Failed to create HTTP client
    /// - No cache directory could be determined
    pub fn new() -> Result<Self> {
        Self::with_cache_dir(default_cache_dir()?)
    }

    /// Create a downloader caching into `cache_dir`
    pub fn with_cache_dir<P: Into<PathBuf>>(cache_dir: P) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| VisionError::network_error("Failed to create HTTP client", e))?;

        Ok(Self {
            client,
            cache_dir: cache_dir.into(),
        })
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Where the model behind `url` is (or will be) cached
    #[must_use]
    pub fn cached_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.onnx", url_cache_key(url)))
    }

    #[must_use]
    pub fn is_cached(&self, url: &str) -> bool {
        self.cached_path(url).is_file()
    }

    /// Return the cached model for `url`, downloading it first if needed
    ///
    /// # Errors
    /// - Invalid URL
    /// - Network errors during download
    /// - File system errors while caching
    /// - The downloaded file does not match `expected_sha256`
    pub async fn fetch(
        &self,
        url: &str,
        expected_sha256: Option<&str>,
        show_progress: bool,
    ) -> Result<PathBuf> {
        validate_model_url(url)?;
        let target = self.cached_path(url);
        if target.is_file() {
            debug!(url, path = %target.display(), "Using cached model");
            return Ok(target);
        }

        fs::create_dir_all(&self.cache_dir)
            .map_err(|e| VisionError::file_io_error("create cache directory", &self.cache_dir, &e))?;

        let partial = target.with_extension("onnx.part");
        let progress = ProgressIndicator::for_download(show_progress);
        info!(url, "Downloading model");

        if let Err(e) = self.download_file(url, &partial, &progress).await {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }

        if !verify_file_integrity(&partial, expected_sha256)? {
            let _ = fs::remove_file(&partial);
            return Err(VisionError::model(format!(
                "Downloaded model from {url} failed integrity verification"
            )));
        }

        fs::rename(&partial, &target)
            .map_err(|e| VisionError::file_io_error("move downloaded model into cache", &target, &e))?;
        progress.finish_with_message("Model downloaded".to_string());
        info!(path = %target.display(), "Model cached");
        Ok(target)
    }

    async fn download_file(&self, url: &str, local_path: &Path, progress: &ProgressIndicator) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| VisionError::network_error(format!("Failed to download {url}"), e))?;

        if !response.status().is_success() {
            return Err(VisionError::network_error(
                format!("HTTP error {} for {}", response.status(), url),
                std::io::Error::new(std::io::ErrorKind::Other, "HTTP error"),
            ));
        }

        if let Some(total) = response.content_length() {
            progress.set_length(total);
        }

        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| VisionError::file_io_error("create file", local_path, &e))?;

        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut downloaded = 0u64;
        let mut buffer = vec![0; 8192];
        loop {
            let bytes_read = tokio::io::AsyncReadExt::read(&mut stream, &mut buffer)
                .await
                .map_err(|e| VisionError::network_error("Failed to read download stream", e))?;
            if bytes_read == 0 {
                break;
            }

            file.write_all(buffer.get(..bytes_read).unwrap_or(&[]))
                .await
                .map_err(|e| VisionError::file_io_error("write to file", local_path, &e))?;
            downloaded += bytes_read as u64;
            progress.set_position(downloaded);
        }

        file.flush()
            .await
            .map_err(|e| VisionError::file_io_error("flush file", local_path, &e))?;
        debug!(downloaded, path = %local_path.display(), "Download finished");
        Ok(())
    }
}

/// Default cache directory: `$TRYON_VISION_CACHE_DIR/models` or the user cache
///
/// # Errors
/// - Neither the override nor a platform cache directory is available
pub fn default_cache_dir() -> Result<PathBuf> {
    if let Ok(cache_override) = std::env::var(CACHE_DIR_ENV) {
        return Ok(PathBuf::from(cache_override).join("models"));
    }

    Ok(dirs::cache_dir()
        .ok_or_else(|| {
            VisionError::invalid_config(format!(
                "Failed to determine cache directory. Set {CACHE_DIR_ENV} environment variable."
            ))
        })?
        .join("tryon-vision")
        .join("models"))
}

/// Filesystem-safe cache key for a model URL
#[must_use]
pub fn url_cache_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Check a file against an expected SHA-256 hex digest
///
/// With no expected digest there is nothing to check and the file passes.
pub fn verify_file_integrity(file_path: &Path, expected_hash: Option<&str>) -> Result<bool> {
    let Some(expected) = expected_hash else {
        return Ok(true);
    };

    let contents = fs::read(file_path)
        .map_err(|e| VisionError::file_io_error("read file for verification", file_path, &e))?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    let actual_hash = format!("{:x}", hasher.finalize());

    if actual_hash.eq_ignore_ascii_case(expected) {
        Ok(true)
    } else {
        warn!(
            path = %file_path.display(),
            expected,
            actual = %actual_hash,
            "File integrity check failed"
        );
        Ok(false)
    }
}

/// Validate that a model URL can be downloaded
pub fn validate_model_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(VisionError::invalid_config("Model URL cannot be empty"));
    }

    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| {
            VisionError::invalid_config(format!(
                "Unsupported URL scheme: {url}. Expected http:// or https://"
            ))
        })?;

    match rest.split_once('/') {
        Some((host, path)) if !host.is_empty() && !path.is_empty() => Ok(()),
        _ => Err(VisionError::invalid_config(format!(
            "Model URL must name a file on a host: {url}"
        ))),
    }
}
