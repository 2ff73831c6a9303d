//! Where model files come from

use crate::download::{validate_model_url, ModelDownloader};
use crate::error::{Result, VisionError};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Model source specification
#[derive(Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Model file on the local filesystem
    Path(PathBuf),
    /// Model downloaded once into the cache
    Url {
        url: String,
        /// Optional SHA-256 hex digest the download must match
        sha256: Option<String>,
    },
    /// Model already in memory, e.g. bundled with `include_bytes!`
    Bytes(Arc<[u8]>),
}

impl ModelSource {
    #[must_use]
    pub fn url<S: Into<String>>(url: S) -> Self {
        Self::Url {
            url: url.into(),
            sha256: None,
        }
    }

    /// Get a display name for tracing and logging
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            Self::Path(path) => format!(
                "file:{}",
                path.file_name().unwrap_or_default().to_string_lossy()
            ),
            Self::Url { url, .. } => format!("url:{url}"),
            Self::Bytes(bytes) => format!("memory:{} bytes", bytes.len()),
        }
    }

    /// Read the model's bytes, downloading them first for URL sources
    ///
    /// # Errors
    /// - The file cannot be read
    /// - Download or integrity verification failures
    pub async fn load_bytes(&self) -> Result<Vec<u8>> {
        self.load_bytes_with_progress(false).await
    }

    /// Like [`load_bytes`](Self::load_bytes), optionally drawing a progress
    /// bar while a URL source downloads
    ///
    /// # Errors
    /// - The file cannot be read
    /// - Download or integrity verification failures
    pub async fn load_bytes_with_progress(&self, show_progress: bool) -> Result<Vec<u8>> {
        match self {
            Self::Path(path) => tokio::fs::read(path)
                .await
                .map_err(|e| VisionError::file_io_error("read model file", path, &e)),
            Self::Url { url, sha256 } => {
                let downloader = ModelDownloader::new()?;
                let path = downloader.fetch(url, sha256.as_deref(), show_progress).await?;
                tokio::fs::read(&path)
                    .await
                    .map_err(|e| VisionError::file_io_error("read cached model", &path, &e))
            },
            Self::Bytes(bytes) => Ok(bytes.to_vec()),
        }
    }
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

impl FromStr for ModelSource {
    type Err = VisionError;

    /// `http(s)://` strings are URLs, anything else is a path
    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with("http://") || s.starts_with("https://") {
            validate_model_url(s)?;
            Ok(Self::url(s))
        } else if s.is_empty() {
            Err(VisionError::invalid_config("Model source cannot be empty"))
        } else {
            Ok(Self::Path(PathBuf::from(s)))
        }
    }
}

impl From<PathBuf> for ModelSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<Vec<u8>> for ModelSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_model_source() {
        assert_eq!(
            "models/selfie.onnx".parse::<ModelSource>().unwrap(),
            ModelSource::Path(PathBuf::from("models/selfie.onnx"))
        );
        assert_eq!(
            "https://example.com/pose.onnx".parse::<ModelSource>().unwrap(),
            ModelSource::url("https://example.com/pose.onnx")
        );
        assert!("https://".parse::<ModelSource>().is_err());
        assert!("".parse::<ModelSource>().is_err());
    }

    #[test]
    fn test_display_name() {
        let source = ModelSource::Path(PathBuf::from("/opt/models/movenet.onnx"));
        assert_eq!(source.display_name(), "file:movenet.onnx");
        assert_eq!(ModelSource::from(vec![1, 2, 3]).display_name(), "memory:3 bytes");
    }

    #[tokio::test]
    async fn test_load_bytes_from_path_and_memory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, [7u8, 8, 9]).unwrap();

        assert_eq!(ModelSource::from(path).load_bytes().await.unwrap(), vec![7, 8, 9]);
        assert_eq!(ModelSource::from(vec![1u8]).load_bytes().await.unwrap(), vec![1]);

        let missing = ModelSource::Path(dir.path().join("missing.onnx"));
        assert!(matches!(missing.load_bytes().await, Err(VisionError::Io(_))));
    }
}
