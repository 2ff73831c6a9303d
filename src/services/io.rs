//! Image I/O operations service
//!
//! Decoding and encoding live here so the pipeline stages work on decoded
//! RGBA buffers only.

use crate::error::{Result, VisionError};
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;
use std::path::Path;

/// Service for handling image decoding, encoding and file operations
pub struct ImageIOService;

impl ImageIOService {
    /// Decode an image of any supported format from memory
    ///
    /// # Errors
    /// - `Decode` if the bytes are empty or not a supported image
    ///
    /// # Examples
    /// ```rust,no_run
    /// use tryon_vision::services::ImageIOService;
    ///
    /// let data = std::fs::read("input.jpg")?;
    /// let image = ImageIOService::decode(&data)?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
        if bytes.is_empty() {
            return Err(VisionError::decode("Input contains no image data"));
        }

        let image = image::load_from_memory(bytes)
            .map_err(|e| VisionError::decode(format!("Failed to decode image from bytes: {e}")))?;

        if image.width() == 0 || image.height() == 0 {
            return Err(VisionError::decode(format!(
                "Decoded image has zero area ({}x{})",
                image.width(),
                image.height()
            )));
        }
        Ok(image)
    }

    /// Decode an image and convert it to 8-bit RGBA
    pub fn decode_rgba(bytes: &[u8]) -> Result<RgbaImage> {
        Self::decode(bytes).map(|image| image.to_rgba8())
    }

    /// Load an image file as 8-bit RGBA
    ///
    /// # Errors
    /// - `Io` when the file cannot be read
    /// - `Decode` when its contents are not a supported image
    pub fn load_image<P: AsRef<Path>>(path: P) -> Result<RgbaImage> {
        let path_ref = path.as_ref();
        let data = std::fs::read(path_ref)
            .map_err(|e| VisionError::file_io_error("read image file", path_ref, &e))?;
        Self::decode_rgba(&data).map_err(|e| {
            VisionError::decode(format!("{} ({})", e, path_ref.display()))
        })
    }

    /// Read all bytes from an async reader
    pub async fn read_bytes<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> Result<Vec<u8>> {
        use tokio::io::AsyncReadExt;

        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).await?;
        Ok(buffer)
    }

    /// Encode an RGBA image as PNG, keeping the alpha channel
    pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .map_err(|e| VisionError::processing(format!("Failed to encode PNG: {e}")))?;
        Ok(buffer)
    }

    /// Encode an RGBA image as PNG and write it to `path`
    pub fn save_png<P: AsRef<Path>>(image: &RgbaImage, path: P) -> Result<()> {
        let path_ref = path.as_ref();
        let encoded = Self::encode_png(image)?;
        std::fs::write(path_ref, encoded)
            .map_err(|e| VisionError::file_io_error("write image file", path_ref, &e))
    }

    /// Check if a file path has a supported image extension
    pub fn is_supported_format<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .is_some_and(|ext| matches!(ext.as_str(), "jpg" | "jpeg" | "png" | "webp"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use tempfile::TempDir;

    #[test]
    fn test_decode_rejects_empty_and_garbage() {
        assert!(matches!(
            ImageIOService::decode(&[]),
            Err(VisionError::Decode(_))
        ));
        assert!(matches!(
            ImageIOService::decode(b"definitely not an image"),
            Err(VisionError::Decode(_))
        ));
    }

    #[test]
    fn test_png_roundtrip_keeps_alpha() {
        let mut image = RgbaImage::from_pixel(4, 3, Rgba([10, 20, 30, 255]));
        image.put_pixel(1, 1, Rgba([0, 0, 0, 0]));

        let encoded = ImageIOService::encode_png(&image).unwrap();
        let decoded = ImageIOService::decode_rgba(&encoded).unwrap();

        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(1, 1)[3], 0);
        assert_eq!(decoded.get_pixel(0, 0), &Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn test_load_image_reports_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = ImageIOService::load_image(dir.path().join("missing.png"));
        assert!(matches!(result, Err(VisionError::Io(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.png");
        let image = RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 4]));

        ImageIOService::save_png(&image, &path).unwrap();
        assert_eq!(ImageIOService::load_image(&path).unwrap(), image);
    }

    #[test]
    fn test_supported_formats() {
        assert!(ImageIOService::is_supported_format("photo.JPG"));
        assert!(ImageIOService::is_supported_format("photo.webp"));
        assert!(!ImageIOService::is_supported_format("notes.txt"));
        assert!(!ImageIOService::is_supported_format("no_extension"));
    }

    #[tokio::test]
    async fn test_read_bytes_from_reader() {
        let bytes = ImageIOService::read_bytes(&b"abc"[..]).await.unwrap();
        assert_eq!(bytes, b"abc");
    }
}
