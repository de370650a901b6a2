//! Cropping page previews to title-block and field regions.
//!
//! Crop failures never abort extraction: the service logs them and returns
//! `None`, and the caller treats the attempt as empty.

use std::io::Cursor;
use std::sync::Arc;

use image::{ImageFormat, ImageReader};
use thiserror::Error;
use tracing::{error, warn};

use crate::models::{PixelRect, Rect};
use crate::storage::{ObjectStorage, StorageError};

/// Bottom-right region where title blocks usually sit.
pub const DEFAULT_HEURISTIC_CROP: Rect = Rect::new(0.55, 0.60, 0.45, 0.40);

#[derive(Debug, Error)]
pub enum CropError {
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Empty image")]
    Empty,
    #[error("Crop task failed: {0}")]
    Task(String),
}

/// Normalised rectangle to pixels, rounding each component.
pub fn normalized_to_pixels(rect: &Rect, width: u32, height: u32) -> PixelRect {
    PixelRect {
        x: (rect.x * width as f64).round() as i64,
        y: (rect.y * height as f64).round() as i64,
        w: (rect.w * width as f64).round() as i64,
        h: (rect.h * height as f64).round() as i64,
    }
}

/// Pixels back to a normalised rectangle. A zero dimension maps to 0 for the
/// position and 1 for the extent.
pub fn pixels_to_normalized(px: &PixelRect, width: u32, height: u32) -> Rect {
    let (w, h) = (width as f64, height as f64);
    Rect {
        x: if width > 0 { px.x as f64 / w } else { 0.0 },
        y: if height > 0 { px.y as f64 / h } else { 0.0 },
        w: if width > 0 { px.w as f64 / w } else { 1.0 },
        h: if height > 0 { px.h as f64 / h } else { 1.0 },
    }
}

/// Keep the origin inside the image and the extent at least one pixel.
pub fn clamp_to_bounds(px: &PixelRect, width: u32, height: u32) -> PixelRect {
    let (width, height) = (width as i64, height as i64);
    let x = px.x.min(width - 1).max(0);
    let y = px.y.min(height - 1).max(0);
    PixelRect {
        x,
        y,
        w: px.w.min(width - x).max(1),
        h: px.h.min(height - y).max(1),
    }
}

fn reader(bytes: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, CropError> {
    let mut reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    // 300 DPI sheets exceed the decoder's default allocation limit
    reader.no_limits();
    Ok(reader)
}

/// Crop encoded image bytes to a normalised rectangle and re-encode as PNG.
pub fn crop_bytes(bytes: &[u8], rect: &Rect) -> Result<Vec<u8>, CropError> {
    let img = reader(bytes)?.decode()?;
    let (width, height) = (img.width(), img.height());
    if width == 0 || height == 0 {
        return Err(CropError::Empty);
    }

    let px = clamp_to_bounds(&normalized_to_pixels(rect, width, height), width, height);
    let cropped = img.crop_imm(px.x as u32, px.y as u32, px.w as u32, px.h as u32);

    let mut out = Vec::new();
    cropped.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}

/// Image size without decoding pixel data.
pub fn dimensions_of(bytes: &[u8]) -> Result<(u32, u32), CropError> {
    Ok(reader(bytes)?.into_dimensions()?)
}

#[derive(Clone)]
pub struct ImageCropService {
    storage: Arc<dyn ObjectStorage>,
}

impl ImageCropService {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    async fn try_crop(&self, key: &str, rect: Rect) -> Result<Vec<u8>, CropError> {
        let bytes = self.storage.get(key).await?;
        tokio::task::spawn_blocking(move || crop_bytes(&bytes, &rect))
            .await
            .map_err(|e| CropError::Task(e.to_string()))?
    }

    /// Crop a stored image to `rect`, returning PNG bytes.
    pub async fn crop_image(&self, key: &str, rect: &Rect) -> Option<Vec<u8>> {
        match self.try_crop(key, *rect).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(key, ?rect, "Image crop failed: {}", e);
                None
            }
        }
    }

    pub async fn crop_heuristic(&self, key: &str) -> Option<Vec<u8>> {
        self.crop_image(key, &DEFAULT_HEURISTIC_CROP).await
    }

    pub async fn image_dimensions(&self, key: &str) -> Option<(u32, u32)> {
        let result = match self.storage.get(key).await {
            Ok(bytes) => dimensions_of(&bytes),
            Err(e) => Err(e.into()),
        };
        result
            .map_err(|e| error!(key, "Failed to get image dimensions: {}", e))
            .ok()
    }

    /// Store a crop as `{prefix}/{filename}_crop.png`. Returns the key.
    pub async fn save_cropped(&self, bytes: &[u8], prefix: &str, filename: &str) -> Option<String> {
        let key = format!("{}/{}_crop.png", prefix.trim_matches('/'), filename);
        match self.storage.put(&key, bytes, "image/png").await {
            Ok(()) => Some(key),
            Err(e) => {
                warn!(prefix, filename, "Failed to save cropped image: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_normalized_to_pixels() {
        let px = normalized_to_pixels(&DEFAULT_HEURISTIC_CROP, 1000, 500);
        assert_eq!(
            px,
            PixelRect {
                x: 550,
                y: 300,
                w: 450,
                h: 200
            }
        );
    }

    #[test]
    fn test_pixels_to_normalized() {
        let r = pixels_to_normalized(&PixelRect { x: 50, y: 25, w: 100, h: 50 }, 200, 100);
        assert_eq!(r, Rect::new(0.25, 0.25, 0.5, 0.5));
        let zero = pixels_to_normalized(&PixelRect { x: 5, y: 5, w: 5, h: 5 }, 0, 0);
        assert_eq!(zero, Rect::new(0.0, 0.0, 1.0, 1.0));
    }

    #[test]
    fn test_clamp_to_bounds() {
        let c = clamp_to_bounds(&PixelRect { x: -10, y: 95, w: 500, h: 20 }, 100, 100);
        assert_eq!(c, PixelRect { x: 0, y: 95, w: 100, h: 5 });

        let c = clamp_to_bounds(&PixelRect { x: 150, y: 10, w: 0, h: 0 }, 100, 100);
        assert_eq!(c, PixelRect { x: 99, y: 10, w: 1, h: 1 });
    }

    #[test]
    fn test_crop_bytes() {
        let cropped = crop_bytes(&png(200, 100), &Rect::new(0.5, 0.0, 0.5, 1.0)).unwrap();
        let img = image::load_from_memory(&cropped).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (100, 100));
        assert_eq!(img.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(dimensions_of(&cropped).unwrap(), (100, 100));
    }

    #[test]
    fn test_crop_bytes_rejects_garbage() {
        assert!(crop_bytes(b"not an image", &Rect::FULL).is_err());
    }

    #[tokio::test]
    async fn test_service_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path().to_path_buf()));
        storage.put("p/page.png", &png(400, 300), "image/png").await.unwrap();
        let service = ImageCropService::new(storage);

        assert_eq!(service.image_dimensions("p/page.png").await, Some((400, 300)));
        let crop = service.crop_heuristic("p/page.png").await.unwrap();
        assert_eq!(dimensions_of(&crop).unwrap(), (180, 120));

        let key = service.save_cropped(&crop, "/crops/1/", "page_0001").await;
        assert_eq!(key.as_deref(), Some("crops/1/page_0001_crop.png"));

        assert!(service.crop_heuristic("missing.png").await.is_none());
        assert!(service.image_dimensions("missing.png").await.is_none());
    }
}
