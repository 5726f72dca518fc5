//! Unified image loading for inspection inputs
//!
//! Decodes common raster formats via the `image` crate and converts them to
//! an OpenCV Mat in BGR format so every downstream stage sees one layout.
//! Image decoding is the only disk-touching code in the library; the pipeline
//! itself operates purely on in-memory Mats.

use crate::error::{InspectError, Result};
use opencv::core::Mat;
use std::path::Path;

/// Supported image formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// JPEG image
    Jpeg,
    /// PNG image
    Png,
    /// TIFF image
    Tiff,
    /// BMP image
    Bmp,
    /// WebP image
    WebP,
    /// PNM image (PBM, PGM, PPM)
    Pnm,
}

impl ImageFormat {
    /// Detect format from file extension
    pub fn from_extension(path: &Path) -> Option<ImageFormat> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "tiff" | "tif" => Some(ImageFormat::Tiff),
            "bmp" => Some(ImageFormat::Bmp),
            "webp" => Some(ImageFormat::WebP),
            "pbm" | "pgm" | "ppm" | "pnm" => Some(ImageFormat::Pnm),
            _ => None,
        }
    }
}

/// Load an image from disk and convert to an OpenCV Mat (BGR format)
///
/// # Errors
///
/// Returns [`InspectError::ImageLoad`] with the offending path if the file
/// cannot be opened, its format is not supported, or decoding fails. The
/// caller is expected to treat this as terminating only the current image's
/// processing, never a whole batch.
pub fn load_image(path: &Path) -> Result<Mat> {
    use image::ImageReader;

    if ImageFormat::from_extension(path).is_none() {
        return Err(InspectError::ImageLoad {
            path: path.to_path_buf(),
            message: "unknown image format".into(),
            source: None,
        });
    }

    let reader = ImageReader::open(path)
        .map_err(|e| InspectError::image_load(path, "failed to open image file", e))?;

    let img = reader
        .decode()
        .map_err(|e| InspectError::image_load(path, "failed to decode image", e))?;

    let rgb_img = img.to_rgb8();
    let (width, height) = rgb_img.dimensions();

    rgb_to_bgr_mat(&rgb_img.into_raw(), width as i32, height as i32)
}

/// Convert an RGB byte buffer to an OpenCV BGR Mat
pub(crate) fn rgb_to_bgr_mat(rgb_data: &[u8], width: i32, height: i32) -> Result<Mat> {
    use opencv::core::{Vec3b, CV_8UC3};
    use opencv::prelude::{MatExprTraitConst, MatTrait};

    if rgb_data.len() != (width * height * 3) as usize {
        return Err(InspectError::Processing(format!(
            "pixel buffer length {} does not match {}x{} RGB image",
            rgb_data.len(),
            width,
            height
        )));
    }

    let mut mat = Mat::zeros(height, width, CV_8UC3)
        .map_err(|e| InspectError::opencv("create Mat", e))?
        .to_mat()
        .map_err(|e| InspectError::opencv("materialize Mat", e))?;

    for y in 0..height {
        for x in 0..width {
            let idx = ((y * width + x) * 3) as usize;
            let pixel = mat
                .at_2d_mut::<Vec3b>(y, x)
                .map_err(|e| InspectError::opencv("pixel access", e))?;
            pixel[0] = rgb_data[idx + 2];
            pixel[1] = rgb_data[idx + 1];
            pixel[2] = rgb_data[idx];
        }
    }

    Ok(mat)
}

/// Get list of all supported file extensions
pub fn supported_extensions() -> &'static [&'static str] {
    &[
        "jpg", "jpeg", "png", "tiff", "tif", "bmp", "webp", "pbm", "pgm", "ppm", "pnm",
    ]
}

/// Check if a file extension is supported
pub fn is_supported_extension(ext: &str) -> bool {
    let ext_lower = ext.to_lowercase();
    supported_extensions().contains(&ext_lower.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_detection() {
        assert_eq!(
            ImageFormat::from_extension(Path::new("panel.jpg")),
            Some(ImageFormat::Jpeg)
        );
        assert_eq!(
            ImageFormat::from_extension(Path::new("panel.TIFF")),
            Some(ImageFormat::Tiff)
        );
        assert_eq!(
            ImageFormat::from_extension(Path::new("panel.bmp")),
            Some(ImageFormat::Bmp)
        );
        assert_eq!(ImageFormat::from_extension(Path::new("panel.xyz")), None);
        assert_eq!(ImageFormat::from_extension(Path::new("panel")), None);
    }

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_extension("jpg"));
        assert!(is_supported_extension("PNG"));
        assert!(!is_supported_extension("raw"));
        assert!(!is_supported_extension("heic"));
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let err = load_image(Path::new("no_such_panel.png")).unwrap_err();
        match err {
            InspectError::ImageLoad { path, .. } => {
                assert_eq!(path, Path::new("no_such_panel.png"));
            }
            other => panic!("expected ImageLoad, got {:?}", other),
        }
    }

    #[test]
    fn test_rgb_to_bgr_conversion() {
        use opencv::prelude::MatTraitConst;

        // 2x2 image: red, green, blue, white
        let rgb_data = vec![
            255, 0, 0, //
            0, 255, 0, //
            0, 0, 255, //
            255, 255, 255,
        ];

        let mat = rgb_to_bgr_mat(&rgb_data, 2, 2).unwrap();

        let pixel: &opencv::core::Vec3b = mat.at_2d(0, 0).unwrap();
        assert_eq!((pixel[0], pixel[1], pixel[2]), (0, 0, 255));

        let pixel: &opencv::core::Vec3b = mat.at_2d(0, 1).unwrap();
        assert_eq!((pixel[0], pixel[1], pixel[2]), (0, 255, 0));

        let pixel: &opencv::core::Vec3b = mat.at_2d(1, 1).unwrap();
        assert_eq!((pixel[0], pixel[1], pixel[2]), (255, 255, 255));
    }

    #[test]
    fn test_rgb_to_bgr_rejects_short_buffer() {
        assert!(rgb_to_bgr_mat(&[0u8; 5], 2, 2).is_err());
    }
}
