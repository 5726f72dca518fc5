//! Shared Mat helpers used across pipeline stages
//!
//! Every helper returns a new Mat; inputs are never mutated in place. This
//! keeps images behaving as values even though OpenCV Mats share buffers
//! internally.

use opencv::core::{Mat, Scalar, Size, CV_8UC1};
use opencv::imgproc;
use opencv::prelude::*;

use crate::error::{cv, Result};

/// Convert a BGR image to single-channel grayscale
pub fn to_gray(image: &Mat) -> Result<Mat> {
    if image.channels() == 1 {
        return cv("clone gray", image.try_clone());
    }
    let mut gray = Mat::default();
    cv(
        "grayscale conversion",
        imgproc::cvt_color(
            image,
            &mut gray,
            imgproc::COLOR_BGR2GRAY,
            0,
        ),
    )?;
    Ok(gray)
}

/// CLAHE local-contrast enhancement of a grayscale image
pub fn equalize_histogram_gray(gray: &Mat, clip_limit: f64, tile_size: i32) -> Result<Mat> {
    let mut clahe = cv(
        "create CLAHE",
        imgproc::create_clahe(clip_limit, Size::new(tile_size, tile_size)),
    )?;
    let mut equalized = Mat::default();
    cv("CLAHE apply", clahe.apply(gray, &mut equalized))?;
    Ok(equalized)
}

/// All-255 single-channel mask matching the given dimensions
pub fn full_mask(rows: i32, cols: i32) -> Result<Mat> {
    cv(
        "create full mask",
        Mat::new_rows_cols_with_default(rows, cols, CV_8UC1, Scalar::all(255.0)),
    )
}

/// All-zero single-channel mask matching the given dimensions
pub fn zero_mask(rows: i32, cols: i32) -> Result<Mat> {
    cv(
        "zero mask",
        Mat::new_rows_cols_with_default(rows, cols, CV_8UC1, Scalar::all(0.0)),
    )
}

/// Resize `image` to exactly `size` with bilinear interpolation
pub fn resize_to(image: &Mat, size: Size) -> Result<Mat> {
    if image.size().map(|s| s == size).unwrap_or(false) {
        return cv("clone image", image.try_clone());
    }
    let mut resized = Mat::default();
    cv(
        "resize",
        imgproc::resize(image, &mut resized, size, 0.0, 0.0, imgproc::INTER_LINEAR),
    )?;
    Ok(resized)
}

/// Rectangular morphology kernel of the given side length
pub fn rect_kernel(size: i32) -> Result<Mat> {
    cv(
        "create kernel",
        imgproc::get_structuring_element(
            imgproc::MORPH_RECT,
            Size::new(size, size),
            opencv::core::Point::new(-1, -1),
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::CV_8UC3;

    #[test]
    fn test_to_gray_shape() {
        let bgr = Mat::new_rows_cols_with_default(40, 60, CV_8UC3, Scalar::all(128.0)).unwrap();
        let gray = to_gray(&bgr).unwrap();
        assert_eq!(gray.channels(), 1);
        assert_eq!((gray.rows(), gray.cols()), (40, 60));
    }

    #[test]
    fn test_to_gray_passthrough_for_single_channel() {
        let gray_in = full_mask(10, 10).unwrap();
        let gray = to_gray(&gray_in).unwrap();
        assert_eq!(gray.channels(), 1);
    }

    #[test]
    fn test_full_mask_is_saturated() {
        let mask = full_mask(8, 8).unwrap();
        assert_eq!(opencv::core::count_non_zero(&mask).unwrap(), 64);
        assert_eq!(*mask.at_2d::<u8>(3, 3).unwrap(), 255);
    }

    #[test]
    fn test_resize_to_is_noop_for_same_size() {
        let image = full_mask(16, 24).unwrap();
        let resized = resize_to(&image, Size::new(24, 16)).unwrap();
        assert_eq!((resized.rows(), resized.cols()), (16, 24));
    }
}
