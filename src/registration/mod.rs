//! Image registration engine
//!
//! Aligns a test image onto a golden image's coordinate frame using one of
//! several interchangeable strategies:
//!
//! - [`RegistrationMethod::Phase`]: cross-power-spectrum translation, fast
//! - [`RegistrationMethod::FeatureFast`]: ORB keypoints + RANSAC homography
//! - [`RegistrationMethod::FeatureAccurate`]: SIFT keypoints + Lowe ratio +
//!   RANSAC homography
//! - [`RegistrationMethod::DirectIntensity`]: ECC refinement, sub-pixel
//! - [`RegistrationMethod::Auto`]: tries the configured fallback order; the
//!   first attempt clearing the confidence floor wins, and if all miss it the
//!   last attempt is returned with its low confidence intact
//!
//! Every result carries a `validity_mask` obtained by warping an all-ones
//! canvas through the same transform, so downstream difference analysis can
//! exclude border pixels introduced by the warp.
//!
//! Callers must check `confidence` explicitly; a returned result is not a
//! promise that alignment succeeded.

mod feature;
mod intensity;
mod phase;

use log::debug;
use opencv::core::{Mat, Scalar, Size};
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::{AlignmentConfig, RegistrationMethod};
use crate::error::{cv, Result};
use crate::image_utils::{full_mask, resize_to};

/// Outcome of one registration attempt
#[derive(Debug)]
pub struct RegistrationResult {
    /// Test image warped into the golden frame; always golden-sized
    pub aligned: Mat,
    /// Estimated translation component (dx, dy)
    pub translation: (f64, f64),
    /// Match quality in [0, 1]; below-floor values mean the warp was not applied
    pub confidence: f64,
    /// 255 where a pixel came from real source data, 0 for warp border fill
    pub validity_mask: Mat,
    /// Strategy that produced this result
    pub method_used: RegistrationMethod,
}

impl Clone for RegistrationResult {
    fn clone(&self) -> Self {
        // try_clone only fails on allocation failure; keep Clone infallible
        Self {
            aligned: self.aligned.try_clone().unwrap_or_default(),
            translation: self.translation,
            confidence: self.confidence,
            validity_mask: self.validity_mask.try_clone().unwrap_or_default(),
            method_used: self.method_used,
        }
    }
}

/// Align `test` onto `golden`'s coordinate frame.
///
/// The test image is first resized to the golden frame, then the selected
/// strategy estimates and applies the geometric transform. Failures inside a
/// strategy (too few features, non-convergence) degrade to a low-confidence
/// result rather than an error; `Err` is reserved for OpenCV-level faults.
pub fn align(
    golden: &Mat,
    test: &Mat,
    method: RegistrationMethod,
    config: &AlignmentConfig,
) -> Result<RegistrationResult> {
    let golden_size = cv("golden size", golden.size())?;
    let test_resized = resize_to(test, golden_size)?;

    match method {
        RegistrationMethod::Auto => {
            let mut last = None;
            for &fallback in &config.fallback_order {
                let result = try_method(golden, &test_resized, fallback, config)?;
                debug!(
                    "registration attempt {:?}: confidence {:.4}",
                    fallback, result.confidence
                );
                if result.confidence >= config.confidence_floor {
                    return Ok(result);
                }
                last = Some(result);
            }
            // All attempts missed the floor; hand back the final one so the
            // caller can inspect its confidence
            match last {
                Some(result) => Ok(result),
                None => unaligned(&test_resized, RegistrationMethod::Auto, 0.0),
            }
        }
        concrete => try_method(golden, &test_resized, concrete, config),
    }
}

fn try_method(
    golden: &Mat,
    test: &Mat,
    method: RegistrationMethod,
    config: &AlignmentConfig,
) -> Result<RegistrationResult> {
    match method {
        RegistrationMethod::Phase => phase::align(golden, test, config),
        RegistrationMethod::FeatureFast => feature::align_orb(golden, test, config),
        RegistrationMethod::FeatureAccurate => feature::align_sift(golden, test, config),
        RegistrationMethod::DirectIntensity => intensity::align(golden, test, config),
        RegistrationMethod::Auto => unreachable!("auto is expanded by align()"),
    }
}

/// Best-effort result when a strategy cannot estimate a transform: the test
/// image is returned unwarped with a full validity mask
pub(crate) fn unaligned(
    test: &Mat,
    method: RegistrationMethod,
    confidence: f64,
) -> Result<RegistrationResult> {
    Ok(RegistrationResult {
        aligned: cv("clone test", test.try_clone())?,
        translation: (0.0, 0.0),
        confidence,
        validity_mask: full_mask(test.rows(), test.cols())?,
        method_used: method,
    })
}

/// Warp a BGR image and an all-ones canvas through the same 3x3 homography
pub(crate) fn warp_with_mask(
    test: &Mat,
    homography: &Mat,
    size: Size,
) -> Result<(Mat, Mat)> {
    let mut aligned = Mat::default();
    cv(
        "perspective warp",
        imgproc::warp_perspective(
            test,
            &mut aligned,
            homography,
            size,
            imgproc::INTER_LINEAR,
            opencv::core::BORDER_CONSTANT,
            Scalar::default(),
        ),
    )?;

    let canvas = full_mask(size.height, size.width)?;
    let mut validity_mask = Mat::default();
    cv(
        "validity mask warp",
        imgproc::warp_perspective(
            &canvas,
            &mut validity_mask,
            homography,
            size,
            imgproc::INTER_NEAREST,
            opencv::core::BORDER_CONSTANT,
            Scalar::all(0.0),
        ),
    )?;

    Ok((aligned, validity_mask))
}

/// Warp a BGR image and an all-ones canvas through the same 2x3 affine matrix
pub(crate) fn warp_affine_with_mask(
    test: &Mat,
    warp_matrix: &Mat,
    size: Size,
) -> Result<(Mat, Mat)> {
    let mut aligned = Mat::default();
    cv(
        "affine warp",
        imgproc::warp_affine(
            test,
            &mut aligned,
            warp_matrix,
            size,
            imgproc::INTER_LINEAR,
            opencv::core::BORDER_CONSTANT,
            Scalar::default(),
        ),
    )?;

    let canvas = full_mask(size.height, size.width)?;
    let mut validity_mask = Mat::default();
    cv(
        "validity mask warp",
        imgproc::warp_affine(
            &canvas,
            &mut validity_mask,
            warp_matrix,
            size,
            imgproc::INTER_NEAREST,
            opencv::core::BORDER_CONSTANT,
            Scalar::all(0.0),
        ),
    )?;

    Ok((aligned, validity_mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Rect, Scalar, CV_8UC3};

    /// Synthetic panel with enough texture for feature and phase methods
    fn textured_panel(rows: i32, cols: i32) -> Mat {
        let mut image =
            Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(30.0)).unwrap();
        for i in 0..6 {
            let x = 20 + i * 35;
            imgproc::rectangle(
                &mut image,
                Rect::new(x, 25 + (i % 3) * 50, 22, 30),
                Scalar::new(210.0, 180.0, 60.0, 0.0),
                -1,
                imgproc::LINE_8,
                0,
            )
            .unwrap();
            imgproc::circle(
                &mut image,
                opencv::core::Point::new(x + 10, 170),
                8 + i,
                Scalar::new(60.0, 200.0, 220.0, 0.0),
                -1,
                imgproc::LINE_8,
                0,
            )
            .unwrap();
        }
        image
    }

    #[test]
    fn test_self_registration_all_methods() {
        let golden = textured_panel(220, 260);
        let config = AlignmentConfig::default();

        for method in [
            RegistrationMethod::Phase,
            RegistrationMethod::FeatureFast,
            RegistrationMethod::DirectIntensity,
        ] {
            let result = align(&golden, &golden, method, &config).unwrap();
            assert_eq!(
                result.aligned.size().unwrap(),
                golden.size().unwrap(),
                "{:?} must preserve the golden frame",
                method
            );
            assert!(
                (0.0..=1.0).contains(&result.confidence),
                "{:?} confidence out of range: {}",
                method,
                result.confidence
            );
            assert!(
                result.confidence >= 0.9,
                "{:?} self-registration should be near-perfect, got {}",
                method,
                result.confidence
            );
        }
    }

    #[test]
    fn test_auto_returns_last_attempt_on_total_failure() {
        // A flat image defeats every method; AUTO must still return a result
        let golden =
            Mat::new_rows_cols_with_default(120, 120, CV_8UC3, Scalar::all(128.0)).unwrap();
        let config = AlignmentConfig::default();

        let result = align(&golden, &golden, RegistrationMethod::Auto, &config);
        let result = result.unwrap();
        assert_eq!(result.aligned.size().unwrap(), golden.size().unwrap());
        assert!((0.0..=1.0).contains(&result.confidence));
    }

    #[test]
    fn test_align_resizes_test_to_golden_frame() {
        let golden = textured_panel(200, 240);
        let test = textured_panel(100, 120);
        let config = AlignmentConfig::default();

        let result = align(&golden, &test, RegistrationMethod::Phase, &config).unwrap();
        assert_eq!(result.aligned.size().unwrap(), golden.size().unwrap());
        assert_eq!(result.validity_mask.size().unwrap(), golden.size().unwrap());
    }

    #[test]
    fn test_translated_panel_recovers_shift() {
        let golden = textured_panel(220, 260);

        // Shift the panel content right/down by (7, 4)
        let shift =
            Mat::from_slice_2d(&[[1.0f64, 0.0, 7.0], [0.0, 1.0, 4.0]]).unwrap();
        let mut test = Mat::default();
        imgproc::warp_affine(
            &golden,
            &mut test,
            &shift,
            golden.size().unwrap(),
            imgproc::INTER_LINEAR,
            opencv::core::BORDER_CONSTANT,
            Scalar::default(),
        )
        .unwrap();

        let config = AlignmentConfig::default();
        let result = align(&golden, &test, RegistrationMethod::Phase, &config).unwrap();

        assert!(result.confidence > 0.3);
        assert!((result.translation.0 - 7.0).abs() < 1.5);
        assert!((result.translation.1 - 4.0).abs() < 1.5);
    }
}
