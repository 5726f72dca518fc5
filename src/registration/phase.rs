//! Translation-only registration via phase correlation

use opencv::core::{self, Mat, no_array};
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::{AlignmentConfig, RegistrationMethod};
use crate::error::{cv, Result};
use crate::image_utils::to_gray;
use crate::registration::{unaligned, warp_affine_with_mask, RegistrationResult};

/// Estimate (dx, dy) from the cross-power spectrum peak and warp with a pure
/// translation matrix. The peak response doubles as the confidence value.
pub(crate) fn align(
    golden: &Mat,
    test: &Mat,
    config: &AlignmentConfig,
) -> Result<RegistrationResult> {
    let golden_gray = to_gray(golden)?;
    let test_gray = to_gray(test)?;

    let mut golden_f = Mat::default();
    cv(
        "golden to float",
        golden_gray.convert_to(&mut golden_f, core::CV_64F, 1.0, 0.0),
    )?;
    let mut test_f = Mat::default();
    cv(
        "test to float",
        test_gray.convert_to(&mut test_f, core::CV_64F, 1.0, 0.0),
    )?;

    let mut response = 0.0;
    let shift = cv(
        "phase correlate",
        imgproc::phase_correlate(&golden_f, &test_f, &no_array(), &mut response),
    )?;
    let confidence = response.clamp(0.0, 1.0);

    if confidence < config.confidence_floor {
        return unaligned(test, RegistrationMethod::Phase, confidence);
    }

    // The peak gives the test image's offset relative to golden; undo it
    let warp = cv(
        "translation matrix",
        Mat::from_slice_2d(&[[1.0f64, 0.0, -shift.x], [0.0, 1.0, -shift.y]]),
    )?;
    let (aligned, validity_mask) =
        warp_affine_with_mask(test, &warp, cv("golden size", golden.size())?)?;

    Ok(RegistrationResult {
        aligned,
        translation: (shift.x, shift.y),
        confidence,
        validity_mask,
        method_used: RegistrationMethod::Phase,
    })
}
