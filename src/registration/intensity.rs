//! Direct intensity registration via ECC maximization
//!
//! Slowest of the strategies but sub-pixel accurate when it converges. ECC is
//! iterative and can fail to converge on low-overlap or low-texture pairs;
//! that case degrades to an identity result with zero confidence rather than
//! an error so AUTO fallback chains keep moving.

use log::debug;
use opencv::core::{self, no_array, Mat, TermCriteria};
use opencv::video;
use opencv::prelude::*;

use crate::config::{AlignmentConfig, MotionModel, RegistrationMethod};
use crate::error::{cv, Result};
use crate::image_utils::to_gray;
use crate::registration::{
    unaligned, warp_affine_with_mask, warp_with_mask, RegistrationResult,
};

pub(crate) fn align(
    golden: &Mat,
    test: &Mat,
    config: &AlignmentConfig,
) -> Result<RegistrationResult> {
    let golden_gray = to_float_gray(golden)?;
    let test_gray = to_float_gray(test)?;

    let motion_type = match config.ecc_motion {
        MotionModel::Translation => video::MOTION_TRANSLATION,
        MotionModel::Euclidean => video::MOTION_EUCLIDEAN,
        MotionModel::Affine => video::MOTION_AFFINE,
        MotionModel::Homography => video::MOTION_HOMOGRAPHY,
    };
    let warp_rows = if motion_type == video::MOTION_HOMOGRAPHY { 3 } else { 2 };
    let mut warp = cv(
        "identity warp",
        cv("warp eye", Mat::eye(warp_rows, 3, core::CV_32F))?.to_mat(),
    )?;

    let criteria = cv(
        "ecc criteria",
        TermCriteria::new(
            core::TermCriteria_COUNT + core::TermCriteria_EPS,
            config.ecc_max_iterations,
            config.ecc_epsilon,
        ),
    )?;

    let correlation = match video::find_transform_ecc(
        &golden_gray,
        &test_gray,
        &mut warp,
        motion_type,
        criteria,
        &no_array(),
        5,
    ) {
        Ok(cc) => cc,
        Err(err) => {
            // Non-convergence throws; report it as an unusable alignment
            debug!("ECC did not converge: {}", err);
            return unaligned(test, RegistrationMethod::DirectIntensity, 0.0);
        }
    };
    let confidence = correlation.clamp(0.0, 1.0);

    if confidence < config.confidence_floor {
        return unaligned(test, RegistrationMethod::DirectIntensity, confidence);
    }

    let dx = *cv("warp dx", warp.at_2d::<f32>(0, 2))? as f64;
    let dy = *cv("warp dy", warp.at_2d::<f32>(1, 2))? as f64;
    let size = cv("golden size", golden.size())?;
    let (aligned, validity_mask) = if motion_type == video::MOTION_HOMOGRAPHY {
        warp_with_mask(test, &warp, size)?
    } else {
        warp_affine_with_mask(test, &warp, size)?
    };

    Ok(RegistrationResult {
        aligned,
        translation: (dx, dy),
        confidence,
        validity_mask,
        method_used: RegistrationMethod::DirectIntensity,
    })
}

fn to_float_gray(image: &Mat) -> Result<Mat> {
    let gray = to_gray(image)?;
    let mut float = Mat::default();
    cv(
        "gray to float",
        gray.convert_to(&mut float, core::CV_32F, 1.0, 0.0),
    )?;
    Ok(float)
}
