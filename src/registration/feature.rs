//! Feature-based registration: ORB (fast) and SIFT (accurate)
//!
//! Both estimate a full RANSAC homography from keypoint correspondences.
//! Confidence blends the descriptor distance quality with the RANSAC inlier
//! ratio, so both a weak match set and a geometrically inconsistent one pull
//! the score down.

use opencv::calib3d;
use opencv::core::{self, no_array, DMatch, KeyPoint, Mat, Point2f, Vector};
use opencv::features2d::{BFMatcher, ORB_ScoreType, ORB, SIFT};
use opencv::prelude::*;

use crate::config::{AlignmentConfig, RegistrationMethod};
use crate::error::{cv, Result};
use crate::image_utils::{equalize_histogram_gray, to_gray};
use crate::registration::{unaligned, warp_with_mask, RegistrationResult};

use crate::constants::alignment::{ORB_DISTANCE_SCALE, SIFT_DISTANCE_SCALE};

/// Confidence reported when features were found but matching fell apart
const WEAK_MATCH_CONFIDENCE: f64 = 0.1;

pub(crate) fn align_orb(
    golden: &Mat,
    test: &Mat,
    config: &AlignmentConfig,
) -> Result<RegistrationResult> {
    // Local contrast boost makes ORB keypoints far more repeatable on
    // low-contrast board surfaces
    let golden_gray = equalize_histogram_gray(&to_gray(golden)?, 2.0, 8)?;
    let test_gray = equalize_histogram_gray(&to_gray(test)?, 2.0, 8)?;

    let mut orb = cv(
        "create ORB",
        ORB::create(
            config.orb_max_features,
            1.2,
            8,
            31,
            0,
            2,
            ORB_ScoreType::HARRIS_SCORE,
            31,
            20,
        ),
    )?;

    let (kp_golden, desc_golden) = detect(&mut orb, &golden_gray)?;
    let (kp_test, desc_test) = detect(&mut orb, &test_gray)?;
    if desc_golden.empty() || desc_test.empty() {
        return unaligned(test, RegistrationMethod::FeatureFast, 0.0);
    }
    if kp_golden.len() < config.min_match_count
        || kp_test.len() < config.min_match_count
    {
        return unaligned(test, RegistrationMethod::FeatureFast, WEAK_MATCH_CONFIDENCE);
    }

    let matcher = cv(
        "create matcher",
        BFMatcher::create(core::NORM_HAMMING, true),
    )?;
    let mut matches = Vector::<DMatch>::new();
    cv(
        "match descriptors",
        matcher.train_match(&desc_test, &desc_golden, &mut matches, &no_array()),
    )?;
    if matches.len() < config.min_match_count {
        return unaligned(test, RegistrationMethod::FeatureFast, WEAK_MATCH_CONFIDENCE);
    }

    let mut sorted: Vec<DMatch> = matches.to_vec();
    sorted.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    let keep = (sorted.len() as f64 * config.orb_good_match_percent) as usize;
    let keep = keep.max(config.min_match_count).min(sorted.len());
    let good = &sorted[..keep];

    let avg_distance =
        good.iter().map(|m| m.distance as f64).sum::<f64>() / good.len() as f64;
    let base_confidence = (1.0 - avg_distance / ORB_DISTANCE_SCALE).max(0.0);

    finish_homography(
        golden,
        test,
        &kp_golden,
        &kp_test,
        good,
        base_confidence,
        RegistrationMethod::FeatureFast,
        config,
    )
}

pub(crate) fn align_sift(
    golden: &Mat,
    test: &Mat,
    config: &AlignmentConfig,
) -> Result<RegistrationResult> {
    let golden_gray = to_gray(golden)?;
    let test_gray = to_gray(test)?;

    let mut sift = cv(
        "create SIFT",
        SIFT::create(config.sift_max_features, 3, 0.04, 10.0, 1.6),
    )?;

    let (kp_golden, desc_golden) = detect(&mut sift, &golden_gray)?;
    let (kp_test, desc_test) = detect(&mut sift, &test_gray)?;
    if desc_golden.empty() || desc_test.empty() {
        return unaligned(test, RegistrationMethod::FeatureAccurate, 0.0);
    }
    if kp_golden.len() < config.min_match_count
        || kp_test.len() < config.min_match_count
    {
        return unaligned(
            test,
            RegistrationMethod::FeatureAccurate,
            WEAK_MATCH_CONFIDENCE,
        );
    }

    let matcher = cv("create matcher", BFMatcher::create(core::NORM_L2, false))?;
    let mut knn_matches = Vector::<Vector<DMatch>>::new();
    cv(
        "knn match",
        matcher.knn_train_match(&desc_test, &desc_golden, &mut knn_matches, 2, &no_array(), false),
    )?;

    // Lowe ratio test prunes ambiguous correspondences
    let mut good = Vec::new();
    for pair in knn_matches.iter() {
        if pair.len() == 2 {
            let first = cv("knn pair", pair.get(0))?;
            let second = cv("knn pair", pair.get(1))?;
            if first.distance < config.sift_ratio_threshold * second.distance {
                good.push(first);
            }
        }
    }
    if good.len() < config.min_match_count {
        return unaligned(
            test,
            RegistrationMethod::FeatureAccurate,
            WEAK_MATCH_CONFIDENCE,
        );
    }

    let avg_distance =
        good.iter().map(|m| m.distance as f64).sum::<f64>() / good.len() as f64;
    let base_confidence = 1.0 - (avg_distance / SIFT_DISTANCE_SCALE).min(1.0);

    finish_homography(
        golden,
        test,
        &kp_golden,
        &kp_test,
        &good,
        base_confidence,
        RegistrationMethod::FeatureAccurate,
        config,
    )
}

fn detect(
    detector: &mut impl Feature2DTrait,
    gray: &Mat,
) -> Result<(Vector<KeyPoint>, Mat)> {
    let mut keypoints = Vector::<KeyPoint>::new();
    let mut descriptors = Mat::default();
    cv(
        "detect features",
        detector.detect_and_compute(gray, &no_array(), &mut keypoints, &mut descriptors, false),
    )?;
    Ok((keypoints, descriptors))
}

/// Estimate the RANSAC homography from matched keypoints, scale confidence by
/// the inlier ratio, and warp
#[allow(clippy::too_many_arguments)]
fn finish_homography(
    golden: &Mat,
    test: &Mat,
    kp_golden: &Vector<KeyPoint>,
    kp_test: &Vector<KeyPoint>,
    good: &[DMatch],
    base_confidence: f64,
    method: RegistrationMethod,
    config: &AlignmentConfig,
) -> Result<RegistrationResult> {
    let mut src_points = Vector::<Point2f>::new();
    let mut dst_points = Vector::<Point2f>::new();
    for m in good {
        src_points.push(cv("test keypoint", kp_test.get(m.query_idx as usize))?.pt());
        dst_points.push(cv("golden keypoint", kp_golden.get(m.train_idx as usize))?.pt());
    }

    let mut inlier_mask = Mat::default();
    let homography = cv(
        "estimate homography",
        calib3d::find_homography(
            &src_points,
            &dst_points,
            &mut inlier_mask,
            calib3d::RANSAC,
            config.ransac_reproj_threshold,
        ),
    )?;
    if homography.empty() {
        return unaligned(test, method, WEAK_MATCH_CONFIDENCE);
    }

    let inliers = cv("count inliers", core::count_non_zero(&inlier_mask))? as f64;
    let inlier_ratio = inliers / good.len() as f64;
    let confidence = (base_confidence * inlier_ratio).clamp(0.0, 1.0);

    if confidence < config.confidence_floor {
        return unaligned(test, method, confidence);
    }

    let dx = *cv("homography dx", homography.at_2d::<f64>(0, 2))?;
    let dy = *cv("homography dy", homography.at_2d::<f64>(1, 2))?;
    let (aligned, validity_mask) =
        warp_with_mask(test, &homography, cv("golden size", golden.size())?)?;

    Ok(RegistrationResult {
        aligned,
        translation: (dx, dy),
        confidence,
        validity_mask,
        method_used: method,
    })
}
