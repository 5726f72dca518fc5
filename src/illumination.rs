//! Illumination normalization for golden/test image pairs
//!
//! Lighting drift between the capture of the golden sample and a test panel
//! shows up as a broad intensity offset that the pixel-difference stage would
//! otherwise flag as a diffuse anomaly. The normalizers here suppress that
//! before differencing; histogram matching of the test image onto the golden
//! image is the recommended method for master-vs-test comparison.

use opencv::core::{Mat, Vector, CV_8U};
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::{IlluminationConfig, NormalizeMethod};
use crate::error::{cv, InspectError, Result};
use crate::image_utils::equalize_histogram_gray;

/// Normalize a golden/test pair per the configured method.
///
/// Returns `(golden, test)` with the transform applied; for
/// [`NormalizeMethod::MatchHistogram`] only the test image is transformed,
/// the golden image is returned untouched.
pub fn preprocess_pair(golden: &Mat, test: &Mat, config: &IlluminationConfig) -> Result<(Mat, Mat)> {
    if !config.enabled {
        return Ok((
            cv("clone golden", golden.try_clone())?,
            cv("clone test", test.try_clone())?,
        ));
    }

    match config.method {
        NormalizeMethod::MatchHistogram => Ok((
            cv("clone golden", golden.try_clone())?,
            match_histograms(test, golden)?,
        )),
        NormalizeMethod::ClaheBoth => Ok((
            apply_clahe(golden, config.clahe_clip_limit, config.clahe_tile_size)?,
            apply_clahe(test, config.clahe_clip_limit, config.clahe_tile_size)?,
        )),
        NormalizeMethod::NormalizeBoth => Ok((
            mean_std_normalization(golden, config.target_mean, config.target_std)?,
            mean_std_normalization(test, config.target_mean, config.target_std)?,
        )),
        NormalizeMethod::None => Ok((
            cv("clone golden", golden.try_clone())?,
            cv("clone test", test.try_clone())?,
        )),
    }
}

/// Match the histogram of `source` to `reference`, channel-wise in Lab space
pub fn match_histograms(source: &Mat, reference: &Mat) -> Result<Mat> {
    let source_lab = to_lab(source)?;
    let reference_lab = to_lab(reference)?;

    let mut src_channels = Vector::<Mat>::new();
    let mut ref_channels = Vector::<Mat>::new();
    cv("split source", opencv::core::split(&source_lab, &mut src_channels))?;
    cv("split reference", opencv::core::split(&reference_lab, &mut ref_channels))?;

    let mut matched_channels = Vector::<Mat>::new();
    for i in 0..3 {
        let src = cv("channel access", src_channels.get(i))?;
        let reference = cv("channel access", ref_channels.get(i))?;
        matched_channels.push(match_channel_histogram(&src, &reference)?);
    }

    let mut matched_lab = Mat::default();
    cv("merge channels", opencv::core::merge(&matched_channels, &mut matched_lab))?;
    from_lab(&matched_lab)
}

/// Match the histogram of one u8 channel to a reference channel via CDF lookup
fn match_channel_histogram(source: &Mat, reference: &Mat) -> Result<Mat> {
    let src_cdf = cumulative_histogram(source)?;
    let ref_cdf = cumulative_histogram(reference)?;

    // For each source level, the reference level with the nearest CDF value
    let mut lookup = [0u8; 256];
    for (i, slot) in lookup.iter_mut().enumerate() {
        let target = src_cdf[i];
        let mut j = 0usize;
        while j < 255 && ref_cdf[j] < target {
            j += 1;
        }
        *slot = j as u8;
    }

    let mut matched = cv("clone channel", source.try_clone())?;
    for row in 0..matched.rows() {
        for col in 0..matched.cols() {
            let value = *cv("pixel read", matched.at_2d::<u8>(row, col))?;
            *cv("pixel write", matched.at_2d_mut::<u8>(row, col))? = lookup[value as usize];
        }
    }
    Ok(matched)
}

/// Normalized cumulative histogram of a u8 single-channel Mat
fn cumulative_histogram(channel: &Mat) -> Result<[f64; 256]> {
    let mut hist = [0u64; 256];
    for row in 0..channel.rows() {
        for col in 0..channel.cols() {
            let value = *cv("pixel read", channel.at_2d::<u8>(row, col))?;
            hist[value as usize] += 1;
        }
    }

    let total: u64 = hist.iter().sum();
    if total == 0 {
        return Err(InspectError::Processing(
            "cannot build histogram of empty channel".into(),
        ));
    }

    let mut cdf = [0f64; 256];
    let mut running = 0u64;
    for i in 0..256 {
        running += hist[i];
        cdf[i] = running as f64 / total as f64;
    }
    Ok(cdf)
}

/// CLAHE on the lightness channel of a BGR image
pub fn apply_clahe(image: &Mat, clip_limit: f64, tile_size: i32) -> Result<Mat> {
    let lab = to_lab(image)?;

    let mut channels = Vector::<Mat>::new();
    cv("split Lab", opencv::core::split(&lab, &mut channels))?;

    let l_channel = cv("L channel access", channels.get(0))?;
    let l_equalized = equalize_histogram_gray(&l_channel, clip_limit, tile_size)?;

    let mut merged_channels = Vector::<Mat>::new();
    merged_channels.push(l_equalized);
    merged_channels.push(cv("a channel access", channels.get(1))?);
    merged_channels.push(cv("b channel access", channels.get(2))?);

    let mut lab_equalized = Mat::default();
    cv("merge Lab", opencv::core::merge(&merged_channels, &mut lab_equalized))?;
    from_lab(&lab_equalized)
}

/// Normalize a BGR image to a target per-channel mean and standard deviation
pub fn mean_std_normalization(image: &Mat, target_mean: f64, target_std: f64) -> Result<Mat> {
    let mut channels = Vector::<Mat>::new();
    cv("split channels", opencv::core::split(image, &mut channels))?;

    let mut normalized_channels = Vector::<Mat>::new();
    for i in 0..channels.len() {
        let channel = cv("channel access", channels.get(i))?;

        let mut mean = Mat::default();
        let mut stddev = Mat::default();
        cv(
            "mean/std computation",
            opencv::core::mean_std_dev(&channel, &mut mean, &mut stddev, &opencv::core::no_array()),
        )?;
        let mean = *cv("mean read", mean.at::<f64>(0))?;
        let stddev = cv("std read", stddev.at::<f64>(0))?.max(1e-6);

        // normalized = x * (t_std / std) + (t_mean - mean * t_std / std),
        // expressed as one saturating convert_to
        let alpha = target_std / stddev;
        let beta = target_mean - mean * alpha;
        let mut normalized = Mat::default();
        cv("normalize channel", channel.convert_to(&mut normalized, CV_8U, alpha, beta))?;
        normalized_channels.push(normalized);
    }

    let mut result = Mat::default();
    cv("merge channels", opencv::core::merge(&normalized_channels, &mut result))?;
    Ok(result)
}

fn to_lab(image: &Mat) -> Result<Mat> {
    let mut lab = Mat::default();
    cv(
        "Lab conversion",
        imgproc::cvt_color(
            image,
            &mut lab,
            imgproc::COLOR_BGR2Lab,
            0,
        ),
    )?;
    Ok(lab)
}

fn from_lab(lab: &Mat) -> Result<Mat> {
    let mut bgr = Mat::default();
    cv(
        "Lab to BGR conversion",
        imgproc::cvt_color(
            lab,
            &mut bgr,
            imgproc::COLOR_Lab2BGR,
            0,
        ),
    )?;
    Ok(bgr)
}
