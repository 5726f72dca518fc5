//! Structural pre-check
//!
//! Computes a windowed SSIM score over an aligned golden/test pair. A high
//! score lets the pipeline skip the more expensive pixel-level stage entirely;
//! a low score flags structural divergence early. The per-pixel similarity
//! map is also rendered as a JET heatmap for operator review.

use opencv::core::{self, no_array, Mat, Scalar, Size};
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::PrecheckConfig;
use crate::constants::precheck::{C1, C2, WINDOW_SIGMA, WINDOW_SIZE};
use crate::error::{cv, Result};
use crate::image_utils::to_gray;

/// Outcome of the structural pre-check
#[derive(Debug)]
pub struct PrecheckResult {
    /// Mean SSIM over the frame, in [-1, 1] (practically [0, 1] for images)
    pub score: f64,
    /// True when `score` clears the configured pass threshold
    pub passed: bool,
    /// JET-colored dissimilarity heatmap, bright where structure diverges
    pub heatmap: Mat,
}

/// Run the structural pre-check on an aligned pair.
pub fn run(golden: &Mat, test: &Mat, config: &PrecheckConfig) -> Result<PrecheckResult> {
    let (score, ssim_map) = ssim(golden, test)?;
    let heatmap = dissimilarity_heatmap(&ssim_map)?;
    Ok(PrecheckResult {
        score,
        passed: score >= config.pass_threshold,
        heatmap,
    })
}

/// Windowed SSIM between two same-sized images.
///
/// Classic Wang et al. formulation on 8-bit intensity: 11x11 Gaussian window
/// with sigma 1.5, stabilizers C1/C2 for the 255-level dynamic range. Returns
/// the mean score together with the full per-pixel similarity map (CV_32F).
pub fn ssim(golden: &Mat, test: &Mat) -> Result<(f64, Mat)> {
    let i1 = to_float_gray(golden)?;
    let i2 = to_float_gray(test)?;

    let mu1 = blur(&i1)?;
    let mu2 = blur(&i2)?;

    let mu1_sq = multiply(&mu1, &mu1)?;
    let mu2_sq = multiply(&mu2, &mu2)?;
    let mu1_mu2 = multiply(&mu1, &mu2)?;

    let sigma1_sq = subtract(&blur(&multiply(&i1, &i1)?)?, &mu1_sq)?;
    let sigma2_sq = subtract(&blur(&multiply(&i2, &i2)?)?, &mu2_sq)?;
    let sigma12 = subtract(&blur(&multiply(&i1, &i2)?)?, &mu1_mu2)?;

    // ((2*mu1*mu2 + C1) * (2*sigma12 + C2)) /
    // ((mu1^2 + mu2^2 + C1) * (sigma1^2 + sigma2^2 + C2))
    let t1 = add_scalar(&scale(&mu1_mu2, 2.0)?, C1)?;
    let t2 = add_scalar(&scale(&sigma12, 2.0)?, C2)?;
    let numerator = multiply(&t1, &t2)?;

    let t3 = add_scalar(&add(&mu1_sq, &mu2_sq)?, C1)?;
    let t4 = add_scalar(&add(&sigma1_sq, &sigma2_sq)?, C2)?;
    let denominator = multiply(&t3, &t4)?;

    let mut ssim_map = Mat::default();
    cv(
        "ssim divide",
        core::divide2(&numerator, &denominator, &mut ssim_map, 1.0, -1),
    )?;

    let mean = cv("ssim mean", core::mean(&ssim_map, &no_array()))?;
    Ok((mean[0], ssim_map))
}

/// Render a CV_32F similarity map as a JET heatmap highlighting dissimilarity
fn dissimilarity_heatmap(ssim_map: &Mat) -> Result<Mat> {
    // 1 - ssim, scaled to 8-bit; saturation handles the rare negative scores
    let mut dissimilarity = Mat::default();
    cv(
        "invert ssim map",
        ssim_map.convert_to(&mut dissimilarity, core::CV_8U, -255.0, 255.0),
    )?;
    let mut heatmap = Mat::default();
    cv(
        "colorize heatmap",
        imgproc::apply_color_map(&dissimilarity, &mut heatmap, imgproc::COLORMAP_JET),
    )?;
    Ok(heatmap)
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

fn blur(image: &Mat) -> Result<Mat> {
    let mut blurred = Mat::default();
    cv(
        "gaussian window",
        imgproc::gaussian_blur(
            image,
            &mut blurred,
            Size::new(WINDOW_SIZE, WINDOW_SIZE),
            WINDOW_SIGMA,
            WINDOW_SIGMA,
            core::BORDER_DEFAULT,
        ),
    )?;
    Ok(blurred)
}

fn multiply(a: &Mat, b: &Mat) -> Result<Mat> {
    let mut out = Mat::default();
    cv("elementwise multiply", core::multiply(a, b, &mut out, 1.0, -1))?;
    Ok(out)
}

fn add(a: &Mat, b: &Mat) -> Result<Mat> {
    let mut out = Mat::default();
    cv("elementwise add", core::add(a, b, &mut out, &no_array(), -1))?;
    Ok(out)
}

fn subtract(a: &Mat, b: &Mat) -> Result<Mat> {
    let mut out = Mat::default();
    cv(
        "elementwise subtract",
        core::subtract(a, b, &mut out, &no_array(), -1),
    )?;
    Ok(out)
}

fn add_scalar(a: &Mat, value: f64) -> Result<Mat> {
    let mut out = Mat::default();
    cv(
        "scalar add",
        core::add(a, &Scalar::all(value), &mut out, &no_array(), -1),
    )?;
    Ok(out)
}

fn scale(a: &Mat, factor: f64) -> Result<Mat> {
    let mut out = Mat::default();
    cv("scale", a.convert_to(&mut out, -1, factor, 0.0))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Rect, CV_8UC3};

    fn gradient_image(rows: i32, cols: i32) -> Mat {
        let mut image =
            Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(0.0)).unwrap();
        for x in 0..cols {
            let v = (x * 255 / cols) as f64;
            imgproc::rectangle(
                &mut image,
                Rect::new(x, 0, 1, rows),
                Scalar::new(v, 255.0 - v, 128.0, 0.0),
                -1,
                imgproc::LINE_8,
                0,
            )
            .unwrap();
        }
        image
    }

    #[test]
    fn test_identical_images_score_one() {
        let image = gradient_image(96, 128);
        let (score, map) = ssim(&image, &image).unwrap();
        assert!(score > 0.999, "identical pair scored {}", score);
        assert_eq!(map.size().unwrap(), image.size().unwrap());
    }

    #[test]
    fn test_structural_change_lowers_score() {
        let golden = gradient_image(96, 128);
        let mut test = golden.try_clone().unwrap();
        imgproc::rectangle(
            &mut test,
            Rect::new(40, 30, 40, 30),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let (perturbed, _) = ssim(&golden, &test).unwrap();
        let (clean, _) = ssim(&golden, &golden).unwrap();
        assert!(perturbed < clean - 0.01);
    }

    #[test]
    fn test_run_applies_pass_threshold() {
        let image = gradient_image(96, 128);
        let config = PrecheckConfig {
            enabled: true,
            pass_threshold: 0.9,
        };
        let result = run(&image, &image, &config).unwrap();
        assert!(result.passed);
        assert_eq!(result.heatmap.channels(), 3);

        let strict = PrecheckConfig {
            enabled: true,
            pass_threshold: 1.1,
        };
        assert!(!run(&image, &image, &strict).unwrap().passed);
    }
}
