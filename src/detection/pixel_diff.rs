//! Pixel-level difference detector
//!
//! Compares an aligned test image against its golden reference through
//! absolute grayscale differencing, thresholding, and morphological noise
//! suppression. The warp validity mask gates every stage so border fill from
//! registration never counts as a defect.

use log::debug;
use opencv::core::{self, no_array, Mat, Point, Scalar, Size, Vector};
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::PixelMatchConfig;
use crate::constants::detection::{CLAHE_CLIP_LIMIT, CLAHE_TILE_SIZE, CONFIDENCE_DECAY};
use crate::detection::{DetectionResult, Verdict};
use crate::error::{cv, Result};
use crate::image_utils::{equalize_histogram_gray, rect_kernel, to_gray, zero_mask};

/// Smoothing window applied to the raw difference before thresholding
const DIFF_BLUR_SIZE: i32 = 5;
/// Block size of the adaptive threshold variant
const ADAPTIVE_BLOCK_SIZE: i32 = 11;
/// Offset of the adaptive threshold variant; negative keeps it sensitive
const ADAPTIVE_OFFSET: f64 = -5.0;

/// Detector over aligned pairs, parameterized once at construction
#[derive(Debug)]
pub struct PixelDiffDetector {
    config: PixelMatchConfig,
}

impl PixelDiffDetector {
    pub fn new(config: PixelMatchConfig) -> Self {
        Self { config }
    }

    /// Run detection on an aligned pair.
    ///
    /// `validity_mask` marks which pixels carry real warped data; everything
    /// else is excluded from both the defect mask and the area ratio.
    pub fn detect(
        &self,
        golden: &Mat,
        aligned: &Mat,
        validity_mask: &Mat,
    ) -> Result<DetectionResult> {
        self.detect_in_roi(golden, aligned, validity_mask, None)
    }

    /// Like [`detect`](Self::detect), but restricted to a caller-supplied
    /// region of interest. The ROI mask is intersected with the validity
    /// mask, so only pixels inside both count toward the verdict.
    pub fn detect_in_roi(
        &self,
        golden: &Mat,
        aligned: &Mat,
        validity_mask: &Mat,
        roi_mask: Option<&Mat>,
    ) -> Result<DetectionResult> {
        let analysis_mask = match roi_mask {
            Some(roi) => {
                let mut combined = Mat::default();
                cv(
                    "intersect roi with validity",
                    core::bitwise_and(validity_mask, roi, &mut combined, &no_array()),
                )?;
                combined
            }
            None => cv("clone validity mask", validity_mask.try_clone())?,
        };

        let difference = self.masked_difference(golden, aligned, &analysis_mask)?;

        let binary = if self.config.multi_scale {
            self.multi_scale_mask(&difference)?
        } else {
            self.single_scale_mask(&difference)?
        };

        // Dilation can push flagged pixels past the mask boundary; clip them
        // back so the count stays inside the region the ratio is measured on
        let mut clipped = Mat::default();
        cv(
            "clip defects to mask",
            core::bitwise_and(&binary, &analysis_mask, &mut clipped, &no_array()),
        )?;

        self.score(&clipped, &analysis_mask, &difference, aligned)
    }

    /// Grayscale + optional CLAHE + absolute difference + smoothing, gated by
    /// the validity mask
    fn masked_difference(&self, golden: &Mat, aligned: &Mat, validity_mask: &Mat) -> Result<Mat> {
        let mut golden_gray = to_gray(golden)?;
        let mut test_gray = to_gray(aligned)?;
        if self.config.use_histogram_equalization {
            golden_gray = equalize_histogram_gray(&golden_gray, CLAHE_CLIP_LIMIT, CLAHE_TILE_SIZE)?;
            test_gray = equalize_histogram_gray(&test_gray, CLAHE_CLIP_LIMIT, CLAHE_TILE_SIZE)?;
        }

        let mut difference = Mat::default();
        cv(
            "absolute difference",
            core::absdiff(&golden_gray, &test_gray, &mut difference),
        )?;

        let mut blurred = Mat::default();
        cv(
            "smooth difference",
            imgproc::gaussian_blur(
                &difference,
                &mut blurred,
                Size::new(DIFF_BLUR_SIZE, DIFF_BLUR_SIZE),
                0.0,
                0.0,
                core::BORDER_DEFAULT,
            ),
        )?;

        let mut masked = Mat::default();
        cv(
            "apply validity mask",
            core::bitwise_and(&blurred, &blurred, &mut masked, validity_mask),
        )?;
        Ok(masked)
    }

    fn threshold(&self, difference: &Mat) -> Result<Mat> {
        let mut binary = Mat::default();
        if self.config.use_adaptive_threshold {
            cv(
                "adaptive threshold",
                imgproc::adaptive_threshold(
                    difference,
                    &mut binary,
                    255.0,
                    imgproc::ADAPTIVE_THRESH_GAUSSIAN_C,
                    imgproc::THRESH_BINARY,
                    ADAPTIVE_BLOCK_SIZE,
                    ADAPTIVE_OFFSET,
                ),
            )?;
        } else {
            // Otsu picks the split point from the difference histogram, which
            // corrects for lighting bias the nominal level alone would miss
            cv(
                "fixed threshold",
                imgproc::threshold(
                    difference,
                    &mut binary,
                    self.config.pixel_threshold as f64,
                    255.0,
                    imgproc::THRESH_BINARY | imgproc::THRESH_OTSU,
                ),
            )?;
        }
        Ok(binary)
    }

    /// Open to kill speckle, close to seal holes, dilate to merge fragments
    fn single_scale_mask(&self, difference: &Mat) -> Result<Mat> {
        let binary = self.threshold(difference)?;
        let kernel = rect_kernel(self.config.kernel_size)?;
        let cleaned = morphology(&binary, imgproc::MORPH_OPEN, &kernel, 1)?;
        let cleaned = morphology(&cleaned, imgproc::MORPH_CLOSE, &kernel, 1)?;
        dilate(&cleaned, &kernel, self.config.dilation_iterations)
    }

    /// Run open/close at several kernel sizes and union the survivors, so
    /// both fine scratches and broad blotches make it through
    fn multi_scale_mask(&self, difference: &Mat) -> Result<Mat> {
        let binary = self.threshold(difference)?;

        let mut union = zero_mask(binary.rows(), binary.cols())?;
        for &size in &self.config.multi_scale_kernels {
            let kernel = rect_kernel(size)?;
            let cleaned = morphology(&binary, imgproc::MORPH_OPEN, &kernel, 1)?;
            let cleaned = morphology(&cleaned, imgproc::MORPH_CLOSE, &kernel, 1)?;

            let mut merged = Mat::default();
            cv(
                "union scales",
                core::bitwise_or(&union, &cleaned, &mut merged, &no_array()),
            )?;
            union = merged;
        }

        // Same final dilation as the single-scale pass, so the union is a
        // strict superset of the single-scale mask whenever kernel_size is
        // among the multi-scale kernels
        let kernel = rect_kernel(self.config.kernel_size)?;
        dilate(&union, &kernel, self.config.dilation_iterations)
    }

    /// Drop sub-threshold blobs, then derive verdict and confidence from the
    /// surviving anomalous area
    fn score(
        &self,
        binary: &Mat,
        validity_mask: &Mat,
        difference: &Mat,
        aligned: &Mat,
    ) -> Result<DetectionResult> {
        let mut contours = Vector::<Vector<Point>>::new();
        cv(
            "find contours",
            imgproc::find_contours(
                binary,
                &mut contours,
                imgproc::RETR_EXTERNAL,
                imgproc::CHAIN_APPROX_SIMPLE,
                Point::default(),
            ),
        )?;

        let mut kept = Vector::<Vector<Point>>::new();
        for contour in contours.iter() {
            let area = cv("contour area", imgproc::contour_area(&contour, false))?;
            if area >= self.config.min_blob_area {
                kept.push(contour);
            }
        }

        let mut defect_mask = zero_mask(binary.rows(), binary.cols())?;
        if !kept.is_empty() {
            cv(
                "rasterize defects",
                imgproc::draw_contours(
                    &mut defect_mask,
                    &kept,
                    -1,
                    Scalar::all(255.0),
                    imgproc::FILLED,
                    imgproc::LINE_8,
                    &no_array(),
                    i32::MAX,
                    Point::default(),
                ),
            )?;
        }

        let anomaly_pixel_count = cv("count anomalies", core::count_non_zero(&defect_mask))?;
        let valid_pixels = cv("count valid", core::count_non_zero(validity_mask))?.max(1);
        let anomaly_ratio = anomaly_pixel_count as f64 / valid_pixels as f64;
        let anomaly_area_percent = anomaly_ratio * 100.0;

        let verdict = if anomaly_area_percent > self.config.area_threshold
            || anomaly_pixel_count > self.config.count_threshold
        {
            Verdict::Anomaly
        } else {
            Verdict::Normal
        };
        let confidence = (1.0 - CONFIDENCE_DECAY * anomaly_ratio).clamp(0.0, 1.0);

        debug!(
            "pixel diff: {} anomalous px ({:.3}%), verdict {}",
            anomaly_pixel_count, anomaly_area_percent, verdict
        );

        let heatmap = render_heatmap(difference)?;
        let contour_overlay = render_overlay(aligned, &kept)?;

        Ok(DetectionResult {
            verdict,
            anomaly_pixel_count,
            anomaly_area_percent,
            valid_pixel_count: valid_pixels,
            confidence,
            defect_mask,
            contours: kept,
            heatmap,
            contour_overlay,
        })
    }
}

/// JET rendering of the raw intensity difference for operator review
fn render_heatmap(difference: &Mat) -> Result<Mat> {
    let mut heatmap = Mat::default();
    cv(
        "difference heatmap",
        imgproc::apply_color_map(difference, &mut heatmap, imgproc::COLORMAP_JET),
    )?;
    Ok(heatmap)
}

/// Red defect outlines over a dimmed copy of the aligned test image
fn render_overlay(aligned: &Mat, contours: &Vector<Vector<Point>>) -> Result<Mat> {
    let mut overlay = Mat::default();
    cv("dim aligned", aligned.convert_to(&mut overlay, -1, 0.55, 0.0))?;
    if !contours.is_empty() {
        cv(
            "outline defects",
            imgproc::draw_contours(
                &mut overlay,
                contours,
                -1,
                Scalar::new(0.0, 0.0, 255.0, 0.0),
                2,
                imgproc::LINE_8,
                &no_array(),
                i32::MAX,
                Point::default(),
            ),
        )?;
    }
    Ok(overlay)
}

fn morphology(src: &Mat, op: i32, kernel: &Mat, iterations: i32) -> Result<Mat> {
    let mut out = Mat::default();
    cv(
        "morphology",
        imgproc::morphology_ex(
            src,
            &mut out,
            op,
            kernel,
            Point::new(-1, -1),
            iterations,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value().unwrap_or_default(),
        ),
    )?;
    Ok(out)
}

fn dilate(src: &Mat, kernel: &Mat, iterations: i32) -> Result<Mat> {
    let mut out = Mat::default();
    cv(
        "dilate",
        imgproc::dilate(
            src,
            &mut out,
            kernel,
            Point::new(-1, -1),
            iterations,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value().unwrap_or_default(),
        ),
    )?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_utils::full_mask;
    use opencv::core::{Rect, CV_8UC3};

    fn board(rows: i32, cols: i32) -> Mat {
        let mut image =
            Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(40.0)).unwrap();
        imgproc::rectangle(
            &mut image,
            Rect::new(30, 30, 140, 60),
            Scalar::new(190.0, 160.0, 80.0, 0.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        image
    }

    #[test]
    fn test_identical_pair_is_normal() {
        let golden = board(200, 240);
        let mask = full_mask(200, 240).unwrap();
        let detector = PixelDiffDetector::new(PixelMatchConfig::default());

        let result = detector.detect(&golden, &golden, &mask).unwrap();
        assert_eq!(result.verdict, Verdict::Normal);
        assert_eq!(result.anomaly_pixel_count, 0);
        assert!((result.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_injected_defect_is_flagged() {
        let golden = board(200, 240);
        let mut test = golden.try_clone().unwrap();
        // A bright blob well above the pixel threshold and blob-area floor
        imgproc::rectangle(
            &mut test,
            Rect::new(60, 120, 80, 60),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let mask = full_mask(200, 240).unwrap();
        let config = PixelMatchConfig {
            count_threshold: 1000,
            ..PixelMatchConfig::default()
        };
        let detector = PixelDiffDetector::new(config);

        let result = detector.detect(&golden, &test, &mask).unwrap();
        assert_eq!(result.verdict, Verdict::Anomaly);
        assert!(result.anomaly_pixel_count >= 80 * 60 / 2);
        assert!(!result.contours.is_empty());
        assert!(result.confidence < 1.0);
        assert_eq!(result.heatmap.channels(), 3);
        assert_eq!(
            result.contour_overlay.size().unwrap(),
            result.defect_mask.size().unwrap()
        );
    }

    #[test]
    fn test_validity_mask_excludes_border_artifacts() {
        let golden = board(200, 240);
        let mut test = golden.try_clone().unwrap();
        // Difference confined to a border strip the mask rules out
        imgproc::rectangle(
            &mut test,
            Rect::new(0, 0, 240, 20),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let mut mask = full_mask(200, 240).unwrap();
        imgproc::rectangle(
            &mut mask,
            Rect::new(0, 0, 240, 30),
            Scalar::all(0.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let detector = PixelDiffDetector::new(PixelMatchConfig::default());
        let result = detector.detect(&golden, &test, &mask).unwrap();
        assert_eq!(result.verdict, Verdict::Normal);
        assert_eq!(result.anomaly_pixel_count, 0);
    }

    #[test]
    fn test_tiny_blobs_filtered_as_noise() {
        let golden = board(200, 240);
        let mut test = golden.try_clone().unwrap();
        imgproc::rectangle(
            &mut test,
            Rect::new(100, 150, 3, 3),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let mask = full_mask(200, 240).unwrap();
        let detector = PixelDiffDetector::new(PixelMatchConfig::default());
        let result = detector.detect(&golden, &test, &mask).unwrap();
        assert_eq!(result.verdict, Verdict::Normal);
    }

    #[test]
    fn test_roi_mask_excludes_outside_defects() {
        let golden = board(200, 240);
        let mut test = golden.try_clone().unwrap();
        imgproc::rectangle(
            &mut test,
            Rect::new(60, 120, 80, 60),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let mask = full_mask(200, 240).unwrap();
        // Inspection region covering only the top half, away from the defect
        let mut roi = zero_mask(200, 240).unwrap();
        imgproc::rectangle(
            &mut roi,
            Rect::new(0, 0, 240, 100),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let config = PixelMatchConfig {
            count_threshold: 1000,
            ..PixelMatchConfig::default()
        };
        let detector = PixelDiffDetector::new(config);

        let unrestricted = detector
            .detect_in_roi(&golden, &test, &mask, None)
            .unwrap();
        assert_eq!(unrestricted.verdict, Verdict::Anomaly);

        let restricted = detector
            .detect_in_roi(&golden, &test, &mask, Some(&roi))
            .unwrap();
        assert_eq!(restricted.verdict, Verdict::Normal);
        assert_eq!(restricted.anomaly_pixel_count, 0);
    }

    #[test]
    fn test_otsu_flags_defects_below_nominal_level() {
        let golden = board(200, 240);
        let mut test = golden.try_clone().unwrap();
        // Gray-level step of ~120, well under the nominal threshold below
        imgproc::rectangle(
            &mut test,
            Rect::new(60, 120, 80, 60),
            Scalar::all(160.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let mask = full_mask(200, 240).unwrap();
        let config = PixelMatchConfig {
            pixel_threshold: 200,
            count_threshold: 1000,
            use_histogram_equalization: false,
            ..PixelMatchConfig::default()
        };
        let detector = PixelDiffDetector::new(config);

        let result = detector.detect(&golden, &test, &mask).unwrap();
        assert_eq!(result.verdict, Verdict::Anomaly);
        assert!(result.anomaly_pixel_count > 1000);
    }

    #[test]
    fn test_defect_mask_stays_inside_validity_mask() {
        let golden = board(200, 240);
        let mut test = golden.try_clone().unwrap();
        // Defect flush against the left edge of the valid region, so any
        // dilation spill would land on masked-out pixels
        imgproc::rectangle(
            &mut test,
            Rect::new(40, 80, 60, 50),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let mut mask = full_mask(200, 240).unwrap();
        imgproc::rectangle(
            &mut mask,
            Rect::new(0, 0, 40, 200),
            Scalar::all(0.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let config = PixelMatchConfig {
            count_threshold: 1000,
            ..PixelMatchConfig::default()
        };
        let detector = PixelDiffDetector::new(config);
        let result = detector.detect(&golden, &test, &mask).unwrap();
        assert_eq!(result.verdict, Verdict::Anomaly);

        let mut inverted = Mat::default();
        core::bitwise_not(&mask, &mut inverted, &no_array()).unwrap();
        let mut outside = Mat::default();
        core::bitwise_and(&result.defect_mask, &inverted, &mut outside, &no_array()).unwrap();
        assert_eq!(core::count_non_zero(&outside).unwrap(), 0);
    }

    #[test]
    fn test_multi_scale_catches_defect() {
        let golden = board(200, 240);
        let mut test = golden.try_clone().unwrap();
        imgproc::rectangle(
            &mut test,
            Rect::new(60, 120, 80, 60),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let mask = full_mask(200, 240).unwrap();
        let config = PixelMatchConfig {
            multi_scale: true,
            count_threshold: 1000,
            ..PixelMatchConfig::default()
        };
        let detector = PixelDiffDetector::new(config);
        let result = detector.detect(&golden, &test, &mask).unwrap();
        assert_eq!(result.verdict, Verdict::Anomaly);
    }
}
