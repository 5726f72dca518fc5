//! Template-matching inspection
//!
//! Divides the golden image into a grid of patches and hunts for each patch
//! in the test image around its expected position. Because every patch is
//! relocated independently, small camera drift between captures does not
//! masquerade as a defect the way it would in a rigid pixel comparison.

use log::debug;
use opencv::core::{self, no_array, Mat, Point, Rect, Size};
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::SegmentationConfig;
use crate::detection::Verdict;
use crate::error::{cv, Result};
use crate::image_utils::{to_gray, zero_mask};

/// Intensity difference threshold inside a matched patch
const PATCH_DIFF_THRESHOLD: f64 = 30.0;
/// Speckle-removal kernel for patch difference masks
const PATCH_OPEN_KERNEL: i32 = 3;

/// One golden patch and where (if anywhere) it was found in the test image
#[derive(Debug, Clone)]
pub struct TemplatePatch {
    /// Row-major patch index
    pub index: usize,
    /// Patch bounds in the golden image
    pub rect: Rect,
    /// Best normalized cross-correlation in the search window
    pub match_score: f64,
    /// Where the patch matched in the test image, when it cleared the floor
    pub match_rect: Option<Rect>,
    /// Anomalous pixels inside the matched patch
    pub anomaly_pixels: i32,
}

/// Whole-frame outcome of a template inspection
#[derive(Debug)]
pub struct TemplateInspection {
    pub verdict: Verdict,
    /// Total anomalous pixels across all matched patches
    pub anomaly_pixel_count: i32,
    /// Anomalous pixels as a percentage of the frame
    pub anomaly_area_percent: f64,
    /// Percentage of patches that found a valid match
    pub match_rate: f64,
    /// Fraction of patches matched, doubling as overall confidence
    pub confidence: f64,
    pub patches: Vec<TemplatePatch>,
    /// Anomalous pixels in golden coordinates (CV_8UC1)
    pub defect_mask: Mat,
}

pub struct TemplateMatcher {
    grid_cols: i32,
    grid_rows: i32,
    match_threshold: f64,
    search_margin: i32,
    min_anomaly_area: i32,
}

impl TemplateMatcher {
    pub fn new(config: &SegmentationConfig) -> Self {
        Self {
            grid_cols: config.template_grid_cols,
            grid_rows: config.template_grid_rows,
            match_threshold: config.template_match_threshold,
            search_margin: config.template_search_margin,
            min_anomaly_area: config.template_min_anomaly_area,
        }
    }

    /// Run the full template inspection. `test` is resized to the golden
    /// frame if the captures differ in size.
    pub fn inspect(&self, golden: &Mat, test: &Mat) -> Result<TemplateInspection> {
        let golden_size = cv("golden size", golden.size())?;
        let test = crate::image_utils::resize_to(test, golden_size)?;

        let golden_gray = to_gray(golden)?;
        let test_gray = to_gray(&test)?;

        let mut defect_mask = zero_mask(golden.rows(), golden.cols())?;
        let mut patches = Vec::new();
        let mut total_anomaly = 0i32;
        let mut matched = 0usize;

        for (index, rect) in self.patch_rects(golden).into_iter().enumerate() {
            let mut patch = self.locate_patch(index, rect, &golden_gray, &test_gray)?;
            if let Some(match_rect) = patch.match_rect {
                matched += 1;
                let (diff_mask, count) =
                    compare_patch(&golden_gray, &test_gray, rect, match_rect)?;
                patch.anomaly_pixels = count;
                total_anomaly += count;

                // Paint the patch's differences at its golden-frame position
                let paste = Rect::new(rect.x, rect.y, diff_mask.cols(), diff_mask.rows());
                let mut roi = cv("mask roi", Mat::roi_mut(&mut defect_mask, paste))?;
                cv(
                    "merge patch mask",
                    diff_mask.copy_to_masked(&mut roi, &diff_mask),
                )?;
            }
            patches.push(patch);
        }

        let total = patches.len().max(1);
        let match_rate = matched as f64 / total as f64 * 100.0;
        let frame_pixels = (golden.rows() * golden.cols()).max(1) as f64;
        let verdict = if total_anomaly >= self.min_anomaly_area {
            Verdict::Anomaly
        } else {
            Verdict::Normal
        };

        debug!(
            "template inspection: {}/{} patches matched, {} anomalous px, verdict {}",
            matched, total, total_anomaly, verdict
        );

        Ok(TemplateInspection {
            verdict,
            anomaly_pixel_count: total_anomaly,
            anomaly_area_percent: total_anomaly as f64 / frame_pixels * 100.0,
            match_rate,
            confidence: match_rate / 100.0,
            patches,
            defect_mask,
        })
    }

    /// Search for one golden patch around its expected position in the test
    /// image
    fn locate_patch(
        &self,
        index: usize,
        rect: Rect,
        golden_gray: &Mat,
        test_gray: &Mat,
    ) -> Result<TemplatePatch> {
        let mut patch = TemplatePatch {
            index,
            rect,
            match_score: 0.0,
            match_rect: None,
            anomaly_pixels: 0,
        };

        let x1 = (rect.x - self.search_margin).max(0);
        let y1 = (rect.y - self.search_margin).max(0);
        let x2 = (rect.x + rect.width + self.search_margin).min(test_gray.cols());
        let y2 = (rect.y + rect.height + self.search_margin).min(test_gray.rows());
        let search = Rect::new(x1, y1, x2 - x1, y2 - y1);
        if search.width < rect.width || search.height < rect.height {
            return Ok(patch);
        }

        let template = cv("golden patch", Mat::roi(golden_gray, rect))?;
        let window = cv("search window", Mat::roi(test_gray, search))?;

        let mut scores = Mat::default();
        cv(
            "match template",
            imgproc::match_template(
                &window,
                &template,
                &mut scores,
                imgproc::TM_CCOEFF_NORMED,
                &no_array(),
            ),
        )?;

        let mut max_val = 0.0f64;
        let mut max_loc = Point::default();
        cv(
            "best match",
            core::min_max_loc(
                &scores,
                None,
                Some(&mut max_val),
                None,
                Some(&mut max_loc),
                &no_array(),
            ),
        )?;

        patch.match_score = max_val;
        if max_val >= self.match_threshold {
            patch.match_rect = Some(Rect::new(
                search.x + max_loc.x,
                search.y + max_loc.y,
                rect.width,
                rect.height,
            ));
        }
        Ok(patch)
    }

    /// Row-major patch rectangles; edge patches absorb the remainder
    fn patch_rects(&self, image: &Mat) -> Vec<Rect> {
        let rows = image.rows();
        let cols = image.cols();
        let cell_w = cols / self.grid_cols;
        let cell_h = rows / self.grid_rows;

        let mut rects = Vec::with_capacity((self.grid_cols * self.grid_rows) as usize);
        for r in 0..self.grid_rows {
            for c in 0..self.grid_cols {
                let x = c * cell_w;
                let y = r * cell_h;
                let w = if c < self.grid_cols - 1 { cell_w } else { cols - x };
                let h = if r < self.grid_rows - 1 { cell_h } else { rows - y };
                rects.push(Rect::new(x, y, w, h));
            }
        }
        rects
    }
}

/// Difference a matched patch against its golden counterpart
fn compare_patch(
    golden_gray: &Mat,
    test_gray: &Mat,
    golden_rect: Rect,
    match_rect: Rect,
) -> Result<(Mat, i32)> {
    // Edge matches can run short; compare the overlapping extent only
    let h = golden_rect
        .height
        .min(test_gray.rows() - match_rect.y)
        .min(match_rect.height);
    let w = golden_rect
        .width
        .min(test_gray.cols() - match_rect.x)
        .min(match_rect.width);

    let golden_patch = cv(
        "golden patch",
        Mat::roi(golden_gray, Rect::new(golden_rect.x, golden_rect.y, w, h)),
    )?;
    let test_patch = cv(
        "test patch",
        Mat::roi(test_gray, Rect::new(match_rect.x, match_rect.y, w, h)),
    )?;

    let mut diff = Mat::default();
    cv(
        "patch difference",
        core::absdiff(&golden_patch, &test_patch, &mut diff),
    )?;

    let mut binary = Mat::default();
    cv(
        "patch threshold",
        imgproc::threshold(
            &diff,
            &mut binary,
            PATCH_DIFF_THRESHOLD,
            255.0,
            imgproc::THRESH_BINARY,
        ),
    )?;

    let kernel = cv(
        "ellipse kernel",
        imgproc::get_structuring_element(
            imgproc::MORPH_ELLIPSE,
            Size::new(PATCH_OPEN_KERNEL, PATCH_OPEN_KERNEL),
            Point::new(-1, -1),
        ),
    )?;
    let mut cleaned = Mat::default();
    cv(
        "patch open",
        imgproc::morphology_ex(
            &binary,
            &mut cleaned,
            imgproc::MORPH_OPEN,
            &kernel,
            Point::new(-1, -1),
            1,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value().unwrap_or_default(),
        ),
    )?;

    let count = cv("count patch anomalies", core::count_non_zero(&cleaned))?;
    Ok((cleaned, count))
}
