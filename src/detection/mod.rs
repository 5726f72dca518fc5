//! Defect detection on aligned golden/test pairs

mod pixel_diff;

pub use pixel_diff::PixelDiffDetector;

use serde::{Deserialize, Serialize};

use opencv::core::{Mat, Point, Vector};

/// Inspection verdict for a pair or region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No defect beyond the configured thresholds
    Normal,
    /// Defect evidence exceeded a threshold
    Anomaly,
    /// Analysis could not run at all
    Error,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Verdict::Normal => "NORMAL",
            Verdict::Anomaly => "ANOMALY",
            Verdict::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Pixel-level detection outcome
#[derive(Debug)]
pub struct DetectionResult {
    pub verdict: Verdict,
    /// Count of anomalous pixels surviving noise filtering
    pub anomaly_pixel_count: i32,
    /// Anomalous pixels as a percentage of valid (mask-covered) pixels
    pub anomaly_area_percent: f64,
    /// Pixels covered by the validity mask, the denominator of the area ratio
    pub valid_pixel_count: i32,
    /// 1 at zero anomaly ratio, decaying linearly to 0
    pub confidence: f64,
    /// Binary defect mask (CV_8UC1), 255 on defect blobs
    pub defect_mask: Mat,
    /// Outlines of the surviving defect blobs
    pub contours: Vector<Vector<Point>>,
    /// JET rendering of the masked intensity difference
    pub heatmap: Mat,
    /// Defect outlines drawn over a dimmed copy of the aligned test image
    pub contour_overlay: Mat,
}

impl DetectionResult {
    /// A clean result for frames where analysis was skipped (e.g. the
    /// structural pre-check already passed)
    pub(crate) fn clean(rows: i32, cols: i32) -> crate::error::Result<Self> {
        let zero = crate::image_utils::zero_mask(rows, cols)?;
        let mut heatmap = Mat::default();
        crate::error::cv(
            "clean heatmap",
            opencv::imgproc::apply_color_map(&zero, &mut heatmap, opencv::imgproc::COLORMAP_JET),
        )?;
        let overlay = crate::error::cv(
            "clean overlay",
            Mat::new_rows_cols_with_default(
                rows,
                cols,
                opencv::core::CV_8UC3,
                opencv::core::Scalar::all(0.0),
            ),
        )?;
        Ok(Self {
            verdict: Verdict::Normal,
            anomaly_pixel_count: 0,
            anomaly_area_percent: 0.0,
            valid_pixel_count: rows * cols,
            confidence: 1.0,
            defect_mask: zero,
            contours: Vector::new(),
            heatmap,
            contour_overlay: overlay,
        })
    }
}
