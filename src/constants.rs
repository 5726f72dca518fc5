//! Tuning constants and default thresholds for the inspection pipeline
//!
//! These values were calibrated on production panel imagery and serve as the
//! defaults for the corresponding configuration structs.

/// Image registration defaults
pub mod alignment {
    /// Minimum response/confidence for a registration attempt to be accepted
    pub const CONFIDENCE_FLOOR: f64 = 0.1;

    /// Maximum ORB features to detect
    pub const ORB_MAX_FEATURES: i32 = 5000;

    /// Fraction of sorted ORB matches retained as "good"
    pub const ORB_GOOD_MATCH_PERCENT: f64 = 0.15;

    /// Minimum keypoint/match count before a feature method gives up
    pub const MIN_MATCH_COUNT: usize = 10;

    /// Maximum SIFT features to detect
    pub const SIFT_MAX_FEATURES: i32 = 5000;

    /// Lowe ratio test threshold for SIFT k-NN matching
    pub const SIFT_RATIO_THRESHOLD: f32 = 0.75;

    /// SIFT descriptor distances are normalized against this value
    pub const SIFT_DISTANCE_SCALE: f64 = 300.0;

    /// ORB (Hamming) descriptor distances are normalized against this value
    pub const ORB_DISTANCE_SCALE: f64 = 256.0;

    /// RANSAC reprojection threshold in pixels
    pub const RANSAC_REPROJ_THRESHOLD: f64 = 5.0;

    /// ECC iteration budget
    pub const ECC_MAX_ITERATIONS: i32 = 5000;

    /// ECC convergence epsilon
    pub const ECC_EPSILON: f64 = 1e-10;
}

/// Structural pre-check (SSIM) defaults
pub mod precheck {
    /// Pairs scoring above this are declared Normal without pixel analysis
    pub const PASS_THRESHOLD: f64 = 0.975;

    /// SSIM Gaussian window size (must be odd)
    pub const WINDOW_SIZE: i32 = 11;

    /// SSIM Gaussian window sigma
    pub const WINDOW_SIGMA: f64 = 1.5;

    /// Stabilization constant C1 = (0.01 * 255)^2
    pub const C1: f64 = 6.5025;

    /// Stabilization constant C2 = (0.03 * 255)^2
    pub const C2: f64 = 58.5225;
}

/// Pixel-difference detection defaults
pub mod detection {
    /// Intensity difference threshold (0-255)
    pub const PIXEL_THRESHOLD: i32 = 40;

    /// Anomalous pixel count above which the pair is flagged
    pub const COUNT_THRESHOLD: i32 = 5000;

    /// Anomalous area percentage above which the pair is flagged
    pub const AREA_THRESHOLD: f64 = 20.0;

    /// Connected components below this area are discarded as noise
    pub const MIN_BLOB_AREA: f64 = 50.0;

    /// Morphological kernel side length
    pub const KERNEL_SIZE: i32 = 5;

    /// Dilation passes merging nearby defect fragments
    pub const DILATION_ITERATIONS: i32 = 2;

    /// Kernel sizes used by the multi-scale variant
    pub const MULTI_SCALE_KERNELS: [i32; 3] = [3, 5, 9];

    /// Confidence drops by this factor per unit of anomaly ratio
    pub const CONFIDENCE_DECAY: f64 = 10.0;

    /// CLAHE clip limit for local-contrast enhancement
    pub const CLAHE_CLIP_LIMIT: f64 = 2.0;

    /// CLAHE tile grid side length
    pub const CLAHE_TILE_SIZE: i32 = 8;
}

/// Region segmentation defaults
pub mod segmentation {
    /// Expected strips per panel
    pub const EXPECTED_STRIP_COUNT: usize = 6;

    /// Minimum strip aspect ratio (long side / short side)
    pub const MIN_ASPECT_RATIO: f64 = 1.5;

    /// Maximum strip aspect ratio
    pub const MAX_ASPECT_RATIO: f64 = 8.0;

    /// Contours below this fraction of the median contour area are outliers
    pub const MEDIAN_AREA_FRACTION: f64 = 0.3;

    /// Minimum bounding-box side length in pixels for a valid strip
    pub const MIN_STRIP_SIDE: i32 = 50;

    /// Coarse y-quantization used when sorting strips into rows
    pub const ROW_BUCKET_HEIGHT: i32 = 100;

    /// Grid analyzer tiles per side
    pub const GRID_SIZE: i32 = 3;

    /// Anomalous tiles required to flag the whole image
    pub const MIN_ANOMALY_SEGMENTS: usize = 2;

    /// Template match grid dimensions
    pub const TEMPLATE_GRID_COLS: i32 = 4;
    pub const TEMPLATE_GRID_ROWS: i32 = 4;

    /// Minimum normalized cross-correlation for a template match
    pub const TEMPLATE_MATCH_THRESHOLD: f64 = 0.7;

    /// Search margin around a template's expected position, in pixels
    pub const TEMPLATE_SEARCH_MARGIN: i32 = 50;

    /// Anomalous pixels required for a template-mode Anomaly verdict
    pub const TEMPLATE_MIN_ANOMALY_AREA: i32 = 100;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_ranges() {
        assert!(alignment::CONFIDENCE_FLOOR > 0.0 && alignment::CONFIDENCE_FLOOR < 1.0);
        assert!(precheck::PASS_THRESHOLD > 0.9 && precheck::PASS_THRESHOLD < 1.0);
        assert!(segmentation::MIN_ASPECT_RATIO < segmentation::MAX_ASPECT_RATIO);
        assert!(detection::AREA_THRESHOLD > 0.0 && detection::AREA_THRESHOLD <= 100.0);
    }

    #[test]
    fn test_ssim_constants_match_dynamic_range() {
        // C1/C2 follow the (k * L)^2 convention for L = 255
        assert!((precheck::C1 - (0.01f64 * 255.0).powi(2)).abs() < 1e-9);
        assert!((precheck::C2 - (0.03f64 * 255.0).powi(2)).abs() < 1e-9);
    }

    #[test]
    fn test_multi_scale_kernels_sorted() {
        let k = detection::MULTI_SCALE_KERNELS;
        assert!(k.windows(2).all(|w| w[0] < w[1]));
        assert!(k.iter().all(|v| v % 2 == 1));
    }
}
