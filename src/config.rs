//! Configuration structures for the pcb_inspect pipeline.
//!
//! All tunable parameters are grouped into immutable value structs that are
//! constructed once and passed by reference into every stage; no stage reads
//! ambient or global state.
//!
//! # Configuration Loading
//!
//! Configuration can be loaded from JSON files or constructed programmatically:
//!
//! ```no_run
//! use pcb_inspect::InspectionConfig;
//! use std::path::Path;
//!
//! // Load from file
//! let config = InspectionConfig::from_json_file(Path::new("config.json"))?;
//!
//! // Or use defaults
//! let config = InspectionConfig::default();
//! # Ok::<(), pcb_inspect::InspectError>(())
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants::{alignment, detection, precheck, segmentation};
use crate::error::{InspectError, Result};

/// Available image registration strategies.
///
/// A closed enum: dispatch over methods is an exhaustive match, so adding a
/// strategy is a compile-time-checked change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationMethod {
    /// Cross-power-spectrum translation estimate; fast, no rotation tolerance
    Phase,
    /// ORB binary features + RANSAC homography
    FeatureFast,
    /// SIFT float features + Lowe ratio + RANSAC homography
    FeatureAccurate,
    /// ECC direct intensity optimization; sub-pixel precision
    DirectIntensity,
    /// Try the configured fallback order until one clears the floor
    Auto,
}

/// Motion model for the ECC direct-intensity method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionModel {
    Translation,
    Euclidean,
    Affine,
    Homography,
}

/// Pair illumination normalization strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeMethod {
    /// Match the test histogram to the golden histogram (recommended)
    MatchHistogram,
    /// CLAHE on both images
    ClaheBoth,
    /// Mean/std normalization on both images
    NormalizeBoth,
    /// No normalization
    None,
}

/// Panel segmentation strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationMode {
    /// Content-driven strip extraction for panels of independent objects
    Strip,
    /// Deterministic N×N tiling of a single object
    Grid,
    /// Golden-patch template matching tolerant of camera drift
    Template,
}

/// Image registration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentConfig {
    /// Registration method to use
    pub method: RegistrationMethod,

    /// Fallback order tried by [`RegistrationMethod::Auto`]
    pub fallback_order: Vec<RegistrationMethod>,

    /// Minimum confidence for an attempt to win
    pub confidence_floor: f64,

    /// Maximum ORB features to detect
    pub orb_max_features: i32,

    /// Fraction of sorted ORB matches retained
    pub orb_good_match_percent: f64,

    /// Maximum SIFT features to detect
    pub sift_max_features: i32,

    /// Lowe ratio threshold for SIFT k-NN matching
    pub sift_ratio_threshold: f32,

    /// Minimum keypoint/match count for feature methods
    pub min_match_count: usize,

    /// RANSAC reprojection threshold in pixels
    pub ransac_reproj_threshold: f64,

    /// ECC iteration budget
    pub ecc_max_iterations: i32,

    /// ECC convergence epsilon
    pub ecc_epsilon: f64,

    /// ECC motion model
    pub ecc_motion: MotionModel,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            method: RegistrationMethod::Auto,
            fallback_order: vec![
                RegistrationMethod::Phase,
                RegistrationMethod::FeatureFast,
                RegistrationMethod::FeatureAccurate,
                RegistrationMethod::DirectIntensity,
            ],
            confidence_floor: alignment::CONFIDENCE_FLOOR,
            orb_max_features: alignment::ORB_MAX_FEATURES,
            orb_good_match_percent: alignment::ORB_GOOD_MATCH_PERCENT,
            sift_max_features: alignment::SIFT_MAX_FEATURES,
            sift_ratio_threshold: alignment::SIFT_RATIO_THRESHOLD,
            min_match_count: alignment::MIN_MATCH_COUNT,
            ransac_reproj_threshold: alignment::RANSAC_REPROJ_THRESHOLD,
            ecc_max_iterations: alignment::ECC_MAX_ITERATIONS,
            ecc_epsilon: alignment::ECC_EPSILON,
            ecc_motion: MotionModel::Euclidean,
        }
    }
}

/// Structural (SSIM) pre-check parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecheckConfig {
    /// Run the pre-check at all
    pub enabled: bool,

    /// Scores above this skip pixel analysis and declare Normal
    pub pass_threshold: f64,
}

impl Default for PrecheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pass_threshold: precheck::PASS_THRESHOLD,
        }
    }
}

/// Pixel-difference detection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixelMatchConfig {
    /// Intensity difference threshold (0-255)
    pub pixel_threshold: i32,

    /// Anomalous pixel count triggering an Anomaly verdict
    pub count_threshold: i32,

    /// Anomalous area percentage triggering an Anomaly verdict
    pub area_threshold: f64,

    /// Connected components below this area are discarded
    pub min_blob_area: f64,

    /// Morphological kernel side length (odd)
    pub kernel_size: i32,

    /// Dilation passes after open/close cleanup
    pub dilation_iterations: i32,

    /// Use a locally-adaptive threshold instead of the fixed one
    pub use_adaptive_threshold: bool,

    /// Apply CLAHE to both grayscale images before differencing
    pub use_histogram_equalization: bool,

    /// Run the multi-scale variant
    pub multi_scale: bool,

    /// Kernel sizes for the multi-scale variant
    pub multi_scale_kernels: Vec<i32>,
}

impl Default for PixelMatchConfig {
    fn default() -> Self {
        Self {
            pixel_threshold: detection::PIXEL_THRESHOLD,
            count_threshold: detection::COUNT_THRESHOLD,
            area_threshold: detection::AREA_THRESHOLD,
            min_blob_area: detection::MIN_BLOB_AREA,
            kernel_size: detection::KERNEL_SIZE,
            dilation_iterations: detection::DILATION_ITERATIONS,
            use_adaptive_threshold: false,
            use_histogram_equalization: true,
            multi_scale: false,
            multi_scale_kernels: detection::MULTI_SCALE_KERNELS.to_vec(),
        }
    }
}

/// Pair illumination normalization parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IlluminationConfig {
    /// Normalize lighting before differencing
    pub enabled: bool,

    /// Normalization strategy
    pub method: NormalizeMethod,

    /// CLAHE clip limit
    pub clahe_clip_limit: f64,

    /// CLAHE tile grid side length
    pub clahe_tile_size: i32,

    /// Target mean for mean/std normalization
    pub target_mean: f64,

    /// Target standard deviation for mean/std normalization
    pub target_std: f64,
}

impl Default for IlluminationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: NormalizeMethod::MatchHistogram,
            clahe_clip_limit: detection::CLAHE_CLIP_LIMIT,
            clahe_tile_size: detection::CLAHE_TILE_SIZE,
            target_mean: 128.0,
            target_std: 64.0,
        }
    }
}

/// Panel segmentation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Segmentation strategy
    pub mode: SegmentationMode,

    /// Expected strips per panel (strip mode)
    pub expected_count: usize,

    /// Minimum strip aspect ratio, long side over short side
    pub min_aspect_ratio: f64,

    /// Maximum strip aspect ratio
    pub max_aspect_ratio: f64,

    /// Grid tiles per side (grid mode)
    pub grid_size: i32,

    /// Anomalous tiles required to flag the whole image (grid mode)
    pub min_anomaly_segments: usize,

    /// Template grid columns (template mode)
    pub template_grid_cols: i32,

    /// Template grid rows (template mode)
    pub template_grid_rows: i32,

    /// Minimum normalized cross-correlation for a template match
    pub template_match_threshold: f64,

    /// Search margin around a template's expected position, in pixels
    pub template_search_margin: i32,

    /// Anomalous pixels required for a template-mode Anomaly verdict
    pub template_min_anomaly_area: i32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            mode: SegmentationMode::Strip,
            expected_count: segmentation::EXPECTED_STRIP_COUNT,
            min_aspect_ratio: segmentation::MIN_ASPECT_RATIO,
            max_aspect_ratio: segmentation::MAX_ASPECT_RATIO,
            grid_size: segmentation::GRID_SIZE,
            min_anomaly_segments: segmentation::MIN_ANOMALY_SEGMENTS,
            template_grid_cols: segmentation::TEMPLATE_GRID_COLS,
            template_grid_rows: segmentation::TEMPLATE_GRID_ROWS,
            template_match_threshold: segmentation::TEMPLATE_MATCH_THRESHOLD,
            template_search_margin: segmentation::TEMPLATE_SEARCH_MARGIN,
            template_min_anomaly_area: segmentation::TEMPLATE_MIN_ANOMALY_AREA,
        }
    }
}

/// Master configuration combining all pipeline stages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InspectionConfig {
    /// Image registration configuration
    pub alignment: AlignmentConfig,

    /// Structural pre-check configuration
    pub precheck: PrecheckConfig,

    /// Pixel-difference detection configuration
    pub pixel_match: PixelMatchConfig,

    /// Illumination normalization configuration
    pub illumination: IlluminationConfig,

    /// Segmentation configuration
    pub segmentation: SegmentationConfig,
}

impl InspectionConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| InspectError::config(format!("cannot read {}", path.display()), e))?;
        serde_json::from_str(&content)
            .map_err(|e| InspectError::config(format!("cannot parse {}", path.display()), e))
    }

    /// Save configuration to a JSON file
    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| InspectError::config("cannot serialize configuration", e))?;
        std::fs::write(path, json)
            .map_err(|e| InspectError::config(format!("cannot write {}", path.display()), e))
    }

    /// Validate cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.pixel_match.kernel_size % 2 == 0 || self.pixel_match.kernel_size < 1 {
            return Err(InspectError::InvalidParameter {
                parameter: "pixel_match.kernel_size".into(),
                value: self.pixel_match.kernel_size.to_string(),
            });
        }
        if self.segmentation.grid_size < 1 {
            return Err(InspectError::InvalidParameter {
                parameter: "segmentation.grid_size".into(),
                value: self.segmentation.grid_size.to_string(),
            });
        }
        if self.alignment.fallback_order.is_empty()
            || self
                .alignment
                .fallback_order
                .contains(&RegistrationMethod::Auto)
        {
            return Err(InspectError::InvalidParameter {
                parameter: "alignment.fallback_order".into(),
                value: format!("{:?}", self.alignment.fallback_order),
            });
        }
        if !(0.0..=1.0).contains(&self.segmentation.template_match_threshold) {
            return Err(InspectError::InvalidParameter {
                parameter: "segmentation.template_match_threshold".into(),
                value: self.segmentation.template_match_threshold.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = InspectionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.alignment.method, RegistrationMethod::Auto);
        assert_eq!(config.alignment.fallback_order.len(), 4);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = InspectionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: InspectionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.pixel_match.pixel_threshold, config.pixel_match.pixel_threshold);
        assert_eq!(parsed.alignment.fallback_order, config.alignment.fallback_order);
        assert_eq!(parsed.segmentation.mode, SegmentationMode::Strip);
    }

    #[test]
    fn test_method_serializes_snake_case() {
        let json = serde_json::to_string(&RegistrationMethod::FeatureAccurate).unwrap();
        assert_eq!(json, "\"feature_accurate\"");
        let back: RegistrationMethod = serde_json::from_str("\"direct_intensity\"").unwrap();
        assert_eq!(back, RegistrationMethod::DirectIntensity);
    }

    #[test]
    fn test_validate_rejects_even_kernel() {
        let mut config = InspectionConfig::default();
        config.pixel_match.kernel_size = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_auto_in_fallback_order() {
        let mut config = InspectionConfig::default();
        config.alignment.fallback_order = vec![RegistrationMethod::Auto];
        assert!(config.validate().is_err());
    }
}
