//! Pair inspection pipeline
//!
//! Strings the stages together for one golden/test pair:
//!
//! 1. Illumination normalization of both captures
//! 2. Registration of the test image onto the golden frame
//! 3. Structural (SSIM) pre-check; a clean pass ends the inspection early
//! 4. Pixel-difference detection gated by the warp validity mask
//! 5. Defect location mapping and annotation when anomalies survive
//!
//! A registration confidence below the configured floor aborts with
//! [`InspectError::RegistrationFailed`]; every later stage degrades to a
//! verdict instead of an error.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::info;
use opencv::core::Mat;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::InspectionConfig;
use crate::detection::{DetectionResult, PixelDiffDetector, Verdict};
use crate::error::{InspectError, Result};
use crate::illumination;
use crate::image_loader::load_image;
use crate::location::{self, LocationReport};
use crate::precheck;
use crate::registration::{self, RegistrationResult};

/// Stage whose result decided the final verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecidingStage {
    /// The SSIM pre-check passed; pixel analysis was skipped
    StructuralPrecheck,
    /// The pixel-difference detector ran to completion
    PixelAnalysis,
}

impl std::fmt::Display for DecidingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DecidingStage::StructuralPrecheck => "SSIM",
            DecidingStage::PixelAnalysis => "PIXEL_MATCH",
        };
        f.write_str(label)
    }
}

/// Complete record of one pair inspection
#[derive(Debug)]
pub struct InspectionReport {
    pub verdict: Verdict,
    pub decided_by: DecidingStage,
    /// Structural similarity of the aligned pair
    pub ssim_score: f64,
    /// How the test image was brought into the golden frame
    pub registration: RegistrationResult,
    /// Pixel-level findings; a clean placeholder when the pre-check passed
    pub detection: DetectionResult,
    /// Defect locations, present only for anomaly verdicts
    pub location: Option<LocationReport>,
    /// Annotated review image, present only for anomaly verdicts
    pub annotated: Option<Mat>,
    /// JET heatmap of structural dissimilarity
    pub ssim_heatmap: Mat,
    pub processing_time: Duration,
    pub inspected_at: DateTime<Utc>,
}

impl InspectionReport {
    /// One-line operator summary of the defect locations
    pub fn location_summary(&self) -> String {
        match &self.location {
            Some(report) => report.summary(),
            None => "No anomalies detected.".to_string(),
        }
    }
}

/// Inspection pipeline over a fixed configuration
pub struct Inspector {
    config: InspectionConfig,
    detector: PixelDiffDetector,
}

impl Inspector {
    pub fn new(config: InspectionConfig) -> Result<Self> {
        config.validate()?;
        let detector = PixelDiffDetector::new(config.pixel_match.clone());
        Ok(Self { config, detector })
    }

    pub fn config(&self) -> &InspectionConfig {
        &self.config
    }

    /// Inspect one golden/test pair already loaded as BGR mats.
    pub fn inspect(&self, golden: &Mat, test: &Mat) -> Result<InspectionReport> {
        let started = Instant::now();
        let inspected_at = Utc::now();

        let (golden_proc, test_proc) =
            illumination::preprocess_pair(golden, test, &self.config.illumination)?;

        let registration = registration::align(
            &golden_proc,
            &test_proc,
            self.config.alignment.method,
            &self.config.alignment,
        )?;
        if registration.confidence < self.config.alignment.confidence_floor {
            return Err(InspectError::RegistrationFailed {
                method: format!("{:?}", registration.method_used),
                confidence: registration.confidence,
                floor: self.config.alignment.confidence_floor,
            });
        }
        info!(
            "registered via {:?}: dx={:.2} dy={:.2} confidence={:.4}",
            registration.method_used,
            registration.translation.0,
            registration.translation.1,
            registration.confidence
        );

        let structural =
            precheck::run(&golden_proc, &registration.aligned, &self.config.precheck)?;
        if self.config.precheck.enabled && structural.passed {
            info!(
                "structural pre-check passed at {:.4}, skipping pixel analysis",
                structural.score
            );
            return Ok(InspectionReport {
                verdict: Verdict::Normal,
                decided_by: DecidingStage::StructuralPrecheck,
                ssim_score: structural.score,
                detection: DetectionResult::clean(golden_proc.rows(), golden_proc.cols())?,
                registration,
                location: None,
                annotated: None,
                ssim_heatmap: structural.heatmap,
                processing_time: started.elapsed(),
                inspected_at,
            });
        }

        let detection = self.detector.detect(
            &golden_proc,
            &registration.aligned,
            &registration.validity_mask,
        )?;

        let (location, annotated) = if detection.verdict == Verdict::Anomaly {
            let report = location::analyze_mask(
                &detection.defect_mask,
                self.config.pixel_match.min_blob_area,
            )?;
            info!("{}", report.summary());
            let annotated = location::annotate(&registration.aligned, &report)?;
            (Some(report), Some(annotated))
        } else {
            (None, None)
        };

        Ok(InspectionReport {
            verdict: detection.verdict,
            decided_by: DecidingStage::PixelAnalysis,
            ssim_score: structural.score,
            detection,
            registration,
            location,
            annotated,
            ssim_heatmap: structural.heatmap,
            processing_time: started.elapsed(),
            inspected_at,
        })
    }

    /// Load both images from disk and inspect them.
    pub fn inspect_paths(&self, golden: &Path, test: &Path) -> Result<InspectionReport> {
        let golden_image = load_image(golden)?;
        let test_image = load_image(test)?;
        self.inspect(&golden_image, &test_image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Rect, Scalar, CV_8UC3};
    use opencv::imgproc;

    fn panel() -> Mat {
        let mut image =
            Mat::new_rows_cols_with_default(240, 320, CV_8UC3, Scalar::all(30.0)).unwrap();
        for i in 0..6 {
            imgproc::rectangle(
                &mut image,
                Rect::new(20 + i * 48, 40 + (i % 2) * 90, 30, 44),
                Scalar::new(205.0, 170.0, 70.0, 0.0),
                -1,
                imgproc::LINE_8,
                0,
            )
            .unwrap();
        }
        image
    }

    #[test]
    fn test_identical_pair_passes_precheck() {
        let golden = panel();
        let inspector = Inspector::new(InspectionConfig::default()).unwrap();

        let report = inspector.inspect(&golden, &golden).unwrap();
        assert_eq!(report.verdict, Verdict::Normal);
        assert_eq!(report.decided_by, DecidingStage::StructuralPrecheck);
        assert!(report.ssim_score > 0.99);
        assert!(report.location.is_none());
        assert_eq!(report.detection.anomaly_pixel_count, 0);
    }

    #[test]
    fn test_gross_defect_reaches_pixel_analysis() {
        let golden = panel();
        let mut test = golden.try_clone().unwrap();
        imgproc::rectangle(
            &mut test,
            Rect::new(100, 60, 90, 90),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let mut config = InspectionConfig::default();
        config.pixel_match.count_threshold = 1500;
        let inspector = Inspector::new(config).unwrap();

        let report = inspector.inspect(&golden, &test).unwrap();
        assert_eq!(report.decided_by, DecidingStage::PixelAnalysis);
        assert_eq!(report.verdict, Verdict::Anomaly);

        let location = report.location.as_ref().expect("anomaly carries locations");
        assert!(!location.regions.is_empty());
        assert!(report.annotated.is_some());
        assert!(report.location_summary().contains("#1"));
    }

    #[test]
    fn test_precheck_disabled_always_runs_pixels() {
        let golden = panel();
        let mut config = InspectionConfig::default();
        config.precheck.enabled = false;
        let inspector = Inspector::new(config).unwrap();

        let report = inspector.inspect(&golden, &golden).unwrap();
        assert_eq!(report.decided_by, DecidingStage::PixelAnalysis);
        assert_eq!(report.verdict, Verdict::Normal);
    }

    #[test]
    fn test_unalignable_pair_is_an_error() {
        // Pure noise against flat gray defeats every registration method
        let golden =
            Mat::new_rows_cols_with_default(100, 100, CV_8UC3, Scalar::all(127.0)).unwrap();
        let test =
            Mat::new_rows_cols_with_default(100, 100, CV_8UC3, Scalar::all(127.0)).unwrap();

        let inspector = Inspector::new(InspectionConfig::default()).unwrap();
        match inspector.inspect(&golden, &test) {
            Err(InspectError::RegistrationFailed { confidence, floor, .. }) => {
                assert!(confidence < floor);
            }
            Ok(report) => {
                // Flat pairs can correlate perfectly; then they must be Normal
                assert_eq!(report.verdict, Verdict::Normal);
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
