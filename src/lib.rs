//! # PCB Inspect
//!
//! A Rust crate for automated visual defect detection on PCB panels by
//! comparing test photographs against a golden reference.
//!
//! The pipeline:
//! - Normalizes illumination differences between the two captures
//! - Registers the test image onto the golden frame (phase correlation,
//!   ORB/SIFT features, or ECC, with automatic fallback)
//! - Runs a fast SSIM structural pre-check that short-circuits clean pairs
//! - Detects pixel-level differences with morphological noise suppression
//! - Maps surviving defects to addressable sectors and annotates them
//!
//! Panels carrying several strips are handled by [`BatchInspector`], which
//! segments a master panel once and inspects whole lots in parallel.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pcb_inspect::{InspectionConfig, Inspector};
//! use std::path::Path;
//!
//! let inspector = Inspector::new(InspectionConfig::default())?;
//! let report = inspector.inspect_paths(Path::new("golden.png"), Path::new("test.png"))?;
//! println!("{}: {}", report.verdict, report.location_summary());
//! # Ok::<(), pcb_inspect::InspectError>(())
//! ```

pub mod batch;
pub mod config;
pub mod constants;
pub mod detection;
pub mod error;
pub mod illumination;
pub mod image_loader;
pub mod image_utils;
pub mod location;
pub mod pipeline;
pub mod precheck;
pub mod registration;
pub mod segmentation;

pub use batch::{BatchInspector, LotSummary, PanelResult, PanelVerdict, ResultRow, StripRecord};
pub use config::{
    AlignmentConfig, IlluminationConfig, InspectionConfig, MotionModel, NormalizeMethod,
    PixelMatchConfig, PrecheckConfig, RegistrationMethod, SegmentationConfig, SegmentationMode,
};
pub use detection::{DetectionResult, PixelDiffDetector, Verdict};
pub use error::{InspectError, Result};
pub use location::{DefectRegion, LocationReport, Sector};
pub use pipeline::{DecidingStage, InspectionReport, Inspector};
pub use precheck::PrecheckResult;
pub use registration::RegistrationResult;
pub use segmentation::{GridAnalyzer, Region, TemplateMatcher};
