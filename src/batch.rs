//! Batch panel inspection
//!
//! Inspects a lot of panel photographs against a single master panel. The
//! master is segmented into strips once at construction; every test panel is
//! segmented the same way and its strips compared index-for-index against the
//! master strips.
//!
//! A batch never aborts because one image is bad: unreadable files,
//! unsegmentable panels, and unalignable strips all land in that item's
//! result row while the rest of the lot proceeds. Images are processed in
//! parallel and results come back in submission order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{info, warn};
use opencv::core::Mat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::InspectionConfig;
use crate::detection::{PixelDiffDetector, Verdict};
use crate::error::{InspectError, Result};
use crate::image_loader::load_image;
use crate::pipeline::DecidingStage;
use crate::precheck::ssim;
use crate::registration;
use crate::segmentation::{extract_strips, Region};

/// Pass/fail outcome for one whole panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelVerdict {
    /// Every strip came back normal
    Pass,
    /// At least one strip is anomalous
    Fail,
    /// The panel could not be inspected at all
    Error,
}

/// Result row for one strip of a test panel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripRecord {
    /// 1-based strip position on the panel
    pub strip_number: usize,
    pub verdict: Verdict,
    pub ssim_score: f64,
    /// Anomalous area percentage from pixel analysis
    pub anomaly_area_percent: f64,
    pub anomaly_pixel_count: i32,
    /// Stage that decided the verdict; `None` when inspection errored out
    pub method: Option<DecidingStage>,
    /// Failure detail when `verdict` is [`Verdict::Error`]
    pub error: Option<String>,
    pub processing_seconds: f64,
}

/// Flat per-strip record for external report writers.
///
/// One row per inspected strip (or one row for a panel that produced none),
/// carrying everything a tabular export needs without reaching back into the
/// nested results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub timestamp: DateTime<Utc>,
    pub image: String,
    /// 1-based strip position; `None` for panel-level error rows
    pub strip_number: Option<usize>,
    pub verdict: String,
    pub ssim_score: Option<f64>,
    pub anomaly_area_percent: Option<f64>,
    pub anomaly_pixel_count: Option<i32>,
    /// "SSIM" or "PIXEL_MATCH", whichever stage decided the verdict
    pub method: Option<String>,
    pub error: Option<String>,
    pub processing_seconds: f64,
}

/// Result row for one test panel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelResult {
    /// File name (or caller-provided label) of the test capture
    pub image: String,
    pub verdict: PanelVerdict,
    /// Strips actually compared; capped by whichever panel had fewer
    pub strips: Vec<StripRecord>,
    /// Count of anomalous strips
    pub defect_count: usize,
    /// Panel-level failure detail when `verdict` is [`PanelVerdict::Error`]
    pub error: Option<String>,
    pub processing_seconds: f64,
    pub inspected_at: DateTime<Utc>,
}

impl PanelResult {
    fn panel_error(image: String, message: String, started: Instant) -> Self {
        Self {
            image,
            verdict: PanelVerdict::Error,
            strips: Vec::new(),
            defect_count: 0,
            error: Some(message),
            processing_seconds: started.elapsed().as_secs_f64(),
            inspected_at: Utc::now(),
        }
    }

    fn verdict_label(&self) -> &'static str {
        match self.verdict {
            PanelVerdict::Pass => "PASS",
            PanelVerdict::Fail => "FAIL",
            PanelVerdict::Error => "ERROR",
        }
    }
}

/// Aggregate counts over a finished lot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotSummary {
    pub total_panels: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub total_strips: usize,
    pub total_defective_strips: usize,
    /// Defective strips over all inspected strips; 0 for an empty lot
    pub defect_rate: f64,
    pub total_seconds: f64,
}

impl LotSummary {
    pub fn from_results(results: &[PanelResult]) -> Self {
        let total_strips: usize = results.iter().map(|r| r.strips.len()).sum();
        let total_defective_strips: usize = results.iter().map(|r| r.defect_count).sum();
        let defect_rate = if total_strips == 0 {
            0.0
        } else {
            total_defective_strips as f64 / total_strips as f64
        };
        Self {
            total_panels: results.len(),
            passed: results.iter().filter(|r| r.verdict == PanelVerdict::Pass).count(),
            failed: results.iter().filter(|r| r.verdict == PanelVerdict::Fail).count(),
            errored: results.iter().filter(|r| r.verdict == PanelVerdict::Error).count(),
            total_strips,
            total_defective_strips,
            defect_rate,
            total_seconds: results.iter().map(|r| r.processing_seconds).sum(),
        }
    }
}

/// Batch inspector bound to one master panel
#[derive(Debug)]
pub struct BatchInspector {
    config: InspectionConfig,
    detector: PixelDiffDetector,
    master_strips: Vec<Region>,
}

impl BatchInspector {
    /// Segment the master panel and get ready to inspect a lot against it.
    /// Fails if the master yields no strips, since nothing could ever be
    /// compared.
    pub fn new(master: &Mat, config: InspectionConfig) -> Result<Self> {
        config.validate()?;
        let master_strips = extract_strips(master, &config.segmentation)?;
        if master_strips.is_empty() {
            return Err(InspectError::SegmentationFailed {
                reason: "no strips detected in master panel".into(),
            });
        }
        info!("master panel segmented into {} strips", master_strips.len());

        let detector = PixelDiffDetector::new(config.pixel_match.clone());
        Ok(Self {
            config,
            detector,
            master_strips,
        })
    }

    /// Load the master panel from disk.
    pub fn from_master_path(master: &Path, config: InspectionConfig) -> Result<Self> {
        let image = load_image(master)?;
        Self::new(&image, config)
    }

    pub fn master_strip_count(&self) -> usize {
        self.master_strips.len()
    }

    /// Inspect one test panel already loaded as a BGR mat.
    pub fn inspect_panel(&self, test_panel: &Mat, image_name: &str) -> PanelResult {
        let started = Instant::now();
        let inspected_at = Utc::now();

        let test_strips = match extract_strips(test_panel, &self.config.segmentation) {
            Ok(strips) => strips,
            Err(err) => {
                return PanelResult::panel_error(image_name.into(), err.to_string(), started)
            }
        };
        if test_strips.is_empty() {
            warn!("{}: no strips detected", image_name);
            return PanelResult::panel_error(
                image_name.into(),
                "no strips detected".into(),
                started,
            );
        }

        // Pair strip N with strip N; a short panel only gets its overlap
        // inspected
        let count = self.master_strips.len().min(test_strips.len());
        let mut strips = Vec::with_capacity(count);
        let mut defect_count = 0;

        for i in 0..count {
            let record =
                self.inspect_strip(&self.master_strips[i].image, &test_strips[i].image, i + 1);
            if record.verdict == Verdict::Anomaly {
                defect_count += 1;
            }
            strips.push(record);
        }

        let verdict = if defect_count > 0 {
            PanelVerdict::Fail
        } else {
            PanelVerdict::Pass
        };
        info!(
            "{}: {} ({} of {} strips defective)",
            image_name, if verdict == PanelVerdict::Fail { "FAIL" } else { "PASS" },
            defect_count, count
        );

        PanelResult {
            image: image_name.into(),
            verdict,
            strips,
            defect_count,
            error: None,
            processing_seconds: started.elapsed().as_secs_f64(),
            inspected_at,
        }
    }

    /// Inspect a lot of test panels in parallel.
    ///
    /// `progress` is invoked with (completed, total) after each item
    /// finishes; completion order is nondeterministic but the count only
    /// climbs. Setting `cancel` stops uninspected items with a "cancelled"
    /// error row while preserving every item's position in the output.
    pub fn inspect_batch(
        &self,
        panels: &[PathBuf],
        progress: Option<&(dyn Fn(usize, usize) + Sync)>,
        cancel: Option<&AtomicBool>,
    ) -> Vec<PanelResult> {
        let total = panels.len();
        let completed = AtomicUsize::new(0);
        panels
            .par_iter()
            .map(|path| {
                let started = Instant::now();
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());

                let result = if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                    PanelResult::panel_error(name, "cancelled".into(), started)
                } else {
                    match load_image(path) {
                        Ok(image) => self.inspect_panel(&image, &name),
                        Err(err) => PanelResult::panel_error(name, err.user_message(), started),
                    }
                };

                if let Some(report) = progress {
                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    report(done, total);
                }
                result
            })
            .collect()
    }

    /// One strip pair through align / SSIM gate / pixel analysis
    fn inspect_strip(&self, master: &Mat, test: &Mat, strip_number: usize) -> StripRecord {
        let started = Instant::now();
        let mut record = StripRecord {
            strip_number,
            verdict: Verdict::Normal,
            ssim_score: 0.0,
            anomaly_area_percent: 0.0,
            anomaly_pixel_count: 0,
            method: None,
            error: None,
            processing_seconds: 0.0,
        };

        let outcome = self.inspect_strip_inner(master, test, &mut record);
        if let Err(err) = outcome {
            record.verdict = Verdict::Error;
            record.method = None;
            record.error = Some(err.user_message());
        }
        record.processing_seconds = started.elapsed().as_secs_f64();
        record
    }

    fn inspect_strip_inner(
        &self,
        master: &Mat,
        test: &Mat,
        record: &mut StripRecord,
    ) -> Result<()> {
        let registration = registration::align(
            master,
            test,
            self.config.alignment.method,
            &self.config.alignment,
        )?;
        if registration.confidence < self.config.alignment.confidence_floor {
            record.verdict = Verdict::Error;
            record.error = Some(format!(
                "alignment failed (confidence {:.2})",
                registration.confidence
            ));
            return Ok(());
        }

        let (score, _) = ssim(master, &registration.aligned)?;
        record.ssim_score = score;
        if self.config.precheck.enabled && score > self.config.precheck.pass_threshold {
            record.verdict = Verdict::Normal;
            record.method = Some(DecidingStage::StructuralPrecheck);
            return Ok(());
        }

        let detection =
            self.detector
                .detect(master, &registration.aligned, &registration.validity_mask)?;
        record.verdict = detection.verdict;
        record.anomaly_area_percent = detection.anomaly_area_percent;
        record.anomaly_pixel_count = detection.anomaly_pixel_count;
        record.method = Some(DecidingStage::PixelAnalysis);
        Ok(())
    }

    /// Flatten panel results into one row per strip for external report
    /// writers. Panels with no strips contribute a single error row so the
    /// export still accounts for every input image.
    pub fn result_rows(results: &[PanelResult]) -> Vec<ResultRow> {
        let mut rows = Vec::new();
        for result in results {
            if result.strips.is_empty() {
                rows.push(ResultRow {
                    timestamp: result.inspected_at,
                    image: result.image.clone(),
                    strip_number: None,
                    verdict: result.verdict_label().to_string(),
                    ssim_score: None,
                    anomaly_area_percent: None,
                    anomaly_pixel_count: None,
                    method: None,
                    error: result.error.clone(),
                    processing_seconds: result.processing_seconds,
                });
                continue;
            }
            for strip in &result.strips {
                rows.push(ResultRow {
                    timestamp: result.inspected_at,
                    image: result.image.clone(),
                    strip_number: Some(strip.strip_number),
                    verdict: strip.verdict.to_string(),
                    ssim_score: Some(strip.ssim_score),
                    anomaly_area_percent: Some(strip.anomaly_area_percent),
                    anomaly_pixel_count: Some(strip.anomaly_pixel_count),
                    method: strip.method.map(|m| m.to_string()),
                    error: strip.error.clone(),
                    processing_seconds: strip.processing_seconds,
                });
            }
        }
        rows
    }
}
