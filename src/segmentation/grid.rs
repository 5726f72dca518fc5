//! Grid tile analysis
//!
//! Divides an aligned pair into an N×N grid and inspects each tile
//! independently: a quick SSIM gate first, then the pixel-difference detector
//! for tiles that fail it. Localized defects that would drown in a
//! whole-image average stand out at tile granularity.

use log::debug;
use opencv::core::{Mat, Rect};
use opencv::prelude::*;

use crate::config::{
    AlignmentConfig, PixelMatchConfig, PrecheckConfig, RegistrationMethod, SegmentationConfig,
};
use crate::detection::{PixelDiffDetector, Verdict};
use crate::error::{cv, Result};
use crate::precheck::ssim;
use crate::registration;

/// Per-tile inspection outcome
#[derive(Debug, Clone)]
pub struct TileReport {
    /// Row-major tile index
    pub index: usize,
    pub row: i32,
    pub col: i32,
    /// Tile bounds within the full frame
    pub rect: Rect,
    /// SSIM of the aligned tile pair; 0 when alignment failed
    pub ssim_score: f64,
    /// Anomalous area percentage from pixel analysis, 0 if skipped
    pub anomaly_area_percent: f64,
    pub verdict: Verdict,
    pub confidence: f64,
}

/// Whole-frame outcome of a grid analysis
#[derive(Debug)]
pub struct GridAnalysis {
    pub verdict: Verdict,
    /// Tiles whose verdict is [`Verdict::Anomaly`]
    pub anomaly_count: usize,
    /// Anomalous tiles as a percentage of all tiles
    pub overall_defect_percent: f64,
    pub average_confidence: f64,
    pub tiles: Vec<TileReport>,
}

impl GridAnalysis {
    /// Row-major indices of the anomalous tiles
    pub fn defect_tiles(&self) -> Vec<usize> {
        self.tiles
            .iter()
            .filter(|t| t.verdict == Verdict::Anomaly)
            .map(|t| t.index)
            .collect()
    }
}

pub struct GridAnalyzer {
    grid_size: i32,
    min_anomaly_segments: usize,
    alignment: AlignmentConfig,
    precheck: PrecheckConfig,
    detector: PixelDiffDetector,
}

impl GridAnalyzer {
    pub fn new(
        segmentation: &SegmentationConfig,
        alignment: &AlignmentConfig,
        precheck: &PrecheckConfig,
        pixel_match: &PixelMatchConfig,
    ) -> Self {
        Self {
            grid_size: segmentation.grid_size,
            min_anomaly_segments: segmentation.min_anomaly_segments,
            alignment: alignment.clone(),
            precheck: precheck.clone(),
            detector: PixelDiffDetector::new(pixel_match.clone()),
        }
    }

    /// Inspect `test` against `golden` tile by tile. Both images must already
    /// be in the same coordinate frame; each tile gets its own fine
    /// alignment pass on top.
    pub fn analyze(&self, golden: &Mat, test: &Mat) -> Result<GridAnalysis> {
        let tiles = self.tile_rects(golden);

        let mut reports = Vec::with_capacity(tiles.len());
        let mut anomaly_count = 0;
        let mut total_confidence = 0.0;

        for (index, rect) in tiles.into_iter().enumerate() {
            let golden_tile = cv("golden tile", Mat::roi(golden, rect))?;
            let golden_tile = cv("own golden tile", golden_tile.try_clone())?;
            let test_tile = cv("test tile", Mat::roi(test, rect))?;
            let test_tile = cv("own test tile", test_tile.try_clone())?;

            let mut report = self.analyze_tile(&golden_tile, &test_tile)?;
            report.index = index;
            report.row = index as i32 / self.grid_size;
            report.col = index as i32 % self.grid_size;
            report.rect = rect;

            if report.verdict == Verdict::Anomaly {
                anomaly_count += 1;
            }
            total_confidence += report.confidence;
            reports.push(report);
        }

        let tile_count = reports.len().max(1);
        let verdict = if anomaly_count >= self.min_anomaly_segments {
            Verdict::Anomaly
        } else {
            Verdict::Normal
        };

        debug!(
            "grid analysis: {}/{} anomalous tiles, verdict {}",
            anomaly_count,
            tile_count,
            verdict
        );

        Ok(GridAnalysis {
            verdict,
            anomaly_count,
            overall_defect_percent: anomaly_count as f64 / tile_count as f64 * 100.0,
            average_confidence: total_confidence / tile_count as f64,
            tiles: reports,
        })
    }

    fn analyze_tile(&self, golden_tile: &Mat, test_tile: &Mat) -> Result<TileReport> {
        let mut report = TileReport {
            index: 0,
            row: 0,
            col: 0,
            rect: Rect::default(),
            ssim_score: 0.0,
            anomaly_area_percent: 0.0,
            verdict: Verdict::Normal,
            confidence: 0.0,
        };

        let registration = registration::align(
            golden_tile,
            test_tile,
            RegistrationMethod::Auto,
            &self.alignment,
        )?;
        if registration.confidence < self.alignment.confidence_floor {
            // Unalignable tile: no comparison is trustworthy, so keep the
            // Normal verdict and let the low confidence carry the doubt
            report.confidence = registration.confidence;
            return Ok(report);
        }

        let (ssim_score, _) = ssim(golden_tile, &registration.aligned)?;
        report.ssim_score = ssim_score;

        if self.precheck.enabled && ssim_score > self.precheck.pass_threshold {
            report.confidence = ssim_score;
            return Ok(report);
        }

        let detection = self.detector.detect(
            golden_tile,
            &registration.aligned,
            &registration.validity_mask,
        )?;
        report.anomaly_area_percent = detection.anomaly_area_percent;
        report.verdict = detection.verdict;
        report.confidence = (detection.anomaly_area_percent / 100.0).clamp(0.0, 1.0);
        Ok(report)
    }

    /// Row-major tile rectangles; the last row/column absorbs the remainder
    fn tile_rects(&self, image: &Mat) -> Vec<Rect> {
        let rows = image.rows();
        let cols = image.cols();
        let tile_h = rows / self.grid_size;
        let tile_w = cols / self.grid_size;

        let mut rects = Vec::with_capacity((self.grid_size * self.grid_size) as usize);
        for r in 0..self.grid_size {
            for c in 0..self.grid_size {
                let y = r * tile_h;
                let x = c * tile_w;
                let h = if r < self.grid_size - 1 { tile_h } else { rows - y };
                let w = if c < self.grid_size - 1 { tile_w } else { cols - x };
                rects.push(Rect::new(x, y, w, h));
            }
        }
        rects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InspectionConfig;
    use opencv::core::{Scalar, CV_8UC3};
    use opencv::imgproc;

    fn textured(rows: i32, cols: i32) -> Mat {
        let mut image =
            Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(35.0)).unwrap();
        for i in 0..8 {
            for j in 0..6 {
                imgproc::rectangle(
                    &mut image,
                    Rect::new(10 + i * 38, 12 + j * 48, 20, 26),
                    Scalar::new(
                        (40 * (i + 1)) as f64 % 255.0,
                        (30 * (j + 2)) as f64 % 255.0,
                        160.0,
                        0.0,
                    ),
                    -1,
                    imgproc::LINE_8,
                    0,
                )
                .unwrap();
            }
        }
        image
    }

    fn analyzer() -> GridAnalyzer {
        analyzer_with(InspectionConfig::default())
    }

    fn analyzer_with(config: InspectionConfig) -> GridAnalyzer {
        GridAnalyzer::new(
            &config.segmentation,
            &config.alignment,
            &config.precheck,
            &config.pixel_match,
        )
    }

    #[test]
    fn test_tile_rects_cover_frame() {
        let image = textured(301, 311); // deliberately not divisible by 3
        let rects = analyzer().tile_rects(&image);
        assert_eq!(rects.len(), 9);

        let covered: i32 = rects.iter().map(|r| r.width * r.height).sum();
        assert_eq!(covered, 301 * 311);
        let last = rects.last().unwrap();
        assert_eq!(last.y + last.height, 301);
        assert_eq!(last.x + last.width, 311);
    }

    #[test]
    fn test_identical_pair_all_tiles_normal() {
        let image = textured(300, 300);
        let analysis = analyzer().analyze(&image, &image).unwrap();
        assert_eq!(analysis.verdict, Verdict::Normal);
        assert_eq!(analysis.anomaly_count, 0);
        assert!(analysis.defect_tiles().is_empty());
        assert_eq!(analysis.tiles.len(), 9);
    }

    #[test]
    fn test_single_tile_defect_stays_below_segment_floor() {
        let golden = textured(300, 300);
        let mut test = golden.try_clone().unwrap();
        // Corrupt only the center tile
        imgproc::rectangle(
            &mut test,
            Rect::new(120, 120, 60, 60),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let analysis = analyzer().analyze(&golden, &test).unwrap();
        // One anomalous tile is below the default two-segment floor
        assert!(analysis.anomaly_count <= 1);
        assert_eq!(analysis.verdict, Verdict::Normal);
    }

    #[test]
    fn test_tile_gate_uses_configured_pass_threshold() {
        let golden = textured(300, 300);
        let mut test = golden.try_clone().unwrap();
        imgproc::rectangle(
            &mut test,
            Rect::new(120, 120, 60, 60),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        // A floor below any achievable SSIM lets every tile clear the gate,
        // so the corrupted tile never reaches pixel analysis
        let mut config = InspectionConfig::default();
        config.precheck.pass_threshold = -1.0;
        let analysis = analyzer_with(config).analyze(&golden, &test).unwrap();

        assert_eq!(analysis.anomaly_count, 0);
        assert!(analysis.tiles.iter().all(|t| t.verdict == Verdict::Normal));
    }

    #[test]
    fn test_unalignable_tiles_stay_normal() {
        let golden = textured(300, 300);
        let mut test = golden.try_clone().unwrap();
        imgproc::rectangle(
            &mut test,
            Rect::new(120, 120, 60, 60),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        // An unreachable confidence floor makes every tile fail its fine
        // alignment pass; that doubt must not read as a defect
        let mut config = InspectionConfig::default();
        config.alignment.confidence_floor = 2.0;
        let analysis = analyzer_with(config).analyze(&golden, &test).unwrap();

        assert_eq!(analysis.verdict, Verdict::Normal);
        assert_eq!(analysis.anomaly_count, 0);
        for tile in &analysis.tiles {
            assert_eq!(tile.verdict, Verdict::Normal);
            assert_eq!(tile.ssim_score, 0.0);
            assert_eq!(tile.anomaly_area_percent, 0.0);
        }
    }
}
