//! Defect location mapping
//!
//! Turns a binary defect mask into a list of addressable regions: bounding
//! box, centroid, pixel area, and a coarse 3×3 sector label operators can
//! relay ("top-left", "middle-center", ...). Also renders an annotated review
//! image with numbered boxes and sector grid lines.

use opencv::core::{self, Mat, Point, Rect, Scalar, Vector};
use opencv::imgproc;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{cv, Result};

/// Horizontal third of the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectorX {
    Left,
    Center,
    Right,
}

/// Vertical third of the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectorY {
    Top,
    Middle,
    Bottom,
}

/// One of the nine frame sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sector {
    pub vertical: SectorY,
    pub horizontal: SectorX,
}

impl std::fmt::Display for Sector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = match self.vertical {
            SectorY::Top => "top",
            SectorY::Middle => "middle",
            SectorY::Bottom => "bottom",
        };
        let h = match self.horizontal {
            SectorX::Left => "left",
            SectorX::Center => "center",
            SectorX::Right => "right",
        };
        write!(f, "{}-{}", v, h)
    }
}

impl Sector {
    /// Sector containing pixel (x, y) of a width×height frame
    pub fn of(x: i32, y: i32, width: i32, height: i32) -> Self {
        let horizontal = if x * 3 < width {
            SectorX::Left
        } else if x * 3 > width * 2 {
            SectorX::Right
        } else {
            SectorX::Center
        };
        let vertical = if y * 3 < height {
            SectorY::Top
        } else if y * 3 > height * 2 {
            SectorY::Bottom
        } else {
            SectorY::Middle
        };
        Self { vertical, horizontal }
    }
}

/// One connected defect region extracted from a mask
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefectRegion {
    /// 1-based region number as shown on annotations
    pub id: usize,
    /// Bounding box in frame coordinates
    #[serde(with = "rect_serde")]
    pub bounding_box: Rect,
    /// Mass centroid; falls back to the box center for degenerate contours
    pub centroid: (i32, i32),
    /// Region area in pixels
    pub area_px: f64,
    /// Coarse 3×3 sector containing the centroid
    pub sector: Sector,
    /// Centroid as a percentage of frame width/height
    pub relative_pos: (f64, f64),
}

/// Location analysis over a whole defect mask
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationReport {
    pub regions: Vec<DefectRegion>,
    pub total_anomalous_pixels: i32,
    /// Anomalous pixels as a percentage of the frame
    pub coverage_percent: f64,
    pub image_width: i32,
    pub image_height: i32,
}

impl LocationReport {
    /// Human-readable one-region-per-line summary
    pub fn summary(&self) -> String {
        if self.regions.is_empty() {
            return "No anomalies detected.".to_string();
        }
        let mut lines = vec![format!("Found {} anomaly region(s):", self.regions.len())];
        for region in &self.regions {
            lines.push(format!(
                "  #{}: {} @ ({}, {}) [{:.1}%, {:.1}%] - {}px",
                region.id,
                region.sector,
                region.centroid.0,
                region.centroid.1,
                region.relative_pos.0,
                region.relative_pos.1,
                region.area_px as i64,
            ));
        }
        lines.join("\n")
    }
}

/// Extract defect regions from a binary mask (CV_8UC1), dropping blobs under
/// `min_area` pixels.
pub fn analyze_mask(mask: &Mat, min_area: f64) -> Result<LocationReport> {
    let width = mask.cols();
    let height = mask.rows();

    let mut contours = Vector::<Vector<Point>>::new();
    cv(
        "find defect contours",
        imgproc::find_contours(
            mask,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            Point::default(),
        ),
    )?;

    let mut regions = Vec::new();
    for contour in contours.iter() {
        let area = cv("contour area", imgproc::contour_area(&contour, false))?;
        if area < min_area {
            continue;
        }

        let bounding_box = cv("bounding rect", imgproc::bounding_rect(&contour))?;
        let moments = cv("contour moments", imgproc::moments(&contour, false))?;
        let (cx, cy) = if moments.m00 > 0.0 {
            (
                (moments.m10 / moments.m00) as i32,
                (moments.m01 / moments.m00) as i32,
            )
        } else {
            (
                bounding_box.x + bounding_box.width / 2,
                bounding_box.y + bounding_box.height / 2,
            )
        };

        regions.push(DefectRegion {
            id: regions.len() + 1,
            bounding_box,
            centroid: (cx, cy),
            area_px: area,
            sector: Sector::of(cx, cy, width, height),
            relative_pos: (
                cx as f64 / width.max(1) as f64 * 100.0,
                cy as f64 / height.max(1) as f64 * 100.0,
            ),
        });
    }

    let total_anomalous_pixels = cv("count mask", core::count_non_zero(mask))?;
    let frame = (width as f64 * height as f64).max(1.0);

    Ok(LocationReport {
        regions,
        total_anomalous_pixels,
        coverage_percent: total_anomalous_pixels as f64 / frame * 100.0,
        image_width: width,
        image_height: height,
    })
}

/// Draw the sector grid, numbered bounding boxes, and centroid markers onto a
/// copy of `base`.
pub fn annotate(base: &Mat, report: &LocationReport) -> Result<Mat> {
    let mut annotated = cv("copy base", base.try_clone())?;
    let w = annotated.cols();
    let h = annotated.rows();

    let grid_color = Scalar::new(40.0, 40.0, 40.0, 0.0);
    for i in 1..3 {
        cv(
            "sector line",
            imgproc::line(
                &mut annotated,
                Point::new(i * w / 3, 0),
                Point::new(i * w / 3, h),
                grid_color,
                1,
                imgproc::LINE_8,
                0,
            ),
        )?;
        cv(
            "sector line",
            imgproc::line(
                &mut annotated,
                Point::new(0, i * h / 3),
                Point::new(w, i * h / 3),
                grid_color,
                1,
                imgproc::LINE_8,
                0,
            ),
        )?;
    }

    let red = Scalar::new(0.0, 0.0, 255.0, 0.0);
    let yellow = Scalar::new(0.0, 255.0, 255.0, 0.0);
    for region in &report.regions {
        cv(
            "region box",
            imgproc::rectangle(&mut annotated, region.bounding_box, red, 2, imgproc::LINE_8, 0),
        )?;

        let center = Point::new(region.centroid.0, region.centroid.1);
        cv(
            "centroid fill",
            imgproc::circle(&mut annotated, center, 5, yellow, imgproc::FILLED, imgproc::LINE_8, 0),
        )?;
        cv(
            "centroid ring",
            imgproc::circle(&mut annotated, center, 7, red, 2, imgproc::LINE_8, 0),
        )?;

        let label = format!("#{}", region.id);
        let origin = Point::new(region.bounding_box.x, (region.bounding_box.y - 2).max(10));
        cv(
            "region label",
            imgproc::put_text(
                &mut annotated,
                &label,
                origin,
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                Scalar::all(255.0),
                1,
                imgproc::LINE_8,
                false,
            ),
        )?;
    }

    Ok(annotated)
}

mod rect_serde {
    use opencv::core::Rect;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct RectDef {
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    }

    pub fn serialize<S: Serializer>(rect: &Rect, serializer: S) -> Result<S::Ok, S::Error> {
        RectDef {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Rect, D::Error> {
        let def = RectDef::deserialize(deserializer)?;
        Ok(Rect::new(def.x, def.y, def.width, def.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_utils::zero_mask;
    use opencv::core::CV_8UC3;

    #[test]
    fn test_sector_assignment() {
        let s = Sector::of(10, 10, 300, 300);
        assert_eq!(s.horizontal, SectorX::Left);
        assert_eq!(s.vertical, SectorY::Top);
        assert_eq!(s.to_string(), "top-left");

        let s = Sector::of(150, 150, 300, 300);
        assert_eq!(s.to_string(), "middle-center");

        let s = Sector::of(290, 290, 300, 300);
        assert_eq!(s.to_string(), "bottom-right");
    }

    #[test]
    fn test_analyze_mask_finds_regions_with_sectors() {
        let mut mask = zero_mask(300, 300).unwrap();
        imgproc::rectangle(
            &mut mask,
            Rect::new(20, 20, 40, 30),
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        imgproc::rectangle(
            &mut mask,
            Rect::new(220, 240, 50, 40),
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let report = analyze_mask(&mask, 50.0).unwrap();
        assert_eq!(report.regions.len(), 2);
        assert!(report
            .regions
            .iter()
            .any(|r| r.sector.to_string() == "top-left"));
        assert!(report
            .regions
            .iter()
            .any(|r| r.sector.to_string() == "bottom-right"));
        assert!(report.total_anomalous_pixels > 0);
        assert!(report.coverage_percent > 0.0);
    }

    #[test]
    fn test_min_area_filters_small_blobs() {
        let mut mask = zero_mask(200, 200).unwrap();
        imgproc::rectangle(
            &mut mask,
            Rect::new(100, 100, 4, 4),
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let report = analyze_mask(&mask, 50.0).unwrap();
        assert!(report.regions.is_empty());
        assert!(report.total_anomalous_pixels > 0); // counted, just not regioned
    }

    #[test]
    fn test_annotate_preserves_geometry() {
        let base =
            Mat::new_rows_cols_with_default(240, 320, CV_8UC3, Scalar::all(60.0)).unwrap();
        let mut mask = zero_mask(240, 320).unwrap();
        imgproc::rectangle(
            &mut mask,
            Rect::new(50, 50, 60, 40),
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let report = analyze_mask(&mask, 50.0).unwrap();
        let annotated = annotate(&base, &report).unwrap();
        assert_eq!(annotated.size().unwrap(), base.size().unwrap());
    }

    #[test]
    fn test_summary_mentions_each_region() {
        let mut mask = zero_mask(300, 300).unwrap();
        imgproc::rectangle(
            &mut mask,
            Rect::new(20, 20, 40, 30),
            Scalar::all(255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let report = analyze_mask(&mask, 50.0).unwrap();
        let text = report.summary();
        assert!(text.contains("#1"));
        assert!(text.contains("top-left"));
    }
}
