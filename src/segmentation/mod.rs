//! Panel segmentation strategies
//!
//! A panel photograph usually carries several independent objects (strips) or
//! one large object inspected piecewise. Three strategies cover the common
//! layouts:
//!
//! - [`strip`]: content-driven extraction of rectangular strips
//! - [`grid`]: deterministic N×N tiling with per-tile verdicts
//! - [`template`]: golden-patch template matching, tolerant of camera drift

pub mod grid;
pub mod strip;
pub mod template;

pub use grid::{GridAnalysis, GridAnalyzer, TileReport};
pub use strip::extract_strips;
pub use template::{TemplateInspection, TemplateMatcher, TemplatePatch};

use opencv::core::{Mat, Rect};
use opencv::prelude::*;

use crate::error::{cv, Result};

/// One extracted region of a panel image
#[derive(Debug)]
pub struct Region {
    /// Cropped pixels, owned
    pub image: Mat,
    /// Position within the source panel
    pub rect: Rect,
    /// Stable position index after spatial sorting
    pub index: usize,
}

/// Cut regions at caller-provided coordinates, for fixtures where the strip
/// layout is known and automatic extraction is unnecessary.
///
/// ROIs falling outside the image bounds are skipped rather than clamped, so
/// the returned indices still correspond to the surviving input order.
pub fn regions_from_rois(image: &Mat, rois: &[Rect]) -> Result<Vec<Region>> {
    let mut regions = Vec::new();
    for &rect in rois {
        if rect.x < 0
            || rect.y < 0
            || rect.x + rect.width > image.cols()
            || rect.y + rect.height > image.rows()
        {
            continue;
        }
        let crop = cv("crop roi", Mat::roi(image, rect))?;
        regions.push(Region {
            image: cv("own roi", crop.try_clone())?,
            rect,
            index: regions.len(),
        });
    }
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    #[test]
    fn test_manual_rois_skip_out_of_bounds() {
        let image =
            Mat::new_rows_cols_with_default(100, 200, CV_8UC3, Scalar::all(0.0)).unwrap();
        let rois = [
            Rect::new(0, 0, 50, 50),
            Rect::new(180, 80, 50, 50), // spills past the right/bottom edge
            Rect::new(100, 20, 40, 60),
        ];
        let regions = regions_from_rois(&image, &rois).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].rect, rois[0]);
        assert_eq!(regions[1].rect, rois[2]);
        assert_eq!(regions[1].index, 1);
        assert_eq!(regions[1].image.size().unwrap().width, 40);
    }
}
