//! Content-driven strip extraction
//!
//! Finds the rectangular strips on a panel photograph by adaptive
//! thresholding and contour analysis, with a Canny-based fallback for panels
//! where the adaptive pass finds nothing. Extracted strips are sorted
//! top-to-bottom then left-to-right so index N on the golden panel pairs with
//! index N on the test panel.

use log::{debug, warn};
use opencv::core::{self, Mat, Point, Rect, Size, Vector};
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::SegmentationConfig;
use crate::constants::segmentation::{MEDIAN_AREA_FRACTION, MIN_STRIP_SIDE, ROW_BUCKET_HEIGHT};
use crate::error::{cv, Result};
use crate::image_utils::{rect_kernel, to_gray};
use crate::segmentation::Region;

/// Canny hysteresis thresholds for the fallback pass
const CANNY_LOW: f64 = 30.0;
const CANNY_HIGH: f64 = 100.0;

/// Extract up to `config.expected_count` strips from a panel image.
///
/// Returns an empty vector when neither extraction pass finds any valid
/// strip; the caller decides whether that is an error for its workflow.
pub fn extract_strips(panel: &Mat, config: &SegmentationConfig) -> Result<Vec<Region>> {
    let contours = adaptive_contours(panel)?;

    let candidates = if contours.is_empty() {
        warn!("adaptive extraction found no contours, falling back to edges");
        let edge_contours = canny_contours(panel)?;
        filter_candidates(panel, &edge_contours, config, percent_area_floor(panel))
    } else {
        let floor = median_area_floor(&contours)?.unwrap_or_else(|| percent_area_floor(panel));
        filter_candidates(panel, &contours, config, floor)
    }?;

    let mut candidates = candidates;
    // Row-major ordering with coarse row bucketing absorbs slight skew
    candidates.sort_by_key(|rect| (rect.y / ROW_BUCKET_HEIGHT, rect.x));
    candidates.truncate(config.expected_count);

    debug!("extracted {} strip candidates", candidates.len());

    let mut regions = Vec::with_capacity(candidates.len());
    for (index, rect) in candidates.into_iter().enumerate() {
        let crop = cv("crop strip", Mat::roi(panel, rect))?;
        regions.push(Region {
            image: cv("own strip", crop.try_clone())?,
            rect,
            index,
        });
    }
    Ok(regions)
}

/// Adaptive thresholding handles uneven panel lighting better than a global
/// threshold
fn adaptive_contours(panel: &Mat) -> Result<Vector<Vector<Point>>> {
    let blurred = blur(&to_gray(panel)?)?;

    let mut binary = Mat::default();
    cv(
        "adaptive threshold",
        imgproc::adaptive_threshold(
            &blurred,
            &mut binary,
            255.0,
            imgproc::ADAPTIVE_THRESH_GAUSSIAN_C,
            imgproc::THRESH_BINARY_INV,
            11,
            2.0,
        ),
    )?;

    let kernel = rect_kernel(5)?;
    let mut closed = Mat::default();
    cv(
        "close gaps",
        imgproc::morphology_ex(
            &binary,
            &mut closed,
            imgproc::MORPH_CLOSE,
            &kernel,
            Point::new(-1, -1),
            2,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value().unwrap_or_default(),
        ),
    )?;

    find_external_contours(&closed)
}

/// Fallback for low-contrast panels where adaptive thresholding collapses
fn canny_contours(panel: &Mat) -> Result<Vector<Vector<Point>>> {
    let blurred = blur(&to_gray(panel)?)?;

    let mut edges = Mat::default();
    cv(
        "canny edges",
        imgproc::canny(&blurred, &mut edges, CANNY_LOW, CANNY_HIGH, 3, false),
    )?;

    let kernel = rect_kernel(3)?;
    let mut dilated = Mat::default();
    cv(
        "connect edges",
        imgproc::dilate(
            &edges,
            &mut dilated,
            &kernel,
            Point::new(-1, -1),
            2,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value().unwrap_or_default(),
        ),
    )?;

    find_external_contours(&dilated)
}

fn find_external_contours(binary: &Mat) -> Result<Vector<Vector<Point>>> {
    let mut contours = Vector::<Vector<Point>>::new();
    cv(
        "find contours",
        imgproc::find_contours(
            binary,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            Point::default(),
        ),
    )?;
    Ok(contours)
}

fn blur(gray: &Mat) -> Result<Mat> {
    let mut blurred = Mat::default();
    cv(
        "denoise",
        imgproc::gaussian_blur(
            gray,
            &mut blurred,
            Size::new(5, 5),
            0.0,
            0.0,
            core::BORDER_DEFAULT,
        ),
    )?;
    Ok(blurred)
}

/// Area floor derived from the median contour, so a few dust specks do not
/// drag the threshold down
fn median_area_floor(contours: &Vector<Vector<Point>>) -> Result<Option<f64>> {
    let mut areas = Vec::with_capacity(contours.len());
    for contour in contours.iter() {
        areas.push(cv("contour area", imgproc::contour_area(&contour, false))?);
    }
    if areas.is_empty() {
        return Ok(None);
    }
    areas.sort_by(|a, b| a.total_cmp(b));
    Ok(Some(areas[areas.len() / 2] * MEDIAN_AREA_FRACTION))
}

/// 1% of the panel, the floor used when no contour statistics exist
fn percent_area_floor(panel: &Mat) -> f64 {
    panel.rows() as f64 * panel.cols() as f64 * 0.01
}

fn filter_candidates(
    panel: &Mat,
    contours: &Vector<Vector<Point>>,
    config: &SegmentationConfig,
    min_area: f64,
) -> Result<Vec<Rect>> {
    let mut candidates = Vec::new();
    for contour in contours.iter() {
        let area = cv("contour area", imgproc::contour_area(&contour, false))?;
        if area < min_area {
            continue;
        }

        let rect = cv("bounding rect", imgproc::bounding_rect(&contour))?;
        if rect.height == 0 {
            continue;
        }
        let aspect = (rect.width as f64 / rect.height as f64)
            .max(rect.height as f64 / rect.width as f64);

        if aspect >= config.min_aspect_ratio
            && aspect <= config.max_aspect_ratio
            && rect.width > MIN_STRIP_SIDE
            && rect.height > MIN_STRIP_SIDE
            && rect.x + rect.width <= panel.cols()
            && rect.y + rect.height <= panel.rows()
        {
            candidates.push(rect);
        }
    }
    Ok(candidates)
}
