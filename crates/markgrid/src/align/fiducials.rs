//! Fiducial candidate detection.
//!
//! Dark regions are segmented against a box-filtered local background, so
//! uneven lighting across a photograph does not shift the mask. Connected
//! components are then filtered by moment-based shape statistics (rotation
//! invariant) and by area against the template's fiducial descriptors.

use image::{GrayImage, Luma};
use imageproc::filter::box_filter;
use imageproc::region_labelling::{connected_components, Connectivity};

use super::PagePrior;
use crate::config::GradeConfig;
use crate::template::Template;

const MIN_BLOB_PIXELS: u64 = 4;

/// A dark blob that could be one of the template's fiducials.
#[derive(Debug, Clone)]
pub(crate) struct FiducialCandidate {
    /// Centroid in image pixel coordinates (pixel centers at +0.5).
    pub center: [f64; 2],
    /// Pixel count.
    pub area: f64,
    /// `1 - mean / local background` in [0, 1].
    pub contrast: f32,
    /// `area / (4π sqrt(det Σ))`: 1.0 for a disk, ~0.95 for a square.
    pub compactness: f64,
    /// Ratio of principal standard deviations (>= 1).
    pub elongation: f64,
    /// Indices of fiducial descriptors this blob is compatible with.
    pub compatible: Vec<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
struct BlobAccum {
    n: u64,
    sx: f64,
    sy: f64,
    sxx: f64,
    syy: f64,
    sxy: f64,
    sum_intensity: f64,
    sum_background: f64,
}

impl BlobAccum {
    fn add(&mut self, x: f64, y: f64, intensity: f64, background: f64) {
        self.n += 1;
        self.sx += x;
        self.sy += y;
        self.sxx += x * x;
        self.syy += y * y;
        self.sxy += x * y;
        self.sum_intensity += intensity;
        self.sum_background += background;
    }
}

/// Dark-pixel mask against a local mean of radius `radius`.
pub(crate) fn dark_mask(gray: &GrayImage, radius: u32, contrast: f32) -> (GrayImage, GrayImage) {
    let background = box_filter(gray, radius, radius);
    let factor = 1.0 - contrast;
    let mut mask = GrayImage::new(gray.width(), gray.height());
    for (x, y, px) in gray.enumerate_pixels() {
        let bg = background.get_pixel(x, y)[0] as f32;
        if (px[0] as f32) < bg * factor {
            mask.put_pixel(x, y, Luma([255]));
        }
    }
    (mask, background)
}

/// Detect fiducial candidates, in connected-component label order.
pub(crate) fn find_candidates(
    gray: &GrayImage,
    template: &Template,
    prior: &PagePrior,
    config: &GradeConfig,
) -> Vec<FiducialCandidate> {
    let (w, h) = gray.dimensions();
    if w < 4 || h < 4 {
        return Vec::new();
    }
    let cfg = &config.fiducials;
    let fiducial_px = template.mean_fiducial_size() * prior.scale;
    let max_radius = (w.min(h) / 2).max(2);
    let radius = ((cfg.background_radius_factor as f64 * fiducial_px).round() as u32)
        .clamp(2, max_radius);

    let (mask, background) = dark_mask(gray, radius, cfg.mask_contrast);
    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    let n_labels = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    if n_labels == 0 {
        return Vec::new();
    }
    let mut blobs = vec![BlobAccum::default(); n_labels + 1];
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        blobs[label].add(
            x as f64 + 0.5,
            y as f64 + 0.5,
            gray.get_pixel(x, y)[0] as f64,
            background.get_pixel(x, y)[0] as f64,
        );
    }

    let lo_ratio = (config.distortion.min_scale_ratio * (1.0 - cfg.size_tolerance as f64)).powi(2);
    let hi_ratio = (config.distortion.max_scale_ratio * (1.0 + cfg.size_tolerance as f64)).powi(2);
    let scale_sq = prior.scale * prior.scale;

    let mut candidates = Vec::new();
    for blob in blobs.iter().skip(1) {
        let Some(candidate) = blob_candidate(blob) else {
            continue;
        };
        if candidate.compactness < cfg.min_compactness as f64
            || candidate.elongation > cfg.max_elongation as f64
        {
            continue;
        }
        let compatible: Vec<usize> = template
            .fiducials()
            .iter()
            .enumerate()
            .filter(|(_, f)| {
                let ratio = candidate.area / (f.area() * scale_sq);
                ratio >= lo_ratio && ratio <= hi_ratio && candidate.contrast >= f.min_contrast
            })
            .map(|(i, _)| i)
            .collect();
        if compatible.is_empty() {
            continue;
        }
        candidates.push(FiducialCandidate {
            compatible,
            ..candidate
        });
    }

    tracing::debug!(
        n_blobs = n_labels,
        n_candidates = candidates.len(),
        background_radius = radius,
        "fiducial candidates"
    );
    candidates
}

fn blob_candidate(blob: &BlobAccum) -> Option<FiducialCandidate> {
    if blob.n < MIN_BLOB_PIXELS {
        return None;
    }
    let n = blob.n as f64;
    let mx = blob.sx / n;
    let my = blob.sy / n;
    // +1/12 per axis: variance of a unit pixel footprint
    let cxx = blob.sxx / n - mx * mx + 1.0 / 12.0;
    let cyy = blob.syy / n - my * my + 1.0 / 12.0;
    let cxy = blob.sxy / n - mx * my;
    let det = cxx * cyy - cxy * cxy;
    if det <= 0.0 {
        return None;
    }
    let tr_half = 0.5 * (cxx + cyy);
    let disc = (tr_half * tr_half - det).max(0.0).sqrt();
    let l_max = tr_half + disc;
    let l_min = (tr_half - disc).max(1e-12);

    let background = blob.sum_background / n;
    let contrast = if background > 0.0 {
        (1.0 - (blob.sum_intensity / n) / background).clamp(0.0, 1.0) as f32
    } else {
        0.0
    };

    Some(FiducialCandidate {
        center: [mx, my],
        area: n,
        contrast,
        compactness: n / (4.0 * std::f64::consts::PI * det.sqrt()),
        elongation: (l_max / l_min).sqrt(),
        compatible: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::tests::quiz5;

    fn paint_rect(img: &mut GrayImage, x0: u32, y0: u32, w: u32, h: u32, v: u8) {
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                img.put_pixel(x, y, Luma([v]));
            }
        }
    }

    #[test]
    fn finds_squares_and_rejects_lines() {
        let template = quiz5();
        let mut img = GrayImage::from_pixel(600, 800, Luma([230]));
        paint_rect(&mut img, 20, 20, 40, 40, 15);
        paint_rect(&mut img, 540, 20, 40, 40, 15);
        // thin rule: elongated
        paint_rect(&mut img, 100, 400, 300, 4, 15);
        // speck: too small
        paint_rect(&mut img, 300, 600, 3, 3, 15);

        let prior = PagePrior::fit(template.page_size(), img.dimensions());
        let found = find_candidates(&img, &template, &prior, &GradeConfig::default());
        assert_eq!(found.len(), 2);
        let c = &found[0];
        assert!((c.center[0] - 40.0).abs() < 1e-9 && (c.center[1] - 40.0).abs() < 1e-9);
        assert_eq!(c.area, 1600.0);
        assert!(c.contrast > 0.8);
        assert!(c.compactness > 0.9);
        assert_eq!(c.compatible.len(), template.fiducials().len());
    }

    #[test]
    fn blank_image_has_no_candidates() {
        let template = quiz5();
        let img = GrayImage::from_pixel(300, 400, Luma([200]));
        let prior = PagePrior::fit(template.page_size(), img.dimensions());
        assert!(find_candidates(&img, &template, &prior, &GradeConfig::default()).is_empty());
    }
}
