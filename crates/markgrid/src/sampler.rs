//! Cell sampler: per-bubble darkness signals from an aligned image.
//!
//! Each bubble's template-space box is projected into the image. Pixels whose
//! centers back-project inside the inset bubble shape are sampled, and a
//! pixel counts as ink when it is darker than `background × (1 −
//! dark_contrast)`, where `background` is a high percentile of the window
//! around the bubble. The threshold is therefore local to each bubble.

use image::GrayImage;
use nalgebra::Matrix3;

use crate::config::SamplerConfig;
use crate::homography::project;
use crate::template::{Bubble, BubbleShape, Template};

/// Why a bubble could not be sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingGap {
    /// The projected region lies entirely outside the image.
    OutsideImage,
    /// The transform maps the bubble to infinity or is not invertible.
    NonFiniteProjection,
    /// Fewer in-image pixels than `sampler.min_pixels`.
    TooFewPixels,
}

impl std::fmt::Display for SamplingGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OutsideImage => "outside image",
            Self::NonFiniteProjection => "non-finite projection",
            Self::TooFewPixels => "too few pixels",
        })
    }
}

/// Raw statistics of a sampled bubble.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BubbleStats {
    /// Fraction of sampled pixels counted as ink, in [0, 1].
    pub darkness: f32,
    pub mean_intensity: f32,
    pub variance: f32,
    /// Local paper level used for the ink threshold.
    pub background: f32,
    pub n_pixels: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BubbleReading {
    Readable(BubbleStats),
    Unreadable { reason: SamplingGap },
}

/// Signal of one bubble on one sheet.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BubbleSignal {
    /// Bubble arena index in the template.
    pub bubble: usize,
    pub question: String,
    pub option: String,
    pub reading: BubbleReading,
}

impl BubbleSignal {
    /// Darkness of a readable bubble.
    pub fn darkness(&self) -> Option<f32> {
        match self.reading {
            BubbleReading::Readable(stats) => Some(stats.darkness),
            BubbleReading::Unreadable { .. } => None,
        }
    }

    pub fn is_readable(&self) -> bool {
        matches!(self.reading, BubbleReading::Readable(_))
    }
}

/// Inclusive-exclusive pixel range `[x0, x1) × [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PixelRect {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

impl PixelRect {
    fn is_empty(&self) -> bool {
        self.x0 >= self.x1 || self.y0 >= self.y1
    }
}

/// Image-space bounding box of a projected template rectangle, clipped to the image.
fn projected_rect(
    h: &Matrix3<f64>,
    bounds: [f64; 4],
    width: u32,
    height: u32,
) -> Result<PixelRect, SamplingGap> {
    let corners = [
        [bounds[0], bounds[1]],
        [bounds[2], bounds[1]],
        [bounds[2], bounds[3]],
        [bounds[0], bounds[3]],
    ];
    let mut lo = [f64::INFINITY; 2];
    let mut hi = [f64::NEG_INFINITY; 2];
    for c in corners {
        let p = project(h, c).ok_or(SamplingGap::NonFiniteProjection)?;
        for k in 0..2 {
            lo[k] = lo[k].min(p[k]);
            hi[k] = hi[k].max(p[k]);
        }
    }
    let clip = |v: f64, max: u32| v.clamp(0.0, max as f64) as u32;
    let rect = PixelRect {
        x0: clip(lo[0].floor(), width),
        y0: clip(lo[1].floor(), height),
        x1: clip(hi[0].ceil(), width),
        y1: clip(hi[1].ceil(), height),
    };
    if rect.is_empty() {
        Err(SamplingGap::OutsideImage)
    } else {
        Ok(rect)
    }
}

/// Intensity at `percentile` of a 256-bin histogram.
fn histogram_percentile(hist: &[u32; 256], total: u32, percentile: f32) -> f32 {
    if total == 0 {
        return 0.0;
    }
    let target = ((percentile as f64 * total as f64).ceil() as u32).clamp(1, total);
    let mut seen = 0u32;
    for (value, &count) in hist.iter().enumerate() {
        seen += count;
        if seen >= target {
            return value as f32;
        }
    }
    255.0
}

fn local_background(
    gray: &GrayImage,
    h: &Matrix3<f64>,
    bubble: &Bubble,
    cfg: &SamplerConfig,
) -> Result<f32, SamplingGap> {
    let k = 0.5 * cfg.background_window as f64;
    let window = [
        bubble.center[0] - k * bubble.size[0],
        bubble.center[1] - k * bubble.size[1],
        bubble.center[0] + k * bubble.size[0],
        bubble.center[1] + k * bubble.size[1],
    ];
    let rect = projected_rect(h, window, gray.width(), gray.height())?;
    let mut hist = [0u32; 256];
    let mut total = 0u32;
    for y in rect.y0..rect.y1 {
        for x in rect.x0..rect.x1 {
            hist[gray.get_pixel(x, y)[0] as usize] += 1;
            total += 1;
        }
    }
    Ok(histogram_percentile(&hist, total, cfg.background_percentile))
}

/// Whether a template point lies inside the inset bubble shape.
fn inside_shape(bubble: &Bubble, inset: f64, p: [f64; 2]) -> bool {
    let u = (p[0] - bubble.center[0]) / (0.5 * bubble.size[0] * inset);
    let v = (p[1] - bubble.center[1]) / (0.5 * bubble.size[1] * inset);
    match bubble.shape {
        BubbleShape::Circle => u * u + v * v <= 1.0,
        BubbleShape::Rect => u.abs() <= 1.0 && v.abs() <= 1.0,
    }
}

fn sample_one(
    gray: &GrayImage,
    h: &Matrix3<f64>,
    h_inv: &Matrix3<f64>,
    bubble: &Bubble,
    cfg: &SamplerConfig,
) -> Result<BubbleStats, SamplingGap> {
    let rect = projected_rect(h, bubble.bounds(), gray.width(), gray.height())?;
    let inset = cfg.inset as f64;

    let mut values: Vec<u8> = Vec::new();
    for y in rect.y0..rect.y1 {
        for x in rect.x0..rect.x1 {
            let Some(t) = project(h_inv, [x as f64 + 0.5, y as f64 + 0.5]) else {
                continue;
            };
            if inside_shape(bubble, inset, t) {
                values.push(gray.get_pixel(x, y)[0]);
            }
        }
    }
    if values.len() < cfg.min_pixels.max(1) {
        return Err(SamplingGap::TooFewPixels);
    }

    let background = local_background(gray, h, bubble, cfg)?;
    let threshold = background * (1.0 - cfg.dark_contrast);
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let variance = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    let dark = values.iter().filter(|&&v| (v as f32) < threshold).count();

    Ok(BubbleStats {
        darkness: (dark as f64 / n) as f32,
        mean_intensity: mean as f32,
        variance: variance as f32,
        background,
        n_pixels: values.len(),
    })
}

/// Sample every template bubble, in bubble arena order.
///
/// Never fails: bubbles that cannot be sampled carry an
/// [`BubbleReading::Unreadable`] reading.
pub fn sample_bubbles(
    gray: &GrayImage,
    template: &Template,
    transform: &Matrix3<f64>,
    config: &SamplerConfig,
) -> Vec<BubbleSignal> {
    let inverse = transform.try_inverse();
    let signals: Vec<BubbleSignal> = template
        .bubbles()
        .iter()
        .enumerate()
        .map(|(idx, bubble)| {
            let reading = match &inverse {
                None => BubbleReading::Unreadable {
                    reason: SamplingGap::NonFiniteProjection,
                },
                Some(h_inv) => match sample_one(gray, transform, h_inv, bubble, config) {
                    Ok(stats) => BubbleReading::Readable(stats),
                    Err(reason) => BubbleReading::Unreadable { reason },
                },
            };
            BubbleSignal {
                bubble: idx,
                question: template.questions()[bubble.question].id.clone(),
                option: bubble.option.clone(),
                reading,
            }
        })
        .collect();

    let unreadable = signals.iter().filter(|s| !s.is_readable()).count();
    if unreadable > 0 {
        tracing::debug!(unreadable, total = signals.len(), "bubbles could not be sampled");
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::tests::quiz5;
    use image::Luma;

    fn fill_disk(img: &mut GrayImage, cx: f64, cy: f64, r: f64, v: u8) {
        for (x, y, px) in img.enumerate_pixels_mut() {
            let dx = x as f64 + 0.5 - cx;
            let dy = y as f64 + 0.5 - cy;
            if dx * dx + dy * dy <= r * r {
                *px = Luma([v]);
            }
        }
    }

    #[test]
    fn percentile_of_histogram() {
        let mut hist = [0u32; 256];
        hist[10] = 10;
        hist[200] = 90;
        assert_eq!(histogram_percentile(&hist, 100, 0.05), 10.0);
        assert_eq!(histogram_percentile(&hist, 100, 0.9), 200.0);
        assert_eq!(histogram_percentile(&hist, 0, 0.9), 0.0);
    }

    #[test]
    fn dark_bubble_reads_dark_under_uneven_lighting() {
        let t = quiz5();
        // paper fades from 240 to 120 left to right
        let mut img = GrayImage::from_fn(600, 800, |x, _| Luma([(240.0 - 0.2 * x as f64) as u8]));
        // q1/A at (165, 165) filled, q1/D at (345, 165) left empty on darker paper
        fill_disk(&mut img, 165.0, 165.0, 14.0, 30);
        let signals = sample_bubbles(&img, &t, &Matrix3::identity(), &SamplerConfig::default());
        assert_eq!(signals.len(), 20);

        let a = &signals[0];
        assert_eq!((a.question.as_str(), a.option.as_str()), ("q1", "A"));
        assert!(a.darkness().expect("readable") > 0.99);
        let d = &signals[3];
        assert_eq!(d.option, "D");
        assert_eq!(d.darkness(), Some(0.0));
        match d.reading {
            BubbleReading::Readable(stats) => assert!(stats.background < 180.0),
            BubbleReading::Unreadable { .. } => panic!("q1/D must be readable"),
        }
    }

    #[test]
    fn bubbles_outside_the_image_are_unreadable() {
        let t = quiz5();
        let img = GrayImage::from_pixel(600, 800, Luma([230]));
        // shifts the whole page 1000 px to the right
        let h = Matrix3::new(1.0, 0.0, 1000.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        let signals = sample_bubbles(&img, &t, &h, &SamplerConfig::default());
        assert!(signals.iter().all(|s| s.reading
            == BubbleReading::Unreadable {
                reason: SamplingGap::OutsideImage
            }));
    }

    #[test]
    fn singular_transform_is_unreadable_not_a_panic() {
        let t = quiz5();
        let img = GrayImage::from_pixel(600, 800, Luma([230]));
        let signals = sample_bubbles(&img, &t, &Matrix3::zeros(), &SamplerConfig::default());
        assert!(signals.iter().all(|s| !s.is_readable()));
    }

    #[test]
    fn reading_serializes_with_state_tag() {
        let reading = BubbleReading::Unreadable {
            reason: SamplingGap::OutsideImage,
        };
        let json = serde_json::to_string(&reading).expect("serialize");
        assert_eq!(json, r#"{"state":"unreadable","reason":"outside_image"}"#);
    }
}
