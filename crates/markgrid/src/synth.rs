//! Deterministic synthetic answer-sheet renderer.
//!
//! Draws a template's fiducials, bubble outlines and pencil marks through an
//! arbitrary template-to-image transform, with optional lighting gradient and
//! seeded noise. Used by tests, benchmarks and the CLI's `render` command.

use image::{GrayImage, Luma};
use nalgebra::Matrix3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::align::PagePrior;
use crate::homography::project;
use crate::template::{BubbleShape, FiducialShape, Template};

/// Rendering parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderParams {
    /// Output `(width, height)`.
    pub image_size: (u32, u32),
    /// Template-to-image transform.
    pub transform: Matrix3<f64>,
    pub paper: u8,
    pub ink: u8,
    /// Printed bubble outline level.
    pub outline: u8,
    /// Uniform noise amplitude in gray levels.
    pub noise: u8,
    pub seed: u64,
    /// Relative darkening of the paper from the left edge to the right edge.
    pub shading: f32,
    /// Fiducials left unprinted (occluded corners).
    pub hidden_fiducials: Vec<String>,
}

impl RenderParams {
    /// Page centered in the image at 90% of the largest fitting scale.
    pub fn fitted(template: &Template, image_size: (u32, u32)) -> Self {
        let page = template.page_size();
        let prior = PagePrior::fit(page, image_size);
        let s = 0.9 * prior.scale;
        let tx = 0.5 * (image_size.0 as f64 - page[0] * s);
        let ty = 0.5 * (image_size.1 as f64 - page[1] * s);
        Self {
            image_size,
            transform: Matrix3::new(s, 0.0, tx, 0.0, s, ty, 0.0, 0.0, 1.0),
            paper: 235,
            ink: 20,
            outline: 160,
            noise: 6,
            seed: 7,
            shading: 0.0,
            hidden_fiducials: Vec::new(),
        }
    }

    /// Rotate the rendered page about the image center.
    pub fn rotated(mut self, degrees: f64) -> Self {
        let (s, c) = degrees.to_radians().sin_cos();
        let cx = 0.5 * self.image_size.0 as f64;
        let cy = 0.5 * self.image_size.1 as f64;
        let r = Matrix3::new(
            c,
            -s,
            cx - c * cx + s * cy,
            s,
            c,
            cy - s * cx - c * cy,
            0.0,
            0.0,
            1.0,
        );
        self.transform = r * self.transform;
        self
    }

    /// Scale the rendered page about the image center.
    pub fn scaled(mut self, factor: f64) -> Self {
        let cx = 0.5 * self.image_size.0 as f64;
        let cy = 0.5 * self.image_size.1 as f64;
        let m = Matrix3::new(
            factor,
            0.0,
            cx * (1.0 - factor),
            0.0,
            factor,
            cy * (1.0 - factor),
            0.0,
            0.0,
            1.0,
        );
        self.transform = m * self.transform;
        self
    }

    /// Apply a perspective tilt: `w = 1 + px·x + py·y` in image coordinates
    /// centered on the image.
    pub fn tilted(mut self, px: f64, py: f64) -> Self {
        let cx = 0.5 * self.image_size.0 as f64;
        let cy = 0.5 * self.image_size.1 as f64;
        let to_center = Matrix3::new(1.0, 0.0, -cx, 0.0, 1.0, -cy, 0.0, 0.0, 1.0);
        let back = Matrix3::new(1.0, 0.0, cx, 0.0, 1.0, cy, 0.0, 0.0, 1.0);
        let tilt = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, px, py, 1.0);
        self.transform = back * tilt * to_center * self.transform;
        self
    }

    pub fn with_hidden_fiducials(mut self, names: &[&str]) -> Self {
        self.hidden_fiducials = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_noise(mut self, amplitude: u8, seed: u64) -> Self {
        self.noise = amplitude;
        self.seed = seed;
        self
    }

    pub fn with_shading(mut self, shading: f32) -> Self {
        self.shading = shading;
        self
    }
}

/// Pencil marks to draw, as `(question, option, fill)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetMarks {
    marks: Vec<(String, String, f32)>,
}

impl SheetMarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fully filled bubble.
    pub fn mark(mut self, question: &str, option: &str) -> Self {
        self.marks.push((question.into(), option.into(), 1.0));
        self
    }

    /// A partly filled bubble; `fill` is roughly the darkness the sampler
    /// reports under default settings.
    pub fn partial(mut self, question: &str, option: &str, fill: f32) -> Self {
        self.marks
            .push((question.into(), option.into(), fill.clamp(0.0, 1.0)));
        self
    }

    /// Mark one option per `(question, option)` pair.
    pub fn answers<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        pairs
            .into_iter()
            .fold(Self::new(), |marks, (q, o)| marks.mark(q, o))
    }
}

/// Fill every pixel whose center back-projects into `inside` with `value`
/// (darker wins). `bounds` is the template-space box of the feature.
fn paint<F>(
    img: &mut GrayImage,
    h: &Matrix3<f64>,
    h_inv: &Matrix3<f64>,
    bounds: [f64; 4],
    value: u8,
    inside: F,
) where
    F: Fn([f64; 2]) -> bool,
{
    let corners = [
        [bounds[0], bounds[1]],
        [bounds[2], bounds[1]],
        [bounds[2], bounds[3]],
        [bounds[0], bounds[3]],
    ];
    let mut lo = [f64::INFINITY; 2];
    let mut hi = [f64::NEG_INFINITY; 2];
    for c in corners {
        let Some(p) = project(h, c) else { return };
        for k in 0..2 {
            lo[k] = lo[k].min(p[k]);
            hi[k] = hi[k].max(p[k]);
        }
    }
    let (w, hgt) = img.dimensions();
    let x0 = lo[0].floor().clamp(0.0, w as f64) as u32;
    let x1 = hi[0].ceil().clamp(0.0, w as f64) as u32;
    let y0 = lo[1].floor().clamp(0.0, hgt as f64) as u32;
    let y1 = hi[1].ceil().clamp(0.0, hgt as f64) as u32;
    for y in y0..y1 {
        for x in x0..x1 {
            let Some(t) = project(h_inv, [x as f64 + 0.5, y as f64 + 0.5]) else {
                continue;
            };
            if inside(t) {
                let px = img.get_pixel_mut(x, y);
                px[0] = px[0].min(value);
            }
        }
    }
}

/// Normalized radius of `p` relative to a shape centered at `c` with half sizes `half`.
fn shape_radius(shape: BubbleShape, c: [f64; 2], half: [f64; 2], p: [f64; 2]) -> f64 {
    let u = (p[0] - c[0]) / half[0];
    let v = (p[1] - c[1]) / half[1];
    match shape {
        BubbleShape::Circle => u.hypot(v),
        BubbleShape::Rect => u.abs().max(v.abs()),
    }
}

/// Render a sheet. Marks naming unknown questions or options are ignored.
pub fn render_sheet(template: &Template, marks: &SheetMarks, params: &RenderParams) -> GrayImage {
    let (w, h) = params.image_size;
    let paper = params.paper as f32;
    let mut img = GrayImage::from_fn(w, h, |x, _| {
        let t = x as f32 / w.max(1) as f32;
        Luma([(paper * (1.0 - params.shading * t)).round().clamp(0.0, 255.0) as u8])
    });

    let Some(h_inv) = params.transform.try_inverse() else {
        return img;
    };
    let tf = &params.transform;

    for f in template.fiducials() {
        if params.hidden_fiducials.iter().any(|n| n == &f.name) {
            continue;
        }
        let half = 0.5 * f.size;
        let bounds = [
            f.center[0] - half,
            f.center[1] - half,
            f.center[0] + half,
            f.center[1] + half,
        ];
        let shape = match f.shape {
            FiducialShape::Square => BubbleShape::Rect,
            FiducialShape::Circle => BubbleShape::Circle,
        };
        paint(&mut img, tf, &h_inv, bounds, params.ink, |p| {
            shape_radius(shape, f.center, [half, half], p) <= 1.0
        });
    }

    for b in template.bubbles() {
        let half = [0.5 * b.size[0], 0.5 * b.size[1]];
        paint(&mut img, tf, &h_inv, b.bounds(), params.outline, |p| {
            let r = shape_radius(b.shape, b.center, half, p);
            (0.85..=1.0).contains(&r)
        });
    }

    for (question, option, fill) in &marks.marks {
        let Some(bubbles) = template.question_bubbles(question) else {
            continue;
        };
        let Some(b) = bubbles
            .iter()
            .filter_map(|&i| template.bubble(i))
            .find(|b| &b.option == option)
        else {
            continue;
        };
        let half = [0.5 * b.size[0], 0.5 * b.size[1]];
        let radius = if *fill >= 1.0 {
            0.95
        } else {
            0.7 * (*fill as f64).sqrt()
        };
        paint(&mut img, tf, &h_inv, b.bounds(), params.ink, |p| {
            shape_radius(b.shape, b.center, half, p) <= radius
        });
    }

    if params.noise > 0 {
        let mut rng = StdRng::seed_from_u64(params.seed);
        let a = params.noise as i16;
        for px in img.pixels_mut() {
            let v = px[0] as i16 + rng.gen_range(-a..=a);
            px[0] = v.clamp(0, 255) as u8;
        }
    }
    img
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::tests::quiz5;

    #[test]
    fn fitted_page_is_centered() {
        let t = quiz5();
        let p = RenderParams::fitted(&t, (600, 800));
        let c = project(&p.transform, [300.0, 400.0]).expect("finite");
        assert!((c[0] - 300.0).abs() < 1e-9 && (c[1] - 400.0).abs() < 1e-9);
    }

    #[test]
    fn rendering_is_deterministic() {
        let t = quiz5();
        let p = RenderParams::fitted(&t, (300, 400)).rotated(3.0);
        let marks = SheetMarks::answers([("q1", "A"), ("q2", "C")]);
        assert_eq!(render_sheet(&t, &marks, &p), render_sheet(&t, &marks, &p));
    }

    #[test]
    fn marks_and_fiducials_are_dark() {
        let t = quiz5();
        let p = RenderParams::fitted(&t, (600, 800)).with_noise(0, 0);
        let img = render_sheet(&t, &SheetMarks::new().mark("q1", "A"), &p);
        let at = |q: [f64; 2]| {
            let c = project(&p.transform, q).expect("finite");
            img.get_pixel(c[0] as u32, c[1] as u32)[0]
        };
        assert_eq!(at([40.0, 40.0]), 20);
        assert_eq!(at([165.0, 165.0]), 20);
        assert_eq!(at([225.0, 165.0]), 235);
    }

    #[test]
    fn hidden_fiducials_are_not_drawn() {
        let t = quiz5();
        let p = RenderParams::fitted(&t, (600, 800))
            .with_noise(0, 0)
            .with_hidden_fiducials(&["tl"]);
        let img = render_sheet(&t, &SheetMarks::new(), &p);
        let c = project(&p.transform, [40.0, 40.0]).expect("finite");
        assert_eq!(img.get_pixel(c[0] as u32, c[1] as u32)[0], 235);
    }
}
