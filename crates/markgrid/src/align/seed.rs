//! Coarse page pose from fiducial pairs.
//!
//! Every pairing of two template fiducials with two compatible candidates
//! defines a similarity (scale, rotation, translation). Hypotheses outside
//! the configured scale and rotation range are skipped; the rest are scored
//! by how many fiducials then find a size-consistent candidate within the
//! gate. The winner only seeds the assignment, so it does not have to be
//! exact under perspective.

use super::fiducials::FiducialCandidate;
use super::PagePrior;
use crate::config::GradeConfig;
use crate::template::{Fiducial, Template};

/// Extra rotation accepted while seeding; two-point similarities read the
/// rotation of a tilted page less reliably than the final fit.
const ROTATION_SLACK_DEG: f64 = 5.0;

/// `p ↦ s·R(θ)·p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Similarity {
    pub scale: f64,
    /// Radians, image convention (y down).
    pub rotation: f64,
    pub translation: [f64; 2],
}

impl Similarity {
    /// The similarity taking `src[0] → dst[0]` and `src[1] → dst[1]`.
    pub fn from_pairs(src: [[f64; 2]; 2], dst: [[f64; 2]; 2]) -> Option<Self> {
        let u = [src[1][0] - src[0][0], src[1][1] - src[0][1]];
        let v = [dst[1][0] - dst[0][0], dst[1][1] - dst[0][1]];
        let nu = u[0].hypot(u[1]);
        let nv = v[0].hypot(v[1]);
        if !(nu > 1e-9 && nv > 1e-9 && nu.is_finite() && nv.is_finite()) {
            return None;
        }
        let scale = nv / nu;
        let rotation = v[1].atan2(v[0]) - u[1].atan2(u[0]);
        let rotation = rotation.sin().atan2(rotation.cos());
        let (s, c) = rotation.sin_cos();
        let translation = [
            dst[0][0] - scale * (c * src[0][0] - s * src[0][1]),
            dst[0][1] - scale * (s * src[0][0] + c * src[0][1]),
        ];
        Some(Self {
            scale,
            rotation,
            translation,
        })
    }

    pub fn apply(&self, p: [f64; 2]) -> [f64; 2] {
        let (s, c) = self.rotation.sin_cos();
        [
            self.scale * (c * p[0] - s * p[1]) + self.translation[0],
            self.scale * (s * p[0] + c * p[1]) + self.translation[1],
        ]
    }
}

/// A scored pose hypothesis.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PoseSeed {
    pub pose: Similarity,
    /// Fiducials with a consistent candidate inside the gate.
    pub support: usize,
    /// Gate radius in pixels at this pose's scale.
    pub gate_px: f64,
}

fn area_fits(candidate: &FiducialCandidate, fiducial: &Fiducial, scale: f64, tol: f64) -> bool {
    let ratio = candidate.area / (fiducial.area() * scale * scale);
    ratio >= (1.0 - tol).powi(2) && ratio <= (1.0 + tol).powi(2)
}

/// Best similarity pose, or `None` when no two candidates form a plausible pair.
pub(crate) fn seed_pose(
    template: &Template,
    candidates: &[FiducialCandidate],
    prior: &PagePrior,
    config: &GradeConfig,
) -> Option<PoseSeed> {
    let fiducials = template.fiducials();
    let page = template.page_size();
    let tol = config.fiducials.size_tolerance as f64;
    let bounds = &config.distortion;
    let min_scale = prior.scale * bounds.min_scale_ratio * (1.0 - tol);
    let max_scale = prior.scale * bounds.max_scale_ratio * (1.0 + tol);
    let max_rotation = (bounds.max_rotation_deg + ROTATION_SLACK_DEG).to_radians();
    let gate_per_scale = config.fiducials.match_gate_frac as f64 * page[0].hypot(page[1]);
    let page_center = [0.5 * page[0], 0.5 * page[1]];
    let prior_center = prior.expected(page_center);

    // candidates per fiducial, by compatibility only
    let pool: Vec<Vec<usize>> = (0..fiducials.len())
        .map(|i| {
            (0..candidates.len())
                .filter(|&c| candidates[c].compatible.contains(&i))
                .collect()
        })
        .collect();

    // (support, squared residual, distance to the prior's page center)
    let mut best: Option<(PoseSeed, f64, f64)> = None;
    for i in 0..fiducials.len() {
        for j in (i + 1)..fiducials.len() {
            for &a in &pool[i] {
                for &b in &pool[j] {
                    if a == b {
                        continue;
                    }
                    let Some(pose) = Similarity::from_pairs(
                        [fiducials[i].center, fiducials[j].center],
                        [candidates[a].center, candidates[b].center],
                    ) else {
                        continue;
                    };
                    if pose.scale < min_scale
                        || pose.scale > max_scale
                        || pose.rotation.abs() > max_rotation
                        || !area_fits(&candidates[a], &fiducials[i], pose.scale, tol)
                        || !area_fits(&candidates[b], &fiducials[j], pose.scale, tol)
                    {
                        continue;
                    }

                    let gate_px = gate_per_scale * pose.scale;
                    let mut support = 0;
                    let mut residual = 0.0;
                    for (k, f) in fiducials.iter().enumerate() {
                        let p = pose.apply(f.center);
                        let nearest = pool[k]
                            .iter()
                            .filter(|&&c| area_fits(&candidates[c], f, pose.scale, tol))
                            .map(|&c| {
                                let q = candidates[c].center;
                                (p[0] - q[0]).hypot(p[1] - q[1])
                            })
                            .filter(|&d| d <= gate_px)
                            .min_by(f64::total_cmp);
                        if let Some(d) = nearest {
                            support += 1;
                            residual += d * d;
                        }
                    }

                    let c = pose.apply(page_center);
                    let drift = (c[0] - prior_center[0]).hypot(c[1] - prior_center[1]);
                    let better = match &best {
                        None => true,
                        Some((seed, best_residual, best_drift)) => {
                            support > seed.support
                                || (support == seed.support
                                    && (residual < best_residual - 1e-9
                                        || (residual <= best_residual + 1e-9
                                            && drift < *best_drift)))
                        }
                    };
                    if better {
                        let seed = PoseSeed {
                            pose,
                            support,
                            gate_px,
                        };
                        best = Some((seed, residual, drift));
                    }
                }
            }
        }
    }

    if let Some((seed, residual, _)) = &best {
        tracing::trace!(
            support = seed.support,
            scale = seed.pose.scale,
            rotation_deg = seed.pose.rotation.to_degrees(),
            residual,
            "pose seed"
        );
    }
    best.map(|(seed, _, _)| seed)
}
