//! Globally consistent fiducial-to-candidate assignment.

use super::fiducials::FiducialCandidate;

/// Cost of an infeasible pairing. Finite so the solver stays well defined.
const FORBIDDEN: f64 = 1e12;

/// Result of one matching round.
#[derive(Debug, Clone, Default)]
pub(crate) struct FiducialAssignment {
    /// `(fiducial index, candidate index, distance px)`, sorted by fiducial.
    pub pairs: Vec<(usize, usize, f64)>,
    /// Matched fiducials with a competing candidate nearby.
    pub ambiguous: Vec<usize>,
}

impl FiducialAssignment {
    pub fn candidate_of(&self, fiducial: usize) -> Option<usize> {
        self.pairs
            .iter()
            .find(|(f, _, _)| *f == fiducial)
            .map(|(_, c, _)| *c)
    }
}

fn distance(a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - b[0]).hypot(a[1] - b[1])
}

/// Assign each fiducial to at most one candidate within `gate_px` of its
/// expected position, minimizing total distance. Non-finite expected
/// positions never match.
pub(crate) fn match_fiducials(
    expected: &[[f64; 2]],
    candidates: &[FiducialCandidate],
    gate_px: f64,
    ambiguity_ratio: f64,
) -> FiducialAssignment {
    if expected.is_empty() || candidates.is_empty() {
        return FiducialAssignment::default();
    }

    let feasible = |i: usize, j: usize| -> Option<f64> {
        let c = &candidates[j];
        if !c.compatible.contains(&i) {
            return None;
        }
        let d = distance(expected[i], c.center);
        (d.is_finite() && d <= gate_px).then_some(d)
    };

    let cost: Vec<Vec<f64>> = (0..expected.len())
        .map(|i| {
            (0..candidates.len())
                .map(|j| feasible(i, j).unwrap_or(FORBIDDEN))
                .collect()
        })
        .collect();

    let mut out = FiducialAssignment::default();
    for (i, assigned) in solve_assignment(&cost).into_iter().enumerate() {
        let Some(j) = assigned else { continue };
        let Some(d) = feasible(i, j) else { continue };
        out.pairs.push((i, j, d));

        let rivals = (0..candidates.len())
            .filter(|&k| k != j)
            .filter_map(|k| feasible(i, k))
            .any(|dk| dk <= d * ambiguity_ratio);
        if rivals {
            out.ambiguous.push(i);
        }
    }
    out
}

/// Minimum-cost assignment of rows to columns (Hungarian method, O(n²m)).
///
/// Works on rectangular matrices; when there are more rows than columns the
/// matrix is padded with `FORBIDDEN` columns. Returns the column assigned to
/// each row, `None` for rows landing on padding.
pub(crate) fn solve_assignment(cost: &[Vec<f64>]) -> Vec<Option<usize>> {
    let n = cost.len();
    if n == 0 {
        return Vec::new();
    }
    let cols = cost[0].len();
    let m = cols.max(n);
    let c = |i: usize, j: usize| -> f64 {
        if j < cols {
            cost[i][j]
        } else {
            FORBIDDEN
        }
    };

    // 1-based potentials; index 0 is the virtual root
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = c(i0 - 1, j - 1) - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut out = vec![None; n];
    for j in 1..=m {
        if p[j] != 0 && j - 1 < cols {
            out[p[j] - 1] = Some(j - 1);
        }
    }
    out
}
