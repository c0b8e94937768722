//! 2-D affine transforms, constrained model fitting and RANSAC.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{AlignmentConfig, TransformModel};

/// `x' = a*x + b*y + tx`, `y' = c*x + d*y + ty`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub tx: f64,
    pub ty: f64,
}

/// Rotation-then-scale/shear decomposition of the linear part.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    pub scale_x: f64,
    pub scale_y: f64,
    pub rotation_deg: f64,
    pub shear: f64,
    pub determinant: f64,
}

impl AffineTransform {
    pub const IDENTITY: AffineTransform = AffineTransform {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    pub fn similarity(scale: f64, rotation_rad: f64, tx: f64, ty: f64) -> Self {
        let (s, c) = rotation_rad.sin_cos();
        Self {
            a: scale * c,
            b: -scale * s,
            c: scale * s,
            d: scale * c,
            tx,
            ty,
        }
    }

    pub fn apply(&self, (x, y): (f64, f64)) -> (f64, f64) {
        (
            self.a * x + self.b * y + self.tx,
            self.c * x + self.d * y + self.ty,
        )
    }

    pub fn decompose(&self) -> Decomposition {
        let determinant = self.a * self.d - self.b * self.c;
        let scale_x = (self.a * self.a + self.c * self.c).sqrt();
        let rotation = self.c.atan2(self.a);
        let (scale_y, shear) = if scale_x > f64::EPSILON {
            let scale_y = determinant / scale_x;
            let upper = (self.a * self.b + self.c * self.d) / scale_x;
            let shear = if scale_y.abs() > f64::EPSILON {
                upper / scale_y
            } else {
                f64::INFINITY
            };
            (scale_y, shear)
        } else {
            (0.0, f64::INFINITY)
        };
        Decomposition {
            scale_x,
            scale_y,
            rotation_deg: rotation.to_degrees(),
            shear,
            determinant,
        }
    }

    /// Conjugates a transform fitted on images resampled by `factor`
    /// (working = full * factor) back to full-resolution coordinates.
    pub fn rescaled(&self, factor: f64) -> Self {
        Self {
            tx: self.tx / factor,
            ty: self.ty / factor,
            ..*self
        }
    }

    /// Row-major 3x3 homogeneous matrix.
    pub fn to_matrix(&self) -> [f32; 9] {
        [
            self.a as f32,
            self.b as f32,
            self.tx as f32,
            self.c as f32,
            self.d as f32,
            self.ty as f32,
            0.0,
            0.0,
            1.0,
        ]
    }

    pub fn is_finite(&self) -> bool {
        [self.a, self.b, self.c, self.d, self.tx, self.ty]
            .iter()
            .all(|v| v.is_finite())
    }
}

/// Geometric limits a fitted model must respect.
#[derive(Debug, Clone, Copy)]
pub struct Constraints {
    pub model: TransformModel,
    pub scale_min: f64,
    pub scale_max: f64,
    pub rotation_deg_min: f64,
    pub rotation_deg_max: f64,
    pub max_shear: f64,
}

impl From<&AlignmentConfig> for Constraints {
    fn from(config: &AlignmentConfig) -> Self {
        Self {
            model: config.model,
            scale_min: config.scale_min,
            scale_max: config.scale_max,
            rotation_deg_min: config.rotation_deg_min,
            rotation_deg_max: config.rotation_deg_max,
            max_shear: config.max_shear,
        }
    }
}

impl Constraints {
    pub fn accepts(&self, t: &AffineTransform) -> bool {
        if !t.is_finite() {
            return false;
        }
        let dec = t.decompose();
        if dec.determinant <= 0.0 {
            return false;
        }
        let in_scale = |s: f64| s >= self.scale_min && s <= self.scale_max;
        if !in_scale(dec.scale_x) || !in_scale(dec.scale_y) {
            return false;
        }
        if dec.rotation_deg < self.rotation_deg_min || dec.rotation_deg > self.rotation_deg_max {
            return false;
        }
        match self.model {
            TransformModel::Similarity => true,
            TransformModel::Affine => dec.shear.abs() <= self.max_shear,
        }
    }
}

pub type Correspondence = ((f64, f64), (f64, f64));

/// Least-squares similarity (`a = s cos`, `c = s sin`) over at least two
/// correspondences. `None` when the source points are degenerate.
pub fn fit_similarity(pairs: &[Correspondence]) -> Option<AffineTransform> {
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let (mut sx, mut sy, mut dx, mut dy) = (0.0, 0.0, 0.0, 0.0);
    for ((px, py), (qx, qy)) in pairs {
        sx += px;
        sy += py;
        dx += qx;
        dy += qy;
    }
    let (sx, sy, dx, dy) = (sx / n, sy / n, dx / n, dy / n);

    let (mut num_a, mut num_b, mut den) = (0.0, 0.0, 0.0);
    for ((px, py), (qx, qy)) in pairs {
        let (x, y) = (px - sx, py - sy);
        let (u, v) = (qx - dx, qy - dy);
        num_a += x * u + y * v;
        num_b += x * v - y * u;
        den += x * x + y * y;
    }
    if den <= f64::EPSILON {
        return None;
    }
    let a = num_a / den;
    let c = num_b / den;
    Some(AffineTransform {
        a,
        b: -c,
        c,
        d: a,
        tx: dx - (a * sx - c * sy),
        ty: dy - (c * sx + a * sy),
    })
}

/// Least-squares affine fit over at least three non-collinear
/// correspondences.
pub fn fit_affine(pairs: &[Correspondence]) -> Option<AffineTransform> {
    if pairs.len() < 3 {
        return None;
    }
    // Normal equations: (A^T A) p = A^T b with rows [x, y, 1].
    let mut ata = [[0.0f64; 3]; 3];
    let mut atu = [0.0f64; 3];
    let mut atv = [0.0f64; 3];
    for ((x, y), (u, v)) in pairs {
        let row = [*x, *y, 1.0];
        for i in 0..3 {
            for j in 0..3 {
                ata[i][j] += row[i] * row[j];
            }
            atu[i] += row[i] * u;
            atv[i] += row[i] * v;
        }
    }
    let [a, b, tx] = solve3(ata, atu)?;
    let [c, d, ty] = solve3(ata, atv)?;
    Some(AffineTransform { a, b, c, d, tx, ty })
}

fn solve3(m: [[f64; 3]; 3], rhs: [f64; 3]) -> Option<[f64; 3]> {
    let det = |m: &[[f64; 3]; 3]| {
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    };
    let d = det(&m);
    // Relative tolerance; the matrix entries grow with coordinate magnitude.
    let magnitude = m.iter().flatten().map(|v| v.abs()).fold(0.0, f64::max);
    if d.abs() <= 1e-12 * magnitude.powi(3).max(1.0) {
        return None;
    }
    let mut out = [0.0; 3];
    for (col, slot) in out.iter_mut().enumerate() {
        let mut replaced = m;
        for row in 0..3 {
            replaced[row][col] = rhs[row];
        }
        *slot = det(&replaced) / d;
    }
    Some(out)
}

pub fn fit(model: TransformModel, pairs: &[Correspondence]) -> Option<AffineTransform> {
    match model {
        TransformModel::Similarity => fit_similarity(pairs),
        TransformModel::Affine => fit_affine(pairs),
    }
}

fn minimal_sample_size(model: TransformModel) -> usize {
    match model {
        TransformModel::Similarity => 2,
        TransformModel::Affine => 3,
    }
}

pub fn reprojection_error(t: &AffineTransform, (p, q): &Correspondence) -> f64 {
    let (x, y) = t.apply(*p);
    ((x - q.0).powi(2) + (y - q.1).powi(2)).sqrt()
}

#[derive(Debug, Clone)]
pub struct RansacOutcome {
    pub transform: AffineTransform,
    pub inliers: Vec<usize>,
    pub candidates_rejected: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RansacParams {
    pub iterations: u32,
    pub threshold: f64,
    pub seed: u64,
    /// Minimum distance between source points of one hypothesis sample.
    pub min_sample_spread: f64,
}

/// Fewest correspondences registration accepts, both as good matches and
/// as inliers of the returned model.
pub const MIN_CORRESPONDENCES: usize = 3;

/// Seeded RANSAC over `pairs`. Every hypothesis, and the final refit, must
/// pass `constraints`; a model failing them is never returned.
///
/// Returns `Err(candidates_rejected)` when no constrained model with at
/// least [`MIN_CORRESPONDENCES`] inliers exists.
pub fn ransac(
    pairs: &[Correspondence],
    constraints: &Constraints,
    params: RansacParams,
) -> Result<RansacOutcome, usize> {
    let minimal = minimal_sample_size(constraints.model);
    if pairs.len() < minimal {
        return Err(0);
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut rejected = 0usize;
    let mut best: Option<(AffineTransform, Vec<usize>)> = None;
    let mut sample = Vec::with_capacity(minimal);

    for _ in 0..params.iterations {
        sample.clear();
        while sample.len() < minimal {
            let idx = rng.random_range(0..pairs.len());
            if !sample.contains(&idx) {
                sample.push(idx);
            }
        }
        let subset: Vec<Correspondence> = sample.iter().map(|&i| pairs[i]).collect();
        if !well_spread(&subset, params.min_sample_spread) {
            continue;
        }
        let Some(candidate) = fit(constraints.model, &subset) else {
            continue;
        };
        if !constraints.accepts(&candidate) {
            rejected += 1;
            continue;
        }
        let inliers = collect_inliers(&candidate, pairs, params.threshold);
        let better = match &best {
            Some((_, current)) => inliers.len() > current.len(),
            None => true,
        };
        if better {
            best = Some((candidate, inliers));
        }
    }

    let Some((mut transform, mut inliers)) = best else {
        return Err(rejected);
    };
    if inliers.len() < MIN_CORRESPONDENCES.max(minimal) {
        return Err(rejected);
    }

    let inlier_pairs: Vec<Correspondence> = inliers.iter().map(|&i| pairs[i]).collect();
    if let Some(refit) = fit(constraints.model, &inlier_pairs) {
        if constraints.accepts(&refit) {
            let refit_inliers = collect_inliers(&refit, pairs, params.threshold);
            if refit_inliers.len() >= inliers.len() {
                transform = refit;
                inliers = refit_inliers;
            }
        }
    }

    Ok(RansacOutcome {
        transform,
        inliers,
        candidates_rejected: rejected,
    })
}

fn well_spread(sample: &[Correspondence], min_spread: f64) -> bool {
    sample.iter().enumerate().all(|(i, ((x1, y1), _))| {
        sample[i + 1..]
            .iter()
            .all(|((x2, y2), _)| ((x1 - x2).powi(2) + (y1 - y2).powi(2)).sqrt() >= min_spread)
    })
}

fn collect_inliers(t: &AffineTransform, pairs: &[Correspondence], threshold: f64) -> Vec<usize> {
    pairs
        .iter()
        .enumerate()
        .filter(|(_, pair)| reprojection_error(t, pair) <= threshold)
        .map(|(i, _)| i)
        .collect()
}
