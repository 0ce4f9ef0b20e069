//! Voxelwise VFA fitting.
//!
//! For a spoiled gradient-echo signal S at flip angle α, the transform
//! x = S/tan(α), y = S/sin(α) linearizes the signal equation to
//! y = E1·x + K(1−E1) with E1 = exp(−TR/T1). The slope is solved per voxel,
//! either in closed form from exactly two angles or by ordinary least
//! squares over N ≥ 2 angles, then converted to T1 = −TR/ln(E1).
//!
//! Every voxel is an independent pure function of its own inputs, so the
//! grid is processed in parallel chunks; the result is identical to the
//! serial loop.

use rayon::prelude::*;

use crate::error::VfaError;

/// Angles whose sine or tangent magnitude falls below this are numerically
/// degenerate even when nominally inside (0, 180).
const DEGENERATE_TRIG: f64 = 1e-12;

const VOXEL_CHUNK: usize = 4096;

/// Clamp bounds for the fitted E1 and the fill value written to excluded
/// voxels.
#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    /// Lower clamp for E1, keeps the logarithm well-defined.
    pub e1_min: f64,
    /// Upper clamp for E1, keeps it below 1.
    pub e1_max: f64,
    /// Value written to ineligible or excluded voxels in all output maps.
    pub fill: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            e1_min: 1e-6,
            e1_max: 0.999999,
            fill: 0.0,
        }
    }
}

/// Fit output. All maps share the input grid length.
///
/// `valid` is the authoritative eligibility record: 1 means the voxel was
/// fitted and converted, 0 means it carries the fill value. The numeric
/// maps alone cannot distinguish an excluded voxel from a genuine value
/// equal to the fill.
#[derive(Debug, Clone)]
pub struct T1FitResult {
    /// T1 in seconds.
    pub t1: Vec<f64>,
    /// Fitted decay factor after clamping.
    pub e1: Vec<f64>,
    /// OLS intercept ȳ − Ê1·x̄ (estimates K(1−E1)).
    pub intercept: Vec<f64>,
    /// 1 = fitted, 0 = excluded.
    pub valid: Vec<u8>,
}

struct AngleTrig {
    sin_a: f64,
    tan_a: f64,
}

/// Validate TR, angles, shapes, mask, and clamp bounds before any voxel
/// processing. Returns the per-angle trig factors on success.
fn validate_setup(
    vols: &[&[f64]],
    fas_deg: &[f64],
    tr_s: f64,
    mask: Option<&[u8]>,
    opts: &FitOptions,
) -> Result<Vec<AngleTrig>, VfaError> {
    if vols.len() != fas_deg.len() {
        return Err(VfaError::Config(format!(
            "volume/angle count mismatch: {} volumes vs {} flip angles",
            vols.len(),
            fas_deg.len()
        )));
    }
    if vols.len() < 2 {
        return Err(VfaError::Config(format!(
            "at least 2 signal volumes are required; got {}",
            vols.len()
        )));
    }
    if !(tr_s > 0.0) {
        return Err(VfaError::Config(format!("TR must be > 0 seconds; got {tr_s}")));
    }
    if !(opts.e1_min.is_finite() && opts.e1_max.is_finite() && opts.e1_min > 0.0 && opts.e1_min <= opts.e1_max) {
        return Err(VfaError::Config(format!(
            "E1 clamp bounds must satisfy 0 < e1_min <= e1_max; got [{}, {}]",
            opts.e1_min, opts.e1_max
        )));
    }

    let mut trig = Vec::with_capacity(fas_deg.len());
    for &fa in fas_deg {
        if !(fa > 0.0 && fa < 180.0) {
            return Err(VfaError::Config(format!(
                "flip angles must be in (0, 180) degrees; got {fa}"
            )));
        }
        let a = fa.to_radians();
        let (sin_a, tan_a) = (a.sin(), a.tan());
        if sin_a.abs() < DEGENERATE_TRIG || tan_a.abs() < DEGENERATE_TRIG {
            return Err(VfaError::Config(format!(
                "flip angle {fa} degrees is numerically degenerate"
            )));
        }
        trig.push(AngleTrig { sin_a, tan_a });
    }

    let n_total = vols[0].len();
    for (i, v) in vols.iter().enumerate() {
        if v.len() != n_total {
            return Err(VfaError::Config(format!(
                "volume {i} has {} voxels, expected {n_total}",
                v.len()
            )));
        }
    }
    if let Some(m) = mask {
        if m.len() != n_total {
            return Err(VfaError::Config(format!(
                "mask has {} voxels, expected {n_total}",
                m.len()
            )));
        }
    }

    Ok(trig)
}

/// Convert an E1 map to T1 in seconds: T1 = −TR/ln(E1).
///
/// Applied only where E1 is finite and strictly inside (0, 1); every other
/// voxel receives `fill`.
pub fn e1_to_t1(e1: &[f64], tr_s: f64, fill: f64) -> Vec<f64> {
    e1.iter()
        .map(|&v| {
            if v.is_finite() && v > 0.0 && v < 1.0 {
                -tr_s / v.ln()
            } else {
                fill
            }
        })
        .collect()
}

/// Replace the NaN placeholders of excluded voxels with the fill value and
/// assemble the result struct.
fn finalize(mut e1: Vec<f64>, mut intercept: Vec<f64>, valid: Vec<u8>, tr_s: f64, opts: &FitOptions) -> T1FitResult {
    let t1 = e1_to_t1(&e1, tr_s, opts.fill);
    for (e, b) in e1.iter_mut().zip(intercept.iter_mut()) {
        if e.is_nan() {
            *e = opts.fill;
            *b = opts.fill;
        }
    }
    T1FitResult { t1, e1, intercept, valid }
}

/// Two-point closed-form fit: E1 = (y₂−y₁)/(x₂−x₁) per voxel.
///
/// A voxel is fitted only if both signals are finite and strictly positive,
/// the mask (if any) marks it in, and the denominator is nonzero with both
/// numerator and denominator finite. The slope is clamped into
/// [e1_min, e1_max] before conversion.
pub fn fit_two_point(
    s1: &[f64],
    s2: &[f64],
    fa1_deg: f64,
    fa2_deg: f64,
    tr_s: f64,
    mask: Option<&[u8]>,
    opts: &FitOptions,
) -> Result<T1FitResult, VfaError> {
    let vols = [s1, s2];
    let trig = validate_setup(&vols, &[fa1_deg, fa2_deg], tr_s, mask, opts)?;
    let n_total = s1.len();

    let mut e1 = vec![f64::NAN; n_total];
    let mut intercept = vec![f64::NAN; n_total];
    let mut valid = vec![0u8; n_total];

    e1.par_chunks_mut(VOXEL_CHUNK)
        .zip(intercept.par_chunks_mut(VOXEL_CHUNK))
        .zip(valid.par_chunks_mut(VOXEL_CHUNK))
        .enumerate()
        .for_each(|(ci, ((e1_chunk, b_chunk), ok_chunk))| {
            let base = ci * VOXEL_CHUNK;
            for o in 0..e1_chunk.len() {
                let v = base + o;
                if let Some(m) = mask {
                    if m[v] == 0 {
                        continue;
                    }
                }

                let (v1, v2) = (s1[v], s2[v]);
                if !(v1.is_finite() && v2.is_finite() && v1 > 0.0 && v2 > 0.0) {
                    continue;
                }

                let x1 = v1 / trig[0].tan_a;
                let y1 = v1 / trig[0].sin_a;
                let x2 = v2 / trig[1].tan_a;
                let y2 = v2 / trig[1].sin_a;

                let numer = y2 - y1;
                let denom = x2 - x1;
                if !(numer.is_finite() && denom.is_finite()) || denom.abs() == 0.0 {
                    continue;
                }

                let slope = (numer / denom).clamp(opts.e1_min, opts.e1_max);
                e1_chunk[o] = slope;
                b_chunk[o] = 0.5 * (y1 + y2) - slope * 0.5 * (x1 + x2);
                ok_chunk[o] = (slope.is_finite() && slope > 0.0 && slope < 1.0) as u8;
            }
        });

    Ok(finalize(e1, intercept, valid, tr_s, opts))
}

/// Generalized N-point least-squares fit over N ≥ 2 flip angles.
///
/// Per voxel, the OLS slope Ê1 = Σ(x−x̄)(y−ȳ)/Σ(x−x̄)² and intercept
/// ȳ − Ê1·x̄ are computed over the angle dimension. A voxel is fitted only
/// if every signal is finite and strictly positive and the mask (if any)
/// marks it in; zero x-variance (collinear projected signals) excludes the
/// voxel without raising an error. With exactly two angles this coincides
/// numerically with [`fit_two_point`].
pub fn fit_multi_point(
    vols: &[impl AsRef<[f64]>],
    fas_deg: &[f64],
    tr_s: f64,
    mask: Option<&[u8]>,
    opts: &FitOptions,
) -> Result<T1FitResult, VfaError> {
    let vols: Vec<&[f64]> = vols.iter().map(AsRef::as_ref).collect();
    let trig = validate_setup(&vols, fas_deg, tr_s, mask, opts)?;
    let n_angles = vols.len();
    let n_total = vols[0].len();

    let mut e1 = vec![f64::NAN; n_total];
    let mut intercept = vec![f64::NAN; n_total];
    let mut valid = vec![0u8; n_total];

    e1.par_chunks_mut(VOXEL_CHUNK)
        .zip(intercept.par_chunks_mut(VOXEL_CHUNK))
        .zip(valid.par_chunks_mut(VOXEL_CHUNK))
        .enumerate()
        .for_each(|(ci, ((e1_chunk, b_chunk), ok_chunk))| {
            let base = ci * VOXEL_CHUNK;
            'voxel: for o in 0..e1_chunk.len() {
                let v = base + o;
                if let Some(m) = mask {
                    if m[v] == 0 {
                        continue;
                    }
                }

                // First pass: eligibility and per-voxel means over angles.
                let mut sum_x = 0.0;
                let mut sum_y = 0.0;
                for e in 0..n_angles {
                    let s = vols[e][v];
                    if !(s.is_finite() && s > 0.0) {
                        continue 'voxel;
                    }
                    sum_x += s / trig[e].tan_a;
                    sum_y += s / trig[e].sin_a;
                }
                let x_mean = sum_x / n_angles as f64;
                let y_mean = sum_y / n_angles as f64;

                // Second pass: centered variance and covariance.
                let mut var_x = 0.0;
                let mut cov_xy = 0.0;
                for e in 0..n_angles {
                    let s = vols[e][v];
                    let xc = s / trig[e].tan_a - x_mean;
                    let yc = s / trig[e].sin_a - y_mean;
                    var_x += xc * xc;
                    cov_xy += xc * yc;
                }

                if !(var_x > 0.0) {
                    continue;
                }

                let slope = (cov_xy / var_x).clamp(opts.e1_min, opts.e1_max);
                e1_chunk[o] = slope;
                b_chunk[o] = y_mean - slope * x_mean;
                ok_chunk[o] = (slope.is_finite() && slope > 0.0 && slope < 1.0) as u8;
            }
        });

    Ok(finalize(e1, intercept, valid, tr_s, opts))
}
