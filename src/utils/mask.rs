//! Intensity-based eligibility mask.
//!
//! When no external mask is supplied, a simple foreground mask is derived
//! from the signal volumes themselves: combine voxelwise by maximum, take
//! the 95th percentile of the finite combined values, and keep voxels above
//! `fraction` times that percentile.

/// Percentile of `values` with linear interpolation between closest ranks
/// (numpy convention). Returns 0.0 for an empty slice; values are assumed
/// finite.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Build a foreground mask from the signal volumes.
///
/// All volumes must share the grid length. A NaN in any volume propagates
/// into the combined maximum, so such voxels never pass the strict
/// threshold comparison. If no finite combined values exist at all, the
/// mask is all-false.
///
/// # Arguments
/// * `vols` - Signal volumes, one flat grid per flip angle
/// * `fraction` - Threshold as a fraction of the 95th percentile
///   (0.05 by default upstream)
///
/// # Returns
/// Binary mask, 1 = eligible
pub fn build_auto_mask(vols: &[impl AsRef<[f64]>], fraction: f64) -> Vec<u8> {
    let vols: Vec<&[f64]> = vols.iter().map(AsRef::as_ref).collect();
    let n_total = vols.first().map_or(0, |v| v.len());

    let mut combined = vec![f64::NEG_INFINITY; n_total];
    for vol in &vols {
        for (c, &s) in combined.iter_mut().zip(vol.iter()) {
            if s.is_nan() || c.is_nan() {
                *c = f64::NAN;
            } else if s > *c {
                *c = s;
            }
        }
    }

    let finite: Vec<f64> = combined.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return vec![0u8; n_total];
    }

    let threshold = fraction * percentile(&finite, 95.0);
    combined.iter().map(|&c| (c > threshold) as u8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_endpoints() {
        let v = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&v, 0.0), 1.0);
        assert_eq!(percentile(&v, 100.0), 5.0);
        assert_eq!(percentile(&v, 50.0), 3.0);
    }

    #[test]
    fn test_percentile_interpolates() {
        let v = vec![0.0, 10.0];
        assert!((percentile(&v, 95.0) - 9.5).abs() < 1e-12);
    }

    #[test]
    fn test_percentile_unsorted_input() {
        let v = vec![5.0, 1.0, 3.0, 2.0, 4.0];
        assert_eq!(percentile(&v, 50.0), 3.0);
    }

    #[test]
    fn test_percentile_empty() {
        assert_eq!(percentile(&[], 95.0), 0.0);
    }

    #[test]
    fn test_auto_mask_thresholds_background() {
        // 100 voxels: 95 dim, 5 bright. p95 sits at the transition, so the
        // 5% threshold keeps the bright voxels and drops the zeros.
        let mut s1 = vec![0.0; 100];
        let mut s2 = vec![0.0; 100];
        for i in 95..100 {
            s1[i] = 1000.0;
            s2[i] = 500.0;
        }
        let mask = build_auto_mask(&[s1, s2], 0.05);
        let count: usize = mask.iter().map(|&m| m as usize).sum();
        assert_eq!(count, 5);
        assert_eq!(mask[94], 0);
        assert_eq!(mask[99], 1);
    }

    #[test]
    fn test_auto_mask_uses_voxelwise_max() {
        // Voxel 0 is bright only in the second volume; the combined maximum
        // must still pick it up.
        let s1 = vec![0.0, 800.0];
        let s2 = vec![900.0, 0.0];
        let mask = build_auto_mask(&[s1, s2], 0.05);
        assert_eq!(mask, vec![1, 1]);
    }

    #[test]
    fn test_auto_mask_nan_voxel_excluded() {
        let s1 = vec![f64::NAN, 100.0, 100.0, 100.0];
        let s2 = vec![500.0, 100.0, 100.0, 100.0];
        let mask = build_auto_mask(&[s1, s2], 0.05);
        assert_eq!(mask[0], 0, "NaN propagates through the combined maximum");
        assert_eq!(&mask[1..], &[1, 1, 1]);
    }

    #[test]
    fn test_auto_mask_all_nonfinite() {
        let s1 = vec![f64::NAN; 8];
        let s2 = vec![f64::INFINITY; 8];
        let mask = build_auto_mask(&[s1, s2], 0.05);
        assert_eq!(mask, vec![0u8; 8]);
    }

    #[test]
    fn test_auto_mask_empty_volumes() {
        let vols: Vec<Vec<f64>> = vec![Vec::new(), Vec::new()];
        assert!(build_auto_mask(&vols, 0.05).is_empty());
    }
}
