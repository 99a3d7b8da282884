//! Detrended fluctuation analysis.
//!
//! Estimates the scaling exponent α of a short series: α ≈ 0.5 for
//! uncorrelated noise, α ≈ 1.0 for long-range correlated (self-organizing)
//! movement. The estimator is first-order DFA: integrate the mean-centered
//! series, split into non-overlapping boxes at several sizes, remove a
//! least-squares line per box, and fit the log-log slope of the residual
//! fluctuation against box size.
//!
//! Short, streaming series are the expected input, so the result type is
//! explicit about the cases a numeric default would hide: not enough data,
//! a defined estimate, or a degenerate fit (slope outside the meaningful
//! range, or a series too flat to carry correlation structure).

use serde::{Deserialize, Serialize};

/// Smallest box size used in the fit.
const MIN_BOX: usize = 4;

/// Outcome of an α estimation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlphaEstimate {
    /// Fewer points than the configured minimum window.
    InsufficientData,
    /// The fit produced a slope outside (0, 2), or the series was too flat
    /// to fit at all (reported as raw 0).
    Degenerate { raw: f64 },
    /// A defined, in-range exponent.
    Estimate { alpha: f64 },
}

impl AlphaEstimate {
    /// The numeric exponent, only when the estimate is defined.
    pub fn value(&self) -> Option<f64> {
        match self {
            AlphaEstimate::Estimate { alpha } => Some(*alpha),
            _ => None,
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, AlphaEstimate::Estimate { .. })
    }
}

/// Estimate α for `series`, requiring at least `min_window` points.
pub fn alpha(series: &[f64], min_window: usize) -> AlphaEstimate {
    let n = series.len();
    if n < min_window.max(2 * MIN_BOX) {
        return AlphaEstimate::InsufficientData;
    }

    // Integrated profile of the mean-centered series.
    let mean = series.iter().sum::<f64>() / n as f64;
    let mut profile = Vec::with_capacity(n);
    let mut acc = 0.0;
    for x in series {
        acc += x - mean;
        profile.push(acc);
    }

    // Log-spaced box sizes between MIN_BOX and n/2.
    let sizes = box_sizes(n);
    let mut points: Vec<(f64, f64)> = Vec::with_capacity(sizes.len());
    for s in sizes {
        if let Some(f) = fluctuation(&profile, s) {
            if f > 0.0 && f.is_finite() {
                points.push(((s as f64).ln(), f.ln()));
            }
        }
    }

    if points.len() < 2 {
        // Flat series: every box detrends to nothing.
        return AlphaEstimate::Degenerate { raw: 0.0 };
    }

    let slope = fit_slope(&points);
    if !slope.is_finite() || slope <= 0.0 || slope >= 2.0 {
        return AlphaEstimate::Degenerate { raw: slope };
    }
    AlphaEstimate::Estimate { alpha: slope }
}

/// Log-spaced box sizes in `[MIN_BOX, n/2]`, deduplicated.
fn box_sizes(n: usize) -> Vec<usize> {
    let max_box = (n / 2).max(MIN_BOX);
    let mut sizes = Vec::new();
    let steps = 8usize;
    let ratio = (max_box as f64 / MIN_BOX as f64).powf(1.0 / steps.max(1) as f64);
    let mut s = MIN_BOX as f64;
    for _ in 0..=steps {
        let size = s.round() as usize;
        if sizes.last() != Some(&size) && size >= MIN_BOX && size <= max_box {
            sizes.push(size);
        }
        s *= ratio;
    }
    sizes
}

/// RMS residual fluctuation at box size `s`, or `None` when fewer than two
/// boxes fit.
fn fluctuation(profile: &[f64], s: usize) -> Option<f64> {
    let boxes = profile.len() / s;
    if boxes < 2 {
        return None;
    }
    let mut total = 0.0;
    for b in 0..boxes {
        let window = &profile[b * s..(b + 1) * s];
        total += detrended_variance(window);
    }
    Some((total / boxes as f64).sqrt())
}

/// Mean squared residual around the least-squares line of `window`.
fn detrended_variance(window: &[f64]) -> f64 {
    let n = window.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = window.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    for (i, y) in window.iter().enumerate() {
        let dx = i as f64 - mean_x;
        cov += dx * (y - mean_y);
        var_x += dx * dx;
    }
    let slope = if var_x > 0.0 { cov / var_x } else { 0.0 };
    let intercept = mean_y - slope * mean_x;

    let mut residual = 0.0;
    for (i, y) in window.iter().enumerate() {
        let fit = slope * i as f64 + intercept;
        residual += (y - fit) * (y - fit);
    }
    residual / n
}

/// Least-squares slope through `(x, y)` points.
fn fit_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    for (x, y) in points {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x) * (x - mean_x);
    }
    if var_x > 0.0 {
        cov / var_x
    } else {
        f64::NAN
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-noise without pulling in an RNG.
    fn noise(n: usize) -> Vec<f64> {
        let mut state: u64 = 0x9e3779b97f4a7c15;
        (0..n)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 33) as f64 / (1u64 << 31) as f64) - 1.0
            })
            .collect()
    }

    #[test]
    fn test_short_series_is_insufficient() {
        let series = vec![1.0; 10];
        assert_eq!(alpha(&series, 16), AlphaEstimate::InsufficientData);
    }

    #[test]
    fn test_flat_series_is_degenerate() {
        let series = vec![0.42; 64];
        assert_eq!(alpha(&series, 16), AlphaEstimate::Degenerate { raw: 0.0 });
    }

    #[test]
    fn test_white_noise_is_near_half() {
        let series = noise(512);
        match alpha(&series, 16) {
            AlphaEstimate::Estimate { alpha } => {
                assert!((0.3..0.7).contains(&alpha), "alpha = {alpha}");
            }
            other => panic!("expected estimate, got {other:?}"),
        }
    }

    #[test]
    fn test_integrated_noise_scales_higher() {
        // A random walk's increments integrate once more, pushing the
        // exponent well above the white-noise level.
        let steps = noise(512);
        let mut walk = Vec::with_capacity(steps.len());
        let mut acc = 0.0;
        for s in &steps {
            acc += s;
            walk.push(acc);
        }
        let noise_alpha = alpha(&noise(512), 16).value().unwrap();
        let walk_alpha = alpha(&walk, 16).value().unwrap();
        assert!(
            walk_alpha > noise_alpha + 0.5,
            "walk {walk_alpha} vs noise {noise_alpha}"
        );
    }

    #[test]
    fn test_estimate_accessor() {
        assert_eq!(AlphaEstimate::InsufficientData.value(), None);
        assert_eq!(AlphaEstimate::Degenerate { raw: 2.4 }.value(), None);
        assert_eq!(
            AlphaEstimate::Estimate { alpha: 0.9 }.value(),
            Some(0.9)
        );
    }

    #[test]
    fn test_serde_tags_are_stable() {
        let json = serde_json::to_string(&AlphaEstimate::InsufficientData).unwrap();
        assert!(json.contains("insufficient_data"));
        let back: AlphaEstimate =
            serde_json::from_str(r#"{"kind":"estimate","alpha":1.0}"#).unwrap();
        assert_eq!(back, AlphaEstimate::Estimate { alpha: 1.0 });
    }
}
