//! Robust M-estimators for the pose refiner.
//!
//! Each estimator provides a robust scale estimate from a set of squared
//! residuals and a per-residual weight `w(e², σ²)` that is 1 for small
//! residuals and decays for large ones (to exactly 0 beyond the Tukey
//! cutoff). The choice is a closed enum resolved once at configuration
//! time; there is no per-call string dispatch.

use std::str::FromStr;

use crate::error::TrackerError;

/// Consistency constant relating the median absolute deviation to the
/// standard deviation of a Gaussian.
const MAD_TO_SIGMA: f64 = 1.4826;

/// Tuning constants giving 95% asymptotic efficiency on Gaussian data.
const TUKEY_C: f64 = 4.6851;
const CAUCHY_C: f64 = 2.3849;
const HUBER_K: f64 = 1.345;

/// Which influence function the pose refiner uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MEstimatorKind {
    #[default]
    Tukey,
    Cauchy,
    Huber,
}

impl FromStr for MEstimatorKind {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Tukey" => Ok(Self::Tukey),
            "Cauchy" => Ok(Self::Cauchy),
            "Huber" => Ok(Self::Huber),
            other => Err(TrackerError::UnknownMEstimator(other.to_string())),
        }
    }
}

impl MEstimatorKind {
    /// Robust squared-scale estimate from a set of squared residuals.
    ///
    /// Returns `None` for an empty set: no numerically valid scale exists,
    /// which callers must treat as "no correction possible", not an error.
    pub fn find_sigma_squared(&self, errors_squared: &[f64]) -> Option<f64> {
        if errors_squared.is_empty() {
            return None;
        }

        let mut sorted = errors_squared.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median_squared = sorted[sorted.len() / 2];

        // Median-of-squares to sigma, with a small-sample correction.
        let n = sorted.len() as f64;
        let sigma_mad = MAD_TO_SIGMA * (1.0 + 5.0 / (2.0 * n - 6.0).max(1.0)) * median_squared.sqrt();

        let cutoff = match self {
            Self::Tukey => TUKEY_C,
            Self::Cauchy => CAUCHY_C,
            Self::Huber => HUBER_K,
        };
        let sigma = (cutoff * sigma_mad).max(1e-6);
        Some(sigma * sigma)
    }

    /// Per-residual weight for a squared residual under the given squared
    /// scale. Equals 1 at zero residual.
    pub fn weight(&self, error_squared: f64, sigma_squared: f64) -> f64 {
        match self {
            Self::Tukey => {
                if error_squared >= sigma_squared {
                    0.0
                } else {
                    let r = 1.0 - error_squared / sigma_squared;
                    r * r
                }
            }
            Self::Cauchy => 1.0 / (1.0 + error_squared / sigma_squared),
            Self::Huber => {
                if error_squared <= sigma_squared {
                    1.0
                } else {
                    (sigma_squared / error_squared).sqrt()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_weight_is_one_at_zero_residual() {
        for kind in [
            MEstimatorKind::Tukey,
            MEstimatorKind::Cauchy,
            MEstimatorKind::Huber,
        ] {
            assert_relative_eq!(kind.weight(0.0, 4.0), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_tukey_weight_is_zero_beyond_cutoff() {
        let sigma_sq = 2.5;
        assert_eq!(MEstimatorKind::Tukey.weight(sigma_sq, sigma_sq), 0.0);
        assert_eq!(MEstimatorKind::Tukey.weight(sigma_sq * 10.0, sigma_sq), 0.0);
    }

    #[test]
    fn test_weights_decay_monotonically() {
        let sigma_sq = 1.0;
        for kind in [
            MEstimatorKind::Tukey,
            MEstimatorKind::Cauchy,
            MEstimatorKind::Huber,
        ] {
            let mut last = kind.weight(0.0, sigma_sq);
            for i in 1..50 {
                let w = kind.weight(i as f64 * 0.1, sigma_sq);
                assert!(w <= last + 1e-12, "{kind:?} weight increased");
                last = w;
            }
        }
    }

    #[test]
    fn test_sigma_squared_empty_set_is_none() {
        assert!(MEstimatorKind::Tukey.find_sigma_squared(&[]).is_none());
    }

    #[test]
    fn test_sigma_squared_scales_with_residuals() {
        let small: Vec<f64> = (0..40).map(|i| (i as f64 * 0.01).powi(2)).collect();
        let large: Vec<f64> = small.iter().map(|e| e * 100.0).collect();

        let s_small = MEstimatorKind::Tukey.find_sigma_squared(&small).unwrap();
        let s_large = MEstimatorKind::Tukey.find_sigma_squared(&large).unwrap();

        assert!(s_large > s_small);
        assert_relative_eq!(s_large / s_small, 100.0, epsilon = 1e-6);
    }

    #[test]
    fn test_from_str_rejects_unknown_name() {
        assert_eq!("Tukey".parse::<MEstimatorKind>().unwrap(), MEstimatorKind::Tukey);
        assert_eq!("Huber".parse::<MEstimatorKind>().unwrap(), MEstimatorKind::Huber);
        assert!(matches!(
            "Welsch".parse::<MEstimatorKind>(),
            Err(TrackerError::UnknownMEstimator(_))
        ));
    }
}
