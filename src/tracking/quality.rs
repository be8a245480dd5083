//! Per-frame tracking quality from patch search statistics.

use crate::config::TrackerConfig;
use crate::map::LEVELS;

/// Pyramid levels at or above this count as large-scale for the quality
/// heuristic.
const LARGE_SCALE_LEVEL: usize = 2;

/// Minimum number of large-scale attempts before their fraction is trusted
/// on its own.
const MIN_LARGE_ATTEMPTS: usize = 10;

/// How well the last frame was tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingQuality {
    Good,
    Dodgy,
    Bad,
}

impl TrackingQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingQuality::Good => "good",
            TrackingQuality::Dodgy => "dodgy",
            TrackingQuality::Bad => "bad",
        }
    }
}

/// Grades a frame from per-level counts of patches attempted and found.
///
/// Large-scale patches dominate the verdict: losing them means the camera
/// has moved far from anything the map can explain. When too few were
/// attempted for the fraction to mean anything, the overall fraction
/// stands in.
pub fn assess(
    attempted: &[usize; LEVELS],
    found: &[usize; LEVELS],
    config: &TrackerConfig,
) -> TrackingQuality {
    let total_attempted: usize = attempted.iter().sum();
    let total_found: usize = found.iter().sum();
    if total_attempted == 0 || total_found == 0 {
        return TrackingQuality::Bad;
    }

    let overall = total_found as f64 / total_attempted as f64;

    let large_attempted: usize = attempted[LARGE_SCALE_LEVEL..].iter().sum();
    let large_found: usize = found[LARGE_SCALE_LEVEL..].iter().sum();
    let large = if large_attempted > MIN_LARGE_ATTEMPTS {
        large_found as f64 / large_attempted as f64
    } else {
        overall
    };

    if overall > config.quality_good {
        TrackingQuality::Good
    } else if large < config.quality_lost {
        TrackingQuality::Bad
    } else {
        TrackingQuality::Dodgy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrackerConfig {
        TrackerConfig::default()
    }

    #[test]
    fn nothing_attempted_is_bad() {
        assert_eq!(
            assess(&[0; LEVELS], &[0; LEVELS], &config()),
            TrackingQuality::Bad
        );
    }

    #[test]
    fn nothing_found_is_bad() {
        assert_eq!(
            assess(&[30, 30, 30, 30], &[0; LEVELS], &config()),
            TrackingQuality::Bad
        );
    }

    #[test]
    fn high_fractions_are_good() {
        assert_eq!(
            assess(&[40, 40, 40, 40], &[35, 36, 38, 39], &config()),
            TrackingQuality::Good
        );
    }

    #[test]
    fn lost_large_scale_is_bad() {
        // Overall fraction poor and almost no large-scale support.
        assert_eq!(
            assess(&[100, 100, 50, 50], &[20, 10, 2, 1], &config()),
            TrackingQuality::Bad
        );
    }

    #[test]
    fn middling_fractions_are_dodgy() {
        assert_eq!(
            assess(&[100, 100, 50, 50], &[25, 25, 15, 15], &config()),
            TrackingQuality::Dodgy
        );
    }

    #[test]
    fn few_large_attempts_fall_back_to_overall() {
        // 4 large-scale attempts, 0 found: too few to condemn the frame
        // when the overall fraction is healthy.
        assert_eq!(
            assess(&[50, 50, 2, 2], &[40, 40, 0, 0], &config()),
            TrackingQuality::Good
        );
    }

    #[test]
    fn never_improves_with_fewer_found() {
        let cfg = config();
        let attempted = [60, 60, 30, 30];
        let rank = |q: TrackingQuality| match q {
            TrackingQuality::Bad => 0,
            TrackingQuality::Dodgy => 1,
            TrackingQuality::Good => 2,
        };
        let mut last = 2;
        for drop in 0..=30 {
            let found = [40 - drop, 40 - drop, 20 - drop.min(20), 20 - drop.min(20)];
            let q = rank(assess(&attempted, &found, &cfg));
            assert!(q <= last, "quality rose as fewer patches were found");
            last = q;
        }
    }
}
