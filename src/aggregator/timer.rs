//! Timer distribution summaries.
//!
//! A flush turns each timer bucket's interval observations into min/max,
//! mean, count, and the configured percentile thresholds. The percentile
//! index arithmetic matches the formula deployed by classic StatsD daemons
//! and must stay that way so published series remain comparable.

/// Summary statistics over one timer bucket's observations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerSummary {
    pub mean: f64,
    pub upper: i64,
    pub lower: i64,
    pub count: usize,
}

impl TimerSummary {
    /// Sorts the observations ascending and computes the summary.
    ///
    /// Returns `None` for an empty slice. After this call the slice is
    /// sorted, ready for [`threshold`] lookups.
    pub fn compute(values: &mut [i64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_unstable();

        let sum: i64 = values.iter().sum();
        Some(Self {
            mean: sum as f64 / values.len() as f64,
            upper: values[values.len() - 1],
            lower: values[0],
            count: values.len(),
        })
    }
}

/// The threshold reading for percentile `p` over sorted observations.
///
/// `p >= 0` selects from the upper tail, `p < 0` from the lower tail. A
/// single observation is its own threshold for every percentile.
pub fn threshold(sorted: &[i64], p: i32) -> i64 {
    debug_assert!(!sorted.is_empty());
    if sorted.len() == 1 {
        return sorted[0];
    }
    sorted[percentile_index(p, sorted.len())]
}

/// Zero-based index of percentile `p` in a sorted sequence of `count` > 1
/// observations.
///
/// `floor(x + 0.5)` is round-half-up; the extra `- 1` applies only to upper
/// percentiles. The formula can land one past either end (p = 0 upper, or
/// p = 100 lower), so the result is clamped into range.
pub fn percentile_index(p: i32, count: usize) -> usize {
    let abs = if p >= 0 { p } else { 100 + p };
    let mut index = ((f64::from(abs) / 100.0) * count as f64 + 0.5).floor() as isize;
    if p >= 0 {
        index -= 1;
    }
    index.clamp(0, count as isize - 1) as usize
}
