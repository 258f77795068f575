//! Summary statistics over a batch of sensor values.

/// Mean, minimum and maximum of a batch of values.
///
/// The all-zero value is the result for an empty batch.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Stats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// Compute summary statistics for `values`.
///
/// An empty slice yields `Stats::default()`. NaN inputs are not supported.
pub fn aggregate(values: &[f64]) -> Stats {
    let Some((&first, rest)) = values.split_first() else {
        return Stats::default();
    };

    let (min, max, sum) = rest
        .iter()
        .fold((first, first, first), |(min, max, sum), &v| {
            (min.min(v), max.max(v), sum + v)
        });

    // Rounding in the sum can push the mean a hair outside [min, max].
    let mean = (sum / values.len() as f64).max(min).min(max);

    Stats { mean, min, max }
}

/// Format the summary line written to the rotating log for one batch.
pub fn format_summary(name: &str, unit: &str, stats: &Stats) -> String {
    format!(
        "{} stats [{}] -> Mean: {:.2}, Min: {:.2}, Max: {:.2}",
        name, unit, stats.mean, stats.min, stats.max
    )
}
