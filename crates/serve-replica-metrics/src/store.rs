//! Time-stamped in-memory store backing the autoscaling window average.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
struct MetricsPoint {
    timestamp_s: f64,
    value: f64,
}

/// Bounded-growth store of time-stamped samples.
///
/// Samples older than the most recent window start are pruned on each query,
/// so memory use is proportional to the look-back period.
#[derive(Debug, Default)]
pub struct InMemoryMetricsStore {
    points: VecDeque<MetricsPoint>,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_metrics_point(&mut self, value: f64, timestamp_s: f64) {
        self.points.push_back(MetricsPoint { timestamp_s, value });
    }

    /// Average of the samples in `[window_start_s, now]`, or `None` if the
    /// window contains no samples.
    pub fn window_average(&mut self, window_start_s: f64) -> Option<f64> {
        while let Some(front) = self.points.front() {
            if front.timestamp_s < window_start_s {
                self.points.pop_front();
            } else {
                break;
            }
        }

        if self.points.is_empty() {
            return None;
        }
        let sum: f64 = self.points.iter().map(|p| p.value).sum();
        Some(sum / self.points.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_average_is_none() {
        let mut store = InMemoryMetricsStore::new();
        assert_eq!(store.window_average(0.0), None);
    }

    #[test]
    fn averages_points_in_window() {
        let mut store = InMemoryMetricsStore::new();
        store.add_metrics_point(1.0, 10.0);
        store.add_metrics_point(2.0, 11.0);
        store.add_metrics_point(3.0, 12.0);
        assert_eq!(store.window_average(10.0), Some(2.0));
    }

    #[test]
    fn prunes_points_older_than_window() {
        let mut store = InMemoryMetricsStore::new();
        store.add_metrics_point(100.0, 1.0);
        store.add_metrics_point(2.0, 10.0);
        store.add_metrics_point(4.0, 11.0);

        assert_eq!(store.window_average(5.0), Some(3.0));
        assert_eq!(store.len(), 2);
    }
}
