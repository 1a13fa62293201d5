/// Upper bucket bounds in milliseconds; one extra overflow bucket follows.
pub const LATENCY_BOUNDS_MS: [f64; 19] = [
    1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 150.0, 200.0, 300.0, 500.0, 750.0, 1000.0,
    1500.0, 2000.0, 3000.0, 5000.0, 10000.0,
];

/// Fixed-bound latency histogram. Memory is constant per bucket, so
/// percentiles are interpolated estimates, not exact order statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyHistogram {
    counts: [u64; LATENCY_BOUNDS_MS.len() + 1],
    total: u64,
    min: f64,
    max: f64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            counts: [0; LATENCY_BOUNDS_MS.len() + 1],
            total: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl LatencyHistogram {
    pub fn record(&mut self, value_ms: f64) {
        let idx = LATENCY_BOUNDS_MS.partition_point(|bound| *bound < value_ms);
        self.counts[idx] += 1;
        self.total += 1;
        self.min = self.min.min(value_ms);
        self.max = self.max.max(value_ms);
    }

    pub fn merge(&mut self, other: &Self) {
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts.iter()) {
            *mine += theirs;
        }
        self.total += other.total;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.total
    }

    /// Estimated `q` quantile (0.0..=1.0); 0 when empty.
    pub fn percentile(&self, q: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let rank = q.clamp(0.0, 1.0) * self.total as f64;
        let mut seen = 0u64;
        for (idx, &count) in self.counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let before = seen as f64;
            seen += count;
            if (seen as f64) < rank {
                continue;
            }
            let lower = if idx == 0 { 0.0 } else { LATENCY_BOUNDS_MS[idx - 1] };
            let upper = LATENCY_BOUNDS_MS.get(idx).copied().unwrap_or(self.max);
            let fraction = ((rank - before) / count as f64).clamp(0.0, 1.0);
            let estimate = lower + (upper - lower) * fraction;
            return estimate.clamp(self.min, self.max);
        }
        self.max
    }
}
