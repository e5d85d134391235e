/// Upper bound of the last regular bucket, us.
const MAX_US: f64 = 60_000_000.0;
/// Ratio between adjacent bucket bounds.
const FACTOR: f64 = 1.5;

/// Latency histogram with logarithmic buckets.
///
/// Bucket `i` holds values in `[f^(i-1); f^i)`, the last one is unbounded.
/// Owned by a single worker, merged by the orchestrator after exit.
#[derive(Debug, Clone, PartialEq)]
pub struct LogHistogram {
    buckets: Vec<u64>,
    factor: f64,
}

impl Default for LogHistogram {
    fn default() -> Self {
        let mut len = 0;
        let mut curr = 1.0;
        while curr < MAX_US {
            len += 1;
            curr *= FACTOR;
        }

        Self { buckets: vec![0; len], factor: FACTOR }
    }
}

impl LogHistogram {
    #[inline]
    pub fn record(&mut self, us: u64) {
        let idx = (us as f64).log(self.factor) as usize;
        let idx = idx.min(self.buckets.len() - 1);
        self.buckets[idx] += 1;
    }

    /// Adds all values recorded by `other` into this histogram.
    pub fn merge(&mut self, other: &Self) {
        if other.buckets.len() > self.buckets.len() {
            self.buckets.resize(other.buckets.len(), 0);
        }

        for (idx, &b) in other.buckets.iter().enumerate() {
            self.buckets[idx] += b;
        }
    }

    /// Total number of recorded values.
    #[inline]
    pub fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// Estimates the given quantile, us.
    ///
    /// Finds the first bucket `i` where the cumulative count reaches
    /// `q * total`, then interpolates linearly between the bucket bounds in
    /// logarithmic coordinates: with `sum` being the count below bucket `i`
    /// and `b` its own count, the pseudo-index is
    /// `x = (q * total - sum) / b + i` and the result is `f^x`.
    pub fn quantile(&self, q: f64) -> u64 {
        assert!((0.0..=1.0).contains(&q));

        let size = self.count();
        if size == 0 {
            return 0;
        }

        let mut sum = 0;
        for (idx, &b) in self.buckets.iter().enumerate() {
            if ((sum + b) as f64) >= q * (size as f64) {
                if b == 0 {
                    return 0;
                }

                let x = (q * size as f64 - sum as f64) / b as f64 + idx as f64;
                return self.factor.powf(x) as u64;
            }
            sum += b;
        }

        u64::MAX
    }
}
