//! Rolling median of the chain heights reported by peers
//!
//! Used to estimate how far the network is ahead of us. Banned peers have
//! their sample removed so a misbehaving node cannot skew the estimate.

use std::collections::VecDeque;

/// Number of samples kept in the window
pub const HEIGHT_WINDOW: usize = 5;

/// Bounded window of samples with a median query
#[derive(Debug, Clone)]
pub struct MedianFilter {
    samples: VecDeque<i64>,
    capacity: usize,
}

impl MedianFilter {
    /// Create a window of `capacity` samples seeded with `initial`
    pub fn new(capacity: usize, initial: i64) -> Self {
        let mut samples = VecDeque::with_capacity(capacity.max(1));
        samples.push_back(initial);
        Self {
            samples,
            capacity: capacity.max(1),
        }
    }

    /// Add a sample, dropping the oldest one when full
    pub fn input(&mut self, value: i64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Remove one occurrence of `value`; returns whether it was present
    pub fn remove_sample(&mut self, value: i64) -> bool {
        match self.samples.iter().position(|v| *v == value) {
            Some(pos) => {
                self.samples.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Median of the window, averaging the middle pair for even sizes
    pub fn median(&self) -> Option<i64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<i64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 1 {
            Some(sorted[mid])
        } else {
            Some((sorted[mid - 1] + sorted[mid]) / 2)
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for MedianFilter {
    fn default() -> Self {
        Self::new(HEIGHT_WINDOW, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_of_window() {
        let mut filter = MedianFilter::new(5, 0);
        for h in [10, 20, 30, 40] {
            filter.input(h);
        }
        assert_eq!(filter.median(), Some(20));

        // window is full, 0 falls out
        filter.input(50);
        assert_eq!(filter.len(), 5);
        assert_eq!(filter.median(), Some(30));
    }

    #[test]
    fn test_remove_sample() {
        let mut filter = MedianFilter::new(5, 100);
        filter.input(1_000_000);
        assert_eq!(filter.median(), Some(500_050));

        assert!(filter.remove_sample(1_000_000));
        assert!(!filter.remove_sample(1_000_000));
        assert_eq!(filter.median(), Some(100));
    }
}
