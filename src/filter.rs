//! Fixed-window running average used to smooth frame timings.

/// Circular buffer of the most recent samples with a running sum.
///
/// A filter whose buffer could not be allocated (or was created with a zero
/// window) is *disabled*: [`RunningAverage::observe`] then hands every sample
/// straight back.
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    values: Vec<u32>,
    index: usize,
    count: usize,
    sum: u64,
}

impl RunningAverage {
    /// Allocates a zero-filled window of `size` samples.
    pub fn new(size: usize) -> Self {
        let mut values = Vec::new();
        if values.try_reserve_exact(size).is_err() {
            log::warn!("Could not allocate running average window of {} samples", size);
            return Self::disabled();
        }
        values.resize(size, 0);

        Self {
            values,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        !self.values.is_empty()
    }

    /// Number of valid samples, saturating at the window size.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Pushes `value` into the window and returns the truncated mean of the
    /// samples currently in it.
    pub fn observe(&mut self, value: u32) -> u32 {
        if self.values.is_empty() {
            return value;
        }

        self.sum -= u64::from(self.values[self.index]);
        self.values[self.index] = value;
        self.sum += u64::from(value);
        self.index = (self.index + 1) % self.values.len();
        if self.count < self.values.len() {
            self.count += 1;
        }

        // The mean of u32 samples always fits back into a u32.
        (self.sum / self.count as u64) as u32
    }
}
