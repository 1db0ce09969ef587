//! Producer/consumer clock-domain reconciliation.
//!
//! The capture producer stamps frames with an accurate wall-clock time
//! (100 ns units) while output scheduling runs off the consumer's
//! monotonic QPC counter. `ClockSync` maintains the offset between the
//! two as a very stiff exponential moving average: per-frame scheduling
//! jitter is orders of magnitude larger than genuine clock drift, so the
//! filter weighs a new sample at only 0.5%.

const OFFSET_KEEP: f64 = 0.995;
const OFFSET_BLEND: f64 = 0.005;

#[derive(Debug, Clone)]
pub struct ClockSync {
    qpc_frequency: i64,
    offset_100ns: f64,
    valid: bool,
}

impl ClockSync {
    pub fn new(qpc_frequency: i64) -> Self {
        Self {
            qpc_frequency,
            offset_100ns: 0.0,
            valid: false,
        }
    }

    pub fn qpc_frequency(&self) -> i64 {
        self.qpc_frequency
    }

    /// Whether at least one paired sample has been observed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Conversion factor from QPC ticks to 100 ns units.
    fn qpc_to_100ns(&self) -> f64 {
        if self.qpc_frequency > 0 {
            1e7 / self.qpc_frequency as f64
        } else {
            0.0
        }
    }

    /// Feed one frame that carries both a QPC timestamp and a producer
    /// wall-clock timestamp. Updated only when both samples are present
    /// for the same frame; the first sample sets the offset directly.
    pub fn observe(&mut self, qpc_time: i64, system_time_100ns: i64) {
        if self.qpc_frequency <= 0 || qpc_time == 0 {
            return;
        }
        let offset = system_time_100ns as f64 - qpc_time as f64 * self.qpc_to_100ns();
        if !self.valid {
            self.offset_100ns = offset;
            self.valid = true;
        } else {
            self.offset_100ns = self.offset_100ns * OFFSET_KEEP + offset * OFFSET_BLEND;
        }
    }

    /// Translate a QPC counter value into the producer's wall-clock
    /// timestamp space (100 ns units). Falls back to plain scaling until
    /// the first paired sample arrives.
    pub fn to_wall_clock(&self, qpc_time: i64) -> f64 {
        let scaled = qpc_time as f64 * self.qpc_to_100ns();
        if self.valid {
            scaled + self.offset_100ns
        } else {
            scaled
        }
    }

    /// Forget the learned offset. Called on capture restart so a new
    /// producer's clock does not blend with the old one's.
    pub fn reset(&mut self) {
        self.offset_100ns = 0.0;
        self.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 10 MHz makes one QPC tick exactly 100 ns, so expected offsets can
    // be written down directly.
    const FREQ_10MHZ: i64 = 10_000_000;

    #[test]
    fn first_sample_sets_offset_directly() {
        let mut sync = ClockSync::new(FREQ_10MHZ);
        sync.observe(1_000, 51_000);
        assert!(sync.is_valid());
        // offset = 51_000 - 1_000 => to_wall_clock(2_000) = 52_000
        assert!((sync.to_wall_clock(2_000) - 52_000.0).abs() < 1e-6);
    }

    #[test]
    fn subsequent_samples_blend_stiffly() {
        let mut sync = ClockSync::new(FREQ_10MHZ);
        sync.observe(1_000, 51_000);
        // A wildly jittered second sample moves the offset by only 0.5%.
        sync.observe(1_000, 71_000);
        let offset = sync.to_wall_clock(0);
        let expected = 50_000.0 * 0.995 + 70_000.0 * 0.005;
        assert!((offset - expected).abs() < 1e-6);
    }

    #[test]
    fn tracks_persistent_drift_over_many_samples() {
        let mut sync = ClockSync::new(FREQ_10MHZ);
        sync.observe(1_000, 51_000);
        for _ in 0..4000 {
            sync.observe(1_000, 52_000);
        }
        // After thousands of consistent samples the stiff filter has
        // converged onto the new offset.
        assert!((sync.to_wall_clock(0) - 51_000.0).abs() < 1.0);
    }

    #[test]
    fn unpaired_samples_are_ignored() {
        let mut sync = ClockSync::new(FREQ_10MHZ);
        sync.observe(1_000, 51_000);
        let before = sync.to_wall_clock(0);
        // A QPC timestamp of 0 means the monotonic half of the pair is
        // missing; the offset must not move.
        sync.observe(0, 90_000);
        assert!((sync.to_wall_clock(0) - before).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_validity() {
        let mut sync = ClockSync::new(FREQ_10MHZ);
        sync.observe(1_000, 51_000);
        sync.reset();
        assert!(!sync.is_valid());
        // Back to plain scaling with no offset applied.
        assert!((sync.to_wall_clock(3_000) - 3_000.0).abs() < 1e-6);
    }
}
