//! Alpha/phase scheduling between a pending frame pair.
//!
//! Converts "the instant being displayed" plus the front pair's
//! virtualized timestamps into a blend fraction. Two deliberate
//! smoothness devices live here:
//!
//! * the soft-knee interval rule — instead of hard-snapping the phase
//!   interval to the running average inside a tolerance band (which pops
//!   visibly whenever jitter hovers at the threshold), the interval
//!   fades continuously from locked-to-average to raw as the error
//!   ratio crosses `limit`..`2*limit`;
//! * multiplier quantization — at small multipliers a continuously
//!   drifting alpha reads as phase jitter, so alpha locks to the nearest
//!   `1/multiplier` step unless the output is display-synced or the
//!   source is too slow to hide the steps.
//!
//! The scheduler also owns the explicit pair state machine. Every pair
//! identity change must reset the step index and raise the temporal
//! reset flag; the stabilizer blending motion history across a pair
//! boundary is the classic ghosting bug.

use crate::queue::PendingPair;

/// Lifecycle of the current source pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PairState {
    /// Fewer than two frames queued.
    #[default]
    NoPair,
    /// A fresh pair whose first output has not been produced yet.
    PairEstablished,
    /// Mid-pair: 0 < alpha < 1 outputs are being produced.
    Interpolating,
    /// The pair's steps are used up; the end frame holds until a new
    /// pair arrives.
    Exhausted,
}

/// Result of re-inspecting the queue front before an output tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PairTransition {
    pub pair_changed: bool,
    /// The temporal stabilizer must reset before the next dispatch.
    pub temporal_reset: bool,
}

/// One output tick's phase decision.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhaseDecision {
    /// Blend fraction in [0, 1]; 0 = previous frame, 1 = current.
    pub alpha: f32,
    /// Discrete step position (derived in continuous mode, authoritative
    /// in never-drop mode).
    pub step_index: u32,
    /// Interval actually used for phase mapping, seconds.
    pub use_interval: f64,
    /// Raw pair interval, seconds.
    pub raw_interval: f64,
}

/// Soft-knee selection of the phase interval.
///
/// `error_ratio <= limit` locks to the average; `limit..2*limit` blends
/// linearly toward the raw interval; beyond `2*limit` the raw interval
/// is used unmodified. Continuous in `error_ratio`, which is the whole
/// point. Limits under 0.001 disable the knee (raw interval wins).
pub fn soft_knee_interval(raw_interval: f64, avg_interval: f64, limit: f64) -> f64 {
    if avg_interval <= 0.0 || raw_interval <= 0.0 || limit <= 0.001 {
        return raw_interval;
    }
    let error_ratio = (raw_interval - avg_interval).abs() / avg_interval;
    if error_ratio <= limit {
        avg_interval
    } else if error_ratio < limit * 2.0 {
        let blend = (error_ratio - limit) / limit;
        avg_interval * (1.0 - blend) + raw_interval * blend
    } else {
        raw_interval
    }
}

/// Quantize alpha to the nearest `1/multiplier` step.
pub fn quantize_alpha(raw_alpha: f32, multiplier: u32) -> (f32, u32) {
    let multiplier = multiplier.max(1);
    let step = (raw_alpha * multiplier as f32).round().clamp(0.0, multiplier as f32) as u32;
    (step as f32 / multiplier as f32, step)
}

#[derive(Debug, Default)]
pub struct PhaseScheduler {
    state: PairState,
    step_index: u32,
    pair_prev_slot: Option<usize>,
    pair_curr_slot: Option<usize>,
    pair_prev_time_100ns: i64,
    pair_curr_time_100ns: i64,
    last_multiplier: u32,
}

impl PhaseScheduler {
    pub fn new() -> Self {
        Self {
            last_multiplier: 1,
            ..Self::default()
        }
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    pub fn step_index(&self) -> u32 {
        self.step_index
    }

    /// Re-inspect the queue front before an output tick. Any change of
    /// pair identity — slots or timestamps — or of the multiplier resets
    /// the step position and demands a temporal reset.
    pub fn observe_pair(&mut self, pair: Option<&PendingPair>, multiplier: u32) -> PairTransition {
        let mut transition = PairTransition::default();

        if multiplier != self.last_multiplier {
            self.last_multiplier = multiplier;
            self.step_index = 0;
            self.pair_prev_slot = None;
            self.pair_curr_slot = None;
            self.pair_prev_time_100ns = 0;
            self.pair_curr_time_100ns = 0;
            self.state = PairState::NoPair;
            transition.temporal_reset = true;
        }

        let Some(pair) = pair else {
            self.pair_prev_slot = None;
            self.pair_curr_slot = None;
            self.pair_prev_time_100ns = 0;
            self.pair_curr_time_100ns = 0;
            self.state = PairState::NoPair;
            return transition;
        };

        if !pair.has_pair {
            self.pair_prev_slot = None;
            self.pair_curr_slot = None;
            self.pair_prev_time_100ns = 0;
            self.pair_curr_time_100ns = 0;
            self.state = PairState::NoPair;
            return transition;
        }

        let changed = self.pair_prev_slot != Some(pair.prev_slot)
            || self.pair_curr_slot != Some(pair.curr_slot)
            || self.pair_prev_time_100ns != pair.prev_time_100ns
            || self.pair_curr_time_100ns != pair.curr_time_100ns;
        if changed {
            self.pair_prev_slot = Some(pair.prev_slot);
            self.pair_curr_slot = Some(pair.curr_slot);
            self.pair_prev_time_100ns = pair.prev_time_100ns;
            self.pair_curr_time_100ns = pair.curr_time_100ns;
            self.step_index = 0;
            self.state = PairState::PairEstablished;
            transition.pair_changed = true;
            transition.temporal_reset = true;
        }
        transition
    }

    /// Compute this tick's blend fraction.
    ///
    /// `display_time_100ns` is the displayed instant in producer
    /// wall-clock space (pacer-predicted when pacing is active).
    /// In never-drop mode alpha is `step_index / step_count` regardless
    /// of wall-clock phase; the step index is owned here and advanced by
    /// [`advance_step`](Self::advance_step) after each output. In
    /// continuous mode the step index is merely derived from alpha and
    /// never fed back.
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        &mut self,
        display_time_100ns: f64,
        pair: &PendingPair,
        avg_interval: f64,
        multiplier: u32,
        can_interpolate: bool,
        never_drop: bool,
        sync_to_display: bool,
        force_interpolation: bool,
        low_fps_source: bool,
        jitter_limit: f32,
    ) -> PhaseDecision {
        let multiplier = multiplier.max(1);
        let step_count = if can_interpolate { multiplier } else { 1 };

        let prev_time = pair.prev_time_100ns as f64;
        let curr_time = pair.curr_time_100ns as f64;
        let raw_interval = (curr_time - prev_time) * 1e-7;

        let mut use_interval = raw_interval;
        if avg_interval > 0.0 {
            if low_fps_source || force_interpolation {
                // Slow sources show every cadence wobble; lock hard.
                use_interval = avg_interval;
            } else if raw_interval > 0.0 {
                use_interval = soft_knee_interval(raw_interval, avg_interval, jitter_limit as f64);
            }
        }
        if use_interval <= 0.0 && raw_interval > 0.0 {
            use_interval = raw_interval;
        }

        let (alpha, step_index) = if use_interval <= 0.0 {
            (1.0, self.step_index)
        } else if never_drop {
            if self.step_index > step_count {
                self.step_index = 0;
            }
            (self.step_index as f32 / step_count as f32, self.step_index)
        } else {
            let t = ((display_time_100ns - prev_time) * 1e-7).max(0.0);
            let raw_alpha = (t / use_interval).clamp(0.0, 1.0) as f32;
            let lock_to_steps =
                can_interpolate && !sync_to_display && multiplier > 1 && !low_fps_source;
            if lock_to_steps {
                quantize_alpha(raw_alpha, multiplier)
            } else {
                let derived = (raw_alpha * multiplier as f32).round() as u32;
                (raw_alpha, derived.min(multiplier))
            }
        };

        self.step_index = step_index;
        self.state = if step_index >= step_count && alpha >= 1.0 {
            PairState::Exhausted
        } else if alpha > 0.0 {
            PairState::Interpolating
        } else {
            self.state
        };

        PhaseDecision {
            alpha: alpha.clamp(0.0, 1.0),
            step_index,
            use_interval,
            raw_interval,
        }
    }

    /// Advance the discrete step after an output in never-drop mode.
    /// Returns `true` when the front queue entry is consumed and must be
    /// retired.
    pub fn advance_step(&mut self, can_interpolate: bool, multiplier: u32) -> bool {
        let steps = if can_interpolate && multiplier > 1 {
            multiplier
        } else {
            1
        };
        if !can_interpolate {
            self.step_index = 0;
            self.state = PairState::NoPair;
            return true;
        }
        if self.step_index >= steps {
            self.step_index = 0;
            self.state = PairState::Exhausted;
            true
        } else {
            self.step_index += 1;
            false
        }
    }

    /// Forget the current pair entirely (capture restart, resize).
    pub fn reset(&mut self) {
        self.state = PairState::NoPair;
        self.step_index = 0;
        self.pair_prev_slot = None;
        self.pair_curr_slot = None;
        self.pair_prev_time_100ns = 0;
        self.pair_curr_time_100ns = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS_100NS: f64 = 10_000.0;

    fn pair(prev_ms: f64, curr_ms: f64) -> PendingPair {
        PendingPair {
            prev_slot: 0,
            curr_slot: 1,
            prev_time_100ns: (prev_ms * MS_100NS) as i64,
            curr_time_100ns: (curr_ms * MS_100NS) as i64,
            has_pair: true,
        }
    }

    fn continuous_alpha(sched: &mut PhaseScheduler, display_ms: f64, p: &PendingPair) -> f32 {
        sched
            .compute(
                display_ms * MS_100NS,
                p,
                0.0167,
                1,
                true,
                false,
                true,
                false,
                false,
                0.2,
            )
            .alpha
    }

    #[test]
    fn alpha_stays_in_unit_range() {
        let mut sched = PhaseScheduler::new();
        let p = pair(100.0, 116.7);
        sched.observe_pair(Some(&p), 1);
        // Display times well before, inside, and well after the pair.
        for display in [-500.0, 0.0, 100.0, 108.0, 116.7, 200.0, 1e6] {
            let alpha = continuous_alpha(&mut sched, display, &p);
            assert!((0.0..=1.0).contains(&alpha), "alpha {alpha} out of range");
        }
    }

    #[test]
    fn alpha_maps_display_time_linearly() {
        let mut sched = PhaseScheduler::new();
        let p = pair(100.0, 116.7);
        sched.observe_pair(Some(&p), 1);
        // Force-interpolation locks the interval to the average (16.7ms)
        // so the mapping is exact.
        let d = sched.compute(
            (100.0 + 8.35) * MS_100NS,
            &p,
            0.0167,
            1,
            true,
            false,
            true,
            true,
            false,
            0.2,
        );
        assert!((d.alpha - 0.5).abs() < 0.01);
    }

    #[test]
    fn soft_knee_is_continuous_across_both_thresholds() {
        let avg = 0.0167;
        let limit = 0.2;
        // Sample error ratios at and around the knee boundaries; the
        // selected interval must vary continuously (no jumps bigger
        // than the local slope allows).
        let eps = 1e-4;
        let ratios = [
            limit - eps,
            limit,
            limit + eps,
            2.0 * limit - eps,
            2.0 * limit,
        ];
        let mut last: Option<f64> = None;
        for ratio in ratios {
            let raw = avg * (1.0 + ratio);
            let used = soft_knee_interval(raw, avg, limit);
            if let Some(prev) = last {
                // Max possible slope of the blend zone is
                // (raw - avg)/limit per unit ratio; eps steps must move
                // the result by a commensurately tiny amount.
                assert!(
                    (used - prev).abs() < avg * 0.05,
                    "discontinuity near ratio {ratio}: {prev} -> {used}"
                );
            }
            last = Some(used);
        }
        // Inside the band: locked to average.
        assert_eq!(soft_knee_interval(avg * 1.1, avg, limit), avg);
        // Far outside: raw wins exactly.
        let spike = avg * 3.0;
        assert_eq!(soft_knee_interval(spike, avg, limit), spike);
    }

    #[test]
    fn jittered_intervals_inside_tolerance_lock_to_average() {
        let avg = 0.0167;
        for raw_ms in [16.7, 16.6, 16.9, 16.6] {
            let used = soft_knee_interval(raw_ms * 1e-3, avg, 0.2);
            assert_eq!(used, avg);
        }
    }

    #[test]
    fn dropped_frame_interval_uses_raw_time() {
        // 50 ms against a 16.7 ms average: error ratio ~2.0, way past
        // twice the 0.2 limit.
        let used = soft_knee_interval(0.050, 0.0167, 0.2);
        assert_eq!(used, 0.050);
    }

    #[test]
    fn multiplier_quantization_rounds_to_nearest_step() {
        let (alpha, step) = quantize_alpha(0.37, 2);
        assert_eq!(alpha, 0.5);
        assert_eq!(step, 1);
        let (alpha, _) = quantize_alpha(0.1, 2);
        assert_eq!(alpha, 0.0);
        let (alpha, step) = quantize_alpha(0.9, 2);
        assert_eq!(alpha, 1.0);
        assert_eq!(step, 2);
        // Every quantized value is a multiple of 1/multiplier.
        for raw in [0.0, 0.13, 0.37, 0.5, 0.62, 0.88, 1.0] {
            let (alpha, _) = quantize_alpha(raw, 4);
            let scaled = alpha * 4.0;
            assert!((scaled - scaled.round()).abs() < 1e-6);
        }
    }

    #[test]
    fn pair_change_resets_step_and_demands_temporal_reset() {
        let mut sched = PhaseScheduler::new();
        let first = pair(100.0, 116.7);
        let t = sched.observe_pair(Some(&first), 2);
        assert!(t.pair_changed);
        assert!(t.temporal_reset);
        assert_eq!(sched.state(), PairState::PairEstablished);

        // Same pair again: no reset.
        let t = sched.observe_pair(Some(&first), 2);
        assert!(!t.pair_changed);
        assert!(!t.temporal_reset);

        // Queue advanced to a new pair.
        let second = PendingPair {
            prev_slot: 1,
            curr_slot: 2,
            prev_time_100ns: (116.7 * MS_100NS) as i64,
            curr_time_100ns: (133.4 * MS_100NS) as i64,
            has_pair: true,
        };
        let t = sched.observe_pair(Some(&second), 2);
        assert!(t.pair_changed);
        assert!(t.temporal_reset);
        assert_eq!(sched.step_index(), 0);
    }

    #[test]
    fn multiplier_change_invalidates_pair_state() {
        let mut sched = PhaseScheduler::new();
        let p = pair(100.0, 116.7);
        sched.observe_pair(Some(&p), 2);
        let t = sched.observe_pair(Some(&p), 3);
        assert!(t.temporal_reset);
        // The pair re-registers as new under the new multiplier.
        assert!(t.pair_changed);
    }

    #[test]
    fn never_drop_advances_by_discrete_steps() {
        let mut sched = PhaseScheduler::new();
        let p = pair(100.0, 116.7);
        sched.observe_pair(Some(&p), 2);

        let mut alphas = Vec::new();
        loop {
            let d = sched.compute(
                0.0, &p, 0.0167, 2, true, true, false, false, false, 0.2,
            );
            alphas.push(d.alpha);
            if sched.advance_step(true, 2) {
                break;
            }
        }
        assert_eq!(alphas, vec![0.0, 0.5, 1.0]);
        assert_eq!(sched.state(), PairState::Exhausted);
        assert_eq!(sched.step_index(), 0);
    }

    #[test]
    fn never_drop_without_interpolation_consumes_one_frame_per_tick() {
        let mut sched = PhaseScheduler::new();
        let p = pair(100.0, 116.7);
        sched.observe_pair(Some(&p), 2);
        assert!(sched.advance_step(false, 2));
        assert_eq!(sched.step_index(), 0);
    }

    #[test]
    fn lost_pair_returns_to_no_pair_state() {
        let mut sched = PhaseScheduler::new();
        let p = pair(100.0, 116.7);
        sched.observe_pair(Some(&p), 2);
        sched.observe_pair(None, 2);
        assert_eq!(sched.state(), PairState::NoPair);
    }
}
