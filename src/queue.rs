//! Frame queue timing and ordering state.
//!
//! The GPU texture ring itself lives with the engine (platform side);
//! this module owns everything that can be reasoned about without a
//! device: per-slot virtualized timestamps, the ordered slot deque, the
//! rolling average capture interval, and the de-jitter logic that
//! converts raw producer timestamps into a smooth presentation timeline.
//!
//! De-jitter works by prediction: once an average inter-frame interval
//! is established, each arriving timestamp is compared against
//! `last + avg`. Timestamps within the tolerance band snap to the
//! prediction (scheduler noise), anything outside blends 50/50 with the
//! prediction so a genuine drop or spike moves the timeline without
//! importing the producer's full jitter.

use std::collections::VecDeque;

/// Number of ring slots backing the queue.
pub const QUEUE_SLOTS: usize = 12;

/// Sliding-window length used for the average interval once enough raw
/// samples exist.
const AVG_WINDOW: usize = 20;

/// Cap on retained raw producer timestamps.
const RAW_TIMES_CAP: usize = 360;

/// Queue bound policy (see the never-drop glossary entry).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Evict from the front to make room for new frames.
    DropOldest,
    /// Keep every admitted frame; the caller throttles ingestion when
    /// the queue is full.
    NeverDrop,
}

/// The pending presentation pair at the queue front.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingPair {
    pub prev_slot: usize,
    pub curr_slot: usize,
    pub prev_time_100ns: i64,
    pub curr_time_100ns: i64,
    /// False when only one frame is queued (prev == curr).
    pub has_pair: bool,
}

#[derive(Debug)]
pub struct FrameQueue {
    /// Virtualized timestamp per ring slot, 100 ns units.
    times_100ns: [i64; QUEUE_SLOTS],
    /// Slot indices in presentation order, front = oldest.
    order: VecDeque<usize>,
    write_cursor: usize,
    /// Rolling average capture interval in seconds. 0 until measurable.
    avg_interval: f64,
    last_smoothed_100ns: i64,
    /// Raw producer timestamps for the sliding-window average.
    raw_times: Vec<i64>,
    prev_raw_100ns: i64,
    curr_raw_100ns: i64,

    // Capture-rate statistics, fed from producer timestamps.
    fps_frame_count: u32,
    fps_epoch_sec: f64,
    capture_fps: f32,
    min_interval_ms: f32,
    max_interval_ms: f32,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            times_100ns: [0; QUEUE_SLOTS],
            order: VecDeque::with_capacity(QUEUE_SLOTS),
            write_cursor: 0,
            avg_interval: 0.0,
            last_smoothed_100ns: 0,
            raw_times: Vec::new(),
            prev_raw_100ns: 0,
            curr_raw_100ns: 0,
            fps_frame_count: 0,
            fps_epoch_sec: 0.0,
            capture_fps: 0.0,
            min_interval_ms: f32::MAX,
            max_interval_ms: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Rolling average capture interval in seconds (0 until known).
    pub fn avg_interval(&self) -> f64 {
        self.avg_interval
    }

    /// Measured capture rate in frames per second (0 until known).
    pub fn capture_fps(&self) -> f32 {
        self.capture_fps
    }

    pub fn min_interval_ms(&self) -> f32 {
        if self.min_interval_ms == f32::MAX {
            0.0
        } else {
            self.min_interval_ms
        }
    }

    pub fn max_interval_ms(&self) -> f32 {
        self.max_interval_ms
    }

    pub fn time_of(&self, slot: usize) -> i64 {
        self.times_100ns[slot]
    }

    /// Admit one captured frame's timestamp.
    ///
    /// Returns the ring slot the caller should copy the image into, or
    /// `None` when the frame must be discarded (non-monotonic producer
    /// glitch). In `DropOldest` mode the front is evicted as needed to
    /// keep the queue under `max_len`; in `NeverDrop` mode the caller is
    /// expected to stop ingesting at the bound, and a defensive trim
    /// still enforces it after the append.
    ///
    /// `jitter_suppression` is the de-jitter tolerance as a fraction of
    /// the average interval; at 0 timestamps never snap (only blend).
    pub fn admit(
        &mut self,
        system_time_100ns: i64,
        jitter_suppression: f32,
        policy: QueuePolicy,
        max_len: usize,
    ) -> Option<usize> {
        if self.curr_raw_100ns != 0 {
            self.prev_raw_100ns = self.curr_raw_100ns;
        }
        self.curr_raw_100ns = system_time_100ns;

        self.raw_times.push(system_time_100ns);
        if self.raw_times.len() > RAW_TIMES_CAP {
            self.raw_times.remove(0);
        }

        self.update_avg_interval();
        self.update_capture_stats(system_time_100ns);

        let smoothed = self.virtualize_timestamp(system_time_100ns, jitter_suppression);

        // Non-monotonic producer glitch: the entry is dropped, never
        // reordered.
        if self.last_smoothed_100ns != 0 && smoothed <= self.last_smoothed_100ns {
            log::debug!(
                "dropping non-monotonic frame timestamp ({} <= {})",
                smoothed,
                self.last_smoothed_100ns
            );
            return None;
        }

        if policy == QueuePolicy::DropOldest {
            while self.order.len() >= max_len.max(1) {
                self.order.pop_front();
            }
        }

        let slot = self.write_cursor;
        self.write_cursor = (self.write_cursor + 1) % QUEUE_SLOTS;
        self.times_100ns[slot] = smoothed;
        self.order.push_back(slot);
        self.last_smoothed_100ns = smoothed;

        if policy == QueuePolicy::NeverDrop {
            while self.order.len() > max_len.max(1) {
                self.order.pop_front();
            }
        }

        Some(slot)
    }

    /// Prefer the precise sliding-window average once the window is
    /// full; fall back to an exponential blend while warming up.
    fn update_avg_interval(&mut self) {
        if self.prev_raw_100ns == 0 || self.curr_raw_100ns == self.prev_raw_100ns {
            return;
        }
        if self.raw_times.len() >= AVG_WINDOW + 1 {
            let idx_start = self.raw_times.len() - 1 - AVG_WINDOW;
            let span = self.raw_times[self.raw_times.len() - 1] - self.raw_times[idx_start];
            if span > 0 {
                self.avg_interval = (span as f64 * 1e-7) / AVG_WINDOW as f64;
            }
        } else {
            let interval = (self.curr_raw_100ns - self.prev_raw_100ns) as f64 * 1e-7;
            if self.avg_interval <= 0.0 {
                self.avg_interval = interval;
            } else {
                self.avg_interval = self.avg_interval * 0.9 + interval * 0.1;
            }
        }
    }

    fn update_capture_stats(&mut self, system_time_100ns: i64) {
        self.fps_frame_count += 1;
        let now_sec = system_time_100ns as f64 * 1e-7;
        if self.fps_epoch_sec > 0.0 {
            let elapsed = now_sec - self.fps_epoch_sec;
            if elapsed >= 1.0 {
                self.capture_fps = (self.fps_frame_count as f64 / elapsed) as f32;
                self.fps_frame_count = 0;
                self.fps_epoch_sec = now_sec;
            }
        } else {
            self.fps_epoch_sec = now_sec;
        }

        if self.prev_raw_100ns > 0 && self.curr_raw_100ns > self.prev_raw_100ns {
            let interval_ms = (self.curr_raw_100ns - self.prev_raw_100ns) as f64 * 1e-4;
            let interval_ms = interval_ms as f32;
            if interval_ms < self.min_interval_ms {
                self.min_interval_ms = interval_ms;
            }
            if interval_ms > self.max_interval_ms {
                self.max_interval_ms = interval_ms;
            }
        }
    }

    fn virtualize_timestamp(&self, system_time_100ns: i64, jitter_suppression: f32) -> i64 {
        if self.avg_interval <= 0.0 || self.last_smoothed_100ns <= 0 {
            return system_time_100ns;
        }
        let expected_interval = (self.avg_interval * 1e7) as i64;
        let expected = self.last_smoothed_100ns + expected_interval;
        let diff = (system_time_100ns - expected).abs();
        let tolerance = expected_interval as f64 * jitter_suppression as f64;
        if jitter_suppression > 0.0 && (diff as f64) < tolerance {
            expected
        } else {
            // Genuine drop or spike: accept it to avoid desync, but
            // split the difference with the prediction to soften the
            // discontinuity.
            (system_time_100ns + expected) / 2
        }
    }

    /// Advance the queue front to the pair spanning `display_time_100ns`.
    ///
    /// Retires entries whose successor's timestamp is at or before the
    /// display time (drop mode only — never-drop advances by step index
    /// instead), drops defensively on non-monotonic neighbors, and in
    /// prefer-newest mode collapses a front entry whose successor
    /// arrives within 0.8 of the average interval behind the second
    /// entry.
    pub fn prune_for_display(
        &mut self,
        display_time_100ns: f64,
        policy: QueuePolicy,
        prefer_newest: bool,
        low_fps_source: bool,
    ) {
        while self.order.len() >= 2 {
            let p = self.order[0];
            let c = self.order[1];
            let p_time = self.times_100ns[p] as f64;
            let c_time = self.times_100ns[c] as f64;
            if c_time <= p_time {
                self.order.pop_front();
                continue;
            }
            if display_time_100ns >= c_time {
                if policy == QueuePolicy::DropOldest {
                    self.order.pop_front();
                    continue;
                }
                break;
            }

            if policy == QueuePolicy::DropOldest
                && prefer_newest
                && !low_fps_source
                && self.order.len() > 2
            {
                let next = self.order[2];
                let next_time = self.times_100ns[next] as f64;
                if next_time > c_time && (next_time - c_time) < self.avg_interval * 1e7 * 0.8 {
                    self.order.pop_front();
                    continue;
                }
            }
            break;
        }
    }

    /// Enforce the queue bound outside the ingest path (the render side
    /// re-derives its own effective bound, which can be tighter).
    pub fn enforce_bound(&mut self, policy: QueuePolicy, max_len: usize) {
        if policy == QueuePolicy::DropOldest {
            while self.order.len() > max_len.max(1) {
                self.order.pop_front();
            }
        }
    }

    /// Current presentation pair. `None` when the queue is empty.
    pub fn pending_pair(&self) -> Option<PendingPair> {
        let prev_slot = *self.order.front()?;
        let has_pair = self.order.len() >= 2;
        let curr_slot = if has_pair { self.order[1] } else { prev_slot };
        Some(PendingPair {
            prev_slot,
            curr_slot,
            prev_time_100ns: self.times_100ns[prev_slot],
            curr_time_100ns: self.times_100ns[curr_slot],
            has_pair,
        })
    }

    /// Retire the front entry (never-drop step completion).
    pub fn retire_front(&mut self) {
        self.order.pop_front();
    }

    /// Iterate queued timestamps front to back (tests/diagnostics).
    pub fn timestamps(&self) -> impl Iterator<Item = i64> + '_ {
        self.order.iter().map(|&slot| self.times_100ns[slot])
    }

    /// Clear everything, including learned intervals and statistics.
    /// Called on capture restart and resolution change.
    pub fn reset(&mut self) {
        self.order.clear();
        self.write_cursor = 0;
        self.times_100ns = [0; QUEUE_SLOTS];
        self.avg_interval = 0.0;
        self.last_smoothed_100ns = 0;
        self.raw_times.clear();
        self.prev_raw_100ns = 0;
        self.curr_raw_100ns = 0;
        self.fps_frame_count = 0;
        self.fps_epoch_sec = 0.0;
        self.capture_fps = 0.0;
        self.min_interval_ms = f32::MAX;
        self.max_interval_ms = 0.0;
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 10_000; // 100 ns units per millisecond

    fn admit_all(queue: &mut FrameQueue, times_ms: &[f64], jitter: f32) {
        for &t in times_ms {
            let _ = queue.admit(
                (t * MS as f64) as i64,
                jitter,
                QueuePolicy::DropOldest,
                QUEUE_SLOTS,
            );
        }
    }

    #[test]
    fn timestamps_are_non_decreasing_after_dejitter() {
        let mut queue = FrameQueue::new();
        // A noisy producer with one outright regression in the middle.
        let times = [
            100.0, 116.7, 133.3, 150.2, 166.5, 150.0, 183.4, 200.1, 216.8,
        ];
        admit_all(&mut queue, &times, 0.2);
        let collected: Vec<i64> = queue.timestamps().collect();
        assert!(!collected.is_empty());
        for pair in collected.windows(2) {
            assert!(pair[0] <= pair[1], "queue order regressed: {collected:?}");
        }
    }

    #[test]
    fn non_monotonic_entry_is_dropped_not_reordered() {
        let mut queue = FrameQueue::new();
        assert!(queue
            .admit(100 * MS, 0.0, QueuePolicy::DropOldest, QUEUE_SLOTS)
            .is_some());
        assert!(queue
            .admit(116 * MS, 0.0, QueuePolicy::DropOldest, QUEUE_SLOTS)
            .is_some());
        // Producer glitch: earlier timestamp than the last entry.
        assert!(queue
            .admit(110 * MS, 0.0, QueuePolicy::DropOldest, QUEUE_SLOTS)
            .is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drop_mode_bounds_queue_for_every_configured_max() {
        for k in 2..=QUEUE_SLOTS {
            let mut queue = FrameQueue::new();
            for i in 0..40 {
                let _ = queue.admit(
                    (100 + i * 16) * MS,
                    0.0,
                    QueuePolicy::DropOldest,
                    k,
                );
                assert!(queue.len() <= k, "queue exceeded bound {k}");
            }
        }
    }

    #[test]
    fn never_drop_trims_defensively_after_append() {
        let mut queue = FrameQueue::new();
        for i in 0..10 {
            let _ = queue.admit((100 + i * 16) * MS, 0.0, QueuePolicy::NeverDrop, 4);
        }
        assert!(queue.len() <= 4);
    }

    #[test]
    fn scheduler_jitter_snaps_to_average() {
        let mut queue = FrameQueue::new();
        // Warm up the sliding window with a steady 16.7 ms cadence.
        let mut t = 0.0;
        let mut times = Vec::new();
        for _ in 0..25 {
            times.push(t);
            t += 16.7;
        }
        admit_all(&mut queue, &times, 0.2);
        let base = queue.timestamps().last().unwrap();
        let avg = queue.avg_interval();
        assert!((avg - 0.0167).abs() < 0.0005);

        // Jittered arrivals inside the 20% tolerance band all snap to
        // the predicted cadence.
        let jittered = [16.7, 16.6, 16.9, 16.6];
        let mut expected = base;
        let mut arrival = base as f64;
        for delta_ms in jittered {
            arrival += delta_ms * MS as f64;
            let slot = queue
                .admit(arrival as i64, 0.2, QueuePolicy::DropOldest, QUEUE_SLOTS)
                .unwrap();
            expected += (queue.avg_interval() * 1e7) as i64;
            let got = queue.time_of(slot);
            let err_ms = (got - expected).abs() as f64 / MS as f64;
            assert!(
                err_ms < 0.5,
                "jittered sample failed to snap: {got} vs {expected}"
            );
        }
    }

    #[test]
    fn genuine_drop_blends_toward_raw_timestamp() {
        let mut queue = FrameQueue::new();
        let mut t = 0.0;
        let mut times = Vec::new();
        for _ in 0..25 {
            times.push(t);
            t += 16.7;
        }
        admit_all(&mut queue, &times, 0.2);
        let base = queue.timestamps().last().unwrap();

        // One dropped frame: a 50 ms gap. errorRatio ≈ 2.0, far past
        // twice the tolerance, so the entry must move most of the way to
        // the raw timestamp instead of snapping to the 16.7 ms cadence.
        let raw = base + (50.0 * MS as f64) as i64;
        let slot = queue
            .admit(raw, 0.2, QueuePolicy::DropOldest, QUEUE_SLOTS)
            .unwrap();
        let got = queue.time_of(slot);
        let gap_ms = (got - base) as f64 / MS as f64;
        // 50/50 blend of raw (50 ms) and predicted (~16.7 ms) ≈ 33 ms —
        // decisively away from the snapped cadence.
        assert!(gap_ms > 25.0, "drop was swallowed by the snap: {gap_ms} ms");
    }

    #[test]
    fn display_pruning_retires_expired_pairs_in_drop_mode() {
        let mut queue = FrameQueue::new();
        for i in 0..5 {
            let _ = queue.admit(
                (100 + i * 16) * MS,
                0.0,
                QueuePolicy::DropOldest,
                QUEUE_SLOTS,
            );
        }
        // Display time already past the second entry's timestamp.
        queue.prune_for_display((100 + 2 * 16) as f64 * MS as f64, QueuePolicy::DropOldest, false, false);
        let pair = queue.pending_pair().unwrap();
        assert!(pair.has_pair);
        assert!(pair.curr_time_100ns as f64 > (100 + 2 * 16) as f64 * MS as f64);
    }

    #[test]
    fn display_pruning_holds_in_never_drop_mode() {
        let mut queue = FrameQueue::new();
        for i in 0..5 {
            let _ = queue.admit((100 + i * 16) * MS, 0.0, QueuePolicy::NeverDrop, QUEUE_SLOTS);
        }
        let before = queue.len();
        queue.prune_for_display(1e12, QueuePolicy::NeverDrop, false, false);
        assert_eq!(queue.len(), before);
    }

    #[test]
    fn prefer_newest_collapses_closely_spaced_middle_entry() {
        let mut queue = FrameQueue::new();
        // Establish a ~16 ms average first.
        let mut t = 0.0;
        let mut times = Vec::new();
        for _ in 0..25 {
            times.push(t);
            t += 16.0;
        }
        admit_all(&mut queue, &times, 0.0);
        // Two more frames nearly on top of each other.
        let base = queue.timestamps().last().unwrap();
        let _ = queue.admit(base + 16 * MS, 0.0, QueuePolicy::DropOldest, QUEUE_SLOTS);
        let _ = queue.admit(base + 18 * MS, 0.0, QueuePolicy::DropOldest, QUEUE_SLOTS);
        let display = (base + MS) as f64;

        // Without prefer-newest the pending pair straddles the display
        // time: (base, base+16).
        let mut plain = FrameQueue::new();
        admit_all(&mut plain, &times, 0.0);
        let _ = plain.admit(base + 16 * MS, 0.0, QueuePolicy::DropOldest, QUEUE_SLOTS);
        let _ = plain.admit(base + 18 * MS, 0.0, QueuePolicy::DropOldest, QUEUE_SLOTS);
        plain.prune_for_display(display, QueuePolicy::DropOldest, false, false);
        assert_eq!(plain.pending_pair().unwrap().prev_time_100ns, base);

        // Prefer-newest sees the 2 ms follow-up behind base+16 and
        // collapses the redundant middle entry.
        queue.prune_for_display(display, QueuePolicy::DropOldest, true, false);
        assert_eq!(
            queue.pending_pair().unwrap().prev_time_100ns,
            base + 16 * MS
        );
    }

    #[test]
    fn reset_clears_learned_state() {
        let mut queue = FrameQueue::new();
        admit_all(&mut queue, &[0.0, 16.7, 33.4, 50.1], 0.2);
        queue.reset();
        assert!(queue.is_empty());
        assert_eq!(queue.avg_interval(), 0.0);
        assert_eq!(queue.capture_fps(), 0.0);
    }
}
