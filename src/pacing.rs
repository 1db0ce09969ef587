//! Output-rate selection and presentation pacing.
//!
//! The pacer decides how many output frames per second the engine
//! targets and when the next one is due, in QPC ticks. Scheduling is an
//! accumulator (`next += interval`) rather than `now + interval` so that
//! one late tick does not push every subsequent tick later; a stall of
//! more than two intervals resets the accumulator instead of trying to
//! catch up.
//!
//! The blocking wait itself sleeps on a high-resolution waitable timer
//! for everything over half a millisecond and spins the remainder, since
//! OS timer granularity alone cannot hit a sub-frame window reliably.

use std::time::Duration;

use crate::config::EngineConfig;
use crate::queue::QUEUE_SLOTS;

/// Capture rates below this are treated as a low-fps source: pacing
/// caps to the display refresh and phase intervals lock to the average.
pub const LOW_FPS_THRESHOLD: f64 = 30.0;

/// Remaining wait under this is spun rather than slept.
const SPIN_THRESHOLD_100NS: i64 = 5_000; // 0.5 ms

pub fn is_low_fps_source(avg_capture_interval: f64) -> bool {
    if avg_capture_interval <= 0.0 {
        return false;
    }
    1.0 / avg_capture_interval < LOW_FPS_THRESHOLD
}

/// Target output rate for this tick.
///
/// Display-synced mode follows the refresh rate; otherwise the target is
/// `multiplier / average capture interval`. Sub-30 fps sources cap to
/// the refresh rate — a 5 fps source with a 12x multiplier would
/// otherwise chase an erratic 60-to-600 fps band as its average drifts.
pub fn target_output_fps(
    multiplier: u32,
    sync_to_display: bool,
    avg_capture_interval: f64,
    refresh_hz: f32,
) -> f32 {
    let mut target = if sync_to_display && refresh_hz > 0.0 {
        refresh_hz
    } else if avg_capture_interval > 0.0 {
        (multiplier as f64 / avg_capture_interval) as f32
    } else {
        0.0
    };
    if !sync_to_display
        && is_low_fps_source(avg_capture_interval)
        && refresh_hz > 0.0
        && target > refresh_hz
    {
        target = refresh_hz;
    }
    target
}

/// Presentation delay in seconds: how far behind "now" the displayed
/// instant sits. The base delay of one average interval gives the
/// interpolator a full pair to work with; adaptive mode (never-drop
/// only) steers the delay to hold the queue near the target depth.
pub fn presentation_delay_sec(cfg: &EngineConfig, avg_interval: f64, queue_len: usize) -> f64 {
    if avg_interval <= 0.0 {
        return 0.0;
    }
    let mut delay = avg_interval * cfg.delay_scale.max(0.25) as f64;
    if cfg.adaptive_delay && cfg.never_drop {
        let target_depth = cfg.target_queue_depth.clamp(2, QUEUE_SLOTS as u32) as f64;
        let depth_error = target_depth - queue_len as f64;
        let max_adjust = avg_interval * 3.0;
        let adjust = (depth_error * avg_interval * 0.35).clamp(-max_adjust, max_adjust);
        delay = (delay + adjust).max(0.0);
    }
    delay
}

/// One scheduled output tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacerSchedule {
    /// Absolute QPC deadline for this output.
    pub next_output_qpc: i64,
    /// Ticks left until the deadline at scheduling time (>= 0).
    pub wait_ticks: i64,
}

#[derive(Debug, Default)]
pub struct OutputPacer {
    next_output_qpc: i64,
    last_present_qpc: i64,
    present_avg_interval: f64,
    present_fps: f32,
}

impl OutputPacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The deadline scheduled by the last `schedule` call (0 when
    /// pacing is inactive). Used to compute the *predicted* display
    /// time so thread wakeup jitter never reaches the blend phase.
    pub fn next_output_qpc(&self) -> i64 {
        self.next_output_qpc
    }

    pub fn present_fps(&self) -> f32 {
        self.present_fps
    }

    pub fn present_avg_interval(&self) -> f64 {
        self.present_avg_interval
    }

    /// Schedule the next output tick. Returns `None` (and disarms the
    /// accumulator) when pacing is disabled for this tick — target rate
    /// unknown or non-positive interval.
    ///
    /// The scheduled deadline strictly increases by one interval per
    /// call, except after a stall of more than two intervals, where the
    /// accumulator re-anchors to `now` rather than replaying the backlog.
    pub fn schedule(&mut self, now_qpc: i64, qpc_freq: i64, target_fps: f32) -> Option<PacerSchedule> {
        if target_fps <= 0.0 || qpc_freq <= 0 {
            self.next_output_qpc = 0;
            return None;
        }
        let interval = ((qpc_freq as f64 / target_fps as f64) as i64).max(1);
        if self.next_output_qpc == 0 {
            self.next_output_qpc = now_qpc;
        } else if now_qpc > self.next_output_qpc + interval * 2 {
            log::debug!("output pacer stall: re-anchoring schedule to now");
            self.next_output_qpc = now_qpc;
        }
        self.next_output_qpc += interval;
        Some(PacerSchedule {
            next_output_qpc: self.next_output_qpc,
            wait_ticks: (self.next_output_qpc - now_qpc).max(0),
        })
    }

    /// Record a completed present and refresh the present-rate EMA.
    pub fn note_present(&mut self, now_qpc: i64, qpc_freq: i64) {
        if qpc_freq <= 0 {
            return;
        }
        if self.last_present_qpc != 0 {
            let interval = (now_qpc - self.last_present_qpc) as f64 / qpc_freq as f64;
            if interval > 0.0 {
                if self.present_avg_interval <= 0.0 {
                    self.present_avg_interval = interval;
                } else {
                    self.present_avg_interval = self.present_avg_interval * 0.9 + interval * 0.1;
                }
                self.present_fps = (1.0 / self.present_avg_interval) as f32;
            }
        }
        self.last_present_qpc = now_qpc;
    }

    pub fn reset(&mut self) {
        self.next_output_qpc = 0;
        self.last_present_qpc = 0;
        self.present_avg_interval = 0.0;
        self.present_fps = 0.0;
    }
}

/// High-resolution blocking wait primitive.
///
/// On Windows this wraps a `CREATE_WAITABLE_TIMER_HIGH_RESOLUTION`
/// waitable timer (falling back to a regular waitable timer on older
/// systems); elsewhere it degrades to `thread::sleep`. Either way the
/// final sub-millisecond is spin-waited for precision.
pub struct PrecisionWaiter {
    #[cfg(target_os = "windows")]
    timer: Option<windows::Win32::Foundation::HANDLE>,
}

impl PrecisionWaiter {
    pub fn new() -> Self {
        #[cfg(target_os = "windows")]
        {
            use windows::Win32::System::Threading::{
                CreateWaitableTimerExW, CREATE_WAITABLE_TIMER_HIGH_RESOLUTION,
                TIMER_ALL_ACCESS,
            };
            let timer = unsafe {
                CreateWaitableTimerExW(
                    None,
                    windows::core::PCWSTR::null(),
                    CREATE_WAITABLE_TIMER_HIGH_RESOLUTION,
                    TIMER_ALL_ACCESS.0,
                )
            }
            .or_else(|_| unsafe {
                // Pre-1803 systems reject the high-resolution flag.
                CreateWaitableTimerExW(
                    None,
                    windows::core::PCWSTR::null(),
                    Default::default(),
                    TIMER_ALL_ACCESS.0,
                )
            })
            .ok();
            Self { timer }
        }
        #[cfg(not(target_os = "windows"))]
        {
            Self {}
        }
    }

    /// Block until `deadline_qpc` on the consumer's monotonic clock.
    /// Returns immediately when the deadline has already passed.
    pub fn wait_until(&self, deadline_qpc: i64, qpc_freq: i64) {
        if qpc_freq <= 0 {
            return;
        }
        let Some(now) = crate::frame::query_qpc_now() else {
            return;
        };
        let remaining = deadline_qpc - now;
        if remaining <= 0 {
            return;
        }
        let remaining_100ns = (remaining as f64 / qpc_freq as f64 * 1e7) as i64;

        if remaining_100ns > SPIN_THRESHOLD_100NS {
            self.sleep_100ns(remaining_100ns - SPIN_THRESHOLD_100NS);
        }

        // Spin out the tail for sub-millisecond precision.
        while crate::frame::query_qpc_now().is_some_and(|t| t < deadline_qpc) {
            std::hint::spin_loop();
        }
    }

    #[cfg(target_os = "windows")]
    fn sleep_100ns(&self, amount_100ns: i64) {
        use windows::Win32::System::Threading::{
            SetWaitableTimer, WaitForSingleObject, INFINITE,
        };
        if let Some(timer) = self.timer {
            // Negative due time = relative interval in 100 ns units.
            let due_time = -amount_100ns;
            let armed =
                unsafe { SetWaitableTimer(timer, &due_time, 0, None, None, false) }.is_ok();
            if armed {
                unsafe {
                    let _ = WaitForSingleObject(timer, INFINITE);
                }
                return;
            }
        }
        std::thread::sleep(Duration::from_nanos(amount_100ns as u64 * 100));
    }

    #[cfg(not(target_os = "windows"))]
    fn sleep_100ns(&self, amount_100ns: i64) {
        std::thread::sleep(Duration::from_nanos(amount_100ns as u64 * 100));
    }
}

impl Default for PrecisionWaiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "windows")]
impl Drop for PrecisionWaiter {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            unsafe {
                let _ = windows::Win32::Foundation::CloseHandle(timer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQ: i64 = 10_000_000;

    #[test]
    fn schedule_increases_strictly_by_one_interval() {
        let mut pacer = OutputPacer::new();
        let target = 120.0f32;
        let interval = (FREQ as f64 / target as f64) as i64;
        let mut now = 1_000_000;
        let first = pacer.schedule(now, FREQ, target).unwrap();
        assert_eq!(first.next_output_qpc, now + interval);
        let mut last = first.next_output_qpc;
        for _ in 0..10 {
            now = last; // woke exactly on time
            let next = pacer.schedule(now, FREQ, target).unwrap();
            assert_eq!(next.next_output_qpc, last + interval);
            last = next.next_output_qpc;
        }
    }

    #[test]
    fn schedule_reanchors_after_stall() {
        let mut pacer = OutputPacer::new();
        let target = 60.0f32;
        let interval = (FREQ as f64 / target as f64) as i64;
        let start = 5_000_000;
        let first = pacer.schedule(start, FREQ, target).unwrap();
        // Simulate a long stall: real time drifts far past the schedule.
        let stalled_now = first.next_output_qpc + interval * 5;
        let recovered = pacer.schedule(stalled_now, FREQ, target).unwrap();
        assert_eq!(recovered.next_output_qpc, stalled_now + interval);
    }

    #[test]
    fn zero_target_fps_disables_pacing() {
        let mut pacer = OutputPacer::new();
        assert!(pacer.schedule(1_000, FREQ, 0.0).is_none());
        assert_eq!(pacer.next_output_qpc(), 0);
        // Re-enabling anchors fresh.
        assert!(pacer.schedule(2_000, FREQ, 60.0).is_some());
    }

    #[test]
    fn interval_never_drops_below_one_tick() {
        let mut pacer = OutputPacer::new();
        let sched = pacer.schedule(100, 10, 1_000_000.0).unwrap();
        assert!(sched.next_output_qpc > 100);
    }

    #[test]
    fn target_fps_multiplies_capture_rate() {
        let fps = target_output_fps(2, false, 1.0 / 60.0, 0.0);
        assert!((fps - 120.0).abs() < 0.5);
    }

    #[test]
    fn target_fps_follows_display_when_synced() {
        let fps = target_output_fps(4, true, 1.0 / 60.0, 144.0);
        assert_eq!(fps, 144.0);
    }

    #[test]
    fn slow_source_caps_to_refresh_rate() {
        // 10 fps source with a 20x multiplier would ask for 200 fps.
        let fps = target_output_fps(20, false, 0.1, 60.0);
        assert_eq!(fps, 60.0);
    }

    #[test]
    fn unknown_interval_gives_zero_target() {
        assert_eq!(target_output_fps(2, false, 0.0, 0.0), 0.0);
    }

    #[test]
    fn present_fps_tracks_interval_ema() {
        let mut pacer = OutputPacer::new();
        let interval = FREQ / 60;
        let mut now = 0;
        for _ in 0..50 {
            now += interval;
            pacer.note_present(now, FREQ);
        }
        assert!((pacer.present_fps() - 60.0).abs() < 1.0);
    }

    #[test]
    fn adaptive_delay_steers_toward_target_depth() {
        let cfg = EngineConfig {
            never_drop: true,
            adaptive_delay: true,
            target_queue_depth: 4,
            delay_scale: 1.0,
            ..EngineConfig::default()
        }
        .clamped();
        let avg = 1.0 / 60.0;
        let starving = presentation_delay_sec(&cfg, avg, 1);
        let balanced = presentation_delay_sec(&cfg, avg, 4);
        let flooded = presentation_delay_sec(&cfg, avg, 9);
        // Short queue -> larger delay (let it fill); deep queue -> less.
        assert!(starving > balanced);
        assert!(flooded < balanced);
        assert!(flooded >= 0.0);
    }

    #[test]
    fn delay_scale_floor_applies() {
        let cfg = EngineConfig {
            never_drop: false,
            delay_scale: 0.25,
            ..EngineConfig::default()
        }
        .clamped();
        let avg = 0.02;
        let delay = presentation_delay_sec(&cfg, avg, 3);
        assert!((delay - avg * 0.25).abs() < 1e-9);
    }
}
