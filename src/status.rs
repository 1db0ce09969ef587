//! Read-only state exposed to the embedding control/UI layer.

use crate::backend::CaptureBackendKind;
use crate::phase::PairState;

/// Per-tick engine state snapshot. Cheap to copy; refreshed by every
/// `render` call.
#[derive(Clone, Debug, Default)]
pub struct EngineStatus {
    /// Blend fraction used for the last output (1.0 = newest frame).
    pub alpha: f32,
    /// Whether the interpolation pipeline ran for the last output. True
    /// even at alpha 0/1 while a pair is active — the pipeline runs
    /// anyway to keep GPU load (and clocks) level.
    pub interpolated: bool,
    /// The last pair's interval deviated >50% from the average
    /// (low-latency mode only).
    pub unstable: bool,
    /// Phase interval used for the last output, milliseconds.
    pub interval_ms: f32,
    /// Rolling average capture interval, milliseconds.
    pub avg_interval_ms: f32,
    /// Presentation delay applied to the displayed instant, milliseconds.
    pub output_delay_ms: f32,
    pub queue_depth: usize,
    pub capture_fps: f32,
    pub present_fps: f32,
    pub target_fps: f32,
    pub pair_state: PairState,
    /// Human-readable capture/engine state for the UI status line.
    pub message: String,
}

/// Extended snapshot for diagnostics export. The embedding layer owns
/// the formatting; the engine only provides the numbers.
#[derive(Clone, Debug, Default)]
pub struct DiagnosticsReport {
    pub frame_width: u32,
    pub frame_height: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub queue_depth: usize,
    pub avg_interval_ms: f32,
    pub min_interval_ms: f32,
    pub max_interval_ms: f32,
    pub capture_fps: f32,
    pub present_fps: f32,
    pub target_fps: f32,
    pub backend: Option<CaptureBackendKind>,
    pub pair_state: PairState,
    pub clock_offset_valid: bool,
}
