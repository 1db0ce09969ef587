//! Engine configuration snapshot.
//!
//! The embedding layer (settings UI, CLI, whatever hosts the engine)
//! owns the authoritative configuration and hands the engine a copy per
//! update tick. The engine clamps every value to its supported range
//! before use — out-of-range inputs are silently clamped, never
//! rejected — so the host never has to pre-validate.

/// Search-radius profile for the motion estimation pyramid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MotionModel {
    /// Scales the coarse radius up when neither temporal prediction nor
    /// temporal stabilization is available to compensate.
    #[default]
    Adaptive,
    /// Small fixed radii. Deterministic cost, best for mostly-static
    /// desktop content.
    Stable,
    /// Largest radii, for fast motion at higher GPU cost.
    Coverage,
    /// Coarse-level search only, cheapest. Skips refinement, smoothing,
    /// consistency checking and output history.
    Minimal,
}

impl MotionModel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Adaptive => "adaptive",
            Self::Stable => "stable",
            Self::Coverage => "coverage",
            Self::Minimal => "minimal",
        }
    }

    /// Whether the pipeline stops after the coarse search.
    pub fn is_minimal(self) -> bool {
        matches!(self, Self::Minimal)
    }

    /// Coarse (tiny-level) search radius. `predicted` and `stabilized`
    /// describe whether temporal prediction / stabilization will cover
    /// for a smaller search this frame.
    pub fn coarse_radius(self, predicted: bool, stabilized: bool) -> i32 {
        let base = match self {
            Self::Adaptive => {
                if predicted || stabilized {
                    6
                } else {
                    8
                }
            }
            Self::Stable => 4,
            Self::Coverage => 12,
            Self::Minimal => 4,
        };
        base.max(COARSE_RADIUS_MIN)
    }

    /// Refinement search radius around the upscaled seed vector.
    pub fn refine_radius(self) -> i32 {
        let base = match self {
            Self::Adaptive => 3,
            Self::Stable => 2,
            Self::Coverage => 4,
            Self::Minimal => 0,
        };
        base.min(REFINE_RADIUS_MAX)
    }
}

/// Minimum coarse search radius. Below this the coarse pass misses slow
/// pans entirely at tiny resolution.
pub const COARSE_RADIUS_MIN: i32 = 4;
/// Maximum refinement radius, bounding worst-case dispatch cost.
pub const REFINE_RADIUS_MAX: i32 = 12;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QualityMode {
    Standard,
    #[default]
    High,
}

/// Diagnostic replacement for the final compositing shader. The motion
/// estimation pyramid still runs in full for every mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DebugView {
    #[default]
    None,
    MotionFlow,
    ConfidenceHeatmap,
    MotionNeedles,
    ResidualError,
    SplitScreen,
    Occlusion,
}

impl DebugView {
    pub(crate) fn shader_mode(self) -> i32 {
        match self {
            Self::None => 0,
            Self::MotionFlow => 1,
            Self::ConfidenceHeatmap => 2,
            Self::MotionNeedles => 3,
            Self::ResidualError => 4,
            Self::SplitScreen => 5,
            Self::Occlusion => 6,
        }
    }

    /// Views that compare two source frames are meaningless with a
    /// single queued frame and demote to `None`.
    pub fn requires_pair(self) -> bool {
        matches!(
            self,
            Self::MotionFlow | Self::ConfidenceHeatmap | Self::ResidualError
        )
    }
}

/// Temporal stabilization tunables.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TemporalConfig {
    pub enabled: bool,
    /// Trust placed in the previous frame's stabilized field, 0–0.99.
    pub history_weight: f32,
    /// How much low confidence suppresses history trust, 0–1.
    pub conf_influence: f32,
    /// Spatial clamping box half-size; larger is more stable but less
    /// sharp, 1–4.
    pub neighborhood_size: i32,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            history_weight: 0.2,
            conf_influence: 0.6,
            neighborhood_size: 2,
        }
    }
}

/// Text/UI shimmer protection tunables.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TextProtectConfig {
    pub enabled: bool,
    /// Bias strength toward the unwarped frame on detected edges, 0–1.
    pub strength: f32,
    /// Luma gradient magnitude treated as a protected edge, 0.001–0.2.
    pub edge_threshold: f32,
}

impl Default for TextProtectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strength: 1.0,
            edge_threshold: 0.03,
        }
    }
}

/// One tick's worth of engine configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Master switch for motion-compensated interpolation. When off the
    /// engine falls back to scale-only output of the newest frame.
    pub interpolation_enabled: bool,
    /// Output frames per source frame, 1–20.
    pub multiplier: u32,
    pub motion_model: MotionModel,
    pub quality: QualityMode,
    /// Pace output to the display refresh rate instead of
    /// `multiplier / capture interval`.
    pub sync_to_display: bool,
    /// Pace output at all. Off means the caller drives cadence (e.g.
    /// vsync-blocked present).
    pub limit_output_fps: bool,
    /// Never discard unconsumed frames; ingestion throttles and
    /// presentation advances by discrete steps instead.
    pub never_drop: bool,
    /// Collapse redundant closely-spaced queue entries for latency.
    pub prefer_newest: bool,
    /// Always lock the phase interval to the running average.
    pub force_interpolation: bool,
    /// Seed the coarse motion search with the previous frame's field.
    pub motion_prediction: bool,
    /// Flag pairs with large interval deviation as unstable in status.
    pub low_latency_mode: bool,
    /// De-jitter tolerance as a fraction of the average interval, 0–1.
    /// At 0 timestamps never snap to the predicted cadence (they still
    /// blend 50/50 toward it).
    pub jitter_suppression: f32,
    /// Presentation delay as a multiple of the average capture interval,
    /// 0.25–1.5.
    pub delay_scale: f32,
    /// Adjust the presentation delay to hold the queue near
    /// `target_queue_depth` (never-drop mode only).
    pub adaptive_delay: bool,
    /// Queue depth the adaptive delay steers toward, 2–12.
    pub target_queue_depth: u32,
    /// Queue bound in never-drop mode, 2–12.
    pub max_queue_size: u32,
    pub temporal: TemporalConfig,
    pub text_protect: TextProtectConfig,
    /// Edge down-weighting strength for motion smoothing, 0.5–20.
    pub motion_edge_scale: f32,
    /// Exponent applied to confidence before use as a blend weight,
    /// 0.25–4.
    pub confidence_power: f32,
    pub debug_view: DebugView,
    /// Vector magnification for the debug flow/needle views.
    pub debug_motion_scale: f32,
    /// Difference magnification for the residual-error debug view.
    pub debug_diff_scale: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interpolation_enabled: true,
            multiplier: 2,
            motion_model: MotionModel::Adaptive,
            quality: QualityMode::High,
            sync_to_display: false,
            limit_output_fps: true,
            never_drop: false,
            prefer_newest: true,
            force_interpolation: false,
            motion_prediction: true,
            low_latency_mode: true,
            jitter_suppression: 0.2,
            delay_scale: 1.0,
            adaptive_delay: true,
            target_queue_depth: 4,
            max_queue_size: 12,
            temporal: TemporalConfig::default(),
            text_protect: TextProtectConfig::default(),
            motion_edge_scale: 6.0,
            confidence_power: 1.5,
            debug_view: DebugView::None,
            debug_motion_scale: 0.03,
            debug_diff_scale: 2.0,
        }
    }
}

impl EngineConfig {
    /// Clamp every field into its supported range and apply the
    /// text-preservation preset. Called once per tick on the snapshot;
    /// downstream code assumes clamped values.
    pub fn clamped(&self) -> Self {
        let mut cfg = self.clone();
        cfg.multiplier = cfg.multiplier.clamp(1, 20);
        cfg.jitter_suppression = cfg.jitter_suppression.clamp(0.0, 1.0);
        cfg.delay_scale = cfg.delay_scale.clamp(0.25, 1.5);
        cfg.target_queue_depth = cfg.target_queue_depth.clamp(2, crate::queue::QUEUE_SLOTS as u32);
        cfg.max_queue_size = cfg.max_queue_size.clamp(2, crate::queue::QUEUE_SLOTS as u32);
        cfg.motion_edge_scale = cfg.motion_edge_scale.clamp(0.5, 20.0);
        cfg.confidence_power = cfg.confidence_power.clamp(0.25, 4.0);
        cfg.temporal.history_weight = cfg.temporal.history_weight.clamp(0.0, 0.99);
        cfg.temporal.conf_influence = cfg.temporal.conf_influence.clamp(0.0, 1.0);
        cfg.temporal.neighborhood_size = cfg.temporal.neighborhood_size.clamp(1, 4);
        cfg.text_protect.strength = cfg.text_protect.strength.clamp(0.0, 1.0);
        cfg.text_protect.edge_threshold = cfg.text_protect.edge_threshold.clamp(0.001, 0.2);
        cfg.debug_motion_scale = cfg.debug_motion_scale.clamp(0.001, 1.0);
        cfg.debug_diff_scale = cfg.debug_diff_scale.clamp(0.1, 16.0);

        // Text preservation trades temporal smoothing for sharpness:
        // sticky motion history is what makes small glyphs swim.
        if cfg.text_protect.enabled {
            cfg.temporal.history_weight = 0.05;
            cfg.temporal.conf_influence = 0.3;
            cfg.temporal.neighborhood_size = 1;
            cfg.motion_edge_scale = 10.0;
            cfg.confidence_power = 2.0;
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_values_clamp_silently() {
        let cfg = EngineConfig {
            multiplier: 99,
            jitter_suppression: 3.0,
            delay_scale: 0.0,
            target_queue_depth: 100,
            max_queue_size: 0,
            motion_edge_scale: 50.0,
            confidence_power: 0.0,
            ..EngineConfig::default()
        }
        .clamped();
        assert_eq!(cfg.multiplier, 20);
        assert_eq!(cfg.jitter_suppression, 1.0);
        assert_eq!(cfg.delay_scale, 0.25);
        assert_eq!(cfg.target_queue_depth, 12);
        assert_eq!(cfg.max_queue_size, 2);
        assert_eq!(cfg.motion_edge_scale, 20.0);
        assert_eq!(cfg.confidence_power, 0.25);
    }

    #[test]
    fn temporal_tunables_clamp() {
        let cfg = EngineConfig {
            temporal: TemporalConfig {
                enabled: true,
                history_weight: 1.5,
                conf_influence: -1.0,
                neighborhood_size: 9,
            },
            ..EngineConfig::default()
        }
        .clamped();
        assert_eq!(cfg.temporal.history_weight, 0.99);
        assert_eq!(cfg.temporal.conf_influence, 0.0);
        assert_eq!(cfg.temporal.neighborhood_size, 4);
    }

    #[test]
    fn text_preservation_preset_overrides_temporal() {
        let cfg = EngineConfig {
            text_protect: TextProtectConfig {
                enabled: true,
                ..TextProtectConfig::default()
            },
            ..EngineConfig::default()
        }
        .clamped();
        assert_eq!(cfg.temporal.history_weight, 0.05);
        assert_eq!(cfg.temporal.conf_influence, 0.3);
        assert_eq!(cfg.temporal.neighborhood_size, 1);
        assert_eq!(cfg.motion_edge_scale, 10.0);
        assert_eq!(cfg.confidence_power, 2.0);
    }

    #[test]
    fn adaptive_model_widens_search_without_prediction() {
        let with_help = MotionModel::Adaptive.coarse_radius(true, true);
        let without = MotionModel::Adaptive.coarse_radius(false, false);
        assert!(without > with_help);
        assert!(with_help >= COARSE_RADIUS_MIN);
    }

    #[test]
    fn radii_respect_safety_bounds() {
        for model in [
            MotionModel::Adaptive,
            MotionModel::Stable,
            MotionModel::Coverage,
            MotionModel::Minimal,
        ] {
            for predicted in [false, true] {
                for stabilized in [false, true] {
                    assert!(model.coarse_radius(predicted, stabilized) >= COARSE_RADIUS_MIN);
                }
            }
            assert!(model.refine_radius() <= REFINE_RADIUS_MAX);
        }
    }
}
