//! The frame-flow engine: ingestion, pacing, and output composition.
//!
//! Single-threaded cooperative loop. The embedder calls [`FlowEngine::update`]
//! once per tick to drain the capture backend into the frame ring, then
//! [`FlowEngine::render`] to block until the next scheduled output
//! instant and produce one output image. The pacer wait is the only
//! intentional suspension point; all GPU work is issued synchronously
//! on the immediate context in a fixed order.

use rustc_hash::FxHashMap;
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Device, ID3D11DeviceContext, ID3D11ShaderResourceView, ID3D11Texture2D,
};

use crate::backend::{select_backend_kind, BackendPolicy, CaptureSource, CaptureTarget};
use crate::clock::ClockSync;
use crate::config::{DebugView, EngineConfig};
use crate::env_config::{define_env_flag, env_var_positive_u64};
use crate::error::{FlowError, FlowResult};
use crate::frame::{qpc_frequency_cached, query_qpc_now};
use crate::pacing::{
    is_low_fps_source, presentation_delay_sec, target_output_fps, OutputPacer, PrecisionWaiter,
};
use crate::phase::{PairState, PhaseScheduler};
use crate::platform::windows::pipeline::{copy_into_slot, create_slot_texture, MotionPipeline};
use crate::queue::{FrameQueue, QueuePolicy, QUEUE_SLOTS};
use crate::status::{DiagnosticsReport, EngineStatus};

define_env_flag!(enabled_when(trace_pacing, "FRAMEWEAVE_TRACE_PACING"));

/// Upper bound on frames pulled from the backend per update tick.
/// Prevents an unbounded catch-up loop when the producer briefly
/// outruns the consumer (alt-tab storms, driver hiccups).
const DEFAULT_MAX_INGEST_PER_TICK: usize = 180;

/// Render-side queue bound in drop mode. Slow sources get one extra
/// entry of slack because their pairs live much longer.
fn drop_mode_queue_bound(low_fps_source: bool) -> usize {
    if low_fps_source {
        4
    } else {
        3
    }
}

/// One produced output image. Borrows the engine's output (or slot)
/// texture until the embedder has copied/presented it.
pub struct RenderedOutput<'a> {
    pub texture: &'a ID3D11Texture2D,
    pub srv: &'a ID3D11ShaderResourceView,
    pub width: u32,
    pub height: u32,
}

pub struct FlowEngine {
    device: ID3D11Device,
    context: ID3D11DeviceContext,

    queue: FrameQueue,
    clock: ClockSync,
    pacer: OutputPacer,
    waiter: PrecisionWaiter,
    phase: PhaseScheduler,
    pipeline: MotionPipeline,

    source: Option<Box<dyn CaptureSource>>,
    policy: BackendPolicy,
    target: Option<CaptureTarget>,

    slots: [Option<(ID3D11Texture2D, ID3D11ShaderResourceView)>; QUEUE_SLOTS],
    frame_width: u32,
    frame_height: u32,
    output_width: u32,
    output_height: u32,

    /// Refresh rate per display identifier, provided by the embedder.
    refresh_rates: FxHashMap<isize, f32>,
    active_display: isize,

    status: EngineStatus,
}

impl FlowEngine {
    /// Build the engine on the embedder's device. Shader compilation
    /// happens here; a failure is fatal since no pipeline can run.
    pub fn new(device: ID3D11Device, context: ID3D11DeviceContext) -> FlowResult<Self> {
        let pipeline = MotionPipeline::new(&device)?;
        Ok(Self {
            device,
            context,
            queue: FrameQueue::new(),
            clock: ClockSync::new(qpc_frequency_cached()),
            pacer: OutputPacer::new(),
            waiter: PrecisionWaiter::new(),
            phase: PhaseScheduler::new(),
            pipeline,
            source: None,
            policy: BackendPolicy::default(),
            target: None,
            slots: Default::default(),
            frame_width: 0,
            frame_height: 0,
            output_width: 0,
            output_height: 0,
            refresh_rates: FxHashMap::default(),
            active_display: 0,
            status: EngineStatus::default(),
        })
    }

    pub fn set_backend_policy(&mut self, policy: BackendPolicy) {
        self.policy = policy;
    }

    /// Register a display's refresh rate for display-synced pacing and
    /// the slow-source cap. The embedder owns display enumeration.
    pub fn set_display_refresh(&mut self, display: isize, hz: f32) {
        self.refresh_rates.insert(display, hz);
    }

    pub fn set_active_display(&mut self, display: isize) {
        self.active_display = display;
    }

    fn refresh_hz(&self) -> f32 {
        self.refresh_rates
            .get(&self.active_display)
            .copied()
            .unwrap_or(0.0)
    }

    /// Install a capture source and start capturing the target. Any
    /// previous source is stopped and all cross-frame state cleared.
    pub fn start_capture(
        &mut self,
        mut source: Box<dyn CaptureSource>,
        target: CaptureTarget,
    ) -> FlowResult<()> {
        self.stop_capture();
        let wanted = select_backend_kind(&target, &self.policy);
        if source.kind() != wanted {
            log::debug!(
                "capture source kind {} differs from selected strategy {}",
                source.kind().as_str(),
                wanted.as_str()
            );
        }
        source.initialize(&self.device)?;
        source.start_capture(&target)?;
        self.status.message = format!("capturing via {}", source.kind().as_str());
        self.source = Some(source);
        self.target = Some(target);
        Ok(())
    }

    pub fn stop_capture(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.stop_capture();
        }
        self.target = None;
        self.reset_capture_state();
        self.status.message = "capture stopped".to_string();
    }

    pub fn is_capturing(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.is_capturing())
    }

    pub fn capture_target(&self) -> Option<&CaptureTarget> {
        self.target.as_ref()
    }

    /// Set the output (presentation) dimensions. Reallocates the GPU
    /// pipeline when a capture resolution is already known.
    pub fn set_output_size(&mut self, width: u32, height: u32) -> FlowResult<()> {
        if width == self.output_width && height == self.output_height {
            return Ok(());
        }
        self.output_width = width;
        self.output_height = height;
        if self.frame_width > 0 && self.frame_height > 0 {
            self.pipeline.resize(
                &self.device,
                self.frame_width,
                self.frame_height,
                width,
                height,
            )?;
            self.pipeline.reset_temporal();
            self.phase.reset();
        }
        Ok(())
    }

    pub fn status(&self) -> &EngineStatus {
        &self.status
    }

    pub fn diagnostics(&self) -> DiagnosticsReport {
        DiagnosticsReport {
            frame_width: self.frame_width,
            frame_height: self.frame_height,
            output_width: self.output_width,
            output_height: self.output_height,
            queue_depth: self.queue.len(),
            avg_interval_ms: (self.queue.avg_interval() * 1e3) as f32,
            min_interval_ms: self.queue.min_interval_ms(),
            max_interval_ms: self.queue.max_interval_ms(),
            capture_fps: self.queue.capture_fps(),
            present_fps: self.pacer.present_fps(),
            target_fps: self.status.target_fps,
            backend: self.source.as_ref().map(|s| s.kind()),
            pair_state: self.phase.state(),
            clock_offset_valid: self.clock.is_valid(),
        }
    }

    /// Clear everything learned about the current capture stream:
    /// queue, timestamps, clock offset, pacing, pair state, and the
    /// pipeline's temporal history.
    fn reset_capture_state(&mut self) {
        self.queue.reset();
        self.clock.reset();
        self.pacer.reset();
        self.phase.reset();
        self.pipeline.reset_temporal();
    }

    /// Reallocate the frame ring and pipeline for a new capture
    /// resolution. A failure leaves the ring empty; the engine shows
    /// nothing until the next resolution change succeeds.
    fn resize_for_capture(&mut self, width: u32, height: u32) -> FlowResult<()> {
        log::debug!(
            "capture resolution changed: {}x{} -> {}x{}",
            self.frame_width,
            self.frame_height,
            width,
            height
        );
        self.frame_width = width;
        self.frame_height = height;
        self.reset_capture_state();

        self.slots = Default::default();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            match create_slot_texture(&self.device, width, height) {
                Ok(pair) => *slot = Some(pair),
                Err(e) => {
                    log::warn!("frame slot {i} allocation failed: {e}");
                    self.slots = Default::default();
                    return Err(e);
                }
            }
        }

        if self.output_width == 0 || self.output_height == 0 {
            self.output_width = width;
            self.output_height = height;
        }
        self.pipeline.resize(
            &self.device,
            width,
            height,
            self.output_width,
            self.output_height,
        )
    }

    fn max_ingest_per_tick() -> usize {
        env_var_positive_u64("FRAMEWEAVE_MAX_INGEST_PER_TICK")
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_INGEST_PER_TICK)
    }

    /// Drain the capture backend into the frame ring: bounded batch,
    /// clock sync update, timestamp virtualization, queue bounds.
    pub fn update(&mut self, config: &EngineConfig) -> FlowResult<()> {
        let cfg = config.clamped();
        // Take ownership for the duration of the batch so ingestion can
        // freely touch the rest of the engine state.
        let Some(mut source) = self.source.take() else {
            return Ok(());
        };

        let policy = if cfg.never_drop {
            QueuePolicy::NeverDrop
        } else {
            QueuePolicy::DropOldest
        };
        let ingest_bound = if cfg.never_drop {
            cfg.max_queue_size as usize
        } else {
            drop_mode_queue_bound(false).min(cfg.max_queue_size as usize)
        };

        let mut processed = 0;
        let max_ingest = Self::max_ingest_per_tick();
        while processed < max_ingest {
            if policy == QueuePolicy::NeverDrop && self.queue.len() >= ingest_bound {
                break;
            }
            let frame = match source.acquire_next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) if e.requires_capture_reset() => {
                    log::warn!("capture source lost: {e}");
                    source.stop_capture();
                    self.target = None;
                    self.status.message = e.status_string();
                    self.reset_capture_state();
                    return Ok(());
                }
                Err(FlowError::ResolutionChanged(w, h)) => {
                    processed += 1;
                    if let Err(resize_err) = self.resize_for_capture(w, h) {
                        self.status.message = resize_err.status_string();
                    }
                    continue;
                }
                Err(e) if e.is_retryable() => break,
                Err(e) => {
                    self.source = Some(source);
                    return Err(e);
                }
            };
            processed += 1;

            let Some(texture) = frame.texture.as_ref() else {
                continue;
            };
            if frame.width != self.frame_width || frame.height != self.frame_height {
                if let Err(e) = self.resize_for_capture(frame.width, frame.height) {
                    // Degrade to no output this tick; the next resolution
                    // change retries the allocation.
                    self.status.message = e.status_string();
                    continue;
                }
            }
            if self.slots[0].is_none() {
                continue;
            }

            self.clock.observe(frame.qpc_time, frame.system_time_100ns);

            let Some(slot) = self.queue.admit(
                frame.system_time_100ns,
                cfg.jitter_suppression,
                policy,
                ingest_bound,
            ) else {
                continue;
            };
            if let Some((slot_tex, _)) = self.slots[slot].as_ref() {
                copy_into_slot(&self.context, slot_tex, texture);
            }
        }
        self.source = Some(source);
        Ok(())
    }

    /// Block until the next scheduled output instant and compose one
    /// output frame. Returns `None` when there is nothing to show
    /// (no frames queued, or a degraded pipeline).
    pub fn render(&mut self, config: &EngineConfig) -> FlowResult<Option<RenderedOutput<'_>>> {
        let cfg = config.clamped();
        if self.output_width == 0 || self.output_height == 0 {
            return Ok(None);
        }
        let qpc_freq = self.clock.qpc_frequency();
        let Some(mut now) = query_qpc_now() else {
            return Ok(None);
        };

        let multiplier = cfg.multiplier.max(1);
        let avg_interval = self.queue.avg_interval();
        let low_fps = is_low_fps_source(avg_interval);
        let refresh_hz = self.refresh_hz();
        let target_fps =
            target_output_fps(multiplier, cfg.sync_to_display, avg_interval, refresh_hz);
        self.status.target_fps = target_fps;

        // Pace: sleep + spin to the accumulated deadline. Display-synced
        // output leaves pacing to the presentation wait instead.
        let pacing = cfg.limit_output_fps && !cfg.sync_to_display;
        let mut predicted_qpc = 0i64;
        if pacing {
            if let Some(schedule) = self.pacer.schedule(now, qpc_freq, target_fps) {
                if trace_pacing() {
                    log::debug!(
                        "pacer: wait {} ticks to {}",
                        schedule.wait_ticks,
                        schedule.next_output_qpc
                    );
                }
                self.waiter.wait_until(schedule.next_output_qpc, qpc_freq);
                predicted_qpc = schedule.next_output_qpc;
                now = query_qpc_now().unwrap_or(schedule.next_output_qpc);
            }
        } else {
            // Disarm the accumulator so a later re-enable anchors fresh.
            let _ = self.pacer.schedule(now, qpc_freq, 0.0);
        }

        let policy = if cfg.never_drop {
            QueuePolicy::NeverDrop
        } else {
            QueuePolicy::DropOldest
        };
        let render_bound = if cfg.never_drop {
            cfg.max_queue_size as usize
        } else {
            drop_mode_queue_bound(low_fps).min(cfg.max_queue_size as usize)
        };
        self.queue.enforce_bound(policy, render_bound);

        self.status.alpha = 1.0;
        self.status.interpolated = false;
        self.status.unstable = false;
        self.status.output_delay_ms = 0.0;
        self.status.queue_depth = self.queue.len();
        self.status.capture_fps = self.queue.capture_fps();
        self.status.avg_interval_ms = (avg_interval * 1e3) as f32;

        if self.queue.is_empty() {
            self.status.pair_state = PairState::NoPair;
            return Ok(None);
        }

        // Displayed instant in the producer's wall-clock domain. When
        // pacing is active the *intended* output time is used so thread
        // wakeup jitter never modulates alpha.
        let delay = presentation_delay_sec(&cfg, avg_interval, self.queue.len());
        self.status.output_delay_ms = (delay * 1e3) as f32;
        let display_time_100ns = if pacing && predicted_qpc > 0 {
            (self.clock.to_wall_clock(predicted_qpc) - delay * 1e7).max(0.0)
        } else {
            (self.clock.to_wall_clock(now) - delay * 1e7).max(0.0)
        };

        self.queue
            .prune_for_display(display_time_100ns, policy, cfg.prefer_newest, low_fps);

        let Some(pair) = self.queue.pending_pair() else {
            self.status.pair_state = PairState::NoPair;
            return Ok(None);
        };
        self.status.queue_depth = self.queue.len();

        let transition = self.phase.observe_pair(Some(&pair), multiplier);
        if transition.temporal_reset {
            self.pipeline.reset_temporal();
        }

        let prev_ready = self.slots[pair.prev_slot].is_some();
        let curr_ready = self.slots[pair.curr_slot].is_some();
        let can_interpolate =
            cfg.interpolation_enabled && pair.has_pair && prev_ready && curr_ready;
        let needs_scale =
            self.output_width != self.frame_width || self.output_height != self.frame_height;

        let decision = self.phase.compute(
            display_time_100ns,
            &pair,
            avg_interval,
            multiplier,
            can_interpolate,
            cfg.never_drop,
            cfg.sync_to_display,
            cfg.force_interpolation,
            low_fps,
            cfg.jitter_suppression,
        );

        self.status.alpha = decision.alpha;
        self.status.interval_ms = (decision.use_interval * 1e3) as f32;
        if cfg.low_latency_mode && avg_interval > 0.0 && decision.raw_interval > 0.0 {
            let delta = (decision.raw_interval - avg_interval).abs();
            self.status.unstable = delta > avg_interval * 0.5;
        }

        // Debug views that compare a pair demote to normal output when
        // only one frame exists.
        let mut debug_view = cfg.debug_view;
        if debug_view != DebugView::None && !pair.has_pair && debug_view.requires_pair() {
            debug_view = DebugView::None;
        }

        let mut use_pipeline_output = false;
        if debug_view != DebugView::None && curr_ready && self.pipeline.is_ready() {
            let prev_srv = self.slot_srv(if prev_ready { pair.prev_slot } else { pair.curr_slot });
            let curr_srv = self.slot_srv(pair.curr_slot);
            self.pipeline
                .debug(&self.context, &prev_srv, &curr_srv, debug_view, &cfg)?;
            use_pipeline_output = true;
        } else if can_interpolate && self.pipeline.is_ready() {
            // The pipeline runs even at alpha 0/1: skipping it would
            // swing GPU load wildly between passthrough and full-cost
            // ticks, which shows up as frame-time spikes.
            let prev_srv = self.slot_srv(pair.prev_slot);
            let curr_srv = self.slot_srv(pair.curr_slot);
            self.pipeline
                .execute(&self.context, &prev_srv, &curr_srv, decision.alpha, &cfg)?;
            self.status.interpolated = true;
            use_pipeline_output = true;
        } else if needs_scale && curr_ready && self.pipeline.is_ready() {
            let curr_srv = self.slot_srv(pair.curr_slot);
            self.pipeline.blit(&self.context, &curr_srv)?;
            use_pipeline_output = true;
        }

        // Never-drop retires the front entry only once its discrete
        // steps are used up.
        if cfg.never_drop && pair.has_pair {
            if self.phase.advance_step(can_interpolate, multiplier) {
                self.queue.retire_front();
            }
        }
        self.status.pair_state = self.phase.state();

        if let Some(done) = query_qpc_now() {
            self.pacer.note_present(done, qpc_freq);
        }
        self.status.present_fps = self.pacer.present_fps();

        if use_pipeline_output {
            let texture = self.pipeline.output_texture().ok_or_else(|| {
                FlowError::ResourceCreation("pipeline output missing".into())
            })?;
            let srv = self.pipeline.output_srv().ok_or_else(|| {
                FlowError::ResourceCreation("pipeline output view missing".into())
            })?;
            Ok(Some(RenderedOutput {
                texture,
                srv,
                width: self.output_width,
                height: self.output_height,
            }))
        } else {
            // Static fallback: most recent frame, unscaled.
            let Some((tex, srv)) = self.slots[pair.curr_slot].as_ref() else {
                return Ok(None);
            };
            Ok(Some(RenderedOutput {
                texture: tex,
                srv,
                width: self.frame_width,
                height: self.frame_height,
            }))
        }
    }

    fn slot_srv(&self, slot: usize) -> ID3D11ShaderResourceView {
        // Callers check slot readiness before asking for the view.
        self.slots[slot]
            .as_ref()
            .map(|(_, srv)| srv.clone())
            .expect("slot texture checked by caller")
    }
}
