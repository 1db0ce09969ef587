//! Capture backend contract and selection strategy.
//!
//! The engine never talks to an OS capture API directly; it consumes a
//! uniform "next captured image + two timestamps" contract from
//! whichever [`CaptureSource`] is active. Backend implementations live
//! with the embedding application (compositor-API capture, desktop
//! duplication, process hooks); this module defines what they must
//! provide and how the engine picks among them.

use crate::error::FlowResult;
use crate::frame::SourceFrame;

/// What is being captured.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureTarget {
    PrimaryMonitor,
    /// A monitor by backend-defined stable identifier.
    Monitor(String),
    /// A top-level window by native handle value.
    Window(isize),
    /// A process to hook for swap-chain capture.
    Process(u32),
}

impl CaptureTarget {
    pub fn is_window(&self) -> bool {
        matches!(self, Self::Window(_))
    }

    pub fn is_process(&self) -> bool {
        matches!(self, Self::Process(_))
    }
}

/// Interchangeable capture backend families.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureBackendKind {
    /// Pick automatically from the policy priority list.
    Auto,
    /// Compositor capture API (frame-pool based, per-window capable).
    Compositor,
    /// Desktop duplication API (whole-output, lowest overhead).
    Duplication,
    /// In-process swap-chain hook (games, exclusive fullscreen).
    Hook,
}

impl CaptureBackendKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Compositor => "compositor",
            Self::Duplication => "duplication",
            Self::Hook => "hook",
        }
    }
}

pub const DEFAULT_BACKEND_PRIORITY: [CaptureBackendKind; 3] = [
    CaptureBackendKind::Duplication,
    CaptureBackendKind::Compositor,
    CaptureBackendKind::Hook,
];

/// Ordered backend preference used when the kind is `Auto`.
#[derive(Clone, Debug)]
pub struct BackendPolicy {
    pub priority: Vec<CaptureBackendKind>,
    /// Prefer the compositor backend for window targets even when
    /// duplication ranks higher (duplication captures the whole monitor
    /// and crops, which breaks when the window is occluded).
    pub prefer_compositor_for_windows: bool,
    /// User override: force duplication even for window targets.
    pub force_duplication: bool,
}

impl BackendPolicy {
    /// Priority list with `Auto` entries and duplicates removed; falls
    /// back to the default order when the result would be empty.
    pub fn normalized_priority(&self) -> Vec<CaptureBackendKind> {
        let mut normalized = Vec::new();
        for kind in &self.priority {
            if *kind == CaptureBackendKind::Auto {
                continue;
            }
            if !normalized.contains(kind) {
                normalized.push(*kind);
            }
        }
        if normalized.is_empty() {
            normalized.extend(DEFAULT_BACKEND_PRIORITY);
        }
        normalized
    }
}

impl Default for BackendPolicy {
    fn default() -> Self {
        Self {
            priority: DEFAULT_BACKEND_PRIORITY.to_vec(),
            prefer_compositor_for_windows: true,
            force_duplication: false,
        }
    }
}

/// Pick the backend kind for a target.
///
/// This is the single strategy function replacing mode branches
/// scattered through an update loop: process targets always hook,
/// window targets prefer the compositor backend unless the user forced
/// duplication, and everything else takes the first entry of the
/// normalized priority list.
pub fn select_backend_kind(target: &CaptureTarget, policy: &BackendPolicy) -> CaptureBackendKind {
    if target.is_process() {
        return CaptureBackendKind::Hook;
    }
    if target.is_window() {
        if policy.force_duplication {
            return CaptureBackendKind::Duplication;
        }
        if policy.prefer_compositor_for_windows {
            return CaptureBackendKind::Compositor;
        }
    }
    policy
        .normalized_priority()
        .into_iter()
        .find(|kind| *kind != CaptureBackendKind::Hook || target.is_process())
        .unwrap_or(CaptureBackendKind::Duplication)
}

/// The uniform contract every capture backend implements.
///
/// All calls are made from the engine's update thread. A backend may run
/// its own acquisition thread internally, but `acquire_next_frame` must
/// be non-blocking or bounded by a short timeout and hand back one
/// fully-formed frame per call.
pub trait CaptureSource {
    /// One-time device binding. Called before any capture starts.
    #[cfg(target_os = "windows")]
    fn initialize(
        &mut self,
        device: &windows::Win32::Graphics::Direct3D11::ID3D11Device,
    ) -> FlowResult<()>;

    fn start_capture(&mut self, target: &CaptureTarget) -> FlowResult<()>;

    fn stop_capture(&mut self);

    /// Pull the next captured frame, if any. `Ok(None)` means no new
    /// frame this call — normal, the engine leaves its queue untouched.
    /// An `Err` whose class is fatal makes the engine stop and clear
    /// capture state.
    fn acquire_next_frame(&mut self) -> FlowResult<Option<SourceFrame>>;

    fn is_capturing(&self) -> bool;

    fn kind(&self) -> CaptureBackendKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_priority_strips_auto_and_duplicates() {
        let policy = BackendPolicy {
            priority: vec![
                CaptureBackendKind::Auto,
                CaptureBackendKind::Compositor,
                CaptureBackendKind::Compositor,
                CaptureBackendKind::Duplication,
            ],
            ..BackendPolicy::default()
        };
        assert_eq!(
            policy.normalized_priority(),
            vec![
                CaptureBackendKind::Compositor,
                CaptureBackendKind::Duplication
            ]
        );
    }

    #[test]
    fn empty_priority_falls_back_to_default_order() {
        let policy = BackendPolicy {
            priority: vec![CaptureBackendKind::Auto],
            ..BackendPolicy::default()
        };
        assert_eq!(
            policy.normalized_priority(),
            DEFAULT_BACKEND_PRIORITY.to_vec()
        );
    }

    #[test]
    fn process_targets_always_hook() {
        let policy = BackendPolicy::default();
        assert_eq!(
            select_backend_kind(&CaptureTarget::Process(4242), &policy),
            CaptureBackendKind::Hook
        );
    }

    #[test]
    fn window_targets_prefer_compositor_unless_forced() {
        let policy = BackendPolicy::default();
        let window = CaptureTarget::Window(0x10);
        assert_eq!(
            select_backend_kind(&window, &policy),
            CaptureBackendKind::Compositor
        );

        let forced = BackendPolicy {
            force_duplication: true,
            ..BackendPolicy::default()
        };
        assert_eq!(
            select_backend_kind(&window, &forced),
            CaptureBackendKind::Duplication
        );
    }

    #[test]
    fn monitor_targets_follow_priority_order_skipping_hook() {
        let policy = BackendPolicy {
            priority: vec![CaptureBackendKind::Hook, CaptureBackendKind::Compositor],
            ..BackendPolicy::default()
        };
        assert_eq!(
            select_backend_kind(&CaptureTarget::PrimaryMonitor, &policy),
            CaptureBackendKind::Compositor
        );
    }
}
