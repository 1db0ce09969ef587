//! Motion-compensated frame-rate up-conversion for live capture streams.
//!
//! `frameweave` takes captured screen/window images arriving at an
//! irregular, device-driven cadence and re-times them into a smooth
//! output stream at a target display rate, optionally synthesizing new
//! in-between frames by motion-compensated temporal interpolation on
//! the GPU.
//!
//! The crate splits into a portable scheduling core and a Windows/D3D11
//! compute pipeline:
//!
//! * [`clock`] reconciles the producer's wall-clock timestamps with the
//!   consumer's monotonic counter;
//! * [`queue`] absorbs producer jitter into a virtualized presentation
//!   timeline and bounds memory/latency;
//! * [`pacing`] picks the output rate and blocks until each output
//!   instant with sub-millisecond precision;
//! * [`phase`] turns the displayed instant into a blend fraction and
//!   tracks the source-pair lifecycle;
//! * the platform pipeline (Windows only) estimates per-pixel motion on
//!   a luma pyramid and composites the final frame.
//!
//! Capture backends are external collaborators: implement
//! [`backend::CaptureSource`] and hand it to the engine. The engine is a
//! single-threaded cooperative loop — call `update` to ingest and
//! `render` to produce one paced output frame.

pub mod backend;
pub mod clock;
pub mod config;
pub(crate) mod env_config;
pub mod error;
pub mod frame;
pub mod pacing;
pub mod phase;
pub mod queue;
pub mod status;

#[cfg(target_os = "windows")]
pub mod engine;
#[cfg(target_os = "windows")]
mod platform;

pub use backend::{BackendPolicy, CaptureBackendKind, CaptureSource, CaptureTarget};
pub use config::{
    DebugView, EngineConfig, MotionModel, QualityMode, TemporalConfig, TextProtectConfig,
};
pub use error::{FlowError, FlowErrorClass, FlowResult};
pub use frame::SourceFrame;
pub use status::{DiagnosticsReport, EngineStatus};

#[cfg(target_os = "windows")]
pub use engine::{FlowEngine, RenderedOutput};
