//! Captured-frame handoff type and monotonic-clock helpers.
//!
//! A capture backend hands the engine one fully-formed [`SourceFrame`]
//! per `acquire_next_frame` call. The frame carries two timestamps from
//! independent clock domains: the producer's wall-clock presentation
//! time in 100 ns units, and the consumer-side QPC counter value at
//! acquisition. [`crate::clock::ClockSync`] reconciles the two.

/// One captured image handed off by a capture backend.
///
/// Ownership of the GPU texture transfers to the engine for the duration
/// of the ingestion call; the engine copies it into a frame-ring slot and
/// never retains the backend's texture beyond that.
pub struct SourceFrame {
    /// The captured image. `None` when the backend delivered metadata
    /// without pixels (treated as no-frame by the engine).
    #[cfg(target_os = "windows")]
    pub texture: Option<windows::Win32::Graphics::Direct3D11::ID3D11Texture2D>,
    pub width: u32,
    pub height: u32,
    /// QPC counter value at acquisition (consumer clock domain).
    pub qpc_time: i64,
    /// Producer presentation timestamp in 100 ns units (wall-clock
    /// domain). Sourced from `DXGI_OUTDUPL_FRAME_INFO.LastPresentTime`
    /// or `Direct3D11CaptureFrame.SystemRelativeTime` equivalents.
    pub system_time_100ns: i64,
}

impl std::fmt::Debug for SourceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("qpc_time", &self.qpc_time)
            .field("system_time_100ns", &self.system_time_100ns)
            .finish()
    }
}

/// Cached QPC frequency (ticks per second). Returns 0 if unavailable.
pub fn qpc_frequency_cached() -> i64 {
    #[cfg(target_os = "windows")]
    {
        use std::sync::OnceLock;
        use windows::Win32::System::Performance::QueryPerformanceFrequency;
        static FREQ: OnceLock<i64> = OnceLock::new();
        *FREQ.get_or_init(|| {
            let mut freq = 0i64;
            unsafe {
                let _ = QueryPerformanceFrequency(&mut freq);
            }
            freq
        })
    }
    #[cfg(not(target_os = "windows"))]
    {
        0
    }
}

/// Query the current QPC counter value. Returns `None` on non-Windows
/// or if the call fails.
pub fn query_qpc_now() -> Option<i64> {
    #[cfg(target_os = "windows")]
    {
        use windows::Win32::System::Performance::QueryPerformanceCounter;
        let mut ticks = 0i64;
        let ok = unsafe { QueryPerformanceCounter(&mut ticks) };
        if ok.is_ok() { Some(ticks) } else { None }
    }
    #[cfg(not(target_os = "windows"))]
    {
        None
    }
}
