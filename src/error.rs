use std::fmt;

#[derive(Debug)]
pub enum FlowError {
    InvalidTarget(String),

    /// The active capture source signalled unrecoverable loss (monitor
    /// unplugged, hooked process exited). The engine must stop and clear
    /// its capture state.
    SourceLost,

    /// Capture access was revoked mid-session (e.g. secure desktop).
    AccessLost,

    UnsupportedFormat(String),

    /// Requested texture dimensions exceed what the device can allocate.
    DimensionsOutOfRange(u32, u32),

    InvalidConfig(String),

    BackendUnavailable(String),

    /// GPU resource or shader creation failed. Fatal at startup (no
    /// pipeline can run); transient when raised by a mid-session resize,
    /// which retries on the next resolution change.
    ResourceCreation(String),

    /// The capture source resolution changed during a session. Contains
    /// (new_width, new_height). The engine reallocates its frame ring and
    /// pipeline before the next tick.
    ResolutionChanged(u32, u32),

    Platform(anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowErrorClass {
    InvalidInput,
    Unsupported,
    Transient,
    Fatal,
}

impl FlowError {
    pub fn class(&self) -> FlowErrorClass {
        match self {
            Self::InvalidTarget(_) | Self::InvalidConfig(_) => FlowErrorClass::InvalidInput,
            Self::UnsupportedFormat(_)
            | Self::BackendUnavailable(_)
            | Self::DimensionsOutOfRange(_, _) => FlowErrorClass::Unsupported,
            Self::AccessLost | Self::ResolutionChanged(_, _) => FlowErrorClass::Transient,
            Self::SourceLost | Self::ResourceCreation(_) | Self::Platform(_) => {
                FlowErrorClass::Fatal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), FlowErrorClass::Transient)
    }

    /// Whether the engine must tear down capture state entirely rather
    /// than retrying the current source.
    pub fn requires_capture_reset(&self) -> bool {
        matches!(self, Self::SourceLost | Self::AccessLost)
    }

    /// Short human-readable form for the status line exposed to the
    /// embedding UI layer.
    pub fn status_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTarget(id) => {
                write!(f, "requested capture target is not available: {id}")
            }
            Self::SourceLost => write!(f, "capture source was lost"),
            Self::AccessLost => write!(f, "capture access lost"),
            Self::UnsupportedFormat(fmt_name) => {
                write!(f, "unsupported source texture format: {fmt_name}")
            }
            Self::DimensionsOutOfRange(w, h) => {
                write!(f, "texture dimensions {w}x{h} exceed device limits")
            }
            Self::InvalidConfig(message) => write!(f, "invalid engine configuration: {message}"),
            Self::BackendUnavailable(message) => {
                write!(f, "no available capture backend: {message}")
            }
            Self::ResourceCreation(what) => {
                write!(f, "GPU resource creation failed: {what}")
            }
            Self::ResolutionChanged(w, h) => {
                write!(f, "capture source resolution changed to {w}x{h}")
            }
            Self::Platform(inner) => write!(f, "{inner}"),
        }
    }
}

impl std::error::Error for FlowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Platform(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
