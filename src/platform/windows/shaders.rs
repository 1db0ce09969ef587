//! Compute-shader bytecode cache.
//!
//! Prefers build-time compiled `.cso` blobs (embedded via the
//! `FLOW_CS_*_PATH` env vars that build.rs emits when fxc.exe is
//! available), falling back to runtime `D3DCompile` of the bundled HLSL
//! source on first use. Either way each entry point is compiled at most
//! once per process.

use std::sync::OnceLock;

use crate::error::{FlowError, FlowResult};

#[allow(unused)]
const HLSL_SOURCE: &str = include_str!("flow_cs.hlsl");

macro_rules! define_shader_bytecode {
    ($fn_name:ident, $cfg:ident, $env:literal, $entry:literal) => {
        pub(crate) fn $fn_name() -> &'static FlowResult<Vec<u8>> {
            static BYTECODE: OnceLock<FlowResult<Vec<u8>>> = OnceLock::new();
            BYTECODE.get_or_init(|| {
                #[cfg($cfg)]
                {
                    Ok(include_bytes!(env!($env)).to_vec())
                }
                #[cfg(not($cfg))]
                {
                    compile_entry_runtime($entry)
                }
            })
        }
    };
}

define_shader_bytecode!(
    downsample_luma,
    has_cs_downsample_luma,
    "FLOW_CS_DOWNSAMPLE_LUMA_PATH",
    b"downsample_luma\0"
);
define_shader_bytecode!(
    downsample_half,
    has_cs_downsample_half,
    "FLOW_CS_DOWNSAMPLE_HALF_PATH",
    b"downsample_half\0"
);
define_shader_bytecode!(
    motion_coarse,
    has_cs_motion_coarse,
    "FLOW_CS_MOTION_COARSE_PATH",
    b"motion_coarse\0"
);
define_shader_bytecode!(
    motion_refine,
    has_cs_motion_refine,
    "FLOW_CS_MOTION_REFINE_PATH",
    b"motion_refine\0"
);
define_shader_bytecode!(
    motion_smooth,
    has_cs_motion_smooth,
    "FLOW_CS_MOTION_SMOOTH_PATH",
    b"motion_smooth\0"
);
define_shader_bytecode!(
    motion_temporal,
    has_cs_motion_temporal,
    "FLOW_CS_MOTION_TEMPORAL_PATH",
    b"motion_temporal\0"
);
define_shader_bytecode!(
    interpolate,
    has_cs_interpolate,
    "FLOW_CS_INTERPOLATE_PATH",
    b"interpolate\0"
);
define_shader_bytecode!(
    copy_scale,
    has_cs_copy_scale,
    "FLOW_CS_COPY_SCALE_PATH",
    b"copy_scale\0"
);
define_shader_bytecode!(
    debug_view,
    has_cs_debug_view,
    "FLOW_CS_DEBUG_VIEW_PATH",
    b"debug_view\0"
);

/// Runtime HLSL compilation fallback for one entry point. `entry` must
/// be NUL-terminated.
#[allow(dead_code)]
fn compile_entry_runtime(entry: &[u8]) -> FlowResult<Vec<u8>> {
    use windows::core::PCSTR;
    use windows::Win32::Graphics::Direct3D::Fxc::D3DCompile;

    let source = HLSL_SOURCE.as_bytes();
    let entry_pcstr = PCSTR::from_raw(entry.as_ptr());
    let target = PCSTR::from_raw(b"cs_5_0\0".as_ptr());
    let mut blob = None;
    let mut errors = None;

    let hr = unsafe {
        D3DCompile(
            source.as_ptr() as *const _,
            source.len(),
            None,
            None,
            None,
            entry_pcstr,
            target,
            0,
            0,
            &mut blob,
            Some(&mut errors),
        )
    };

    if let Err(e) = hr {
        let msg = errors
            .map(|b| {
                let ptr = unsafe { b.GetBufferPointer() } as *const u8;
                let len = unsafe { b.GetBufferSize() };
                let slice = unsafe { std::slice::from_raw_parts(ptr, len) };
                String::from_utf8_lossy(slice).to_string()
            })
            .unwrap_or_default();
        return Err(FlowError::Platform(
            anyhow::anyhow!("HLSL compile failed: {msg}").context(e.to_string()),
        ));
    }

    let blob =
        blob.ok_or_else(|| FlowError::Platform(anyhow::anyhow!("D3DCompile returned no blob")))?;
    let ptr = unsafe { blob.GetBufferPointer() } as *const u8;
    let len = unsafe { blob.GetBufferSize() };
    Ok(unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec())
}
