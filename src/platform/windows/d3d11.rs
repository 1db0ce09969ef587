use anyhow::{Context, Result};
use windows::Win32::Graphics::Direct3D::{D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL_11_0};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, D3D11_CREATE_DEVICE_BGRA_SUPPORT,
    D3D11_SDK_VERSION,
};

use crate::error::{FlowError, FlowResult};

/// Largest texture dimension the pipeline will attempt to allocate.
/// Matches the D3D11 hardware guarantee; anything bigger fails cleanly
/// before reaching the driver.
pub(crate) const MAX_TEXTURE_DIM: u32 = 16384;

/// Create a D3D11 device on the default hardware adapter for callers
/// that don't bring their own. The engine normally receives the
/// embedder's device so captured textures can be consumed without
/// cross-device copies.
pub(crate) fn create_d3d11_device_default() -> Result<(ID3D11Device, ID3D11DeviceContext)> {
    let mut device: Option<ID3D11Device> = None;
    let mut context: Option<ID3D11DeviceContext> = None;
    let feature_levels = [D3D_FEATURE_LEVEL_11_0];

    unsafe {
        D3D11CreateDevice(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            None,
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            Some(&feature_levels),
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
    }
    .context("D3D11CreateDevice failed")?;

    let device = device.context("D3D11CreateDevice did not return a device")?;
    let context = context.context("D3D11CreateDevice did not return a device context")?;
    Ok((device, context))
}

/// Validate requested pipeline dimensions before any allocation.
pub(crate) fn validate_dimensions(width: u32, height: u32) -> FlowResult<()> {
    if width == 0 || height == 0 || width > MAX_TEXTURE_DIM || height > MAX_TEXTURE_DIM {
        return Err(FlowError::DimensionsOutOfRange(width, height));
    }
    Ok(())
}
