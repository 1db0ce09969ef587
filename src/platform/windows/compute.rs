//! Shared D3D11 compute infrastructure for the motion pipeline.
//!
//! Thin ownership wrappers around the handful of D3D11 objects every
//! pipeline stage needs: a compute shader, a constant buffer updated
//! via map/discard, and SRV+UAV-capable field textures. Binding and
//! unbinding go through slice helpers so each dispatch site stays
//! declarative.

use anyhow::Context;
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Buffer, ID3D11ComputeShader, ID3D11Device, ID3D11DeviceContext,
    ID3D11SamplerState, ID3D11ShaderResourceView, ID3D11Texture2D, ID3D11UnorderedAccessView,
    D3D11_BIND_CONSTANT_BUFFER, D3D11_BIND_SHADER_RESOURCE, D3D11_BIND_UNORDERED_ACCESS,
    D3D11_BUFFER_DESC, D3D11_CPU_ACCESS_WRITE, D3D11_FILTER_MIN_MAG_MIP_LINEAR,
    D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_WRITE_DISCARD, D3D11_SAMPLER_DESC,
    D3D11_TEXTURE2D_DESC, D3D11_TEXTURE_ADDRESS_CLAMP, D3D11_USAGE_DEFAULT, D3D11_USAGE_DYNAMIC,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC};

use crate::error::{FlowError, FlowResult};

/// Thread-group edge length used by every 2D dispatch in flow_cs.hlsl.
const GROUP_DIM: u32 = 16;

pub(crate) fn dispatch_size(size: u32) -> u32 {
    (size + GROUP_DIM - 1) / GROUP_DIM
}

pub(crate) struct ComputePass {
    cs: ID3D11ComputeShader,
}

impl ComputePass {
    /// Create a pass from cached bytecode. Failure here is fatal — a
    /// missing shader means no pipeline can run.
    pub(crate) fn new(
        device: &ID3D11Device,
        bytecode: &'static FlowResult<Vec<u8>>,
        label: &str,
    ) -> FlowResult<Self> {
        let bytecode = bytecode
            .as_ref()
            .map_err(|e| FlowError::ResourceCreation(format!("{label} shader bytecode: {e}")))?;
        let mut cs: Option<ID3D11ComputeShader> = None;
        unsafe { device.CreateComputeShader(bytecode, None, Some(&mut cs)) }
            .context(format!("CreateComputeShader ({label}) failed"))
            .map_err(FlowError::Platform)?;
        let cs = cs.ok_or_else(|| {
            FlowError::ResourceCreation(format!("CreateComputeShader ({label}) returned None"))
        })?;
        Ok(Self { cs })
    }

    pub(crate) fn bind(&self, context: &ID3D11DeviceContext) {
        unsafe { context.CSSetShader(&self.cs, None) };
    }
}

/// One GPU field: a texture plus its read and write views.
pub(crate) struct FieldTexture {
    pub(crate) tex: ID3D11Texture2D,
    pub(crate) srv: ID3D11ShaderResourceView,
    pub(crate) uav: ID3D11UnorderedAccessView,
    pub(crate) width: u32,
    pub(crate) height: u32,
}

impl FieldTexture {
    pub(crate) fn new(
        device: &ID3D11Device,
        width: u32,
        height: u32,
        format: DXGI_FORMAT,
        label: &str,
    ) -> FlowResult<Self> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: format,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_SHADER_RESOURCE.0 | D3D11_BIND_UNORDERED_ACCESS.0) as u32,
            ..Default::default()
        };

        let mut tex: Option<ID3D11Texture2D> = None;
        unsafe { device.CreateTexture2D(&desc, None, Some(&mut tex)) }
            .context(format!("CreateTexture2D ({label}) failed"))
            .map_err(FlowError::Platform)?;
        let tex = tex.ok_or_else(|| {
            FlowError::ResourceCreation(format!("CreateTexture2D ({label}) returned None"))
        })?;

        let mut srv: Option<ID3D11ShaderResourceView> = None;
        unsafe { device.CreateShaderResourceView(&tex, None, Some(&mut srv)) }
            .context(format!("CreateShaderResourceView ({label}) failed"))
            .map_err(FlowError::Platform)?;
        let srv = srv.ok_or_else(|| {
            FlowError::ResourceCreation(format!("CreateShaderResourceView ({label}) returned None"))
        })?;

        let mut uav: Option<ID3D11UnorderedAccessView> = None;
        unsafe { device.CreateUnorderedAccessView(&tex, None, Some(&mut uav)) }
            .context(format!("CreateUnorderedAccessView ({label}) failed"))
            .map_err(FlowError::Platform)?;
        let uav = uav.ok_or_else(|| {
            FlowError::ResourceCreation(format!("CreateUnorderedAccessView ({label}) returned None"))
        })?;

        Ok(Self {
            tex,
            srv,
            uav,
            width,
            height,
        })
    }
}

/// Dynamic constant buffer updated with map/discard before a dispatch.
pub(crate) struct ConstBuffer {
    buf: ID3D11Buffer,
    size: usize,
}

impl ConstBuffer {
    pub(crate) fn new<T: Copy>(device: &ID3D11Device, label: &str) -> FlowResult<Self> {
        let size = std::mem::size_of::<T>();
        debug_assert!(size % 16 == 0, "constant buffer size must be 16-byte aligned");
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: size as u32,
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_CONSTANT_BUFFER.0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            ..Default::default()
        };
        let mut buf: Option<ID3D11Buffer> = None;
        unsafe { device.CreateBuffer(&desc, None, Some(&mut buf)) }
            .context(format!("CreateBuffer ({label}) failed"))
            .map_err(FlowError::Platform)?;
        let buf = buf.ok_or_else(|| {
            FlowError::ResourceCreation(format!("CreateBuffer ({label}) returned None"))
        })?;
        Ok(Self { buf, size })
    }

    pub(crate) fn update<T: Copy>(
        &self,
        context: &ID3D11DeviceContext,
        value: &T,
    ) -> FlowResult<()> {
        debug_assert_eq!(std::mem::size_of::<T>(), self.size);
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe { context.Map(&self.buf, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped)) }
            .context("Map constant buffer failed")
            .map_err(FlowError::Platform)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                value as *const T as *const u8,
                mapped.pData as *mut u8,
                self.size,
            );
            context.Unmap(&self.buf, 0);
        }
        Ok(())
    }

    pub(crate) fn bind(&self, context: &ID3D11DeviceContext) {
        unsafe { context.CSSetConstantBuffers(0, Some(&[Some(self.buf.clone())])) };
    }
}

pub(crate) fn create_linear_sampler(device: &ID3D11Device) -> FlowResult<ID3D11SamplerState> {
    let desc = D3D11_SAMPLER_DESC {
        Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
        AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
        AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
        AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
        MinLOD: 0.0,
        MaxLOD: f32::MAX,
        ..Default::default()
    };
    let mut sampler: Option<ID3D11SamplerState> = None;
    unsafe { device.CreateSamplerState(&desc, Some(&mut sampler)) }
        .context("CreateSamplerState failed")
        .map_err(FlowError::Platform)?;
    sampler.ok_or_else(|| FlowError::ResourceCreation("CreateSamplerState returned None".into()))
}

/// Bind SRVs starting at t0. `None` entries clear their slot, so callers
/// pass the full slot layout of the entry point they dispatch.
pub(crate) fn bind_srvs(
    context: &ID3D11DeviceContext,
    srvs: &[Option<ID3D11ShaderResourceView>],
) {
    unsafe { context.CSSetShaderResources(0, Some(srvs)) };
}

/// Bind UAVs starting at u0.
pub(crate) fn bind_uavs(
    context: &ID3D11DeviceContext,
    uavs: &[Option<ID3D11UnorderedAccessView>],
) {
    unsafe {
        context.CSSetUnorderedAccessViews(0, uavs.len() as u32, Some(uavs.as_ptr()), None);
    }
}

pub(crate) fn bind_sampler(context: &ID3D11DeviceContext, sampler: &ID3D11SamplerState) {
    unsafe { context.CSSetSamplers(0, Some(&[Some(sampler.clone())])) };
}

/// Clear every binding a pipeline stage may have left behind. Dependent
/// stages read what the previous one wrote, and D3D11 refuses to bind a
/// texture as SRV while it is still bound as UAV.
pub(crate) fn unbind_all(context: &ID3D11DeviceContext, srv_count: usize, uav_count: usize) {
    let no_srvs: [Option<ID3D11ShaderResourceView>; 9] = Default::default();
    let no_uavs: [Option<ID3D11UnorderedAccessView>; 4] = Default::default();
    unsafe {
        context.CSSetShaderResources(0, Some(&no_srvs[..srv_count.min(no_srvs.len())]));
        let count = uav_count.min(no_uavs.len());
        context.CSSetUnorderedAccessViews(0, count as u32, Some(no_uavs.as_ptr()), None);
        context.CSSetShader(None, None);
    }
}
