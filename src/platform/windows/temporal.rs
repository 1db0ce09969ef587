//! Temporal stabilization of the motion/confidence field.
//!
//! Ping-pongs two field pairs at luma resolution: each frame reads the
//! previous stabilized result and writes the other pair (`write =
//! 1 - read`, plain index arithmetic). The validity flag is the
//! load-bearing part: after a resize or a source-pair change the next
//! pass must run with the reset flag raised and pass the smoothed field
//! through untouched — blending with another pair's history is how
//! ghosting artifacts happen.

use windows::Win32::Graphics::Direct3D11::{
    ID3D11Device, ID3D11DeviceContext, ID3D11SamplerState, ID3D11ShaderResourceView,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_R16G16_FLOAT, DXGI_FORMAT_R16_FLOAT};

use super::compute::{
    bind_sampler, bind_srvs, bind_uavs, dispatch_size, unbind_all, ComputePass, ConstBuffer,
    FieldTexture,
};
use super::pipeline::FlowConstants;
use super::shaders;
use crate::error::FlowResult;

struct TemporalFields {
    motion: [FieldTexture; 2],
    conf: [FieldTexture; 2],
}

pub(crate) struct TemporalStabilizer {
    pass: ComputePass,
    fields: Option<TemporalFields>,
    read_index: usize,
    valid: bool,
}

impl TemporalStabilizer {
    pub(crate) fn new(device: &ID3D11Device) -> FlowResult<Self> {
        Ok(Self {
            pass: ComputePass::new(device, shaders::motion_temporal(), "motion_temporal")?,
            fields: None,
            read_index: 0,
            valid: false,
        })
    }

    /// (Re)allocate the ping-pong pairs at the given luma resolution.
    pub(crate) fn allocate(&mut self, device: &ID3D11Device, width: u32, height: u32) -> FlowResult<()> {
        self.fields = None;
        self.invalidate();
        let make_motion = |label: &str| {
            FieldTexture::new(device, width, height, DXGI_FORMAT_R16G16_FLOAT, label)
        };
        let make_conf =
            |label: &str| FieldTexture::new(device, width, height, DXGI_FORMAT_R16_FLOAT, label);
        self.fields = Some(TemporalFields {
            motion: [make_motion("temporal motion 0")?, make_motion("temporal motion 1")?],
            conf: [make_conf("temporal conf 0")?, make_conf("temporal conf 1")?],
        });
        Ok(())
    }

    /// Mark the running state stale. The next `stabilize` call resets
    /// rather than blends.
    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
        self.read_index = 0;
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid
    }

    /// Run one stabilization pass over the smoothed field and return the
    /// stabilized (motion, confidence) views. `constants` arrives with
    /// the tunables and dimensions filled in; the reset flag is owned
    /// here so no caller can forget to raise it after an invalidation.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn stabilize(
        &mut self,
        context: &ID3D11DeviceContext,
        cbuf: &ConstBuffer,
        mut constants: FlowConstants,
        smooth_motion: &ID3D11ShaderResourceView,
        smooth_conf: &ID3D11ShaderResourceView,
        prev_luma: &ID3D11ShaderResourceView,
        curr_luma: &ID3D11ShaderResourceView,
        sampler: &ID3D11SamplerState,
    ) -> FlowResult<Option<(ID3D11ShaderResourceView, ID3D11ShaderResourceView)>> {
        let Some(fields) = self.fields.as_ref() else {
            return Ok(None);
        };
        let read = self.read_index;
        let write = 1 - read;
        let width = fields.motion[write].width;
        let height = fields.motion[write].height;

        constants.reset_history = if self.valid { 0 } else { 1 };
        constants.dst_width = width;
        constants.dst_height = height;
        cbuf.update(context, &constants)?;

        self.pass.bind(context);
        cbuf.bind(context);
        bind_sampler(context, sampler);
        bind_srvs(
            context,
            &[
                None,
                None,
                Some(smooth_motion.clone()),
                Some(smooth_conf.clone()),
                Some(prev_luma.clone()),
                Some(curr_luma.clone()),
                Some(fields.motion[read].srv.clone()),
                Some(fields.conf[read].srv.clone()),
            ],
        );
        bind_uavs(
            context,
            &[
                None,
                Some(fields.motion[write].uav.clone()),
                Some(fields.conf[write].uav.clone()),
            ],
        );
        unsafe { context.Dispatch(dispatch_size(width), dispatch_size(height), 1) };
        unbind_all(context, 8, 3);

        self.read_index = write;
        self.valid = true;
        Ok(Some((
            fields.motion[write].srv.clone(),
            fields.conf[write].srv.clone(),
        )))
    }
}
