//! Pipeline layouts, graphics and compute pipelines.
//!
//! A pipeline is a bundle of shader handles plus state objects taken from the
//! [`StateObjectCache`]; binding it is a handful of slot writes. Push constants are emulated with
//! one dynamic constant buffer per layout, bound at [`PUSH_CONSTANT_SLOT`]. The block's contents
//! live in each command context, never on the layout.
//!
//! [`PUSH_CONSTANT_SLOT`]: crate::binding::PUSH_CONSTANT_SLOT

use std::sync::Arc;

use lume_rhi::{
    ColorTargetState, DepthStencilState, PrimitiveTopology, RasterizationState,
    VertexInputDescriptor,
};

use crate::binding::MAX_DESCRIPTOR_SETS;
use crate::conv;
use crate::descriptor::DescriptorSetLayout;
use crate::error::{Error, ObjectKind, Result};
use crate::hw::{
    BindFlags, BlendStateHandle, BufferHandle, CpuAccess, DepthStencilStateHandle, HwBufferDesc,
    HwDevice, HwObject, HwStage, InputLayoutHandle, RasterizerStateHandle, ResourceUsage,
};
use crate::resource::D3D11Shader;
use crate::state_cache::StateObjectCache;

#[derive(Debug, Clone, Default)]
pub struct PipelineLayoutDescriptor {
    pub label: Option<&'static str>,
    /// Index in this list = set index.
    pub set_layouts: Vec<Arc<DescriptorSetLayout>>,
    /// Bytes of push-constant data. Rounded up to 16.
    pub push_constant_size: u32,
}

pub struct PipelineLayout {
    device: Arc<dyn HwDevice>,
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    push_constant_size: u32,
    push_constant_buffer: Option<BufferHandle>,
}

impl PipelineLayout {
    pub(crate) fn new(device: Arc<dyn HwDevice>, desc: &PipelineLayoutDescriptor) -> Result<Self> {
        if desc.set_layouts.len() > MAX_DESCRIPTOR_SETS {
            log::warn!(
                "pipeline layout {:?}: {} set layouts, only the first {} are addressable",
                desc.label,
                desc.set_layouts.len(),
                MAX_DESCRIPTOR_SETS
            );
        }
        let size = desc.push_constant_size.div_ceil(16).checked_mul(16).ok_or_else(|| {
            Error::creation(
                ObjectKind::Buffer,
                format!("{}-byte push-constant block", desc.push_constant_size),
            )
        })?;
        let push_constant_buffer = if size > 0 {
            let buffer = device.create_buffer(
                &HwBufferDesc {
                    byte_width: u64::from(size),
                    usage: ResourceUsage::Dynamic,
                    bind: BindFlags::CONSTANT_BUFFER,
                    cpu_access: CpuAccess::WRITE,
                    structure_byte_stride: 0,
                    indirect_args: false,
                },
                None,
            )?;
            Some(buffer)
        } else {
            None
        };
        Ok(Self {
            device,
            set_layouts: desc.set_layouts.clone(),
            push_constant_size: size,
            push_constant_buffer,
        })
    }

    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }

    pub fn set_layout(&self, index: u32) -> Option<&Arc<DescriptorSetLayout>> {
        self.set_layouts.get(index as usize)
    }

    /// Size of the push-constant block after rounding, 0 when the layout has none.
    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }

    pub fn push_constant_buffer(&self) -> Option<BufferHandle> {
        self.push_constant_buffer
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        if let Some(buffer) = self.push_constant_buffer {
            self.device.release(HwObject::Buffer(buffer));
        }
    }
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("sets", &self.set_layouts.len())
            .field("push_constant_size", &self.push_constant_size())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineDescriptor {
    pub label: Option<&'static str>,
    pub layout: Arc<PipelineLayout>,
    pub vertex_shader: Arc<D3D11Shader>,
    pub fragment_shader: Option<Arc<D3D11Shader>>,
    pub geometry_shader: Option<Arc<D3D11Shader>>,
    pub vertex_input: VertexInputDescriptor,
    pub primitive_topology: PrimitiveTopology,
    pub rasterization: RasterizationState,
    pub color_targets: Vec<ColorTargetState>,
    pub depth_stencil: Option<DepthStencilState>,
    pub alpha_to_coverage: bool,
}

#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor {
    pub label: Option<&'static str>,
    pub layout: Arc<PipelineLayout>,
    pub shader: Arc<D3D11Shader>,
}

pub struct GraphicsPipeline {
    pub(crate) layout: Arc<PipelineLayout>,
    pub(crate) vertex_shader: Arc<D3D11Shader>,
    pub(crate) fragment_shader: Option<Arc<D3D11Shader>>,
    pub(crate) geometry_shader: Option<Arc<D3D11Shader>>,
    pub(crate) input_layout: Option<InputLayoutHandle>,
    pub(crate) topology: PrimitiveTopology,
    pub(crate) rasterizer: RasterizerStateHandle,
    pub(crate) depth_stencil: DepthStencilStateHandle,
    pub(crate) blend: BlendStateHandle,
    /// `(binding, stride)` of each vertex buffer binding.
    pub(crate) vertex_strides: Vec<(u32, u32)>,
}

impl GraphicsPipeline {
    pub(crate) fn new(cache: &StateObjectCache, desc: &GraphicsPipelineDescriptor) -> Result<Self> {
        let stage_mismatch = |shader: &D3D11Shader, expected: HwStage| {
            (shader.stage() != expected).then(|| {
                Error::creation(
                    ObjectKind::Shader,
                    format!("{:?} shader bound as {:?}", shader.stage(), expected),
                )
            })
        };
        if let Some(e) = stage_mismatch(&desc.vertex_shader, HwStage::Vertex) {
            return Err(e);
        }
        if let Some(e) = desc
            .fragment_shader
            .as_deref()
            .and_then(|s| stage_mismatch(s, HwStage::Pixel))
        {
            return Err(e);
        }
        if let Some(e) = desc
            .geometry_shader
            .as_deref()
            .and_then(|s| stage_mismatch(s, HwStage::Geometry))
        {
            return Err(e);
        }

        let elements = conv::input_elements(&desc.vertex_input);
        let input_layout = if elements.is_empty() {
            None
        } else {
            Some(cache.input_layout(&elements, desc.vertex_shader.bytecode())?)
        };
        let rasterizer = cache.rasterizer_state(&conv::rasterizer_desc(&desc.rasterization))?;
        let depth_stencil =
            cache.depth_stencil_state(&conv::depth_stencil_desc(desc.depth_stencil.as_ref()))?;
        let blend = cache.blend_state(&conv::blend_desc(&desc.color_targets, desc.alpha_to_coverage))?;
        log::debug!("created graphics pipeline {:?}", desc.label);
        Ok(Self {
            layout: Arc::clone(&desc.layout),
            vertex_shader: Arc::clone(&desc.vertex_shader),
            fragment_shader: desc.fragment_shader.clone(),
            geometry_shader: desc.geometry_shader.clone(),
            input_layout,
            topology: desc.primitive_topology,
            rasterizer,
            depth_stencil,
            blend,
            vertex_strides: desc
                .vertex_input
                .bindings
                .iter()
                .map(|b| (b.binding, b.stride))
                .collect(),
        })
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn input_layout(&self) -> Option<InputLayoutHandle> {
        self.input_layout
    }

    pub fn rasterizer_state(&self) -> RasterizerStateHandle {
        self.rasterizer
    }

    pub fn depth_stencil_state(&self) -> DepthStencilStateHandle {
        self.depth_stencil
    }

    pub fn blend_state(&self) -> BlendStateHandle {
        self.blend
    }

    pub(crate) fn vertex_stride(&self, binding: u32) -> u32 {
        self.vertex_strides
            .iter()
            .find(|(b, _)| *b == binding)
            .map_or(0, |(_, stride)| *stride)
    }
}

impl std::fmt::Debug for GraphicsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPipeline").finish()
    }
}

pub struct ComputePipeline {
    pub(crate) layout: Arc<PipelineLayout>,
    pub(crate) shader: Arc<D3D11Shader>,
}

impl ComputePipeline {
    pub(crate) fn new(desc: &ComputePipelineDescriptor) -> Result<Self> {
        if desc.shader.stage() != HwStage::Compute {
            return Err(Error::creation(
                ObjectKind::Shader,
                format!("{:?} shader bound as compute", desc.shader.stage()),
            ));
        }
        log::debug!("created compute pipeline {:?}", desc.label);
        Ok(Self {
            layout: Arc::clone(&desc.layout),
            shader: Arc::clone(&desc.shader),
        })
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline").finish()
    }
}
