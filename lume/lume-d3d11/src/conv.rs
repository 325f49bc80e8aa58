//! RHI descriptors to hardware descriptors.

use lume_rhi::{
    BorderColor, BufferDescriptor, BufferMemoryPreference, BufferUsage, ColorTargetState,
    CompareOp, CullMode, DepthStencilState, FilterMode, FrontFace, PolygonMode,
    RasterizationState, SamplerDescriptor, ShaderStages, TextureDescriptor, TextureDimension,
    TextureUsage, VertexInputDescriptor, VertexInputRate,
};

use crate::hw::{
    BindFlags, BlendDesc, CpuAccess, DepthStencilDesc, FillMode, HwBufferDesc, HwCullMode,
    HwStage, HwTextureDesc, InputElementDesc, RasterizerDesc, RenderTargetBlendDesc,
    ResourceUsage, SamplerDesc, SamplerFilter, MAX_RENDER_TARGETS,
};

/// Semantic every vertex attribute is exposed under by the shader cross-compiler.
pub const VERTEX_SEMANTIC: &str = "TEXCOORD";

pub fn rasterizer_desc(state: &RasterizationState) -> RasterizerDesc {
    RasterizerDesc {
        fill_mode: match state.polygon_mode {
            PolygonMode::Fill => FillMode::Solid,
            PolygonMode::Line => FillMode::Wireframe,
        },
        cull_mode: match state.cull_mode {
            CullMode::None => HwCullMode::None,
            CullMode::Front => HwCullMode::Front,
            CullMode::Back => HwCullMode::Back,
        },
        front_counter_clockwise: state.front_face == FrontFace::CounterClockwise,
        depth_bias: state.depth_bias,
        depth_bias_clamp: state.depth_bias_clamp,
        slope_scaled_depth_bias: state.depth_bias_slope_scale,
        depth_clip_enable: state.depth_clip_enable,
        scissor_enable: state.scissor_enable,
        multisample_enable: state.multisample_enable,
        antialiased_line_enable: false,
    }
}

/// `None` (no depth attachment) disables depth and stencil entirely.
pub fn depth_stencil_desc(state: Option<&DepthStencilState>) -> DepthStencilDesc {
    match state {
        Some(ds) => DepthStencilDesc {
            depth_enable: ds.depth_compare != CompareOp::Always || ds.depth_write_enabled,
            depth_write_enable: ds.depth_write_enabled,
            depth_func: ds.depth_compare,
            stencil_enable: ds.stencil.is_enabled(),
            stencil_read_mask: ds.stencil.read_mask,
            stencil_write_mask: ds.stencil.write_mask,
            front_face: ds.stencil.front,
            back_face: ds.stencil.back,
        },
        None => {
            let stencil = lume_rhi::StencilState::default();
            DepthStencilDesc {
                depth_enable: false,
                depth_write_enable: false,
                depth_func: CompareOp::Always,
                stencil_enable: false,
                stencil_read_mask: stencil.read_mask,
                stencil_write_mask: stencil.write_mask,
                front_face: stencil.front,
                back_face: stencil.back,
            }
        }
    }
}

pub fn blend_desc(targets: &[ColorTargetState], alpha_to_coverage: bool) -> BlendDesc {
    let mut desc = BlendDesc {
        alpha_to_coverage_enable: alpha_to_coverage,
        ..BlendDesc::default()
    };
    for (slot, target) in desc.render_targets.iter_mut().zip(targets.iter().take(MAX_RENDER_TARGETS)) {
        *slot = match target.blend {
            Some(blend) => RenderTargetBlendDesc {
                blend_enable: true,
                src_blend: blend.color.src_factor,
                dest_blend: blend.color.dst_factor,
                blend_op: blend.color.operation,
                src_blend_alpha: blend.alpha.src_factor,
                dest_blend_alpha: blend.alpha.dst_factor,
                blend_op_alpha: blend.alpha.operation,
                write_mask: target.write_mask.bits(),
            },
            None => RenderTargetBlendDesc {
                write_mask: target.write_mask.bits(),
                ..RenderTargetBlendDesc::default()
            },
        };
    }
    let first = desc.render_targets[0];
    desc.independent_blend_enable = desc.render_targets[1..targets.len().clamp(1, MAX_RENDER_TARGETS)]
        .iter()
        .any(|rt| *rt != first);
    desc
}

pub fn sampler_filter(desc: &SamplerDescriptor) -> SamplerFilter {
    let mut bits = if desc.anisotropy_clamp.is_some_and(|a| a > 1.0) {
        SamplerFilter::ANISOTROPIC
    } else {
        let mut bits = 0;
        if desc.min_filter == FilterMode::Linear {
            bits |= SamplerFilter::MIN_LINEAR;
        }
        if desc.mag_filter == FilterMode::Linear {
            bits |= SamplerFilter::MAG_LINEAR;
        }
        if desc.mipmap_filter == FilterMode::Linear {
            bits |= SamplerFilter::MIP_LINEAR;
        }
        bits
    };
    if desc.compare.is_some() {
        bits |= SamplerFilter::COMPARISON;
    }
    SamplerFilter(bits)
}

pub fn sampler_desc(desc: &SamplerDescriptor) -> SamplerDesc {
    SamplerDesc {
        filter: sampler_filter(desc),
        address_u: desc.address_mode_u,
        address_v: desc.address_mode_v,
        address_w: desc.address_mode_w,
        mip_lod_bias: desc.mip_lod_bias,
        max_anisotropy: desc.anisotropy_clamp.map_or(1, |a| a.clamp(1.0, 16.0) as u32),
        comparison_func: desc.compare.unwrap_or(CompareOp::Never),
        border_color: match desc.border_color {
            BorderColor::TransparentBlack => [0.0, 0.0, 0.0, 0.0],
            BorderColor::OpaqueBlack => [0.0, 0.0, 0.0, 1.0],
            BorderColor::OpaqueWhite => [1.0, 1.0, 1.0, 1.0],
        },
        min_lod: desc.lod_min_clamp,
        max_lod: desc.lod_max_clamp,
    }
}

/// Vertex attributes become `TEXCOORD<location>` elements fed from the attribute's binding slot.
pub fn input_elements(input: &VertexInputDescriptor) -> Vec<InputElementDesc> {
    let mut elements: Vec<InputElementDesc> = input
        .attributes
        .iter()
        .map(|attr| {
            let rate = input
                .bindings
                .iter()
                .find(|b| b.binding == attr.binding)
                .map(|b| b.input_rate)
                .unwrap_or(VertexInputRate::Vertex);
            let (per_instance, instance_data_step_rate) = match rate {
                VertexInputRate::Vertex => (false, 0),
                VertexInputRate::Instance { step_rate } => (true, step_rate.max(1)),
            };
            InputElementDesc {
                semantic_name: VERTEX_SEMANTIC.to_string(),
                semantic_index: attr.location,
                format: attr.format,
                input_slot: attr.binding,
                aligned_byte_offset: attr.offset,
                per_instance,
                instance_data_step_rate,
            }
        })
        .collect();
    elements.sort_by_key(|e| e.semantic_index);
    elements
}

/// Hardware stages covered by an RHI stage mask.
pub fn hw_stages(stages: ShaderStages) -> impl Iterator<Item = HwStage> {
    HwStage::ALL
        .into_iter()
        .filter(move |stage| stages.contains(rhi_stage(*stage)))
}

pub fn rhi_stage(stage: HwStage) -> ShaderStages {
    match stage {
        HwStage::Vertex => ShaderStages::VERTEX,
        HwStage::Pixel => ShaderStages::FRAGMENT,
        HwStage::Geometry => ShaderStages::GEOMETRY,
        HwStage::Hull => ShaderStages::TESS_CONTROL,
        HwStage::Domain => ShaderStages::TESS_EVALUATION,
        HwStage::Compute => ShaderStages::COMPUTE,
    }
}

pub fn buffer_desc(desc: &BufferDescriptor) -> HwBufferDesc {
    let mut bind = BindFlags::empty();
    if desc.usage.contains(BufferUsage::VERTEX) {
        bind |= BindFlags::VERTEX_BUFFER;
    }
    if desc.usage.contains(BufferUsage::INDEX) {
        bind |= BindFlags::INDEX_BUFFER;
    }
    if desc.usage.contains(BufferUsage::UNIFORM) {
        bind |= BindFlags::CONSTANT_BUFFER;
    }
    if desc.usage.contains(BufferUsage::STORAGE) {
        bind |= BindFlags::SHADER_RESOURCE;
        if desc.memory == BufferMemoryPreference::DeviceLocal {
            bind |= BindFlags::UNORDERED_ACCESS;
        }
    }
    let (usage, cpu_access) = match desc.memory {
        BufferMemoryPreference::HostVisible => (ResourceUsage::Dynamic, CpuAccess::WRITE),
        BufferMemoryPreference::DeviceLocal => (ResourceUsage::Default, CpuAccess::empty()),
        BufferMemoryPreference::Readback => {
            (ResourceUsage::Staging, CpuAccess::READ | CpuAccess::WRITE)
        }
    };
    // Staging resources cannot be bound to the pipeline.
    if usage == ResourceUsage::Staging {
        bind = BindFlags::empty();
    }
    // Dynamic resources cannot be written by the GPU.
    if usage == ResourceUsage::Dynamic {
        bind.remove(BindFlags::UNORDERED_ACCESS);
    }
    HwBufferDesc {
        byte_width: desc.size,
        usage,
        bind,
        cpu_access,
        structure_byte_stride: desc.stride,
        indirect_args: desc.usage.contains(BufferUsage::INDIRECT),
    }
}

pub fn texture_desc(desc: &TextureDescriptor) -> HwTextureDesc {
    let mut bind = BindFlags::empty();
    if desc.usage.contains(TextureUsage::TEXTURE_BINDING) {
        bind |= BindFlags::SHADER_RESOURCE;
    }
    if desc.usage.contains(TextureUsage::STORAGE_BINDING) {
        bind |= BindFlags::UNORDERED_ACCESS;
    }
    if desc.usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        bind |= if desc.format.is_depth() {
            BindFlags::DEPTH_STENCIL
        } else {
            BindFlags::RENDER_TARGET
        };
    }
    let (width, height, depth) = desc.size;
    HwTextureDesc {
        dimension: desc.dimension,
        width: width.max(1),
        height: height.max(1),
        depth_or_layers: match desc.dimension {
            TextureDimension::Cube => 6,
            _ => depth.max(1),
        },
        mip_levels: desc.mip_level_count.max(1),
        format: desc.format,
        usage: ResourceUsage::Default,
        bind,
        cpu_access: CpuAccess::empty(),
    }
}

/// CPU-readable copy of `desc`, used for texture read-back.
pub fn staging_texture_desc(desc: &HwTextureDesc) -> HwTextureDesc {
    HwTextureDesc {
        usage: ResourceUsage::Staging,
        bind: BindFlags::empty(),
        cpu_access: CpuAccess::READ,
        ..desc.clone()
    }
}

/// Flat sub-resource index for (mip, layer).
pub fn subresource_index(mip_level: u32, array_layer: u32, mip_levels: u32) -> u32 {
    mip_level + array_layer * mip_levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use lume_rhi::{
        BlendComponent, BlendState, ColorWrites, TextureFormat, VertexAttribute, VertexBinding,
        VertexFormat,
    };

    #[test]
    fn sampler_filter_encoding() {
        let linear = SamplerDescriptor {
            mipmap_filter: FilterMode::Linear,
            ..Default::default()
        };
        assert_eq!(sampler_filter(&linear), SamplerFilter(0x15));

        let point = SamplerDescriptor {
            min_filter: FilterMode::Nearest,
            mag_filter: FilterMode::Nearest,
            ..Default::default()
        };
        assert_eq!(sampler_filter(&point), SamplerFilter(0));

        let shadow = SamplerDescriptor {
            anisotropy_clamp: Some(8.0),
            compare: Some(CompareOp::LessOrEqual),
            ..Default::default()
        };
        assert_eq!(sampler_filter(&shadow), SamplerFilter(0xd5));
        assert_eq!(sampler_desc(&shadow).max_anisotropy, 8);
    }

    #[test]
    fn input_elements_use_location_semantics() {
        let input = VertexInputDescriptor {
            attributes: vec![
                VertexAttribute { location: 1, binding: 1, format: VertexFormat::Float32x4, offset: 0 },
                VertexAttribute { location: 0, binding: 0, format: VertexFormat::Float32x3, offset: 0 },
            ],
            bindings: vec![
                VertexBinding { binding: 0, stride: 12, input_rate: VertexInputRate::Vertex },
                VertexBinding { binding: 1, stride: 16, input_rate: VertexInputRate::Instance { step_rate: 1 } },
            ],
        };
        let elements = input_elements(&input);
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].semantic_index, 0);
        assert!(!elements[0].per_instance);
        assert_eq!(elements[1].semantic_name, "TEXCOORD");
        assert_eq!(elements[1].input_slot, 1);
        assert!(elements[1].per_instance);
        assert_eq!(elements[1].instance_data_step_rate, 1);
    }

    #[test]
    fn blend_desc_marks_independent_targets() {
        let alpha = BlendState {
            color: BlendComponent {
                src_factor: lume_rhi::BlendFactor::SrcAlpha,
                dst_factor: lume_rhi::BlendFactor::OneMinusSrcAlpha,
                operation: lume_rhi::BlendOp::Add,
            },
            alpha: BlendComponent::REPLACE,
        };
        let same = vec![
            ColorTargetState { format: TextureFormat::Rgba8Unorm, blend: Some(alpha), write_mask: ColorWrites::ALL },
            ColorTargetState { format: TextureFormat::Rgba8Unorm, blend: Some(alpha), write_mask: ColorWrites::ALL },
        ];
        assert!(!blend_desc(&same, false).independent_blend_enable);

        let mixed = vec![
            ColorTargetState { format: TextureFormat::Rgba8Unorm, blend: Some(alpha), write_mask: ColorWrites::ALL },
            ColorTargetState { format: TextureFormat::Rgba8Unorm, blend: None, write_mask: ColorWrites::ALL },
        ];
        let desc = blend_desc(&mixed, false);
        assert!(desc.independent_blend_enable);
        assert!(desc.render_targets[0].blend_enable);
        assert!(!desc.render_targets[1].blend_enable);
    }

    #[test]
    fn host_visible_storage_is_not_writable_by_gpu() {
        let desc = buffer_desc(&BufferDescriptor {
            size: 64,
            usage: BufferUsage::STORAGE,
            memory: BufferMemoryPreference::HostVisible,
            ..Default::default()
        });
        assert_eq!(desc.usage, ResourceUsage::Dynamic);
        assert!(desc.bind.contains(BindFlags::SHADER_RESOURCE));
        assert!(!desc.bind.contains(BindFlags::UNORDERED_ACCESS));
    }
}
