//! Shared helpers for `lume-d3d11` integration tests: a device over the recording null backend.

#![allow(dead_code)]

use std::sync::Arc;

use lume_d3d11::hw::HwStage;
use lume_d3d11::null::{HwCommand, NullDevice};
use lume_d3d11::{
    ComputePipeline, ComputePipelineDescriptor, D3D11Buffer, D3D11Config, D3D11Device,
    GraphicsPipeline, GraphicsPipelineDescriptor, PipelineLayout, PipelineLayoutDescriptor,
};
use lume_rhi::{
    BufferDescriptor, BufferMemoryPreference, BufferUsage, ColorTargetState, ColorWrites,
    DescriptorSetLayoutBinding, DescriptorType, PrimitiveTopology, RasterizationState,
    ShaderStages, TextureFormat, VertexAttribute, VertexBinding, VertexFormat,
    VertexInputDescriptor, VertexInputRate,
};

/// Stand-in bytecode; the null backend only checks it is non-empty.
pub const SHADER_BYTES: &[u8] = &[0x44, 0x58, 0x42, 0x43];

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Harness {
    pub null: NullDevice,
    pub device: D3D11Device,
}

pub fn harness() -> Harness {
    harness_with(NullDevice::default(), D3D11Config::default())
}

pub fn harness_with(null: NullDevice, config: D3D11Config) -> Harness {
    init_logger();
    let device = D3D11Device::new(Arc::new(null.clone()), config).expect("null device");
    Harness { null, device }
}

pub fn deferred_config() -> D3D11Config {
    D3D11Config {
        threading: lume_d3d11::ThreadingMode::Deferred,
        ..D3D11Config::default()
    }
}

pub fn buffer(
    device: &D3D11Device,
    size: u64,
    usage: BufferUsage,
    memory: BufferMemoryPreference,
) -> Arc<D3D11Buffer> {
    device
        .create_buffer(
            &BufferDescriptor {
                label: Some("test buffer"),
                size,
                usage,
                memory,
                stride: 0,
            },
            None,
        )
        .expect("buffer")
}

pub fn readback(device: &D3D11Device, size: u64) -> Arc<D3D11Buffer> {
    buffer(device, size, BufferUsage::COPY_DST, BufferMemoryPreference::Readback)
}

pub fn layout_binding(binding: u32, descriptor_type: DescriptorType, stages: ShaderStages) -> DescriptorSetLayoutBinding {
    DescriptorSetLayoutBinding {
        binding,
        descriptor_type,
        count: 1,
        stages,
    }
}

pub fn pipeline_layout(device: &D3D11Device, push_constant_size: u32) -> Arc<PipelineLayout> {
    device
        .create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("test layout"),
            set_layouts: Vec::new(),
            push_constant_size,
        })
        .expect("pipeline layout")
}

pub fn graphics_pipeline(device: &D3D11Device, layout: &Arc<PipelineLayout>) -> Arc<GraphicsPipeline> {
    let desc = GraphicsPipelineDescriptor {
        label: Some("test pipeline"),
        layout: Arc::clone(layout),
        vertex_shader: device.create_shader(HwStage::Vertex, SHADER_BYTES).expect("vs"),
        fragment_shader: Some(device.create_shader(HwStage::Pixel, SHADER_BYTES).expect("ps")),
        geometry_shader: None,
        vertex_input: VertexInputDescriptor {
            attributes: vec![VertexAttribute {
                location: 0,
                binding: 0,
                format: VertexFormat::Float32x3,
                offset: 0,
            }],
            bindings: vec![VertexBinding {
                binding: 0,
                stride: 12,
                input_rate: VertexInputRate::Vertex,
            }],
        },
        primitive_topology: PrimitiveTopology::TriangleList,
        rasterization: RasterizationState::default(),
        color_targets: vec![ColorTargetState {
            format: TextureFormat::Rgba8Unorm,
            blend: None,
            write_mask: ColorWrites::ALL,
        }],
        depth_stencil: None,
        alpha_to_coverage: false,
    };
    device.create_graphics_pipeline(&desc).expect("graphics pipeline")
}

pub fn compute_pipeline(device: &D3D11Device, layout: &Arc<PipelineLayout>) -> Arc<ComputePipeline> {
    device
        .create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("test compute"),
            layout: Arc::clone(layout),
            shader: device.create_shader(HwStage::Compute, SHADER_BYTES).expect("cs"),
        })
        .expect("compute pipeline")
}

pub fn draws(commands: &[HwCommand]) -> Vec<HwCommand> {
    commands.iter().filter(|c| c.is_draw()).cloned().collect()
}
