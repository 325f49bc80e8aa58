//! Records one frame on the null hardware backend and prints what the driver saw.
//!
//! `LUME_D3D11_THREADING=deferred` records on a deferred context; `RUST_LOG=debug` shows the
//! backend's own logging.

use std::sync::Arc;

use lume_d3d11::hw::HwStage;
use lume_d3d11::null::NullDevice;
use lume_d3d11::{
    ColorAttachment, D3D11Config, D3D11Device, DescriptorBinding, DescriptorResource,
    GraphicsPipelineDescriptor, PipelineLayoutDescriptor, RenderPassDescriptor,
};
use lume_rhi::{
    BufferDescriptor, BufferMemoryPreference, BufferUsage, ClearColor, ColorTargetState,
    ColorWrites, DescriptorSetLayoutBinding, DescriptorType, LoadOp, PrimitiveTopology, QueryType,
    RasterizationState, ShaderStages, StoreOp, TextureDescriptor, TextureFormat, TextureUsage,
    VertexAttribute, VertexBinding, VertexFormat, VertexInputDescriptor, VertexInputRate, Viewport,
};

const SHADER_BYTES: &[u8] = &[0x44, 0x58, 0x42, 0x43];

fn main() -> Result<(), String> {
    env_logger::init();
    let null = NullDevice::default();
    let device = D3D11Device::new(Arc::new(null.clone()), D3D11Config::from_env()).map_err(|e| e.to_string())?;
    frame(&device).map_err(|e| e.to_string())?;

    for command in null.commands() {
        println!("{:?}", command);
    }
    let stats = device.state_cache_stats();
    println!(
        "null_frame: {} state objects, {} cache hits, {:?}",
        stats.total_objects(),
        stats.hits,
        device.diagnostics().snapshot()
    );
    Ok(())
}

fn frame(device: &D3D11Device) -> lume_d3d11::Result<()> {
    let set_layout = device.create_descriptor_set_layout(&[DescriptorSetLayoutBinding {
        binding: 0,
        descriptor_type: DescriptorType::UniformBuffer,
        count: 1,
        stages: ShaderStages::VERTEX,
    }]);
    let layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
        label: Some("frame layout"),
        set_layouts: vec![Arc::clone(&set_layout)],
        push_constant_size: 16,
    })?;
    let pipeline = device.create_graphics_pipeline(&GraphicsPipelineDescriptor {
        label: Some("triangle"),
        layout: Arc::clone(&layout),
        vertex_shader: device.create_shader(HwStage::Vertex, SHADER_BYTES)?,
        fragment_shader: Some(device.create_shader(HwStage::Pixel, SHADER_BYTES)?),
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
    })?;

    let vertices: [f32; 9] = [0.0, 0.5, 0.0, -0.5, -0.5, 0.0, 0.5, -0.5, 0.0];
    let vertex_buffer = device.create_buffer(
        &BufferDescriptor {
            label: Some("triangle vertices"),
            size: 36,
            usage: BufferUsage::VERTEX,
            memory: BufferMemoryPreference::DeviceLocal,
            stride: 0,
        },
        Some(bytemuck::cast_slice(&vertices)),
    )?;
    let identity: [f32; 16] = [
        1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0,
    ];
    let camera = device.create_buffer(
        &BufferDescriptor {
            label: Some("camera"),
            size: 64,
            usage: BufferUsage::UNIFORM,
            memory: BufferMemoryPreference::HostVisible,
            stride: 0,
        },
        None,
    )?;
    device.write_buffer(&camera, 0, bytemuck::cast_slice(&identity))?;
    let set = device.create_descriptor_set(&set_layout);
    set.update([DescriptorBinding {
        binding: 0,
        kind: DescriptorType::UniformBuffer,
        resource: DescriptorResource::buffer(&camera),
    }]);

    let target = device.create_texture(&TextureDescriptor {
        label: Some("backbuffer"),
        size: (800, 600, 1),
        format: TextureFormat::Rgba8Unorm,
        usage: TextureUsage::RENDER_ATTACHMENT,
        ..TextureDescriptor::default()
    })?;
    let occlusion = device.create_query_pool(QueryType::Occlusion, 1)?;
    let results = device.create_buffer(
        &BufferDescriptor {
            label: Some("occlusion results"),
            size: 8,
            usage: BufferUsage::COPY_DST,
            memory: BufferMemoryPreference::Readback,
            stride: 0,
        },
        None,
    )?;

    let mut ctx = device.create_command_context()?;
    ctx.begin();
    ctx.begin_debug_marker("frame");
    ctx.begin_render_pass(&RenderPassDescriptor {
        label: Some("main"),
        color_attachments: vec![ColorAttachment {
            texture: &target,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            clear_value: Some(ClearColor::BLACK),
        }],
        depth_stencil_attachment: None,
    });
    ctx.set_viewports(&[Viewport {
        x: 0.0,
        y: 0.0,
        width: 800.0,
        height: 600.0,
        min_depth: 0.0,
        max_depth: 1.0,
    }]);
    ctx.set_graphics_pipeline(&pipeline);
    ctx.set_descriptor_set(0, &set, &[]);
    ctx.set_push_constants(0, bytemuck::cast_slice(&[1.0f32, 0.5, 0.25, 1.0]));
    ctx.set_vertex_buffers(0, &[(&vertex_buffer, 0)]);
    ctx.begin_query(&occlusion, 0);
    ctx.draw(3, 1, 0, 0);
    ctx.end_query(&occlusion, 0);
    ctx.end_render_pass();
    ctx.end_debug_marker();
    ctx.end()?;
    ctx.submit()?;

    ctx.begin();
    ctx.resolve_queries(&occlusion, 0, 1, &results, 0)?;
    ctx.end()?;
    let samples = device.read_buffer(&results, 0, 8)?;
    log::info!("occlusion samples: {:?}", samples);
    if let Some(report) = device.check_device_lost() {
        log::error!("{}", report);
    }
    Ok(())
}
