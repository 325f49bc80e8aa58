mod common;

use std::sync::Arc;

use common::*;
use lume_d3d11::hw::{ConstantBufferBinding, DeviceCaps, HwStage};
use lume_d3d11::null::{HwCommand, NullDevice};
use lume_d3d11::{CommandContext, D3D11Config, DescriptorBinding, DescriptorResource, DescriptorSet};
use lume_rhi::{
    BufferMemoryPreference, BufferUsage, DescriptorSetLayoutBinding, DescriptorType,
    SamplerDescriptor, ShaderStages, TextureDescriptor, TextureUsage,
};
use pretty_assertions::assert_eq;

fn set_with(h: &Harness, layout: &[DescriptorSetLayoutBinding], bindings: Vec<DescriptorBinding>) -> Arc<DescriptorSet> {
    let layout = h.device.create_descriptor_set_layout(layout);
    let set = h.device.create_descriptor_set(&layout);
    set.update(bindings);
    set
}

/// Commands the next draw issues before drawing.
fn graphics_binds(h: &Harness, sets: &[(u32, &Arc<DescriptorSet>, &[u32])]) -> Vec<HwCommand> {
    let layout = pipeline_layout(&h.device, 0);
    let pipeline = graphics_pipeline(&h.device, &layout);
    let mut ctx = h.device.create_command_context().unwrap();
    ctx.begin();
    ctx.set_graphics_pipeline(&pipeline);
    bind_and_flush(h, &mut ctx, sets, |ctx| ctx.draw(3, 1, 0, 0))
}

fn compute_binds(h: &Harness, sets: &[(u32, &Arc<DescriptorSet>, &[u32])]) -> Vec<HwCommand> {
    let layout = pipeline_layout(&h.device, 0);
    let pipeline = compute_pipeline(&h.device, &layout);
    let mut ctx = h.device.create_command_context().unwrap();
    ctx.begin();
    ctx.set_compute_pipeline(&pipeline);
    bind_and_flush(h, &mut ctx, sets, |ctx| ctx.dispatch(1, 1, 1))
}

fn bind_and_flush(
    h: &Harness,
    ctx: &mut CommandContext,
    sets: &[(u32, &Arc<DescriptorSet>, &[u32])],
    flush: impl FnOnce(&mut CommandContext),
) -> Vec<HwCommand> {
    for (index, set, offsets) in sets {
        ctx.set_descriptor_set(*index, set, offsets);
    }
    h.null.take_commands();
    flush(ctx);
    h.null
        .take_commands()
        .into_iter()
        .filter(|c| !c.is_draw() && !matches!(c, HwCommand::Dispatch { .. }))
        .collect()
}

#[test]
fn uniform_buffers_land_in_the_set_range() {
    let h = harness();
    let ubo = buffer(&h.device, 64, BufferUsage::UNIFORM, BufferMemoryPreference::HostVisible);
    let set = set_with(
        &h,
        &[layout_binding(1, DescriptorType::UniformBuffer, ShaderStages::VERTEX)],
        vec![DescriptorBinding {
            binding: 1,
            kind: DescriptorType::UniformBuffer,
            resource: DescriptorResource::buffer(&ubo),
        }],
    );

    assert_eq!(
        graphics_binds(&h, &[(2, &set, &[])]),
        vec![HwCommand::SetConstantBuffer {
            stage: HwStage::Vertex,
            slot: 9,
            binding: Some(ConstantBufferBinding::whole(ubo.handle())),
        }]
    );
}

#[test]
fn bindings_past_the_set_range_are_skipped() {
    let h = harness();
    let ubo = buffer(&h.device, 64, BufferUsage::UNIFORM, BufferMemoryPreference::HostVisible);
    // Set 3 holds a single constant buffer slot.
    let set = set_with(
        &h,
        &[layout_binding(1, DescriptorType::UniformBuffer, ShaderStages::VERTEX)],
        vec![DescriptorBinding {
            binding: 1,
            kind: DescriptorType::UniformBuffer,
            resource: DescriptorResource::buffer(&ubo),
        }],
    );
    assert!(graphics_binds(&h, &[(3, &set, &[])]).is_empty());
}

#[test]
fn bindings_missing_from_the_layout_are_skipped() {
    let h = harness();
    let a = buffer(&h.device, 16, BufferUsage::UNIFORM, BufferMemoryPreference::HostVisible);
    let b = buffer(&h.device, 16, BufferUsage::UNIFORM, BufferMemoryPreference::HostVisible);
    let set = set_with(
        &h,
        &[layout_binding(0, DescriptorType::UniformBuffer, ShaderStages::FRAGMENT)],
        vec![
            DescriptorBinding {
                binding: 0,
                kind: DescriptorType::UniformBuffer,
                resource: DescriptorResource::buffer(&a),
            },
            DescriptorBinding {
                binding: 2,
                kind: DescriptorType::UniformBuffer,
                resource: DescriptorResource::buffer(&b),
            },
        ],
    );

    assert_eq!(
        graphics_binds(&h, &[(0, &set, &[])]),
        vec![HwCommand::SetConstantBuffer {
            stage: HwStage::Pixel,
            slot: 0,
            binding: Some(ConstantBufferBinding::whole(a.handle())),
        }]
    );
}

#[test]
fn writable_storage_buffers_bind_as_uav_in_compute() {
    let h = harness();
    let storage = buffer(&h.device, 256, BufferUsage::STORAGE, BufferMemoryPreference::DeviceLocal);
    let set = set_with(
        &h,
        &[layout_binding(1, DescriptorType::StorageBuffer, ShaderStages::COMPUTE)],
        vec![DescriptorBinding {
            binding: 1,
            kind: DescriptorType::StorageBuffer,
            resource: DescriptorResource::buffer(&storage),
        }],
    );

    assert_eq!(
        compute_binds(&h, &[(1, &set, &[])]),
        vec![HwCommand::SetUnorderedAccess {
            slot: 3,
            view: storage.uav(),
        }]
    );
}

#[test]
fn read_only_storage_buffers_bind_as_srv() {
    let h = harness();
    let storage = buffer(&h.device, 256, BufferUsage::STORAGE, BufferMemoryPreference::HostVisible);
    assert!(storage.uav().is_none());
    let set = set_with(
        &h,
        &[layout_binding(
            0,
            DescriptorType::StorageBuffer,
            ShaderStages::VERTEX | ShaderStages::FRAGMENT,
        )],
        vec![DescriptorBinding {
            binding: 0,
            kind: DescriptorType::StorageBuffer,
            resource: DescriptorResource::buffer(&storage),
        }],
    );

    assert_eq!(
        graphics_binds(&h, &[(1, &set, &[])]),
        vec![
            HwCommand::SetShaderResource {
                stage: HwStage::Vertex,
                slot: 32,
                view: storage.srv(),
            },
            HwCommand::SetShaderResource {
                stage: HwStage::Pixel,
                slot: 32,
                view: storage.srv(),
            },
        ]
    );
}

#[test]
fn combined_texture_samplers_bind_view_and_sampler() {
    let h = harness();
    let texture = h
        .device
        .create_texture(&TextureDescriptor {
            label: Some("albedo"),
            size: (8, 8, 1),
            usage: TextureUsage::TEXTURE_BINDING,
            ..TextureDescriptor::default()
        })
        .unwrap();
    let sampler = h.device.create_sampler(&SamplerDescriptor::default()).unwrap();
    let set = set_with(
        &h,
        &[layout_binding(2, DescriptorType::CombinedTextureSampler, ShaderStages::FRAGMENT)],
        vec![DescriptorBinding {
            binding: 2,
            kind: DescriptorType::CombinedTextureSampler,
            resource: DescriptorResource::CombinedTextureSampler {
                texture: Arc::clone(&texture),
                sampler: Arc::clone(&sampler),
            },
        }],
    );

    assert_eq!(
        graphics_binds(&h, &[(0, &set, &[])]),
        vec![
            HwCommand::SetShaderResource {
                stage: HwStage::Pixel,
                slot: 2,
                view: texture.srv(),
            },
            HwCommand::SetSampler {
                stage: HwStage::Pixel,
                slot: 2,
                sampler: Some(sampler.state()),
            },
        ]
    );
}

#[test]
fn storage_textures_bind_only_for_compute() {
    let h = harness();
    let texture = h
        .device
        .create_texture(&TextureDescriptor {
            label: Some("storage image"),
            size: (8, 8, 1),
            usage: TextureUsage::STORAGE_BINDING,
            ..TextureDescriptor::default()
        })
        .unwrap();
    let set = set_with(
        &h,
        &[layout_binding(
            0,
            DescriptorType::StorageTexture,
            ShaderStages::FRAGMENT | ShaderStages::COMPUTE,
        )],
        vec![DescriptorBinding {
            binding: 0,
            kind: DescriptorType::StorageTexture,
            resource: DescriptorResource::Texture(Arc::clone(&texture)),
        }],
    );

    assert!(graphics_binds(&h, &[(2, &set, &[])]).is_empty());
    assert_eq!(
        compute_binds(&h, &[(2, &set, &[])]),
        vec![HwCommand::SetUnorderedAccess {
            slot: 4,
            view: texture.uav(),
        }]
    );
}

fn dynamic_uniform_set(h: &Harness, ubo: &Arc<lume_d3d11::D3D11Buffer>) -> Arc<DescriptorSet> {
    set_with(
        h,
        &[layout_binding(0, DescriptorType::DynamicUniformBuffer, ShaderStages::VERTEX)],
        vec![DescriptorBinding {
            binding: 0,
            kind: DescriptorType::DynamicUniformBuffer,
            resource: DescriptorResource::buffer(ubo),
        }],
    )
}

#[test]
fn dynamic_offsets_bind_at_an_offset_when_supported() {
    let h = harness();
    let ubo = buffer(&h.device, 1024, BufferUsage::UNIFORM, BufferMemoryPreference::HostVisible);
    let set = dynamic_uniform_set(&h, &ubo);

    assert_eq!(
        graphics_binds(&h, &[(0, &set, &[256])]),
        vec![HwCommand::SetConstantBuffer {
            stage: HwStage::Vertex,
            slot: 0,
            binding: Some(ConstantBufferBinding {
                buffer: ubo.handle(),
                offset: 256,
                size: None,
            }),
        }]
    );
    assert_eq!(h.device.diagnostics().snapshot().warnings, 0);
}

#[test]
fn unaligned_dynamic_offsets_bind_the_whole_buffer() {
    let h = harness();
    let ubo = buffer(&h.device, 1024, BufferUsage::UNIFORM, BufferMemoryPreference::HostVisible);
    let set = dynamic_uniform_set(&h, &ubo);

    assert_eq!(
        graphics_binds(&h, &[(0, &set, &[100])]),
        vec![HwCommand::SetConstantBuffer {
            stage: HwStage::Vertex,
            slot: 0,
            binding: Some(ConstantBufferBinding::whole(ubo.handle())),
        }]
    );
    assert_eq!(h.device.diagnostics().snapshot().warnings, 1);
}

#[test]
fn dynamic_offsets_without_offsetting_bind_the_whole_buffer() {
    let null = NullDevice::new(DeviceCaps {
        deferred_contexts: true,
        constant_buffer_offsetting: false,
    });
    let h = harness_with(null, D3D11Config::default());
    let ubo = buffer(&h.device, 1024, BufferUsage::UNIFORM, BufferMemoryPreference::HostVisible);
    let set = dynamic_uniform_set(&h, &ubo);
    assert!(set
        .layout()
        .dynamic_offset_support(h.device.caps())
        .iter()
        .all(|s| !s.supported));

    assert_eq!(
        graphics_binds(&h, &[(0, &set, &[256])]),
        vec![HwCommand::SetConstantBuffer {
            stage: HwStage::Vertex,
            slot: 0,
            binding: Some(ConstantBufferBinding::whole(ubo.handle())),
        }]
    );
    assert_eq!(h.device.diagnostics().snapshot().warnings, 1);
}

#[test]
fn sets_apply_in_ascending_index_order() {
    let h = harness();
    let a = buffer(&h.device, 16, BufferUsage::UNIFORM, BufferMemoryPreference::HostVisible);
    let b = buffer(&h.device, 16, BufferUsage::UNIFORM, BufferMemoryPreference::HostVisible);
    let uniform = |buffer: &Arc<lume_d3d11::D3D11Buffer>| {
        set_with(
            &h,
            &[layout_binding(0, DescriptorType::UniformBuffer, ShaderStages::VERTEX)],
            vec![DescriptorBinding {
                binding: 0,
                kind: DescriptorType::UniformBuffer,
                resource: DescriptorResource::buffer(buffer),
            }],
        )
    };
    let (set_a, set_b) = (uniform(&a), uniform(&b));

    let slots: Vec<u32> = graphics_binds(&h, &[(2, &set_b, &[]), (0, &set_a, &[])])
        .into_iter()
        .filter_map(|c| match c {
            HwCommand::SetConstantBuffer { slot, .. } => Some(slot),
            _ => None,
        })
        .collect();
    assert_eq!(slots, vec![0, 8]);
}
