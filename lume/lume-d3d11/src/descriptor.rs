//! Descriptor set layouts and descriptor sets.
//!
//! The hardware has no descriptor sets. A set is a list of bindings that, when applied, writes
//! each resource into the flat slot the [`BindingRemapper`] assigns to its `(set, binding)`.

use std::sync::{Arc, PoisonError, RwLock};

use lume_rhi::{DescriptorSetLayoutBinding, DescriptorType, ShaderStages};

use crate::binding::{BindingRemapper, SlotClass};
use crate::conv::hw_stages;
use crate::diagnostics::{misuse, Diagnostics};
use crate::hw::{ConstantBufferBinding, DeviceCaps, HwContext, CONSTANT_BUFFER_OFFSET_ALIGNMENT};
use crate::resource::{D3D11Buffer, D3D11Sampler, D3D11Texture};

/// Stages a storage buffer's read-only view is bound to.
const STORAGE_SRV_STAGES: ShaderStages = ShaderStages::VERTEX
    .union(ShaderStages::FRAGMENT)
    .union(ShaderStages::COMPUTE);

/// Whether the device can honour the dynamic offset of one dynamic binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicOffsetSupport {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub supported: bool,
}

#[derive(Debug, Clone)]
pub struct DescriptorSetLayout {
    bindings: Vec<DescriptorSetLayoutBinding>,
    /// Binding indices of dynamic entries, ascending. Position = dynamic offset index.
    dynamic: Vec<u32>,
}

impl DescriptorSetLayout {
    pub fn new(bindings: &[DescriptorSetLayoutBinding]) -> Self {
        let mut dynamic: Vec<u32> = bindings
            .iter()
            .filter(|b| b.descriptor_type.is_dynamic())
            .map(|b| b.binding)
            .collect();
        dynamic.sort_unstable();
        Self {
            bindings: bindings.to_vec(),
            dynamic,
        }
    }

    pub fn bindings(&self) -> &[DescriptorSetLayoutBinding] {
        &self.bindings
    }

    /// Layout entry for `binding`.
    pub fn binding(&self, binding: u32) -> Option<&DescriptorSetLayoutBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }

    /// Number of dynamic offsets a bind of this layout consumes.
    pub fn dynamic_binding_count(&self) -> usize {
        self.dynamic.len()
    }

    fn dynamic_index(&self, binding: u32) -> Option<usize> {
        self.dynamic.iter().position(|&b| b == binding)
    }

    /// Per dynamic binding, in offset order: can `caps` apply its offset?
    /// Dynamic uniform buffers need constant-buffer offsetting. Dynamic storage buffers never
    /// can, their views are fixed at creation.
    pub fn dynamic_offset_support(&self, caps: DeviceCaps) -> Vec<DynamicOffsetSupport> {
        self.dynamic
            .iter()
            .filter_map(|&binding| self.binding(binding))
            .map(|b| DynamicOffsetSupport {
                binding: b.binding,
                descriptor_type: b.descriptor_type,
                supported: b.descriptor_type == DescriptorType::DynamicUniformBuffer
                    && caps.constant_buffer_offsetting,
            })
            .collect()
    }
}

/// What a binding points at.
#[derive(Debug, Clone)]
pub enum DescriptorResource {
    /// `size: None` binds to the end of the buffer.
    Buffer {
        buffer: Arc<D3D11Buffer>,
        offset: u64,
        size: Option<u64>,
    },
    Texture(Arc<D3D11Texture>),
    Sampler(Arc<D3D11Sampler>),
    CombinedTextureSampler {
        texture: Arc<D3D11Texture>,
        sampler: Arc<D3D11Sampler>,
    },
}

impl DescriptorResource {
    pub fn buffer(buffer: &Arc<D3D11Buffer>) -> Self {
        DescriptorResource::Buffer {
            buffer: Arc::clone(buffer),
            offset: 0,
            size: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub kind: DescriptorType,
    pub resource: DescriptorResource,
}

pub struct DescriptorSet {
    layout: Arc<DescriptorSetLayout>,
    bindings: RwLock<Vec<DescriptorBinding>>,
    diagnostics: Arc<Diagnostics>,
}

impl std::fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("bindings", &self.binding_count())
            .finish()
    }
}

impl DescriptorSet {
    pub fn new(layout: Arc<DescriptorSetLayout>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            layout,
            bindings: RwLock::new(Vec::new()),
            diagnostics,
        }
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn binding_count(&self) -> usize {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Replaces every binding. A repeated binding index replaces the earlier entry.
    pub fn update(&self, bindings: impl IntoIterator<Item = DescriptorBinding>) {
        let mut list: Vec<DescriptorBinding> = Vec::new();
        for binding in bindings {
            if let Some(existing) = list.iter_mut().find(|b| b.binding == binding.binding) {
                misuse!(
                    self.diagnostics,
                    "descriptor set update: binding {} given twice, keeping the last",
                    binding.binding
                );
                *existing = binding;
            } else {
                list.push(binding);
            }
        }
        *self.bindings.write().unwrap_or_else(PoisonError::into_inner) = list;
    }

    /// Writes every binding into the slots `remapper` assigns to `set_index`, for the stages in
    /// `stages` that the layout entry also names. Bindings the layout does not know are skipped.
    /// Slots are only overwritten, never cleared.
    pub fn apply(
        &self,
        ctx: &mut dyn HwContext,
        remapper: &BindingRemapper,
        caps: DeviceCaps,
        stages: ShaderStages,
        set_index: u32,
        dynamic_offsets: &[u32],
    ) {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        for entry in bindings.iter() {
            let Some(layout_entry) = self.layout.binding(entry.binding) else {
                continue;
            };
            let effective = stages & layout_entry.stages;
            if effective.is_empty() {
                continue;
            }
            let dynamic_offset = if entry.kind.is_dynamic() {
                self.layout
                    .dynamic_index(entry.binding)
                    .and_then(|i| dynamic_offsets.get(i).copied())
                    .unwrap_or(0)
            } else {
                0
            };
            let slot = |class| remapper.get_slot(class, set_index, entry.binding);

            match (entry.kind, &entry.resource) {
                (
                    DescriptorType::UniformBuffer | DescriptorType::DynamicUniformBuffer,
                    DescriptorResource::Buffer { buffer, offset, size },
                ) => {
                    let Some(cb_slot) = slot(SlotClass::ConstantBuffer) else {
                        continue;
                    };
                    let binding = self.constant_buffer_binding(
                        buffer,
                        *offset + u64::from(dynamic_offset),
                        *size,
                        caps,
                        entry.binding,
                    );
                    for stage in hw_stages(effective) {
                        ctx.set_constant_buffer(stage, cb_slot, Some(binding));
                    }
                }
                (
                    DescriptorType::StorageBuffer | DescriptorType::DynamicStorageBuffer,
                    DescriptorResource::Buffer { buffer, offset, .. },
                ) => {
                    if *offset != 0 || dynamic_offset != 0 {
                        misuse!(
                            self.diagnostics,
                            "set {} binding {}: storage buffer offsets are fixed at view creation, ignoring offset {}",
                            set_index,
                            entry.binding,
                            *offset + u64::from(dynamic_offset)
                        );
                    }
                    match (buffer.uav(), effective.contains(ShaderStages::COMPUTE)) {
                        (Some(uav), true) => {
                            if let Some(u_slot) = slot(SlotClass::UnorderedAccess) {
                                ctx.set_unordered_access(u_slot, Some(uav));
                            }
                        }
                        _ => {
                            let (Some(srv), Some(t_slot)) = (buffer.srv(), slot(SlotClass::ShaderResource)) else {
                                continue;
                            };
                            for stage in hw_stages(effective & STORAGE_SRV_STAGES) {
                                ctx.set_shader_resource(stage, t_slot, Some(srv));
                            }
                        }
                    }
                }
                (DescriptorType::SampledTexture, DescriptorResource::Texture(texture)) => {
                    let (Some(srv), Some(t_slot)) = (texture.srv(), slot(SlotClass::ShaderResource)) else {
                        continue;
                    };
                    for stage in hw_stages(effective) {
                        ctx.set_shader_resource(stage, t_slot, Some(srv));
                    }
                }
                (
                    DescriptorType::CombinedTextureSampler,
                    DescriptorResource::CombinedTextureSampler { texture, sampler },
                ) => {
                    if let (Some(srv), Some(t_slot)) = (texture.srv(), slot(SlotClass::ShaderResource)) {
                        for stage in hw_stages(effective) {
                            ctx.set_shader_resource(stage, t_slot, Some(srv));
                        }
                    }
                    if let Some(s_slot) = slot(SlotClass::Sampler) {
                        for stage in hw_stages(effective) {
                            ctx.set_sampler(stage, s_slot, Some(sampler.state()));
                        }
                    }
                }
                (DescriptorType::StorageTexture, DescriptorResource::Texture(texture)) => {
                    if !effective.contains(ShaderStages::COMPUTE) {
                        continue;
                    }
                    if let (Some(uav), Some(u_slot)) = (texture.uav(), slot(SlotClass::UnorderedAccess)) {
                        ctx.set_unordered_access(u_slot, Some(uav));
                    }
                }
                (DescriptorType::Sampler, DescriptorResource::Sampler(sampler)) => {
                    let Some(s_slot) = slot(SlotClass::Sampler) else {
                        continue;
                    };
                    for stage in hw_stages(effective) {
                        ctx.set_sampler(stage, s_slot, Some(sampler.state()));
                    }
                }
                (kind, _) => {
                    log::trace!(
                        "set {} binding {}: resource does not match {:?}, skipped",
                        set_index,
                        entry.binding,
                        kind
                    );
                }
            }
        }
        log::trace!("applied descriptor set {} ({} bindings)", set_index, bindings.len());
    }

    /// Offsets are honoured only when the hardware binds constant buffers at an offset and the
    /// offset is 256-byte aligned. Anything else binds the whole buffer.
    fn constant_buffer_binding(
        &self,
        buffer: &D3D11Buffer,
        offset: u64,
        size: Option<u64>,
        caps: DeviceCaps,
        binding: u32,
    ) -> ConstantBufferBinding {
        if offset == 0 && size.is_none() {
            return ConstantBufferBinding::whole(buffer.handle());
        }
        if !caps.constant_buffer_offsetting {
            if offset != 0 {
                misuse!(
                    self.diagnostics,
                    "binding {}: constant buffer offset {} needs offsetting support, binding whole buffer",
                    binding,
                    offset
                );
            }
            return ConstantBufferBinding::whole(buffer.handle());
        }
        if offset % CONSTANT_BUFFER_OFFSET_ALIGNMENT != 0 {
            misuse!(
                self.diagnostics,
                "binding {}: constant buffer offset {} is not a multiple of {}, binding whole buffer",
                binding,
                offset,
                CONSTANT_BUFFER_OFFSET_ALIGNMENT
            );
            return ConstantBufferBinding::whole(buffer.handle());
        }
        ConstantBufferBinding {
            buffer: buffer.handle(),
            offset,
            size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(binding: u32, descriptor_type: DescriptorType) -> DescriptorSetLayoutBinding {
        DescriptorSetLayoutBinding {
            binding,
            descriptor_type,
            count: 1,
            stages: ShaderStages::ALL_GRAPHICS | ShaderStages::COMPUTE,
        }
    }

    #[test]
    fn dynamic_offsets_follow_binding_order() {
        let layout = DescriptorSetLayout::new(&[
            entry(5, DescriptorType::DynamicStorageBuffer),
            entry(0, DescriptorType::UniformBuffer),
            entry(2, DescriptorType::DynamicUniformBuffer),
        ]);
        assert_eq!(layout.dynamic_binding_count(), 2);
        assert_eq!(layout.dynamic_index(2), Some(0));
        assert_eq!(layout.dynamic_index(5), Some(1));
        assert_eq!(layout.dynamic_index(0), None);
    }

    #[test]
    fn dynamic_offset_support_depends_on_caps() {
        let layout = DescriptorSetLayout::new(&[
            entry(1, DescriptorType::DynamicUniformBuffer),
            entry(3, DescriptorType::DynamicStorageBuffer),
        ]);
        let with = DeviceCaps {
            deferred_contexts: true,
            constant_buffer_offsetting: true,
        };
        let without = DeviceCaps {
            constant_buffer_offsetting: false,
            ..with
        };
        let support: Vec<bool> = layout.dynamic_offset_support(with).iter().map(|s| s.supported).collect();
        assert_eq!(support, vec![true, false]);
        assert!(layout.dynamic_offset_support(without).iter().all(|s| !s.supported));
    }
}
