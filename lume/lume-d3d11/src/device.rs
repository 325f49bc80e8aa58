//! The device: entry point of the backend.
//!
//! Owns the hardware device, the shared immediate recorder, the binding remapper, the state
//! object cache and the diagnostics counters, and hands shared references of them to everything
//! it creates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lume_rhi::{
    BufferDescriptor, BufferUsage, DescriptorSetLayoutBinding, QueryType, ResourceId,
    SamplerDescriptor, TextureDescriptor,
};

use crate::binding::{BindingRemapper, SlotConflict};
use crate::command::{lock_recorder, write_buffer_regions, CommandContext, Recorder, SharedRecorder};
use crate::config::{D3D11Config, ThreadingMode};
use crate::conv;
use crate::descriptor::{DescriptorSet, DescriptorSetLayout};
use crate::diagnostics::{DeviceLostReport, Diagnostics};
use crate::error::{Error, ObjectKind, Result};
use crate::hw::{BindFlags, DeviceCaps, HwDevice, HwStage, MapMode, ViewSource};
use crate::pipeline::{
    ComputePipeline, ComputePipelineDescriptor, GraphicsPipeline, GraphicsPipelineDescriptor,
    PipelineLayout, PipelineLayoutDescriptor,
};
use crate::query::QueryPool;
use crate::resource::{D3D11Buffer, D3D11Sampler, D3D11Shader, D3D11Texture};
use crate::state_cache::{StateCacheStats, StateObjectCache};

/// What every command context borrows from its device.
#[derive(Clone)]
pub(crate) struct DeviceShared {
    pub(crate) hw: Arc<dyn HwDevice>,
    pub(crate) immediate: SharedRecorder,
    pub(crate) remapper: Arc<BindingRemapper>,
    pub(crate) diagnostics: Arc<Diagnostics>,
    pub(crate) caps: DeviceCaps,
    pub(crate) query_timeout: Option<Duration>,
    pub(crate) debug_markers: bool,
}

pub struct D3D11Device {
    shared: DeviceShared,
    cache: StateObjectCache,
    config: D3D11Config,
    next_id: AtomicU64,
}

impl D3D11Device {
    /// Wraps `hw`. Slot assignments come from `config`; overlapping or out-of-range assignments
    /// are reported as warnings and kept.
    pub fn new(hw: Arc<dyn HwDevice>, config: D3D11Config) -> Result<Self> {
        let caps = hw.caps();
        let immediate = hw.immediate_context()?;
        let remapper = BindingRemapper::new(config.slot_assignments);
        for conflict in remapper.validate() {
            match conflict {
                SlotConflict::Overlap {
                    class,
                    first_set,
                    second_set,
                } => log::warn!(
                    "slot assignment: {:?} ranges of sets {} and {} overlap",
                    class,
                    first_set,
                    second_set
                ),
                SlotConflict::CoversPushConstantSlot { set } => log::warn!(
                    "slot assignment: set {} covers the push-constant slot",
                    set
                ),
                SlotConflict::ExceedsHardwareLimit { class, set, end } => log::warn!(
                    "slot assignment: set {} {:?} range ends at {} (limit {})",
                    set,
                    class,
                    end,
                    class.hardware_limit()
                ),
            }
        }
        if config.threading == ThreadingMode::Deferred && !caps.deferred_contexts {
            log::warn!("deferred threading requested but unsupported, contexts record immediately");
        }
        log::info!(
            "D3D11 device ready (threading {:?}, deferred contexts {}, cb offsetting {})",
            config.threading,
            caps.deferred_contexts,
            caps.constant_buffer_offsetting
        );
        Ok(Self {
            shared: DeviceShared {
                immediate: Arc::new(Mutex::new(immediate)),
                remapper: Arc::new(remapper),
                diagnostics: Arc::new(Diagnostics::default()),
                caps,
                query_timeout: config.query_timeout,
                debug_markers: config.debug_markers,
                hw: Arc::clone(&hw),
            },
            cache: StateObjectCache::new(hw),
            config,
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> ResourceId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn caps(&self) -> DeviceCaps {
        self.shared.caps
    }

    pub fn config(&self) -> &D3D11Config {
        &self.config
    }

    pub fn remapper(&self) -> &BindingRemapper {
        &self.shared.remapper
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.shared.diagnostics
    }

    pub fn state_cache(&self) -> &StateObjectCache {
        &self.cache
    }

    pub fn state_cache_stats(&self) -> StateCacheStats {
        self.cache.stats()
    }

    /// Whether new contexts get their own deferred recorder.
    pub fn records_deferred(&self) -> bool {
        self.config.threading == ThreadingMode::Deferred && self.shared.caps.deferred_contexts
    }

    /// A closed command context. It records deferred only when the device supports deferred
    /// contexts and the configured threading mode asks for it.
    pub fn create_command_context(&self) -> Result<CommandContext> {
        let recorder = if self.records_deferred() {
            Recorder::Deferred(self.shared.hw.create_deferred_context()?)
        } else {
            Recorder::Immediate(Arc::clone(&self.shared.immediate))
        };
        Ok(CommandContext::new(self.shared.clone(), recorder))
    }

    pub fn create_buffer(&self, desc: &BufferDescriptor, initial_data: Option<&[u8]>) -> Result<Arc<D3D11Buffer>> {
        if desc.size == 0 {
            return Err(Error::creation(ObjectKind::Buffer, format!("{:?}: zero-sized buffer", desc.label)));
        }
        let mut hw_desc = conv::buffer_desc(desc);
        if hw_desc.bind.contains(BindFlags::CONSTANT_BUFFER) {
            hw_desc.byte_width = desc.size.div_ceil(16) * 16;
        }
        let padded;
        let initial_data = match initial_data {
            Some(data) if data.len() as u64 > desc.size => {
                return Err(Error::OutOfBounds {
                    size: desc.size,
                    end: data.len() as u64,
                })
            }
            Some(data) if (data.len() as u64) < hw_desc.byte_width => {
                let mut bytes = data.to_vec();
                bytes.resize(hw_desc.byte_width as usize, 0);
                padded = bytes;
                Some(padded.as_slice())
            }
            other => other,
        };
        let handle = self.shared.hw.create_buffer(&hw_desc, initial_data).map_err(|e| {
            log::error!("create_buffer {:?}: {}", desc.label, e);
            e
        })?;
        let mut buffer = D3D11Buffer {
            device: Arc::clone(&self.shared.hw),
            handle,
            srv: None,
            uav: None,
            size: desc.size,
            usage: desc.usage,
            memory: desc.memory,
            cpu_access: hw_desc.cpu_access,
            id: self.next_id(),
        };
        // Views release with the buffer if either creation fails.
        if hw_desc.bind.contains(BindFlags::SHADER_RESOURCE) {
            buffer.srv = Some(self.shared.hw.create_shader_resource_view(ViewSource::Buffer(handle))?);
        }
        if hw_desc.bind.contains(BindFlags::UNORDERED_ACCESS) {
            buffer.uav = Some(self.shared.hw.create_unordered_access_view(ViewSource::Buffer(handle))?);
        }
        if desc.usage.contains(BufferUsage::STORAGE) && buffer.uav.is_none() {
            log::debug!("buffer {:?}: storage buffer without UAV is read-only", desc.label);
        }
        log::debug!("created buffer {:?} ({} bytes, {:?})", desc.label, desc.size, desc.memory);
        Ok(Arc::new(buffer))
    }

    pub fn create_texture(&self, desc: &TextureDescriptor) -> Result<Arc<D3D11Texture>> {
        let hw_desc = conv::texture_desc(desc);
        let handle = self.shared.hw.create_texture(&hw_desc).map_err(|e| {
            log::error!("create_texture {:?}: {}", desc.label, e);
            e
        })?;
        let bind = hw_desc.bind;
        let mut texture = D3D11Texture {
            device: Arc::clone(&self.shared.hw),
            handle,
            desc: hw_desc,
            srv: None,
            uav: None,
            rtv: None,
            dsv: None,
            id: self.next_id(),
        };
        let source = ViewSource::Texture(handle);
        if bind.contains(BindFlags::SHADER_RESOURCE) {
            texture.srv = Some(self.shared.hw.create_shader_resource_view(source)?);
        }
        if bind.contains(BindFlags::UNORDERED_ACCESS) {
            texture.uav = Some(self.shared.hw.create_unordered_access_view(source)?);
        }
        if bind.contains(BindFlags::RENDER_TARGET) {
            texture.rtv = Some(self.shared.hw.create_render_target_view(handle)?);
        }
        if bind.contains(BindFlags::DEPTH_STENCIL) {
            texture.dsv = Some(self.shared.hw.create_depth_stencil_view(handle)?);
        }
        log::debug!("created texture {:?} {:?} {:?}", desc.label, desc.format, desc.size);
        Ok(Arc::new(texture))
    }

    /// Samplers with equal descriptors share one cached hardware state.
    pub fn create_sampler(&self, desc: &SamplerDescriptor) -> Result<Arc<D3D11Sampler>> {
        let state = self.cache.sampler_state(&conv::sampler_desc(desc))?;
        Ok(Arc::new(D3D11Sampler {
            state,
            desc: desc.clone(),
            id: self.next_id(),
        }))
    }

    /// `bytecode` is the compiled blob for `stage`.
    pub fn create_shader(&self, stage: HwStage, bytecode: &[u8]) -> Result<Arc<D3D11Shader>> {
        let handle = self.shared.hw.create_shader(stage, bytecode).map_err(|e| {
            log::error!("create_shader {:?}: {}", stage, e);
            e
        })?;
        Ok(Arc::new(D3D11Shader {
            device: Arc::clone(&self.shared.hw),
            handle,
            stage,
            bytecode: Arc::from(bytecode),
        }))
    }

    pub fn create_descriptor_set_layout(&self, bindings: &[DescriptorSetLayoutBinding]) -> Arc<DescriptorSetLayout> {
        let layout = DescriptorSetLayout::new(bindings);
        for support in layout.dynamic_offset_support(self.shared.caps) {
            if !support.supported {
                log::debug!(
                    "binding {} ({:?}): dynamic offsets cannot be applied on this device",
                    support.binding,
                    support.descriptor_type
                );
            }
        }
        Arc::new(layout)
    }

    /// An empty set; fill it with [`DescriptorSet::update`].
    pub fn create_descriptor_set(&self, layout: &Arc<DescriptorSetLayout>) -> Arc<DescriptorSet> {
        Arc::new(DescriptorSet::new(
            Arc::clone(layout),
            Arc::clone(&self.shared.diagnostics),
        ))
    }

    pub fn create_pipeline_layout(&self, desc: &PipelineLayoutDescriptor) -> Result<Arc<PipelineLayout>> {
        PipelineLayout::new(Arc::clone(&self.shared.hw), desc).map(Arc::new)
    }

    pub fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDescriptor) -> Result<Arc<GraphicsPipeline>> {
        GraphicsPipeline::new(&self.cache, desc)
            .map(Arc::new)
            .map_err(|e| {
                log::error!("create_graphics_pipeline {:?}: {}", desc.label, e);
                e
            })
    }

    pub fn create_compute_pipeline(&self, desc: &ComputePipelineDescriptor) -> Result<Arc<ComputePipeline>> {
        ComputePipeline::new(desc).map(Arc::new).map_err(|e| {
            log::error!("create_compute_pipeline {:?}: {}", desc.label, e);
            e
        })
    }

    pub fn create_query_pool(&self, ty: QueryType, count: u32) -> Result<Arc<QueryPool>> {
        QueryPool::new(Arc::clone(&self.shared.hw), ty, count).map(Arc::new)
    }

    /// Writes `data` at `offset` through the immediate recorder. Host-visible buffers are mapped,
    /// device-local ones get a sub-resource update.
    pub fn write_buffer(&self, buffer: &D3D11Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset.saturating_add(data.len() as u64);
        if end > buffer.size() {
            return Err(Error::OutOfBounds {
                size: buffer.size(),
                end,
            });
        }
        let mut ctx = lock_recorder(&self.shared.immediate);
        write_buffer_regions(ctx.as_mut(), buffer, &[(offset, data)])
    }

    /// Reads `len` bytes at `offset` of a readback buffer through the immediate recorder.
    pub fn read_buffer(&self, buffer: &D3D11Buffer, offset: u64, len: u64) -> Result<Vec<u8>> {
        let end = offset.saturating_add(len);
        if end > buffer.size() {
            return Err(Error::OutOfBounds {
                size: buffer.size(),
                end,
            });
        }
        let mut out = Vec::new();
        let mut ctx = lock_recorder(&self.shared.immediate);
        ctx.map_buffer(buffer.handle(), MapMode::Read, &mut |bytes| {
            if let Some(range) = bytes.get(offset as usize..end as usize) {
                out.extend_from_slice(range);
            }
        })?;
        Ok(out)
    }

    /// Some(report) once the hardware device has been removed. The report is logged at error
    /// level; there is no recovery.
    pub fn check_device_lost(&self) -> Option<DeviceLostReport> {
        let reason = self.shared.hw.device_removed_reason()?;
        let report = DeviceLostReport {
            reason,
            counters: self.shared.diagnostics.snapshot(),
        };
        log::error!("{}", report);
        Some(report)
    }
}

impl std::fmt::Debug for D3D11Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("D3D11Device")
            .field("caps", &self.shared.caps)
            .field("threading", &self.config.threading)
            .finish()
    }
}
