//! Command contexts: explicit command buffers emulated on a slot-bound recorder.
//!
//! A context records either straight into the shared immediate recorder (commands execute as
//! they are recorded) or into its own deferred recorder, whose finished command list is replayed
//! on the immediate recorder by [`CommandContext::submit`].
//!
//! Descriptor sets are not written when bound. Binds are buffered and every draw or dispatch
//! first applies all bound sets if anything changed since the last flush.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lume_rhi::{
    BufferMemoryPreference, BufferTextureLayout, DispatchIndirectArgs, DrawIndexedIndirectArgs,
    DrawIndirectArgs, ImageLayout, IndexFormat, QueryType, ScissorRect, ShaderStages,
    TextureDimension, TextureRegion, Viewport,
};

use crate::binding::{MAX_DESCRIPTOR_SETS, PUSH_CONSTANT_SLOT};
use crate::conv;
use crate::descriptor::DescriptorSet;
use crate::device::DeviceShared;
use crate::diagnostics::{misuse, Diagnostics};
use crate::error::{Error, Result};
use crate::hw::{
    BufferHandle, CommandListHandle, ConstantBufferBinding, DsvHandle, HwBox, HwContext,
    HwObject, HwStage, HwTextureDesc, MapMode, QueryHandle, RtvHandle, TextureHandle,
    VertexBufferBinding, MAX_RENDER_TARGETS,
};
use crate::pipeline::{ComputePipeline, GraphicsPipeline, PipelineLayout};
use crate::query::QueryPool;
use crate::resource::{D3D11Buffer, D3D11Texture};

const DRAW_ARGS_SIZE: u64 = std::mem::size_of::<DrawIndirectArgs>() as u64;
const DRAW_INDEXED_ARGS_SIZE: u64 = std::mem::size_of::<DrawIndexedIndirectArgs>() as u64;
const DISPATCH_ARGS_SIZE: u64 = std::mem::size_of::<DispatchIndirectArgs>() as u64;

/// The immediate recorder, shared by the device and every non-deferred context.
pub(crate) type SharedRecorder = Arc<Mutex<Box<dyn HwContext>>>;

pub(crate) fn lock_recorder(shared: &SharedRecorder) -> MutexGuard<'_, Box<dyn HwContext>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) enum Recorder {
    Immediate(SharedRecorder),
    Deferred(Box<dyn HwContext>),
}

impl Recorder {
    pub(crate) fn with<R>(&mut self, f: impl FnOnce(&mut dyn HwContext) -> R) -> R {
        match self {
            Recorder::Immediate(shared) => f(lock_recorder(shared).as_mut()),
            Recorder::Deferred(ctx) => f(ctx.as_mut()),
        }
    }
}

#[derive(Clone, Default)]
enum BoundPipeline {
    #[default]
    None,
    Graphics(Arc<GraphicsPipeline>),
    Compute(Arc<ComputePipeline>),
}

impl BoundPipeline {
    fn layout(&self) -> Option<&Arc<PipelineLayout>> {
        match self {
            BoundPipeline::None => None,
            BoundPipeline::Graphics(p) => Some(&p.layout),
            BoundPipeline::Compute(p) => Some(&p.layout),
        }
    }

    /// Stages descriptor sets are applied to.
    fn stages(&self) -> ShaderStages {
        match self {
            BoundPipeline::None => ShaderStages::ALL_GRAPHICS | ShaderStages::COMPUTE,
            BoundPipeline::Graphics(_) => ShaderStages::ALL_GRAPHICS,
            BoundPipeline::Compute(_) => ShaderStages::COMPUTE,
        }
    }
}

/// Per-context counters, reset by nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandContextStats {
    pub draws: u64,
    pub dispatches: u64,
    /// Flushes that found dirty descriptor state.
    pub flushes: u64,
    pub descriptor_set_applies: u64,
}

pub struct CommandContext {
    shared: DeviceShared,
    pub(crate) recorder: Recorder,
    is_open: bool,
    finished: Option<CommandListHandle>,
    pipeline: BoundPipeline,
    /// CPU copy of the bound layout's push-constant block, uploaded whole on every write.
    push_constants: Vec<u8>,
    sets: [Option<Arc<DescriptorSet>>; MAX_DESCRIPTOR_SETS],
    dynamic_offsets: [Vec<u32>; MAX_DESCRIPTOR_SETS],
    descriptor_sets_dirty: bool,
    /// Indexed by binding: `(buffer, offset)`. Re-issued when the pipeline (and strides) change.
    vertex_buffers: Vec<Option<(BufferHandle, u32)>>,
    pub(crate) render_targets: [Option<RtvHandle>; MAX_RENDER_TARGETS],
    pub(crate) depth_stencil_target: Option<DsvHandle>,
    stencil_reference: u32,
    blend_constant: [f32; 4],
    staging: Option<(HwTextureDesc, TextureHandle)>,
    stats: CommandContextStats,
}

impl CommandContext {
    pub(crate) fn new(shared: DeviceShared, recorder: Recorder) -> Self {
        Self {
            shared,
            recorder,
            is_open: false,
            finished: None,
            pipeline: BoundPipeline::None,
            push_constants: Vec::new(),
            sets: Default::default(),
            dynamic_offsets: Default::default(),
            descriptor_sets_dirty: false,
            vertex_buffers: Vec::new(),
            render_targets: [None; MAX_RENDER_TARGETS],
            depth_stencil_target: None,
            stencil_reference: 0,
            blend_constant: [0.0; 4],
            staging: None,
            stats: CommandContextStats::default(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.recorder, Recorder::Deferred(_))
    }

    pub fn descriptor_sets_dirty(&self) -> bool {
        self.descriptor_sets_dirty
    }

    pub fn has_finished_command_list(&self) -> bool {
        self.finished.is_some()
    }

    pub fn bound_descriptor_set(&self, index: u32) -> Option<&Arc<DescriptorSet>> {
        self.sets.get(index as usize)?.as_ref()
    }

    pub fn bound_layout(&self) -> Option<&Arc<PipelineLayout>> {
        self.pipeline.layout()
    }

    pub fn render_targets(&self) -> &[Option<RtvHandle>; MAX_RENDER_TARGETS] {
        &self.render_targets
    }

    pub fn depth_stencil_target(&self) -> Option<DsvHandle> {
        self.depth_stencil_target
    }

    pub fn stats(&self) -> CommandContextStats {
        self.stats
    }

    pub(crate) fn diagnostics(&self) -> &Diagnostics {
        &self.shared.diagnostics
    }

    pub(crate) fn ensure_open(&self, op: &str) -> bool {
        if !self.is_open {
            misuse!(self.shared.diagnostics, "{}: command context is not recording", op);
        }
        self.is_open
    }

    fn release_finished(&mut self) {
        if let Some(list) = self.finished.take() {
            self.shared.hw.release(HwObject::CommandList(list));
        }
    }

    fn clear_bindings(&mut self) {
        self.pipeline = BoundPipeline::None;
        self.push_constants.clear();
        self.sets = Default::default();
        self.dynamic_offsets = Default::default();
        self.vertex_buffers.clear();
        self.render_targets = [None; MAX_RENDER_TARGETS];
        self.depth_stencil_target = None;
        self.stencil_reference = 0;
        self.blend_constant = [0.0; 4];
    }

    pub fn begin(&mut self) {
        if self.is_open {
            misuse!(self.shared.diagnostics, "begin: command context is already recording");
            return;
        }
        if self.finished.is_some() {
            misuse!(self.shared.diagnostics, "begin: discarding a finished command list that was never submitted");
            self.release_finished();
        }
        self.clear_bindings();
        self.is_open = true;
        self.descriptor_sets_dirty = true;
        log::debug!(
            "command context begin ({})",
            if self.is_deferred() { "deferred" } else { "immediate" }
        );
    }

    /// Closes the recording. A deferred recorder is finished into a command list for
    /// [`submit`](Self::submit).
    pub fn end(&mut self) -> Result<()> {
        if !self.is_open {
            misuse!(self.shared.diagnostics, "end: command context is not recording");
            return Ok(());
        }
        self.is_open = false;
        if let Recorder::Deferred(ctx) = &mut self.recorder {
            match ctx.finish_command_list() {
                Ok(list) => self.finished = Some(list),
                Err(e) => {
                    self.shared.diagnostics.record_error();
                    log::error!("end: finishing the command list failed: {}", e);
                    return Err(e);
                }
            }
        }
        log::debug!("command context end");
        Ok(())
    }

    /// Ends an open recording, drops any finished list and gives a deferred context a fresh
    /// recorder.
    pub fn reset(&mut self) -> Result<()> {
        if self.is_open {
            if let Err(e) = self.end() {
                log::warn!("reset: discarding recording that failed to finish: {}", e);
            }
        }
        self.release_finished();
        self.clear_bindings();
        self.descriptor_sets_dirty = false;
        if self.is_deferred() {
            self.recorder = Recorder::Deferred(self.shared.hw.create_deferred_context()?);
        }
        log::debug!("command context reset");
        Ok(())
    }

    /// Replays the finished command list on the immediate recorder. Immediate contexts have
    /// already executed everything they recorded.
    pub fn submit(&mut self) -> Result<()> {
        if self.is_open {
            misuse!(self.shared.diagnostics, "submit: end the recording first");
            return Ok(());
        }
        if !self.is_deferred() {
            self.shared.diagnostics.record_submission();
            log::trace!("submit: immediate commands already executed");
            return Ok(());
        }
        let Some(list) = self.finished.take() else {
            misuse!(self.shared.diagnostics, "submit: nothing recorded since the last submit");
            return Ok(());
        };
        lock_recorder(&self.shared.immediate).execute_command_list(list);
        self.shared.hw.release(HwObject::CommandList(list));
        self.shared.diagnostics.record_submission();
        log::debug!("submitted command list {:?}", list);
        Ok(())
    }

    pub fn begin_debug_marker(&mut self, name: &str) {
        if self.ensure_open("begin_debug_marker") && self.shared.debug_markers {
            self.recorder.with(|ctx| ctx.begin_event(name));
        }
    }

    pub fn end_debug_marker(&mut self) {
        if self.ensure_open("end_debug_marker") && self.shared.debug_markers {
            self.recorder.with(|ctx| ctx.end_event());
        }
    }

    pub fn insert_debug_marker(&mut self, name: &str) {
        if self.ensure_open("insert_debug_marker") && self.shared.debug_markers {
            self.recorder.with(|ctx| ctx.set_marker(name));
        }
    }

    /// No-op: the driver tracks hazards.
    pub fn pipeline_barrier_texture(
        &mut self,
        _texture: &D3D11Texture,
        _old_layout: ImageLayout,
        _new_layout: ImageLayout,
    ) {
    }

    /// No-op: the driver tracks hazards.
    pub fn pipeline_barrier_buffer(&mut self, _buffer: &D3D11Buffer) {}

    pub fn set_graphics_pipeline(&mut self, pipeline: &Arc<GraphicsPipeline>) {
        if !self.ensure_open("set_graphics_pipeline") {
            return;
        }
        let (stencil_reference, blend_constant) = (self.stencil_reference, self.blend_constant);
        self.recorder.with(|ctx| {
            ctx.set_shader(HwStage::Vertex, Some(pipeline.vertex_shader.handle()));
            ctx.set_shader(HwStage::Pixel, pipeline.fragment_shader.as_ref().map(|s| s.handle()));
            ctx.set_shader(HwStage::Geometry, pipeline.geometry_shader.as_ref().map(|s| s.handle()));
            ctx.set_shader(HwStage::Hull, None);
            ctx.set_shader(HwStage::Domain, None);
            ctx.set_input_layout(pipeline.input_layout);
            ctx.set_primitive_topology(pipeline.topology);
            ctx.set_rasterizer_state(Some(pipeline.rasterizer));
            ctx.set_depth_stencil_state(Some(pipeline.depth_stencil), stencil_reference);
            ctx.set_blend_state(Some(pipeline.blend), blend_constant, u32::MAX);
        });
        self.bind_pipeline(BoundPipeline::Graphics(Arc::clone(pipeline)));
        self.rebind_vertex_buffers();
        self.bind_push_constant_buffer();
    }

    pub fn set_compute_pipeline(&mut self, pipeline: &Arc<ComputePipeline>) {
        if !self.ensure_open("set_compute_pipeline") {
            return;
        }
        self.recorder
            .with(|ctx| ctx.set_shader(HwStage::Compute, Some(pipeline.shader.handle())));
        self.bind_pipeline(BoundPipeline::Compute(Arc::clone(pipeline)));
        self.bind_push_constant_buffer();
    }

    /// A different layout starts from a zeroed push-constant block.
    fn bind_pipeline(&mut self, pipeline: BoundPipeline) {
        let same_layout = match (self.pipeline.layout(), pipeline.layout()) {
            (Some(old), Some(new)) => Arc::ptr_eq(old, new),
            _ => false,
        };
        if !same_layout {
            let size = pipeline.layout().map_or(0, |l| l.push_constant_size());
            self.push_constants.clear();
            self.push_constants.resize(size as usize, 0);
        }
        self.pipeline = pipeline;
        self.descriptor_sets_dirty = true;
    }

    /// Buffers `set` for `index`; it is applied by the next draw or dispatch.
    /// `dynamic_offsets[i]` belongs to the i-th dynamic binding in ascending binding order.
    pub fn set_descriptor_set(&mut self, index: u32, set: &Arc<DescriptorSet>, dynamic_offsets: &[u32]) {
        if !self.ensure_open("set_descriptor_set") {
            return;
        }
        if index as usize >= MAX_DESCRIPTOR_SETS {
            misuse!(
                self.shared.diagnostics,
                "set_descriptor_set: set index {} out of range (max {})",
                index,
                MAX_DESCRIPTOR_SETS - 1
            );
            return;
        }
        let expected = set.layout().dynamic_binding_count();
        if dynamic_offsets.len() != expected {
            misuse!(
                self.shared.diagnostics,
                "set_descriptor_set: {} dynamic offsets for {} dynamic bindings at set {}",
                dynamic_offsets.len(),
                expected,
                index
            );
        }
        self.sets[index as usize] = Some(Arc::clone(set));
        self.dynamic_offsets[index as usize] = dynamic_offsets.to_vec();
        self.descriptor_sets_dirty = true;
    }

    /// Applies every bound set in ascending index order if anything changed since the last flush.
    fn flush_descriptor_sets(&mut self) {
        if !self.descriptor_sets_dirty {
            return;
        }
        let stages = self.pipeline.stages();
        let remapper = &self.shared.remapper;
        let caps = self.shared.caps;
        let sets = &self.sets;
        let offsets = &self.dynamic_offsets;
        let applied = self.recorder.with(|ctx| {
            let mut applied = 0u64;
            for (index, set) in sets.iter().enumerate() {
                if let Some(set) = set {
                    set.apply(ctx, remapper, caps, stages, index as u32, &offsets[index]);
                    applied += 1;
                }
            }
            applied
        });
        for _ in 0..applied {
            self.shared.diagnostics.record_descriptor_set_apply();
        }
        self.stats.flushes += 1;
        self.stats.descriptor_set_applies += applied;
        self.descriptor_sets_dirty = false;
    }

    fn push_constant_stages(&self) -> &'static [HwStage] {
        match self.pipeline {
            BoundPipeline::Compute(_) => &[HwStage::Compute],
            _ => &HwStage::GRAPHICS,
        }
    }

    fn bind_push_constant_buffer(&mut self) {
        let Some(buffer) = self.pipeline.layout().and_then(|l| l.push_constant_buffer()) else {
            return;
        };
        let stages = self.push_constant_stages();
        self.recorder.with(|ctx| {
            for stage in stages {
                ctx.set_constant_buffer(*stage, PUSH_CONSTANT_SLOT, Some(ConstantBufferBinding::whole(buffer)));
            }
        });
    }

    /// Updates this context's copy of the push-constant block at `offset` and uploads the
    /// whole block.
    pub fn set_push_constants(&mut self, offset: u32, data: &[u8]) {
        if !self.ensure_open("set_push_constants") {
            return;
        }
        let Some(layout) = self.pipeline.layout() else {
            misuse!(self.shared.diagnostics, "set_push_constants: no pipeline layout bound");
            return;
        };
        let Some(buffer) = layout.push_constant_buffer() else {
            misuse!(self.shared.diagnostics, "set_push_constants: bound layout has no push constants");
            return;
        };
        if !write_push_constants(&mut self.push_constants, offset, data) {
            misuse!(
                self.shared.diagnostics,
                "set_push_constants: {} bytes at {} overflow the {}-byte block",
                data.len(),
                offset,
                self.push_constants.len()
            );
            return;
        }
        let contents = &self.push_constants;
        let mapped = self.recorder.with(|ctx| {
            ctx.map_buffer(buffer, MapMode::WriteDiscard, &mut |bytes| {
                let n = bytes.len().min(contents.len());
                bytes[..n].copy_from_slice(&contents[..n]);
            })
        });
        if let Err(e) = mapped {
            self.shared.diagnostics.record_error();
            log::error!("set_push_constants: {}", e);
            return;
        }
        self.bind_push_constant_buffer();
    }

    fn rebind_vertex_buffers(&mut self) {
        if self.vertex_buffers.is_empty() {
            return;
        }
        let BoundPipeline::Graphics(pipeline) = &self.pipeline else {
            return;
        };
        let bindings: Vec<VertexBufferBinding> = self
            .vertex_buffers
            .iter()
            .enumerate()
            .map(|(binding, bound)| VertexBufferBinding {
                buffer: bound.map(|(b, _)| b),
                stride: pipeline.vertex_stride(binding as u32),
                offset: bound.map_or(0, |(_, o)| o),
            })
            .collect();
        self.recorder.with(|ctx| ctx.set_vertex_buffers(0, &bindings));
    }

    /// Binds `(buffer, offset)` pairs starting at `first_binding`. Strides come from the bound
    /// graphics pipeline's vertex input.
    pub fn set_vertex_buffers(&mut self, first_binding: u32, buffers: &[(&D3D11Buffer, u64)]) {
        if !self.ensure_open("set_vertex_buffers") {
            return;
        }
        let mut offsets = Vec::with_capacity(buffers.len());
        for (buffer, offset) in buffers {
            match u32::try_from(*offset) {
                Ok(offset) => offsets.push((buffer.handle(), offset)),
                Err(_) => {
                    misuse!(self.shared.diagnostics, "set_vertex_buffers: offset {} exceeds 32 bits", offset);
                    return;
                }
            }
        }
        let end = first_binding as usize + offsets.len();
        if self.vertex_buffers.len() < end {
            self.vertex_buffers.resize(end, None);
        }
        for (i, bound) in offsets.iter().enumerate() {
            self.vertex_buffers[first_binding as usize + i] = Some(*bound);
        }
        let bindings: Vec<VertexBufferBinding> = offsets
            .iter()
            .enumerate()
            .map(|(i, (buffer, offset))| VertexBufferBinding {
                buffer: Some(*buffer),
                stride: match &self.pipeline {
                    BoundPipeline::Graphics(p) => p.vertex_stride(first_binding + i as u32),
                    _ => 0,
                },
                offset: *offset,
            })
            .collect();
        self.recorder
            .with(|ctx| ctx.set_vertex_buffers(first_binding, &bindings));
    }

    pub fn set_index_buffer(&mut self, buffer: &D3D11Buffer, offset: u64, format: IndexFormat) {
        if !self.ensure_open("set_index_buffer") {
            return;
        }
        let Ok(offset) = u32::try_from(offset) else {
            misuse!(self.shared.diagnostics, "set_index_buffer: offset {} exceeds 32 bits", offset);
            return;
        };
        let handle = buffer.handle();
        self.recorder
            .with(|ctx| ctx.set_index_buffer(Some(handle), format, offset));
    }

    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        if self.ensure_open("set_viewports") {
            self.recorder.with(|ctx| ctx.set_viewports(viewports));
        }
    }

    pub fn set_scissor_rects(&mut self, rects: &[ScissorRect]) {
        if self.ensure_open("set_scissor_rects") {
            self.recorder.with(|ctx| ctx.set_scissor_rects(rects));
        }
    }

    /// The reference travels with the depth-stencil state, so a bound graphics pipeline's state
    /// is re-issued.
    pub fn set_stencil_reference(&mut self, reference: u32) {
        if !self.ensure_open("set_stencil_reference") {
            return;
        }
        self.stencil_reference = reference;
        if let BoundPipeline::Graphics(pipeline) = &self.pipeline {
            let state = pipeline.depth_stencil;
            self.recorder
                .with(|ctx| ctx.set_depth_stencil_state(Some(state), reference));
        }
    }

    pub fn set_blend_constant(&mut self, color: [f32; 4]) {
        if !self.ensure_open("set_blend_constant") {
            return;
        }
        self.blend_constant = color;
        if let BoundPipeline::Graphics(pipeline) = &self.pipeline {
            let state = pipeline.blend;
            self.recorder
                .with(|ctx| ctx.set_blend_state(Some(state), color, u32::MAX));
        }
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        if !self.ensure_open("draw") {
            return;
        }
        self.flush_descriptor_sets();
        self.recorder.with(|ctx| {
            ctx.draw_instanced(vertex_count, instance_count, first_vertex, first_instance)
        });
        self.count_draws(1);
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        if !self.ensure_open("draw_indexed") {
            return;
        }
        self.flush_descriptor_sets();
        self.recorder.with(|ctx| {
            ctx.draw_indexed_instanced(index_count, instance_count, first_index, vertex_offset, first_instance)
        });
        self.count_draws(1);
    }

    /// `draw_count` single indirect draws reading records at `offset + i * stride`.
    /// `stride == 0` means tightly packed (16 bytes).
    pub fn draw_indirect(&mut self, buffer: &D3D11Buffer, offset: u64, draw_count: u32, stride: u32) {
        self.indirect_draws("draw_indirect", buffer, offset, draw_count, stride, DRAW_ARGS_SIZE, |ctx, b, o| {
            ctx.draw_instanced_indirect(b, o)
        });
    }

    /// As [`draw_indirect`](Self::draw_indirect) with 20-byte indexed records.
    pub fn draw_indexed_indirect(&mut self, buffer: &D3D11Buffer, offset: u64, draw_count: u32, stride: u32) {
        self.indirect_draws(
            "draw_indexed_indirect",
            buffer,
            offset,
            draw_count,
            stride,
            DRAW_INDEXED_ARGS_SIZE,
            |ctx, b, o| ctx.draw_indexed_instanced_indirect(b, o),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn indirect_draws(
        &mut self,
        op: &'static str,
        buffer: &D3D11Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
        record_size: u64,
        issue: fn(&mut dyn HwContext, BufferHandle, u32),
    ) {
        if !self.ensure_open(op) {
            return;
        }
        self.flush_descriptor_sets();
        let stride = if stride == 0 { record_size } else { u64::from(stride) };
        let handle = buffer.handle();
        let mut issued = 0;
        for i in 0..u64::from(draw_count) {
            let at = offset.saturating_add(i.saturating_mul(stride));
            match u32::try_from(at).ok().filter(|_| buffer.contains_range(at, record_size)) {
                Some(hw_offset) => {
                    self.recorder.with(|ctx| issue(ctx, handle, hw_offset));
                    issued += 1;
                }
                None => misuse!(
                    self.shared.diagnostics,
                    "{}: draw {} reads past the argument buffer (offset {}, buffer size {}), skipped",
                    op,
                    i,
                    at,
                    buffer.size()
                ),
            }
        }
        self.count_draws(issued);
    }

    fn count_draws(&mut self, count: u64) {
        self.stats.draws += count;
        self.shared.diagnostics.record_draws(count);
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        if !self.ensure_open("dispatch") {
            return;
        }
        self.flush_descriptor_sets();
        self.recorder.with(|ctx| ctx.dispatch(x, y, z));
        self.count_dispatch();
    }

    pub fn dispatch_indirect(&mut self, buffer: &D3D11Buffer, offset: u64) {
        if !self.ensure_open("dispatch_indirect") {
            return;
        }
        let Some(hw_offset) = u32::try_from(offset)
            .ok()
            .filter(|_| buffer.contains_range(offset, DISPATCH_ARGS_SIZE))
        else {
            misuse!(
                self.shared.diagnostics,
                "dispatch_indirect: arguments at {} exceed buffer size {}",
                offset,
                buffer.size()
            );
            return;
        };
        self.flush_descriptor_sets();
        let handle = buffer.handle();
        self.recorder.with(|ctx| ctx.dispatch_indirect(handle, hw_offset));
        self.count_dispatch();
    }

    fn count_dispatch(&mut self) {
        self.stats.dispatches += 1;
        self.shared.diagnostics.record_dispatch();
    }

    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &D3D11Buffer,
        src_offset: u64,
        dst: &D3D11Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        if !self.ensure_open("copy_buffer_to_buffer") {
            return;
        }
        if !src.contains_range(src_offset, size) || !dst.contains_range(dst_offset, size) {
            misuse!(
                self.shared.diagnostics,
                "copy_buffer_to_buffer: {} bytes from {} (size {}) to {} (size {}) out of bounds",
                size,
                src_offset,
                src.size(),
                dst_offset,
                dst.size()
            );
            return;
        }
        let (src, dst) = (src.handle(), dst.handle());
        self.recorder
            .with(|ctx| ctx.copy_buffer_region(dst, dst_offset, src, src_offset, size));
    }

    /// Copies `src_region` to `dst_region.origin` in the given mip/layer of `dst`.
    /// `dst_region.size` is ignored; the extent is `src_region.size`.
    pub fn copy_texture_to_texture(
        &mut self,
        src: &D3D11Texture,
        src_region: &TextureRegion,
        dst: &D3D11Texture,
        dst_region: &TextureRegion,
    ) {
        if !self.ensure_open("copy_texture_to_texture") {
            return;
        }
        if src.format().texel_size() != dst.format().texel_size() {
            misuse!(
                self.shared.diagnostics,
                "copy_texture_to_texture: {:?} and {:?} are not copy compatible",
                src.format(),
                dst.format()
            );
            return;
        }
        let dst_extent = TextureRegion {
            size: src_region.size,
            ..*dst_region
        };
        let src_box = match texture_box(src, src_region) {
            Ok(b) => b,
            Err(e) => {
                misuse!(self.shared.diagnostics, "copy_texture_to_texture: source {}", e);
                return;
            }
        };
        if let Err(e) = texture_box(dst, &dst_extent) {
            misuse!(self.shared.diagnostics, "copy_texture_to_texture: destination {}", e);
            return;
        }
        let src_sub = conv::subresource_index(src_region.mip_level, src_region.array_layer, src.mip_levels());
        let dst_sub = conv::subresource_index(dst_region.mip_level, dst_region.array_layer, dst.mip_levels());
        let (src, dst) = (src.handle(), dst.handle());
        self.recorder.with(|ctx| {
            ctx.copy_texture_region(dst, dst_sub, dst_region.origin, src, src_sub, Some(src_box))
        });
    }

    /// Reads the source through a CPU map and uploads it with a sub-resource update, so the
    /// source must be CPU-readable (readback memory). Immediate recorder only.
    pub fn copy_buffer_to_texture(
        &mut self,
        src: &D3D11Buffer,
        layout: BufferTextureLayout,
        dst: &D3D11Texture,
        region: &TextureRegion,
    ) -> Result<()> {
        if !self.ensure_open("copy_buffer_to_texture") {
            return Ok(());
        }
        let Recorder::Immediate(shared) = &self.recorder else {
            misuse!(self.shared.diagnostics, "copy_buffer_to_texture: needs the immediate recorder, skipped");
            return Ok(());
        };
        let dst_box = match texture_box(dst, region) {
            Ok(b) => b,
            Err(e) => {
                misuse!(self.shared.diagnostics, "copy_buffer_to_texture: {}", e);
                return Ok(());
            }
        };
        let pitches = match CopyPitches::new(dst.format().texel_size(), region, layout) {
            Ok(p) => p,
            Err(e) => {
                misuse!(self.shared.diagnostics, "copy_buffer_to_texture: {}", e);
                return Ok(());
            }
        };
        if pitches.len == 0 {
            return Ok(());
        }
        if !src.contains_range(layout.offset, pitches.len) {
            misuse!(
                self.shared.diagnostics,
                "copy_buffer_to_texture: {} bytes at {} exceed buffer size {}",
                pitches.len,
                layout.offset,
                src.size()
            );
            return Ok(());
        }
        let start = layout.offset as usize;
        let end = start + pitches.len as usize;
        let mut data = Vec::new();
        let mut ctx = lock_recorder(shared);
        let mapped = ctx.map_buffer(src.handle(), MapMode::Read, &mut |bytes| {
            if let Some(range) = bytes.get(start..end) {
                data.extend_from_slice(range);
            }
        });
        if let Err(e) = mapped {
            drop(ctx);
            self.shared.diagnostics.record_error();
            log::error!("copy_buffer_to_texture: {}", e);
            return Err(e);
        }
        let sub = conv::subresource_index(region.mip_level, region.array_layer, dst.mip_levels());
        ctx.update_texture(
            dst.handle(),
            sub,
            Some(dst_box),
            &data,
            pitches.row_pitch,
            pitches.image_pitch,
        );
        Ok(())
    }

    fn staging_texture(&mut self, source: &HwTextureDesc) -> Result<TextureHandle> {
        let desc = conv::staging_texture_desc(source);
        if let Some((cached, handle)) = &self.staging {
            if *cached == desc {
                return Ok(*handle);
            }
        }
        if let Some((_, old)) = self.staging.take() {
            self.shared.hw.release(HwObject::Texture(old));
        }
        let handle = self.shared.hw.create_texture(&desc)?;
        self.staging = Some((desc, handle));
        Ok(handle)
    }

    /// Copies through an internal staging texture, reads it back and writes the rows into
    /// `dst` at `layout`. Immediate recorder only.
    pub fn copy_texture_to_buffer(
        &mut self,
        src: &D3D11Texture,
        region: &TextureRegion,
        dst: &D3D11Buffer,
        layout: BufferTextureLayout,
    ) -> Result<()> {
        if !self.ensure_open("copy_texture_to_buffer") {
            return Ok(());
        }
        if self.is_deferred() {
            misuse!(self.shared.diagnostics, "copy_texture_to_buffer: needs the immediate recorder, skipped");
            return Ok(());
        }
        let src_box = match texture_box(src, region) {
            Ok(b) => b,
            Err(e) => {
                misuse!(self.shared.diagnostics, "copy_texture_to_buffer: {}", e);
                return Ok(());
            }
        };
        let texel = src.format().texel_size();
        let pitches = match CopyPitches::new(texel, region, layout) {
            Ok(p) => p,
            Err(e) => {
                misuse!(self.shared.diagnostics, "copy_texture_to_buffer: {}", e);
                return Ok(());
            }
        };
        if pitches.len == 0 {
            return Ok(());
        }
        if !dst.contains_range(layout.offset, pitches.len) {
            misuse!(
                self.shared.diagnostics,
                "copy_texture_to_buffer: {} bytes at {} exceed buffer size {}",
                pitches.len,
                layout.offset,
                dst.size()
            );
            return Ok(());
        }
        let staging = self.staging_texture(src.desc())?;
        let sub = conv::subresource_index(region.mip_level, region.array_layer, src.mip_levels());
        let (_, height, depth) = region.size;
        let (x, y, z) = region.origin;
        let row_len = pitches.tight;

        let mut rows: Vec<(u64, Vec<u8>)> = Vec::new();
        let shared = Arc::clone(&self.shared.immediate);
        let mut ctx = lock_recorder(&shared);
        ctx.copy_texture_region(staging, sub, region.origin, src.handle(), sub, Some(src_box));
        let mapped = ctx.map_texture(staging, sub, MapMode::Read, &mut |bytes, row_pitch, depth_pitch| {
            for slice in 0..depth {
                for row in 0..height {
                    let from = u64::from(z + slice)
                        .checked_mul(u64::from(depth_pitch))
                        .and_then(|o| o.checked_add(u64::from(y + row).checked_mul(u64::from(row_pitch))?))
                        .and_then(|o| o.checked_add(u64::from(x) * u64::from(texel)))
                        .and_then(|o| usize::try_from(o).ok());
                    let to = layout.offset
                        + u64::from(slice) * u64::from(pitches.image_pitch)
                        + u64::from(row) * u64::from(pitches.row_pitch);
                    let src_row = from.and_then(|from| bytes.get(from..from.checked_add(row_len as usize)?));
                    if let Some(src_row) = src_row {
                        rows.push((to, src_row.to_vec()));
                    }
                }
            }
        });
        let written = mapped.and_then(|()| {
            let regions: Vec<(u64, &[u8])> = rows.iter().map(|(o, r)| (*o, r.as_slice())).collect();
            write_buffer_regions(ctx.as_mut(), dst, &regions)
        });
        drop(ctx);
        if let Err(e) = written {
            self.shared.diagnostics.record_error();
            log::error!("copy_texture_to_buffer: {}", e);
            return Err(e);
        }
        Ok(())
    }

    pub fn begin_query(&mut self, pool: &QueryPool, index: u32) {
        if !self.ensure_open("begin_query") {
            return;
        }
        if pool.query_type() == QueryType::Timestamp {
            misuse!(self.shared.diagnostics, "begin_query: timestamp queries are only ended");
            return;
        }
        if let Some(query) = self.pool_query("begin_query", pool, index) {
            self.recorder.with(|ctx| ctx.begin_query(query));
        }
    }

    pub fn end_query(&mut self, pool: &QueryPool, index: u32) {
        if !self.ensure_open("end_query") {
            return;
        }
        if let Some(query) = self.pool_query("end_query", pool, index) {
            self.recorder.with(|ctx| ctx.end_query(query));
        }
    }

    fn pool_query(&self, op: &str, pool: &QueryPool, index: u32) -> Option<QueryHandle> {
        let query = pool.query(index);
        if query.is_none() {
            misuse!(
                self.shared.diagnostics,
                "{}: query {} out of range (pool holds {})",
                op,
                index,
                pool.count()
            );
        }
        query
    }

    /// No-op: hardware queries reset when they begin.
    pub fn reset_query_pool(&mut self, _pool: &QueryPool, first: u32, count: u32) {
        log::trace!("reset_query_pool: {}..{} (implicit)", first, first.saturating_add(count));
    }

    /// Waits for `count` results starting at `first` and writes them contiguously into `dest`
    /// at `dest_offset`, one [`QueryType::result_size`] record each.
    ///
    /// Results are read and written on the immediate recorder, so a deferred context must have
    /// submitted the recording that ended the queries. Each query is polled with backoff for up
    /// to the configured query timeout; on timeout nothing is written.
    pub fn resolve_queries(
        &mut self,
        pool: &QueryPool,
        first: u32,
        count: u32,
        dest: &D3D11Buffer,
        dest_offset: u64,
    ) -> Result<()> {
        if !self.ensure_open("resolve_queries") {
            return Ok(());
        }
        if first.checked_add(count).map_or(true, |end| end > pool.count()) {
            misuse!(
                self.shared.diagnostics,
                "resolve_queries: {}..+{} out of range (pool holds {})",
                first,
                count,
                pool.count()
            );
            return Ok(());
        }
        let record = pool.result_size();
        let total = record * u64::from(count);
        if !dest.contains_range(dest_offset, total) {
            misuse!(
                self.shared.diagnostics,
                "resolve_queries: {} bytes at {} exceed buffer size {}",
                total,
                dest_offset,
                dest.size()
            );
            return Ok(());
        }
        let mut results = vec![0u8; total as usize];
        let mut ctx = lock_recorder(&self.shared.immediate);
        for (i, out) in results.chunks_exact_mut(record as usize).enumerate() {
            let index = first + i as u32;
            let Some(query) = pool.query(index) else {
                continue;
            };
            match poll_query(ctx.as_mut(), query, out, self.shared.query_timeout) {
                Ok(true) => {}
                Ok(false) => {
                    drop(ctx);
                    self.shared.diagnostics.record_error();
                    log::error!("resolve_queries: query {} not ready after {:?}", index, self.shared.query_timeout);
                    return Err(Error::QueryNotReady { index });
                }
                Err(e) => {
                    drop(ctx);
                    self.shared.diagnostics.record_error();
                    log::error!("resolve_queries: {}", e);
                    return Err(e);
                }
            }
        }
        write_buffer_regions(ctx.as_mut(), dest, &[(dest_offset, &results)])
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        self.release_finished();
        if let Some((_, staging)) = self.staging.take() {
            self.shared.hw.release(HwObject::Texture(staging));
        }
    }
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("open", &self.is_open)
            .field("deferred", &self.is_deferred())
            .field("dirty", &self.descriptor_sets_dirty)
            .finish()
    }
}

/// The box `region` covers in `texture`, or why it does not fit the texture's mips, layers or
/// the mip's extent.
fn texture_box(texture: &D3D11Texture, region: &TextureRegion) -> std::result::Result<HwBox, String> {
    let desc = texture.desc();
    if region.mip_level >= desc.mip_levels {
        return Err(format!("mip {} of a texture with {} mips", region.mip_level, desc.mip_levels));
    }
    let volume = desc.dimension == TextureDimension::D3;
    let layers = if volume { 1 } else { desc.depth_or_layers.max(1) };
    if region.array_layer >= layers {
        return Err(format!("layer {} of a texture with {} layers", region.array_layer, layers));
    }
    let mip = |extent: u32| extent.checked_shr(region.mip_level).unwrap_or(0).max(1);
    let extent = (
        mip(desc.width),
        mip(desc.height),
        if volume { mip(desc.depth_or_layers) } else { 1 },
    );
    let (x, y, z) = region.origin;
    let (w, h, d) = region.size;
    let d = d.max(1);
    let fits = |origin: u32, size: u32, extent: u32| u64::from(origin) + u64::from(size) <= u64::from(extent);
    if !(fits(x, w, extent.0) && fits(y, h, extent.1) && fits(z, d, extent.2)) {
        return Err(format!(
            "region at {:?} of size {:?} exceeds mip {} extent {:?}",
            region.origin, region.size, region.mip_level, extent
        ));
    }
    Ok(HwBox {
        left: x,
        top: y,
        front: z,
        right: x + w,
        bottom: y + h,
        back: z + d,
    })
}

/// Buffer-side pitches of a buffer/texture copy.
struct CopyPitches {
    row_pitch: u32,
    image_pitch: u32,
    /// Bytes in one tightly packed row.
    tight: u64,
    /// Bytes spanned in the buffer, last row tight.
    len: u64,
}

impl CopyPitches {
    fn new(
        texel_size: u32,
        region: &TextureRegion,
        layout: BufferTextureLayout,
    ) -> std::result::Result<Self, String> {
        let (width, height, depth) = region.size;
        let tight = u64::from(width) * u64::from(texel_size);
        let row_pitch = if layout.bytes_per_row == 0 {
            u32::try_from(tight).map_err(|_| format!("a {}-byte row exceeds 32 bits", tight))?
        } else {
            layout.bytes_per_row
        };
        if u64::from(row_pitch) < tight {
            return Err(format!("bytes_per_row {} smaller than a {}-byte row", row_pitch, tight));
        }
        let rows = if layout.rows_per_image == 0 { height } else { layout.rows_per_image.max(height) };
        let image_pitch = u32::try_from(u64::from(row_pitch) * u64::from(rows))
            .map_err(|_| format!("{} rows of {} bytes exceed 32 bits", rows, row_pitch))?;
        let len = if width == 0 || height == 0 || depth == 0 {
            Some(0)
        } else {
            (u64::from(image_pitch) * u64::from(depth - 1))
                .checked_add(u64::from(row_pitch) * u64::from(height - 1))
                .and_then(|n| n.checked_add(tight))
        };
        let len = len.ok_or_else(|| format!("copy of {:?} spans more than 64 bits", region.size))?;
        Ok(Self {
            row_pitch,
            image_pitch,
            tight,
            len,
        })
    }
}

/// Writes `data` into `block` at `offset`. False, with `block` untouched, when it does not fit.
fn write_push_constants(block: &mut [u8], offset: u32, data: &[u8]) -> bool {
    let start = offset as usize;
    let Some(dst) = start.checked_add(data.len()).and_then(|end| block.get_mut(start..end)) else {
        return false;
    };
    dst.copy_from_slice(data);
    true
}

/// Writes byte ranges into `buffer` with whatever path its memory allows.
pub(crate) fn write_buffer_regions(
    ctx: &mut dyn HwContext,
    buffer: &D3D11Buffer,
    regions: &[(u64, &[u8])],
) -> Result<()> {
    match buffer.memory() {
        BufferMemoryPreference::DeviceLocal => {
            for (offset, data) in regions {
                ctx.update_buffer(buffer.handle(), *offset, data);
            }
            Ok(())
        }
        memory => {
            let mode = if memory == BufferMemoryPreference::Readback {
                MapMode::ReadWrite
            } else {
                MapMode::WriteNoOverwrite
            };
            ctx.map_buffer(buffer.handle(), mode, &mut |bytes| {
                for (offset, data) in regions {
                    let start = *offset as usize;
                    if let Some(dst) = bytes.get_mut(start..start + data.len()) {
                        dst.copy_from_slice(data);
                    }
                }
            })
        }
    }
}

const SPIN_POLLS: u32 = 64;
const YIELD_POLLS: u32 = 128;

fn backoff(attempt: u32) {
    if attempt < SPIN_POLLS {
        std::hint::spin_loop();
    } else if attempt < YIELD_POLLS {
        std::thread::yield_now();
    } else {
        let step = ((attempt - YIELD_POLLS) / 16).min(3);
        std::thread::sleep(Duration::from_micros(100 << step));
    }
}

/// Ok(false) when `timeout` elapsed first.
fn poll_query(
    ctx: &mut dyn HwContext,
    query: QueryHandle,
    out: &mut [u8],
    timeout: Option<Duration>,
) -> Result<bool> {
    let start = Instant::now();
    let mut attempt = 0u32;
    loop {
        if ctx.get_query_data(query, out)? {
            return Ok(true);
        }
        if timeout.is_some_and(|t| start.elapsed() >= t) {
            return Ok(false);
        }
        backoff(attempt);
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(size: (u32, u32, u32)) -> TextureRegion {
        TextureRegion {
            mip_level: 0,
            array_layer: 0,
            origin: (0, 0, 0),
            size,
        }
    }

    fn tight() -> BufferTextureLayout {
        BufferTextureLayout {
            offset: 0,
            bytes_per_row: 0,
            rows_per_image: 0,
        }
    }

    #[test]
    fn copy_pitches_default_to_tight_rows() {
        let p = CopyPitches::new(4, &region((8, 4, 1)), tight()).unwrap();
        assert_eq!((p.row_pitch, p.image_pitch, p.tight, p.len), (32, 128, 32, 128));
    }

    #[test]
    fn copy_pitches_last_row_is_tight() {
        let layout = BufferTextureLayout {
            bytes_per_row: 256,
            ..tight()
        };
        let p = CopyPitches::new(4, &region((8, 2, 1)), layout).unwrap();
        assert_eq!(p.len, 256 + 32);
        let narrow = BufferTextureLayout {
            bytes_per_row: 16,
            ..layout
        };
        assert!(CopyPitches::new(4, &region((8, 2, 1)), narrow).is_err());
    }

    #[test]
    fn copy_pitches_reject_overflowing_regions() {
        assert!(CopyPitches::new(4, &region((0x4000_0000, 1, 1)), tight()).is_err());
        let tall = BufferTextureLayout {
            bytes_per_row: u32::MAX,
            rows_per_image: 4,
            ..tight()
        };
        assert!(CopyPitches::new(4, &region((1, 1, 1)), tall).is_err());
        let wide = BufferTextureLayout {
            bytes_per_row: u32::MAX,
            ..tight()
        };
        assert!(CopyPitches::new(4, &region((1, u32::MAX, 1)), wide).is_err());
    }

    #[test]
    fn push_constant_writes_stay_in_bounds() {
        let mut block = vec![0u8; 32];
        assert!(write_push_constants(&mut block, 4, &[1, 2, 3, 4]));
        assert_eq!(&block[..8], &[0, 0, 0, 0, 1, 2, 3, 4]);
        let before = block.clone();
        assert!(!write_push_constants(&mut block, 30, &[0; 4]));
        assert!(!write_push_constants(&mut block, u32::MAX, &[0; 4]));
        assert_eq!(block, before);
    }
}
