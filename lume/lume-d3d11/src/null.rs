//! Recording null hardware: an in-process [`HwDevice`] / [`HwContext`] pair.
//!
//! Every context call lands in a command log that tests inspect. Buffer and texture memory is
//! simulated so maps, copies and sub-resource updates have visible effects. Deferred contexts
//! record into command lists that the immediate context replays. Queries count the work drawn
//! between begin and end (one sample per vertex) and become available after a configurable
//! number of polls.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lume_rhi::{
    DispatchIndirectArgs, DrawIndexedIndirectArgs, DrawIndirectArgs, IndexFormat,
    PipelineStatistics, PrimitiveTopology, QueryType, ScissorRect, TextureDimension, Viewport,
};

use crate::error::{Error, ObjectKind, Result};
use crate::hw::{
    BindFlags, BlendDesc, BlendStateHandle, BufferHandle, ClearFlags, CommandListHandle,
    ConstantBufferBinding, CpuAccess, DepthStencilDesc, DepthStencilStateHandle, DeviceCaps,
    DsvHandle, HwBox, HwBufferDesc, HwContext, HwDevice, HwObject, HwStage, HwTextureDesc,
    InputElementDesc, InputLayoutHandle, MapMode, QueryHandle, RasterizerDesc,
    RasterizerStateHandle, ResourceUsage, RtvHandle, SamplerDesc, SamplerStateHandle,
    ShaderHandle, SrvHandle, TextureHandle, UavHandle, VertexBufferBinding, ViewSource,
};

/// One recorded context call.
#[derive(Debug, Clone, PartialEq)]
pub enum HwCommand {
    SetShader { stage: HwStage, shader: Option<ShaderHandle> },
    SetConstantBuffer { stage: HwStage, slot: u32, binding: Option<ConstantBufferBinding> },
    SetShaderResource { stage: HwStage, slot: u32, view: Option<SrvHandle> },
    SetUnorderedAccess { slot: u32, view: Option<UavHandle> },
    SetSampler { stage: HwStage, slot: u32, sampler: Option<SamplerStateHandle> },
    SetInputLayout(Option<InputLayoutHandle>),
    SetPrimitiveTopology(PrimitiveTopology),
    SetRasterizerState(Option<RasterizerStateHandle>),
    SetDepthStencilState { state: Option<DepthStencilStateHandle>, stencil_ref: u32 },
    SetBlendState { state: Option<BlendStateHandle>, blend_factor: [f32; 4], sample_mask: u32 },
    SetVertexBuffers { start_slot: u32, buffers: Vec<VertexBufferBinding> },
    SetIndexBuffer { buffer: Option<BufferHandle>, format: IndexFormat, offset: u32 },
    SetViewports(Vec<Viewport>),
    SetScissorRects(Vec<ScissorRect>),
    SetRenderTargets { targets: Vec<Option<RtvHandle>>, depth_stencil: Option<DsvHandle> },
    ClearRenderTarget { target: RtvHandle, color: [f32; 4] },
    ClearDepthStencil { target: DsvHandle, flags: ClearFlags, depth: f32, stencil: u8 },
    Draw { vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32 },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    },
    DrawIndirect { args: BufferHandle, offset: u32 },
    DrawIndexedIndirect { args: BufferHandle, offset: u32 },
    Dispatch { x: u32, y: u32, z: u32 },
    DispatchIndirect { args: BufferHandle, offset: u32 },
    CopyBuffer { dst: BufferHandle, dst_offset: u64, src: BufferHandle, src_offset: u64, size: u64 },
    CopyTexture {
        dst: TextureHandle,
        dst_subresource: u32,
        dst_origin: (u32, u32, u32),
        src: TextureHandle,
        src_subresource: u32,
        src_box: Option<HwBox>,
    },
    UpdateBuffer { dst: BufferHandle, offset: u64, data: Vec<u8> },
    UpdateTexture {
        dst: TextureHandle,
        subresource: u32,
        dst_box: Option<HwBox>,
        data: Vec<u8>,
        row_pitch: u32,
        depth_pitch: u32,
    },
    /// `written` carries the bytes of a discard map made on a deferred context.
    MapBuffer { buffer: BufferHandle, mode: MapMode, written: Option<Vec<u8>> },
    MapTexture { texture: TextureHandle, subresource: u32, mode: MapMode },
    BeginQuery(QueryHandle),
    EndQuery(QueryHandle),
    BeginEvent(String),
    EndEvent,
    SetMarker(String),
    ExecuteCommandList(CommandListHandle),
}

impl HwCommand {
    pub fn is_draw(&self) -> bool {
        matches!(
            self,
            HwCommand::Draw { .. }
                | HwCommand::DrawIndexed { .. }
                | HwCommand::DrawIndirect { .. }
                | HwCommand::DrawIndexedIndirect { .. }
        )
    }
}

#[derive(Debug)]
struct NullBuffer {
    desc: HwBufferDesc,
    data: Vec<u8>,
}

#[derive(Debug)]
struct NullTexture {
    desc: HwTextureDesc,
    subresources: Vec<Vec<u8>>,
}

impl NullTexture {
    fn new(desc: HwTextureDesc) -> Self {
        let layers = if desc.dimension == TextureDimension::D3 { 1 } else { desc.depth_or_layers.max(1) };
        let count = desc.mip_levels.max(1) * layers;
        let mut texture = Self {
            desc,
            subresources: Vec::new(),
        };
        texture.subresources = (0..count)
            .map(|sub| {
                let (w, h, d) = texture.mip_extent(sub);
                vec![0; (w * h * d * texture.texel()) as usize]
            })
            .collect();
        texture
    }

    fn texel(&self) -> u32 {
        self.desc.format.texel_size()
    }

    fn mip_extent(&self, sub: u32) -> (u32, u32, u32) {
        let mip = sub % self.desc.mip_levels.max(1);
        let depth = if self.desc.dimension == TextureDimension::D3 {
            (self.desc.depth_or_layers >> mip).max(1)
        } else {
            1
        };
        ((self.desc.width >> mip).max(1), (self.desc.height >> mip).max(1), depth)
    }

    fn extent(&self, sub: u32) -> Option<(u32, u32, u32)> {
        ((sub as usize) < self.subresources.len()).then(|| self.mip_extent(sub))
    }

    /// (row pitch, depth pitch) of the tightly packed sub-resource.
    fn pitches(&self, sub: u32) -> (u32, u32) {
        let (w, h, _) = self.mip_extent(sub);
        let row = w * self.texel();
        (row, row * h)
    }

    fn full_box(&self, sub: u32) -> Option<HwBox> {
        let (w, h, d) = self.extent(sub)?;
        Some(HwBox {
            left: 0,
            top: 0,
            front: 0,
            right: w,
            bottom: h,
            back: d,
        })
    }

    /// Tightly packed copy of `b`.
    fn read_box(&self, sub: u32, b: HwBox) -> Option<Vec<u8>> {
        let (w, h, d) = self.extent(sub)?;
        if b.right > w || b.bottom > h || b.back > d || b.left > b.right || b.top > b.bottom || b.front > b.back {
            return None;
        }
        let (row_pitch, depth_pitch) = self.pitches(sub);
        let texel = self.texel() as usize;
        let len = (b.right - b.left) as usize * texel;
        let data = &self.subresources[sub as usize];
        let mut out = Vec::new();
        for z in b.front..b.back {
            for y in b.top..b.bottom {
                let start = z as usize * depth_pitch as usize + y as usize * row_pitch as usize + b.left as usize * texel;
                out.extend_from_slice(data.get(start..start + len)?);
            }
        }
        Some(out)
    }

    /// Writes rows of `data` (laid out with the given pitches) into `b`. False when out of range.
    fn write_box(&mut self, sub: u32, b: HwBox, data: &[u8], row_pitch: usize, depth_pitch: usize) -> bool {
        let Some((w, h, d)) = self.extent(sub) else {
            return false;
        };
        if b.right > w || b.bottom > h || b.back > d || b.left > b.right || b.top > b.bottom || b.front > b.back {
            return false;
        }
        let (dst_row, dst_depth) = self.pitches(sub);
        let texel = self.texel() as usize;
        let len = (b.right - b.left) as usize * texel;
        let target = &mut self.subresources[sub as usize];
        for z in 0..(b.back - b.front) as usize {
            for y in 0..(b.bottom - b.top) as usize {
                let from = z * depth_pitch + y * row_pitch;
                let to = (b.front as usize + z) * dst_depth as usize
                    + (b.top as usize + y) * dst_row as usize
                    + b.left as usize * texel;
                let (Some(row), Some(dst)) = (data.get(from..from + len), target.get_mut(to..to + len)) else {
                    return false;
                };
                dst.copy_from_slice(row);
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct QueryCounters {
    samples: u64,
    stats: PipelineStatistics,
}

#[derive(Debug, Clone)]
enum QueryState {
    Idle,
    Active(QueryCounters),
    Ended { polls_left: u32, result: Vec<u8> },
}

#[derive(Debug)]
struct NullQuery {
    ty: QueryType,
    state: QueryState,
}

#[derive(Debug, Default)]
struct NullState {
    next_handle: u64,
    removed: Option<String>,
    failing: HashSet<ObjectKind>,
    created: HashMap<ObjectKind, usize>,
    live: HashSet<HwObject>,
    buffers: HashMap<BufferHandle, NullBuffer>,
    textures: HashMap<TextureHandle, NullTexture>,
    queries: HashMap<QueryHandle, NullQuery>,
    command_lists: HashMap<CommandListHandle, Vec<HwCommand>>,
    log: Vec<HwCommand>,
    topology: PrimitiveTopology,
    query_latency: u32,
    timestamp: u64,
}

impl NullState {
    fn admit(&mut self, kind: ObjectKind) -> Result<()> {
        if let Some(reason) = &self.removed {
            return Err(Error::DeviceRemoved(reason.clone()));
        }
        if self.failing.contains(&kind) {
            return Err(Error::creation(kind, "injected failure"));
        }
        *self.created.entry(kind).or_default() += 1;
        Ok(())
    }

    fn create<H: Copy>(&mut self, kind: ObjectKind, handle: fn(u64) -> H, object: fn(H) -> HwObject) -> Result<H> {
        self.admit(kind)?;
        self.next_handle += 1;
        let h = handle(self.next_handle);
        self.live.insert(object(h));
        Ok(h)
    }

    fn read_args<T: bytemuck::Pod>(&self, buffer: BufferHandle, offset: u32) -> Option<T> {
        let data = &self.buffers.get(&buffer)?.data;
        let start = offset as usize;
        let bytes = data.get(start..start + std::mem::size_of::<T>())?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    fn count_vertices(&mut self, vertices: u64) {
        let primitives = match self.topology {
            PrimitiveTopology::TriangleList => vertices / 3,
            PrimitiveTopology::TriangleStrip => vertices.saturating_sub(2),
            PrimitiveTopology::LineList => vertices / 2,
            PrimitiveTopology::LineStrip => vertices.saturating_sub(1),
            PrimitiveTopology::PointList => vertices,
        };
        for query in self.queries.values_mut() {
            if let QueryState::Active(counters) = &mut query.state {
                counters.samples += vertices;
                let stats = &mut counters.stats;
                stats.input_assembly_vertices += vertices;
                stats.input_assembly_primitives += primitives;
                stats.vertex_shader_invocations += vertices;
                stats.clipping_invocations += primitives;
                stats.clipping_primitives += primitives;
            }
        }
    }

    fn count_groups(&mut self, x: u32, y: u32, z: u32) {
        let groups = u64::from(x) * u64::from(y) * u64::from(z);
        for query in self.queries.values_mut() {
            if let QueryState::Active(counters) = &mut query.state {
                counters.stats.compute_shader_invocations += groups;
            }
        }
    }

    fn end_query(&mut self, handle: QueryHandle) {
        self.timestamp += 1000;
        let (timestamp, latency) = (self.timestamp, self.query_latency);
        let Some(query) = self.queries.get_mut(&handle) else {
            log::warn!("null device: end of unknown query {:?}", handle);
            return;
        };
        let counters = match &query.state {
            QueryState::Active(counters) => *counters,
            _ => QueryCounters::default(),
        };
        let result = match query.ty {
            QueryType::Occlusion => counters.samples.to_le_bytes().to_vec(),
            QueryType::BinaryOcclusion => u64::from(counters.samples > 0).to_le_bytes().to_vec(),
            QueryType::Timestamp => timestamp.to_le_bytes().to_vec(),
            QueryType::PipelineStatistics => bytemuck::bytes_of(&counters.stats).to_vec(),
        };
        query.state = QueryState::Ended {
            polls_left: latency,
            result,
        };
    }

    fn write_buffer(&mut self, dst: BufferHandle, offset: u64, data: &[u8]) {
        let start = offset as usize;
        match self
            .buffers
            .get_mut(&dst)
            .and_then(|b| b.data.get_mut(start..start + data.len()))
        {
            Some(target) => target.copy_from_slice(data),
            None => log::warn!("null device: write of {} bytes at {} into {:?} out of range", data.len(), offset, dst),
        }
    }

    fn copy_texture(
        &mut self,
        dst: TextureHandle,
        dst_sub: u32,
        origin: (u32, u32, u32),
        src: TextureHandle,
        src_sub: u32,
        src_box: Option<HwBox>,
    ) {
        let packed = self.textures.get(&src).and_then(|t| {
            let b = src_box.or_else(|| t.full_box(src_sub))?;
            Some((t.read_box(src_sub, b)?, b, t.texel()))
        });
        let Some((data, b, texel)) = packed else {
            log::warn!("null device: texture copy source {:?} region invalid", src);
            return;
        };
        let (w, h, d) = (b.right - b.left, b.bottom - b.top, b.back - b.front);
        let dst_box = HwBox {
            left: origin.0,
            top: origin.1,
            front: origin.2,
            right: origin.0 + w,
            bottom: origin.1 + h,
            back: origin.2 + d,
        };
        let row = (w * texel) as usize;
        let written = self
            .textures
            .get_mut(&dst)
            .is_some_and(|t| t.write_box(dst_sub, dst_box, &data, row, row * h as usize));
        if !written {
            log::warn!("null device: texture copy into {:?} out of range", dst);
        }
    }

    /// Applies the effects of `command` and appends it to the log.
    fn execute(&mut self, command: HwCommand) {
        match &command {
            HwCommand::SetPrimitiveTopology(topology) => self.topology = *topology,
            HwCommand::Draw {
                vertex_count,
                instance_count,
                ..
            } => self.count_vertices(u64::from(*vertex_count) * u64::from(*instance_count)),
            HwCommand::DrawIndexed {
                index_count,
                instance_count,
                ..
            } => self.count_vertices(u64::from(*index_count) * u64::from(*instance_count)),
            HwCommand::DrawIndirect { args, offset } => {
                if let Some(a) = self.read_args::<DrawIndirectArgs>(*args, *offset) {
                    self.count_vertices(u64::from(a.vertex_count) * u64::from(a.instance_count));
                }
            }
            HwCommand::DrawIndexedIndirect { args, offset } => {
                if let Some(a) = self.read_args::<DrawIndexedIndirectArgs>(*args, *offset) {
                    self.count_vertices(u64::from(a.index_count) * u64::from(a.instance_count));
                }
            }
            HwCommand::Dispatch { x, y, z } => self.count_groups(*x, *y, *z),
            HwCommand::DispatchIndirect { args, offset } => {
                if let Some(a) = self.read_args::<DispatchIndirectArgs>(*args, *offset) {
                    self.count_groups(a.x, a.y, a.z);
                }
            }
            HwCommand::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                let start = *src_offset as usize;
                let bytes = self
                    .buffers
                    .get(src)
                    .and_then(|b| b.data.get(start..start + *size as usize))
                    .map(<[u8]>::to_vec);
                match bytes {
                    Some(bytes) => self.write_buffer(*dst, *dst_offset, &bytes),
                    None => log::warn!("null device: buffer copy source {:?} out of range", src),
                }
            }
            HwCommand::CopyTexture {
                dst,
                dst_subresource,
                dst_origin,
                src,
                src_subresource,
                src_box,
            } => self.copy_texture(*dst, *dst_subresource, *dst_origin, *src, *src_subresource, *src_box),
            HwCommand::UpdateBuffer { dst, offset, data } => self.write_buffer(*dst, *offset, data),
            HwCommand::UpdateTexture {
                dst,
                subresource,
                dst_box,
                data,
                row_pitch,
                depth_pitch,
            } => {
                let written = self.textures.get_mut(dst).is_some_and(|t| {
                    match dst_box.or_else(|| t.full_box(*subresource)) {
                        Some(b) => t.write_box(*subresource, b, data, *row_pitch as usize, *depth_pitch as usize),
                        None => false,
                    }
                });
                if !written {
                    log::warn!("null device: texture update of {:?} out of range", dst);
                }
            }
            HwCommand::MapBuffer {
                buffer,
                written: Some(data),
                ..
            } => {
                if let Some(b) = self.buffers.get_mut(buffer) {
                    b.data.clone_from(data);
                }
            }
            HwCommand::BeginQuery(handle) => match self.queries.get_mut(handle) {
                Some(query) => query.state = QueryState::Active(QueryCounters::default()),
                None => log::warn!("null device: begin of unknown query {:?}", handle),
            },
            HwCommand::EndQuery(handle) => self.end_query(*handle),
            _ => {}
        }
        let replay = match &command {
            HwCommand::ExecuteCommandList(list) => match self.command_lists.get(list) {
                Some(commands) => commands.clone(),
                None => {
                    log::warn!("null device: execute of unknown command list {:?}", list);
                    Vec::new()
                }
            },
            _ => Vec::new(),
        };
        self.log.push(command);
        for command in replay {
            self.execute(command);
        }
    }
}

fn check_map(usage: ResourceUsage, cpu_access: CpuAccess, mode: MapMode) -> Result<()> {
    let (read, write) = match mode {
        MapMode::Read => (true, false),
        MapMode::ReadWrite => (true, true),
        MapMode::WriteDiscard | MapMode::WriteNoOverwrite => (false, true),
    };
    if (read && !cpu_access.contains(CpuAccess::READ)) || (write && !cpu_access.contains(CpuAccess::WRITE)) {
        return Err(Error::MapFailed(format!("{:?} map without matching CPU access", mode)));
    }
    let expected = match mode {
        MapMode::WriteDiscard | MapMode::WriteNoOverwrite => ResourceUsage::Dynamic,
        MapMode::Read | MapMode::ReadWrite => ResourceUsage::Staging,
    };
    if usage != expected {
        return Err(Error::MapFailed(format!("{:?} map needs a {:?} resource", mode, expected)));
    }
    Ok(())
}

fn lock(state: &Mutex<NullState>) -> MutexGuard<'_, NullState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The null device. Clones share all state, so a test can keep one clone for inspection and hand
/// another to the backend.
#[derive(Debug, Clone)]
pub struct NullDevice {
    caps: DeviceCaps,
    state: Arc<Mutex<NullState>>,
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new(DeviceCaps {
            deferred_contexts: true,
            constant_buffer_offsetting: true,
        })
    }
}

impl NullDevice {
    pub fn new(caps: DeviceCaps) -> Self {
        let state = NullState {
            query_latency: 1,
            ..NullState::default()
        };
        Self {
            caps,
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, NullState> {
        lock(&self.state)
    }

    /// Everything executed on the immediate context so far, replayed command lists included.
    pub fn commands(&self) -> Vec<HwCommand> {
        self.state().log.clone()
    }

    pub fn take_commands(&self) -> Vec<HwCommand> {
        std::mem::take(&mut self.state().log)
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state().buffers.get(&buffer).map(|b| b.data.clone())
    }

    pub fn texture_contents(&self, texture: TextureHandle, subresource: u32) -> Option<Vec<u8>> {
        self.state()
            .textures
            .get(&texture)
            .and_then(|t| t.subresources.get(subresource as usize).cloned())
    }

    /// Number of failed polls before an ended query reports its result.
    pub fn set_query_latency(&self, polls: u32) {
        self.state().query_latency = polls;
    }

    /// Makes every creation of `kind` fail until switched off again.
    pub fn fail_creation(&self, kind: ObjectKind, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing.insert(kind);
        } else {
            state.failing.remove(&kind);
        }
    }

    /// Simulates device removal: creation fails and the reason is reported from now on.
    pub fn remove_device(&self, reason: impl Into<String>) {
        self.state().removed = Some(reason.into());
    }

    pub fn creation_count(&self, kind: ObjectKind) -> usize {
        self.state().created.get(&kind).copied().unwrap_or(0)
    }

    pub fn live_objects(&self) -> usize {
        self.state().live.len()
    }

    pub fn is_live(&self, object: HwObject) -> bool {
        self.state().live.contains(&object)
    }

    pub fn command_list_count(&self) -> usize {
        self.state().command_lists.len()
    }
}

impl HwDevice for NullDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn immediate_context(&self) -> Result<Box<dyn HwContext>> {
        Ok(Box::new(NullContext {
            state: Arc::clone(&self.state),
            deferred: false,
            recording: Vec::new(),
        }))
    }

    fn create_deferred_context(&self) -> Result<Box<dyn HwContext>> {
        if !self.caps.deferred_contexts {
            return Err(Error::Unsupported("deferred contexts"));
        }
        self.state().admit(ObjectKind::DeferredContext)?;
        Ok(Box::new(NullContext {
            state: Arc::clone(&self.state),
            deferred: true,
            recording: Vec::new(),
        }))
    }

    fn create_rasterizer_state(&self, _desc: &RasterizerDesc) -> Result<RasterizerStateHandle> {
        self.state()
            .create(ObjectKind::RasterizerState, RasterizerStateHandle, HwObject::RasterizerState)
    }

    fn create_depth_stencil_state(&self, _desc: &DepthStencilDesc) -> Result<DepthStencilStateHandle> {
        self.state().create(
            ObjectKind::DepthStencilState,
            DepthStencilStateHandle,
            HwObject::DepthStencilState,
        )
    }

    fn create_blend_state(&self, _desc: &BlendDesc) -> Result<BlendStateHandle> {
        self.state()
            .create(ObjectKind::BlendState, BlendStateHandle, HwObject::BlendState)
    }

    fn create_sampler_state(&self, desc: &SamplerDesc) -> Result<SamplerStateHandle> {
        if desc.max_anisotropy > 16 {
            return Err(Error::creation(ObjectKind::SamplerState, "anisotropy above 16"));
        }
        self.state()
            .create(ObjectKind::SamplerState, SamplerStateHandle, HwObject::SamplerState)
    }

    fn create_input_layout(&self, elements: &[InputElementDesc], vs_bytecode: &[u8]) -> Result<InputLayoutHandle> {
        if vs_bytecode.is_empty() || elements.is_empty() {
            return Err(Error::creation(ObjectKind::InputLayout, "no elements or no vertex shader signature"));
        }
        self.state()
            .create(ObjectKind::InputLayout, InputLayoutHandle, HwObject::InputLayout)
    }

    fn create_shader(&self, stage: HwStage, bytecode: &[u8]) -> Result<ShaderHandle> {
        if bytecode.is_empty() {
            return Err(Error::creation(ObjectKind::Shader, format!("empty {:?} bytecode", stage)));
        }
        self.state().create(ObjectKind::Shader, ShaderHandle, HwObject::Shader)
    }

    fn create_buffer(&self, desc: &HwBufferDesc, initial_data: Option<&[u8]>) -> Result<BufferHandle> {
        let invalid = if desc.byte_width == 0 {
            Some("zero byte width")
        } else if desc.bind.contains(BindFlags::CONSTANT_BUFFER) && desc.byte_width % 16 != 0 {
            Some("constant buffer width not a multiple of 16")
        } else if desc.usage == ResourceUsage::Dynamic && !desc.cpu_access.contains(CpuAccess::WRITE) {
            Some("dynamic buffer without CPU write access")
        } else if desc.usage == ResourceUsage::Staging && !desc.bind.is_empty() {
            Some("staging buffer with bind flags")
        } else if desc.usage == ResourceUsage::Immutable && initial_data.is_none() {
            Some("immutable buffer without initial data")
        } else {
            None
        };
        if let Some(reason) = invalid {
            return Err(Error::creation(ObjectKind::Buffer, reason));
        }
        let mut data = vec![0; desc.byte_width as usize];
        if let Some(init) = initial_data {
            let n = init.len().min(data.len());
            data[..n].copy_from_slice(&init[..n]);
        }
        let mut state = self.state();
        let handle = state.create(ObjectKind::Buffer, BufferHandle, HwObject::Buffer)?;
        state.buffers.insert(handle, NullBuffer { desc: desc.clone(), data });
        Ok(handle)
    }

    fn create_texture(&self, desc: &HwTextureDesc) -> Result<TextureHandle> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 {
            return Err(Error::creation(ObjectKind::Texture, "zero extent or mip count"));
        }
        if desc.usage == ResourceUsage::Staging && !desc.bind.is_empty() {
            return Err(Error::creation(ObjectKind::Texture, "staging texture with bind flags"));
        }
        let mut state = self.state();
        let handle = state.create(ObjectKind::Texture, TextureHandle, HwObject::Texture)?;
        state.textures.insert(handle, NullTexture::new(desc.clone()));
        Ok(handle)
    }

    fn create_shader_resource_view(&self, source: ViewSource) -> Result<SrvHandle> {
        let mut state = self.state();
        let bindable = match source {
            ViewSource::Buffer(b) => state.buffers.get(&b).map(|b| b.desc.bind),
            ViewSource::Texture(t) => state.textures.get(&t).map(|t| t.desc.bind),
        };
        if !bindable.is_some_and(|bind| bind.contains(BindFlags::SHADER_RESOURCE)) {
            return Err(Error::creation(ObjectKind::View, format!("{:?} is not a shader resource", source)));
        }
        state.create(ObjectKind::View, SrvHandle, HwObject::Srv)
    }

    fn create_unordered_access_view(&self, source: ViewSource) -> Result<UavHandle> {
        let mut state = self.state();
        let bindable = match source {
            ViewSource::Buffer(b) => state.buffers.get(&b).map(|b| b.desc.bind),
            ViewSource::Texture(t) => state.textures.get(&t).map(|t| t.desc.bind),
        };
        if !bindable.is_some_and(|bind| bind.contains(BindFlags::UNORDERED_ACCESS)) {
            return Err(Error::creation(ObjectKind::View, format!("{:?} is not unordered-access", source)));
        }
        state.create(ObjectKind::View, UavHandle, HwObject::Uav)
    }

    fn create_render_target_view(&self, texture: TextureHandle) -> Result<RtvHandle> {
        let mut state = self.state();
        if !state
            .textures
            .get(&texture)
            .is_some_and(|t| t.desc.bind.contains(BindFlags::RENDER_TARGET))
        {
            return Err(Error::creation(ObjectKind::View, format!("{:?} is not a render target", texture)));
        }
        state.create(ObjectKind::View, RtvHandle, HwObject::Rtv)
    }

    fn create_depth_stencil_view(&self, texture: TextureHandle) -> Result<DsvHandle> {
        let mut state = self.state();
        if !state
            .textures
            .get(&texture)
            .is_some_and(|t| t.desc.bind.contains(BindFlags::DEPTH_STENCIL))
        {
            return Err(Error::creation(ObjectKind::View, format!("{:?} is not a depth target", texture)));
        }
        state.create(ObjectKind::View, DsvHandle, HwObject::Dsv)
    }

    fn create_query(&self, ty: QueryType) -> Result<QueryHandle> {
        let mut state = self.state();
        let handle = state.create(ObjectKind::Query, QueryHandle, HwObject::Query)?;
        state.queries.insert(
            handle,
            NullQuery {
                ty,
                state: QueryState::Idle,
            },
        );
        Ok(handle)
    }

    fn release(&self, object: HwObject) {
        let mut state = self.state();
        if !state.live.remove(&object) {
            log::warn!("null device: release of unknown object {:?}", object);
            return;
        }
        match object {
            HwObject::Buffer(h) => {
                state.buffers.remove(&h);
            }
            HwObject::Texture(h) => {
                state.textures.remove(&h);
            }
            HwObject::Query(h) => {
                state.queries.remove(&h);
            }
            HwObject::CommandList(h) => {
                state.command_lists.remove(&h);
            }
            _ => {}
        }
    }

    fn device_removed_reason(&self) -> Option<String> {
        self.state().removed.clone()
    }
}

/// A null recorder. The immediate one executes as it goes; a deferred one collects commands
/// until [`HwContext::finish_command_list`].
#[derive(Debug)]
pub struct NullContext {
    state: Arc<Mutex<NullState>>,
    deferred: bool,
    recording: Vec<HwCommand>,
}

impl NullContext {
    fn record(&mut self, command: HwCommand) {
        if self.deferred {
            self.recording.push(command);
        } else {
            lock(&self.state).execute(command);
        }
    }
}

impl HwContext for NullContext {
    fn set_shader(&mut self, stage: HwStage, shader: Option<ShaderHandle>) {
        self.record(HwCommand::SetShader { stage, shader });
    }

    fn set_constant_buffer(&mut self, stage: HwStage, slot: u32, binding: Option<ConstantBufferBinding>) {
        self.record(HwCommand::SetConstantBuffer { stage, slot, binding });
    }

    fn set_shader_resource(&mut self, stage: HwStage, slot: u32, view: Option<SrvHandle>) {
        self.record(HwCommand::SetShaderResource { stage, slot, view });
    }

    fn set_unordered_access(&mut self, slot: u32, view: Option<UavHandle>) {
        self.record(HwCommand::SetUnorderedAccess { slot, view });
    }

    fn set_sampler(&mut self, stage: HwStage, slot: u32, sampler: Option<SamplerStateHandle>) {
        self.record(HwCommand::SetSampler { stage, slot, sampler });
    }

    fn set_input_layout(&mut self, layout: Option<InputLayoutHandle>) {
        self.record(HwCommand::SetInputLayout(layout));
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.record(HwCommand::SetPrimitiveTopology(topology));
    }

    fn set_rasterizer_state(&mut self, state: Option<RasterizerStateHandle>) {
        self.record(HwCommand::SetRasterizerState(state));
    }

    fn set_depth_stencil_state(&mut self, state: Option<DepthStencilStateHandle>, stencil_ref: u32) {
        self.record(HwCommand::SetDepthStencilState { state, stencil_ref });
    }

    fn set_blend_state(&mut self, state: Option<BlendStateHandle>, blend_factor: [f32; 4], sample_mask: u32) {
        self.record(HwCommand::SetBlendState {
            state,
            blend_factor,
            sample_mask,
        });
    }

    fn set_vertex_buffers(&mut self, start_slot: u32, buffers: &[VertexBufferBinding]) {
        self.record(HwCommand::SetVertexBuffers {
            start_slot,
            buffers: buffers.to_vec(),
        });
    }

    fn set_index_buffer(&mut self, buffer: Option<BufferHandle>, format: IndexFormat, offset: u32) {
        self.record(HwCommand::SetIndexBuffer { buffer, format, offset });
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.record(HwCommand::SetViewports(viewports.to_vec()));
    }

    fn set_scissor_rects(&mut self, rects: &[ScissorRect]) {
        self.record(HwCommand::SetScissorRects(rects.to_vec()));
    }

    fn set_render_targets(&mut self, targets: &[Option<RtvHandle>], depth_stencil: Option<DsvHandle>) {
        self.record(HwCommand::SetRenderTargets {
            targets: targets.to_vec(),
            depth_stencil,
        });
    }

    fn clear_render_target(&mut self, target: RtvHandle, color: [f32; 4]) {
        self.record(HwCommand::ClearRenderTarget { target, color });
    }

    fn clear_depth_stencil(&mut self, target: DsvHandle, flags: ClearFlags, depth: f32, stencil: u8) {
        self.record(HwCommand::ClearDepthStencil {
            target,
            flags,
            depth,
            stencil,
        });
    }

    fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.record(HwCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) {
        self.record(HwCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        });
    }

    fn draw_instanced_indirect(&mut self, args: BufferHandle, offset: u32) {
        self.record(HwCommand::DrawIndirect { args, offset });
    }

    fn draw_indexed_instanced_indirect(&mut self, args: BufferHandle, offset: u32) {
        self.record(HwCommand::DrawIndexedIndirect { args, offset });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.record(HwCommand::Dispatch { x, y, z });
    }

    fn dispatch_indirect(&mut self, args: BufferHandle, offset: u32) {
        self.record(HwCommand::DispatchIndirect { args, offset });
    }

    fn copy_buffer_region(&mut self, dst: BufferHandle, dst_offset: u64, src: BufferHandle, src_offset: u64, size: u64) {
        self.record(HwCommand::CopyBuffer {
            dst,
            dst_offset,
            src,
            src_offset,
            size,
        });
    }

    fn copy_texture_region(
        &mut self,
        dst: TextureHandle,
        dst_subresource: u32,
        dst_origin: (u32, u32, u32),
        src: TextureHandle,
        src_subresource: u32,
        src_box: Option<HwBox>,
    ) {
        self.record(HwCommand::CopyTexture {
            dst,
            dst_subresource,
            dst_origin,
            src,
            src_subresource,
            src_box,
        });
    }

    fn update_buffer(&mut self, dst: BufferHandle, offset: u64, data: &[u8]) {
        self.record(HwCommand::UpdateBuffer {
            dst,
            offset,
            data: data.to_vec(),
        });
    }

    fn update_texture(
        &mut self,
        dst: TextureHandle,
        subresource: u32,
        dst_box: Option<HwBox>,
        data: &[u8],
        row_pitch: u32,
        depth_pitch: u32,
    ) {
        self.record(HwCommand::UpdateTexture {
            dst,
            subresource,
            dst_box,
            data: data.to_vec(),
            row_pitch,
            depth_pitch,
        });
    }

    fn map_buffer(&mut self, buffer: BufferHandle, mode: MapMode, access: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.removed {
            return Err(Error::DeviceRemoved(reason.clone()));
        }
        let target = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| Error::MapFailed(format!("unknown buffer {:?}", buffer)))?;
        check_map(target.desc.usage, target.desc.cpu_access, mode)?;
        if self.deferred {
            if mode != MapMode::WriteDiscard {
                return Err(Error::MapFailed(format!("{:?} map on a deferred context", mode)));
            }
            let mut data = vec![0; target.data.len()];
            drop(state);
            access(&mut data);
            self.recording.push(HwCommand::MapBuffer {
                buffer,
                mode,
                written: Some(data),
            });
            return Ok(());
        }
        if mode == MapMode::WriteDiscard {
            target.data.fill(0);
        }
        access(&mut target.data);
        state.log.push(HwCommand::MapBuffer {
            buffer,
            mode,
            written: None,
        });
        Ok(())
    }

    fn map_texture(
        &mut self,
        texture: TextureHandle,
        subresource: u32,
        mode: MapMode,
        access: &mut dyn FnMut(&mut [u8], u32, u32),
    ) -> Result<()> {
        if self.deferred {
            return Err(Error::MapFailed("texture map on a deferred context".into()));
        }
        let mut state = lock(&self.state);
        if let Some(reason) = &state.removed {
            return Err(Error::DeviceRemoved(reason.clone()));
        }
        let target = state
            .textures
            .get_mut(&texture)
            .ok_or_else(|| Error::MapFailed(format!("unknown texture {:?}", texture)))?;
        check_map(target.desc.usage, target.desc.cpu_access, mode)?;
        let (row_pitch, depth_pitch) = target.pitches(subresource);
        let data = target
            .subresources
            .get_mut(subresource as usize)
            .ok_or_else(|| Error::MapFailed(format!("subresource {} out of range", subresource)))?;
        access(data, row_pitch, depth_pitch);
        state.log.push(HwCommand::MapTexture {
            texture,
            subresource,
            mode,
        });
        Ok(())
    }

    fn begin_query(&mut self, query: QueryHandle) {
        self.record(HwCommand::BeginQuery(query));
    }

    fn end_query(&mut self, query: QueryHandle) {
        self.record(HwCommand::EndQuery(query));
    }

    fn get_query_data(&mut self, query: QueryHandle, out: &mut [u8]) -> Result<bool> {
        if self.deferred {
            return Err(Error::Unsupported("query data on a deferred context"));
        }
        let mut state = lock(&self.state);
        let entry = state
            .queries
            .get_mut(&query)
            .ok_or(Error::Unsupported("query data of an unknown query"))?;
        match &mut entry.state {
            QueryState::Ended { polls_left, .. } if *polls_left > 0 => {
                *polls_left -= 1;
                Ok(false)
            }
            QueryState::Ended { result, .. } => {
                let n = out.len().min(result.len());
                out[..n].copy_from_slice(&result[..n]);
                Ok(true)
            }
            QueryState::Idle | QueryState::Active(_) => Ok(false),
        }
    }

    fn begin_event(&mut self, name: &str) {
        self.record(HwCommand::BeginEvent(name.to_owned()));
    }

    fn end_event(&mut self) {
        self.record(HwCommand::EndEvent);
    }

    fn set_marker(&mut self, name: &str) {
        self.record(HwCommand::SetMarker(name.to_owned()));
    }

    fn finish_command_list(&mut self) -> Result<CommandListHandle> {
        if !self.deferred {
            return Err(Error::Unsupported("finishing a command list on the immediate context"));
        }
        let mut state = lock(&self.state);
        let list = state.create(ObjectKind::CommandList, CommandListHandle, HwObject::CommandList)?;
        state.command_lists.insert(list, std::mem::take(&mut self.recording));
        Ok(list)
    }

    fn execute_command_list(&mut self, list: CommandListHandle) {
        self.record(HwCommand::ExecuteCommandList(list));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lume_rhi::TextureFormat;

    fn staging_buffer(device: &NullDevice, size: u64) -> BufferHandle {
        device
            .create_buffer(
                &HwBufferDesc {
                    byte_width: size,
                    usage: ResourceUsage::Staging,
                    bind: BindFlags::empty(),
                    cpu_access: CpuAccess::READ | CpuAccess::WRITE,
                    structure_byte_stride: 0,
                    indirect_args: false,
                },
                Some(&[1, 2, 3, 4]),
            )
            .unwrap()
    }

    #[test]
    fn deferred_lists_replay_on_the_immediate_context() {
        let device = NullDevice::default();
        let mut immediate = device.immediate_context().unwrap();
        let mut deferred = device.create_deferred_context().unwrap();
        deferred.dispatch(1, 2, 3);
        assert!(device.commands().is_empty());
        let list = deferred.finish_command_list().unwrap();
        immediate.execute_command_list(list);
        assert_eq!(
            device.commands(),
            vec![
                HwCommand::ExecuteCommandList(list),
                HwCommand::Dispatch { x: 1, y: 2, z: 3 }
            ]
        );
        device.release(HwObject::CommandList(list));
        assert_eq!(device.command_list_count(), 0);
    }

    #[test]
    fn maps_follow_usage_rules() {
        let device = NullDevice::default();
        let buffer = staging_buffer(&device, 8);
        let mut ctx = device.immediate_context().unwrap();
        let mut seen = Vec::new();
        ctx.map_buffer(buffer, MapMode::Read, &mut |bytes| seen.extend_from_slice(bytes))
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4, 0, 0, 0, 0]);
        assert!(matches!(
            ctx.map_buffer(buffer, MapMode::WriteDiscard, &mut |_| {}),
            Err(Error::MapFailed(_))
        ));
        let mut deferred = device.create_deferred_context().unwrap();
        assert!(deferred.map_buffer(buffer, MapMode::Read, &mut |_| {}).is_err());
    }

    #[test]
    fn queries_become_ready_after_latency() {
        let device = NullDevice::default();
        device.set_query_latency(2);
        let query = device.create_query(QueryType::Occlusion).unwrap();
        let mut ctx = device.immediate_context().unwrap();
        ctx.begin_query(query);
        ctx.draw_instanced(6, 2, 0, 0);
        ctx.end_query(query);
        let mut out = [0u8; 8];
        assert!(!ctx.get_query_data(query, &mut out).unwrap());
        assert!(!ctx.get_query_data(query, &mut out).unwrap());
        assert!(ctx.get_query_data(query, &mut out).unwrap());
        assert_eq!(u64::from_le_bytes(out), 12);
    }

    #[test]
    fn texture_update_and_copy_move_texels() {
        let device = NullDevice::default();
        let desc = HwTextureDesc {
            dimension: TextureDimension::D2,
            width: 4,
            height: 4,
            depth_or_layers: 1,
            mip_levels: 1,
            format: TextureFormat::R32Uint,
            usage: ResourceUsage::Default,
            bind: BindFlags::SHADER_RESOURCE,
            cpu_access: CpuAccess::empty(),
        };
        let a = device.create_texture(&desc).unwrap();
        let b = device.create_texture(&desc).unwrap();
        let mut ctx = device.immediate_context().unwrap();
        let texel = 7u32.to_le_bytes();
        let region = HwBox {
            left: 1,
            top: 2,
            front: 0,
            right: 2,
            bottom: 3,
            back: 1,
        };
        ctx.update_texture(a, 0, Some(region), &texel, 4, 4);
        ctx.copy_texture_region(b, 0, (3, 3, 0), a, 0, Some(region));
        let contents = device.texture_contents(b, 0).unwrap();
        let at = (3 * 4 + 3) * 4;
        assert_eq!(&contents[at..at + 4], &texel);
    }

    #[test]
    fn injected_failures_and_removal() {
        let device = NullDevice::default();
        device.fail_creation(ObjectKind::BlendState, true);
        assert!(device.create_blend_state(&BlendDesc::default()).is_err());
        device.fail_creation(ObjectKind::BlendState, false);
        assert!(device.create_blend_state(&BlendDesc::default()).is_ok());
        device.remove_device("hung");
        assert_eq!(device.device_removed_reason().as_deref(), Some("hung"));
        assert!(matches!(
            device.create_query(QueryType::Timestamp),
            Err(Error::DeviceRemoved(_))
        ));
    }
}
