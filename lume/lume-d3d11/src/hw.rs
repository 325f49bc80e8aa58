//! Hardware boundary: what the backend consumes from a D3D11-class driver.
//!
//! The driver is slot-bound and single-queue. Every object it hands out is an opaque handle;
//! ownership stays with the driver until [`HwDevice::release`] is called.
//! Descriptors here are hardware-shaped (one struct per driver state object), the RHI-shaped
//! inputs are translated in [`crate::conv`].

use std::fmt::Debug;
use std::hash::{Hash, Hasher};

use lume_rhi::{
    AddressMode, BlendFactor, BlendOp, CompareOp, IndexFormat, PrimitiveTopology, QueryType,
    ScissorRect, StencilFaceState, TextureDimension, TextureFormat, VertexFormat, Viewport,
};

use crate::error::Result;

macro_rules! hw_handle {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

hw_handle! {
    BufferHandle;
    TextureHandle;
    /// Shader-resource view (read-only `t#` binding).
    SrvHandle;
    /// Unordered-access view (read-write `u#` binding).
    UavHandle;
    RtvHandle;
    DsvHandle;
    SamplerStateHandle;
    RasterizerStateHandle;
    DepthStencilStateHandle;
    BlendStateHandle;
    InputLayoutHandle;
    ShaderHandle;
    QueryHandle;
    /// Finished deferred recording, replayable once on the immediate recorder.
    CommandListHandle;
}

/// Any driver object, for [`HwDevice::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwObject {
    Buffer(BufferHandle),
    Texture(TextureHandle),
    Srv(SrvHandle),
    Uav(UavHandle),
    Rtv(RtvHandle),
    Dsv(DsvHandle),
    SamplerState(SamplerStateHandle),
    RasterizerState(RasterizerStateHandle),
    DepthStencilState(DepthStencilStateHandle),
    BlendState(BlendStateHandle),
    InputLayout(InputLayoutHandle),
    Shader(ShaderHandle),
    Query(QueryHandle),
    CommandList(CommandListHandle),
}

/// Hardware pipeline stages. Each has its own slot tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HwStage {
    Vertex,
    Pixel,
    Geometry,
    Hull,
    Domain,
    Compute,
}

impl HwStage {
    pub const ALL: [HwStage; 6] = [
        HwStage::Vertex,
        HwStage::Pixel,
        HwStage::Geometry,
        HwStage::Hull,
        HwStage::Domain,
        HwStage::Compute,
    ];

    pub const GRAPHICS: [HwStage; 5] = [
        HwStage::Vertex,
        HwStage::Pixel,
        HwStage::Geometry,
        HwStage::Hull,
        HwStage::Domain,
    ];
}

/// Per-stage slot ceilings of the baseline feature level.
pub const MAX_CONSTANT_BUFFER_SLOTS: u32 = 14;
pub const MAX_SHADER_RESOURCE_SLOTS: u32 = 128;
pub const MAX_UNORDERED_ACCESS_SLOTS: u32 = 8;
pub const MAX_SAMPLER_SLOTS: u32 = 16;
pub const MAX_RENDER_TARGETS: usize = 8;

/// Constant-buffer offsets must be multiples of 16 constants (256 bytes).
pub const CONSTANT_BUFFER_OFFSET_ALIGNMENT: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Deferred recorders are available (driver command lists).
    pub deferred_contexts: bool,
    /// Constant buffers can be bound at an offset/range (feature level 11.1 style).
    pub constant_buffer_offsetting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillMode {
    Solid,
    Wireframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwCullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerDesc {
    pub fill_mode: FillMode,
    pub cull_mode: HwCullMode,
    pub front_counter_clockwise: bool,
    pub depth_bias: i32,
    pub depth_bias_clamp: f32,
    pub slope_scaled_depth_bias: f32,
    pub depth_clip_enable: bool,
    pub scissor_enable: bool,
    pub multisample_enable: bool,
    pub antialiased_line_enable: bool,
}

impl Hash for RasterizerDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fill_mode.hash(state);
        self.cull_mode.hash(state);
        self.front_counter_clockwise.hash(state);
        self.depth_bias.hash(state);
        self.depth_bias_clamp.to_bits().hash(state);
        self.slope_scaled_depth_bias.to_bits().hash(state);
        self.depth_clip_enable.hash(state);
        self.scissor_enable.hash(state);
        self.multisample_enable.hash(state);
        self.antialiased_line_enable.hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilDesc {
    pub depth_enable: bool,
    pub depth_write_enable: bool,
    pub depth_func: CompareOp,
    pub stencil_enable: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front_face: StencilFaceState,
    pub back_face: StencilFaceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetBlendDesc {
    pub blend_enable: bool,
    pub src_blend: BlendFactor,
    pub dest_blend: BlendFactor,
    pub blend_op: BlendOp,
    pub src_blend_alpha: BlendFactor,
    pub dest_blend_alpha: BlendFactor,
    pub blend_op_alpha: BlendOp,
    pub write_mask: u8,
}

impl Default for RenderTargetBlendDesc {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_blend: BlendFactor::One,
            dest_blend: BlendFactor::Zero,
            blend_op: BlendOp::Add,
            src_blend_alpha: BlendFactor::One,
            dest_blend_alpha: BlendFactor::Zero,
            blend_op_alpha: BlendOp::Add,
            write_mask: 0xf,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlendDesc {
    pub alpha_to_coverage_enable: bool,
    pub independent_blend_enable: bool,
    pub render_targets: [RenderTargetBlendDesc; MAX_RENDER_TARGETS],
}

/// Packed sampler filter, bit-compatible with the driver's filter enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerFilter(pub u32);

impl SamplerFilter {
    pub const MIP_LINEAR: u32 = 0x01;
    pub const MAG_LINEAR: u32 = 0x04;
    pub const MIN_LINEAR: u32 = 0x10;
    pub const ANISOTROPIC: u32 = 0x55;
    pub const COMPARISON: u32 = 0x80;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub filter: SamplerFilter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u32,
    pub comparison_func: CompareOp,
    pub border_color: [f32; 4],
    pub min_lod: f32,
    pub max_lod: f32,
}

impl Hash for SamplerDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.filter.hash(state);
        self.address_u.hash(state);
        self.address_v.hash(state);
        self.address_w.hash(state);
        self.mip_lod_bias.to_bits().hash(state);
        self.max_anisotropy.hash(state);
        self.comparison_func.hash(state);
        for c in self.border_color {
            c.to_bits().hash(state);
        }
        self.min_lod.to_bits().hash(state);
        self.max_lod.to_bits().hash(state);
    }
}

/// One vertex-input element. Semantics follow the cross-compiler convention `TEXCOORD<location>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputElementDesc {
    pub semantic_name: String,
    pub semantic_index: u32,
    pub format: VertexFormat,
    pub input_slot: u32,
    pub aligned_byte_offset: u32,
    pub per_instance: bool,
    pub instance_data_step_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceUsage {
    Default,
    Immutable,
    Dynamic,
    Staging,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const CONSTANT_BUFFER = 1 << 2;
        const SHADER_RESOURCE = 1 << 3;
        const UNORDERED_ACCESS = 1 << 4;
        const RENDER_TARGET = 1 << 5;
        const DEPTH_STENCIL = 1 << 6;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CpuAccess: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClearFlags: u32 {
        const DEPTH = 1 << 0;
        const STENCIL = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwBufferDesc {
    pub byte_width: u64,
    pub usage: ResourceUsage,
    pub bind: BindFlags,
    pub cpu_access: CpuAccess,
    /// Non-zero for structured buffers.
    pub structure_byte_stride: u32,
    /// Buffer may be the argument source of indirect draws/dispatches.
    pub indirect_args: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwTextureDesc {
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    pub depth_or_layers: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub usage: ResourceUsage,
    pub bind: BindFlags,
    pub cpu_access: CpuAccess,
}

/// Resource a view is created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewSource {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapMode {
    Read,
    ReadWrite,
    /// Previous contents are discarded; the only mode deferred recorders accept.
    WriteDiscard,
    WriteNoOverwrite,
}

/// A constant buffer bound to a slot, optionally at a byte offset/range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantBufferBinding {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: Option<u64>,
}

impl ConstantBufferBinding {
    pub fn whole(buffer: BufferHandle) -> Self {
        Self {
            buffer,
            offset: 0,
            size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub buffer: Option<BufferHandle>,
    pub stride: u32,
    pub offset: u32,
}

/// Region inside a sub-resource, right/bottom/back exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwBox {
    pub left: u32,
    pub top: u32,
    pub front: u32,
    pub right: u32,
    pub bottom: u32,
    pub back: u32,
}

/// Device-level entry points: object creation and recorder access.
pub trait HwDevice: Send + Sync + Debug {
    fn caps(&self) -> DeviceCaps;

    /// The shared immediate recorder. Called once by the owning device.
    fn immediate_context(&self) -> Result<Box<dyn HwContext>>;
    fn create_deferred_context(&self) -> Result<Box<dyn HwContext>>;

    fn create_rasterizer_state(&self, desc: &RasterizerDesc) -> Result<RasterizerStateHandle>;
    fn create_depth_stencil_state(&self, desc: &DepthStencilDesc)
        -> Result<DepthStencilStateHandle>;
    fn create_blend_state(&self, desc: &BlendDesc) -> Result<BlendStateHandle>;
    fn create_sampler_state(&self, desc: &SamplerDesc) -> Result<SamplerStateHandle>;
    fn create_input_layout(
        &self,
        elements: &[InputElementDesc],
        vs_bytecode: &[u8],
    ) -> Result<InputLayoutHandle>;

    fn create_shader(&self, stage: HwStage, bytecode: &[u8]) -> Result<ShaderHandle>;
    fn create_buffer(&self, desc: &HwBufferDesc, initial_data: Option<&[u8]>) -> Result<BufferHandle>;
    fn create_texture(&self, desc: &HwTextureDesc) -> Result<TextureHandle>;
    fn create_shader_resource_view(&self, source: ViewSource) -> Result<SrvHandle>;
    fn create_unordered_access_view(&self, source: ViewSource) -> Result<UavHandle>;
    fn create_render_target_view(&self, texture: TextureHandle) -> Result<RtvHandle>;
    fn create_depth_stencil_view(&self, texture: TextureHandle) -> Result<DsvHandle>;
    fn create_query(&self, ty: QueryType) -> Result<QueryHandle>;

    fn release(&self, object: HwObject);

    /// Some(reason) once the device has been removed or reset.
    fn device_removed_reason(&self) -> Option<String>;
}

/// A command recorder: the immediate context or one deferred context.
pub trait HwContext: Send + Debug {
    fn set_shader(&mut self, stage: HwStage, shader: Option<ShaderHandle>);
    fn set_constant_buffer(&mut self, stage: HwStage, slot: u32, binding: Option<ConstantBufferBinding>);
    fn set_shader_resource(&mut self, stage: HwStage, slot: u32, view: Option<SrvHandle>);
    /// Compute-stage unordered-access slot.
    fn set_unordered_access(&mut self, slot: u32, view: Option<UavHandle>);
    fn set_sampler(&mut self, stage: HwStage, slot: u32, sampler: Option<SamplerStateHandle>);

    fn set_input_layout(&mut self, layout: Option<InputLayoutHandle>);
    fn set_primitive_topology(&mut self, topology: PrimitiveTopology);
    fn set_rasterizer_state(&mut self, state: Option<RasterizerStateHandle>);
    fn set_depth_stencil_state(&mut self, state: Option<DepthStencilStateHandle>, stencil_ref: u32);
    fn set_blend_state(&mut self, state: Option<BlendStateHandle>, blend_factor: [f32; 4], sample_mask: u32);
    fn set_vertex_buffers(&mut self, start_slot: u32, buffers: &[VertexBufferBinding]);
    fn set_index_buffer(&mut self, buffer: Option<BufferHandle>, format: IndexFormat, offset: u32);
    fn set_viewports(&mut self, viewports: &[Viewport]);
    fn set_scissor_rects(&mut self, rects: &[ScissorRect]);

    fn set_render_targets(&mut self, targets: &[Option<RtvHandle>], depth_stencil: Option<DsvHandle>);
    fn clear_render_target(&mut self, target: RtvHandle, color: [f32; 4]);
    fn clear_depth_stencil(&mut self, target: DsvHandle, flags: ClearFlags, depth: f32, stencil: u8);

    fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    );
    /// Single draw reading its arguments at `offset`.
    fn draw_instanced_indirect(&mut self, args: BufferHandle, offset: u32);
    fn draw_indexed_instanced_indirect(&mut self, args: BufferHandle, offset: u32);
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
    fn dispatch_indirect(&mut self, args: BufferHandle, offset: u32);

    fn copy_buffer_region(&mut self, dst: BufferHandle, dst_offset: u64, src: BufferHandle, src_offset: u64, size: u64);
    fn copy_texture_region(
        &mut self,
        dst: TextureHandle,
        dst_subresource: u32,
        dst_origin: (u32, u32, u32),
        src: TextureHandle,
        src_subresource: u32,
        src_box: Option<HwBox>,
    );
    fn update_buffer(&mut self, dst: BufferHandle, offset: u64, data: &[u8]);
    fn update_texture(
        &mut self,
        dst: TextureHandle,
        subresource: u32,
        dst_box: Option<HwBox>,
        data: &[u8],
        row_pitch: u32,
        depth_pitch: u32,
    );

    /// Maps `buffer`, hands the mapped bytes to `write`, unmaps.
    fn map_buffer(&mut self, buffer: BufferHandle, mode: MapMode, access: &mut dyn FnMut(&mut [u8])) -> Result<()>;
    /// Maps one texture sub-resource; `access` receives the bytes plus row and depth pitch.
    fn map_texture(
        &mut self,
        texture: TextureHandle,
        subresource: u32,
        mode: MapMode,
        access: &mut dyn FnMut(&mut [u8], u32, u32),
    ) -> Result<()>;

    fn begin_query(&mut self, query: QueryHandle);
    fn end_query(&mut self, query: QueryHandle);
    /// Ok(true) and `out` filled when the result is available, Ok(false) when not yet.
    fn get_query_data(&mut self, query: QueryHandle, out: &mut [u8]) -> Result<bool>;

    fn begin_event(&mut self, name: &str);
    fn end_event(&mut self);
    fn set_marker(&mut self, name: &str);

    /// Deferred recorders only: close the recording into a command list.
    fn finish_command_list(&mut self) -> Result<CommandListHandle>;
    fn execute_command_list(&mut self, list: CommandListHandle);
}
