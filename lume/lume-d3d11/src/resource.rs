//! Buffers, textures, samplers and shaders.
//!
//! Buffers and textures own their hardware objects and views and release them on drop.
//! Samplers point into the state object cache and own nothing.

use std::sync::Arc;

use lume_rhi::{BufferMemoryPreference, BufferUsage, ResourceId, SamplerDescriptor, TextureFormat};

use crate::hw::{
    BufferHandle, CpuAccess, DsvHandle, HwDevice, HwObject, HwStage, HwTextureDesc, RtvHandle,
    SamplerStateHandle, ShaderHandle, SrvHandle, TextureHandle, UavHandle,
};

pub struct D3D11Buffer {
    pub(crate) device: Arc<dyn HwDevice>,
    pub(crate) handle: BufferHandle,
    pub(crate) srv: Option<SrvHandle>,
    pub(crate) uav: Option<UavHandle>,
    pub(crate) size: u64,
    pub(crate) usage: BufferUsage,
    pub(crate) memory: BufferMemoryPreference,
    pub(crate) cpu_access: CpuAccess,
    pub(crate) id: ResourceId,
}

impl D3D11Buffer {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn memory(&self) -> BufferMemoryPreference {
        self.memory
    }

    pub fn host_visible(&self) -> bool {
        self.memory == BufferMemoryPreference::HostVisible
    }

    pub fn cpu_access(&self) -> CpuAccess {
        self.cpu_access
    }

    /// Read-only view, present for storage buffers.
    pub fn srv(&self) -> Option<SrvHandle> {
        self.srv
    }

    /// Read-write view, present for device-local storage buffers.
    pub fn uav(&self) -> Option<UavHandle> {
        self.uav
    }

    /// Whether `[offset, offset + len)` lies inside the buffer.
    pub(crate) fn contains_range(&self, offset: u64, len: u64) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.size)
    }
}

impl Drop for D3D11Buffer {
    fn drop(&mut self) {
        if let Some(uav) = self.uav {
            self.device.release(HwObject::Uav(uav));
        }
        if let Some(srv) = self.srv {
            self.device.release(HwObject::Srv(srv));
        }
        self.device.release(HwObject::Buffer(self.handle));
    }
}

impl std::fmt::Debug for D3D11Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("D3D11Buffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

pub struct D3D11Texture {
    pub(crate) device: Arc<dyn HwDevice>,
    pub(crate) handle: TextureHandle,
    pub(crate) desc: HwTextureDesc,
    pub(crate) srv: Option<SrvHandle>,
    pub(crate) uav: Option<UavHandle>,
    pub(crate) rtv: Option<RtvHandle>,
    pub(crate) dsv: Option<DsvHandle>,
    pub(crate) id: ResourceId,
}

impl D3D11Texture {
    pub fn handle(&self) -> TextureHandle {
        self.handle
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn desc(&self) -> &HwTextureDesc {
        &self.desc
    }

    pub fn format(&self) -> TextureFormat {
        self.desc.format
    }

    pub fn size(&self) -> (u32, u32, u32) {
        (self.desc.width, self.desc.height, self.desc.depth_or_layers)
    }

    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }

    pub fn srv(&self) -> Option<SrvHandle> {
        self.srv
    }

    pub fn uav(&self) -> Option<UavHandle> {
        self.uav
    }

    pub fn rtv(&self) -> Option<RtvHandle> {
        self.rtv
    }

    pub fn dsv(&self) -> Option<DsvHandle> {
        self.dsv
    }
}

impl Drop for D3D11Texture {
    fn drop(&mut self) {
        let views = [
            self.srv.map(HwObject::Srv),
            self.uav.map(HwObject::Uav),
            self.rtv.map(HwObject::Rtv),
            self.dsv.map(HwObject::Dsv),
        ];
        for view in views.into_iter().flatten() {
            self.device.release(view);
        }
        self.device.release(HwObject::Texture(self.handle));
    }
}

impl std::fmt::Debug for D3D11Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("D3D11Texture")
            .field("id", &self.id)
            .field("format", &self.desc.format)
            .field("size", &self.size())
            .finish()
    }
}

/// A cached sampler state. The state object cache owns the hardware object.
pub struct D3D11Sampler {
    pub(crate) state: SamplerStateHandle,
    pub(crate) desc: SamplerDescriptor,
    pub(crate) id: ResourceId,
}

impl D3D11Sampler {
    pub fn state(&self) -> SamplerStateHandle {
        self.state
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn descriptor(&self) -> &SamplerDescriptor {
        &self.desc
    }
}

impl std::fmt::Debug for D3D11Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("D3D11Sampler")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

/// Compiled shader for one stage. The bytecode is kept for input-layout creation.
pub struct D3D11Shader {
    pub(crate) device: Arc<dyn HwDevice>,
    pub(crate) handle: ShaderHandle,
    pub(crate) stage: HwStage,
    pub(crate) bytecode: Arc<[u8]>,
}

impl D3D11Shader {
    pub fn handle(&self) -> ShaderHandle {
        self.handle
    }

    pub fn stage(&self) -> HwStage {
        self.stage
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }
}

impl Drop for D3D11Shader {
    fn drop(&mut self) {
        self.device.release(HwObject::Shader(self.handle));
    }
}

impl std::fmt::Debug for D3D11Shader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("D3D11Shader")
            .field("stage", &self.stage)
            .field("bytes", &self.bytecode.len())
            .finish()
    }
}
