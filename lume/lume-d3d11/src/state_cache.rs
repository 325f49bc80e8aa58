//! Content-addressed cache of immutable hardware state objects.
//!
//! The driver caps the number of live unique state objects, so every pipeline goes through here
//! and identical descriptors share one hardware object. Entries live until [`StateObjectCache::clear`]
//! (or drop); pipelines hold plain handles and never release them.
//!
//! Keys are a 64-bit xxh3 hash of a canonical byte encoding of the descriptor. The encoding is
//! stored alongside the handle and compared on lookup, so a hash collision creates a second
//! object instead of returning the wrong one.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{ObjectKind, Result};
use crate::hw::{
    BlendDesc, BlendStateHandle, DepthStencilDesc, DepthStencilStateHandle, HwDevice, HwObject,
    InputElementDesc, InputLayoutHandle, RasterizerDesc, RasterizerStateHandle, SamplerDesc,
    SamplerStateHandle,
};

/// Collects the bytes a `Hash` impl feeds, giving a canonical encoding of the value.
#[derive(Default)]
struct KeyEncoder(Vec<u8>);

impl Hasher for KeyEncoder {
    fn finish(&self) -> u64 {
        xxh3_64(&self.0)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StateKey {
    hash: u64,
    bytes: Box<[u8]>,
}

impl StateKey {
    pub(crate) fn of<T: Hash + ?Sized>(value: &T) -> Self {
        let mut encoder = KeyEncoder::default();
        value.hash(&mut encoder);
        Self {
            hash: encoder.finish(),
            bytes: encoder.0.into_boxed_slice(),
        }
    }

    pub(crate) fn hash(&self) -> u64 {
        self.hash
    }
}

/// Hash-keyed buckets; a bucket holds more than one entry only after a collision.
#[derive(Debug)]
struct StateMap<H> {
    buckets: HashMap<u64, Vec<(Box<[u8]>, H)>>,
    len: usize,
}

impl<H> Default for StateMap<H> {
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
            len: 0,
        }
    }
}

enum Lookup<H> {
    Hit(H),
    Miss,
    Collision,
}

impl<H: Copy> StateMap<H> {
    fn lookup(&self, key: &StateKey) -> Lookup<H> {
        match self.buckets.get(&key.hash) {
            None => Lookup::Miss,
            Some(bucket) => bucket
                .iter()
                .find(|(bytes, _)| *bytes == key.bytes)
                .map_or(Lookup::Collision, |(_, h)| Lookup::Hit(*h)),
        }
    }

    fn insert(&mut self, key: StateKey, handle: H) {
        self.buckets
            .entry(key.hash)
            .or_default()
            .push((key.bytes, handle));
        self.len += 1;
    }

    fn drain(&mut self) -> impl Iterator<Item = H> + '_ {
        self.len = 0;
        self.buckets
            .drain()
            .flat_map(|(_, bucket)| bucket.into_iter().map(|(_, h)| h))
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    rasterizer: StateMap<RasterizerStateHandle>,
    depth_stencil: StateMap<DepthStencilStateHandle>,
    blend: StateMap<BlendStateHandle>,
    sampler: StateMap<SamplerStateHandle>,
    input_layout: StateMap<InputLayoutHandle>,
    hits: u64,
    misses: u64,
    collisions: u64,
    creation_failures: u64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub collisions: u64,
    pub creation_failures: u64,
    pub rasterizer_states: usize,
    pub depth_stencil_states: usize,
    pub blend_states: usize,
    pub sampler_states: usize,
    pub input_layouts: usize,
}

impl StateCacheStats {
    pub fn total_objects(&self) -> usize {
        self.rasterizer_states
            + self.depth_stencil_states
            + self.blend_states
            + self.sampler_states
            + self.input_layouts
    }
}

/// Thread-safe state object cache. One mutex covers all five maps; creation happens under it so
/// two threads asking for the same descriptor still get a single hardware object.
#[derive(Debug)]
pub struct StateObjectCache {
    device: Arc<dyn HwDevice>,
    inner: Mutex<CacheInner>,
}

impl StateObjectCache {
    pub fn new(device: Arc<dyn HwDevice>) -> Self {
        Self {
            device,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_or_create<H: Copy + std::fmt::Debug>(
        &self,
        kind: ObjectKind,
        key: StateKey,
        map: fn(&mut CacheInner) -> &mut StateMap<H>,
        create: impl FnOnce() -> Result<H>,
    ) -> Result<H> {
        let mut inner = self.lock();
        match map(&mut inner).lookup(&key) {
            Lookup::Hit(handle) => {
                inner.hits += 1;
                return Ok(handle);
            }
            Lookup::Collision => {
                inner.collisions += 1;
                log::warn!(
                    "{:?} cache: hash {:#018x} collides with a different descriptor",
                    kind,
                    key.hash()
                );
            }
            Lookup::Miss => {}
        }
        inner.misses += 1;
        match create() {
            Ok(handle) => {
                log::trace!("{:?} cache: created {:?} for hash {:#018x}", kind, handle, key.hash());
                map(&mut inner).insert(key, handle);
                Ok(handle)
            }
            Err(e) => {
                inner.creation_failures += 1;
                log::error!("{:?} cache: creation failed: {}", kind, e);
                Err(e)
            }
        }
    }

    pub fn rasterizer_state(&self, desc: &RasterizerDesc) -> Result<RasterizerStateHandle> {
        self.get_or_create(
            ObjectKind::RasterizerState,
            StateKey::of(desc),
            |c| &mut c.rasterizer,
            || self.device.create_rasterizer_state(desc),
        )
    }

    pub fn depth_stencil_state(&self, desc: &DepthStencilDesc) -> Result<DepthStencilStateHandle> {
        self.get_or_create(
            ObjectKind::DepthStencilState,
            StateKey::of(desc),
            |c| &mut c.depth_stencil,
            || self.device.create_depth_stencil_state(desc),
        )
    }

    pub fn blend_state(&self, desc: &BlendDesc) -> Result<BlendStateHandle> {
        self.get_or_create(
            ObjectKind::BlendState,
            StateKey::of(desc),
            |c| &mut c.blend,
            || self.device.create_blend_state(desc),
        )
    }

    pub fn sampler_state(&self, desc: &SamplerDesc) -> Result<SamplerStateHandle> {
        self.get_or_create(
            ObjectKind::SamplerState,
            StateKey::of(desc),
            |c| &mut c.sampler,
            || self.device.create_sampler_state(desc),
        )
    }

    /// Keyed by the element list only; `vs_bytecode` is used for creation (signature validation).
    pub fn input_layout(
        &self,
        elements: &[InputElementDesc],
        vs_bytecode: &[u8],
    ) -> Result<InputLayoutHandle> {
        self.get_or_create(
            ObjectKind::InputLayout,
            StateKey::of(elements),
            |c| &mut c.input_layout,
            || self.device.create_input_layout(elements, vs_bytecode),
        )
    }

    pub fn stats(&self) -> StateCacheStats {
        let inner = self.lock();
        StateCacheStats {
            hits: inner.hits,
            misses: inner.misses,
            collisions: inner.collisions,
            creation_failures: inner.creation_failures,
            rasterizer_states: inner.rasterizer.len,
            depth_stencil_states: inner.depth_stencil.len,
            blend_states: inner.blend.len,
            sampler_states: inner.sampler.len,
            input_layouts: inner.input_layout.len,
        }
    }

    /// Releases every cached object and resets counters. Only safe once no pipeline built from
    /// this cache is still in use.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let mut released: Vec<HwObject> = Vec::new();
        released.extend(inner.rasterizer.drain().map(HwObject::RasterizerState));
        released.extend(inner.depth_stencil.drain().map(HwObject::DepthStencilState));
        released.extend(inner.blend.drain().map(HwObject::BlendState));
        released.extend(inner.sampler.drain().map(HwObject::SamplerState));
        released.extend(inner.input_layout.drain().map(HwObject::InputLayout));
        inner.hits = 0;
        inner.misses = 0;
        inner.collisions = 0;
        inner.creation_failures = 0;
        drop(inner);
        if !released.is_empty() {
            log::debug!("state cache: releasing {} objects", released.len());
        }
        for object in released {
            self.device.release(object);
        }
    }
}

impl Drop for StateObjectCache {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::{FillMode, HwCullMode};

    fn raster(depth_bias: i32, clamp: f32) -> RasterizerDesc {
        RasterizerDesc {
            fill_mode: FillMode::Solid,
            cull_mode: HwCullMode::Back,
            front_counter_clockwise: true,
            depth_bias,
            depth_bias_clamp: clamp,
            slope_scaled_depth_bias: 0.0,
            depth_clip_enable: true,
            scissor_enable: false,
            multisample_enable: false,
            antialiased_line_enable: false,
        }
    }

    #[test]
    fn identical_descriptors_share_a_key() {
        assert_eq!(StateKey::of(&raster(1, 0.5)), StateKey::of(&raster(1, 0.5)));
    }

    #[test]
    fn every_field_reaches_the_key() {
        let base = StateKey::of(&raster(0, 0.0));
        assert_ne!(base, StateKey::of(&raster(1, 0.0)));
        assert_ne!(base, StateKey::of(&raster(0, 1.0)));
        // -0.0 and 0.0 differ bitwise and may differ in driver behavior.
        assert_ne!(base.hash(), StateKey::of(&raster(0, -0.0)).hash());
        let mut wire = raster(0, 0.0);
        wire.fill_mode = FillMode::Wireframe;
        assert_ne!(base.hash(), StateKey::of(&wire).hash());
    }

    #[test]
    fn colliding_hash_with_different_bytes_is_not_a_hit() {
        let mut map: StateMap<u32> = StateMap::default();
        let key = StateKey::of(&raster(0, 0.0));
        map.insert(key.clone(), 7);
        let forged = StateKey {
            hash: key.hash(),
            bytes: vec![1, 2, 3].into_boxed_slice(),
        };
        assert!(matches!(map.lookup(&key), Lookup::Hit(7)));
        assert!(matches!(map.lookup(&forged), Lookup::Collision));
        map.insert(forged.clone(), 8);
        assert!(matches!(map.lookup(&forged), Lookup::Hit(8)));
        assert_eq!(map.len, 2);
        assert_eq!(map.drain().count(), 2);
        assert_eq!(map.len, 0);
    }
}
