mod common;

use std::sync::Arc;

use common::*;
use lume_d3d11::hw::{BlendDesc, FillMode, HwCullMode, HwObject, RasterizerDesc};
use lume_d3d11::null::NullDevice;
use lume_d3d11::{Error, ObjectKind, StateCacheStats, StateObjectCache};
use lume_rhi::{AddressMode, SamplerDescriptor};
use pretty_assertions::assert_eq;

fn raster(cull_mode: HwCullMode) -> RasterizerDesc {
    RasterizerDesc {
        fill_mode: FillMode::Solid,
        cull_mode,
        front_counter_clockwise: true,
        depth_bias: 0,
        depth_bias_clamp: 0.0,
        slope_scaled_depth_bias: 0.0,
        depth_clip_enable: true,
        scissor_enable: false,
        multisample_enable: false,
        antialiased_line_enable: false,
    }
}

fn cache() -> (NullDevice, StateObjectCache) {
    init_logger();
    let null = NullDevice::default();
    let cache = StateObjectCache::new(Arc::new(null.clone()));
    (null, cache)
}

#[test]
fn equal_descriptors_share_one_object() {
    let (null, cache) = cache();
    let a = cache.rasterizer_state(&raster(HwCullMode::Back)).unwrap();
    let b = cache.rasterizer_state(&raster(HwCullMode::Back)).unwrap();

    assert_eq!(a, b);
    assert_eq!(null.creation_count(ObjectKind::RasterizerState), 1);
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses, stats.rasterizer_states), (1, 1, 1));
    assert_eq!(stats.total_objects(), 1);
}

#[test]
fn different_descriptors_get_different_objects() {
    let (null, cache) = cache();
    let back = cache.rasterizer_state(&raster(HwCullMode::Back)).unwrap();
    let none = cache.rasterizer_state(&raster(HwCullMode::None)).unwrap();

    assert_ne!(back, none);
    assert_eq!(null.creation_count(ObjectKind::RasterizerState), 2);
    assert_eq!(cache.stats().collisions, 0);
}

#[test]
fn creation_failures_are_not_cached() {
    let (null, cache) = cache();
    null.fail_creation(ObjectKind::BlendState, true);

    let err = cache.blend_state(&BlendDesc::default()).unwrap_err();
    assert!(matches!(
        err,
        Error::CreationFailed {
            kind: ObjectKind::BlendState,
            ..
        }
    ));
    let stats = cache.stats();
    assert_eq!((stats.creation_failures, stats.blend_states), (1, 0));

    null.fail_creation(ObjectKind::BlendState, false);
    assert!(cache.blend_state(&BlendDesc::default()).is_ok());
    assert_eq!(cache.stats().blend_states, 1);
}

#[test]
fn clear_releases_every_object() {
    let (null, cache) = cache();
    let raster_state = cache.rasterizer_state(&raster(HwCullMode::Back)).unwrap();
    let blend_state = cache.blend_state(&BlendDesc::default()).unwrap();
    assert_eq!(null.live_objects(), 2);

    cache.clear();

    assert_eq!(null.live_objects(), 0);
    assert!(!null.is_live(HwObject::RasterizerState(raster_state)));
    assert!(!null.is_live(HwObject::BlendState(blend_state)));
    assert_eq!(cache.stats(), StateCacheStats::default());
}

#[test]
fn dropping_the_cache_releases_its_objects() {
    let (null, cache) = cache();
    cache.rasterizer_state(&raster(HwCullMode::Front)).unwrap();
    drop(cache);
    assert_eq!(null.live_objects(), 0);
}

#[test]
fn concurrent_lookups_create_once() {
    let (null, cache) = cache();
    let cache = Arc::new(cache);
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.rasterizer_state(&raster(HwCullMode::Back)).unwrap())
        })
        .collect();
    let handles: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    assert!(handles.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(null.creation_count(ObjectKind::RasterizerState), 1);
    assert_eq!(cache.stats().hits, 7);
}

#[test]
fn pipelines_with_equal_state_share_objects() {
    let h = harness();
    let layout = pipeline_layout(&h.device, 0);
    let first = graphics_pipeline(&h.device, &layout);
    let second = graphics_pipeline(&h.device, &layout);

    assert_eq!(first.rasterizer_state(), second.rasterizer_state());
    assert_eq!(first.blend_state(), second.blend_state());
    assert_eq!(first.depth_stencil_state(), second.depth_stencil_state());
    assert_eq!(first.input_layout(), second.input_layout());
    let stats = h.device.state_cache_stats();
    assert_eq!(stats.total_objects(), 4);
    assert_eq!(stats.hits, 4);
}

#[test]
fn samplers_dedupe_through_the_device() {
    let h = harness();
    let a = h
        .device
        .create_sampler(&SamplerDescriptor {
            label: Some("a"),
            ..SamplerDescriptor::default()
        })
        .unwrap();
    let b = h
        .device
        .create_sampler(&SamplerDescriptor {
            label: Some("b"),
            ..SamplerDescriptor::default()
        })
        .unwrap();
    let clamped = h
        .device
        .create_sampler(&SamplerDescriptor {
            address_mode_u: AddressMode::ClampToEdge,
            ..SamplerDescriptor::default()
        })
        .unwrap();

    assert_eq!(a.state(), b.state());
    assert_ne!(a.state(), clamped.state());
    assert_ne!(a.id(), b.id());
    assert_eq!(h.null.creation_count(ObjectKind::SamplerState), 2);
}
