mod common;

use std::time::Duration;

use common::*;
use lume_d3d11::null::NullDevice;
use lume_d3d11::{D3D11Config, Error};
use lume_rhi::{BufferDescriptor, BufferMemoryPreference, BufferUsage, PipelineStatistics, QueryType};
use pretty_assertions::assert_eq;

fn u64s(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

#[test]
fn empty_occlusion_queries_resolve_to_zero() {
    let h = harness();
    let pool = h.device.create_query_pool(QueryType::Occlusion, 4).unwrap();
    let dest = h
        .device
        .create_buffer(
            &BufferDescriptor {
                label: Some("query results"),
                size: 48,
                usage: BufferUsage::COPY_DST,
                memory: BufferMemoryPreference::Readback,
                stride: 0,
            },
            Some(&[0xaa; 48]),
        )
        .unwrap();

    let mut ctx = h.device.create_command_context().unwrap();
    ctx.begin();
    ctx.reset_query_pool(&pool, 0, 4);
    for i in 0..4 {
        ctx.begin_query(&pool, i);
        ctx.end_query(&pool, i);
    }
    ctx.resolve_queries(&pool, 0, 4, &dest, 16).unwrap();
    ctx.end().unwrap();

    let bytes = h.device.read_buffer(&dest, 0, 48).unwrap();
    assert_eq!(&bytes[..16], &[0xaa; 16]);
    assert_eq!(u64s(&bytes[16..]), vec![0; 4]);
}

#[test]
fn occlusion_queries_count_drawn_samples() {
    let h = harness();
    let layout = pipeline_layout(&h.device, 0);
    let pipeline = graphics_pipeline(&h.device, &layout);
    let pool = h.device.create_query_pool(QueryType::Occlusion, 2).unwrap();
    let dest = readback(&h.device, 16);

    let mut ctx = h.device.create_command_context().unwrap();
    ctx.begin();
    ctx.set_graphics_pipeline(&pipeline);
    ctx.begin_query(&pool, 0);
    ctx.draw(6, 2, 0, 0);
    ctx.end_query(&pool, 0);
    ctx.begin_query(&pool, 1);
    ctx.end_query(&pool, 1);
    ctx.resolve_queries(&pool, 0, 2, &dest, 0).unwrap();
    ctx.end().unwrap();

    assert_eq!(u64s(&h.device.read_buffer(&dest, 0, 16).unwrap()), vec![12, 0]);
}

#[test]
fn pipeline_statistics_resolve_whole_records() {
    let h = harness();
    let layout = pipeline_layout(&h.device, 0);
    let pipeline = graphics_pipeline(&h.device, &layout);
    let pool = h.device.create_query_pool(QueryType::PipelineStatistics, 1).unwrap();
    assert_eq!(pool.result_size(), 88);
    let dest = readback(&h.device, 88);

    let mut ctx = h.device.create_command_context().unwrap();
    ctx.begin();
    ctx.set_graphics_pipeline(&pipeline);
    ctx.begin_query(&pool, 0);
    ctx.draw(6, 1, 0, 0);
    ctx.end_query(&pool, 0);
    ctx.resolve_queries(&pool, 0, 1, &dest, 0).unwrap();
    ctx.end().unwrap();

    let bytes = h.device.read_buffer(&dest, 0, 88).unwrap();
    let stats: PipelineStatistics = bytemuck::pod_read_unaligned(&bytes);
    assert_eq!(stats.input_assembly_vertices, 6);
    assert_eq!(stats.input_assembly_primitives, 2);
    assert_eq!(stats.vertex_shader_invocations, 6);
}

#[test]
fn timestamps_are_only_ended() {
    let h = harness();
    let pool = h.device.create_query_pool(QueryType::Timestamp, 2).unwrap();
    let dest = readback(&h.device, 16);

    let mut ctx = h.device.create_command_context().unwrap();
    ctx.begin();
    ctx.begin_query(&pool, 0);
    assert_eq!(h.device.diagnostics().snapshot().warnings, 1);
    ctx.end_query(&pool, 0);
    ctx.end_query(&pool, 1);
    ctx.resolve_queries(&pool, 0, 2, &dest, 0).unwrap();
    ctx.end().unwrap();

    let stamps = u64s(&h.device.read_buffer(&dest, 0, 16).unwrap());
    assert!(stamps[0] > 0);
    assert!(stamps[1] > stamps[0]);
}

#[test]
fn slow_queries_are_polled_until_ready() {
    let null = NullDevice::default();
    null.set_query_latency(300);
    let h = harness_with(null, D3D11Config::default());
    let pool = h.device.create_query_pool(QueryType::BinaryOcclusion, 1).unwrap();
    let dest = readback(&h.device, 8);

    let mut ctx = h.device.create_command_context().unwrap();
    ctx.begin();
    ctx.begin_query(&pool, 0);
    ctx.draw(3, 1, 0, 0);
    ctx.end_query(&pool, 0);
    ctx.resolve_queries(&pool, 0, 1, &dest, 0).unwrap();
    ctx.end().unwrap();

    assert_eq!(u64s(&h.device.read_buffer(&dest, 0, 8).unwrap()), vec![1]);
}

#[test]
fn unfinished_queries_time_out_without_writing() {
    let h = harness_with(
        NullDevice::default(),
        D3D11Config {
            query_timeout: Some(Duration::from_millis(20)),
            ..D3D11Config::default()
        },
    );
    let pool = h.device.create_query_pool(QueryType::Occlusion, 2).unwrap();
    let dest = h
        .device
        .create_buffer(
            &BufferDescriptor {
                label: Some("query results"),
                size: 16,
                usage: BufferUsage::COPY_DST,
                memory: BufferMemoryPreference::Readback,
                stride: 0,
            },
            Some(&[0xaa; 16]),
        )
        .unwrap();

    let mut ctx = h.device.create_command_context().unwrap();
    ctx.begin();
    ctx.begin_query(&pool, 0);
    ctx.end_query(&pool, 0);
    ctx.begin_query(&pool, 1);
    let result = ctx.resolve_queries(&pool, 0, 2, &dest, 0);
    ctx.end().unwrap();

    assert_eq!(result, Err(Error::QueryNotReady { index: 1 }));
    assert_eq!(h.device.read_buffer(&dest, 0, 16).unwrap(), vec![0xaa; 16]);
    assert_eq!(h.device.diagnostics().snapshot().errors, 1);
}

#[test]
fn deferred_queries_resolve_after_submit() {
    let h = harness_with(NullDevice::default(), deferred_config());
    let pool = h.device.create_query_pool(QueryType::Occlusion, 1).unwrap();
    let dest = readback(&h.device, 8);

    let mut ctx = h.device.create_command_context().unwrap();
    ctx.begin();
    ctx.begin_query(&pool, 0);
    ctx.draw(3, 1, 0, 0);
    ctx.end_query(&pool, 0);
    ctx.end().unwrap();
    ctx.submit().unwrap();

    ctx.begin();
    ctx.resolve_queries(&pool, 0, 1, &dest, 0).unwrap();
    ctx.end().unwrap();

    assert_eq!(u64s(&h.device.read_buffer(&dest, 0, 8).unwrap()), vec![3]);
}

#[test]
fn out_of_range_resolves_are_skipped() {
    let h = harness();
    let pool = h.device.create_query_pool(QueryType::Occlusion, 2).unwrap();
    let dest = readback(&h.device, 8);

    let mut ctx = h.device.create_command_context().unwrap();
    ctx.begin();
    assert!(ctx.resolve_queries(&pool, 1, 2, &dest, 0).is_ok());
    assert!(ctx.resolve_queries(&pool, 0, 2, &dest, 0).is_ok());
    assert_eq!(h.device.diagnostics().snapshot().warnings, 2);
}

#[test]
fn device_removal_is_reported() {
    let h = harness();
    assert!(h.device.check_device_lost().is_none());

    let mut ctx = h.device.create_command_context().unwrap();
    ctx.begin();
    ctx.draw(3, 1, 0, 0);
    h.null.remove_device("driver reset");

    let report = h.device.check_device_lost().unwrap();
    assert_eq!(report.reason, "driver reset");
    assert_eq!(report.counters.draws, 1);
    assert!(h.device.create_query_pool(QueryType::Occlusion, 1).is_err());
}
