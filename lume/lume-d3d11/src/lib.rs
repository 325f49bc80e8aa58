//! Lume D3D11: runs the Lume RHI on slot-bound, single-queue D3D11-class drivers.
//!
//! - [`BindingRemapper`] maps `(set, binding)` onto the hardware's flat per-stage slots.
//! - [`CommandContext`] emulates explicit command buffers on the immediate recorder or a deferred
//!   recorder, applying descriptor sets lazily right before each draw or dispatch.
//! - [`StateObjectCache`] deduplicates immutable state objects by content.
//!
//! The driver itself sits behind the [`hw`] traits. The `null` feature provides a recording
//! in-process implementation for headless runs and tests.

pub mod binding;
mod command;
pub mod config;
pub mod conv;
mod descriptor;
mod device;
mod diagnostics;
mod error;
pub mod hw;
#[cfg(feature = "null")]
pub mod null;
mod pipeline;
mod query;
mod render_pass;
mod resource;
mod state_cache;

pub use binding::{BindingRemapper, SlotAssignment, SlotClass, SlotConflict, PUSH_CONSTANT_SLOT};
pub use command::{CommandContext, CommandContextStats};
pub use config::{D3D11Config, ThreadingMode};
pub use descriptor::{
    DescriptorBinding, DescriptorResource, DescriptorSet, DescriptorSetLayout, DynamicOffsetSupport,
};
pub use device::D3D11Device;
pub use diagnostics::{DeviceLostReport, Diagnostics, DiagnosticsSnapshot};
pub use error::{Error, ObjectKind, Result};
pub use pipeline::{
    ComputePipeline, ComputePipelineDescriptor, GraphicsPipeline, GraphicsPipelineDescriptor,
    PipelineLayout, PipelineLayoutDescriptor,
};
pub use query::QueryPool;
pub use render_pass::{ColorAttachment, DepthStencilAttachment, RenderPassDescriptor};
pub use resource::{D3D11Buffer, D3D11Sampler, D3D11Shader, D3D11Texture};
pub use state_cache::{StateCacheStats, StateObjectCache};
