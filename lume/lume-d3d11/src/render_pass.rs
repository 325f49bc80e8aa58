//! Render passes: bind targets, run load-op clears. Store ops have no hardware counterpart.

use lume_rhi::{ClearColor, LoadOp, StoreOp};

use crate::command::CommandContext;
use crate::diagnostics::misuse;
use crate::hw::{ClearFlags, DsvHandle, MAX_RENDER_TARGETS};
use crate::resource::D3D11Texture;

#[derive(Debug, Clone, Copy)]
pub struct ColorAttachment<'a> {
    pub texture: &'a D3D11Texture,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    /// Used with [`LoadOp::Clear`]; opaque black when absent.
    pub clear_value: Option<ClearColor>,
}

#[derive(Debug, Clone, Copy)]
pub struct DepthStencilAttachment<'a> {
    pub texture: &'a D3D11Texture,
    pub depth_load_op: LoadOp,
    pub depth_store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    pub clear_depth: f32,
    pub clear_stencil: u8,
}

#[derive(Debug, Clone, Default)]
pub struct RenderPassDescriptor<'a> {
    pub label: Option<&'a str>,
    pub color_attachments: Vec<ColorAttachment<'a>>,
    pub depth_stencil_attachment: Option<DepthStencilAttachment<'a>>,
}

impl CommandContext {
    /// Clears the attachments whose load op is [`LoadOp::Clear`], then binds them all as render
    /// targets in one call. Attachments without the matching view are skipped with a warning.
    pub fn begin_render_pass(&mut self, desc: &RenderPassDescriptor<'_>) {
        if !self.ensure_open("begin_render_pass") {
            return;
        }
        if desc.color_attachments.len() > MAX_RENDER_TARGETS {
            misuse!(
                self.diagnostics(),
                "begin_render_pass: {} color attachments, only {} are bound",
                desc.color_attachments.len(),
                MAX_RENDER_TARGETS
            );
        }

        let mut targets = [None; MAX_RENDER_TARGETS];
        let mut clears = Vec::new();
        for (i, attachment) in desc.color_attachments.iter().take(MAX_RENDER_TARGETS).enumerate() {
            let Some(rtv) = attachment.texture.rtv() else {
                misuse!(self.diagnostics(), "begin_render_pass: color attachment {} is not renderable", i);
                continue;
            };
            targets[i] = Some(rtv);
            if attachment.load_op == LoadOp::Clear {
                clears.push((rtv, attachment.clear_value.unwrap_or(ClearColor::BLACK).to_array()));
            }
        }
        let bound = targets.iter().rposition(Option::is_some).map_or(0, |i| i + 1);

        let mut depth_clear: Option<(DsvHandle, ClearFlags, f32, u8)> = None;
        let mut dsv = None;
        if let Some(attachment) = &desc.depth_stencil_attachment {
            match attachment.texture.dsv() {
                Some(view) => {
                    dsv = Some(view);
                    let mut flags = ClearFlags::empty();
                    if attachment.depth_load_op == LoadOp::Clear {
                        flags |= ClearFlags::DEPTH;
                    }
                    if attachment.stencil_load_op == LoadOp::Clear {
                        flags |= ClearFlags::STENCIL;
                    }
                    if !flags.is_empty() {
                        depth_clear = Some((view, flags, attachment.clear_depth, attachment.clear_stencil));
                    }
                }
                None => misuse!(
                    self.diagnostics(),
                    "begin_render_pass: depth attachment has no depth-stencil view"
                ),
            }
        }

        log::trace!("begin_render_pass {:?}: {} color targets", desc.label, bound);
        self.recorder.with(|ctx| {
            for (rtv, color) in &clears {
                ctx.clear_render_target(*rtv, *color);
            }
            if let Some((view, flags, depth, stencil)) = depth_clear {
                ctx.clear_depth_stencil(view, flags, depth, stencil);
            }
            ctx.set_render_targets(&targets[..bound], dsv);
        });
        self.render_targets = targets;
        self.depth_stencil_target = dsv;
    }

    /// Binds eight null render targets and no depth target so the attachments can be sampled
    /// afterwards.
    pub fn end_render_pass(&mut self) {
        if !self.ensure_open("end_render_pass") {
            return;
        }
        self.recorder
            .with(|ctx| ctx.set_render_targets(&[None; MAX_RENDER_TARGETS], None));
        self.render_targets = [None; MAX_RENDER_TARGETS];
        self.depth_stencil_target = None;
    }
}
