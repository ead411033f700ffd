//! Turns a frame's command list into vertex, index and transform buffers
//! plus an ordered list of indexed draws.
//!
//! Draws are grouped as solid, surface and transparent. Inside a group they
//! are bucketed by pipeline, texture set layout, material and draw state so
//! the draw loop rebinds as little as possible.

mod builder;
mod commands;
mod recorder;
mod scissor;

pub use self::{
    builder::{
        DrawGroup, DrawPlan, DrawPlanBuilder, DrawStat, VertexSpan,
        ZPathDepths,
    },
    commands::{
        mul, AtlasEntry, Command, CommandHeader, CommandList, DrawState,
        GlyphAtlas, Mat4, MaterialId, MaterialInfo, MaterialSet,
        RenderingLevel, StateFlags, StateId, TransformObject, TransformedData,
        Vertex, VertexData, ZPath, IDENTITY,
    },
    recorder::{record_draws, CommandBufferRecorder, DrawRecorder, RecordStat},
    scissor::{
        full_scissor, fullscreen_quad, quarter_turns, remap_scissor,
        QUAD_INDICES,
    },
};
