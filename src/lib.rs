//! The core of a Vulkan rendering engine, written from scratch the hard way.
//!
//! Scene command lists are turned into draw plans, packed into pooled device
//! memory, and rendered by render queues which the frame loop schedules,
//! submits and presents through a swapchain.

pub mod device;
pub mod draw_plan;
pub mod engine;
mod error;
pub mod frame;
pub mod memory;
mod options;
mod pretty_wrappers;
pub mod queue;
pub mod render_pass;
pub mod shadow;
pub mod swapchain;
pub mod texture_set;
pub mod view;

pub use self::{
    error::{RenderError, RenderResult},
    options::{EngineOptions, PresentModePreference, RenderMode},
    pretty_wrappers::{PrettyBitflag, PrettyPages, PrettySize},
};
