//! The frame scheduler.
//!
//! One loop thread owns every frame in flight and polls their fences. CPU
//! work such as command recording runs on a [WorkerPool] and continues on
//! the loop thread. Frames of the same render queue submit one after the
//! other through the [FrameEmitter].

mod emitter;
mod event_loop;
mod queue;
mod request;
mod timer;
mod worker;

pub use self::{
    emitter::FrameEmitter,
    event_loop::{
        Loop, LoopContext, LoopEvent, LoopHandle, LoopInfo, LoopTask, Then,
    },
    queue::FrameQueue,
    request::{
        CompleteFn, FrameHandle, FrameInfo, FrameInputs, FrameOutcome,
        FrameRequest, OutputFn, PassExecutor, QueuePass, RenderQueue,
        SubmittedFn,
    },
    timer::{TimerId, Timers},
    worker::WorkerPool,
};
