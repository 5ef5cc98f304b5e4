//! GPU worker-thread coordination for Ember.
//!
//! The emulation thread produces variable-length drawing commands; a
//! dedicated worker thread owns the graphics device and the renderer
//! backend and consumes them. This crate is the machinery in between:
//!
//! - A lock-free single-producer/single-consumer byte ring carrying
//!   typed, variable-length command slots with automatic wrap-around
//!   (see [`ring`]).
//! - The sleep/wake/sync protocol that keeps syscalls off the hot path:
//!   producers batch wakeups through one atomic, the worker sleeps on a
//!   semaphore only once fully drained, and a blocking sync costs one
//!   semaphore round trip at most.
//! - The [`GpuThread`] facade for the submitting side and the worker
//!   loop with its device/backend lifecycle (creation, live backend
//!   swaps, device-lost recovery, idle presentation); see [`thread`].
//!
//! The graphics API itself stays behind the trait seams in `ember-gpu`;
//! everything here works against simulated implementations in tests.

mod perf;
pub mod ring;
mod state;
pub mod thread;
mod wake;

pub use ring::{
    CommandRing, CommandSlot, Drain, SlotWriter, OPCODE_ASYNC_CALL, OPCODE_BACKEND_FIRST,
    OPCODE_CHANGE_BACKEND, OPCODE_UPDATE_VSYNC, OPCODE_WRAPAROUND,
};
pub use thread::{GpuThread, GpuThreadOptions, GpuThreadServices};
