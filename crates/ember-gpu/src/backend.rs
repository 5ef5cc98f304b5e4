//! Renderer backend contract.
//!
//! A backend interprets the opaque drawing commands the emulation thread
//! queues for the GPU worker. Two families exist: a software rasterizer and
//! hardware-accelerated renderers built on the active [`GpuDevice`]. The
//! worker thread creates, swaps, and destroys backends; see the lifecycle
//! handling in `ember-gpu-thread`.
//!
//! [`GpuDevice`]: crate::device::GpuDevice

use crate::settings::GpuSettings;
use crate::PresentResult;

/// Emulated VRAM dimensions, used for full read-backs across backend swaps.
pub const VRAM_WIDTH: u32 = 1024;
pub const VRAM_HEIGHT: u32 = 512;

/// One drawing command as seen by a backend: the opcode from the slot
/// header plus the payload bytes (padded to a multiple of 4).
#[derive(Clone, Copy, Debug)]
pub struct BackendCommand<'a> {
    pub opcode: u32,
    pub payload: &'a [u8],
}

pub trait GpuBackend: Send {
    /// One-time setup after construction. `clear_vram` is false when the
    /// backend is being recreated across a swap and should adopt the VRAM
    /// contents read back from its predecessor.
    fn initialize(&mut self, clear_vram: bool) -> anyhow::Result<()>;

    fn handle_command(&mut self, cmd: BackendCommand<'_>);

    /// Flushes buffered rendering so the device is safe to present.
    fn flush_render(&mut self);

    fn present_display(&mut self) -> PresentResult;

    /// Reads back the given VRAM rectangle into the shared VRAM copy, so
    /// pixel state survives a backend swap.
    fn read_vram(&mut self, x: u32, y: u32, width: u32, height: u32);

    fn update_settings(&mut self, old: &GpuSettings, new: &GpuSettings);
    fn update_resolution_scale(&mut self);

    /// Restores device bindings the overlay pass may have clobbered.
    fn restore_device_context(&mut self);
}

pub trait BackendFactory: Send + Sync {
    fn create_hardware_backend(&self) -> Box<dyn GpuBackend>;
    fn create_software_backend(&self) -> Box<dyn GpuBackend>;
}
