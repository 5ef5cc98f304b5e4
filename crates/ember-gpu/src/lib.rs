#![forbid(unsafe_code)]

//! `ember-gpu` contains the abstract GPU interface layer used by Ember.
//!
//! The emulator renders through a dedicated GPU worker thread (see the
//! `ember-gpu-thread` crate). That engine does not talk to a graphics API
//! directly; it drives the narrow contracts defined here:
//!
//! - [`GpuDevice`] / [`DeviceFactory`] for the graphics device owned by the
//!   worker thread (swapchain, present, window, vsync, GPU timing).
//! - [`GpuBackend`] / [`BackendFactory`] for the renderer implementations
//!   (software rasterizer or hardware-accelerated) that interpret opaque
//!   command payloads.
//! - [`OverlayUi`] / [`OverlayFactory`] for the on-screen UI layer that is
//!   rendered into every presented frame.
//! - [`HostCallbacks`] / [`SystemCallbacks`] for host notifications (OSD
//!   messages, window release, pause state).
//! - [`SettingsStore`] and the [`GpuSettings`] snapshot for the layered,
//!   mutex-protected settings the engine copies rather than shares.

pub mod backend;
pub mod device;
pub mod host;
pub mod overlay;
pub mod settings;
pub mod time;

pub use backend::{BackendCommand, BackendFactory, GpuBackend, VRAM_HEIGHT, VRAM_WIDTH};
pub use device::{
    DeviceCreateError, DeviceCreateParams, DeviceFactory, DeviceFeatures, FeatureMask, GpuDevice,
    PresentResult, RenderApi, Renderer, VsyncMode,
};
pub use host::{HostCallbacks, SystemCallbacks, SystemState, OSD_CRITICAL_ERROR_DURATION};
pub use overlay::{OverlayFactory, OverlayUi};
pub use settings::{
    GpuSettings, LayeredSettings, MemorySettingsInterface, SettingsInterface, SettingsLayer,
    SettingsStore, SettingsValue,
};
pub use time::{now_ns, sleep_until_ns};
