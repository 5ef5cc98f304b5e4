//! Graphics device contract.
//!
//! A [`GpuDevice`] owns the platform swapchain and window surface. Exactly
//! one device exists at a time and it is only ever touched from the GPU
//! worker thread; the [`DeviceFactory`] is the seam through which the
//! application supplies a concrete implementation (and through which tests
//! supply a simulated one).

use std::path::PathBuf;

use bitflags::bitflags;
use thiserror::Error;

/// Platform presentation API a device is created for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RenderApi {
    #[default]
    None,
    Vulkan,
    OpenGl,
}

impl RenderApi {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderApi::None => "None",
            RenderApi::Vulkan => "Vulkan",
            RenderApi::OpenGl => "OpenGL",
        }
    }
}

/// Renderer selection. The software rasterizer still presents through a
/// device; which API that device uses comes from the settings snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Renderer {
    Software,
    Vulkan,
    OpenGl,
}

impl Renderer {
    pub fn is_software(self) -> bool {
        matches!(self, Renderer::Software)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Renderer::Software => "Software",
            Renderer::Vulkan => "Vulkan",
            Renderer::OpenGl => "OpenGL",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VsyncMode {
    #[default]
    Disabled,
    /// Blocking vsync; present waits for the vertical blank.
    Fifo,
    /// Non-blocking vsync; the newest frame replaces any queued one.
    Mailbox,
}

/// Result of a device or backend present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentResult {
    Ok,
    SkipPresent,
    DeviceLost,
}

bitflags! {
    /// Device features the user can force off, passed at creation time.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FeatureMask: u32 {
        const DUAL_SOURCE_BLEND = 1 << 0;
        const FRAMEBUFFER_FETCH = 1 << 1;
        const TEXTURE_BUFFERS = 1 << 2;
        const MEMORY_IMPORT = 1 << 3;
        const RASTER_ORDER_VIEWS = 1 << 4;
    }
}

/// Capabilities reported by a created device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    /// Submission of a completed frame is decoupled from composition,
    /// allowing the worker to time the submit precisely.
    pub explicit_present: bool,
}

/// Everything a [`DeviceFactory`] needs to create a device.
#[derive(Clone, Debug)]
pub struct DeviceCreateParams {
    pub adapter: String,
    /// `None` disables the on-disk shader cache.
    pub shader_cache_dir: Option<PathBuf>,
    pub shader_cache_version: u32,
    pub debug_device: bool,
    pub vsync: VsyncMode,
    pub allow_present_throttle: bool,
    /// `None` leaves exclusive-fullscreen control up to the driver.
    pub exclusive_fullscreen_control: Option<bool>,
    pub disabled_features: FeatureMask,
}

#[derive(Debug, Error)]
pub enum DeviceCreateError {
    #[error("render API {} is not available on this host", .0.as_str())]
    UnsupportedApi(RenderApi),
    #[error("failed to create device: {0}")]
    CreateFailed(String),
}

/// The graphics device owned by the GPU worker thread.
///
/// Implementations are moved onto the worker thread at creation and never
/// touched from anywhere else, so `Send` is required but `Sync` is not.
pub trait GpuDevice: Send {
    fn render_api(&self) -> RenderApi;
    fn features(&self) -> DeviceFeatures;

    fn window_width(&self) -> u32;
    fn window_height(&self) -> u32;

    /// Explicit teardown, called before the device box is dropped.
    fn destroy(&mut self);

    fn begin_present(&mut self) -> PresentResult;
    /// `present_time_ns` is only meaningful when `explicit` is set.
    fn end_present(&mut self, explicit: bool, present_time_ns: u64);
    /// Submits a frame previously ended with `explicit` set.
    fn submit_present(&mut self);
    fn render_overlay_draw_lists(&mut self);

    fn resize_window(&mut self, width: u32, height: u32, scale: f32);
    /// Re-acquires the window surface after a host window change. Returns
    /// false if the new window could not be adopted.
    fn update_window(&mut self) -> bool;

    fn is_vsync_blocking(&self) -> bool;
    fn should_skip_presenting_frame(&self) -> bool;
    fn throttle_presentation(&mut self);
    fn set_vsync_mode(&mut self, mode: VsyncMode, allow_present_throttle: bool);

    fn set_gpu_timing_enabled(&mut self, enabled: bool);
    fn gpu_timing_enabled(&self) -> bool;
    /// Accumulated GPU time in milliseconds since the last call.
    fn get_and_reset_accumulated_gpu_time(&mut self) -> f32;
}

pub trait DeviceFactory: Send + Sync {
    fn create_device(
        &self,
        api: RenderApi,
        params: &DeviceCreateParams,
    ) -> Result<Box<dyn GpuDevice>, DeviceCreateError>;
}
