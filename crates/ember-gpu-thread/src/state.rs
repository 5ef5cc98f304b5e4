//! State shared between the submitting thread and the GPU worker.
//!
//! Everything producers touch lives here behind one `Arc`: the command
//! ring, the wake protocol, lifecycle flags, and the small "requested"
//! fields the worker re-reads when it handles a change-backend or
//! update-vsync command. The device, backend, and overlay deliberately do
//! not appear; those are owned by the worker thread alone.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use ember_gpu::{RenderApi, Renderer, VsyncMode};

use crate::perf::PerfShared;
use crate::ring::CommandRing;
use crate::wake::{Semaphore, WakeState};

fn encode_renderer(renderer: Option<Renderer>) -> u8 {
    match renderer {
        None => 0,
        Some(Renderer::Software) => 1,
        Some(Renderer::Vulkan) => 2,
        Some(Renderer::OpenGl) => 3,
    }
}

fn decode_renderer(value: u8) -> Option<Renderer> {
    match value {
        1 => Some(Renderer::Software),
        2 => Some(Renderer::Vulkan),
        3 => Some(Renderer::OpenGl),
        _ => None,
    }
}

fn encode_api(api: RenderApi) -> u8 {
    match api {
        RenderApi::None => 0,
        RenderApi::Vulkan => 1,
        RenderApi::OpenGl => 2,
    }
}

fn decode_api(value: u8) -> RenderApi {
    match value {
        1 => RenderApi::Vulkan,
        2 => RenderApi::OpenGl,
        _ => RenderApi::None,
    }
}

fn encode_vsync(mode: VsyncMode) -> u8 {
    match mode {
        VsyncMode::Disabled => 0,
        VsyncMode::Fifo => 1,
        VsyncMode::Mailbox => 2,
    }
}

fn decode_vsync(value: u8) -> VsyncMode {
    match value {
        1 => VsyncMode::Fifo,
        2 => VsyncMode::Mailbox,
        _ => VsyncMode::Disabled,
    }
}

pub(crate) struct SharedState {
    pub ring: CommandRing,
    pub wake: WakeState,

    /// Posted by the worker once startup succeeded or failed.
    pub startup_sem: Semaphore,
    /// Whether the worker came up with a working device.
    pub open_flag: AtomicBool,
    /// Populated by the worker before posting `startup_sem` on failure.
    pub startup_error: Mutex<Option<anyhow::Error>>,

    pub shutdown_flag: AtomicBool,
    pub run_idle_flag: AtomicBool,

    /// Current device API, published by the worker after device creation.
    render_api: AtomicU8,
    /// Requested fields. Producers store these with release ordering and
    /// then queue a command; the worker's handler loads them with acquire.
    requested_renderer: AtomicU8,
    requested_vsync: AtomicU8,
    requested_allow_present_throttle: AtomicBool,

    pub perf: PerfShared,
}

impl SharedState {
    pub fn new(queue_capacity: u32) -> Self {
        Self {
            ring: CommandRing::with_capacity(queue_capacity),
            wake: WakeState::new(),
            startup_sem: Semaphore::new(),
            open_flag: AtomicBool::new(false),
            startup_error: Mutex::new(None),
            shutdown_flag: AtomicBool::new(false),
            run_idle_flag: AtomicBool::new(false),
            render_api: AtomicU8::new(encode_api(RenderApi::None)),
            requested_renderer: AtomicU8::new(0),
            requested_vsync: AtomicU8::new(encode_vsync(VsyncMode::Disabled)),
            requested_allow_present_throttle: AtomicBool::new(false),
            perf: PerfShared::new(),
        }
    }

    pub fn render_api(&self) -> RenderApi {
        decode_api(self.render_api.load(Ordering::Acquire))
    }

    pub fn set_render_api(&self, api: RenderApi) {
        self.render_api.store(encode_api(api), Ordering::Release);
    }

    pub fn requested_renderer(&self) -> Option<Renderer> {
        decode_renderer(self.requested_renderer.load(Ordering::Acquire))
    }

    pub fn set_requested_renderer(&self, renderer: Option<Renderer>) {
        self.requested_renderer
            .store(encode_renderer(renderer), Ordering::Release);
    }

    pub fn requested_vsync(&self) -> VsyncMode {
        decode_vsync(self.requested_vsync.load(Ordering::Acquire))
    }

    pub fn requested_allow_present_throttle(&self) -> bool {
        self.requested_allow_present_throttle.load(Ordering::Acquire)
    }

    pub fn set_requested_vsync(&self, mode: VsyncMode, allow_present_throttle: bool) {
        self.requested_vsync
            .store(encode_vsync(mode), Ordering::Release);
        self.requested_allow_present_throttle
            .store(allow_present_throttle, Ordering::Release);
    }

    pub fn take_startup_error(&self) -> Option<anyhow::Error> {
        match self.startup_error.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn set_startup_error(&self, error: anyhow::Error) {
        if let Ok(mut slot) = self.startup_error.lock() {
            *slot = Some(error);
        }
    }
}
