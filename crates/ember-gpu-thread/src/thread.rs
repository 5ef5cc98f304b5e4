//! The GPU worker thread: producer facade, consumer loop, and the device
//! and backend lifecycle that runs on the worker side.
//!
//! [`GpuThread`] is owned by the application on the submitting side. It
//! shares the command ring and wake protocol with the worker through one
//! `Arc`; the graphics device, backend, and overlay UI live exclusively in
//! the worker's [`GpuThreadContext`] and are never visible outside it.
//!
//! All submission operations take `&self` and are safe to call from the
//! single emulation thread that owns command submission. The ring is
//! single-producer by construction; do not submit from two threads at
//! once.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tracing::{debug, error, info, warn};

use ember_gpu::host::osd_icons;
use ember_gpu::{
    BackendCommand, BackendFactory, DeviceFactory, GpuBackend, GpuDevice, GpuSettings,
    HostCallbacks, OverlayFactory, OverlayUi, PresentResult, RenderApi, Renderer, SettingsStore,
    SystemCallbacks, SystemState, VsyncMode, OSD_CRITICAL_ERROR_DURATION, VRAM_HEIGHT, VRAM_WIDTH,
};

use crate::ring::{
    SlotWriter, OPCODE_ASYNC_CALL, OPCODE_BACKEND_FIRST, OPCODE_CHANGE_BACKEND, OPCODE_UPDATE_VSYNC,
};
use crate::state::SharedState;

/// Thunks queued through the ring run on the worker with access to the
/// worker-owned state.
pub(crate) type ThreadCall = Box<dyn FnOnce(&mut GpuThreadContext) + Send>;

/// An async-call payload is the address of a leaked `Box<ThreadCall>`.
const ASYNC_CALL_PAYLOAD_SIZE: usize = std::mem::size_of::<u64>();

#[derive(Clone, Debug)]
pub struct GpuThreadOptions {
    /// Command ring capacity in bytes.
    pub queue_capacity: u32,
    /// `push` wakes the worker once this many bytes are pending.
    pub wake_threshold_bytes: u32,
    /// Version stamp handed to the device's shader cache.
    pub shader_cache_version: u32,
    /// Two device losses closer together than this are treated as a wedged
    /// device and abort the worker.
    pub min_time_between_device_resets: Duration,
}

impl Default for GpuThreadOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 4 * 1024 * 1024,
            wake_threshold_bytes: 256,
            shader_cache_version: 1,
            min_time_between_device_resets: Duration::from_secs(15),
        }
    }
}

/// The collaborators the engine drives. Everything is behind an `Arc` so
/// the worker thread can hold its own handles.
#[derive(Clone)]
pub struct GpuThreadServices {
    pub device_factory: Arc<dyn DeviceFactory>,
    pub backend_factory: Arc<dyn BackendFactory>,
    pub overlay_factory: Arc<dyn OverlayFactory>,
    pub host: Arc<dyn HostCallbacks>,
    pub system: Arc<dyn SystemCallbacks>,
    pub settings: Arc<SettingsStore>,
}

pub struct GpuThread {
    services: GpuThreadServices,
    options: GpuThreadOptions,
    shared: Arc<SharedState>,
    handle: Option<JoinHandle<()>>,
}

impl GpuThread {
    pub fn new(services: GpuThreadServices) -> Self {
        Self::with_options(services, GpuThreadOptions::default())
    }

    pub fn with_options(services: GpuThreadServices, options: GpuThreadOptions) -> Self {
        let shared = Arc::new(SharedState::new(options.queue_capacity));
        Self {
            services,
            options,
            shared,
            handle: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawns the worker, blocking until its device came up. With no
    /// renderer the worker runs without a backend until one is requested.
    pub fn start(&mut self, renderer: Option<Renderer>) -> anyhow::Result<()> {
        assert!(!self.is_started());
        info!("Starting GPU thread...");

        // Fresh shared state per run; the requested vsync settings carry
        // over so a forced restart keeps the user's mode.
        let shared = Arc::new(SharedState::new(self.options.queue_capacity));
        shared.set_requested_vsync(
            self.shared.requested_vsync(),
            self.shared.requested_allow_present_throttle(),
        );
        shared.set_requested_renderer(renderer);

        let gpu_settings = GpuSettings::load(&self.services.settings);
        let api =
            gpu_settings.render_api_for_renderer(renderer.unwrap_or(gpu_settings.renderer));

        let context = GpuThreadContext {
            shared: Arc::clone(&shared),
            services: self.services.clone(),
            options: self.options.clone(),
            device: None,
            backend: None,
            overlay: None,
            gpu_settings,
            perf: crate::perf::PerfWindow::new(),
            last_device_reset: None,
        };

        let handle = std::thread::Builder::new()
            .name("GPUThread".into())
            .spawn(move || context.thread_entry(api))?;

        shared.startup_sem.wait();
        if !shared.open_flag.load(Ordering::Acquire) {
            error!("Failed to create GPU thread.");
            let err = shared
                .take_startup_error()
                .unwrap_or_else(|| anyhow!("GPU thread failed to start"));
            let _ = handle.join();
            return Err(err);
        }

        self.shared = shared;
        self.handle = Some(handle);
        debug!("GPU thread started.");
        Ok(())
    }

    /// Flags the worker down, wakes it, and joins. Returns an error if the
    /// worker had panicked (a wedged device, see
    /// [`GpuThreadOptions::min_time_between_device_resets`]).
    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        self.shared.shutdown_flag.store(true, Ordering::Release);
        self.shared.set_requested_renderer(None);
        self.shared.wake.wake();

        match handle.join() {
            Ok(()) => {
                info!("GPU thread stopped.");
                Ok(())
            }
            Err(_) => Err(anyhow!("GPU thread panicked before shutdown")),
        }
    }

    /// Requests a backend for `renderer`, starting the worker first if
    /// necessary. Blocks until the backend change has been applied.
    pub fn create_backend(&mut self, renderer: Renderer) -> anyhow::Result<()> {
        if self.is_started() {
            self.shared.set_requested_renderer(Some(renderer));
            self.push_empty_and_sync(OPCODE_CHANGE_BACKEND);
            Ok(())
        } else {
            self.start(Some(renderer))
        }
    }

    /// Switches the active backend. `force_recreate_device` tears the
    /// whole worker down and brings it back up, which also recreates the
    /// device and window.
    pub fn switch_backend(
        &mut self,
        renderer: Renderer,
        force_recreate_device: bool,
    ) -> anyhow::Result<()> {
        assert!(self.is_started(), "GPU thread is not running");

        if !force_recreate_device {
            self.shared.set_requested_renderer(Some(renderer));
            self.push_empty_and_sync(OPCODE_CHANGE_BACKEND);
            return Ok(());
        }

        self.shutdown()?;
        if let Err(err) = self.start(Some(renderer)) {
            self.shared.set_requested_renderer(None);
            return Err(err);
        }
        Ok(())
    }

    /// Destroys the active backend, keeping the worker (and device) alive
    /// for overlay rendering and later backend creation.
    pub fn destroy_backend(&mut self) {
        if !self.is_started() {
            return;
        }
        self.shared.set_requested_renderer(None);
        self.push_empty_and_sync(OPCODE_CHANGE_BACKEND);
    }

    /// Reserves a command slot. Backend-specific opcodes start at
    /// [`OPCODE_BACKEND_FIRST`].
    pub fn allocate_command(&self, opcode: u32, payload_len: usize) -> SlotWriter<'_> {
        let shared = &*self.shared;
        shared
            .ring
            .allocate(opcode, payload_len, &|| shared.wake.wake())
    }

    /// Publishes a slot. The worker is only woken once enough bytes are
    /// pending to be worth a syscall.
    pub fn push(&self, slot: SlotWriter<'_>) {
        self.shared.ring.publish(slot);
        if self.shared.ring.pending_bytes() >= self.options.wake_threshold_bytes {
            self.shared.wake.wake();
        }
    }

    pub fn push_and_wake(&self, slot: SlotWriter<'_>) {
        self.shared.ring.publish(slot);
        self.shared.wake.wake();
    }

    /// Publishes a slot and blocks until the worker has drained everything
    /// queued so far. `spin` trades a short busy-wait for the blocking
    /// path, which is worth it for small batches.
    pub fn push_and_sync(&self, slot: SlotWriter<'_>, spin: bool) {
        self.shared.ring.publish(slot);
        self.shared.wake.wake();
        self.shared.wake.sync(spin);
    }

    /// Blocks until the worker has drained everything queued so far.
    pub fn sync(&self, spin: bool) {
        assert!(self.is_started(), "GPU thread is not running");
        if !self.shared.ring.is_empty() {
            // Commands queued below the wake threshold still have to be
            // drained before the sync can complete.
            self.shared.wake.wake();
        }
        self.shared.wake.sync(spin);
    }

    fn push_empty_and_sync(&self, opcode: u32) {
        let slot = self.allocate_command(opcode, 0);
        self.push_and_sync(slot, false);
    }

    /// Runs `func` on the worker thread, after everything queued before
    /// it. Does not wait for completion.
    pub fn run_on_thread<F: FnOnce() + Send + 'static>(&self, func: F) {
        self.push_thread_call(Box::new(move |_ctx| func()));
    }

    pub(crate) fn push_thread_call(&self, call: ThreadCall) {
        assert!(self.is_started(), "GPU thread is not running");
        let raw = Box::into_raw(Box::new(call));
        let shared = &*self.shared;
        let mut slot =
            shared
                .ring
                .allocate(OPCODE_ASYNC_CALL, ASYNC_CALL_PAYLOAD_SIZE, &|| {
                    shared.wake.wake()
                });
        slot.payload_mut()
            .copy_from_slice(&(raw as usize as u64).to_ne_bytes());
        shared.ring.publish(slot);
        shared.wake.wake();
    }

    /// Snapshots the settings store and applies the new snapshot on the
    /// worker.
    pub fn update_settings(&self) {
        assert!(self.is_started(), "GPU thread is not running");
        let snapshot = GpuSettings::load(&self.services.settings);
        self.push_thread_call(Box::new(move |ctx| {
            debug!("Updating GPU settings on thread...");
            let old = std::mem::replace(&mut ctx.gpu_settings, snapshot);
            ctx.update_settings_on_thread(&old);
        }));
    }

    pub fn resize_display_window(&self, width: u32, height: u32, scale: f32) {
        assert!(self.is_started(), "GPU thread is not running");
        self.push_thread_call(Box::new(move |ctx| {
            let Some(device) = ctx.device.as_mut() else {
                return;
            };
            debug!("Display window resized to {width}x{height}");

            device.resize_window(width, height, scale);
            let f_width = device.window_width() as f32;
            let f_height = device.window_height() as f32;
            if let Some(overlay) = ctx.overlay.as_mut() {
                overlay.window_resized(f_width, f_height);
            }

            if ctx.services.system.is_valid() && ctx.services.system.is_paused() {
                // On some hosts a single re-present after a resize never
                // reaches the screen; two does.
                ctx.present_current_frame();
                ctx.present_current_frame();
            }

            if ctx.gpu_settings.resolution_scale == 0 {
                if let Some(backend) = ctx.backend.as_mut() {
                    backend.update_resolution_scale();
                }
            }
        }));

        self.services.system.host_display_resized();
    }

    pub fn update_display_window(&self) {
        assert!(self.is_started(), "GPU thread is not running");
        self.push_thread_call(Box::new(|ctx| {
            let Some(device) = ctx.device.as_mut() else {
                return;
            };
            if !device.update_window() {
                ctx.services.host.report_error_async(
                    "Error",
                    "Failed to change window after update. The log may contain more information.",
                );
                return;
            }

            let f_width = device.window_width() as f32;
            let f_height = device.window_height() as f32;
            if let Some(overlay) = ctx.overlay.as_mut() {
                overlay.window_resized(f_width, f_height);
            }
            ctx.services.system.host_display_resized();

            if ctx.services.system.is_valid() {
                ctx.services.system.update_speed_limiter_state();
                if ctx.services.system.is_paused() {
                    ctx.present_current_frame();
                }
            }
        }));
    }

    pub fn set_vsync(&self, mode: VsyncMode, allow_present_throttle: bool) {
        assert!(self.is_started(), "GPU thread is not running");
        if self.shared.requested_vsync() == mode
            && self.shared.requested_allow_present_throttle() == allow_present_throttle
        {
            return;
        }
        self.shared.set_requested_vsync(mode, allow_present_throttle);
        let slot = self.allocate_command(OPCODE_UPDATE_VSYNC, 0);
        self.push_and_wake(slot);
    }

    pub fn present_current_frame(&self) {
        if self.shared.run_idle_flag.load(Ordering::Relaxed) {
            // Running idle re-presents continuously anyway.
            return;
        }
        self.push_thread_call(Box::new(|ctx| ctx.present_current_frame()));
    }

    /// Queues a frame presentation. With `allow_skip` the device may elect
    /// to drop the frame; a non-zero `present_time_ns` delays submission
    /// until that time on devices with explicit present.
    pub fn present_frame(&self, allow_skip: bool, present_time_ns: u64) {
        self.push_thread_call(Box::new(move |ctx| {
            ctx.present_frame(allow_skip, present_time_ns)
        }));
    }

    /// While enabled, an empty queue produces idle frames instead of
    /// putting the worker to sleep.
    pub fn set_run_idle(&self, enabled: bool) {
        self.shared.run_idle_flag.store(enabled, Ordering::Release);
        debug!(
            "GPU thread now {} idle",
            if enabled { "running" } else { "NOT running" }
        );
    }

    pub fn render_api(&self) -> RenderApi {
        self.shared.render_api()
    }

    pub fn requested_renderer(&self) -> Option<Renderer> {
        self.shared.requested_renderer()
    }

    pub fn gpu_usage(&self) -> f32 {
        self.shared.perf.gpu_usage()
    }

    pub fn average_gpu_time(&self) -> f32 {
        self.shared.perf.average_gpu_time()
    }

    pub fn set_performance_counter_update_pending(&self) {
        self.shared.perf.request_update();
    }

    /// Bytes queued but not yet consumed by the worker.
    pub fn pending_command_bytes(&self) -> u32 {
        self.shared.ring.pending_bytes()
    }

    /// True once the worker has drained the queue and gone idle.
    pub fn is_idle(&self) -> bool {
        self.shared.ring.is_empty() && self.shared.wake.is_sleeping()
    }
}

impl Drop for GpuThread {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!("{err}");
        }
    }
}

/// Worker-side state. Created on the submitting thread, moved into the
/// worker, and never shared.
pub(crate) struct GpuThreadContext {
    shared: Arc<SharedState>,
    services: GpuThreadServices,
    options: GpuThreadOptions,
    device: Option<Box<dyn GpuDevice>>,
    backend: Option<Box<dyn GpuBackend>>,
    overlay: Option<Box<dyn OverlayUi>>,
    gpu_settings: GpuSettings,
    perf: crate::perf::PerfWindow,
    last_device_reset: Option<Instant>,
}

impl GpuThreadContext {
    fn thread_entry(mut self, api: RenderApi) {
        if let Err(err) = self.create_device(api) {
            self.services.host.release_render_window();
            self.shared.set_startup_error(err);
            self.shared.open_flag.store(false, Ordering::Release);
            self.shared.startup_sem.post();
            return;
        }

        self.create_backend(true);
        self.shared.open_flag.store(true, Ordering::Release);
        self.shared.startup_sem.post();

        self.run_loop();

        self.destroy_backend();
        self.destroy_device();
        self.services.host.release_render_window();
    }

    fn run_loop(&mut self) {
        loop {
            if self.shared.ring.is_empty() {
                if self.shared.shutdown_flag.load(Ordering::Relaxed) {
                    break;
                }
                let allow_sleep = !self.shared.run_idle_flag.load(Ordering::Relaxed);
                if self.shared.wake.sleep(allow_sleep) {
                    // Woken with work queued; reload the ring offsets.
                    continue;
                }
                self.present_frame(false, 0);
                if let Some(device) = self.device.as_mut() {
                    if !device.is_vsync_blocking() {
                        device.throttle_presentation();
                    }
                }
                continue;
            }

            let shared = Arc::clone(&self.shared);
            let mut drain = shared.ring.drain();
            while let Some(cmd) = drain.next() {
                match cmd.opcode {
                    OPCODE_ASYNC_CALL => {
                        let addr = u64::from_ne_bytes(
                            cmd.payload()[..ASYNC_CALL_PAYLOAD_SIZE].try_into().expect("async-call payload"),
                        );
                        // SAFETY: the payload is the address produced by
                        // `Box::into_raw` in `push_thread_call`, published
                        // exactly once and consumed exactly once here.
                        let thunk =
                            unsafe { Box::from_raw(addr as usize as *mut ThreadCall) };
                        thunk(&mut *self);
                    }
                    OPCODE_CHANGE_BACKEND => self.change_backend(),
                    OPCODE_UPDATE_VSYNC => self.update_vsync(),
                    opcode if opcode >= OPCODE_BACKEND_FIRST => {
                        let backend = self
                            .backend
                            .as_mut()
                            .unwrap_or_else(|| panic!("backend command {opcode:#x} with no active backend"));
                        backend.handle_command(BackendCommand {
                            opcode,
                            payload: cmd.payload(),
                        });
                    }
                    opcode => panic!("unknown GPU thread command opcode {opcode:#x}"),
                }
            }
            drain.finish();
        }
    }

    fn create_device(&mut self, api: RenderApi) -> anyhow::Result<()> {
        debug_assert!(self.device.is_none());
        info!("Trying to create a {} GPU device...", api.as_str());

        let params = self.gpu_settings.device_create_params(
            self.options.shader_cache_version,
            self.shared.requested_vsync(),
            self.shared.requested_allow_present_throttle(),
        );

        let mut device = match self.services.device_factory.create_device(api, &params) {
            Ok(device) => device,
            Err(err) => {
                error!("Failed to create GPU device: {err}");
                self.shared.set_render_api(RenderApi::None);
                return Err(anyhow!(
                    "Failed to create render device:\n\n{err}\n\nThis may be due to your GPU \
                     not supporting the chosen renderer ({}), or because your graphics drivers \
                     need to be updated.",
                    api.as_str()
                ));
            }
        };

        let mut overlay = self.services.overlay_factory.create_overlay();
        if let Err(err) = overlay.initialize(self.gpu_settings.osd_scale / 100.0) {
            error!("Failed to initialize overlay UI: {err}");
            overlay.shutdown();
            device.destroy();
            self.shared.set_render_api(RenderApi::None);
            return Err(anyhow!("Failed to initialize overlay UI: {err}"));
        }

        self.perf.accumulated_gpu_time = 0.0;
        self.perf.presents_since_last_update = 0;
        device.set_gpu_timing_enabled(self.gpu_settings.show_gpu_usage);
        self.shared.set_render_api(device.render_api());

        self.device = Some(device);
        self.overlay = Some(overlay);
        Ok(())
    }

    fn destroy_device(&mut self) {
        let Some(mut device) = self.device.take() else {
            return;
        };

        if let Some(mut overlay) = self.overlay.take() {
            overlay.destroy_overlay_textures();
            overlay.shutdown();
        }

        info!("Destroying {} GPU device...", device.render_api().as_str());
        device.destroy();
    }

    fn handle_device_lost(&mut self) {
        // A device that keeps dying right after a reset is wedged; an
        // endless reset loop would leak its way to a crash anyway.
        let now = Instant::now();
        if let Some(last) = self.last_device_reset {
            if now.duration_since(last) < self.options.min_time_between_device_resets {
                panic!("Host GPU lost too many times, device is probably completely wedged.");
            }
        }
        self.last_device_reset = Some(now);

        // Something went really bad. Toss out everything and hobble on.
        self.destroy_backend();
        self.destroy_device();

        let renderer = self
            .shared
            .requested_renderer()
            .unwrap_or(self.gpu_settings.renderer);
        let api = self.gpu_settings.render_api_for_renderer(renderer);
        if let Err(err) = self.create_device(api) {
            error!("Failed to recreate GPU device after loss: {err}");
            panic!("Failed to recreate GPU device after loss.");
        }

        self.create_backend(false);

        // The first frame after reopening is going to be trash anyway.
        self.services.host.add_icon_osd_warning(
            "HostGPUDeviceLost",
            osd_icons::EXCLAMATION_TRIANGLE,
            "Host GPU device encountered an error and has recovered. This may cause broken rendering.",
            OSD_CRITICAL_ERROR_DURATION,
        );
    }

    fn create_backend(&mut self, clear_vram: bool) {
        debug_assert!(self.backend.is_none());
        let Some(renderer) = self.shared.requested_renderer() else {
            return;
        };

        let is_hardware = !renderer.is_software();
        let mut backend = if is_hardware {
            self.services.backend_factory.create_hardware_backend()
        } else {
            self.services.backend_factory.create_software_backend()
        };

        if let Err(err) = backend.initialize(clear_vram) {
            error!("Failed to create {} renderer: {err}", renderer.as_str());
            if !is_hardware {
                panic!("Failed to initialize software backend: {err}");
            }

            self.services.host.add_icon_osd_message(
                "GPUBackendCreationFailed",
                osd_icons::PAINT_ROLLER,
                &format!(
                    "Failed to initialize {} renderer, falling back to software renderer.",
                    renderer.as_str()
                ),
                OSD_CRITICAL_ERROR_DURATION,
            );

            self.shared.set_requested_renderer(Some(Renderer::Software));
            backend = self.services.backend_factory.create_software_backend();
            if let Err(err) = backend.initialize(clear_vram) {
                panic!("Failed to initialize software backend: {err}");
            }
        }

        self.backend = Some(backend);
    }

    fn change_backend(&mut self) {
        let Some(renderer) = self.shared.requested_renderer() else {
            self.destroy_backend();
            return;
        };

        if let Some(backend) = self.backend.as_mut() {
            // Read back VRAM so pixel state survives the swap.
            backend.read_vram(0, 0, VRAM_WIDTH, VRAM_HEIGHT);
        }

        if renderer.is_software() {
            // Software works with every device; just recreate the backend.
            self.destroy_backend();
            self.create_backend(false);
            return;
        }

        self.destroy_backend();

        let current_api = self.shared.render_api();
        let expected_api = self.gpu_settings.render_api_for_renderer(renderer);
        if current_api != expected_api {
            warn!(
                "Recreating GPU device, expecting {} got {}",
                expected_api.as_str(),
                current_api.as_str()
            );

            self.destroy_device();
            // Things tend to break when the window is kept across APIs.
            self.services.host.release_render_window();

            if let Err(err) = self.create_device(expected_api) {
                self.services.host.add_icon_osd_message(
                    "DeviceSwitchFailed",
                    osd_icons::PAINT_ROLLER,
                    &format!(
                        "Failed to create {} GPU device, reverting to {}.\n{err}",
                        expected_api.as_str(),
                        current_api.as_str()
                    ),
                    OSD_CRITICAL_ERROR_DURATION,
                );

                self.services.host.release_render_window();
                if let Err(err) = self.create_device(current_api) {
                    error!("{err}");
                    panic!("Failed to switch back to old API after creation failure");
                }
            }
        }

        self.create_backend(false);
    }

    fn destroy_backend(&mut self) {
        if self.backend.take().is_some() {
            debug!("Shutting down GPU backend...");
        }
    }

    fn update_settings_on_thread(&mut self, old: &GpuSettings) {
        let new = self.gpu_settings.clone();

        if new.show_gpu_usage != old.show_gpu_usage || new.show_gpu_stats != old.show_gpu_stats {
            self.shared.perf.request_update();
            self.perf.last_update = Instant::now();
            self.perf.presents_since_last_update = 0;
        }

        if new.show_gpu_usage != old.show_gpu_usage {
            self.perf.accumulated_gpu_time = 0.0;
            self.shared.perf.publish(0.0, 0.0);
            if let Some(device) = self.device.as_mut() {
                device.set_gpu_timing_enabled(new.show_gpu_usage);
            }
        }

        if let Some(backend) = self.backend.as_mut() {
            backend.update_settings(old, &new);
        }
    }

    /// Re-presents the current frame, unless idle presentation is already
    /// doing so continuously.
    fn present_current_frame(&mut self) {
        if self.shared.run_idle_flag.load(Ordering::Relaxed) {
            return;
        }
        self.present_frame(false, 0);
    }

    fn update_vsync(&mut self) {
        let mode = self.shared.requested_vsync();
        let allow_present_throttle = self.shared.requested_allow_present_throttle();
        if let Some(device) = self.device.as_mut() {
            device.set_vsync_mode(mode, allow_present_throttle);
        }
    }

    pub(crate) fn present_frame(&mut self, allow_skip: bool, present_time_ns: u64) {
        if let Some(backend) = self.backend.as_mut() {
            // Flush so nothing is still mapped when the device presents.
            backend.flush_render();
        }

        self.perf.presents_since_last_update += 1;
        if self.shared.perf.take_update_request() {
            self.update_performance_counters();
        }

        let (skip_present, explicit_present) = {
            let Some(device) = self.device.as_mut() else {
                return;
            };
            (
                allow_skip && device.should_skip_presenting_frame(),
                present_time_ns != 0 && device.features().explicit_present,
            )
        };

        if let Some(overlay) = self.overlay.as_mut() {
            if !skip_present {
                overlay.render_text_overlays();
                overlay.render_osd_messages();
                if self.services.system.state() == SystemState::Running {
                    overlay.render_software_cursors();
                }
            }
            // Overlay windows render even on skipped frames, otherwise
            // mouse input breaks while skipping.
            overlay.render_overlay_windows();
            overlay.render_debug_windows();
        }

        let result = if skip_present {
            PresentResult::SkipPresent
        } else if let Some(backend) = self.backend.as_mut() {
            backend.present_display()
        } else {
            match self.device.as_mut() {
                Some(device) => device.begin_present(),
                None => return,
            }
        };

        if result == PresentResult::Ok {
            if let Some(device) = self.device.as_mut() {
                device.render_overlay_draw_lists();
                device.end_present(
                    explicit_present,
                    if explicit_present { present_time_ns } else { 0 },
                );
                if device.gpu_timing_enabled() {
                    self.perf.accumulated_gpu_time +=
                        device.get_and_reset_accumulated_gpu_time();
                }
                if explicit_present {
                    ember_gpu::sleep_until_ns(present_time_ns);
                    device.submit_present();
                }
            }
        } else {
            if result == PresentResult::DeviceLost {
                self.handle_device_lost();
            }
            // The UI frame still has to be closed out.
            if let Some(overlay) = self.overlay.as_mut() {
                overlay.end_frame();
            }
        }

        if let Some(overlay) = self.overlay.as_mut() {
            overlay.new_frame();
        }
        if let Some(backend) = self.backend.as_mut() {
            backend.restore_device_context();
        }
    }

    fn update_performance_counters(&mut self) {
        let now = Instant::now();
        let frames = std::mem::take(&mut self.perf.presents_since_last_update);
        let elapsed = now
            .duration_since(std::mem::replace(&mut self.perf.last_update, now))
            .as_secs_f32();

        let timing_enabled = self
            .device
            .as_ref()
            .is_some_and(|device| device.gpu_timing_enabled());
        if timing_enabled {
            let average = self.perf.accumulated_gpu_time / frames.max(1) as f32;
            let usage = if elapsed > 0.0 {
                self.perf.accumulated_gpu_time / (elapsed * 10.0)
            } else {
                0.0
            };
            self.perf.accumulated_gpu_time = 0.0;
            self.shared.perf.publish(average, usage);
        }
    }
}
