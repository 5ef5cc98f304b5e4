//! Deterministic simulated collaborators for GPU thread tests.
//!
//! Every mock records into one shared [`Recorder`], and failure points
//! (device creation, hardware backend init, present results) are scripted
//! by pushing outcomes into the matching queue beforehand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ember_gpu::{
    BackendCommand, BackendFactory, DeviceCreateError, DeviceCreateParams, DeviceFactory,
    DeviceFeatures, GpuBackend, GpuDevice, GpuSettings, HostCallbacks, OverlayFactory, OverlayUi,
    PresentResult, RenderApi, SettingsStore, SystemCallbacks, SystemState, VsyncMode,
};
use ember_gpu_thread::{GpuThread, GpuThreadOptions, GpuThreadServices};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
pub struct Recorder {
    // Scripted outcomes.
    pub device_create_failures: Mutex<VecDeque<String>>,
    pub hardware_init_failures: Mutex<VecDeque<String>>,
    pub present_results: Mutex<VecDeque<PresentResult>>,
    pub skip_next_presents: AtomicU32,
    pub explicit_present: AtomicBool,
    pub fail_next_update_window: AtomicBool,

    // Observations.
    pub device_creates: AtomicU32,
    pub device_destroys: AtomicU32,
    pub begin_presents: AtomicU32,
    pub end_presents: Mutex<Vec<(bool, u64)>>,
    pub submit_presents: AtomicU32,
    pub throttles: AtomicU32,
    pub resizes: Mutex<Vec<(u32, u32)>>,
    pub vsync_changes: Mutex<Vec<(VsyncMode, bool)>>,
    pub gpu_timing_changes: Mutex<Vec<bool>>,

    pub backend_events: Mutex<Vec<String>>,
    pub handled_commands: Mutex<Vec<(&'static str, u32, Vec<u8>)>>,
    pub backend_presents: AtomicU32,

    pub overlay_new_frames: AtomicU32,
    pub overlay_end_frames: AtomicU32,
    pub overlay_osd_renders: AtomicU32,
    pub overlay_window_renders: AtomicU32,
    pub overlay_resizes: Mutex<Vec<(f32, f32)>>,

    pub osd_warnings: Mutex<Vec<String>>,
    pub osd_messages: Mutex<Vec<String>>,
    pub reported_errors: Mutex<Vec<String>>,
    pub released_windows: AtomicU32,

    pub system_state: Mutex<SystemState>,
    pub system_paused: AtomicBool,
    pub speed_limiter_updates: AtomicU32,
    pub display_resized_notifications: AtomicU32,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        *lock(&recorder.system_state) = SystemState::Running;
        recorder
    }

    pub fn script_device_create_failure(&self, message: &str) {
        lock(&self.device_create_failures).push_back(message.to_owned());
    }

    pub fn script_hardware_init_failure(&self, message: &str) {
        lock(&self.hardware_init_failures).push_back(message.to_owned());
    }

    pub fn script_present_result(&self, result: PresentResult) {
        lock(&self.present_results).push_back(result);
    }

    pub fn backend_events(&self) -> Vec<String> {
        lock(&self.backend_events).clone()
    }

    pub fn handled_commands(&self) -> Vec<(&'static str, u32, Vec<u8>)> {
        lock(&self.handled_commands).clone()
    }

    pub fn osd_warning_ids(&self) -> Vec<String> {
        lock(&self.osd_warnings).clone()
    }

    pub fn osd_message_ids(&self) -> Vec<String> {
        lock(&self.osd_messages).clone()
    }

    fn next_present_result(&self) -> PresentResult {
        lock(&self.present_results)
            .pop_front()
            .unwrap_or(PresentResult::Ok)
    }
}

struct MockDevice {
    recorder: Arc<Recorder>,
    api: RenderApi,
    timing_enabled: bool,
}

impl GpuDevice for MockDevice {
    fn render_api(&self) -> RenderApi {
        self.api
    }

    fn features(&self) -> DeviceFeatures {
        DeviceFeatures {
            explicit_present: self.recorder.explicit_present.load(Ordering::Acquire),
        }
    }

    fn window_width(&self) -> u32 {
        640
    }

    fn window_height(&self) -> u32 {
        480
    }

    fn destroy(&mut self) {
        self.recorder.device_destroys.fetch_add(1, Ordering::AcqRel);
    }

    fn begin_present(&mut self) -> PresentResult {
        self.recorder.begin_presents.fetch_add(1, Ordering::AcqRel);
        self.recorder.next_present_result()
    }

    fn end_present(&mut self, explicit: bool, present_time_ns: u64) {
        lock(&self.recorder.end_presents).push((explicit, present_time_ns));
    }

    fn submit_present(&mut self) {
        self.recorder.submit_presents.fetch_add(1, Ordering::AcqRel);
    }

    fn render_overlay_draw_lists(&mut self) {}

    fn resize_window(&mut self, width: u32, height: u32, _scale: f32) {
        lock(&self.recorder.resizes).push((width, height));
    }

    fn update_window(&mut self) -> bool {
        !self.recorder.fail_next_update_window.swap(false, Ordering::AcqRel)
    }

    fn is_vsync_blocking(&self) -> bool {
        false
    }

    fn should_skip_presenting_frame(&self) -> bool {
        let pending = self.recorder.skip_next_presents.load(Ordering::Acquire);
        if pending > 0 {
            self.recorder.skip_next_presents.store(pending - 1, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn throttle_presentation(&mut self) {
        self.recorder.throttles.fetch_add(1, Ordering::AcqRel);
        // Keep idle-present loops from spinning flat out in tests.
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    fn set_vsync_mode(&mut self, mode: VsyncMode, allow_present_throttle: bool) {
        lock(&self.recorder.vsync_changes).push((mode, allow_present_throttle));
    }

    fn set_gpu_timing_enabled(&mut self, enabled: bool) {
        self.timing_enabled = enabled;
        lock(&self.recorder.gpu_timing_changes).push(enabled);
    }

    fn gpu_timing_enabled(&self) -> bool {
        self.timing_enabled
    }

    fn get_and_reset_accumulated_gpu_time(&mut self) -> f32 {
        2.0
    }
}

struct MockDeviceFactory {
    recorder: Arc<Recorder>,
}

impl DeviceFactory for MockDeviceFactory {
    fn create_device(
        &self,
        api: RenderApi,
        _params: &DeviceCreateParams,
    ) -> Result<Box<dyn GpuDevice>, DeviceCreateError> {
        if let Some(message) = lock(&self.recorder.device_create_failures).pop_front() {
            return Err(DeviceCreateError::CreateFailed(message));
        }
        self.recorder.device_creates.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MockDevice {
            recorder: Arc::clone(&self.recorder),
            api,
            timing_enabled: false,
        }))
    }
}

struct MockBackend {
    recorder: Arc<Recorder>,
    kind: &'static str,
}

impl GpuBackend for MockBackend {
    fn initialize(&mut self, clear_vram: bool) -> anyhow::Result<()> {
        if self.kind == "hardware" {
            if let Some(message) = lock(&self.recorder.hardware_init_failures).pop_front() {
                anyhow::bail!("{message}");
            }
        }
        lock(&self.recorder.backend_events)
            .push(format!("init {} clear_vram={clear_vram}", self.kind));
        Ok(())
    }

    fn handle_command(&mut self, cmd: BackendCommand<'_>) {
        lock(&self.recorder.handled_commands).push((self.kind, cmd.opcode, cmd.payload.to_vec()));
    }

    fn flush_render(&mut self) {}

    fn present_display(&mut self) -> PresentResult {
        self.recorder.backend_presents.fetch_add(1, Ordering::AcqRel);
        self.recorder.next_present_result()
    }

    fn read_vram(&mut self, _x: u32, _y: u32, width: u32, height: u32) {
        lock(&self.recorder.backend_events)
            .push(format!("read_vram {}x{height} {}", width, self.kind));
    }

    fn update_settings(&mut self, old: &GpuSettings, new: &GpuSettings) {
        lock(&self.recorder.backend_events).push(format!(
            "update_settings usage {}->{}",
            old.show_gpu_usage, new.show_gpu_usage
        ));
    }

    fn update_resolution_scale(&mut self) {
        lock(&self.recorder.backend_events).push("update_resolution_scale".to_owned());
    }

    fn restore_device_context(&mut self) {}
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        lock(&self.recorder.backend_events).push(format!("drop {}", self.kind));
    }
}

struct MockBackendFactory {
    recorder: Arc<Recorder>,
}

impl BackendFactory for MockBackendFactory {
    fn create_hardware_backend(&self) -> Box<dyn GpuBackend> {
        lock(&self.recorder.backend_events).push("create hardware".to_owned());
        Box::new(MockBackend {
            recorder: Arc::clone(&self.recorder),
            kind: "hardware",
        })
    }

    fn create_software_backend(&self) -> Box<dyn GpuBackend> {
        lock(&self.recorder.backend_events).push("create software".to_owned());
        Box::new(MockBackend {
            recorder: Arc::clone(&self.recorder),
            kind: "software",
        })
    }
}

struct MockOverlay {
    recorder: Arc<Recorder>,
}

impl OverlayUi for MockOverlay {
    fn initialize(&mut self, _scale: f32) -> anyhow::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) {}

    fn new_frame(&mut self) {
        self.recorder.overlay_new_frames.fetch_add(1, Ordering::AcqRel);
    }

    fn end_frame(&mut self) {
        self.recorder.overlay_end_frames.fetch_add(1, Ordering::AcqRel);
    }

    fn render_text_overlays(&mut self) {}

    fn render_osd_messages(&mut self) {
        self.recorder.overlay_osd_renders.fetch_add(1, Ordering::AcqRel);
    }

    fn render_software_cursors(&mut self) {}

    fn render_overlay_windows(&mut self) {
        self.recorder.overlay_window_renders.fetch_add(1, Ordering::AcqRel);
    }

    fn render_debug_windows(&mut self) {}

    fn destroy_overlay_textures(&mut self) {}

    fn window_resized(&mut self, width: f32, height: f32) {
        lock(&self.recorder.overlay_resizes).push((width, height));
    }
}

struct MockOverlayFactory {
    recorder: Arc<Recorder>,
}

impl OverlayFactory for MockOverlayFactory {
    fn create_overlay(&self) -> Box<dyn OverlayUi> {
        Box::new(MockOverlay {
            recorder: Arc::clone(&self.recorder),
        })
    }
}

struct MockHost {
    recorder: Arc<Recorder>,
}

impl HostCallbacks for MockHost {
    fn release_render_window(&self) {
        self.recorder.released_windows.fetch_add(1, Ordering::AcqRel);
    }

    fn add_icon_osd_warning(&self, id: &str, _icon: &str, _message: &str, _duration_secs: f32) {
        lock(&self.recorder.osd_warnings).push(id.to_owned());
    }

    fn add_icon_osd_message(&self, id: &str, _icon: &str, _message: &str, _duration_secs: f32) {
        lock(&self.recorder.osd_messages).push(id.to_owned());
    }

    fn report_error_async(&self, title: &str, message: &str) {
        lock(&self.recorder.reported_errors).push(format!("{title}: {message}"));
    }
}

struct MockSystem {
    recorder: Arc<Recorder>,
}

impl SystemCallbacks for MockSystem {
    fn is_valid(&self) -> bool {
        *lock(&self.recorder.system_state) != SystemState::Shutdown
    }

    fn is_paused(&self) -> bool {
        self.recorder.system_paused.load(Ordering::Acquire)
    }

    fn state(&self) -> SystemState {
        *lock(&self.recorder.system_state)
    }

    fn update_speed_limiter_state(&self) {
        self.recorder.speed_limiter_updates.fetch_add(1, Ordering::AcqRel);
    }

    fn host_display_resized(&self) {
        self.recorder
            .display_resized_notifications
            .fetch_add(1, Ordering::AcqRel);
    }
}

pub struct TestRig {
    pub gpu: GpuThread,
    pub recorder: Arc<Recorder>,
    pub settings: Arc<SettingsStore>,
}

pub fn rig() -> TestRig {
    rig_with_options(GpuThreadOptions::default())
}

pub fn rig_with_options(options: GpuThreadOptions) -> TestRig {
    let recorder = Recorder::new();
    let settings = Arc::new(SettingsStore::new());

    let services = GpuThreadServices {
        device_factory: Arc::new(MockDeviceFactory {
            recorder: Arc::clone(&recorder),
        }),
        backend_factory: Arc::new(MockBackendFactory {
            recorder: Arc::clone(&recorder),
        }),
        overlay_factory: Arc::new(MockOverlayFactory {
            recorder: Arc::clone(&recorder),
        }),
        host: Arc::new(MockHost {
            recorder: Arc::clone(&recorder),
        }),
        system: Arc::new(MockSystem {
            recorder: Arc::clone(&recorder),
        }),
        settings: Arc::clone(&settings),
    };

    TestRig {
        gpu: GpuThread::with_options(services, options),
        recorder,
        settings,
    }
}
