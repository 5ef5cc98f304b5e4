//! Host and system callback contracts.
//!
//! The GPU worker reports user-visible events (OSD warnings, async errors)
//! and queries emulation state through these traits. Both are called from
//! the worker thread and occasionally from the submitting thread, so
//! implementations must be `Sync`.

/// Duration for OSD messages reporting critical errors, in seconds.
pub const OSD_CRITICAL_ERROR_DURATION: f32 = 20.0;

/// Icon glyphs for OSD messages (Font Awesome codepoints).
pub mod osd_icons {
    pub const EXCLAMATION_TRIANGLE: &str = "\u{f071}";
    pub const PAINT_ROLLER: &str = "\u{f5aa}";
}

pub trait HostCallbacks: Send + Sync {
    /// Releases the render window back to the host after the device is
    /// destroyed (or failed to be created).
    fn release_render_window(&self);

    fn add_icon_osd_warning(&self, id: &str, icon: &str, message: &str, duration_secs: f32);
    fn add_icon_osd_message(&self, id: &str, icon: &str, message: &str, duration_secs: f32);

    fn report_error_async(&self, title: &str, message: &str);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SystemState {
    #[default]
    Shutdown,
    Starting,
    Running,
    Paused,
}

pub trait SystemCallbacks: Send + Sync {
    fn is_valid(&self) -> bool;
    fn is_paused(&self) -> bool;
    fn state(&self) -> SystemState;

    /// Re-evaluates frame pacing after a display change.
    fn update_speed_limiter_state(&self);
    fn host_display_resized(&self);
}
