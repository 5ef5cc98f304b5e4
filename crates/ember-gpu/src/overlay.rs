//! On-screen UI overlay contract (OSD messages, debug windows, cursors).

pub trait OverlayUi: Send {
    fn initialize(&mut self, scale: f32) -> anyhow::Result<()>;
    fn shutdown(&mut self);

    /// Starts a new UI frame. Called once after every present.
    fn new_frame(&mut self);
    /// Ends the current UI frame without rendering it, used when a present
    /// was skipped or failed.
    fn end_frame(&mut self);

    fn render_text_overlays(&mut self);
    fn render_osd_messages(&mut self);
    fn render_software_cursors(&mut self);
    /// Overlay windows are rendered even on skipped presents so mouse input
    /// stays live.
    fn render_overlay_windows(&mut self);
    fn render_debug_windows(&mut self);

    fn destroy_overlay_textures(&mut self);
    fn window_resized(&mut self, width: f32, height: f32);
}

pub trait OverlayFactory: Send + Sync {
    fn create_overlay(&self) -> Box<dyn OverlayUi>;
}
