//! Layered settings store and the GPU settings snapshot.
//!
//! Settings live behind a single process-wide mutex ([`SettingsStore`]) and
//! are layered: the game-specific layer overrides the base layer, and the
//! input layer overrides both for the keys it carries. Code running off the
//! main thread never holds a reference into the store; it takes a snapshot
//! under the lock ([`GpuSettings::load`]) and works from the copy.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::device::{DeviceCreateParams, FeatureMask, RenderApi, Renderer, VsyncMode};

#[derive(Clone, Debug, PartialEq)]
pub enum SettingsValue {
    Bool(bool),
    Int(i32),
    UInt(u32),
    Float(f32),
    Double(f64),
    String(String),
    StringList(Vec<String>),
}

/// Typed access to one settings layer, keyed by `(section, key)`.
pub trait SettingsInterface: Send {
    fn get_value(&self, section: &str, key: &str) -> Option<&SettingsValue>;
    fn set_value(&mut self, section: &str, key: &str, value: SettingsValue);
    fn delete_value(&mut self, section: &str, key: &str);
    fn contains_value(&self, section: &str, key: &str) -> bool {
        self.get_value(section, key).is_some()
    }
}

/// In-memory settings layer.
#[derive(Debug, Default)]
pub struct MemorySettingsInterface {
    values: HashMap<(String, String), SettingsValue>,
}

impl MemorySettingsInterface {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsInterface for MemorySettingsInterface {
    fn get_value(&self, section: &str, key: &str) -> Option<&SettingsValue> {
        self.values.get(&(section.to_owned(), key.to_owned()))
    }

    fn set_value(&mut self, section: &str, key: &str, value: SettingsValue) {
        self.values.insert((section.to_owned(), key.to_owned()), value);
    }

    fn delete_value(&mut self, section: &str, key: &str) {
        self.values.remove(&(section.to_owned(), key.to_owned()));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingsLayer {
    Base,
    Game,
    Input,
}

const LAYER_COUNT: usize = 3;

/// Read priority, highest first.
const READ_ORDER: [SettingsLayer; LAYER_COUNT] =
    [SettingsLayer::Input, SettingsLayer::Game, SettingsLayer::Base];

fn layer_index(layer: SettingsLayer) -> usize {
    match layer {
        SettingsLayer::Base => 0,
        SettingsLayer::Game => 1,
        SettingsLayer::Input => 2,
    }
}

pub struct LayeredSettings {
    layers: [Option<Box<dyn SettingsInterface>>; LAYER_COUNT],
}

impl Default for LayeredSettings {
    fn default() -> Self {
        Self {
            layers: [None, None, None],
        }
    }
}

impl LayeredSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_layer(&mut self, layer: SettingsLayer, interface: Option<Box<dyn SettingsInterface>>) {
        self.layers[layer_index(layer)] = interface;
    }

    pub fn layer(&self, layer: SettingsLayer) -> Option<&dyn SettingsInterface> {
        self.layers[layer_index(layer)].as_deref()
    }

    pub fn layer_mut(&mut self, layer: SettingsLayer) -> Option<&mut (dyn SettingsInterface + '_)> {
        match &mut self.layers[layer_index(layer)] {
            Some(layer) => Some(layer.as_mut()),
            None => None,
        }
    }

    fn get(&self, section: &str, key: &str) -> Option<&SettingsValue> {
        READ_ORDER
            .iter()
            .filter_map(|&l| self.layer(l))
            .find_map(|l| l.get_value(section, key))
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get(section, key) {
            Some(SettingsValue::Bool(v)) => *v,
            _ => default,
        }
    }

    pub fn get_int(&self, section: &str, key: &str, default: i32) -> i32 {
        match self.get(section, key) {
            Some(SettingsValue::Int(v)) => *v,
            _ => default,
        }
    }

    pub fn get_uint(&self, section: &str, key: &str, default: u32) -> u32 {
        match self.get(section, key) {
            Some(SettingsValue::UInt(v)) => *v,
            _ => default,
        }
    }

    pub fn get_float(&self, section: &str, key: &str, default: f32) -> f32 {
        match self.get(section, key) {
            Some(SettingsValue::Float(v)) => *v,
            _ => default,
        }
    }

    pub fn get_double(&self, section: &str, key: &str, default: f64) -> f64 {
        match self.get(section, key) {
            Some(SettingsValue::Double(v)) => *v,
            _ => default,
        }
    }

    pub fn get_string(&self, section: &str, key: &str, default: &str) -> String {
        match self.get(section, key) {
            Some(SettingsValue::String(v)) => v.clone(),
            _ => default.to_owned(),
        }
    }

    pub fn get_string_list(&self, section: &str, key: &str) -> Vec<String> {
        match self.get(section, key) {
            Some(SettingsValue::StringList(v)) => v.clone(),
            _ => Vec::new(),
        }
    }
}

/// The process-wide settings store. All access goes through the lock; the
/// rule for cross-thread consumers is snapshot-on-read.
pub struct SettingsStore {
    inner: Mutex<LayeredSettings>,
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsStore {
    pub fn new() -> Self {
        let mut layers = LayeredSettings::new();
        layers.set_layer(SettingsLayer::Base, Some(Box::new(MemorySettingsInterface::new())));
        Self {
            inner: Mutex::new(layers),
        }
    }

    pub fn with_base(base: Box<dyn SettingsInterface>) -> Self {
        let mut layers = LayeredSettings::new();
        layers.set_layer(SettingsLayer::Base, Some(base));
        Self {
            inner: Mutex::new(layers),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, LayeredSettings> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_base_value(&self, section: &str, key: &str, value: SettingsValue) {
        let mut layers = self.lock();
        if let Some(base) = layers.layer_mut(SettingsLayer::Base) {
            base.set_value(section, key, value);
        }
    }
}

/// Snapshot of every setting the GPU worker consumes. Copied under the
/// store lock and then owned by whichever thread needs it.
#[derive(Clone, Debug, PartialEq)]
pub struct GpuSettings {
    pub renderer: Renderer,
    /// Presentation API used when the renderer itself has no API
    /// preference (the software rasterizer).
    pub default_render_api: RenderApi,
    pub adapter: String,
    pub debug_device: bool,
    pub disable_shader_cache: bool,
    pub shader_cache_dir: PathBuf,
    pub osd_scale: f32,
    pub show_gpu_usage: bool,
    pub show_gpu_stats: bool,
    pub exclusive_fullscreen_control: Option<bool>,
    pub disable_dual_source_blend: bool,
    pub disable_framebuffer_fetch: bool,
    pub disable_texture_buffers: bool,
    pub disable_memory_import: bool,
    pub disable_raster_order_views: bool,
    /// 0 selects automatic scaling from the window size.
    pub resolution_scale: u32,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            renderer: Renderer::Vulkan,
            default_render_api: RenderApi::Vulkan,
            adapter: String::new(),
            debug_device: false,
            disable_shader_cache: false,
            shader_cache_dir: PathBuf::from("cache"),
            osd_scale: 100.0,
            show_gpu_usage: false,
            show_gpu_stats: false,
            exclusive_fullscreen_control: None,
            disable_dual_source_blend: false,
            disable_framebuffer_fetch: false,
            disable_texture_buffers: false,
            disable_memory_import: false,
            disable_raster_order_views: false,
            resolution_scale: 1,
        }
    }
}

fn parse_renderer(value: &str) -> Option<Renderer> {
    match value {
        "Software" => Some(Renderer::Software),
        "Vulkan" => Some(Renderer::Vulkan),
        "OpenGL" => Some(Renderer::OpenGl),
        _ => None,
    }
}

fn parse_render_api(value: &str) -> Option<RenderApi> {
    match value {
        "Vulkan" => Some(RenderApi::Vulkan),
        "OpenGL" => Some(RenderApi::OpenGl),
        _ => None,
    }
}

impl GpuSettings {
    /// Builds a snapshot from the store. Unknown or missing keys fall back
    /// to the defaults.
    pub fn load(store: &SettingsStore) -> Self {
        let layers = store.lock();
        let defaults = Self::default();

        let renderer = parse_renderer(&layers.get_string("GPU", "Renderer", ""))
            .unwrap_or(defaults.renderer);
        let default_render_api = parse_render_api(&layers.get_string("GPU", "RenderApi", ""))
            .unwrap_or(defaults.default_render_api);

        let exclusive_fullscreen_control =
            match layers.get_string("Display", "ExclusiveFullscreenControl", "Automatic").as_str() {
                "Allowed" => Some(true),
                "Disallowed" => Some(false),
                _ => None,
            };

        Self {
            renderer,
            default_render_api,
            adapter: layers.get_string("GPU", "Adapter", ""),
            debug_device: layers.get_bool("GPU", "UseDebugDevice", false),
            disable_shader_cache: layers.get_bool("GPU", "DisableShaderCache", false),
            shader_cache_dir: PathBuf::from(layers.get_string("GPU", "ShaderCacheDir", "cache")),
            osd_scale: layers.get_float("Display", "OsdScale", 100.0),
            show_gpu_usage: layers.get_bool("Display", "ShowGpuUsage", false),
            show_gpu_stats: layers.get_bool("Display", "ShowGpuStats", false),
            exclusive_fullscreen_control,
            disable_dual_source_blend: layers.get_bool("GPU", "DisableDualSourceBlend", false),
            disable_framebuffer_fetch: layers.get_bool("GPU", "DisableFramebufferFetch", false),
            disable_texture_buffers: layers.get_bool("GPU", "DisableTextureBuffers", false),
            disable_memory_import: layers.get_bool("GPU", "DisableMemoryImport", false),
            disable_raster_order_views: layers.get_bool("GPU", "DisableRasterOrderViews", false),
            resolution_scale: layers.get_uint("GPU", "ResolutionScale", 1),
        }
    }

    /// Maps a renderer to the API its device must be created for.
    pub fn render_api_for_renderer(&self, renderer: Renderer) -> RenderApi {
        match renderer {
            Renderer::Vulkan => RenderApi::Vulkan,
            Renderer::OpenGl => RenderApi::OpenGl,
            Renderer::Software => self.default_render_api,
        }
    }

    pub fn disabled_feature_mask(&self) -> FeatureMask {
        let mut mask = FeatureMask::empty();
        if self.disable_dual_source_blend {
            mask |= FeatureMask::DUAL_SOURCE_BLEND;
        }
        if self.disable_framebuffer_fetch {
            mask |= FeatureMask::FRAMEBUFFER_FETCH;
        }
        if self.disable_texture_buffers {
            mask |= FeatureMask::TEXTURE_BUFFERS;
        }
        if self.disable_memory_import {
            mask |= FeatureMask::MEMORY_IMPORT;
        }
        if self.disable_raster_order_views {
            mask |= FeatureMask::RASTER_ORDER_VIEWS;
        }
        mask
    }

    pub fn device_create_params(
        &self,
        shader_cache_version: u32,
        vsync: VsyncMode,
        allow_present_throttle: bool,
    ) -> DeviceCreateParams {
        DeviceCreateParams {
            adapter: self.adapter.clone(),
            shader_cache_dir: (!self.disable_shader_cache).then(|| self.shader_cache_dir.clone()),
            shader_cache_version,
            debug_device: self.debug_device,
            vsync,
            allow_present_throttle,
            exclusive_fullscreen_control: self.exclusive_fullscreen_control,
            disabled_features: self.disabled_feature_mask(),
        }
    }
}
