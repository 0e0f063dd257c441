//! Headless backend: virtual outputs for CI and display-less hosts.
//!
//! Outputs are announced on [`Backend::start`] and can be hot-plugged,
//! unplugged or reconfigured later through a [`HeadlessHandle`]. When a
//! frame interval is configured a calloop timer emits frame events for
//! every live output, standing in for vblank.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use smithay::reexports::calloop::timer::{TimeoutAction, Timer};
use smithay::reexports::calloop::{LoopHandle, RegistrationToken};
use smithay::utils::{Physical, Size};
use tracing::{debug, info, warn};

use super::{Backend, BackendEvent, EventSink, NewOutput, Platform};
use crate::{
    display::{Display, WaylandDisplay},
    error::{BackendError, DisplayError, OutputError},
    output::{describe_mode, mode_is_valid, new_mode, Mode, OutputDevice, OutputId, OutputState},
    render::{Allocator, Buffer, Renderer, ShmAllocator, SoftwareRenderer},
    state::ServerState,
};

/// Headless output configuration.
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Number of virtual outputs announced at start.
    pub output_count: u32,
    /// Virtual output width in pixels.
    pub width: i32,
    /// Virtual output height in pixels.
    pub height: i32,
    /// Refresh rate in mHz.
    pub refresh: i32,
    /// Whether outputs report their mode as preferred.
    pub report_preferred_mode: bool,
    /// Emit frame events at this interval; `None` leaves frames to the
    /// handle.
    pub frame_interval: Option<Duration>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            output_count: 1,
            width: 1920,
            height: 1080,
            refresh: 60_000,
            report_preferred_mode: true,
            frame_interval: Some(Duration::from_millis(16)),
        }
    }
}

impl HeadlessConfig {
    /// Parse a "WxH" resolution string. Returns (width, height) or None.
    pub fn parse_resolution(s: &str) -> Option<(i32, i32)> {
        let (w, h) = s.split_once('x')?;
        let w = w.parse::<i32>().ok()?;
        let h = h.parse::<i32>().ok()?;
        if w > 0 && h > 0 {
            Some((w, h))
        } else {
            None
        }
    }

    fn output_config(&self) -> VirtualOutputConfig {
        let mode = new_mode(self.width, self.height, self.refresh);
        VirtualOutputConfig {
            preferred_mode: self.report_preferred_mode.then_some(mode),
            initial_mode: (!self.report_preferred_mode).then_some(mode),
            reject_commit: false,
            reject_render: false,
        }
    }
}

/// How a single virtual output behaves.
#[derive(Debug, Clone, Default)]
pub struct VirtualOutputConfig {
    /// Mode reported by `preferred_mode`.
    pub preferred_mode: Option<Mode>,
    /// Mode the output starts in before any commit.
    pub initial_mode: Option<Mode>,
    /// Refuse every state commit.
    pub reject_commit: bool,
    /// Refuse render binding.
    pub reject_render: bool,
}

impl VirtualOutputConfig {
    pub fn with_preferred(mode: Mode) -> Self {
        Self {
            preferred_mode: Some(mode),
            ..Self::default()
        }
    }

    pub fn with_initial(mode: Mode) -> Self {
        Self {
            initial_mode: Some(mode),
            ..Self::default()
        }
    }
}

/// Device-side state of a virtual output, shared with the handle.
#[derive(Debug, Default)]
struct VirtualOutputState {
    mode: Option<Mode>,
    enabled: bool,
    /// Largest mode the bound allocator can back; `None` until bound.
    render_limit: Option<Size<i32, Physical>>,
    frames: u64,
    last_frame: Option<Buffer>,
    released: bool,
}

/// A virtual display sink.
pub struct VirtualOutput {
    id: OutputId,
    name: String,
    config: VirtualOutputConfig,
    state: Rc<RefCell<VirtualOutputState>>,
}

impl VirtualOutput {
    fn new(name: String, config: VirtualOutputConfig) -> (Self, Rc<RefCell<VirtualOutputState>>) {
        let state = Rc::new(RefCell::new(VirtualOutputState {
            mode: config.initial_mode,
            ..VirtualOutputState::default()
        }));
        let output = Self {
            id: OutputId::next(),
            name,
            config,
            state: state.clone(),
        };
        (output, state)
    }
}

impl OutputDevice for VirtualOutput {
    fn id(&self) -> OutputId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "Headless"
    }

    fn init_render(
        &mut self,
        allocator: &dyn Allocator,
        renderer: &dyn Renderer,
    ) -> Result<(), OutputError> {
        if self.config.reject_render {
            return Err(OutputError::InitRender {
                output: self.name.clone(),
                reason: format!("{} renderer not supported", renderer.name()),
            });
        }
        debug!(
            output = %self.name,
            renderer = renderer.name(),
            allocator = allocator.name(),
            "render binding"
        );
        self.state.borrow_mut().render_limit = Some(allocator.max_size());
        Ok(())
    }

    fn preferred_mode(&self) -> Option<Mode> {
        self.config.preferred_mode
    }

    fn current_mode(&self) -> Option<Mode> {
        self.state.borrow().mode
    }

    fn is_enabled(&self) -> bool {
        self.state.borrow().enabled
    }

    fn commit(&mut self, state: &OutputState) -> Result<(), OutputError> {
        if self.config.reject_commit {
            return Err(OutputError::Commit {
                output: self.name.clone(),
                reason: "rejected by device".into(),
            });
        }
        let mut current = self.state.borrow_mut();
        let Some(limit) = current.render_limit else {
            return Err(OutputError::NotRenderReady {
                output: self.name.clone(),
            });
        };
        if let Some(mode) = state.mode() {
            let reason = if !mode_is_valid(&mode) {
                Some("dimensions must be positive".to_string())
            } else if mode.size.w > limit.w || mode.size.h > limit.h {
                Some(format!("exceeds the {}x{} render limit", limit.w, limit.h))
            } else {
                None
            };
            if let Some(reason) = reason {
                debug!(output = %self.name, mode = %describe_mode(&mode), "mode refused");
                return Err(OutputError::InvalidMode {
                    output: self.name.clone(),
                    width: mode.size.w,
                    height: mode.size.h,
                    refresh: mode.refresh,
                    reason,
                });
            }
        }

        if let Some(enabled) = state.enabled() {
            current.enabled = enabled;
        }
        if let Some(mode) = state.mode() {
            current.mode = Some(mode);
        }
        Ok(())
    }

    fn present(&mut self, buffer: &Buffer) -> Result<(), OutputError> {
        let mut state = self.state.borrow_mut();
        if !state.enabled {
            return Err(OutputError::Disabled {
                output: self.name.clone(),
            });
        }
        let expected = state.mode.map(|m| m.size).unwrap_or_default();
        if buffer.size() != expected {
            return Err(OutputError::Present {
                output: self.name.clone(),
                reason: format!(
                    "buffer is {}x{}, mode is {}x{}",
                    buffer.size().w,
                    buffer.size().h,
                    expected.w,
                    expected.h
                ),
            });
        }
        state.frames += 1;
        state.last_frame = Some(buffer.clone());
        Ok(())
    }
}

impl Drop for VirtualOutput {
    fn drop(&mut self) {
        debug!(output = %self.name, "virtual output released");
        self.state.borrow_mut().released = true;
    }
}

struct PluggedOutput {
    id: OutputId,
    name: String,
    state: Rc<RefCell<VirtualOutputState>>,
}

struct HeadlessInner {
    sink: EventSink,
    outputs: Vec<PluggedOutput>,
    next_index: u32,
}

impl HeadlessInner {
    fn live_outputs(&self) -> impl Iterator<Item = &PluggedOutput> {
        self.outputs.iter().filter(|o| !o.state.borrow().released)
    }
}

/// Control surface over a running headless backend.
#[derive(Clone)]
pub struct HeadlessHandle {
    inner: Rc<RefCell<HeadlessInner>>,
}

impl HeadlessHandle {
    /// Announce a new virtual output. Returns its id.
    pub fn plug(&self, config: VirtualOutputConfig) -> Result<OutputId, BackendError> {
        let mut inner = self.inner.borrow_mut();
        inner.next_index += 1;
        let name = format!("HEADLESS-{}", inner.next_index);
        let (device, state) = VirtualOutput::new(name.clone(), config);
        let id = device.id();

        inner.sink.emit(BackendEvent::NewOutput(NewOutput::new(Box::new(device))))?;
        info!(output = %name, %id, "virtual output plugged");
        inner.outputs.push(PluggedOutput { id, name, state });
        Ok(id)
    }

    /// Report the output as gone.
    pub fn unplug(&self, output: OutputId) -> Result<bool, BackendError> {
        let mut inner = self.inner.borrow_mut();
        let Some(idx) = inner.outputs.iter().position(|o| o.id == output) else {
            return Ok(false);
        };
        inner.sink.emit(BackendEvent::Destroy { output })?;
        let plugged = inner.outputs.remove(idx);
        info!(output = %plugged.name, "virtual output unplugged");
        Ok(true)
    }

    /// Ask the server to apply `state` to the output.
    pub fn request_state(&self, output: OutputId, state: OutputState) -> Result<(), BackendError> {
        self.inner
            .borrow()
            .sink
            .emit(BackendEvent::RequestState { output, state })
    }

    pub fn schedule_frame(&self, output: OutputId) -> Result<(), BackendError> {
        self.inner.borrow().sink.emit(BackendEvent::Frame { output })
    }

    /// Frames presented on the output so far.
    pub fn frames_presented(&self, output: OutputId) -> u64 {
        self.with_output(output, |s| s.frames).unwrap_or(0)
    }

    /// Copy of the last buffer presented on the output.
    pub fn last_frame(&self, output: OutputId) -> Option<Buffer> {
        self.with_output(output, |s| s.last_frame.clone()).flatten()
    }

    pub fn current_mode(&self, output: OutputId) -> Option<Mode> {
        self.with_output(output, |s| s.mode).flatten()
    }

    /// Ids of plugged outputs in plug order, released ones excluded.
    pub fn output_ids(&self) -> Vec<OutputId> {
        self.inner.borrow().live_outputs().map(|o| o.id).collect()
    }

    /// Number of virtual outputs whose device has not been dropped yet.
    pub fn live_output_count(&self) -> usize {
        self.inner.borrow().live_outputs().count()
    }

    fn with_output<T>(&self, output: OutputId, f: impl FnOnce(&VirtualOutputState) -> T) -> Option<T> {
        let inner = self.inner.borrow();
        let plugged = inner.outputs.iter().find(|o| o.id == output)?;
        let state = plugged.state.borrow();
        Some(f(&state))
    }
}

/// Headless backend.
pub struct HeadlessBackend {
    config: HeadlessConfig,
    loop_handle: LoopHandle<'static, ServerState>,
    handle: HeadlessHandle,
    frame_timer: Option<RegistrationToken>,
    started: bool,
}

impl HeadlessBackend {
    pub fn new(
        config: HeadlessConfig,
        loop_handle: LoopHandle<'static, ServerState>,
        sink: EventSink,
    ) -> Self {
        let handle = HeadlessHandle {
            inner: Rc::new(RefCell::new(HeadlessInner {
                sink,
                outputs: Vec::new(),
                next_index: 0,
            })),
        };
        Self {
            config,
            loop_handle,
            handle,
            frame_timer: None,
            started: false,
        }
    }

    pub fn handle(&self) -> HeadlessHandle {
        self.handle.clone()
    }

    fn start_frame_timer(&mut self, interval: Duration) -> Result<(), BackendError> {
        let handle = self.handle.clone();
        let token = self
            .loop_handle
            .insert_source(Timer::from_duration(interval), move |_, _, _| {
                let inner = handle.inner.borrow();
                for output in inner.live_outputs() {
                    if let Err(e) = inner.sink.emit(BackendEvent::Frame { output: output.id }) {
                        warn!(output = %output.name, "frame event not delivered: {}", e);
                    }
                }
                TimeoutAction::ToDuration(interval)
            })
            .map_err(|e| BackendError::EventSource(e.error.to_string()))?;
        self.frame_timer = Some(token);
        Ok(())
    }
}

impl Backend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn start(&mut self) -> Result<(), BackendError> {
        if self.started {
            return Err(BackendError::AlreadyStarted);
        }
        self.started = true;

        for _ in 0..self.config.output_count {
            self.handle.plug(self.config.output_config())?;
        }
        if let Some(interval) = self.config.frame_interval {
            self.start_frame_timer(interval)?;
        }
        info!(
            outputs = self.config.output_count,
            resolution = %format!("{}x{}", self.config.width, self.config.height),
            frame_interval = ?self.config.frame_interval,
            "headless backend started"
        );
        Ok(())
    }
}

impl Drop for HeadlessBackend {
    fn drop(&mut self) {
        if let Some(token) = self.frame_timer.take() {
            self.loop_handle.remove(token);
        }
    }
}

/// Headless backend plus software rendering and a wayland display.
pub struct HeadlessPlatform {
    config: HeadlessConfig,
    handle: RefCell<Option<HeadlessHandle>>,
}

impl HeadlessPlatform {
    pub fn new(config: HeadlessConfig) -> Self {
        Self {
            config,
            handle: RefCell::new(None),
        }
    }

    /// Handle of the backend created by this platform, once there is one.
    pub fn handle(&self) -> Option<HeadlessHandle> {
        self.handle.borrow().clone()
    }
}

impl Platform for HeadlessPlatform {
    fn create_display(
        &self,
        loop_handle: &LoopHandle<'static, ServerState>,
    ) -> Result<Box<dyn Display>, DisplayError> {
        Ok(Box::new(WaylandDisplay::new(loop_handle.clone())?))
    }

    fn create_backend(
        &self,
        loop_handle: &LoopHandle<'static, ServerState>,
        sink: EventSink,
    ) -> Option<Box<dyn Backend>> {
        let backend = HeadlessBackend::new(self.config.clone(), loop_handle.clone(), sink);
        *self.handle.borrow_mut() = Some(backend.handle());
        Some(Box::new(backend))
    }

    fn create_renderer(&self, _backend: &dyn Backend) -> Option<Box<dyn Renderer>> {
        Some(Box::new(SoftwareRenderer::new()))
    }

    fn create_allocator(
        &self,
        _backend: &dyn Backend,
        _renderer: &dyn Renderer,
    ) -> Option<Box<dyn Allocator>> {
        Some(Box::new(ShmAllocator::new()))
    }
}
