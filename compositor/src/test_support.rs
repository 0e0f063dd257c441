//! Recording platform for lifecycle tests.
//!
//! Wraps the headless backend, the wayland display and the software render
//! capabilities so every create, drop and display call lands in a shared
//! log, and lets a test make any startup step fail.

use std::cell::{Cell, RefCell};
use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::OnceLock;
use std::time::Duration;

use smithay::backend::renderer::Color32F;
use smithay::output::Output;
use smithay::reexports::calloop::LoopHandle;
use smithay::reexports::wayland_server::backend::GlobalId;
use smithay::reexports::wayland_server::DisplayHandle;
use smithay::utils::{Physical, Rectangle, Size};
use smithay::wayland::shm::ShmState;

use crate::{
    backend::headless::{HeadlessBackend, HeadlessConfig, HeadlessHandle, VirtualOutputConfig},
    backend::{Backend, EventSink, Platform},
    display::{Display, WaylandDisplay},
    error::{BackendError, DisplayError, RenderError, ServerError},
    output::{create_output, new_mode},
    render::{Allocator, Buffer, RenderElement, Renderer, ShmAllocator, SoftwareRenderer},
    server::Compositor,
    state::ServerState,
};

type Log = Rc<RefCell<Vec<String>>>;

/// Private `XDG_RUNTIME_DIR` shared by every test in this process.
pub(crate) fn runtime_dir() -> PathBuf {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| {
        let dir = std::env::temp_dir().join(format!("strata-test-runtime-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create test runtime dir");
        std::env::set_var("XDG_RUNTIME_DIR", &dir);
        dir
    })
    .clone()
}

/// Output whose current mode is `width`x`height`, or no mode at all when
/// either is zero.
pub(crate) fn output_with_mode(name: &str, width: i32, height: i32) -> Output {
    let output = create_output(name, "Test");
    if width > 0 && height > 0 {
        output.change_current_state(Some(new_mode(width, height, 60_000)), None, None, None);
    }
    output
}

/// Dispatch until queued backend events have been handled.
pub(crate) fn pump(compositor: &mut Compositor) -> Result<(), ServerError> {
    for _ in 0..3 {
        compositor.dispatch(Some(Duration::ZERO))?;
    }
    Ok(())
}

pub(crate) struct RecordingPlatform {
    log: Log,
    outputs: Vec<VirtualOutputConfig>,
    fail_backend: bool,
    fail_start: bool,
    fail_renderer: bool,
    fail_allocator: bool,
    fail_socket: bool,
    fail_output_global: bool,
    allocation_limit: Option<i32>,
    unbounded_allocator: bool,
    handle: Rc<RefCell<Option<HeadlessHandle>>>,
    live_at_allocator_drop: Rc<Cell<Option<usize>>>,
}

impl RecordingPlatform {
    /// Platform whose backend announces `outputs` on start.
    pub(crate) fn new(outputs: Vec<VirtualOutputConfig>) -> Self {
        Self {
            log: Rc::default(),
            outputs,
            fail_backend: false,
            fail_start: false,
            fail_renderer: false,
            fail_allocator: false,
            fail_socket: false,
            fail_output_global: false,
            allocation_limit: None,
            unbounded_allocator: false,
            handle: Rc::default(),
            live_at_allocator_drop: Rc::default(),
        }
    }

    pub(crate) fn fail_backend(mut self) -> Self {
        self.fail_backend = true;
        self
    }

    pub(crate) fn fail_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub(crate) fn fail_renderer(mut self) -> Self {
        self.fail_renderer = true;
        self
    }

    pub(crate) fn fail_allocator(mut self) -> Self {
        self.fail_allocator = true;
        self
    }

    /// The display refuses to listen, as if the socket name were taken.
    pub(crate) fn fail_socket(mut self) -> Self {
        self.fail_socket = true;
        self
    }

    /// The display cannot advertise outputs.
    pub(crate) fn fail_output_global(mut self) -> Self {
        self.fail_output_global = true;
        self
    }

    /// Allocation fails for buffers wider than `width`, while the
    /// advertised maximum stays at the shm limit.
    pub(crate) fn allocation_limit(mut self, width: i32) -> Self {
        self.allocation_limit = Some(width);
        self
    }

    /// The allocator advertises no size limit, so every positive mode
    /// commits.
    pub(crate) fn unbounded_allocator(mut self) -> Self {
        self.unbounded_allocator = true;
        self
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    /// Handle of the backend. Panics if no backend was created.
    pub(crate) fn handle(&self) -> HeadlessHandle {
        self.handle.borrow().clone().expect("backend not created")
    }

    /// Output devices still alive when the allocator was dropped.
    pub(crate) fn live_outputs_at_allocator_drop(&self) -> Option<usize> {
        self.live_at_allocator_drop.get()
    }
}

impl Platform for RecordingPlatform {
    fn create_display(
        &self,
        loop_handle: &LoopHandle<'static, ServerState>,
    ) -> Result<Box<dyn Display>, DisplayError> {
        self.log.borrow_mut().push("display:create".into());
        Ok(Box::new(RecordingDisplay {
            log: self.log.clone(),
            inner: WaylandDisplay::new(loop_handle.clone())?,
            socket: None,
            fail_socket: self.fail_socket,
            fail_output_global: self.fail_output_global,
        }))
    }

    fn create_backend(
        &self,
        loop_handle: &LoopHandle<'static, ServerState>,
        sink: EventSink,
    ) -> Option<Box<dyn Backend>> {
        if self.fail_backend {
            return None;
        }
        self.log.borrow_mut().push("backend:create".into());
        let config = HeadlessConfig {
            output_count: 0,
            frame_interval: None,
            ..HeadlessConfig::default()
        };
        let inner = HeadlessBackend::new(config, loop_handle.clone(), sink);
        *self.handle.borrow_mut() = Some(inner.handle());
        Some(Box::new(RecordingBackend {
            log: self.log.clone(),
            inner,
            outputs: self.outputs.clone(),
            fail_start: self.fail_start,
        }))
    }

    fn create_renderer(&self, _backend: &dyn Backend) -> Option<Box<dyn Renderer>> {
        if self.fail_renderer {
            return None;
        }
        self.log.borrow_mut().push("renderer:create".into());
        Some(Box::new(RecordingRenderer {
            log: self.log.clone(),
            inner: SoftwareRenderer::new(),
        }))
    }

    fn create_allocator(
        &self,
        _backend: &dyn Backend,
        _renderer: &dyn Renderer,
    ) -> Option<Box<dyn Allocator>> {
        if self.fail_allocator {
            return None;
        }
        self.log.borrow_mut().push("allocator:create".into());
        Some(Box::new(RecordingAllocator {
            log: self.log.clone(),
            inner: ShmAllocator::new(),
            allocation_limit: self.allocation_limit,
            unbounded: self.unbounded_allocator,
            handle: self.handle.clone(),
            live_at_drop: self.live_at_allocator_drop.clone(),
        }))
    }
}

struct RecordingBackend {
    log: Log,
    inner: HeadlessBackend,
    outputs: Vec<VirtualOutputConfig>,
    fail_start: bool,
}

impl Backend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    fn start(&mut self) -> Result<(), BackendError> {
        if self.fail_start {
            return Err(BackendError::Other("no devices".into()));
        }
        self.log.borrow_mut().push("backend:start".into());
        self.inner.start()?;
        let handle = self.inner.handle();
        for config in &self.outputs {
            handle.plug(config.clone())?;
        }
        Ok(())
    }
}

impl Drop for RecordingBackend {
    fn drop(&mut self) {
        self.log.borrow_mut().push("backend:drop".into());
    }
}

struct RecordingRenderer {
    log: Log,
    inner: SoftwareRenderer,
}

impl Renderer for RecordingRenderer {
    fn name(&self) -> &str {
        "recording"
    }

    fn init_display(&mut self, shm: &mut ShmState) -> Result<(), DisplayError> {
        self.log.borrow_mut().push("renderer:init_display".into());
        self.inner.init_display(shm)
    }

    fn render(
        &self,
        target: &mut Buffer,
        damage: &[Rectangle<i32, Physical>],
        elements: &[RenderElement],
        clear: Color32F,
    ) -> Result<(), RenderError> {
        self.inner.render(target, damage, elements, clear)
    }
}

impl Drop for RecordingRenderer {
    fn drop(&mut self) {
        self.log.borrow_mut().push("renderer:drop".into());
    }
}

struct RecordingAllocator {
    log: Log,
    inner: ShmAllocator,
    allocation_limit: Option<i32>,
    unbounded: bool,
    handle: Rc<RefCell<Option<HeadlessHandle>>>,
    live_at_drop: Rc<Cell<Option<usize>>>,
}

impl Allocator for RecordingAllocator {
    fn name(&self) -> &str {
        "recording"
    }

    fn max_size(&self) -> Size<i32, Physical> {
        if self.unbounded {
            Size::from((i32::MAX, i32::MAX))
        } else {
            self.inner.max_size()
        }
    }

    fn allocate(&self, size: Size<i32, Physical>) -> Result<Buffer, RenderError> {
        if let Some(limit) = self.allocation_limit.filter(|limit| size.w > *limit) {
            return Err(RenderError::Allocation {
                width: size.w,
                height: size.h,
                reason: format!("wider than {limit}"),
            });
        }
        self.inner.allocate(size)
    }
}

impl Drop for RecordingAllocator {
    fn drop(&mut self) {
        self.log.borrow_mut().push("allocator:drop".into());
        let live = self.handle.borrow().as_ref().map(|h| h.live_output_count());
        self.live_at_drop.set(live);
    }
}

/// Real wayland display that records calls and fakes the socket, so tests
/// never bind in the runtime dir.
struct RecordingDisplay {
    log: Log,
    inner: WaylandDisplay<ServerState>,
    socket: Option<String>,
    fail_socket: bool,
    fail_output_global: bool,
}

impl Display for RecordingDisplay {
    fn handle(&self) -> DisplayHandle {
        self.inner.handle()
    }

    fn add_socket_auto(&mut self) -> Result<String, DisplayError> {
        let name = "wayland-1".to_string();
        self.add_socket(&name)?;
        Ok(name)
    }

    fn add_socket(&mut self, name: &str) -> Result<(), DisplayError> {
        if let Some(current) = &self.socket {
            return Err(DisplayError::AlreadyListening(current.clone()));
        }
        if self.fail_socket {
            return Err(DisplayError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{name} is taken"),
            )));
        }
        self.log.borrow_mut().push(format!("display:socket {name}"));
        self.socket = Some(name.to_string());
        Ok(())
    }

    fn socket_name(&self) -> Option<&str> {
        self.socket.as_deref()
    }

    fn create_output_global(&mut self, output: &Output) -> Result<GlobalId, DisplayError> {
        if self.fail_output_global {
            return Err(DisplayError::UnsupportedGlobal("wl_output".into()));
        }
        Display::create_output_global(&mut self.inner, output)
    }

    fn remove_global(&mut self, id: GlobalId) {
        Display::remove_global(&mut self.inner, id);
    }

    fn client_count(&self) -> usize {
        self.inner.client_count()
    }

    fn flush_clients(&mut self) -> Result<(), DisplayError> {
        self.inner.flush_clients()
    }

    fn destroy_clients(&mut self) -> usize {
        self.log.borrow_mut().push("display:destroy_clients".into());
        self.inner.destroy_clients()
    }
}

impl Drop for RecordingDisplay {
    fn drop(&mut self) {
        self.log.borrow_mut().push("display:drop".into());
    }
}
