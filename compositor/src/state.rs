//! Server state: the single context object every listener receives.
//!
//! `ServerState` owns every capability the core depends on. Listeners get it
//! as `&mut ServerState` on each dispatch; nothing stores a reference back
//! into it. Capabilities sit in separate slots so teardown can release them
//! in a fixed order: scene and outputs first, then allocator, renderer,
//! backend, and the display last.

use std::sync::atomic::{AtomicBool, Ordering};

use smithay::input::SeatState;
use smithay::reexports::calloop::LoopHandle;
use smithay::reexports::wayland_server::backend::{ClientData, ClientId, DisconnectReason};
use smithay::reexports::wayland_server::DisplayHandle;
use smithay::wayland::compositor::{CompositorClientState, CompositorState};
use smithay::wayland::selection::data_device::DataDeviceState;
use smithay::wayland::shm::ShmState;
use tracing::{debug, error, info, trace, warn};

use crate::{
    backend::{Backend, BackendEvent, SignalSource},
    display::Display,
    error::DispatchError,
    layout::OutputLayout,
    output::{OutputId, OutputRecord},
    render::{Allocator, Renderer},
    scene::{Scene, SceneLayout},
    signal::{ListenerId, ListenerRegistry},
};

/// Per-client data attached on accept.
#[derive(Default)]
pub struct ClientState {
    pub compositor_state: CompositorClientState,
    disconnected: AtomicBool,
}

impl ClientState {
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientState")
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}

impl ClientData for ClientState {
    fn initialized(&self, client_id: ClientId) {
        trace!(?client_id, "client connected");
    }

    fn disconnected(&self, client_id: ClientId, reason: DisconnectReason) {
        self.disconnected.store(true, Ordering::Relaxed);
        debug!(?client_id, ?reason, "client disconnected");
    }
}

pub type Listeners = ListenerRegistry<SignalSource, ServerState, BackendEvent, DispatchError>;

/// Lifecycle phase of the server, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerPhase {
    Uninitialized,
    BackendReady,
    RenderingReady,
    ProtocolsReady,
    ListeningReady,
    Running,
    ShuttingDown,
    Terminated,
}

/// Central compositor state.
pub struct ServerState {
    pub loop_handle: LoopHandle<'static, ServerState>,
    pub display_handle: DisplayHandle,
    pub phase: ServerPhase,
    phase_history: Vec<ServerPhase>,
    pub running: bool,

    // Protocol globals every client sees.
    pub compositor_state: CompositorState,
    pub shm_state: ShmState,
    pub data_device_state: DataDeviceState,
    pub seat_state: SeatState<Self>,

    /// Attached outputs, in discovery order.
    pub(crate) outputs: Vec<OutputRecord>,
    pub(crate) scene: Scene,
    pub(crate) scene_layout: SceneLayout,
    pub(crate) layout: OutputLayout,
    pub(crate) listeners: Listeners,
    new_output_listener: Option<ListenerId>,

    // Capabilities, in teardown order.
    pub(crate) allocator: Option<Box<dyn Allocator>>,
    pub(crate) renderer: Option<Box<dyn Renderer>>,
    pub(crate) backend: Option<Box<dyn Backend>>,
    pub(crate) display: Option<Box<dyn Display>>,

    pub socket_name: Option<String>,
    dispatch_error: Option<DispatchError>,
}

impl ServerState {
    /// State around a fresh display. The compositor, subcompositor,
    /// data-device and shm globals are created here; the remaining
    /// capabilities are filled in by startup.
    pub fn new(loop_handle: LoopHandle<'static, ServerState>, display: Box<dyn Display>) -> Self {
        let display_handle = display.handle();
        let compositor_state = CompositorState::new::<Self>(&display_handle);
        let shm_state = ShmState::new::<Self>(&display_handle, vec![]);
        let data_device_state = DataDeviceState::new::<Self>(&display_handle);
        let seat_state = SeatState::new();

        let scene = Scene::new();
        let scene_layout = scene.attach_output_layout();

        Self {
            loop_handle,
            display_handle,
            phase: ServerPhase::Uninitialized,
            phase_history: vec![ServerPhase::Uninitialized],
            running: true,
            compositor_state,
            shm_state,
            data_device_state,
            seat_state,
            outputs: Vec::new(),
            scene,
            scene_layout,
            layout: OutputLayout::new(),
            listeners: Listeners::new(),
            new_output_listener: None,
            allocator: None,
            renderer: None,
            backend: None,
            display: Some(display),
            socket_name: None,
            dispatch_error: None,
        }
    }

    pub(crate) fn set_phase(&mut self, phase: ServerPhase) {
        debug_assert!(phase >= self.phase, "lifecycle went backwards: {:?} -> {:?}", self.phase, phase);
        info!(from = ?self.phase, to = ?phase, "server phase");
        self.phase = phase;
        self.phase_history.push(phase);
    }

    /// Every phase entered so far, starting with `Uninitialized`.
    pub fn phases(&self) -> &[ServerPhase] {
        &self.phase_history
    }

    /// Register the listener that runs the attach protocol for every newly
    /// discovered output.
    pub(crate) fn listen_for_outputs(&mut self) {
        if self.new_output_listener.is_some() {
            return;
        }
        let id = self
            .listeners
            .register(SignalSource::NewOutput, crate::output::handle_new_output);
        debug!(listener = %id, "listening for new outputs");
        self.new_output_listener = Some(id);
    }

    /// Route one backend event to the listeners bound to its source.
    pub(crate) fn handle_backend_event(&mut self, event: BackendEvent) {
        if self.dispatch_error.is_some() || !self.running {
            trace!(source = ?event.source(), "dropping event, loop is stopping");
            return;
        }
        let source = event.source();
        match Listeners::dispatch(self, |s| &mut s.listeners, &source, &event) {
            Ok(0) => trace!(?source, "event had no listeners"),
            Ok(count) => trace!(?source, count, "event dispatched"),
            Err(err) => {
                error!(?source, "listener failed: {}", err);
                self.dispatch_error = Some(err);
                self.running = false;
            }
        }
    }

    pub(crate) fn take_dispatch_error(&mut self) -> Option<DispatchError> {
        self.dispatch_error.take()
    }

    pub fn outputs(&self) -> &[OutputRecord] {
        &self.outputs
    }

    pub fn output(&self, id: OutputId) -> Option<&OutputRecord> {
        self.outputs.iter().find(|o| o.id() == id)
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn scene_layout(&self) -> &SceneLayout {
        &self.scene_layout
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    pub fn display(&self) -> Option<&dyn Display> {
        self.display.as_deref()
    }

    /// Every attached output has exactly one layout entry and exactly one
    /// scene output bound to it.
    pub fn is_consistent(&self) -> bool {
        let records = self.outputs.len();
        if self.layout.len() != records
            || self.scene.output_count() != records
            || self.scene_layout.len() != records
        {
            return false;
        }
        self.outputs.iter().all(|o| {
            self.layout.get(o.id()).is_some()
                && self.scene.scene_output(o.id()).is_some()
                && self.scene_layout.is_bound(o.id())
        })
    }

    /// Release everything in dependency order. Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.phase == ServerPhase::Terminated {
            return;
        }
        self.set_phase(ServerPhase::ShuttingDown);
        self.running = false;

        if let Some(display) = self.display.as_deref_mut() {
            let clients = display.destroy_clients();
            debug!(clients, "disconnected clients");
        }

        if let Some(id) = self.new_output_listener.take() {
            self.listeners.unregister(id);
        }

        // Scene first: it drops every scene output and layout binding.
        self.scene.destroy();
        self.scene_layout.clear();
        self.layout.clear();

        for record in self.outputs.drain(..) {
            record.release(&mut self.listeners);
        }
        if !self.listeners.is_empty() {
            warn!(remaining = self.listeners.len(), "listeners left at shutdown, dropping");
            self.listeners.clear();
        }

        if let Some(allocator) = self.allocator.take() {
            debug!(allocator = allocator.name(), "destroying allocator");
            drop(allocator);
        }
        if let Some(renderer) = self.renderer.take() {
            debug!(renderer = renderer.name(), "destroying renderer");
            drop(renderer);
        }
        if let Some(backend) = self.backend.take() {
            debug!(backend = backend.name(), "destroying backend");
            drop(backend);
        }
        if let Some(display) = self.display.take() {
            debug!("destroying display");
            drop(display);
        }

        self.set_phase(ServerPhase::Terminated);
    }
}

impl Drop for ServerState {
    fn drop(&mut self) {
        self.teardown();
    }
}
