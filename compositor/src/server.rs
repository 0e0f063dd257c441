//! Server lifecycle: ordered startup, the event loop, and teardown.
//!
//! [`Compositor::new`] walks the startup phases in order and aborts on the
//! first missing capability; whatever was already acquired is dropped in
//! reverse order on the way out. [`Compositor::run`] blocks in the event loop
//! until a signal, [`Compositor::stop`], the exit timer or a listener failure
//! ends it, then tears the server down.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use smithay::reexports::calloop::channel::{self, Event as ChannelEvent};
use smithay::reexports::calloop::timer::{TimeoutAction, Timer};
use smithay::reexports::calloop::{EventLoop, RegistrationToken};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{BackendEvent, EventSink, Platform},
    display::Display,
    error::{DisplayError, ServerError, StartupError},
    state::{ServerPhase, ServerState},
};

/// Global flag set by SIGTERM/SIGINT handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Runtime options of the server itself.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Fixed socket name; auto-assigned `wayland-N` when unset.
    pub socket_name: Option<String>,
    /// Shell command spawned once the socket is up, with `WAYLAND_DISPLAY`
    /// set to the socket.
    pub startup_command: Option<String>,
    /// Longest time one loop iteration blocks waiting for events.
    pub poll_interval: Duration,
    /// Stop the loop after this long.
    pub exit_after: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_name: None,
            startup_command: None,
            poll_interval: Duration::from_millis(100),
            exit_after: None,
        }
    }
}

/// Install signal handlers for graceful shutdown (SIGTERM, SIGINT).
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// A constructed, running compositor.
pub struct Compositor {
    // Declared before the loop so the state tears down while the loop and
    // its sources are still alive.
    state: ServerState,
    event_loop: EventLoop<'static, ServerState>,
    config: ServerConfig,
    backend_events: Option<RegistrationToken>,
}

impl Compositor {
    /// Acquire every capability from `platform` and bring the server up to
    /// [`ServerPhase::Running`].
    ///
    /// The process environment is left alone; callers that want
    /// `WAYLAND_DISPLAY` exported read [`Compositor::socket_name`].
    pub fn new(platform: &dyn Platform, config: ServerConfig) -> Result<Self, StartupError> {
        let event_loop = EventLoop::<ServerState>::try_new()?;
        let loop_handle = event_loop.handle();
        let (sender, receiver) = channel::channel::<BackendEvent>();

        let display = platform.create_display(&loop_handle).map_err(|e| {
            error!("failed to create display: {}", e);
            StartupError::Display(e)
        })?;

        // From here on the state owns whatever has been acquired; its drop
        // tears down in order.
        let mut state = ServerState::new(loop_handle.clone(), display);

        let Some(backend) = platform.create_backend(&loop_handle, EventSink::new(sender)) else {
            error!("failed to create backend");
            return Err(StartupError::Backend);
        };
        info!(backend = backend.name(), "backend ready");
        state.backend = Some(backend);
        state.set_phase(ServerPhase::BackendReady);

        let Some(mut renderer) = state.backend.as_deref().and_then(|b| platform.create_renderer(b))
        else {
            error!("failed to create renderer");
            return Err(StartupError::Renderer);
        };
        renderer.init_display(&mut state.shm_state).map_err(|e| {
            error!(renderer = renderer.name(), "renderer display integration failed: {}", e);
            StartupError::RendererDisplay(e)
        })?;

        let Some(allocator) = state
            .backend
            .as_deref()
            .and_then(|b| platform.create_allocator(b, renderer.as_ref()))
        else {
            error!("failed to create allocator");
            return Err(StartupError::Allocator);
        };
        info!(
            renderer = renderer.name(),
            allocator = allocator.name(),
            "rendering ready"
        );
        state.renderer = Some(renderer);
        state.allocator = Some(allocator);
        state.set_phase(ServerPhase::RenderingReady);

        state.listen_for_outputs();
        state.set_phase(ServerPhase::ProtocolsReady);

        let backend_events = loop_handle
            .insert_source(receiver, |event, _, state: &mut ServerState| match event {
                ChannelEvent::Msg(event) => state.handle_backend_event(event),
                ChannelEvent::Closed => debug!("backend event channel closed"),
            })
            .map_err(|e| StartupError::EventSource(e.error.to_string()))?;

        let socket = match state.display.as_deref_mut() {
            Some(display) => open_socket(display, config.socket_name.as_deref()),
            None => Err(DisplayError::Destroyed),
        };
        let socket = match socket {
            Ok(name) => name,
            Err(e) => {
                error!("unable to open wayland socket: {}", e);
                loop_handle.remove(backend_events);
                return Err(StartupError::Socket(e));
            }
        };
        state.socket_name = Some(socket.clone());
        state.set_phase(ServerPhase::ListeningReady);

        if let Some(backend) = state.backend.as_deref_mut() {
            if let Err(e) = backend.start() {
                error!(backend = backend.name(), "failed to start backend: {}", e);
                state.teardown();
                loop_handle.remove(backend_events);
                return Err(StartupError::BackendStart(e));
            }
        }

        if let Some(cmd) = &config.startup_command {
            spawn_startup_command(cmd, &socket);
        }

        state.set_phase(ServerPhase::Running);
        info!("Running Wayland compositor on WAYLAND_DISPLAY={}", socket);

        Ok(Self {
            state,
            event_loop,
            config,
            backend_events: Some(backend_events),
        })
    }

    /// Run one event loop iteration, waiting at most `timeout`.
    ///
    /// A listener failure during the iteration stops the server and is
    /// returned; the caller decides when to tear down.
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<(), ServerError> {
        self.event_loop.dispatch(timeout, &mut self.state)?;
        if let Some(display) = self.state.display.as_deref_mut() {
            if let Err(e) = display.flush_clients() {
                warn!("failed to flush clients: {}", e);
            }
        }
        match self.state.take_dispatch_error() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Block in the event loop until stopped, then tear down.
    ///
    /// Returns the listener or loop failure that ended the run, if any.
    pub fn run(&mut self) -> Result<(), ServerError> {
        install_signal_handlers();

        if let Some(after) = self.config.exit_after {
            let timer = Timer::from_duration(after);
            let inserted = self.event_loop.handle().insert_source(timer, move |_, _, state| {
                info!("exit timer fired after {}s", after.as_secs_f64());
                state.running = false;
                TimeoutAction::Drop
            });
            if let Err(e) = inserted {
                warn!("exit timer unavailable: {}", e.error);
            }
        }

        let poll_interval = self.config.poll_interval;
        let mut last_status_log = Instant::now();
        info!(
            "entering event loop (poll interval: {}ms)",
            poll_interval.as_millis()
        );

        let result = loop {
            if !self.state.running {
                break Ok(());
            }
            if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
                info!("Shutdown signal received, exiting");
                self.state.running = false;
                break Ok(());
            }

            if last_status_log.elapsed() >= STATUS_INTERVAL {
                info!(
                    outputs = self.state.outputs().len(),
                    clients = self.state.display().map(|d| d.client_count()).unwrap_or(0),
                    phase = ?self.state.phase,
                    "status"
                );
                last_status_log = Instant::now();
            }

            if let Err(e) = self.dispatch(Some(poll_interval)) {
                error!("event loop stopped: {}", e);
                break Err(e);
            }
        };

        self.shutdown();
        result
    }

    /// Ask the loop to stop after the current iteration.
    pub fn stop(&mut self) {
        self.state.running = false;
    }

    /// Tear the server down now. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.state.teardown();
        if let Some(token) = self.backend_events.take() {
            self.event_loop.handle().remove(token);
        }
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ServerState {
        &mut self.state
    }

    pub fn socket_name(&self) -> Option<&str> {
        self.state.socket_name.as_deref()
    }

    pub fn phase(&self) -> ServerPhase {
        self.state.phase
    }
}

fn open_socket(display: &mut dyn Display, name: Option<&str>) -> Result<String, DisplayError> {
    match name {
        Some(name) => display.add_socket(name).map(|_| name.to_string()),
        None => display.add_socket_auto(),
    }
}

fn spawn_startup_command(cmd: &str, socket: &str) {
    match Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .env("WAYLAND_DISPLAY", socket)
        .spawn()
    {
        Ok(child) => info!(pid = child.id(), command = %cmd, "startup command spawned"),
        Err(e) => warn!(command = %cmd, "failed to spawn startup command: {}", e),
    }
}
