//! Error taxonomy for the compositor core.
//!
//! Three classes matter to callers:
//! - [`StartupError`]: a required capability is missing, the process must exit.
//! - [`OutputError`]: one output failed to attach or reconfigure, the rest of
//!   the server keeps running.
//! - [`DispatchError`]: a listener failed, the event loop stops and the server
//!   tears down.

use std::io;

use smithay::reexports::calloop;
use smithay::reexports::wayland_server::BindError;
use thiserror::Error;

/// A required capability could not be acquired during startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to create event loop: {0}")]
    EventLoop(#[from] calloop::Error),

    #[error("failed to create display: {0}")]
    Display(#[source] DisplayError),

    #[error("failed to create backend")]
    Backend,

    #[error("failed to create renderer")]
    Renderer,

    #[error("failed to initialize renderer display integration: {0}")]
    RendererDisplay(#[source] DisplayError),

    #[error("failed to create allocator")]
    Allocator,

    #[error("failed to register backend event source: {0}")]
    EventSource(String),

    #[error("failed to add unix socket to display: {0}")]
    Socket(#[source] DisplayError),

    #[error("failed to start backend: {0}")]
    BackendStart(#[source] BackendError),
}

/// Per-output failure. Never fatal to the server.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output {output} cannot bind renderer: {reason}")]
    InitRender { output: String, reason: String },

    #[error("output {output} has not been bound to a renderer")]
    NotRenderReady { output: String },

    #[error("output {output} rejected mode {width}x{height}@{refresh}mHz: {reason}")]
    InvalidMode {
        output: String,
        width: i32,
        height: i32,
        refresh: i32,
        reason: String,
    },

    #[error("output {output} does not fit in the layout: {source}")]
    Layout {
        output: String,
        #[source]
        source: LayoutError,
    },

    #[error("output {output} failed to commit state: {reason}")]
    Commit { output: String, reason: String },

    #[error("output {output} is disabled")]
    Disabled { output: String },

    #[error("output {output} failed to present buffer: {reason}")]
    Present { output: String, reason: String },
}

/// A listener callback failed; the current event loop pass is aborted.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("new output {output} was already claimed by another listener")]
    DeviceClaimed { output: String },

    #[error("render failure: {0}")]
    Render(#[from] RenderError),

    #[error("listener failed: {0}")]
    Listener(String),
}

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("failed to create wayland display: {0}")]
    Init(String),

    #[error("failed to bind wayland socket: {0}")]
    Bind(#[from] BindError),

    #[error("display i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("display already listens on {0}")]
    AlreadyListening(String),

    #[error("failed to register socket source: {0}")]
    EventSource(String),

    #[error("display has been destroyed")]
    Destroyed,

    #[error("global {0} is not supported by this display")]
    UnsupportedGlobal(String),
}

/// An output cannot be placed without leaving the i32 coordinate space.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("no room for a {width} px wide output at x = {x}")]
    NoRoom { x: i32, width: i32 },

    #[error("output size {width}x{height} is negative")]
    NegativeSize { width: i32, height: i32 },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend already started")]
    AlreadyStarted,

    #[error("backend event sink disconnected")]
    Disconnected,

    #[error("failed to register backend source: {0}")]
    EventSource(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer or allocator already destroyed")]
    Destroyed,

    #[error("cannot allocate {width}x{height} buffer: {reason}")]
    Allocation {
        width: i32,
        height: i32,
        reason: String,
    },

    #[error("render target is {got:?}, expected {expected:?}")]
    TargetMismatch {
        got: (i32, i32),
        expected: (i32, i32),
    },
}

/// Everything `Compositor::run` can end with.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error("event loop stopped by listener failure: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("event loop failure: {0}")]
    EventLoop(#[from] calloop::Error),
}
