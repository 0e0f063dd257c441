//! Strata compositor core.
//!
//! Discovers outputs through a backend, negotiates their modes, lines them
//! up in one shared layout with a scene output each, advertises them on a
//! smithay wayland display, and drives a single calloop event loop from
//! startup to ordered teardown.

pub mod backend;
pub mod display;
pub mod error;
mod handlers;
pub mod layout;
pub mod output;
pub mod render;
pub mod scene;
pub mod server;
pub mod signal;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::headless::{HeadlessConfig, HeadlessHandle, HeadlessPlatform};
pub use backend::{Backend, BackendEvent, Platform, SignalSource};
pub use error::{DispatchError, OutputError, ServerError, StartupError};
pub use display::{Display, WaylandDisplay};
pub use output::{describe_mode, new_mode, Mode, OutputDevice, OutputId, OutputState};
pub use server::{Compositor, ServerConfig};
pub use state::{ClientState, ServerPhase, ServerState};
