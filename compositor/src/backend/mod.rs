//! Backend abstraction: device discovery and the events it feeds into the
//! server.
//!
//! A backend never calls into the server directly. It pushes
//! [`BackendEvent`]s through an [`EventSink`], a calloop channel whose
//! receiving end the server drains on its event loop and routes through the
//! listener registry by [`SignalSource`].

pub mod headless;

use std::cell::RefCell;
use std::fmt;

use smithay::reexports::calloop::channel::Sender;
use smithay::reexports::calloop::LoopHandle;

use crate::{
    display::Display,
    error::{BackendError, DisplayError},
    output::{OutputDevice, OutputId, OutputState},
    render::{Allocator, Renderer},
    state::ServerState,
};

/// Event source identity listeners are registered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalSource {
    NewOutput,
    Frame(OutputId),
    RequestState(OutputId),
    Destroy(OutputId),
}

/// Payload of a new-output event. The first listener to claim the device
/// owns it; later listeners see an empty slot.
pub struct NewOutput {
    id: OutputId,
    name: String,
    device: RefCell<Option<Box<dyn OutputDevice>>>,
}

impl NewOutput {
    pub fn new(device: Box<dyn OutputDevice>) -> Self {
        Self {
            id: device.id(),
            name: device.name().to_string(),
            device: RefCell::new(Some(device)),
        }
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn take_device(&self) -> Option<Box<dyn OutputDevice>> {
        self.device.borrow_mut().take()
    }
}

impl fmt::Debug for NewOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewOutput")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("claimed", &self.device.borrow().is_none())
            .finish()
    }
}

#[derive(Debug)]
pub enum BackendEvent {
    /// A device was discovered and is waiting to be attached.
    NewOutput(NewOutput),
    /// The output can take a new frame.
    Frame { output: OutputId },
    /// The backend asks for the output's state to change.
    RequestState { output: OutputId, state: OutputState },
    /// The device went away.
    Destroy { output: OutputId },
}

impl BackendEvent {
    pub fn source(&self) -> SignalSource {
        match self {
            BackendEvent::NewOutput(_) => SignalSource::NewOutput,
            BackendEvent::Frame { output } => SignalSource::Frame(*output),
            BackendEvent::RequestState { output, .. } => SignalSource::RequestState(*output),
            BackendEvent::Destroy { output } => SignalSource::Destroy(*output),
        }
    }
}

/// Sending half of the backend event channel.
#[derive(Clone)]
pub struct EventSink {
    sender: Sender<BackendEvent>,
}

impl EventSink {
    pub fn new(sender: Sender<BackendEvent>) -> Self {
        Self { sender }
    }

    /// Queue `event` for the next loop dispatch.
    pub fn emit(&self, event: BackendEvent) -> Result<(), BackendError> {
        self.sender.send(event).map_err(|_| BackendError::Disconnected)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSink")
    }
}

/// Device discovery capability. Dropping the backend destroys it.
pub trait Backend {
    fn name(&self) -> &str;

    /// Begin producing events. Devices present at start are reported as
    /// new-output events.
    fn start(&mut self) -> Result<(), BackendError>;
}

/// Factory for the capabilities the server is built from.
///
/// Each constructor mirrors one startup step; an error or `None` makes that
/// step fatal.
pub trait Platform {
    fn create_display(
        &self,
        loop_handle: &LoopHandle<'static, ServerState>,
    ) -> Result<Box<dyn Display>, DisplayError>;

    fn create_backend(
        &self,
        loop_handle: &LoopHandle<'static, ServerState>,
        sink: EventSink,
    ) -> Option<Box<dyn Backend>>;

    fn create_renderer(&self, backend: &dyn Backend) -> Option<Box<dyn Renderer>>;

    fn create_allocator(
        &self,
        backend: &dyn Backend,
        renderer: &dyn Renderer,
    ) -> Option<Box<dyn Allocator>>;
}
