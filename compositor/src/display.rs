//! Client-facing display: the wayland display, the listening socket clients
//! connect to and the output globals advertised on it.
//!
//! [`WaylandDisplay`] puts the wayland display and its socket on the event
//! loop. Connections accepted on the socket are inserted into the display
//! and remembered so shutdown can disconnect every client before the
//! display itself goes away.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use smithay::output::Output;
use smithay::reexports::calloop::generic::Generic;
use smithay::reexports::calloop::{Interest, LoopHandle, Mode, PostAction, RegistrationToken};
use smithay::reexports::wayland_server::backend::{DisconnectReason, GlobalId};
use smithay::reexports::wayland_server::{Client, Display as WlDisplay, DisplayHandle};
use smithay::wayland::socket::ListeningSocketSource;
use tracing::{debug, info, warn};

use crate::error::DisplayError;
use crate::state::{ClientState, ServerState};

/// Display/socket capability. Dropping it disconnects every client and
/// closes the socket.
pub trait Display {
    fn handle(&self) -> DisplayHandle;

    /// Listen on the first free `wayland-N` socket, returning its name.
    fn add_socket_auto(&mut self) -> Result<String, DisplayError>;

    /// Listen on a socket with a fixed name.
    fn add_socket(&mut self, name: &str) -> Result<(), DisplayError>;

    fn socket_name(&self) -> Option<&str>;

    /// Advertise `output` to clients as a `wl_output` global.
    fn create_output_global(&mut self, output: &Output) -> Result<GlobalId, DisplayError>;

    fn remove_global(&mut self, id: GlobalId);

    fn client_count(&self) -> usize;

    /// Push pending events out to every client.
    fn flush_clients(&mut self) -> Result<(), DisplayError>;

    /// Disconnect every client, returning how many were connected.
    fn destroy_clients(&mut self) -> usize;
}

struct BoundSocket {
    name: String,
    token: RegistrationToken,
}

/// Wayland display driven by a calloop event loop with data `D`.
pub struct WaylandDisplay<D: 'static> {
    loop_handle: LoopHandle<'static, D>,
    handle: DisplayHandle,
    display_source: Option<RegistrationToken>,
    socket: Option<BoundSocket>,
    clients: Rc<RefCell<Vec<Client>>>,
}

impl<D: 'static> WaylandDisplay<D> {
    pub fn new(loop_handle: LoopHandle<'static, D>) -> Result<Self, DisplayError> {
        let display = WlDisplay::<D>::new().map_err(|e| DisplayError::Init(e.to_string()))?;
        let handle = display.handle();

        let source = Generic::new(display, Interest::READ, Mode::Level);
        let token = loop_handle
            .insert_source(source, |_, display, state| {
                // SAFETY: the display is only dropped by removing this source.
                let display = unsafe { display.get_mut() };
                if let Err(err) = display.dispatch_clients(state) {
                    warn!("failed to dispatch clients: {}", err);
                }
                Ok(PostAction::Continue)
            })
            .map_err(|e| DisplayError::EventSource(e.error.to_string()))?;

        Ok(Self {
            loop_handle,
            handle,
            display_source: Some(token),
            socket: None,
            clients: Rc::new(RefCell::new(Vec::new())),
        })
    }

    fn ensure_not_listening(&self) -> Result<(), DisplayError> {
        match &self.socket {
            Some(socket) => Err(DisplayError::AlreadyListening(socket.name.clone())),
            None => Ok(()),
        }
    }

    fn listen(&mut self, source: ListeningSocketSource) -> Result<String, DisplayError> {
        let name = source.socket_name().to_string_lossy().into_owned();
        let handle = self.handle.clone();
        let clients = Rc::clone(&self.clients);
        let token = self
            .loop_handle
            .insert_source(source, move |stream, _, _| {
                let mut handle = handle.clone();
                match handle.insert_client(stream, Arc::new(ClientState::default())) {
                    Ok(client) => clients.borrow_mut().push(client),
                    Err(err) => warn!("failed to insert client: {}", err),
                }
            })
            .map_err(|e| DisplayError::EventSource(e.error.to_string()))?;

        info!(socket = %name, "listening on wayland socket");
        self.socket = Some(BoundSocket {
            name: name.clone(),
            token,
        });
        Ok(name)
    }

    pub fn handle(&self) -> DisplayHandle {
        self.handle.clone()
    }

    pub fn add_socket_auto(&mut self) -> Result<String, DisplayError> {
        self.ensure_not_listening()?;
        let source = ListeningSocketSource::new_auto()?;
        self.listen(source)
    }

    pub fn add_socket(&mut self, name: &str) -> Result<(), DisplayError> {
        self.ensure_not_listening()?;
        let source = ListeningSocketSource::with_name(name)?;
        self.listen(source).map(|_| ())
    }

    pub fn socket_name(&self) -> Option<&str> {
        self.socket.as_ref().map(|s| s.name.as_str())
    }

    pub fn client_count(&self) -> usize {
        let mut clients = self.clients.borrow_mut();
        clients.retain(|c| {
            c.get_data::<ClientState>()
                .is_some_and(|data| !data.is_disconnected())
        });
        clients.len()
    }

    pub fn flush_clients(&mut self) -> Result<(), DisplayError> {
        self.handle.flush_clients()?;
        Ok(())
    }

    pub fn destroy_clients(&mut self) -> usize {
        let clients: Vec<Client> = self.clients.borrow_mut().drain(..).collect();
        let count = clients.len();
        for client in clients {
            self.handle
                .backend_handle()
                .kill_client(client.id(), DisconnectReason::ConnectionClosed);
        }
        if let Err(err) = self.handle.flush_clients() {
            debug!("flush after disconnect failed: {}", err);
        }
        count
    }
}

impl Display for WaylandDisplay<ServerState> {
    fn handle(&self) -> DisplayHandle {
        WaylandDisplay::handle(self)
    }

    fn add_socket_auto(&mut self) -> Result<String, DisplayError> {
        WaylandDisplay::add_socket_auto(self)
    }

    fn add_socket(&mut self, name: &str) -> Result<(), DisplayError> {
        WaylandDisplay::add_socket(self, name)
    }

    fn socket_name(&self) -> Option<&str> {
        WaylandDisplay::socket_name(self)
    }

    fn create_output_global(&mut self, output: &Output) -> Result<GlobalId, DisplayError> {
        let id = output.create_global::<ServerState>(&self.handle);
        debug!(output = %output.name(), "wl_output global created");
        Ok(id)
    }

    fn remove_global(&mut self, id: GlobalId) {
        self.handle.remove_global::<ServerState>(id);
    }

    fn client_count(&self) -> usize {
        WaylandDisplay::client_count(self)
    }

    fn flush_clients(&mut self) -> Result<(), DisplayError> {
        WaylandDisplay::flush_clients(self)
    }

    fn destroy_clients(&mut self) -> usize {
        WaylandDisplay::destroy_clients(self)
    }
}

impl<D: 'static> fmt::Debug for WaylandDisplay<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaylandDisplay")
            .field("socket", &self.socket_name())
            .field("clients", &self.clients.borrow().len())
            .finish()
    }
}

impl<D: 'static> Drop for WaylandDisplay<D> {
    fn drop(&mut self) {
        let clients = self.destroy_clients();
        if let Some(socket) = self.socket.take() {
            // Dropping the source unlinks the socket and its lock file.
            self.loop_handle.remove(socket.token);
            debug!(socket = %socket.name, clients, "wayland socket closed");
        }
        if let Some(token) = self.display_source.take() {
            self.loop_handle.remove(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;
    use std::time::Duration;

    use smithay::reexports::calloop::EventLoop;

    use super::*;
    use crate::test_support;

    fn socket_path(name: &str) -> PathBuf {
        test_support::runtime_dir().join(name)
    }

    #[test]
    fn test_auto_sockets_get_distinct_names() {
        test_support::runtime_dir();
        let event_loop = EventLoop::<()>::try_new().unwrap();
        let mut first = WaylandDisplay::new(event_loop.handle()).unwrap();
        let mut second = WaylandDisplay::new(event_loop.handle()).unwrap();

        let a = first.add_socket_auto().unwrap();
        let b = second.add_socket_auto().unwrap();
        assert!(a.starts_with("wayland-"));
        assert_ne!(a, b);
        assert_eq!(first.socket_name(), Some(a.as_str()));

        assert!(matches!(
            first.add_socket_auto(),
            Err(DisplayError::AlreadyListening(name)) if name == a
        ));
    }

    #[test]
    fn test_named_socket_is_removed_on_drop() {
        test_support::runtime_dir();
        let event_loop = EventLoop::<()>::try_new().unwrap();
        let mut display = WaylandDisplay::new(event_loop.handle()).unwrap();

        display.add_socket("strata-display-named").unwrap();
        assert_eq!(display.socket_name(), Some("strata-display-named"));
        assert!(socket_path("strata-display-named").exists());
        assert!(matches!(
            display.add_socket("strata-display-other"),
            Err(DisplayError::AlreadyListening(_))
        ));

        drop(display);
        assert!(!socket_path("strata-display-named").exists());
    }

    #[test]
    fn test_clients_are_accepted_and_destroyed() {
        test_support::runtime_dir();
        let mut event_loop = EventLoop::<()>::try_new().unwrap();
        let mut display = WaylandDisplay::new(event_loop.handle()).unwrap();
        display.add_socket("strata-display-clients").unwrap();

        let path = socket_path("strata-display-clients");
        let _a = UnixStream::connect(&path).unwrap();
        let _b = UnixStream::connect(&path).unwrap();

        for _ in 0..20 {
            if display.client_count() == 2 {
                break;
            }
            event_loop
                .dispatch(Some(Duration::from_millis(10)), &mut ())
                .unwrap();
        }
        assert_eq!(display.client_count(), 2);

        assert_eq!(display.destroy_clients(), 2);
        assert_eq!(display.client_count(), 0);
        assert_eq!(display.destroy_clients(), 0);
    }
}
