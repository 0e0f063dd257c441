//! Outputs: modes, state transactions, per-output records and the attach
//! protocol that turns a discovered device into a rendering-ready output.
//!
//! Attach runs `Discovered -> Configured -> Committed -> Registered` inside a
//! single dispatch of the new-output event. A device that fails any step is
//! dropped and never gets a record.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use smithay::output::{Output, PhysicalProperties, Subpixel};
use smithay::reexports::wayland_server::backend::GlobalId;
use smithay::utils::{Logical, Physical, Size, Transform};
use tracing::{debug, error, info, trace, warn};

pub use smithay::output::Mode;

use crate::{
    backend::{BackendEvent, SignalSource},
    error::{DispatchError, OutputError},
    layout::LayoutEntry,
    render::{self, Allocator, Buffer, Renderer},
    signal::ListenerId,
    state::{Listeners, ServerState},
};

/// Monotonically increasing output ID generator.
static NEXT_OUTPUT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an output device, assigned by the backend on discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputId(u64);

impl OutputId {
    /// Generate a unique output ID.
    pub fn next() -> Self {
        Self(NEXT_OUTPUT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output#{}", self.0)
    }
}

/// Mode of `width`x`height` pixels refreshing at `refresh` mHz.
pub fn new_mode(width: i32, height: i32, refresh: i32) -> Mode {
    Mode {
        size: (width, height).into(),
        refresh,
    }
}

pub fn mode_is_valid(mode: &Mode) -> bool {
    mode.size.w > 0 && mode.size.h > 0 && mode.refresh >= 0
}

/// `1920x1080@60.000Hz`
pub fn describe_mode(mode: &Mode) -> String {
    format!(
        "{}x{}@{:.3}Hz",
        mode.size.w,
        mode.size.h,
        mode.refresh as f64 / 1000.0
    )
}

/// Extent a mode takes in the layout. Outputs are never scaled.
pub fn logical_size(mode: &Mode) -> Size<i32, Logical> {
    Size::from((mode.size.w, mode.size.h))
}

/// Client-visible output object for a device.
pub fn create_output(name: &str, model: &str) -> Output {
    Output::new(
        name.to_string(),
        PhysicalProperties {
            size: (0, 0).into(),
            subpixel: Subpixel::Unknown,
            make: "Strata".into(),
            model: model.into(),
        },
    )
}

/// A proposed output configuration, applied atomically by
/// [`OutputDevice::commit`]. Fields left unset keep the device's current
/// value. Dropping the state discards it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputState {
    enabled: Option<bool>,
    mode: Option<Mode>,
}

impl OutputState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = Some(enabled);
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = Some(mode);
    }

    pub fn enabled(&self) -> Option<bool> {
        self.enabled
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_none() && self.mode.is_none()
    }
}

/// A display sink supplied by the backend.
///
/// Dropping the device releases it.
pub trait OutputDevice {
    fn id(&self) -> OutputId;

    fn name(&self) -> &str;

    fn model(&self) -> &str {
        "Unknown"
    }

    /// Bind the device to the allocator/renderer pair used for its frames.
    fn init_render(
        &mut self,
        allocator: &dyn Allocator,
        renderer: &dyn Renderer,
    ) -> Result<(), OutputError>;

    fn preferred_mode(&self) -> Option<Mode>;

    fn current_mode(&self) -> Option<Mode>;

    fn is_enabled(&self) -> bool;

    /// Apply `state` as one transaction: either all of it takes effect or
    /// the device is left untouched.
    fn commit(&mut self, state: &OutputState) -> Result<(), OutputError>;

    /// Scan out a rendered buffer.
    fn present(&mut self, buffer: &Buffer) -> Result<(), OutputError>;

    /// Extent the output occupies in the layout.
    fn size(&self) -> Size<i32, Logical> {
        self.current_mode()
            .map(|m| logical_size(&m))
            .unwrap_or_else(|| Size::from((0, 0)))
    }
}

/// Mirror the device's modes into the client-visible output.
fn sync_output(output: &Output, device: &dyn OutputDevice) {
    if let Some(mode) = device.preferred_mode() {
        output.set_preferred(mode);
    }
    output.change_current_state(device.current_mode(), Some(Transform::Normal), None, None);
}

/// Progress of one device through the attach protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStage {
    Discovered,
    Configured,
    Committed,
    Registered,
}

/// Listener bindings owned by one output record.
#[derive(Debug)]
struct OutputListeners {
    frame: ListenerId,
    request_state: ListenerId,
    destroy: ListenerId,
}

impl OutputListeners {
    fn register(listeners: &mut Listeners, id: OutputId) -> Self {
        let frame = listeners.register(
            SignalSource::Frame(id),
            move |server: &mut ServerState, _: &BackendEvent| {
                render::render_output(server, id).map(|_| ())
            },
        );
        let request_state = listeners.register(
            SignalSource::RequestState(id),
            move |server: &mut ServerState, event: &BackendEvent| {
                if let BackendEvent::RequestState { state, .. } = event {
                    server.apply_output_state(id, state);
                }
                Ok(())
            },
        );
        let destroy = listeners.register(
            SignalSource::Destroy(id),
            move |server: &mut ServerState, _: &BackendEvent| {
                server.detach_output(id);
                Ok(())
            },
        );
        Self {
            frame,
            request_state,
            destroy,
        }
    }

    fn unregister(&self, listeners: &mut Listeners) {
        listeners.unregister(self.frame);
        listeners.unregister(self.request_state);
        listeners.unregister(self.destroy);
    }
}

/// Bookkeeping for one attached output.
pub struct OutputRecord {
    id: OutputId,
    device: Box<dyn OutputDevice>,
    output: Output,
    listeners: OutputListeners,
    global: Option<GlobalId>,
    /// Last presented buffer, reused while the size holds.
    back_buffer: Option<Buffer>,
}

impl OutputRecord {
    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn device(&self) -> &dyn OutputDevice {
        self.device.as_ref()
    }

    pub(crate) fn device_mut(&mut self) -> &mut dyn OutputDevice {
        self.device.as_mut()
    }

    /// The output object advertised to clients.
    pub fn output(&self) -> &Output {
        &self.output
    }

    pub fn global(&self) -> Option<&GlobalId> {
        self.global.as_ref()
    }

    pub(crate) fn take_back_buffer(&mut self) -> Option<Buffer> {
        self.back_buffer.take()
    }

    pub(crate) fn set_back_buffer(&mut self, buffer: Buffer) {
        self.back_buffer = Some(buffer);
    }

    pub(crate) fn back_buffer_size(&self) -> Option<Size<i32, Physical>> {
        self.back_buffer.as_ref().map(|b| b.size())
    }

    /// Unregister this record's listeners and drop its device.
    pub(crate) fn release(self, listeners: &mut Listeners) {
        self.listeners.unregister(listeners);
        debug!(output = %self.device.name(), "output record released");
    }
}

impl fmt::Debug for OutputRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputRecord")
            .field("id", &self.id)
            .field("name", &self.device.name())
            .field("mode", &self.device.current_mode().map(|m| describe_mode(&m)))
            .field("enabled", &self.device.is_enabled())
            .finish()
    }
}

/// Listener for [`SignalSource::NewOutput`]: claims the device and attaches
/// it. Attach failures are logged and the output skipped.
pub(crate) fn handle_new_output(
    server: &mut ServerState,
    event: &BackendEvent,
) -> Result<(), DispatchError> {
    let BackendEvent::NewOutput(new_output) = event else {
        return Ok(());
    };
    let Some(device) = new_output.take_device() else {
        return Err(DispatchError::DeviceClaimed {
            output: new_output.name().to_string(),
        });
    };

    match server.attach_output(device) {
        Ok(entry) => {
            info!(
                output = %new_output.name(),
                geometry = ?entry.geometry,
                outputs = server.outputs.len(),
                "output attached"
            );
        }
        Err(err) => {
            error!(output = %new_output.name(), "output not attached: {}", err);
        }
    }
    Ok(())
}

fn enter_stage(name: &str, stage: AttachStage) {
    trace!(output = %name, ?stage, "attach stage");
}

impl ServerState {
    /// Run the attach protocol for a freshly discovered device.
    pub fn attach_output(
        &mut self,
        mut device: Box<dyn OutputDevice>,
    ) -> Result<LayoutEntry, OutputError> {
        let id = device.id();
        let name = device.name().to_string();
        enter_stage(&name, AttachStage::Discovered);

        if self.output(id).is_some() {
            warn!(output = %name, %id, "output already attached");
            return Err(OutputError::Commit {
                output: name,
                reason: "already attached".into(),
            });
        }

        let (Some(allocator), Some(renderer)) = (self.allocator.as_deref(), self.renderer.as_deref())
        else {
            return Err(OutputError::NotRenderReady { output: name });
        };
        device.init_render(allocator, renderer)?;
        enter_stage(&name, AttachStage::Configured);

        let mut state = OutputState::new();
        state.set_enabled(true);
        match device.preferred_mode() {
            Some(mode) => {
                debug!(output = %name, mode = %describe_mode(&mode), "using preferred mode");
                state.set_mode(mode);
            }
            None => debug!(output = %name, "no preferred mode, keeping current"),
        }
        device.commit(&state)?;
        drop(state);
        enter_stage(&name, AttachStage::Committed);

        let output = create_output(&name, device.model());
        sync_output(&output, device.as_ref());
        let size = device.size();
        let entry = self
            .layout
            .add_auto(id, &output, size)
            .map_err(|source| OutputError::Layout {
                output: name.clone(),
                source,
            })?;

        output.change_current_state(None, None, None, Some(entry.geometry.loc));

        let listeners = OutputListeners::register(&mut self.listeners, id);
        self.scene.create_scene_output(id, size);
        self.scene_layout.bind(&mut self.scene, &entry);

        let global = match self.display.as_deref_mut() {
            Some(display) => match display.create_output_global(&output) {
                Ok(global) => Some(global),
                Err(err) => {
                    warn!(output = %name, "failed to advertise output: {}", err);
                    None
                }
            },
            None => None,
        };
        self.outputs.push(OutputRecord {
            id,
            device,
            output,
            listeners,
            global,
            back_buffer: None,
        });
        enter_stage(&name, AttachStage::Registered);
        Ok(entry)
    }

    /// Move every client-visible output to where the layout now puts it.
    fn sync_output_positions(&self) {
        for record in &self.outputs {
            if let Some(geometry) = self.layout.geometry(record.id) {
                record
                    .output
                    .change_current_state(None, None, None, Some(geometry.loc));
            }
        }
    }

    /// Tear down an output whose device went away. Returns `false` if the
    /// output was not attached.
    pub fn detach_output(&mut self, id: OutputId) -> bool {
        let Some(idx) = self.outputs.iter().position(|o| o.id == id) else {
            debug!(%id, "destroy for unknown output");
            return false;
        };
        let record = self.outputs.remove(idx);

        self.scene_layout.unbind(id);
        self.scene.remove_output(id);
        self.layout.remove(id);
        self.scene_layout.sync(&mut self.scene, &self.layout);
        self.sync_output_positions();

        if let (Some(global), Some(display)) = (record.global.clone(), self.display.as_deref_mut()) {
            display.remove_global(global);
        }

        info!(output = %record.name(), outputs = self.outputs.len(), "output detached");
        record.release(&mut self.listeners);
        true
    }

    /// Commit a backend-requested state change on an attached output.
    pub fn apply_output_state(&mut self, id: OutputId, requested: &OutputState) -> bool {
        let Some(idx) = self.outputs.iter().position(|o| o.id == id) else {
            debug!(%id, "state request for unknown output");
            return false;
        };
        if let Some(mode) = requested.mode() {
            if let Err(err) = self.layout.check_resize(id, logical_size(&mode)) {
                error!(output = %self.outputs[idx].name(), "state request rejected: {}", err);
                return false;
            }
        }

        let record = &mut self.outputs[idx];
        if let Err(err) = record.device.commit(requested) {
            error!(output = %record.device.name(), "state request rejected: {}", err);
            return false;
        }
        sync_output(&record.output, record.device.as_ref());

        let size = record.device.size();
        debug!(
            output = %record.device.name(),
            mode = ?record.device.current_mode().map(|m| describe_mode(&m)),
            "state request applied"
        );
        match self.layout.resize(id, size) {
            Ok(Some(_)) => {
                self.scene.resize_output(id, size);
                self.scene_layout.sync(&mut self.scene, &self.layout);
                self.sync_output_positions();
            }
            Ok(None) => {}
            Err(err) => error!(%id, "layout refused committed size: {}", err),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_ids_are_unique() {
        let a = OutputId::next();
        let b = OutputId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_mode_display() {
        let mode = new_mode(1920, 1080, 60_000);
        assert_eq!(describe_mode(&mode), "1920x1080@60.000Hz");
        assert!(mode_is_valid(&mode));
        assert!(!mode_is_valid(&new_mode(0, 1080, 60_000)));
        assert!(!mode_is_valid(&new_mode(640, 480, -1)));
        assert_eq!(logical_size(&mode), Size::from((1920, 1080)));
    }

    #[test]
    fn test_output_state_transaction() {
        let mut state = OutputState::new();
        assert!(state.is_empty());
        state.set_enabled(true);
        assert_eq!(state.enabled(), Some(true));
        assert_eq!(state.mode(), None);
        state.set_mode(new_mode(800, 600, 59_940));
        assert_eq!(state.mode().map(|m| logical_size(&m)), Some(Size::from((800, 600))));
    }

    #[test]
    fn test_created_output_carries_name_and_model() {
        let output = create_output("HEADLESS-9", "Headless");
        assert_eq!(output.name(), "HEADLESS-9");
        assert_eq!(output.physical_properties().model, "Headless");
        assert_eq!(output.current_mode(), None);
    }
}
