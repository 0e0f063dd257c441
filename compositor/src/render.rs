//! Rendering pipeline -- renderer/allocator capabilities and frame
//! submission.
//!
//! [`render_output`] is the frame-ready path for one output: it asks the
//! scene for the output's damage, reuses or allocates a buffer, lets the
//! renderer redraw the damaged part and presents the buffer on the device.
//! Outputs without damage skip the frame entirely. A frame that cannot be
//! allocated, rendered or presented is dropped for that output only; the
//! output is repainted in full next time.
//!
//! The default capabilities, [`SoftwareRenderer`] and [`ShmAllocator`],
//! keep pixels in plain memory and are what the headless backend uses.

use smithay::backend::renderer::Color32F;
use smithay::reexports::wayland_server::protocol::wl_shm;
use smithay::utils::{Physical, Rectangle, Size};
use smithay::wayland::shm::ShmState;
use tracing::{error, trace, warn};

use crate::{
    error::{DispatchError, DisplayError, RenderError},
    output::OutputId,
    state::ServerState,
};

/// Background colour (Catppuccin Mocha base: #1e1e2e).
pub const BG_COLOR: Color32F = Color32F::new(0.118, 0.118, 0.180, 1.0);

/// Largest buffer dimension the shm allocator hands out.
pub const MAX_BUFFER_DIMENSION: i32 = 16_384;

/// Pack as `0xAARRGGBB`.
pub fn to_argb8888(color: Color32F) -> u32 {
    let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u32;
    (channel(color.a()) << 24) | (channel(color.r()) << 16) | (channel(color.g()) << 8) | channel(color.b())
}

/// Something to draw, in output-local coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderElement {
    pub geometry: Rectangle<i32, Physical>,
    pub color: Color32F,
}

/// CPU-visible ARGB8888 pixel buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    size: Size<i32, Physical>,
    pixels: Vec<u32>,
}

impl Buffer {
    pub fn new(size: Size<i32, Physical>) -> Self {
        let len = (size.w.max(0) as usize) * (size.h.max(0) as usize);
        Self {
            size,
            pixels: vec![0; len],
        }
    }

    pub fn size(&self) -> Size<i32, Physical> {
        self.size
    }

    pub fn pixel(&self, x: i32, y: i32) -> Option<u32> {
        if x < 0 || y < 0 || x >= self.size.w || y >= self.size.h {
            return None;
        }
        self.pixels
            .get(y as usize * self.size.w as usize + x as usize)
            .copied()
    }

    /// Fill `rect`, clipped to the buffer.
    pub fn fill(&mut self, rect: Rectangle<i32, Physical>, argb: u32) {
        let bounds = Rectangle::new((0, 0).into(), self.size);
        let Some(clip) = rect.intersection(bounds) else {
            return;
        };
        let stride = self.size.w as usize;
        let (x0, x1) = (clip.loc.x as usize, (clip.loc.x + clip.size.w) as usize);
        for y in clip.loc.y..clip.loc.y + clip.size.h {
            let row = y as usize * stride;
            self.pixels[row + x0..row + x1].fill(argb);
        }
    }
}

/// Pixel drawing capability.
///
/// Dropping the renderer destroys it; the server guarantees no output is
/// still attached at that point.
pub trait Renderer {
    fn name(&self) -> &str;

    /// Advertise the buffer formats this renderer can import.
    fn init_display(&mut self, shm: &mut ShmState) -> Result<(), DisplayError>;

    /// Clear `damage` on `target` to `clear`, then draw `elements` bottom
    /// to top, clipped to `damage`.
    fn render(
        &self,
        target: &mut Buffer,
        damage: &[Rectangle<i32, Physical>],
        elements: &[RenderElement],
        clear: Color32F,
    ) -> Result<(), RenderError>;
}

/// Buffer allocation capability.
pub trait Allocator {
    fn name(&self) -> &str;

    /// Largest buffer this allocator can hand out.
    fn max_size(&self) -> Size<i32, Physical>;

    fn allocate(&self, size: Size<i32, Physical>) -> Result<Buffer, RenderError>;
}

/// Solid-colour software renderer.
#[derive(Debug, Default)]
pub struct SoftwareRenderer;

impl SoftwareRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl Renderer for SoftwareRenderer {
    fn name(&self) -> &str {
        "software"
    }

    fn init_display(&mut self, shm: &mut ShmState) -> Result<(), DisplayError> {
        shm.update_formats([wl_shm::Format::Argb8888, wl_shm::Format::Xrgb8888]);
        Ok(())
    }

    fn render(
        &self,
        target: &mut Buffer,
        damage: &[Rectangle<i32, Physical>],
        elements: &[RenderElement],
        clear: Color32F,
    ) -> Result<(), RenderError> {
        let clear = to_argb8888(clear);
        for region in damage {
            target.fill(*region, clear);
            for element in elements {
                if let Some(visible) = element.geometry.intersection(*region) {
                    target.fill(visible, to_argb8888(element.color));
                }
            }
        }
        Ok(())
    }
}

/// Allocates buffers from process memory.
#[derive(Debug, Default)]
pub struct ShmAllocator;

impl ShmAllocator {
    pub fn new() -> Self {
        Self
    }
}

impl Allocator for ShmAllocator {
    fn name(&self) -> &str {
        "shm"
    }

    fn max_size(&self) -> Size<i32, Physical> {
        Size::from((MAX_BUFFER_DIMENSION, MAX_BUFFER_DIMENSION))
    }

    fn allocate(&self, size: Size<i32, Physical>) -> Result<Buffer, RenderError> {
        let max = self.max_size();
        if size.w <= 0 || size.h <= 0 || size.w > max.w || size.h > max.h {
            return Err(RenderError::Allocation {
                width: size.w,
                height: size.h,
                reason: format!("dimensions must be within 1..={MAX_BUFFER_DIMENSION}"),
            });
        }
        Ok(Buffer::new(size))
    }
}

/// What a frame-ready event did for one output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Output unknown, disabled, or nothing changed since the last frame.
    Skipped,
    /// A buffer was rendered and handed to the device.
    Presented,
    /// No buffer, a render failure or a refused present; the output is
    /// fully damaged again.
    Dropped,
}

/// Render and present one frame for `output` if its scene has damage.
///
/// Only a destroyed renderer or allocator is an error; everything else
/// that goes wrong stays with this output.
pub fn render_output(server: &mut ServerState, output: OutputId) -> Result<FrameOutcome, DispatchError> {
    let Some(record) = server.outputs.iter_mut().find(|o| o.id() == output) else {
        return Ok(FrameOutcome::Skipped);
    };
    if !record.device().is_enabled() {
        return Ok(FrameOutcome::Skipped);
    }
    let Some(size) = server.scene.scene_output(output).map(|so| so.physical_size()) else {
        return Ok(FrameOutcome::Skipped);
    };
    if size.w <= 0 || size.h <= 0 {
        return Ok(FrameOutcome::Skipped);
    }

    let (Some(renderer), Some(allocator)) = (server.renderer.as_deref(), server.allocator.as_deref())
    else {
        return Err(RenderError::Destroyed.into());
    };

    // The back buffer holds the last presented frame, so only the damage
    // since then needs redrawing.
    let age = usize::from(record.back_buffer_size() == Some(size));
    let Some(damage) = server.scene.damage(output, age) else {
        trace!(output = %record.name(), "no damage, skipping frame");
        return Ok(FrameOutcome::Skipped);
    };

    let mut buffer = match record.take_back_buffer().filter(|b| b.size() == size) {
        Some(buffer) => buffer,
        None => match allocator.allocate(size) {
            Ok(buffer) => buffer,
            Err(err) => {
                error!(output = %record.name(), "dropping frame: {}", err);
                server.scene.damage_output(output);
                return Ok(FrameOutcome::Dropped);
            }
        },
    };

    let elements = server.scene.elements_for_output(output);
    if let Err(err) = renderer.render(&mut buffer, &damage, &elements, BG_COLOR) {
        warn!(output = %record.name(), "render failed, dropping frame: {}", err);
        server.scene.damage_output(output);
        return Ok(FrameOutcome::Dropped);
    }

    match record.device_mut().present(&buffer) {
        Ok(()) => {
            record.set_back_buffer(buffer);
            server.scene.frame_done(output);
            trace!(
                output = %record.name(),
                damage_rects = damage.len(),
                elements = elements.len(),
                "frame presented"
            );
            Ok(FrameOutcome::Presented)
        }
        Err(err) => {
            warn!(output = %record.name(), "present failed: {}", err);
            server.scene.damage_output(output);
            Ok(FrameOutcome::Dropped)
        }
    }
}
