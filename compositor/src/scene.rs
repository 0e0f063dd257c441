//! Scene graph: drawable nodes in layout coordinates plus one scene output
//! per attached output, each with its own damage tracker.
//!
//! A [`SceneLayout`] pairs layout entries with scene outputs and keeps the
//! scene outputs positioned where the layout puts them.

use std::fmt;

use smithay::backend::renderer::damage::OutputDamageTracker;
use smithay::backend::renderer::element::solid::{SolidColorBuffer, SolidColorRenderElement};
use smithay::backend::renderer::element::Kind;
use smithay::backend::renderer::Color32F;
use smithay::utils::{Logical, Physical, Point, Rectangle, Size, Transform};
use tracing::{debug, trace, warn};

use crate::{
    layout::{LayoutEntry, OutputLayout},
    output::OutputId,
    render::RenderElement,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Solid-colour rectangle in layout coordinates.
#[derive(Debug, Clone)]
pub struct RectNode {
    pub id: NodeId,
    pub geometry: Rectangle<i32, Logical>,
    pub color: Color32F,
    buffer: SolidColorBuffer,
}

fn physical(size: Size<i32, Logical>) -> Size<i32, Physical> {
    Size::from((size.w, size.h))
}

/// Per-output view onto the scene.
pub struct SceneOutput {
    output: OutputId,
    geometry: Rectangle<i32, Logical>,
    tracker: OutputDamageTracker,
    frames: u64,
}

impl fmt::Debug for SceneOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneOutput")
            .field("output", &self.output)
            .field("geometry", &self.geometry)
            .field("frames", &self.frames)
            .finish()
    }
}

impl SceneOutput {
    fn new(output: OutputId, geometry: Rectangle<i32, Logical>) -> Self {
        Self {
            output,
            geometry,
            tracker: OutputDamageTracker::new(physical(geometry.size), 1.0, Transform::Normal),
            frames: 0,
        }
    }

    pub fn output(&self) -> OutputId {
        self.output
    }

    /// Position and size in layout coordinates.
    pub fn geometry(&self) -> Rectangle<i32, Logical> {
        self.geometry
    }

    pub fn physical_size(&self) -> Size<i32, Physical> {
        physical(self.geometry.size)
    }

    /// Frames rendered for this output so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Forget what was drawn; the next frame repaints everything.
    fn damage_whole(&mut self) {
        self.tracker = OutputDamageTracker::new(self.physical_size(), 1.0, Transform::Normal);
    }

    fn local_bounds(&self) -> Rectangle<i32, Physical> {
        Rectangle::new((0, 0).into(), self.physical_size())
    }
}

/// Root of the scene: nodes and the scene outputs that display them.
#[derive(Debug, Default)]
pub struct Scene {
    nodes: Vec<RectNode>,
    outputs: Vec<SceneOutput>,
    next_node: u64,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the pairing object that binds layout entries to scene outputs.
    pub fn attach_output_layout(&self) -> SceneLayout {
        SceneLayout::default()
    }

    /// Add a scene output for `output`. Fully damaged until first rendered.
    pub fn create_scene_output(&mut self, output: OutputId, size: Size<i32, Logical>) -> &SceneOutput {
        if let Some(idx) = self.outputs.iter().position(|o| o.output == output) {
            debug!(%output, "scene output already exists");
            return &self.outputs[idx];
        }
        self.outputs
            .push(SceneOutput::new(output, Rectangle::new((0, 0).into(), size)));
        debug!(%output, ?size, "scene output created");
        &self.outputs[self.outputs.len() - 1]
    }

    pub fn remove_output(&mut self, output: OutputId) -> Option<SceneOutput> {
        let idx = self.outputs.iter().position(|o| o.output == output)?;
        debug!(%output, "scene output removed");
        Some(self.outputs.remove(idx))
    }

    pub fn scene_output(&self, output: OutputId) -> Option<&SceneOutput> {
        self.outputs.iter().find(|o| o.output == output)
    }

    fn scene_output_mut(&mut self, output: OutputId) -> Option<&mut SceneOutput> {
        self.outputs.iter_mut().find(|o| o.output == output)
    }

    pub fn scene_outputs(&self) -> impl Iterator<Item = &SceneOutput> {
        self.outputs.iter()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Move a scene output; damages it fully when anything changed.
    pub fn set_output_position(&mut self, output: OutputId, loc: Point<i32, Logical>) {
        if let Some(so) = self.scene_output_mut(output) {
            if so.geometry.loc != loc {
                so.geometry.loc = loc;
                so.damage_whole();
            }
        }
    }

    pub fn resize_output(&mut self, output: OutputId, size: Size<i32, Logical>) {
        if let Some(so) = self.scene_output_mut(output) {
            if so.geometry.size != size {
                so.geometry.size = size;
                so.damage_whole();
            }
        }
    }

    pub fn damage_output(&mut self, output: OutputId) {
        if let Some(so) = self.scene_output_mut(output) {
            so.damage_whole();
        }
    }

    pub fn add_rect(&mut self, geometry: Rectangle<i32, Logical>, color: Color32F) -> NodeId {
        self.next_node += 1;
        let id = NodeId(self.next_node);
        self.nodes.push(RectNode {
            id,
            geometry,
            color,
            buffer: SolidColorBuffer::new(geometry.size, color),
        });
        trace!(node = %id, ?geometry, "rect added");
        id
    }

    pub fn remove_node(&mut self, id: NodeId) -> bool {
        let Some(idx) = self.nodes.iter().position(|n| n.id == id) else {
            return false;
        };
        self.nodes.remove(idx);
        trace!(node = %id, "rect removed");
        true
    }

    pub fn nodes(&self) -> &[RectNode] {
        &self.nodes
    }

    /// Output-local damage of `output` for a target buffer of `age`
    /// (0 = fresh), or `None` when nothing needs redrawing.
    ///
    /// Each call records the current scene as drawn.
    pub fn damage(&mut self, output: OutputId, age: usize) -> Option<Vec<Rectangle<i32, Physical>>> {
        let nodes = &self.nodes;
        let so = self.outputs.iter_mut().find(|o| o.output == output)?;
        if so.geometry.size.w <= 0 || so.geometry.size.h <= 0 {
            return None;
        }

        let bounds = so.geometry;
        let elements: Vec<SolidColorRenderElement> = nodes
            .iter()
            .filter(|node| node.geometry.overlaps(bounds))
            .map(|node| {
                let loc = node.geometry.loc - bounds.loc;
                SolidColorRenderElement::from_buffer(&node.buffer, (loc.x, loc.y), 1.0, 1.0, Kind::Unspecified)
            })
            .collect();

        let damage = match so.tracker.damage_output(age, &elements) {
            Ok((damage, _)) => Ok(damage.map(|d| d.to_vec())),
            Err(err) => Err(format!("{err:?}")),
        };
        match damage {
            Ok(Some(damage)) if !damage.is_empty() => Some(damage),
            Ok(_) => None,
            Err(err) => {
                warn!(%output, "damage tracking failed, repainting: {}", err);
                so.damage_whole();
                Some(vec![so.local_bounds()])
            }
        }
    }

    /// Nodes visible on `output`, clipped and in output-local coordinates,
    /// bottom to top.
    pub fn elements_for_output(&self, output: OutputId) -> Vec<RenderElement> {
        let Some(so) = self.scene_output(output) else {
            return Vec::new();
        };
        self.nodes
            .iter()
            .filter_map(|node| {
                let visible = node.geometry.intersection(so.geometry)?;
                let loc = visible.loc - so.geometry.loc;
                Some(RenderElement {
                    geometry: Rectangle::new((loc.x, loc.y).into(), physical(visible.size)),
                    color: node.color,
                })
            })
            .collect()
    }

    pub(crate) fn frame_done(&mut self, output: OutputId) {
        if let Some(so) = self.scene_output_mut(output) {
            so.frames += 1;
        }
    }

    /// Destroy the scene root: every node and every scene output.
    pub fn destroy(&mut self) {
        debug!(
            nodes = self.nodes.len(),
            outputs = self.outputs.len(),
            "destroying scene"
        );
        self.nodes.clear();
        self.outputs.clear();
    }
}

/// Binds layout entries to scene outputs.
#[derive(Debug, Default)]
pub struct SceneLayout {
    /// One binding per output, in bind order.
    bindings: Vec<OutputId>,
}

impl SceneLayout {
    /// Pair `entry` with the scene output of the same output and move the
    /// scene output to the entry's position. Returns `false` if there is no
    /// such scene output or it is already bound.
    pub fn bind(&mut self, scene: &mut Scene, entry: &LayoutEntry) -> bool {
        if self.is_bound(entry.output) || scene.scene_output(entry.output).is_none() {
            return false;
        }
        scene.set_output_position(entry.output, entry.geometry.loc);
        self.bindings.push(entry.output);
        true
    }

    pub fn unbind(&mut self, output: OutputId) -> bool {
        let before = self.bindings.len();
        self.bindings.retain(|o| *o != output);
        before != self.bindings.len()
    }

    /// Follow layout changes: move every bound scene output to where the
    /// layout now places it.
    pub fn sync(&self, scene: &mut Scene, layout: &OutputLayout) {
        for output in &self.bindings {
            if let Some(geometry) = layout.geometry(*output) {
                scene.set_output_position(*output, geometry.loc);
            }
        }
    }

    pub fn is_bound(&self, output: OutputId) -> bool {
        self.bindings.contains(&output)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}
