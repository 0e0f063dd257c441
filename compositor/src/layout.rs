//! Output layout: places outputs in one shared 2D coordinate space.
//!
//! Every output is auto-placed. Entries form a horizontal strip in
//! discovery order, top-aligned at y = 0, each one starting where the
//! previous one ends. Removing or resizing an output re-flows the strip so
//! it never has gaps or overlaps. Every placement is mirrored into a
//! [`Space`] so hit-testing goes through the same output geometry clients
//! see.
//!
//! The strip has to stay inside `i32`: an output that would push the right
//! edge past `i32::MAX` is refused instead of wrapping.

use std::fmt;

use smithay::desktop::{Space, Window};
use smithay::output::Output;
use smithay::utils::{Logical, Point, Rectangle, Size};
use tracing::debug;

use crate::{error::LayoutError, output::OutputId};

/// Placement of one output in the layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutEntry {
    pub output: OutputId,
    pub geometry: Rectangle<i32, Logical>,
}

struct Slot {
    entry: LayoutEntry,
    output: Output,
}

/// The shared coordinate space all outputs live in.
#[derive(Default)]
pub struct OutputLayout {
    space: Space<Window>,
    /// Discovery order.
    slots: Vec<Slot>,
}

impl fmt::Debug for OutputLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.slots.iter().map(|s| (s.output.name(), s.entry.geometry)))
            .finish()
    }
}

/// Right edge of a strip of `widths` laid side by side from x = 0.
fn strip_width(widths: impl IntoIterator<Item = i32>) -> Result<i32, LayoutError> {
    widths.into_iter().try_fold(0i32, |x, width| {
        x.checked_add(width.max(0))
            .ok_or(LayoutError::NoRoom { x, width })
    })
}

impl OutputLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `output` to the right of the rightmost placed output.
    ///
    /// Adding an output that is already placed returns its existing entry.
    /// Nothing changes when the output does not fit.
    pub fn add_auto(
        &mut self,
        id: OutputId,
        output: &Output,
        size: Size<i32, Logical>,
    ) -> Result<LayoutEntry, LayoutError> {
        if let Some(existing) = self.get(id) {
            debug!(output = %id, "output already in layout");
            return Ok(existing);
        }
        if size.w < 0 || size.h < 0 {
            return Err(LayoutError::NegativeSize {
                width: size.w,
                height: size.h,
            });
        }

        let x = strip_width(self.widths())?;
        x.checked_add(size.w)
            .ok_or(LayoutError::NoRoom { x, width: size.w })?;

        let entry = LayoutEntry {
            output: id,
            geometry: Rectangle::new((x, 0).into(), size),
        };
        self.space.map_output(output, entry.geometry.loc);
        self.slots.push(Slot {
            entry,
            output: output.clone(),
        });
        debug!(output = %id, geometry = ?entry.geometry, "output added to layout");
        Ok(entry)
    }

    /// Remove an output and close the gap it leaves.
    pub fn remove(&mut self, id: OutputId) -> Option<LayoutEntry> {
        let idx = self.slots.iter().position(|s| s.entry.output == id)?;
        let slot = self.slots.remove(idx);
        self.space.unmap_output(&slot.output);
        self.reconfigure();
        debug!(output = %id, "output removed from layout");
        Some(slot.entry)
    }

    /// Whether `id` could take `size` without the strip leaving `i32`.
    pub fn check_resize(&self, id: OutputId, size: Size<i32, Logical>) -> Result<(), LayoutError> {
        if size.w < 0 || size.h < 0 {
            return Err(LayoutError::NegativeSize {
                width: size.w,
                height: size.h,
            });
        }
        strip_width(self.slots.iter().map(|s| {
            if s.entry.output == id {
                size.w
            } else {
                s.entry.geometry.size.w
            }
        }))
        .map(|_| ())
    }

    /// Change an output's extent, e.g. after a mode change. Returns the new
    /// entry, or `None` if the output is not in the layout.
    pub fn resize(
        &mut self,
        id: OutputId,
        size: Size<i32, Logical>,
    ) -> Result<Option<LayoutEntry>, LayoutError> {
        self.check_resize(id, size)?;
        let Some(slot) = self.slots.iter_mut().find(|s| s.entry.output == id) else {
            return Ok(None);
        };
        slot.entry.geometry.size = size;
        self.reconfigure();
        Ok(self.get(id))
    }

    fn reconfigure(&mut self) {
        let mut x = 0i32;
        for slot in &mut self.slots {
            slot.entry.geometry.loc = (x, 0).into();
            self.space.map_output(&slot.output, slot.entry.geometry.loc);
            // Every width was checked on the way in.
            x = x.saturating_add(slot.entry.geometry.size.w.max(0));
        }
    }

    fn widths(&self) -> impl Iterator<Item = i32> + '_ {
        self.slots.iter().map(|s| s.entry.geometry.size.w)
    }

    pub fn get(&self, id: OutputId) -> Option<LayoutEntry> {
        self.slots.iter().find(|s| s.entry.output == id).map(|s| s.entry)
    }

    pub fn geometry(&self, id: OutputId) -> Option<Rectangle<i32, Logical>> {
        self.get(id).map(|e| e.geometry)
    }

    /// Output whose area contains `point`.
    pub fn output_at(&self, point: Point<i32, Logical>) -> Option<OutputId> {
        let output = self.space.output_under(point.to_f64()).next()?;
        self.slots
            .iter()
            .find(|s| &s.output == output)
            .map(|s| s.entry.output)
    }

    /// Bounding box of every placed output.
    pub fn extents(&self) -> Rectangle<i32, Logical> {
        self.slots
            .iter()
            .map(|s| s.entry.geometry)
            .reduce(|acc, g| acc.merge(g))
            .unwrap_or_else(|| Rectangle::new((0, 0).into(), (0, 0).into()))
    }

    pub fn entries(&self) -> impl Iterator<Item = &LayoutEntry> {
        self.slots.iter().map(|s| &s.entry)
    }

    pub fn space(&self) -> &Space<Window> {
        &self.space
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        for slot in self.slots.drain(..) {
            self.space.unmap_output(&slot.output);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::output_with_mode;

    fn output(n: u64, w: i32, h: i32) -> (OutputId, Output, Size<i32, Logical>) {
        (
            OutputId::from_raw(n),
            output_with_mode(&format!("TEST-{n}"), w, h),
            Size::from((w, h)),
        )
    }

    fn add(layout: &mut OutputLayout, n: u64, w: i32, h: i32) -> LayoutEntry {
        let (id, output, size) = output(n, w, h);
        layout.add_auto(id, &output, size).unwrap()
    }

    #[test]
    fn test_first_output_at_origin() {
        let mut layout = OutputLayout::new();
        let entry = add(&mut layout, 1, 1920, 1080);
        assert_eq!(entry.geometry, Rectangle::new((0, 0).into(), (1920, 1080).into()));
        assert_eq!(layout.space().outputs().count(), 1);
    }

    #[test]
    fn test_strip_in_discovery_order_never_overlaps() {
        let sizes = [(1920, 1080), (1280, 1024), (2560, 1440), (800, 600), (3840, 2160)];
        let mut layout = OutputLayout::new();
        let entries: Vec<LayoutEntry> = sizes
            .iter()
            .enumerate()
            .map(|(i, (w, h))| add(&mut layout, i as u64 + 1, *w, *h))
            .collect();

        let mut expected_x = 0;
        for (entry, (w, _)) in entries.iter().zip(sizes.iter()) {
            assert_eq!(entry.geometry.loc, Point::from((expected_x, 0)));
            expected_x += w;
        }
        for (i, a) in entries.iter().enumerate() {
            for b in &entries[i + 1..] {
                assert!(!a.geometry.overlaps(b.geometry), "{:?} overlaps {:?}", a.geometry, b.geometry);
            }
        }
        assert_eq!(
            layout.extents(),
            Rectangle::new((0, 0).into(), (expected_x, 2160).into())
        );
    }

    #[test]
    fn test_add_twice_keeps_single_entry() {
        let mut layout = OutputLayout::new();
        let (id, output, size) = output(1, 100, 100);
        let first = layout.add_auto(id, &output, size).unwrap();
        let again = layout.add_auto(id, &output, Size::from((500, 500))).unwrap();
        assert_eq!(first, again);
        assert_eq!(layout.len(), 1);
    }

    #[test]
    fn test_remove_closes_gap() {
        let mut layout = OutputLayout::new();
        add(&mut layout, 1, 1000, 500);
        add(&mut layout, 2, 800, 500);
        add(&mut layout, 3, 600, 500);

        let removed = layout.remove(OutputId::from_raw(2)).unwrap();
        assert_eq!(removed.geometry.loc, Point::from((1000, 0)));
        assert_eq!(
            layout.geometry(OutputId::from_raw(3)).unwrap().loc,
            Point::from((1000, 0))
        );
        assert!(layout.remove(OutputId::from_raw(2)).is_none());
        assert_eq!(layout.space().outputs().count(), 2);
    }

    #[test]
    fn test_resize_reflows_following_outputs() {
        let mut layout = OutputLayout::new();
        add(&mut layout, 1, 1000, 500);
        add(&mut layout, 2, 800, 500);

        let resized = layout
            .resize(OutputId::from_raw(1), Size::from((1200, 700)))
            .unwrap()
            .unwrap();
        assert_eq!(resized.geometry, Rectangle::new((0, 0).into(), (1200, 700).into()));
        assert_eq!(
            layout.geometry(OutputId::from_raw(2)).unwrap().loc,
            Point::from((1200, 0))
        );
        assert_eq!(layout.resize(OutputId::from_raw(9), Size::from((1, 1))), Ok(None));
    }

    #[test]
    fn test_output_at() {
        let mut layout = OutputLayout::new();
        add(&mut layout, 1, 100, 100);
        add(&mut layout, 2, 100, 50);

        assert_eq!(layout.output_at((99, 99).into()), Some(OutputId::from_raw(1)));
        assert_eq!(layout.output_at((100, 0).into()), Some(OutputId::from_raw(2)));
        assert_eq!(layout.output_at((150, 60).into()), None);
    }

    #[test]
    fn test_zero_sized_output_takes_no_space() {
        let mut layout = OutputLayout::new();
        let (id, output, _) = output(1, 0, 0);
        layout.add_auto(id, &output, Size::from((0, 0))).unwrap();
        let next = add(&mut layout, 2, 640, 480);
        assert_eq!(next.geometry.loc, Point::from((0, 0)));
    }

    #[test]
    fn test_output_past_i32_range_is_refused() {
        let mut layout = OutputLayout::new();
        add(&mut layout, 1, 1_500_000_000, 10);

        let (id, output, size) = output(2, 1_500_000_000, 10);
        assert_eq!(
            layout.add_auto(id, &output, size),
            Err(LayoutError::NoRoom {
                x: 1_500_000_000,
                width: 1_500_000_000
            })
        );
        assert_eq!(layout.len(), 1);
        assert_eq!(layout.space().outputs().count(), 1);

        // Still room for a narrow one.
        let entry = add(&mut layout, 3, 10, 10);
        assert_eq!(entry.geometry.loc, Point::from((1_500_000_000, 0)));
    }

    #[test]
    fn test_resize_past_i32_range_leaves_layout_untouched() {
        let mut layout = OutputLayout::new();
        add(&mut layout, 1, 100, 100);
        add(&mut layout, 2, 100, 100);

        let huge = Size::from((i32::MAX, 100));
        assert!(layout.check_resize(OutputId::from_raw(1), huge).is_err());
        assert!(layout.resize(OutputId::from_raw(1), huge).is_err());
        assert_eq!(
            layout.geometry(OutputId::from_raw(2)),
            Some(Rectangle::new((100, 0).into(), (100, 100).into()))
        );
        assert!(layout.check_resize(OutputId::from_raw(1), Size::from((i32::MAX - 100, 1))).is_ok());
    }
}
