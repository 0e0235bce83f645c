use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};
use tracing::info;

use crate::axis::{self, AtlasGeometry, DisplayMode, OverlapMode};
use crate::event::{EventBus, SessionEvent};
use crate::slice::{DisplaySettings, Slice};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
pub enum SliceDisplayMode {
    #[default]
    AllSlices,
    CurrentSlice,
    NoSlice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// Target axis position for one slice of a bulk move.
pub type PlannedMove = (Arc<Slice>, f64);

#[derive(Debug, Default)]
struct ViewState {
    current_index: usize,
    display_mode: DisplayMode,
    slice_display_mode: SliceDisplayMode,
    overlap_mode: OverlapMode,
}

/// Every slice of the session plus the view state derived from their order.
#[derive(Debug)]
pub struct SliceCollection {
    slices: RwLock<Vec<Arc<Slice>>>,
    view: RwLock<ViewState>,
    geometry: AtlasGeometry,
    events: EventBus,
}

impl SliceCollection {
    pub fn new(
        geometry: AtlasGeometry,
        display_mode: DisplayMode,
        overlap_mode: OverlapMode,
        events: EventBus,
    ) -> Self {
        Self {
            slices: RwLock::new(Vec::new()),
            view: RwLock::new(ViewState {
                display_mode,
                overlap_mode,
                ..ViewState::default()
            }),
            geometry,
            events,
        }
    }

    pub fn geometry(&self) -> &AtlasGeometry {
        &self.geometry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Snapshot in insertion order.
    pub fn slices(&self) -> Vec<Arc<Slice>> {
        self.slices.read().clone()
    }

    pub fn len(&self) -> usize {
        self.slices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.read().is_empty()
    }

    pub fn contains(&self, slice: &Arc<Slice>) -> bool {
        self.slices.read().iter().any(|s| Arc::ptr_eq(s, slice))
    }

    /// Slices by ascending axis position, ties in insertion order. Assigns
    /// each slice its rank.
    pub fn sorted_slices(&self) -> Vec<Arc<Slice>> {
        let mut keyed: Vec<(f64, Arc<Slice>)> = self
            .slices()
            .into_iter()
            .map(|slice| (slice.axis_position(), slice))
            .collect();
        keyed.sort_by(|a, b| a.0.total_cmp(&b.0));

        keyed
            .into_iter()
            .enumerate()
            .map(|(index, (_, slice))| {
                slice.set_index(index);
                slice
            })
            .collect()
    }

    pub fn selected_slices(&self) -> Vec<Arc<Slice>> {
        self.sorted_slices()
            .into_iter()
            .filter(|slice| slice.is_selected())
            .collect()
    }

    pub(crate) fn insert(&self, slice: Arc<Slice>, index: Option<usize>) {
        let slice_id = slice.id();
        {
            let mut slices = self.slices.write();
            match index {
                Some(index) if index <= slices.len() => slices.insert(index, slice),
                _ => slices.push(slice),
            }
        }
        info!(slice = %slice_id, "Slice created");
        self.events.emit(SessionEvent::SliceCreated { slice_id });
        self.update_offsets();
    }

    /// Returns the insertion index the slice had.
    pub(crate) fn remove(&self, slice: &Arc<Slice>) -> Option<usize> {
        let index = {
            let mut slices = self.slices.write();
            let index = slices.iter().position(|s| Arc::ptr_eq(s, slice))?;
            slices.remove(index);
            index
        };
        info!(slice = %slice.id(), "Slice deleted");
        self.events.emit(SessionEvent::SliceDeleted {
            slice_id: slice.id(),
        });
        self.update_offsets();
        Some(index)
    }

    pub fn current_index(&self) -> usize {
        self.view.read().current_index
    }

    pub fn set_current_index(&self, index: usize) {
        self.view.write().current_index = index;
    }

    /// Slice at the current index of the sorted order; the index falls back
    /// to the first slice when out of range.
    pub fn current_slice(&self) -> Option<Arc<Slice>> {
        let sorted = self.sorted_slices();
        if sorted.is_empty() {
            return None;
        }
        let mut view = self.view.write();
        if view.current_index >= sorted.len() {
            view.current_index = 0;
        }
        sorted.get(view.current_index).cloned()
    }

    pub fn is_current_slice(&self, slice: &Arc<Slice>) -> bool {
        self.current_slice()
            .is_some_and(|current| Arc::ptr_eq(&current, slice))
    }

    pub fn navigate_next(&self) -> Option<Arc<Slice>> {
        self.navigate(|index, len| (index + 1) % len)
    }

    pub fn navigate_previous(&self) -> Option<Arc<Slice>> {
        self.navigate(|index, len| (index + len - 1) % len)
    }

    pub fn navigate_current(&self) -> Option<Arc<Slice>> {
        self.navigate(|index, _| index)
    }

    fn navigate(&self, step: impl Fn(usize, usize) -> usize) -> Option<Arc<Slice>> {
        let sorted = self.sorted_slices();
        if sorted.is_empty() {
            return None;
        }
        let index = {
            let mut view = self.view.write();
            let current = if view.current_index >= sorted.len() {
                0
            } else {
                view.current_index
            };
            view.current_index = step(current, sorted.len());
            view.current_index
        };
        let slice = Arc::clone(&sorted[index]);
        self.events.emit(SessionEvent::CurrentSlice {
            slice_id: slice.id(),
        });
        Some(slice)
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.view.read().display_mode
    }

    pub fn set_display_mode(&self, mode: DisplayMode) {
        let old = std::mem::replace(&mut self.view.write().display_mode, mode);
        if old != mode {
            info!("Display mode {old} -> {mode}");
            self.events.emit(SessionEvent::ModeChanged { old, new: mode });
        }
    }

    pub fn next_mode(&self) {
        self.set_display_mode(self.display_mode().next());
    }

    pub fn slice_display_mode(&self) -> SliceDisplayMode {
        self.view.read().slice_display_mode
    }

    pub fn set_slice_display_mode(&self, mode: SliceDisplayMode) {
        let old = std::mem::replace(&mut self.view.write().slice_display_mode, mode);
        if old != mode {
            self.events
                .emit(SessionEvent::SliceDisplayModeChanged { old, new: mode });
        }
    }

    pub fn overlap_mode(&self) -> OverlapMode {
        self.view.read().overlap_mode
    }

    pub fn set_overlap_mode(&self, mode: OverlapMode) {
        let old = std::mem::replace(&mut self.view.write().overlap_mode, mode);
        if old != mode {
            self.events
                .emit(SessionEvent::OverlapModeChanged { old, new: mode });
        }
        self.update_offsets();
    }

    pub fn toggle_overlap(&self) {
        self.set_overlap_mode(self.overlap_mode().toggled());
    }

    /// Recomputes the vertical offset of every slice.
    pub fn update_offsets(&self) {
        let sorted = self.sorted_slices();
        let positions: Vec<f64> = sorted.iter().map(|slice| slice.axis_position()).collect();
        let offsets = axis::overlap_offsets(&positions, &self.geometry, self.overlap_mode());
        for (slice, y_shift) in sorted.iter().zip(offsets) {
            slice.set_y_shift(y_shift);
        }
    }

    /// Display settings of `channel` on the first selected slice having it.
    pub fn channel_bound_for_selected(&self, channel: usize) -> Option<DisplaySettings> {
        self.selected_slices()
            .iter()
            .find_map(|slice| slice.display_settings().get(channel).copied())
    }
}

/// Spreads the slices between the first and the last at uniform spacing.
/// `selected` must be sorted; fewer than three slices plan nothing.
pub fn equal_spacing(selected: &[Arc<Slice>]) -> Vec<PlannedMove> {
    if selected.len() < 3 {
        return Vec::new();
    }
    let first = selected[0].axis_position();
    let last = selected[selected.len() - 1].axis_position();
    let delta = (last - first) / (selected.len() - 1) as f64;
    selected[1..selected.len() - 1]
        .iter()
        .enumerate()
        .map(|(i, slice)| (Arc::clone(slice), first + (i + 1) as f64 * delta))
        .collect()
}

/// Widens the range by one step on `side`, the opposite end stays fixed.
pub fn stretch(selected: &[Arc<Slice>], side: Side, step_size: f64) -> Vec<PlannedMove> {
    rescale(selected, side, step_size)
}

pub fn shrink(selected: &[Arc<Slice>], side: Side, step_size: f64) -> Vec<PlannedMove> {
    rescale(selected, side, -step_size)
}

fn rescale(selected: &[Arc<Slice>], side: Side, delta: f64) -> Vec<PlannedMove> {
    let (Some(first), Some(last)) = (selected.first(), selected.last()) else {
        return Vec::new();
    };
    let start = first.axis_position();
    let end = last.axis_position();
    let range = end - start;
    if range == 0.0 {
        return Vec::new();
    }
    let ratio = (range + delta) / range;
    selected
        .iter()
        .map(|slice| {
            let position = slice.axis_position();
            let target = match side {
                Side::Right => start + (position - start) * ratio,
                Side::Left => end - (end - position) * ratio,
            };
            (Arc::clone(slice), target)
        })
        .collect()
}

pub fn shift(selected: &[Arc<Slice>], direction: Direction, step_size: f64) -> Vec<PlannedMove> {
    let delta = match direction {
        Direction::Up => step_size,
        Direction::Down => -step_size,
    };
    selected
        .iter()
        .map(|slice| (Arc::clone(slice), slice.axis_position() + delta))
        .collect()
}
