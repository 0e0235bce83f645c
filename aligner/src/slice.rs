use std::fmt::Write;
use std::sync::Arc;

use common::id_type;
use glam::{DAffine3, DVec3};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::axis::{self, AtlasGeometry, DisplayMode};
use crate::error::PipelineError;
use crate::event::{EventBus, SessionEvent};
use crate::image::ImageSet;
use crate::pipeline::{PipelineContext, RegistrationPipeline, RegistrationStage};

id_type!(SliceId);

pub const SELECTED_COLOR: [u8; 4] = [0, 255, 0, 200];
pub const UNSELECTED_COLOR: [u8; 4] = [255, 255, 0, 64];

/// Display range and color of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplaySettings {
    pub min: f64,
    pub max: f64,
    pub color: [u8; 4],
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 255.0,
            color: [255, 255, 255, 255],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationAxis {
    X,
    Y,
    Z,
}

#[derive(Debug)]
struct SliceState {
    axis_position: f64,
    selected: bool,
    visible: bool,
    channels_visibility: Vec<bool>,
    display_settings: Vec<DisplaySettings>,
    pre_transform: DAffine3,
    index: usize,
    y_shift: u32,
}

/// One physical section: its source images, where it sits on the slicing
/// axis, and the registrations applied to its content.
///
/// Identity is per allocation; two slices built from the same images are
/// distinct.
#[derive(Debug)]
pub struct Slice {
    id: SliceId,
    sources: ImageSet,
    state: RwLock<SliceState>,
    pipeline: RegistrationPipeline,
    events: EventBus,
}

impl Slice {
    pub(crate) fn new(sources: ImageSet, axis_position: f64, ctx: &PipelineContext) -> Arc<Self> {
        let id = SliceId::unique();
        let channel_count = sources.len();
        Arc::new(Self {
            id,
            pipeline: RegistrationPipeline::new(id, sources.clone(), ctx),
            sources,
            state: RwLock::new(SliceState {
                axis_position,
                selected: false,
                visible: true,
                channels_visibility: vec![true; channel_count],
                display_settings: vec![DisplaySettings::default(); channel_count],
                pre_transform: DAffine3::IDENTITY,
                index: 0,
                y_shift: 0,
            }),
            events: ctx.events.clone(),
        })
    }

    pub fn id(&self) -> SliceId {
        self.id
    }

    /// Source images as given at creation.
    pub fn sources(&self) -> &ImageSet {
        &self.sources
    }

    pub fn channel_count(&self) -> usize {
        self.sources.len()
    }

    pub fn axis_position(&self) -> f64 {
        self.state.read().axis_position
    }

    /// Moves the slice along the axis; registered content is untouched.
    pub fn move_to(&self, axis_position: f64) {
        self.state.write().axis_position = axis_position;
        self.events.emit(SessionEvent::PositionChanged {
            slice_id: self.id,
            axis_position,
        });
    }

    pub fn is_selected(&self) -> bool {
        self.state.read().selected
    }

    pub fn select(&self) -> bool {
        self.set_selected(true)
    }

    pub fn deselect(&self) -> bool {
        self.set_selected(false)
    }

    fn set_selected(&self, selected: bool) -> bool {
        {
            let mut state = self.state.write();
            if state.selected == selected {
                return false;
            }
            state.selected = selected;
        }
        self.events.emit(SessionEvent::SelectionChanged {
            slice_id: self.id,
            selected,
        });
        true
    }

    pub fn is_visible(&self) -> bool {
        self.state.read().visible
    }

    pub fn set_visible(&self, visible: bool) -> bool {
        {
            let mut state = self.state.write();
            if state.visible == visible {
                return false;
            }
            state.visible = visible;
        }
        self.events.emit(SessionEvent::VisibilityChanged {
            slice_id: self.id,
            visible,
        });
        true
    }

    pub fn channels_visibility(&self) -> Vec<bool> {
        self.state.read().channels_visibility.clone()
    }

    pub fn set_channel_visibility(&self, channel: usize, visible: bool) -> bool {
        let mut state = self.state.write();
        match state.channels_visibility.get_mut(channel) {
            Some(current) => {
                *current = visible;
                true
            }
            None => false,
        }
    }

    /// Missing entries keep their value, extra entries are ignored.
    pub fn set_channels_visibility(&self, visibility: &[bool]) {
        let mut state = self.state.write();
        for (current, &visible) in state.channels_visibility.iter_mut().zip(visibility) {
            *current = visible;
        }
    }

    pub fn display_settings(&self) -> Vec<DisplaySettings> {
        self.state.read().display_settings.clone()
    }

    pub fn set_display_settings(&self, channel: usize, settings: DisplaySettings) -> bool {
        let mut state = self.state.write();
        match state.display_settings.get_mut(channel) {
            Some(current) => {
                *current = settings;
                true
            }
            None => false,
        }
    }

    pub fn set_all_display_settings(&self, settings: &[DisplaySettings]) {
        let mut state = self.state.write();
        for (current, &new) in state.display_settings.iter_mut().zip(settings) {
            *current = new;
        }
    }

    pub fn display_color(&self) -> [u8; 4] {
        if self.is_selected() {
            SELECTED_COLOR
        } else {
            UNSELECTED_COLOR
        }
    }

    /// Rank in the last sort of the session.
    pub fn index(&self) -> usize {
        self.state.read().index
    }

    pub(crate) fn set_index(&self, index: usize) {
        self.state.write().index = index;
    }

    pub fn y_shift(&self) -> u32 {
        self.state.read().y_shift
    }

    pub(crate) fn set_y_shift(&self, y_shift: u32) {
        self.state.write().y_shift = y_shift;
    }

    pub fn placement_coordinate(&self, geometry: &AtlasGeometry, mode: DisplayMode) -> DVec3 {
        let state = self.state.read();
        axis::placement(state.axis_position, geometry, mode, state.y_shift)
    }

    /// Registered content composed with the placement for `mode`.
    pub fn placed_images(&self, geometry: &AtlasGeometry, mode: DisplayMode) -> ImageSet {
        let (axis_position, y_shift) = {
            let state = self.state.read();
            (state.axis_position, state.y_shift)
        };
        self.pipeline
            .current()
            .transformed(axis::placement_transform(axis_position, geometry, mode, y_shift))
    }

    pub fn pre_transform(&self) -> DAffine3 {
        self.state.read().pre_transform
    }

    /// Replaces the innermost source transform. The pipeline must be idle.
    pub fn set_pre_transform(&self, pre_transform: DAffine3) -> Result<(), PipelineError> {
        let mut state = self.state.write();
        self.pipeline
            .change_source_origin(state.pre_transform, pre_transform)?;
        state.pre_transform = pre_transform;
        Ok(())
    }

    pub fn transform_source_origin(&self, affine: DAffine3) -> Result<(), PipelineError> {
        let pre_transform = affine * self.pre_transform();
        self.set_pre_transform(pre_transform)
    }

    pub fn rotate_source_origin(
        &self,
        axis: RotationAxis,
        angle: f64,
    ) -> Result<(), PipelineError> {
        let rotation = match axis {
            RotationAxis::X => DAffine3::from_rotation_x(angle),
            RotationAxis::Y => DAffine3::from_rotation_y(angle),
            RotationAxis::Z => DAffine3::from_rotation_z(angle),
        };
        self.transform_source_origin(rotation)
    }

    pub fn pipeline(&self) -> &RegistrationPipeline {
        &self.pipeline
    }

    pub fn add_stage(&self, stage: Arc<RegistrationStage>) {
        self.pipeline.add_stage(stage);
    }

    pub fn registration_history(&self) -> Vec<Arc<RegistrationStage>> {
        self.pipeline.stages()
    }

    pub fn current_images(&self) -> ImageSet {
        self.pipeline.current()
    }

    pub async fn wait_for_end_of_tasks(&self) {
        self.pipeline.wait_for_end_of_tasks().await;
    }

    pub fn info(&self) -> String {
        let state = self.state.read();
        let mut info = String::new();
        let _ = writeln!(info, "Slice #{}", state.index);
        let _ = writeln!(info, "Position: {:.3}", state.axis_position);
        let _ = writeln!(info, "Channels: {}", self.sources.len());
        let stages = self.pipeline.stages();
        if stages.is_empty() {
            let _ = writeln!(info, "Registrations: none");
        } else {
            let names: Vec<&str> = stages.iter().map(|stage| stage.name()).collect();
            let _ = writeln!(info, "Registrations: {}", names.join(" > "));
        }
        let pending = self.pipeline.pending_stages().len();
        if pending > 0 {
            let _ = writeln!(info, "Pending: {pending}");
        }
        info
    }
}

impl PartialEq for Slice {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for Slice {}
