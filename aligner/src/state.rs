use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{FileFormat, FloatExt};
use glam::DAffine3;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::aligner::Aligner;
use crate::axis::{DisplayMode, OverlapMode};
use crate::command::{Command, CommandKind};
use crate::config::AtlasRotation;
use crate::error::{CommandError, StateError};
use crate::event::SessionEvent;
use crate::image::{ImageHandle, ImageSet, SourceId, SourcesProcessor};
use crate::pipeline::{RegistrationStage, StageOutcome};
use crate::registration::{Registration, RegistrationParameters};
use crate::session::SliceDisplayMode;
use crate::slice::{DisplaySettings, Slice, SliceId};

pub type Result<T> = std::result::Result<T, StateError>;

const SOURCES_SUFFIX: &str = "_sources.json";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub source: SourceId,
    pub channel: usize,
    pub transform: DAffine3,
}

impl From<&ImageHandle> for SourceDescriptor {
    fn from(handle: &ImageHandle) -> Self {
        Self {
            source: handle.source,
            channel: handle.channel,
            transform: handle.transform,
        }
    }
}

impl From<&SourceDescriptor> for ImageHandle {
    fn from(descriptor: &SourceDescriptor) -> Self {
        Self {
            source: descriptor.source,
            channel: descriptor.channel,
            transform: descriptor.transform,
        }
    }
}

/// Companion document listing the source images referenced by index from
/// the state document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcesDocument {
    pub sources: Vec<SourceDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PersistedCommand {
    CreateSlice {
        sources: Vec<usize>,
        axis_position: f64,
    },
    MoveSlice {
        axis_position: f64,
    },
    RegisterSlice {
        registration: String,
        #[serde(default)]
        parameters: RegistrationParameters,
        #[serde(default)]
        solved_state: RegistrationParameters,
        #[serde(default)]
        preprocess_fixed: SourcesProcessor,
        #[serde(default)]
        preprocess_moving: SourcesProcessor,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceRecord {
    pub actions: Vec<PersistedCommand>,
    pub channels_visibility: Vec<bool>,
    pub settings_per_channel: Vec<DisplaySettings>,
    pub pre_transform: DAffine3,
    pub slice_visible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignerState {
    pub display_mode: DisplayMode,
    #[serde(default)]
    pub slice_display_mode: SliceDisplayMode,
    pub overlap_mode: OverlapMode,
    pub current_index: usize,
    pub rotation_x: f64,
    pub rotation_y: f64,
    pub slices: Vec<SliceRecord>,
}

#[derive(Debug, Default)]
pub struct SaveReport {
    pub saved: usize,
    /// Slices left out of the document, with the reason.
    pub skipped: Vec<(SliceId, String)>,
    pub sources_path: PathBuf,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub slices: Vec<Arc<Slice>>,
    pub warnings: Vec<String>,
}

/// `<dir>/<stem>_sources.json` next to the state document.
pub fn sources_path(state_path: &Path) -> PathBuf {
    let stem = state_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    state_path.with_file_name(format!("{stem}{SOURCES_SUFFIX}"))
}

/// Reduces a slice history to the commands needed to rebuild it: creation,
/// moves and applied registrations. A removal of the last registration
/// cancels the most recent registration kept so far.
pub fn filter_commands(slice_id: SliceId, history: &[Arc<Command>]) -> Result<Vec<Arc<Command>>> {
    match history.first().map(|command| command.as_ref()) {
        Some(Command::CreateSlice { .. }) => {}
        _ => {
            error!(slice = %slice_id, "First action of the slice is not its creation");
            return Err(StateError::FirstCommandNotCreate {
                slice: slice_id.to_string(),
            });
        }
    }

    let mut kept: Vec<Arc<Command>> = Vec::with_capacity(history.len());
    for command in history {
        match command.as_ref() {
            Command::CreateSlice { .. } | Command::MoveSlice { .. } => {
                kept.push(Arc::clone(command));
            }
            Command::RegisterSlice { stage, .. } => {
                if stage.outcome() == StageOutcome::Applied {
                    kept.push(Arc::clone(command));
                } else {
                    debug!(slice = %slice_id, "Registration `{}` not applied, not saved", stage.name());
                }
            }
            Command::RemoveLastRegistration { .. } => {
                let last_registration = kept
                    .iter()
                    .rposition(|command| command.kind() == CommandKind::RegisterSlice);
                match last_registration {
                    Some(position) => {
                        kept.remove(position);
                    }
                    None => {
                        error!(slice = %slice_id, "Registration removal without a registration to remove");
                    }
                }
            }
            Command::ExportRegions { .. } | Command::DeleteSlice { .. } | Command::BatchMarker => {}
        }
    }
    Ok(kept)
}

fn persist(command: &Command, sources: &mut SourcesDocument) -> Option<PersistedCommand> {
    match command {
        Command::CreateSlice {
            slice,
            axis_position,
            ..
        } => {
            let first = sources.sources.len();
            sources
                .sources
                .extend(slice.sources().iter().map(SourceDescriptor::from));
            Some(PersistedCommand::CreateSlice {
                sources: (first..sources.sources.len()).collect(),
                axis_position: *axis_position,
            })
        }
        Command::MoveSlice { to, .. } => Some(PersistedCommand::MoveSlice { axis_position: *to }),
        Command::RegisterSlice { stage, .. } => Some(PersistedCommand::RegisterSlice {
            registration: stage.name().to_string(),
            parameters: stage.parameters(),
            solved_state: stage.solved_state(),
            preprocess_fixed: stage.preprocess_fixed().clone(),
            preprocess_moving: stage.preprocess_moving().clone(),
        }),
        _ => None,
    }
}

enum PlannedStep {
    Move(f64),
    Register {
        registration: Box<dyn Registration>,
        preprocess_fixed: SourcesProcessor,
        preprocess_moving: SourcesProcessor,
    },
}

struct SlicePlan {
    sources: ImageSet,
    axis_position: f64,
    steps: Vec<PlannedStep>,
}

impl Aligner {
    /// Waits for every pipeline, then writes the state document at `path`
    /// and its sources document next to it.
    pub async fn save_state(&self, path: impl AsRef<Path>) -> Result<SaveReport> {
        let path = path.as_ref();
        let format = FileFormat::from_file_name(path)?;
        if self.session.is_empty() {
            warn!("No slices are present, nothing to save");
            return Err(StateError::NothingToSave);
        }
        self.wait_for_tasks().await;

        let mut report = SaveReport::default();
        let mut sources = SourcesDocument::default();
        let mut records = Vec::new();
        {
            let commands = self.commands.lock().await;
            for slice in self.session.sorted_slices() {
                let history = commands.slice_history(slice.id());
                let kept = match filter_commands(slice.id(), &history) {
                    Ok(kept) => kept,
                    Err(err) => {
                        report.skipped.push((slice.id(), err.to_string()));
                        continue;
                    }
                };
                records.push(SliceRecord {
                    actions: kept
                        .iter()
                        .filter_map(|command| persist(command, &mut sources))
                        .collect(),
                    channels_visibility: slice.channels_visibility(),
                    settings_per_channel: slice.display_settings(),
                    pre_transform: slice.pre_transform(),
                    slice_visible: slice.is_visible(),
                });
            }
        }

        let rotation = self.rotation();
        let state = AlignerState {
            display_mode: self.session.display_mode(),
            slice_display_mode: self.session.slice_display_mode(),
            overlap_mode: self.session.overlap_mode(),
            current_index: self.session.current_index(),
            rotation_x: rotation.rotation_x,
            rotation_y: rotation.rotation_y,
            slices: records,
        };

        let sources_path = sources_path(path);
        std::fs::write(&sources_path, common::serialize(&sources, FileFormat::Json)?)?;
        std::fs::write(path, common::serialize(&state, format)?)?;

        report.saved = state.slices.len();
        report.sources_path = sources_path;
        info!(
            "Saved {} slices to {} ({} skipped)",
            report.saved,
            path.display(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Rebuilds the slices of a saved state on top of the current session.
    /// Both documents are read and validated before anything is applied.
    pub async fn load_state(&self, path: impl AsRef<Path>) -> Result<LoadReport> {
        let path = path.as_ref();
        let format = FileFormat::from_file_name(path)?;
        let sources_path = sources_path(path);
        if !sources_path.exists() {
            error!("Sources file {} not found", sources_path.display());
            return Err(StateError::MissingSources(sources_path));
        }
        let sources: SourcesDocument =
            common::deserialize(&std::fs::read(&sources_path)?, FileFormat::Json)?;
        let state: AlignerState = common::deserialize(&std::fs::read(path)?, format)?;
        let plans = self.plan_slices(&state, &sources)?;

        self.wait_for_tasks().await;
        let mut report = LoadReport::default();

        let current = self.rotation();
        if !current.rotation_x.approximately_eq(state.rotation_x)
            || !current.rotation_y.approximately_eq(state.rotation_y)
        {
            let message = format!(
                "Atlas rotation ({:.4}, {:.4}) differs from the saved one ({:.4}, {:.4}), the saved rotation is used",
                current.rotation_x, current.rotation_y, state.rotation_x, state.rotation_y
            );
            warn!("{message}");
            self.events.emit(SessionEvent::Warning {
                title: "Atlas rotation changed".to_string(),
                message: message.clone(),
            });
            report.warnings.push(message);
        }
        self.set_rotation(AtlasRotation {
            rotation_x: state.rotation_x,
            rotation_y: state.rotation_y,
        });
        self.session.set_display_mode(state.display_mode);
        self.session.set_slice_display_mode(state.slice_display_mode);
        self.session.set_overlap_mode(state.overlap_mode);

        for plan in plans {
            let slice = self.create_slice(plan.sources, plan.axis_position).await?;
            for step in plan.steps {
                match step {
                    PlannedStep::Move(axis_position) => {
                        self.move_slice(&slice, axis_position).await?;
                    }
                    PlannedStep::Register {
                        registration,
                        preprocess_fixed,
                        preprocess_moving,
                    } => {
                        let stage = RegistrationStage::replay(
                            registration,
                            slice.axis_position(),
                            preprocess_fixed,
                            preprocess_moving,
                        );
                        self.execute(Command::register(Arc::clone(&slice), stage))
                            .await?;
                    }
                }
            }
            report.slices.push(slice);
        }
        self.wait_for_tasks().await;

        for (slice, record) in report.slices.iter().zip(state.slices.iter()) {
            slice.set_channels_visibility(&record.channels_visibility);
            slice.set_all_display_settings(&record.settings_per_channel);
            slice.set_visible(record.slice_visible);
            slice
                .set_pre_transform(record.pre_transform)
                .map_err(CommandError::from)?;
        }
        self.session.update_offsets();
        self.session.set_current_index(state.current_index);

        info!(
            "Loaded {} slices from {}",
            report.slices.len(),
            path.display()
        );
        Ok(report)
    }

    fn plan_slices(
        &self,
        state: &AlignerState,
        sources: &SourcesDocument,
    ) -> Result<Vec<SlicePlan>> {
        let count = sources.sources.len();
        let mut plans = Vec::with_capacity(state.slices.len());

        for (slice_index, record) in state.slices.iter().enumerate() {
            let mut actions = record.actions.iter();
            let Some(PersistedCommand::CreateSlice {
                sources: indices,
                axis_position,
            }) = actions.next()
            else {
                error!("Saved slice #{slice_index} does not start with its creation");
                return Err(StateError::FirstCommandNotCreate {
                    slice: format!("#{slice_index}"),
                });
            };

            let images = indices
                .iter()
                .map(|&index| {
                    sources
                        .sources
                        .get(index)
                        .map(ImageHandle::from)
                        .ok_or(StateError::SourceIndexOutOfRange { index, count })
                })
                .collect::<Result<ImageSet>>()?;

            let mut steps = Vec::new();
            for action in actions {
                match action {
                    PersistedCommand::CreateSlice { .. } => {
                        return Err(StateError::Format(anyhow::anyhow!(
                            "saved slice #{slice_index} is created twice"
                        )));
                    }
                    PersistedCommand::MoveSlice { axis_position } => {
                        steps.push(PlannedStep::Move(*axis_position));
                    }
                    PersistedCommand::RegisterSlice {
                        registration,
                        parameters,
                        solved_state,
                        preprocess_fixed,
                        preprocess_moving,
                    } => {
                        let mut restored = self
                            .registry
                            .create(registration, parameters)
                            .ok_or_else(|| StateError::UnknownRegistration(registration.clone()))?;
                        restored.restore_solved_state(solved_state).map_err(|err| {
                            StateError::RegistrationState {
                                name: registration.clone(),
                                message: err.to_string(),
                            }
                        })?;
                        steps.push(PlannedStep::Register {
                            registration: restored,
                            preprocess_fixed: preprocess_fixed.clone(),
                            preprocess_moving: preprocess_moving.clone(),
                        });
                    }
                }
            }

            plans.push(SlicePlan {
                sources: images,
                axis_position: *axis_position,
                steps,
            });
        }
        Ok(plans)
    }
}
