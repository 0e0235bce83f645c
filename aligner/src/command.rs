use std::sync::Arc;

use parking_lot::Mutex;
use strum_macros::Display;
use tracing::{debug, info};

use crate::error::CommandError;
use crate::event::SessionEvent;
use crate::pipeline::{AppliedStage, RegistrationStage};
use crate::session::SliceCollection;
use crate::slice::Slice;

pub type Result<T> = std::result::Result<T, CommandError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum CommandKind {
    #[strum(to_string = "Create Slice")]
    CreateSlice,
    #[strum(to_string = "Move Slice")]
    MoveSlice,
    #[strum(to_string = "Register Slice")]
    RegisterSlice,
    #[strum(to_string = "Delete Slice")]
    DeleteSlice,
    #[strum(to_string = "Delete Last Registration")]
    RemoveLastRegistration,
    #[strum(to_string = "Export Slice Regions")]
    ExportRegions,
    #[strum(to_string = "Batch")]
    BatchMarker,
}

/// Reversible mutation of the session.
///
/// Commands touching slice content wait for that slice's pipeline to drain
/// before mutating it. State captured while applying (insertion index,
/// removed snapshots) is kept so that undo and redo are exact inverses.
#[derive(Debug)]
pub enum Command {
    CreateSlice {
        slice: Arc<Slice>,
        axis_position: f64,
        index: Mutex<Option<usize>>,
    },
    MoveSlice {
        slice: Arc<Slice>,
        from: f64,
        to: f64,
    },
    RegisterSlice {
        slice: Arc<Slice>,
        stage: Arc<RegistrationStage>,
        undone: Mutex<Option<AppliedStage>>,
    },
    DeleteSlice {
        slice: Arc<Slice>,
        index: Mutex<Option<usize>>,
    },
    RemoveLastRegistration {
        slice: Arc<Slice>,
        removed: Mutex<Option<AppliedStage>>,
    },
    ExportRegions {
        slice: Arc<Slice>,
        target: String,
    },
    BatchMarker,
}

impl Command {
    pub fn create(slice: Arc<Slice>) -> Self {
        Command::CreateSlice {
            axis_position: slice.axis_position(),
            slice,
            index: Mutex::new(None),
        }
    }

    pub fn move_slice(slice: Arc<Slice>, to: f64) -> Self {
        Command::MoveSlice {
            from: slice.axis_position(),
            slice,
            to,
        }
    }

    pub fn register(slice: Arc<Slice>, stage: Arc<RegistrationStage>) -> Self {
        Command::RegisterSlice {
            slice,
            stage,
            undone: Mutex::new(None),
        }
    }

    pub fn delete(slice: Arc<Slice>) -> Self {
        Command::DeleteSlice {
            slice,
            index: Mutex::new(None),
        }
    }

    pub fn remove_last_registration(slice: Arc<Slice>) -> Self {
        Command::RemoveLastRegistration {
            slice,
            removed: Mutex::new(None),
        }
    }

    pub fn export_regions(slice: Arc<Slice>, target: impl Into<String>) -> Self {
        Command::ExportRegions {
            slice,
            target: target.into(),
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::CreateSlice { .. } => CommandKind::CreateSlice,
            Command::MoveSlice { .. } => CommandKind::MoveSlice,
            Command::RegisterSlice { .. } => CommandKind::RegisterSlice,
            Command::DeleteSlice { .. } => CommandKind::DeleteSlice,
            Command::RemoveLastRegistration { .. } => CommandKind::RemoveLastRegistration,
            Command::ExportRegions { .. } => CommandKind::ExportRegions,
            Command::BatchMarker => CommandKind::BatchMarker,
        }
    }

    pub fn is_batch_marker(&self) -> bool {
        matches!(self, Command::BatchMarker)
    }

    pub fn slice(&self) -> Option<&Arc<Slice>> {
        match self {
            Command::CreateSlice { slice, .. }
            | Command::MoveSlice { slice, .. }
            | Command::RegisterSlice { slice, .. }
            | Command::DeleteSlice { slice, .. }
            | Command::RemoveLastRegistration { slice, .. }
            | Command::ExportRegions { slice, .. } => Some(slice),
            Command::BatchMarker => None,
        }
    }

    pub(crate) async fn apply(&self, session: &SliceCollection) -> Result<()> {
        match self {
            Command::CreateSlice { slice, index, .. } => {
                let index = *index.lock();
                session.insert(Arc::clone(slice), index);
            }
            Command::MoveSlice { slice, to, .. } => {
                slice.move_to(*to);
                session.update_offsets();
            }
            Command::RegisterSlice {
                slice,
                stage,
                undone,
            } => {
                let snapshot = undone.lock().take();
                match snapshot {
                    Some(applied) => {
                        slice.wait_for_end_of_tasks().await;
                        if let Err(err) = slice.pipeline().restore_stage(applied.clone()) {
                            *undone.lock() = Some(applied);
                            return Err(err.into());
                        }
                    }
                    None if stage.has_ended_unapplied() => {
                        debug!(slice = %slice.id(), "Registration `{}` ended without result, not queued again", stage.name());
                    }
                    None => slice.add_stage(Arc::clone(stage)),
                }
            }
            Command::DeleteSlice { slice, index } => {
                slice.wait_for_end_of_tasks().await;
                let removed = session
                    .remove(slice)
                    .ok_or(CommandError::UnknownSlice(slice.id()))?;
                *index.lock() = Some(removed);
            }
            Command::RemoveLastRegistration { slice, removed } => {
                slice.wait_for_end_of_tasks().await;
                let applied = slice.pipeline().remove_last_stage()?;
                info!(slice = %slice.id(), "Registration `{}` removed", applied.stage.name());
                *removed.lock() = Some(applied);
            }
            Command::ExportRegions { slice, target } => {
                session.events().emit(SessionEvent::ExportRequested {
                    slice_id: slice.id(),
                    target: target.clone(),
                });
            }
            Command::BatchMarker => {}
        }
        Ok(())
    }

    pub(crate) async fn undo(&self, session: &SliceCollection) -> Result<()> {
        match self {
            Command::CreateSlice { slice, index, .. } => {
                slice.wait_for_end_of_tasks().await;
                let removed = session
                    .remove(slice)
                    .ok_or(CommandError::UnknownSlice(slice.id()))?;
                *index.lock() = Some(removed);
            }
            Command::MoveSlice { slice, from, .. } => {
                slice.move_to(*from);
                session.update_offsets();
            }
            Command::RegisterSlice {
                slice,
                stage,
                undone,
            } => {
                slice.wait_for_end_of_tasks().await;
                if slice.pipeline().is_applied(stage.id()) {
                    let applied = slice.pipeline().remove_stage(stage.id())?;
                    *undone.lock() = Some(applied);
                } else {
                    debug!(slice = %slice.id(), "Registration `{}` left nothing to undo", stage.name());
                }
            }
            Command::DeleteSlice { slice, index } => {
                let index = *index.lock();
                session.insert(Arc::clone(slice), index);
            }
            Command::RemoveLastRegistration { slice, removed } => {
                let applied = removed.lock().take();
                if let Some(applied) = applied {
                    slice.wait_for_end_of_tasks().await;
                    if let Err(err) = slice.pipeline().restore_stage(applied.clone()) {
                        *removed.lock() = Some(applied);
                        return Err(err.into());
                    }
                }
            }
            Command::ExportRegions { .. } | Command::BatchMarker => {}
        }
        Ok(())
    }
}
