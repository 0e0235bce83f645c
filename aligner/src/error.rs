use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::StageId;
use crate::slice::SliceId;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("Registration stage {stage} is still pending")]
    StagePending { stage: StageId },
    #[error("Registration stage {stage} is not the most recently applied stage")]
    NotLastStage { stage: StageId },
    #[error("Registration stage {stage} was never applied to this slice")]
    UnknownStage { stage: StageId },
    #[error("No registration to remove")]
    NothingToRemove,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    #[error("No slice selected: {operation} ignored")]
    NoSelection { operation: &'static str },
    #[error("Undo stack contains an unmatched batch marker")]
    UnmatchedBatchMarker,
    #[error("Slice {0} is not part of the session")]
    UnknownSlice(SliceId),
    #[error("Unknown registration `{0}`")]
    UnknownRegistration(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("No slices are present, nothing to save")]
    NothingToSave,
    #[error("Companion sources file {0} not found")]
    MissingSources(PathBuf),
    #[error("First action of slice {slice} is not a slice creation")]
    FirstCommandNotCreate { slice: String },
    #[error("Source index {index} is out of range ({count} sources)")]
    SourceIndexOutOfRange { index: usize, count: usize },
    #[error("Unknown registration `{0}` in saved state")]
    UnknownRegistration(String),
    #[error("Registration `{name}` could not restore its solved state: {message}")]
    RegistrationState { name: String, message: String },
    #[error(transparent)]
    FileExtension(#[from] common::FileExtensionError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("State serialization failed: {0}")]
    Format(#[from] anyhow::Error),
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid atlas geometry: {0}")]
    InvalidGeometry(String),
    #[error("Aligner must be created inside a tokio runtime")]
    NoRuntime,
}
