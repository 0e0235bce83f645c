pub mod aligner;
pub mod axis;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod image;
pub mod manual_lock;
pub mod pipeline;
pub mod registration;
pub mod session;
pub mod slice;
pub mod state;
pub mod undo_stack;

#[cfg(test)]
mod tests;

pub mod prelude {
    pub use crate::aligner::Aligner;
    pub use crate::axis::{AtlasGeometry, DisplayMode, OverlapMode};
    pub use crate::config::{AlignerConfig, AtlasRotation};
    pub use crate::error::{CommandError, ConfigError, PipelineError, StateError};
    pub use crate::event::SessionEvent;
    pub use crate::image::{ImageHandle, ImageSet, SourceId, SourcesProcessor};
    pub use crate::registration::{
        AffineRegistration, Registration, RegistrationParameters, RegistrationRegistry,
    };
    pub use crate::session::{Direction, Side, SliceDisplayMode};
    pub use crate::slice::{DisplaySettings, RotationAxis, Slice, SliceId};
}
