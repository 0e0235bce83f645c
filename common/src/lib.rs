#[macro_use]
pub mod macros;
pub mod file_format;
pub mod float_ext;
pub mod log_setup;
pub mod normalize_string;
pub mod serde;
pub mod shared;

pub use file_format::{FileExtensionError, FileFormat};
pub use float_ext::FloatExt;
pub use log_setup::setup_logging;
pub use crate::serde::{deserialize, serialize};
pub use shared::Shared;

pub const EPSILON: f64 = 1e-6;

pub fn is_debug() -> bool {
    cfg!(debug_assertions)
}
