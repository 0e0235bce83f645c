use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::axis::{AtlasGeometry, DisplayMode, OverlapMode};

/// Slicing-axis rotation correction applied to the atlas model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AtlasRotation {
    pub rotation_x: f64,
    pub rotation_y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignerConfig {
    pub atlas: AtlasGeometry,
    #[serde(default)]
    pub rotation: AtlasRotation,
    #[serde(default)]
    pub display_mode: DisplayMode,
    #[serde(default)]
    pub overlap_mode: OverlapMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_limit: Option<usize>,
}

impl Default for AlignerConfig {
    fn default() -> Self {
        Self {
            atlas: AtlasGeometry::default(),
            rotation: AtlasRotation::default(),
            display_mode: DisplayMode::default(),
            overlap_mode: OverlapMode::default(),
            undo_limit: None,
        }
    }
}

impl AlignerConfig {
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::info!("Using default config, {} not loaded: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let format = common::FileFormat::from_file_name(path)?;
        let serialized = std::fs::read(path)?;
        let config: AlignerConfig = common::deserialize(&serialized, format)?;
        config.atlas.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let format = common::FileFormat::from_file_name(path)?;
        std::fs::write(path, common::serialize(self, format)?)?;
        Ok(())
    }
}
