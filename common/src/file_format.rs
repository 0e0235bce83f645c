use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum FileExtensionError {
    #[error("Failed to get file extension")]
    MissingFileExtension,
    #[error("Unsupported file extension for file: {0}")]
    UnsupportedFileExtension(String),
}

pub type FileFormatResult<T> = Result<T, FileExtensionError>;

pub fn get_file_extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|os_str| os_str.to_str())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    pub fn from_file_name(path: impl AsRef<Path>) -> FileFormatResult<Self> {
        let path = path.as_ref();
        let ext = get_file_extension(path).ok_or(FileExtensionError::MissingFileExtension)?;

        if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") {
            Ok(Self::Yaml)
        } else if ext.eq_ignore_ascii_case("json") {
            Ok(Self::Json)
        } else {
            Err(FileExtensionError::UnsupportedFileExtension(
                path.display().to_string(),
            ))
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Yaml => "yaml",
            FileFormat::Json => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_format_from_extension() {
        assert_eq!(
            FileFormat::from_file_name("state.JSON").unwrap(),
            FileFormat::Json
        );
        assert_eq!(
            FileFormat::from_file_name("config.yml").unwrap(),
            FileFormat::Yaml
        );
        assert!(matches!(
            FileFormat::from_file_name("state"),
            Err(FileExtensionError::MissingFileExtension)
        ));
        assert!(matches!(
            FileFormat::from_file_name("state.toml"),
            Err(FileExtensionError::UnsupportedFileExtension(_))
        ));
    }
}
