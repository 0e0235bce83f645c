use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::file_format::FileFormat;
use crate::normalize_string::NormalizeString;

pub type Result<T> = anyhow::Result<T>;

pub fn is_false(value: &bool) -> bool {
    !*value
}

pub fn serialize<T: Serialize>(value: &T, format: FileFormat) -> Result<Vec<u8>> {
    let text = match format {
        FileFormat::Yaml => serde_yml::to_string(value)?,
        FileFormat::Json => serde_json::to_string_pretty(value)?,
    };
    Ok(text.normalize().into_bytes())
}

pub fn deserialize<T: DeserializeOwned + 'static>(
    serialized: &[u8],
    format: FileFormat,
) -> Result<T> {
    let text = std::str::from_utf8(serialized)?;
    match format {
        FileFormat::Yaml => Ok(serde_yml::from_str(text)?),
        FileFormat::Json => Ok(serde_json::from_str(text)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: Vec<f64>,
        #[serde(default, skip_serializing_if = "is_false")]
        flag: bool,
    }

    #[test]
    fn both_formats_roundtrip() {
        let sample = Sample {
            name: "slice".to_string(),
            values: vec![0.5, -2.0],
            flag: true,
        };
        for format in [FileFormat::Yaml, FileFormat::Json] {
            let bytes = serialize(&sample, format).unwrap();
            assert!(bytes.ends_with(b"\n"));
            let restored: Sample = deserialize(&bytes, format).unwrap();
            assert_eq!(restored, sample);
        }
    }

    #[test]
    fn invalid_input_is_an_error() {
        let result: Result<Sample> = deserialize(b"{ not json", FileFormat::Json);
        assert!(result.is_err());
    }
}
