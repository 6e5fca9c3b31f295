//! Command handlers

pub mod config;
pub mod reading;
pub mod schema;
pub mod snapshot;
pub mod status;
pub mod table;

use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

use reservoir_core::StorageError;

/// Read a document argument: `-` is stdin, anything else a file path
pub fn read_input(source: &str) -> Result<String> {
    if source == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read from stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(Path::new(source))
        .with_context(|| format!("Failed to read file: {}", source))
}

/// Turn a store failure into a CLI error carrying its recovery hint
pub fn describe(err: StorageError) -> anyhow::Error {
    match err.recovery_suggestion() {
        Some(hint) => anyhow!("{} [{}]\n{}", err, err.code(), hint),
        None => anyhow!("{} [{}]", err, err.code()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_input_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{\"readings\": []}}").unwrap();

        let text = read_input(file.path().to_str().unwrap()).unwrap();
        assert_eq!(text, "{\"readings\": []}");
        assert!(read_input("/nonexistent/batch.json").is_err());
    }

    #[test]
    fn test_describe_includes_code_and_hint() {
        let err = describe(StorageError::NotSupported {
            operation: "purge_readings_by_rows",
            backend: "memory",
        });
        let text = err.to_string();
        assert!(text.contains("NotSupported"));
        assert!(text.contains("capabilities"));
    }
}
