//! Config command handlers

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use reservoir_core::Config;

use crate::output::{Output, OutputFormat};

/// Load configuration, honoring a `--config` override
pub fn load(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load_from_path(&path.to_path_buf()),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

fn effective_path(config_path: Option<&Path>) -> PathBuf {
    config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_file_path)
}

/// Show current configuration
pub fn show(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let config = load(config_path)?;

    match output.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_value(&config)?);
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:         {}", config.data_dir.display());
            println!("  backend:          {}", config.backend);
            println!("  default_schema:   {}", config.default_schema);
            println!("  pool_size:        {}", config.pool_size);
            println!(
                "  max_connections:  {}",
                config
                    .max_connections
                    .map(|max| max.to_string())
                    .unwrap_or_else(|| "(unbounded)".to_string())
            );
            println!("  connect_retries:  {}", config.connect_retries);
            println!("  retry_backoff_ms: {}", config.retry_backoff_ms);
            println!("  busy_timeout_ms:  {}", config.busy_timeout_ms);
            println!();
            println!("Config file: {}", effective_path(config_path).display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: &str, value: &str, config_path: Option<&Path>, output: &Output) -> Result<()> {
    let mut config = load(config_path)?;
    config.set(key, value)?;

    let path = effective_path(config_path);
    config.save_to(&path)?;

    output.success(&format!("Set {} = {}", key, value));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_writes_override_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let output = Output::new(OutputFormat::Quiet);

        set("pool_size", "9", Some(path.as_path()), &output).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("pool_size = 9"));

        assert!(set("no_such_key", "1", Some(path.as_path()), &output).is_err());
    }
}
