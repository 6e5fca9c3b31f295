//! Status command handler

use anyhow::Result;

use reservoir_core::{Config, Store};

use crate::output::{Output, OutputFormat};

/// Show status information
pub fn show(store: &Store, config: &Config, output: &Output) -> Result<()> {
    let info = store.info();
    let caps = info.capabilities;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "backend": info.backend,
                    "default_schema": info.default_schema,
                    "data_dir": config.data_dir,
                    "capabilities": caps,
                    "pool": info.pool,
                    "last_error": store.last_error()
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", info.backend);
        }
        OutputFormat::Human => {
            println!("Reservoir Status");
            println!("================");
            println!();
            println!("Backend:        {}", info.backend);
            println!("Default schema: {}", info.default_schema);
            println!("Data directory: {}", config.data_dir.display());
            println!();
            println!("Capabilities:");
            println!("  Tables:        {}", yes_no(caps.supports_common_tables()));
            println!("  Readings:      {}", yes_no(caps.supports_readings()));
            println!("  Purge by rows: {}", yes_no(caps.supports_purge_by_rows()));
            println!("  Snapshots:     {}", yes_no(caps.supports_snapshots()));
            println!("  Schemas:       {}", yes_no(caps.supports_schemas()));
            println!();
            println!("Pool:");
            println!("  Idle:   {}", info.pool.idle);
            println!("  In use: {}", info.pool.in_use);
            println!(
                "  Max:    {}",
                config
                    .max_connections
                    .map(|max| max.to_string())
                    .unwrap_or_else(|| "(unbounded)".to_string())
            );
            if let Some(record) = store.last_error() {
                println!();
                println!("Last error: {} in {}: {}", record.code, record.operation, record.message);
            }
        }
    }

    Ok(())
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}
