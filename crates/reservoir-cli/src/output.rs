//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde_json::Value;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print a `{"count", "rows"}` result document
    pub fn print_result_set(&self, doc: &Value) {
        let rows = doc["rows"].as_array().map(Vec::as_slice).unwrap_or(&[]);
        match self.format {
            OutputFormat::Human => {
                if rows.is_empty() {
                    println!("No rows found.");
                    return;
                }
                for row in rows {
                    println!("{}", truncate(&row.to_string(), 120));
                }
                println!("\n{} row(s)", rows.len());
            }
            OutputFormat::Json => print_pretty(doc),
            OutputFormat::Quiet => {
                for row in rows {
                    println!("{}", row);
                }
            }
        }
    }

    /// Report how many rows an operation touched
    pub fn print_count(&self, verb: &str, count: usize) {
        match self.format {
            OutputFormat::Human => println!("✓ {} {} row(s)", verb, count),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "action": verb, "count": count})
                );
            }
            OutputFormat::Quiet => println!("{}", count),
        }
    }

    /// Print a purge result document
    pub fn print_purge(&self, doc: &Value) {
        match self.format {
            OutputFormat::Human => {
                println!("Purge ({})", doc["method"].as_str().unwrap_or("unknown"));
                println!("  Removed:         {}", doc["removed"]);
                println!("  Remaining:       {}", doc["readings"]);
                println!("  Unsent retained: {}", doc["unsentRetained"]);
                match (doc["minId"].as_u64(), doc["maxId"].as_u64()) {
                    (Some(min), Some(max)) => println!("  Id range:        {}..={}", min, max),
                    _ => println!("  Id range:        (empty)"),
                }
            }
            OutputFormat::Json => print_pretty(doc),
            OutputFormat::Quiet => println!("{}", doc["removed"]),
        }
    }

    /// Print a table's snapshot list
    pub fn print_snapshots(&self, doc: &Value) {
        let rows = doc["rows"].as_array().map(Vec::as_slice).unwrap_or(&[]);
        match self.format {
            OutputFormat::Human => {
                if rows.is_empty() {
                    println!("No snapshots found.");
                    return;
                }
                for row in rows {
                    println!(
                        "{} | {}",
                        row["created"].as_str().unwrap_or(""),
                        row["id"].as_str().unwrap_or("")
                    );
                }
                println!("\n{} snapshot(s)", rows.len());
            }
            OutputFormat::Json => print_pretty(doc),
            OutputFormat::Quiet => {
                for row in rows {
                    println!("{}", row["id"].as_str().unwrap_or(""));
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn print_pretty(doc: &Value) {
    match serde_json::to_string_pretty(doc) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", doc),
    }
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
