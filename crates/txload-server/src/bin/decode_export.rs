// Export decoding diagnostics
// Parses one export file locally, without FTP or a database

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::info;
use txload_common::logging::{init_logging, LogConfig, LogLevel};
use txload_server::dispatch::Dispatcher;
use txload_server::reader::ExportReader;
use txload_server::schema::SchemaRegistry;

#[derive(Debug, Parser)]
#[command(name = "decode_export", about = "Decode a terminal export file and report what would be loaded")]
struct Args {
    /// Export file to decode
    path: PathBuf,

    /// Source folder tag written into every record
    #[arg(long, default_value = "local/file")]
    source: String,

    /// Print the decoded records as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Warnings only so that stdout stays parseable with --json
    let log_config = LogConfig::builder()
        .level(LogLevel::Warn)
        .log_file_prefix("decode_export")
        .build()
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    let dispatcher = Dispatcher::new(Arc::new(SchemaRegistry::builtin()))?;
    let reader = ExportReader::new(Arc::new(dispatcher));

    info!(path = %args.path.display(), "Decoding export");
    let parsed = reader
        .parse_path(&args.path, &args.source)
        .with_context(|| format!("Failed to decode {}", args.path.display()))?;

    if args.json {
        let output = json!({
            "header": parsed.header,
            "line_count": parsed.line_count,
            "tables": parsed.tables,
            "diagnostics": parsed.diagnostics,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("File:              {}", args.path.display());
    println!("Processed:         {}", parsed.header.processed);
    println!("Source database:   {}", parsed.header.source_database_id);
    println!("Report number:     {}", parsed.header.report_number);
    println!("Data lines:        {}", parsed.line_count);
    println!("Records:           {}", parsed.record_count());
    println!();

    for (table, rows) in &parsed.tables {
        println!("  {:<24} {:>8}", table, rows.len());
    }

    if !parsed.diagnostics.is_empty() {
        println!();
        println!("Coerced fields:    {}", parsed.coerced_field_count());
        for line in &parsed.diagnostics {
            for field in &line.fields {
                println!("  line {:>6} {:<20} {}", line.line, line.table, field);
            }
        }
    }

    Ok(())
}
