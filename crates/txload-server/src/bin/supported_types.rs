// Prints the transaction type catalogue and the table each code lands in

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use txload_server::dispatch::{Dispatcher, SUPPORTED_TRANSACTION_TYPES};
use txload_server::schema::SchemaRegistry;

#[derive(Debug, Parser)]
#[command(name = "supported_types", about = "List supported transaction type codes")]
struct Args {
    /// Print the catalogue as JSON
    #[arg(long)]
    json: bool,

    /// Also print the CREATE TABLE statement of every table
    #[arg(long)]
    ddl: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let registry = Arc::new(SchemaRegistry::builtin());
    let dispatcher = Dispatcher::new(registry.clone())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(SUPPORTED_TRANSACTION_TYPES)?);
    } else {
        println!("{:>5}  {:<24} {}", "code", "table", "description");
        for supported in SUPPORTED_TRANSACTION_TYPES {
            let route = dispatcher.resolve(supported.code)?;
            println!("{:>5}  {:<24} {}", supported.code, route.table, supported.description);
        }
        println!();
        println!("{} codes across {} tables", SUPPORTED_TRANSACTION_TYPES.len(), registry.len());
    }

    if args.ddl {
        for schema in registry.tables() {
            println!();
            println!("{};", schema.create_table_sql());
        }
    }

    Ok(())
}
