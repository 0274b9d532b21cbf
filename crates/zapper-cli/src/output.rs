//! Output formatting for CLI

use clap::ValueEnum;
use console::style;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Table,
}

/// Pretty-printed JSON on stdout
pub fn print_json<T: Serialize + ?Sized>(data: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

/// Rows rendered as a table on stdout
pub fn print_table<T: Tabled>(rows: impl IntoIterator<Item = T>) {
    println!("{}", Table::new(rows));
}

/// Availability label, red when offline
pub fn availability(offline: bool) -> String {
    if offline {
        style("offline").red().to_string()
    } else {
        style("online").green().to_string()
    }
}
