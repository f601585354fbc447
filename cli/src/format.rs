//! Terminal output for caskctl

use std::path::PathBuf;

use cask_core::{Columns, IndexInfo};
use colored::*;
use serde_json::{Value, json};

pub fn done(message: &str) {
    println!("{} {}", "ok".bright_green().bold(), message);
}

pub fn skipped(message: &str) {
    println!("{} {}", "skipped".yellow(), message);
}

pub fn pair(key: &[u8], value: &[u8]) {
    println!(
        "{}\t{}",
        String::from_utf8_lossy(key).bright_cyan(),
        String::from_utf8_lossy(value)
    );
}

pub fn record(pk: &[u8], record: &Columns) {
    println!("{}", String::from_utf8_lossy(pk).bright_cyan().bold());
    for (name, value) in record {
        println!("  {}: {}", name.cyan(), value);
    }
}

pub fn record_json(pk: &[u8], record: &Columns) -> Value {
    json!({
        "pk": String::from_utf8_lossy(pk),
        "columns": record,
    })
}

pub fn summary(count: usize) {
    let plural = if count == 1 { "" } else { "s" };
    println!("{}", format!("{count} record{plural}").dimmed());
}

pub fn inform(kind: &str, path: Option<PathBuf>, records: u64, size: u64) {
    let path = path.map_or_else(|| "-".to_string(), |p| p.display().to_string());
    println!("{:>8}  {}", "path".bright_cyan(), path);
    println!("{:>8}  {}", "kind".bright_cyan(), kind);
    println!("{:>8}  {}", "records".bright_cyan(), records);
    println!("{:>8}  {} bytes", "size".bright_cyan(), size);
}

pub fn indexes(indexes: &[IndexInfo]) {
    if indexes.is_empty() {
        println!("{}", "(no indexes)".dimmed());
        return;
    }
    for info in indexes {
        let state = if info.built {
            format!("{} terms", info.terms).normal()
        } else {
            "deferred".yellow()
        };
        println!(
            "{:>8}  {} ({}) {}",
            "index".bright_cyan(),
            info.column,
            info.kind.as_str(),
            state
        );
    }
}
