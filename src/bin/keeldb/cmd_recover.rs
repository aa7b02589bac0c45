use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::PathBuf;

use KeelDB::env::recover_pages;

use crate::util::{ensure_root, keys_for, print_json};

pub fn exec(path: PathBuf, out: PathBuf, json: bool) -> Result<()> {
    ensure_root(&path)?;
    let keys = keys_for(&path)?;
    let f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&out)
        .with_context(|| format!("open {}", out.display()))?;
    let mut w = BufWriter::new(f);
    let report = recover_pages(&path, keys.as_deref(), &mut w)?;

    if json {
        return print_json(&report);
    }
    println!(
        "recover: {} run(s), {} page(s) -> {}",
        report.runs_exported,
        report.pages_exported,
        out.display()
    );
    if let (Some(st), Some(v)) = (report.storage_type, report.schema_version) {
        println!("  source: {} storage at schema {}", st, v);
    }
    if !report.failed_pages.is_empty() {
        println!("  {} page(s) failed verification: {:?}", report.failed_pages.len(), report.failed_pages);
    }
    if let Some(e) = &report.journal_error {
        println!("  journal: {}", e);
    }
    Ok(())
}
