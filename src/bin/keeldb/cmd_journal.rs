use anyhow::Result;
use std::path::PathBuf;

use KeelDB::env::verify_journal;

use crate::util::{ensure_root, keys_for, print_json};

/// Dry-run проверка журнала: ничего не применяется и не усекается.
pub fn exec_verify(path: PathBuf, json: bool) -> Result<()> {
    ensure_root(&path)?;
    let keys = keys_for(&path)?;
    let report = verify_journal(&path, keys.as_deref())?;

    if json {
        return print_json(&report);
    }
    println!(
        "verify-journal: {} record(s) to apply, {} already flushed, last tx {}",
        report.applied, report.skipped, report.last_tx_id
    );
    match &report.truncation {
        Some(t) => println!(
            "  torn tail: record #{} at offset {} ({}); it will be truncated on next open",
            t.record_index, t.offset, t.reason
        ),
        None => println!("  no torn records"),
    }
    Ok(())
}
