use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;

use KeelDB::meta::read_meta;
use KeelDB::metrics;
use KeelDB::EnvBuilder;

use crate::util::{ensure_root, keys_for, print_json};

pub fn exec(path: PathBuf, json: bool) -> Result<()> {
    ensure_root(&path)?;
    let m = read_meta(&path)?;

    // статус ничего не апгрейдит и не делает checkpoint при закрытии
    let mut b = EnvBuilder::new().auto_schema_upgrade(false).flush_on_close(false);
    if let Some(keys) = keys_for(&path)? {
        b = b.encrypted(keys);
    }
    let env = b.open(&path)?;
    let hdr = env.env_header()?;
    let stats = env.stats();
    let recovery = env.recovery_report().clone();
    let ms = metrics::snapshot();
    let current = env.storage_type().current_version();

    if json {
        let v = json!({
            "meta": {
                "version": m.version,
                "page_size": m.page_size,
                "flags": m.flags,
                "storage_type": m.storage_type,
                "next_page_number": m.next_page_number,
                "last_flushed_tx": m.last_flushed_tx,
                "clean_shutdown": m.clean_shutdown,
            },
            "env_header": hdr,
            "schema": {
                "version": hdr.schema_version,
                "current": current,
                "up_to_date": hdr.schema_version == current,
            },
            "stats": stats,
            "recovery": recovery,
            "metrics": ms,
        });
        return print_json(&v);
    }

    println!("KeelDB status at {}", path.display());
    println!("  meta:");
    println!("    version          = {}", m.version);
    println!("    page_size        = {}", m.page_size);
    println!("    encrypted        = {}", m.is_encrypted());
    println!("    next_page_number = {}", m.next_page_number);
    println!("    last_flushed_tx  = {}", m.last_flushed_tx);
    println!("    clean_shutdown   = {}", m.clean_shutdown);
    println!("  environment:");
    println!("    storage_type     = {}", hdr.storage_type);
    println!("    schema_version   = {} (current {})", hdr.schema_version, current);
    println!("    features         = {:#06x}", hdr.features);
    println!("    tree root        = page {} depth {} pages {}", hdr.root.root_page, hdr.root.depth, hdr.root.page_count);
    println!("    last_committed   = {}", stats.last_committed_tx);
    println!("    allocated_pages  = {}", stats.allocated_pages);
    println!("    journal_bytes    = {}", stats.journal_bytes);
    println!("  recovery on open:");
    println!("    applied={} skipped={} last_tx={}", recovery.applied, recovery.skipped, recovery.last_tx_id);
    if let Some(t) = &recovery.truncation {
        println!("    torn record #{} at offset {}: {}", t.record_index, t.offset, t.reason);
    }
    println!("  metrics:");
    println!("    journal_commits      = {}", ms.journal_commits);
    println!("    journal_replayed_tx  = {}", ms.journal_replayed_tx);
    println!("    pages_decrypted      = {}", ms.pages_decrypted);
    println!("    integrity_failures   = {}", ms.integrity_failures);
    Ok(())
}
