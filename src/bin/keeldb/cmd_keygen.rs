use anyhow::Result;

use KeelDB::StaticKeyProvider;

/// Случайный мастер-ключ для KEEL_MASTER_KEY_HEX.
pub fn exec(kid: String) -> Result<()> {
    let p = StaticKeyProvider::random(kid.clone());
    println!("KEEL_KEY_ID={}", kid);
    println!("KEEL_MASTER_KEY_HEX={}", p.key_hex());
    Ok(())
}
