use std::path::Path;

use crate::services::artifact::{Transform, verify_file};

pub fn cmd_verify(path: &Path) -> anyhow::Result<()> {
    let manifest = verify_file(path)
        .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;

    let transforms: Vec<&str> = manifest
        .transforms
        .iter()
        .map(|t| match t {
            Transform::Zstd => "zstd",
            Transform::Aes256Gcm => "aes-256-gcm",
        })
        .collect();

    println!("✓ {} is intact", path.display());
    println!("{:-<60}", "");
    println!("  Backup:      #{} ({})", manifest.backup_id, manifest.backup_type);
    println!(
        "  Server:      {} (ID: {})",
        manifest.server_name, manifest.server_id
    );
    println!("  Created:     {}", manifest.created_at);
    println!("  Entries:     {}", manifest.entry_count);
    if let Some(parent) = manifest.parent_backup_id {
        println!("  Parent:      #{parent}");
    }
    if let Some(since) = manifest.since {
        println!("  Since:       {since}");
    }
    println!(
        "  Transforms:  {}",
        if transforms.is_empty() {
            "none".to_string()
        } else {
            transforms.join(" -> ")
        }
    );
    println!("  Payload:     {} bytes", manifest.payload_size);
    println!("  SHA-256:     {}", manifest.payload_sha256);

    Ok(())
}
