//! Anonymous installation id with salted hashing
//!
//! Used as the default user id when the host never sets one: stable for a
//! given installation, unlinkable across machines because every install
//! hashes with its own random salt.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::config::get_state_dir;

/// Get or generate the anonymous installation id.
///
/// SHA-256 over a per-install uuid salt and the most stable machine
/// identifier available (MAC address, hostname fallback, fresh uuid as a
/// last resort), cached under `~/.beacon/telemetry/`.
pub fn get_or_generate_install_id() -> Result<String> {
    let state_dir = get_state_dir()?;
    cached_value(&state_dir.join("install_id"), || {
        let salt = cached_value(&state_dir.join("salt"), || {
            Ok(Uuid::new_v4().to_string())
        })?;

        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(machine_identifier().as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    })
}

/// Read a cached single-line value, generating and persisting it when the
/// file is missing or empty.
fn cached_value(path: &Path, generate: impl FnOnce() -> Result<String>) -> Result<String> {
    if let Ok(existing) = fs::read_to_string(path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let value = generate()?;
    fs::write(path, &value)?;
    Ok(value)
}

/// Most stable machine identifier available.
fn machine_identifier() -> String {
    if let Ok(Some(mac)) = mac_address::get_mac_address() {
        return mac.to_string();
    }

    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }

    // Not stable across runs, but still anonymous.
    Uuid::new_v4().to_string()
}
