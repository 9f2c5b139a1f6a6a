//! API key generation, persistence, and bearer-token verification.
//!
//! The key is created on first run (64 hex chars from the OS CSPRNG),
//! persisted with owner-only permissions, and compared in constant time.

use std::path::Path;

use rand::RngCore;
use tracing::info;

use iris_types::IrisError;

/// Key length in bytes before hex encoding (256-bit).
const KEY_BYTES: usize = 32;

/// Generate a fresh opaque API key (64 hex characters).
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Load the persisted key, creating one on first run.
///
/// The secrets directory and key file are created with mode 700/600.
pub fn load_or_create_key(path: &Path) -> Result<String, IrisError> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let existing = existing.trim().to_string();
        if existing.len() >= 32 {
            return Ok(existing);
        }
    }

    let key = generate_api_key();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        set_mode(parent, 0o700);
    }
    std::fs::write(path, &key)?;
    set_mode(path, 0o600);
    info!(path = %path.display(), "generated new api key");
    Ok(key)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

/// Constant-time byte comparison to prevent timing side channels.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (&x, &y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Check a raw `Authorization` header value against the expected key.
pub fn check_bearer(header: Option<&str>, api_key: &str) -> bool {
    let Some(header) = header else {
        return false;
    };
    let expected = format!("Bearer {api_key}");
    constant_time_eq(header.as_bytes(), expected.as_bytes())
}
