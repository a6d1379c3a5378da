//! Socket-name identities.
//!
//! Private sockets are named with 512 bits of OS entropy so that a name can
//! never be guessed by another local user. Abstract-namespace sockets use a
//! hex rendering; filesystem sockets use base64 with the characters that
//! are awkward in paths stripped.

use std::fmt::Write as _;

use rand::RngCore;
use rand::rngs::OsRng;

/// Maximum length of a `sockaddr_un` path on the supported platforms,
/// including the trailing NUL.
pub const UNIX_PATH_MAX: usize = 108;

/// Bytes of entropy behind every generated identity.
const IDENTITY_ENTROPY_BYTES: usize = 64;

/// Generates a lowercase hex identity truncated to `len` characters.
#[must_use]
pub fn generate_hex_id(len: usize) -> String {
    let mut raw = [0u8; IDENTITY_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut raw);
    let mut id = String::with_capacity(raw.len() * 2);
    for byte in raw {
        let _ = write!(id, "{byte:02x}");
    }
    id.truncate(len);
    id
}

/// Generates a base64 identity with `+`, `/` and padding stripped, leaving
/// only characters that are safe inside a filesystem path.
#[must_use]
pub fn generate_base64_id() -> String {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;

    let mut raw = [0u8; IDENTITY_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut raw);
    STANDARD
        .encode(raw)
        .chars()
        .filter(|c| !matches!(c, '+' | '/' | '='))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_id_length_and_alphabet() {
        let id = generate_hex_id(UNIX_PATH_MAX - 2);
        assert_eq!(id.len(), UNIX_PATH_MAX - 2);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hex_id_truncates() {
        assert_eq!(generate_hex_id(10).len(), 10);
    }

    #[test]
    fn base64_id_is_path_safe() {
        let id = generate_base64_id();
        assert!(!id.is_empty());
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn ids_do_not_collide() {
        let a = generate_hex_id(64);
        let b = generate_hex_id(64);
        assert_ne!(a, b);
    }
}
