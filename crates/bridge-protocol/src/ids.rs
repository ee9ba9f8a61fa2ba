//! Time-ordered message id minting.
//!
//! Ids are 24 hex characters: six bytes of unix-millisecond timestamp
//! followed by six random bytes. Lexicographic comparison of two ids
//! therefore reflects their creation order, and ids are unique per
//! connection with overwhelming probability.

use rand::RngCore;

const TIMESTAMP_BYTES: usize = 6;
const RANDOM_BYTES: usize = 6;

/// Mints a new ascending id.
pub fn ascending() -> String {
    let now = chrono::Utc::now().timestamp_millis();

    let mut bytes = [0u8; TIMESTAMP_BYTES + RANDOM_BYTES];
    for (i, byte) in bytes.iter_mut().take(TIMESTAMP_BYTES).enumerate() {
        *byte = (now >> (40 - 8 * i as i64)) as u8;
    }
    rand::thread_rng().fill_bytes(&mut bytes[TIMESTAMP_BYTES..]);

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::ascending;

    #[test]
    fn ids_are_24_hex_chars() {
        let id = ascending();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let first = ascending();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = ascending();
        assert!(first < second);
    }

    #[test]
    fn ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(ascending()));
        }
    }
}
